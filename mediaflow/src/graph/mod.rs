//! Stage graph: stages, typed ports and the links between them.
//!
//! A [`Graph`] exclusively owns its stages and ports. Links are made either
//! eagerly at construction time ([`Graph::add_link`], [`Graph::link_many`]) or
//! lazily when a stage announces a port at runtime ([`Graph::register_lazy_link`]).
//!
//! Port link state and per-stage lifecycle bookkeeping live behind a single
//! lock, so a link decision can never interleave with a stage being flushed
//! for teardown.

mod lazy;
mod order;
mod port;

pub use lazy::{LazyLink, LazyLinkState, PadNegotiation, PadObserver};
pub use port::{Link, Port, PortId, StageId};

use crate::caps::{Capability, CapabilitySet};
use crate::core::{PadDirection, PadPresence, StageKind, State};
use crate::errors::{ConstructionError, FlowError, LinkError};
use crate::stages::{PortTemplate, Stage};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A stage as owned by the graph.
pub(crate) struct StageNode {
    pub(crate) name: String,
    pub(crate) kind: StageKind,
    pub(crate) behaviour: Arc<dyn Stage>,
    templates: Vec<PortTemplate>,
    observers: Vec<Arc<dyn PadObserver>>,
    announce_lock: Mutex<()>,
}

#[derive(Default)]
struct Topology {
    ports: Vec<Option<Port>>,
    stage_ports: Vec<Vec<PortId>>,
    links: Vec<Link>,
    states: Vec<State>,
    flushing: Vec<bool>,
    errored: Vec<bool>,
}

impl Topology {
    fn port(&self, id: PortId) -> Result<&Port, LinkError> {
        self.ports
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| LinkError::PortUnavailable(id.to_string()))
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut Port, LinkError> {
        self.ports
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| LinkError::PortUnavailable(id.to_string()))
    }

    fn find(&self, stage: StageId, name: &str) -> Option<PortId> {
        self.stage_ports.get(stage.0)?.iter().copied().find(|id| {
            self.ports
                .get(id.0)
                .and_then(Option::as_ref)
                .is_some_and(|p| p.name == name)
        })
    }

    fn insert(&mut self, mut port: Port) -> PortId {
        let id = PortId(self.ports.len());
        port.id = id;
        self.stage_ports[port.stage.0].push(id);
        self.ports.push(Some(port));
        id
    }
}

/// Where a buffer pushed on an output port goes.
pub(crate) struct Route {
    pub(crate) port: PortId,
    pub(crate) peer_stage: StageId,
    pub(crate) peer_port: String,
    pub(crate) negotiated: bool,
}

/// An ordered collection of stages plus the links between their ports.
pub struct Graph {
    name: String,
    nodes: Vec<StageNode>,
    topology: Mutex<Topology>,
    lazy_links: Vec<Arc<LazyLink>>,
    eager_failures: Mutex<Vec<ConstructionError>>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("stages", &names)
            .field("links", &self.link_count())
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            topology: Mutex::new(Topology::default()),
            lazy_links: Vec::new(),
            eager_failures: Mutex::new(Vec::new()),
        }
    }

    /// Graph (and pipeline) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a stage and creates its always-present ports.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::DuplicateStage`] if the name is taken.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        behaviour: Arc<dyn Stage>,
    ) -> Result<StageId, ConstructionError> {
        let name = name.into();
        if self.stage_id(&name).is_some() {
            return Err(ConstructionError::DuplicateStage(name));
        }

        let id = StageId(self.nodes.len());
        let templates = behaviour.templates();
        let kind = behaviour.kind();

        let topology = self.topology.get_mut();
        topology.stage_ports.push(Vec::new());
        topology.states.push(State::Null);
        topology.flushing.push(false);
        topology.errored.push(false);
        for template in templates.iter().filter(|t| t.is_always()) {
            topology.insert(Port {
                id: PortId(0),
                stage: id,
                name: template.name.clone(),
                direction: template.direction,
                presence: PadPresence::Always,
                caps: template.caps.clone(),
                current: None,
                peer: None,
            });
        }

        debug!(graph = %self.name, stage = %name, factory = behaviour.factory_name(), %kind, "added stage");
        self.nodes.push(StageNode {
            name,
            kind,
            behaviour,
            templates,
            observers: Vec::new(),
            announce_lock: Mutex::new(()),
        });
        Ok(id)
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.nodes.iter().position(|n| n.name == name).map(StageId)
    }

    /// Name of a stage.
    #[must_use]
    pub fn stage_name(&self, id: StageId) -> Option<&str> {
        self.nodes.get(id.0).map(|n| n.name.as_str())
    }

    /// Kind of a stage.
    #[must_use]
    pub fn stage_kind(&self, id: StageId) -> Option<StageKind> {
        self.nodes.get(id.0).map(|n| n.kind)
    }

    /// All stage ids in insertion order.
    pub fn stage_ids(&self) -> impl Iterator<Item = StageId> + '_ {
        (0..self.nodes.len()).map(StageId)
    }

    pub(crate) fn node(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.get(id.0)
    }

    fn require(&self, id: StageId) -> Result<&StageNode, ConstructionError> {
        self.node(id)
            .ok_or_else(|| ConstructionError::UnknownStage(id.to_string()))
    }

    /// Sets a configuration property on a stage.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::InvalidProperty`] if the stage rejects it.
    pub fn set_property(
        &self,
        stage: StageId,
        key: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), ConstructionError> {
        let node = self.require(stage)?;
        let value = value.into();
        node.behaviour
            .set_property(key, &value)
            .map_err(|err| ConstructionError::InvalidProperty {
                stage: node.name.clone(),
                property: key.to_string(),
                reason: err.to_string(),
            })?;
        debug!(stage = %node.name, property = key, %value, "set property");
        Ok(())
    }

    /// Looks up a port by stage and name.
    #[must_use]
    pub fn port_id(&self, stage: StageId, name: &str) -> Option<PortId> {
        self.topology.lock().find(stage, name)
    }

    /// Snapshot of a port.
    #[must_use]
    pub fn port(&self, id: PortId) -> Option<Port> {
        self.topology.lock().port(id).ok().cloned()
    }

    /// Snapshot of a stage's ports in creation order.
    #[must_use]
    pub fn ports(&self, stage: StageId) -> Vec<Port> {
        let topology = self.topology.lock();
        topology
            .stage_ports
            .get(stage.0)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| topology.port(*id).ok().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of all links.
    #[must_use]
    pub fn links(&self) -> Vec<Link> {
        self.topology.lock().links.clone()
    }

    /// Number of links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.topology.lock().links.len()
    }

    fn port_caps(&self, port: &Port) -> CapabilitySet {
        let narrowed = self
            .node(port.stage)
            .and_then(|n| n.behaviour.port_caps(&port.name));
        match narrowed {
            Some(set) => port.caps.intersect(&set),
            None => port.caps.clone(),
        }
    }

    fn offered_locked(&self, port: &Port) -> CapabilitySet {
        match &port.current {
            Some(current) => CapabilitySet::single(current.clone()),
            None => self.port_caps(port),
        }
    }

    /// The producer's best-known caps for an output port.
    ///
    /// Once negotiated this is the fixed caps; before that it may leave
    /// attributes such as dimensions unconstrained.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PortUnavailable`] or [`LinkError::WrongDirection`].
    pub fn offer(&self, port: PortId) -> Result<CapabilitySet, LinkError> {
        let topology = self.topology.lock();
        let port = topology.port(port)?;
        if port.direction != PadDirection::Output {
            return Err(LinkError::WrongDirection(port.name.clone()));
        }
        Ok(self.offered_locked(port))
    }

    /// The caps an input port accepts.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PortUnavailable`] if the port does not exist.
    pub fn accepted_caps(&self, port: PortId) -> Result<CapabilitySet, LinkError> {
        let topology = self.topology.lock();
        let port = topology.port(port)?;
        Ok(self.port_caps(port))
    }

    /// Returns true if an input port can take `caps`.
    #[must_use]
    pub fn accepts(&self, port: PortId, caps: &Capability) -> bool {
        let topology = self.topology.lock();
        topology
            .port(port)
            .is_ok_and(|p| p.direction == PadDirection::Input && self.port_caps(p).accepts(caps))
    }

    /// Links an output port to an input port.
    ///
    /// Fails with [`LinkError::AlreadyLinked`] (callers treat it as
    /// satisfied) if either end already has a peer, without changing anything.
    ///
    /// # Errors
    ///
    /// See [`LinkError`].
    pub fn link_ports(&self, producer: PortId, consumer: PortId) -> Result<(), LinkError> {
        let mut topology = self.topology.lock();
        let out = topology.port(producer)?;
        let input = topology.port(consumer)?;

        if out.direction != PadDirection::Output {
            return Err(LinkError::WrongDirection(out.name.clone()));
        }
        if input.direction != PadDirection::Input {
            return Err(LinkError::WrongDirection(input.name.clone()));
        }
        if input.is_linked() {
            return Err(LinkError::AlreadyLinked(self.qualified(input)));
        }
        if out.is_linked() {
            return Err(LinkError::AlreadyLinked(self.qualified(out)));
        }
        for stage in [out.stage, input.stage] {
            if topology.flushing.get(stage.0).copied().unwrap_or(false) {
                return Err(LinkError::Flushing(
                    self.stage_name(stage).unwrap_or_default().to_string(),
                ));
            }
        }

        let offered = self.offered_locked(out);
        let accepted = self.port_caps(input);
        if !offered.intersects(&accepted) {
            return Err(LinkError::TypeMismatch {
                offered: offered.to_string(),
                accepted: accepted.to_string(),
            });
        }

        let (out_name, in_name) = (self.qualified(out), self.qualified(input));
        topology.port_mut(producer)?.peer = Some(consumer);
        topology.port_mut(consumer)?.peer = Some(producer);
        topology.links.push(Link { producer, consumer });
        debug!(graph = %self.name, producer = %out_name, consumer = %in_name, "linked");
        Ok(())
    }

    fn qualified(&self, port: &Port) -> String {
        format!("{}.{}", self.stage_name(port.stage).unwrap_or("?"), port.name)
    }

    /// Eagerly links two ports at construction time.
    ///
    /// Failures other than [`LinkError::AlreadyLinked`] are recorded and make
    /// the graph refuse to leave NULL.
    ///
    /// # Errors
    ///
    /// See [`LinkError`].
    pub fn add_link(&self, producer: PortId, consumer: PortId) -> Result<(), LinkError> {
        match self.link_ports(producer, consumer) {
            Err(err) if !err.is_already_linked() => {
                let stage_of = |id| {
                    self.port(id)
                        .and_then(|p| self.stage_name(p.stage).map(str::to_string))
                        .unwrap_or_else(|| id.to_string())
                };
                self.eager_failures.lock().push(ConstructionError::EagerLink {
                    producer: stage_of(producer),
                    consumer: stage_of(consumer),
                    source: err.clone(),
                });
                Err(err)
            }
            other => other,
        }
    }

    /// Links the first unlinked output of `producer` to the first unlinked
    /// input of `consumer`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::EagerLink`] and records the failure.
    pub fn link_stages(&self, producer: StageId, consumer: StageId) -> Result<(), ConstructionError> {
        let producer_node = self.require(producer)?;
        let consumer_node = self.require(consumer)?;
        let eager = |source| ConstructionError::EagerLink {
            producer: producer_node.name.clone(),
            consumer: consumer_node.name.clone(),
            source,
        };

        let out = self.first_unlinked(producer, PadDirection::Output);
        let input = self.first_unlinked(consumer, PadDirection::Input);
        let result = match (out, input) {
            (Some(out), Some(input)) => self.link_ports(out, input).map_err(eager),
            (None, _) => Err(eager(LinkError::PortUnavailable(format!(
                "{}: no unlinked output",
                producer_node.name
            )))),
            (_, None) => Err(eager(LinkError::PortUnavailable(format!(
                "{}: no unlinked input",
                consumer_node.name
            )))),
        };
        if let Err(err) = &result {
            self.eager_failures.lock().push(err.clone());
        }
        result
    }

    /// Links a chain of stages pairwise.
    ///
    /// # Errors
    ///
    /// Stops at the first failing pair.
    pub fn link_many(&self, stages: &[StageId]) -> Result<(), ConstructionError> {
        for pair in stages.windows(2) {
            self.link_stages(pair[0], pair[1])?;
        }
        Ok(())
    }

    fn first_unlinked(&self, stage: StageId, direction: PadDirection) -> Option<PortId> {
        let topology = self.topology.lock();
        topology.stage_ports.get(stage.0)?.iter().copied().find(|id| {
            topology
                .port(*id)
                .is_ok_and(|p| p.direction == direction && !p.is_linked())
        })
    }

    /// First input port of `stage` without a peer.
    #[must_use]
    pub fn first_unlinked_input(&self, stage: StageId) -> Option<PortId> {
        self.first_unlinked(stage, PadDirection::Input)
    }

    /// Registers a lazy link from `producer`'s announced ports to the first
    /// unlinked input of `consumer`, accepting media types with the prefix
    /// `accepted_family`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::UnknownStage`] for foreign ids.
    pub fn register_lazy_link(
        &mut self,
        producer: StageId,
        consumer: StageId,
        accepted_family: impl Into<String>,
    ) -> Result<Arc<LazyLink>, ConstructionError> {
        self.require(consumer)?;
        let link = Arc::new(LazyLink::new(producer, consumer, accepted_family));
        self.add_pad_observer(producer, link.clone())?;
        debug!(
            graph = %self.name,
            producer = self.stage_name(producer).unwrap_or_default(),
            consumer = self.stage_name(consumer).unwrap_or_default(),
            family = link.accepted_family(),
            "registered lazy link"
        );
        self.lazy_links.push(Arc::clone(&link));
        Ok(link)
    }

    /// Registers an arbitrary observer for ports announced by `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::UnknownStage`] for foreign ids.
    pub fn add_pad_observer(
        &mut self,
        stage: StageId,
        observer: Arc<dyn PadObserver>,
    ) -> Result<(), ConstructionError> {
        let node = self
            .nodes
            .get_mut(stage.0)
            .ok_or_else(|| ConstructionError::UnknownStage(stage.to_string()))?;
        node.observers.push(observer);
        Ok(())
    }

    /// Registered lazy links.
    #[must_use]
    pub fn lazy_links(&self) -> &[Arc<LazyLink>] {
        &self.lazy_links
    }

    /// `(producer, consumer, state)` for every lazy link.
    #[must_use]
    pub fn lazy_link_states(&self) -> Vec<(String, String, LazyLinkState)> {
        self.lazy_links
            .iter()
            .map(|l| {
                (
                    self.stage_name(l.producer()).unwrap_or_default().to_string(),
                    self.stage_name(l.consumer()).unwrap_or_default().to_string(),
                    l.state(),
                )
            })
            .collect()
    }

    /// Creates a runtime-announced output port and runs the stage's observers.
    ///
    /// Announcements from one stage are serialized: each one is fully
    /// negotiated before the next is looked at.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::DuplicatePort`] if the name is taken, or
    /// [`LinkError::PortUnavailable`] if no template allows it.
    pub fn announce_port(
        &self,
        stage: StageId,
        name: &str,
        caps: Capability,
    ) -> Result<(PortId, Vec<PadNegotiation>), LinkError> {
        self.announce_port_while(stage, name, caps, || true)
    }

    /// Like [`Graph::announce_port`], but only while `live` holds.
    ///
    /// `live` is evaluated under the stage's announcement lock, which
    /// [`Graph::remove_announced_ports`] also takes; a refused announcement
    /// returns [`LinkError::Flushing`].
    pub(crate) fn announce_port_while(
        &self,
        stage: StageId,
        name: &str,
        caps: Capability,
        live: impl FnOnce() -> bool,
    ) -> Result<(PortId, Vec<PadNegotiation>), LinkError> {
        let node = self
            .node(stage)
            .ok_or_else(|| LinkError::PortUnavailable(stage.to_string()))?;
        let _serial = node.announce_lock.lock();
        if !live() {
            return Err(LinkError::Flushing(node.name.clone()));
        }

        if !node
            .templates
            .iter()
            .any(|t| t.presence == PadPresence::Sometimes && t.allows(name, &caps))
        {
            return Err(LinkError::PortUnavailable(format!("{}.{name}", node.name)));
        }

        let id = {
            let mut topology = self.topology.lock();
            if topology.find(stage, name).is_some() {
                return Err(LinkError::DuplicatePort(format!("{}.{name}", node.name)));
            }
            topology.insert(Port {
                id: PortId(0),
                stage,
                name: name.to_string(),
                direction: PadDirection::Output,
                presence: PadPresence::Sometimes,
                caps: CapabilitySet::single(caps.clone()),
                current: None,
                peer: None,
            })
        };

        let outcomes = node
            .observers
            .iter()
            .map(|observer| observer.pad_added(self, id, &caps))
            .collect();
        Ok((id, outcomes))
    }

    /// Removes every announced port of a stage, unlinking their peers.
    pub(crate) fn remove_announced_ports(&self, stage: StageId) {
        let Some(node) = self.node(stage) else {
            return;
        };
        let _serial = node.announce_lock.lock();
        let removed = {
            let mut topology = self.topology.lock();
            let Some(ids) = topology.stage_ports.get(stage.0).cloned() else {
                return;
            };
            let mut removed = 0;
            for id in ids {
                let announced = topology
                    .port(id)
                    .is_ok_and(|p| p.presence == PadPresence::Sometimes);
                if !announced {
                    continue;
                }
                if let Some(Some(port)) = topology.ports.get_mut(id.0).map(Option::take) {
                    if let Some(peer) = port.peer {
                        if let Ok(peer) = topology.port_mut(peer) {
                            peer.peer = None;
                            peer.current = None;
                        }
                    }
                    topology.links.retain(|l| l.producer != id && l.consumer != id);
                    topology.stage_ports[stage.0].retain(|p| *p != id);
                    removed += 1;
                }
            }
            removed
        };

        if removed > 0 {
            debug!(stage = %node.name, removed, "removed announced ports");
            for observer in &node.observers {
                observer.pads_removed();
            }
        }
    }

    /// Failed eager links recorded so far.
    #[must_use]
    pub fn eager_failures(&self) -> Vec<ConstructionError> {
        self.eager_failures.lock().clone()
    }

    /// Returns true if every eager link succeeded.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.eager_failures.lock().is_empty()
    }

    /// Stages ordered producers first.
    ///
    /// Lazy links count as edges, so a source with announced ports comes
    /// before the consumer it will feed.
    #[must_use]
    pub fn topological_order(&self) -> Vec<StageId> {
        let mut edges: Vec<(StageId, StageId)> = {
            let topology = self.topology.lock();
            topology
                .links
                .iter()
                .filter_map(|l| {
                    let out = topology.port(l.producer).ok()?;
                    let input = topology.port(l.consumer).ok()?;
                    Some((out.stage, input.stage))
                })
                .collect()
        };
        edges.extend(self.lazy_links.iter().map(|l| (l.producer(), l.consumer())));
        order::topological_sort(self.nodes.len(), &edges)
    }

    // Runtime bookkeeping used by the pipeline and stage contexts.

    pub(crate) fn state(&self, stage: StageId) -> State {
        self.topology
            .lock()
            .states
            .get(stage.0)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn set_state(&self, stage: StageId, state: State) {
        if let Some(slot) = self.topology.lock().states.get_mut(stage.0) {
            *slot = state;
        }
    }

    pub(crate) fn max_state(&self) -> State {
        self.topology
            .lock()
            .states
            .iter()
            .copied()
            .max()
            .unwrap_or_default()
    }

    pub(crate) fn set_flushing(&self, stage: StageId, flushing: bool) {
        let mut topology = self.topology.lock();
        if let Some(slot) = topology.flushing.get_mut(stage.0) {
            *slot = flushing;
        }
        if flushing {
            // negotiated caps do not survive a flush
            let ids = topology.stage_ports.get(stage.0).cloned().unwrap_or_default();
            for id in ids {
                if let Ok(port) = topology.port_mut(id) {
                    port.current = None;
                }
            }
        }
    }

    pub(crate) fn is_flushing(&self, stage: StageId) -> bool {
        self.topology
            .lock()
            .flushing
            .get(stage.0)
            .copied()
            .unwrap_or(false)
    }

    /// Marks that a stage posted an error. Returns the previous value.
    pub(crate) fn mark_errored(&self, stage: StageId, errored: bool) -> bool {
        self.topology
            .lock()
            .errored
            .get_mut(stage.0)
            .map_or(false, |slot| std::mem::replace(slot, errored))
    }

    pub(crate) fn output_ports(&self, stage: StageId) -> Vec<String> {
        self.ports(stage)
            .into_iter()
            .filter(|p| p.direction == PadDirection::Output)
            .map(|p| p.name)
            .collect()
    }

    /// Resolves where data pushed on `stage.port` goes.
    pub(crate) fn route(&self, stage: StageId, port: &str) -> Result<Route, FlowError> {
        let topology = self.topology.lock();
        if topology.flushing.get(stage.0).copied().unwrap_or(false) {
            return Err(FlowError::Flushing);
        }
        let id = topology.find(stage, port).ok_or(FlowError::NotLinked)?;
        let out = topology.port(id).map_err(|_| FlowError::NotLinked)?;
        let peer = out.peer.ok_or(FlowError::NotLinked)?;
        let peer_port = topology.port(peer).map_err(|_| FlowError::NotLinked)?;
        if topology.flushing.get(peer_port.stage.0).copied().unwrap_or(false) {
            return Err(FlowError::Flushing);
        }
        Ok(Route {
            port: id,
            peer_stage: peer_port.stage,
            peer_port: peer_port.name.clone(),
            negotiated: out.current.is_some(),
        })
    }

    /// Picks fixed caps for an unnegotiated output that its peer accepts.
    pub(crate) fn default_caps(&self, port: PortId) -> Result<Capability, FlowError> {
        let topology = self.topology.lock();
        let out = topology.port(port).map_err(|_| FlowError::NotLinked)?;
        let peer = out.peer.ok_or(FlowError::NotLinked)?;
        let peer = topology.port(peer).map_err(|_| FlowError::NotLinked)?;
        let common = self.offered_locked(out).intersect(&self.port_caps(peer));
        common.first().map(Capability::fixate).ok_or_else(|| {
            FlowError::NotNegotiated(format!(
                "no common caps between {} and {}",
                self.qualified(out),
                self.qualified(peer)
            ))
        })
    }

    /// Fixes caps on an output port and its peer.
    pub(crate) fn fix_caps(&self, port: PortId, caps: &Capability) -> Result<Route, FlowError> {
        let mut topology = self.topology.lock();
        let out = topology.port(port).map_err(|_| FlowError::NotLinked)?;
        let peer_id = out.peer.ok_or(FlowError::NotLinked)?;
        let peer = topology.port(peer_id).map_err(|_| FlowError::NotLinked)?;
        if !self.port_caps(out).accepts(caps) || !self.port_caps(peer).accepts(caps) {
            return Err(FlowError::NotNegotiated(format!(
                "{caps} not accepted by {}",
                self.qualified(peer)
            )));
        }
        let route = Route {
            port,
            peer_stage: peer.stage,
            peer_port: peer.name.clone(),
            negotiated: true,
        };
        topology.port_mut(port).map_err(|_| FlowError::NotLinked)?.current = Some(caps.clone());
        topology.port_mut(peer_id).map_err(|_| FlowError::NotLinked)?.current = Some(caps.clone());
        Ok(route)
    }

    /// Caps accepted by the peer of an output port.
    pub(crate) fn peer_caps(&self, stage: StageId, port: &str) -> Option<CapabilitySet> {
        let topology = self.topology.lock();
        let id = topology.find(stage, port)?;
        let peer = topology.port(id).ok()?.peer?;
        let peer = topology.port(peer).ok()?;
        Some(self.port_caps(peer))
    }

    /// Negotiated caps of a port.
    pub(crate) fn current_caps(&self, stage: StageId, port: &str) -> Option<Capability> {
        let topology = self.topology.lock();
        let id = topology.find(stage, port)?;
        topology.port(id).ok()?.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{RAW_AUDIO, RAW_VIDEO, RTP};
    use crate::testing::{RecordingSink, ScriptedSource};
    use pretty_assertions::assert_eq;

    fn raw_video() -> Capability {
        Capability::new(RAW_VIDEO)
            .with_int("width", 640)
            .with_int("height", 480)
    }

    fn source_and_sink(sink_caps: Capability) -> (Graph, StageId, StageId) {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("src", Arc::new(ScriptedSource::new().with_output(raw_video())))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(sink_caps)))
            .unwrap();
        (graph, src, sink)
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut graph = Graph::new("test");
        graph.add_stage("a", Arc::new(RecordingSink::new())).unwrap();
        let err = graph.add_stage("a", Arc::new(RecordingSink::new())).unwrap_err();
        assert!(matches!(err, ConstructionError::DuplicateStage(name) if name == "a"));
    }

    #[test]
    fn test_eager_link_success() {
        let (graph, src, sink) = source_and_sink(Capability::new(RAW_VIDEO));
        graph.link_stages(src, sink).unwrap();

        assert_eq!(graph.link_count(), 1);
        assert!(graph.is_runnable());
        let input = graph.port_id(sink, "sink").unwrap();
        assert!(graph.port(input).unwrap().is_linked());
    }

    #[test]
    fn test_relink_is_idempotent() {
        let (graph, src, sink) = source_and_sink(Capability::new(RAW_VIDEO));
        let out = graph.port_id(src, "src").unwrap();
        let input = graph.port_id(sink, "sink").unwrap();
        graph.add_link(out, input).unwrap();
        let before = graph.links();

        for _ in 0..3 {
            let err = graph.add_link(out, input).unwrap_err();
            assert!(err.is_already_linked());
        }
        assert_eq!(graph.links(), before);
        assert!(graph.is_runnable());
    }

    #[test]
    fn test_type_mismatch_is_recorded() {
        let (graph, src, sink) = source_and_sink(Capability::new(RTP));
        let err = graph.link_stages(src, sink).unwrap_err();
        assert!(matches!(
            err,
            ConstructionError::EagerLink { source: LinkError::TypeMismatch { .. }, .. }
        ));
        assert_eq!(graph.link_count(), 0);
        assert!(!graph.is_runnable());
    }

    #[test]
    fn test_accepts_matches_link_decision() {
        let (graph, src, sink) = source_and_sink(Capability::new(RAW_VIDEO).with_range("width", 1, 1024));
        let out = graph.port_id(src, "src").unwrap();
        let input = graph.port_id(sink, "sink").unwrap();
        let offered = graph.offer(out).unwrap();
        let caps = offered.first().unwrap().clone();

        assert!(graph.accepts(input, &caps));
        graph.link_ports(out, input).unwrap();
    }

    #[test]
    fn test_wrong_direction_and_missing_ports() {
        let (graph, src, sink) = source_and_sink(Capability::new(RAW_VIDEO));
        let out = graph.port_id(src, "src").unwrap();
        let input = graph.port_id(sink, "sink").unwrap();

        assert!(matches!(graph.link_ports(input, out), Err(LinkError::WrongDirection(_))));
        assert!(matches!(
            graph.link_ports(out, PortId(99)),
            Err(LinkError::PortUnavailable(_))
        ));
        assert!(graph.port_id(sink, "nope").is_none());
    }

    #[test]
    fn test_flushing_stage_refuses_links() {
        let (graph, src, sink) = source_and_sink(Capability::new(RAW_VIDEO));
        graph.set_flushing(sink, true);
        let out = graph.port_id(src, "src").unwrap();
        let input = graph.port_id(sink, "sink").unwrap();
        assert!(matches!(graph.link_ports(out, input), Err(LinkError::Flushing(_))));
    }

    #[test]
    fn test_lazy_link_video_then_audio() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO))))
            .unwrap();
        let lazy = graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();
        assert_eq!(lazy.state(), LazyLinkState::NoPadsYet);

        let (_, video) = graph.announce_port(src, "src_0", raw_video()).unwrap();
        assert!(video[0].is_linked());
        assert_eq!(lazy.state(), LazyLinkState::Linked);

        let audio_caps = Capability::new(RAW_AUDIO).with_int("rate", 48000);
        let (_, audio) = graph.announce_port(src, "src_1", audio_caps).unwrap();
        assert_eq!(
            audio[0],
            PadNegotiation::Rejected {
                media_type: RAW_AUDIO.to_string()
            }
        );
        assert_eq!(lazy.state(), LazyLinkState::Linked);
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn test_lazy_link_audio_only_is_rejected() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO))))
            .unwrap();
        let lazy = graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();

        let (_, outcomes) = graph
            .announce_port(src, "src_0", Capability::new(RAW_AUDIO))
            .unwrap();
        assert!(matches!(outcomes[0], PadNegotiation::Rejected { .. }));
        assert_eq!(lazy.state(), LazyLinkState::Rejected);
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn test_redundant_video_pad_is_already_linked() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO))))
            .unwrap();
        graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();

        graph.announce_port(src, "src_0", raw_video()).unwrap();
        let (_, second) = graph.announce_port(src, "src_1", raw_video()).unwrap();
        assert_eq!(second[0], PadNegotiation::AlreadyLinked);
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn test_lazy_link_failure_after_type_match() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        // in the family, but the sink only takes 320 pixel wide frames
        let sink = graph
            .add_stage(
                "sink",
                Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO).with_int("width", 320))),
            )
            .unwrap();
        let lazy = graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();

        let (_, outcomes) = graph.announce_port(src, "src_0", raw_video()).unwrap();
        assert!(matches!(outcomes[0], PadNegotiation::LinkFailed { .. }));
        assert_eq!(lazy.state(), LazyLinkState::LinkFailed);
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn test_announce_requires_template_and_unique_name() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        graph.announce_port(src, "src_0", raw_video()).unwrap();
        assert!(matches!(
            graph.announce_port(src, "src_0", raw_video()),
            Err(LinkError::DuplicatePort(_))
        ));
        assert!(matches!(
            graph.announce_port(src, "video", raw_video()),
            Err(LinkError::PortUnavailable(_))
        ));
    }

    #[test]
    fn test_remove_announced_ports_resets_lazy_link() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO))))
            .unwrap();
        let lazy = graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();
        graph.announce_port(src, "src_0", raw_video()).unwrap();

        graph.remove_announced_ports(src);
        assert_eq!(graph.link_count(), 0);
        assert!(graph.first_unlinked_input(sink).is_some());
        assert_eq!(lazy.state(), LazyLinkState::NoPadsYet);
    }

    #[test]
    fn test_refused_announcement_creates_no_port() {
        let mut graph = Graph::new("test");
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::accepting(Capability::new(RAW_VIDEO))))
            .unwrap();
        let lazy = graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();

        let err = graph
            .announce_port_while(src, "src_0", raw_video(), || false)
            .unwrap_err();
        assert!(matches!(err, LinkError::Flushing(_)));
        assert_eq!(graph.port_id(src, "src_0"), None);
        assert_eq!(lazy.state(), LazyLinkState::NoPadsYet);

        // the name is still free for a live announcement
        graph.announce_port(src, "src_0", raw_video()).unwrap();
        assert_eq!(lazy.state(), LazyLinkState::Linked);
    }

    #[test]
    fn test_topological_order_uses_lazy_edges() {
        let mut graph = Graph::new("test");
        let sink = graph
            .add_stage("sink", Arc::new(RecordingSink::new()))
            .unwrap();
        let src = graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_lazy_outputs()))
            .unwrap();
        graph.register_lazy_link(src, sink, RAW_VIDEO).unwrap();
        assert_eq!(graph.topological_order(), vec![src, sink]);
    }
}
