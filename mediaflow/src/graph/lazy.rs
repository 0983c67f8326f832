//! Lazy pad discovery.
//!
//! Some stages only know their output ports once they have inspected the
//! stream. Observers registered at build time are called synchronously for
//! each announced port and decide whether to link it.

use super::{Graph, PortId, StageId};
use crate::caps::Capability;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Outcome of offering one announced port to an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PadNegotiation {
    /// The port was linked to the consumer's input.
    Linked {
        /// Name of the consumer input that was linked.
        consumer_port: String,
    },
    /// The port's media type is outside the accepted family. Not an error.
    Rejected {
        /// Media type that was announced.
        media_type: String,
    },
    /// The consumer slot is already satisfied; nothing was changed.
    AlreadyLinked,
    /// The types matched but the link could not be made.
    LinkFailed {
        /// Diagnostic.
        reason: String,
    },
}

impl PadNegotiation {
    /// Returns true if a link was created.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked { .. })
    }
}

/// Progress of a lazy link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LazyLinkState {
    /// The producer has not announced anything yet.
    NoPadsYet,
    /// At least one port was announced, none decided yet.
    PadsAnnounced,
    /// A port was linked. Stays linked for the rest of the run.
    Linked,
    /// The last announced port was outside the accepted family.
    Rejected,
    /// The last matching port could not be linked.
    LinkFailed,
}

impl fmt::Display for LazyLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoPadsYet => "no-pads-yet",
            Self::PadsAnnounced => "pads-announced",
            Self::Linked => "linked",
            Self::Rejected => "rejected",
            Self::LinkFailed => "link-failed",
        };
        f.write_str(s)
    }
}

/// Observer notified when a stage announces a port.
pub trait PadObserver: Send + Sync {
    /// Called for each announced port, serialized per producing stage.
    fn pad_added(&self, graph: &Graph, port: PortId, caps: &Capability) -> PadNegotiation;

    /// Called when the producer drops its announced ports.
    fn pads_removed(&self) {}
}

/// Links announced ports of a producer to the first unlinked input of a consumer.
#[derive(Debug)]
pub struct LazyLink {
    producer: StageId,
    consumer: StageId,
    accepted_family: String,
    state: Mutex<LazyLinkState>,
}

impl LazyLink {
    /// Creates a lazy link. Register it with [`Graph::register_lazy_link`].
    #[must_use]
    pub fn new(producer: StageId, consumer: StageId, accepted_family: impl Into<String>) -> Self {
        Self {
            producer,
            consumer,
            accepted_family: accepted_family.into(),
            state: Mutex::new(LazyLinkState::NoPadsYet),
        }
    }

    /// Producing stage.
    #[must_use]
    pub fn producer(&self) -> StageId {
        self.producer
    }

    /// Consuming stage.
    #[must_use]
    pub fn consumer(&self) -> StageId {
        self.consumer
    }

    /// Media-type prefix accepted by the consumer.
    #[must_use]
    pub fn accepted_family(&self) -> &str {
        &self.accepted_family
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LazyLinkState {
        *self.state.lock()
    }

    fn settle(state: &mut LazyLinkState, next: LazyLinkState) {
        if *state != LazyLinkState::Linked {
            *state = next;
        }
    }
}

impl PadObserver for LazyLink {
    fn pad_added(&self, graph: &Graph, port: PortId, caps: &Capability) -> PadNegotiation {
        let mut state = self.state.lock();
        if *state == LazyLinkState::NoPadsYet {
            *state = LazyLinkState::PadsAnnounced;
        }

        let producer = graph.stage_name(self.producer).unwrap_or_default();
        let consumer = graph.stage_name(self.consumer).unwrap_or_default();
        let port_name = graph.port(port).map(|p| p.name).unwrap_or_default();
        let in_family = caps.is_in_family(&self.accepted_family);
        info!(
            stage = producer,
            port = %port_name,
            caps = %caps,
            "Received new pad '{port_name}' from '{producer}'"
        );

        let Some(input) = graph.first_unlinked_input(self.consumer) else {
            if in_family {
                debug!(stage = consumer, "We are already linked. Ignoring.");
                return PadNegotiation::AlreadyLinked;
            }
            // a foreign media type stays a rejection even when the slot is taken
            info!(
                stage = consumer,
                "It has type '{}' which is not {}. Ignoring.",
                caps.media_type(),
                self.accepted_family
            );
            Self::settle(&mut state, LazyLinkState::Rejected);
            return PadNegotiation::Rejected {
                media_type: caps.media_type().to_string(),
            };
        };

        if !in_family {
            info!(
                stage = consumer,
                "It has type '{}' which is not {}. Ignoring.",
                caps.media_type(),
                self.accepted_family
            );
            Self::settle(&mut state, LazyLinkState::Rejected);
            return PadNegotiation::Rejected {
                media_type: caps.media_type().to_string(),
            };
        }

        match graph.link_ports(port, input) {
            Ok(()) => {
                info!(stage = consumer, "Link succeeded (type '{}').", caps.media_type());
                *state = LazyLinkState::Linked;
                PadNegotiation::Linked {
                    consumer_port: graph.port(input).map(|p| p.name).unwrap_or_default(),
                }
            }
            Err(err) if err.is_already_linked() => {
                debug!(stage = consumer, "We are already linked. Ignoring.");
                PadNegotiation::AlreadyLinked
            }
            Err(err) => {
                warn!(
                    stage = consumer,
                    error = %err,
                    "Type is '{}' but link failed.",
                    caps.media_type()
                );
                Self::settle(&mut state, LazyLinkState::LinkFailed);
                PadNegotiation::LinkFailed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn pads_removed(&self) {
        *self.state.lock() = LazyLinkState::NoPadsYet;
    }
}
