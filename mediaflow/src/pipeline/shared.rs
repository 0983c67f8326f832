//! State shared between the pipeline handle, stage contexts and worker tasks.

use super::streaming::{Latch, ReleaseOnDrop, StreamingTask, STOP_TIMEOUT};
use crate::core::{StageKind, State, StateChange, StateChangeOutcome};
use crate::errors::FlowError;
use crate::events::{ErrorCode, ErrorDetails, Event, EventBus, EventOrigin};
use crate::graph::{Graph, StageId};
use crate::stages::StageContext;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// A stage transition that answered `Async` and has not completed yet.
#[derive(Debug)]
struct AsyncSlot {
    stage: StageId,
    change: StateChange,
    generation: u64,
    returned: bool,
    completed: Option<StateChangeOutcome>,
}

#[derive(Debug)]
struct Control {
    current: State,
    target: State,
    generation: u64,
    slot: Option<AsyncSlot>,
    failure: Option<String>,
    reached_playing: bool,
    eos_sinks: HashSet<StageId>,
    eos_posted: bool,
}

enum Step {
    Done,
    Pending,
    Failed(String),
}

pub(crate) struct PipelineShared {
    pub(crate) name: String,
    pub(crate) run_id: Uuid,
    pub(crate) graph: Graph,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) handle: Handle,
    order: Vec<StageId>,
    sinks: Vec<StageId>,
    control: Mutex<Control>,
    settled: Condvar,
    transition: Mutex<()>,
    streaming: Mutex<HashMap<StageId, StreamingTask>>,
}

impl PipelineShared {
    pub(crate) fn new(graph: Graph, bus: Arc<EventBus>, handle: Handle) -> Self {
        let order = graph.topological_order();
        let sinks = graph
            .stage_ids()
            .filter(|id| graph.stage_kind(*id) == Some(StageKind::Sink))
            .collect();
        Self {
            name: graph.name().to_string(),
            run_id: Uuid::new_v4(),
            graph,
            bus,
            handle,
            order,
            sinks,
            control: Mutex::new(Control {
                current: State::Null,
                target: State::Null,
                generation: 0,
                slot: None,
                failure: None,
                reached_playing: false,
                eos_sinks: HashSet::new(),
                eos_posted: false,
            }),
            settled: Condvar::new(),
            transition: Mutex::new(()),
            streaming: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn current_state(&self) -> State {
        self.control.lock().current
    }

    pub(crate) fn target_state(&self) -> State {
        self.control.lock().target
    }

    pub(crate) fn last_failure(&self) -> Option<String> {
        self.control.lock().failure.clone()
    }

    fn stage_name(&self, stage: StageId) -> &str {
        self.graph.stage_name(stage).unwrap_or("?")
    }

    /// Requests a new target state and walks towards it.
    pub(crate) fn request_state(self: &Arc<Self>, target: State) -> StateChangeOutcome {
        // bump the generation before queueing on the transition lock so an
        // in-flight walk notices it is stale at its next step
        let generation = {
            let mut control = self.control.lock();
            control.generation += 1;
            control.target = target;
            control.slot = None;
            control.failure = None;
            control.generation
        };
        info!(pipeline = %self.name, target = %target, "Setting pipeline to {target}");

        let _serial = self.transition.lock();
        if self.control.lock().generation != generation {
            return StateChangeOutcome::Async;
        }
        self.drive(generation)
    }

    fn drive(self: &Arc<Self>, generation: u64) -> StateChangeOutcome {
        loop {
            let (current, target) = {
                let control = self.control.lock();
                if control.generation != generation {
                    return StateChangeOutcome::Async;
                }
                (control.current, control.target)
            };

            // stages left above the pipeline by an aborted upward walk come down too
            let highest = self.graph.max_state();
            let from = if target < highest && highest > current {
                highest
            } else {
                current
            };
            let Some(next) = from.step_towards(target) else {
                self.settle();
                return StateChangeOutcome::Success;
            };
            let Some(change) = StateChange::between(from, next) else {
                return self.fail(generation, format!("no transition from {from} to {next}"));
            };

            if change.is_upward() && !self.graph.is_runnable() {
                let reason = self
                    .graph
                    .eager_failures()
                    .first()
                    .map_or_else(|| "eager links failed".to_string(), ToString::to_string);
                error!(pipeline = %self.name, %reason, "refusing to leave NULL with unlinked stages");
                return self.fail(generation, reason);
            }

            match self.apply(change, generation) {
                Step::Done => self.step_done(change, target),
                Step::Pending => {
                    debug!(pipeline = %self.name, %change, "state change continues asynchronously");
                    return StateChangeOutcome::Async;
                }
                Step::Failed(reason) => return self.fail(generation, reason),
            }
        }
    }

    fn fail(&self, generation: u64, reason: String) -> StateChangeOutcome {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.failure = Some(reason);
        }
        drop(control);
        self.settled.notify_all();
        StateChangeOutcome::Failure
    }

    fn settle(&self) {
        self.settled.notify_all();
    }

    fn apply(self: &Arc<Self>, change: StateChange, generation: u64) -> Step {
        let stages: Vec<StageId> = if change.is_upward() {
            self.order.iter().rev().copied().collect()
        } else {
            self.order.clone()
        };

        for stage in stages {
            if self.graph.state(stage) != change.current() {
                continue;
            }
            match self.change_stage(stage, change, generation) {
                StateChangeOutcome::Success => {}
                StateChangeOutcome::Async => return Step::Pending,
                StateChangeOutcome::Failure if change.is_upward() => {
                    return Step::Failed(format!(
                        "stage '{}' failed to change state {change}",
                        self.stage_name(stage)
                    ));
                }
                StateChangeOutcome::Failure => {
                    // downward steps always complete so resources get released
                    warn!(pipeline = %self.name, stage = self.stage_name(stage), %change, "stage failed going down, forcing");
                    self.graph.set_state(stage, change.next());
                }
            }
        }
        Step::Done
    }

    fn step_done(&self, change: StateChange, target: State) {
        let next = change.next();
        let (old, moved, post_eos) = {
            let mut control = self.control.lock();
            let old = control.current;
            // bringing down stages left above the pipeline does not move the pipeline itself
            let moved = change.is_upward() || next < old;
            if moved {
                control.current = next;
            }
            match change {
                StateChange::PausedToPlaying => control.reached_playing = true,
                StateChange::PausedToReady => {
                    control.reached_playing = false;
                    control.eos_sinks.clear();
                    control.eos_posted = false;
                }
                _ => {}
            }
            let eos = next == State::Playing && self.take_eos(&mut control);
            (old, moved, eos)
        };
        self.settled.notify_all();

        if moved {
            let pending = (next != target).then_some(target);
            self.bus.post(Event::pipeline_state_changed(
                self.name.clone(),
                old,
                next,
                pending,
            ));
        }
        if post_eos {
            self.post_eos();
        }
    }

    fn change_stage(
        self: &Arc<Self>,
        stage: StageId,
        change: StateChange,
        generation: u64,
    ) -> StateChangeOutcome {
        let Some(node) = self.graph.node(stage) else {
            return StateChangeOutcome::Failure;
        };

        match change {
            StateChange::ReadyToPaused => self.graph.set_flushing(stage, false),
            StateChange::PlayingToPaused => self.stop_streaming(stage),
            StateChange::PausedToReady => self.graph.set_flushing(stage, true),
            _ => {}
        }

        self.control.lock().slot = Some(AsyncSlot {
            stage,
            change,
            generation,
            returned: false,
            completed: None,
        });

        let ctx = StageContext::for_transition(Arc::clone(self), stage, generation);
        let mut outcome = node.behaviour.change_state(change, &ctx);

        {
            let mut control = self.control.lock();
            let ours = control
                .slot
                .as_ref()
                .is_some_and(|s| s.stage == stage && s.generation == generation);
            if ours {
                if outcome == StateChangeOutcome::Async {
                    // the stage may have completed before returning
                    if let Some(slot) = control.slot.as_mut() {
                        match slot.completed.take() {
                            Some(done) => outcome = done,
                            None => slot.returned = true,
                        }
                    }
                }
                if outcome != StateChangeOutcome::Async {
                    control.slot = None;
                }
            }
        }

        match outcome {
            StateChangeOutcome::Success => self.stage_done(stage, change),
            StateChangeOutcome::Async => {
                debug!(stage = %node.name, %change, "stage changes state asynchronously");
            }
            StateChangeOutcome::Failure => self.stage_failed(stage, change),
        }
        outcome
    }

    fn stage_done(self: &Arc<Self>, stage: StageId, change: StateChange) {
        let name = self.stage_name(stage);
        self.graph.set_state(stage, change.next());
        debug!(pipeline = %self.name, stage = name, from = %change.current(), to = %change.next(), "stage changed state");
        self.bus.post(Event::stage_state_changed(
            name,
            change.current(),
            change.next(),
        ));

        match change {
            StateChange::PausedToPlaying
                if self.graph.stage_kind(stage) == Some(StageKind::Source) =>
            {
                self.start_streaming(stage);
            }
            StateChange::PausedToReady => self.graph.remove_announced_ports(stage),
            StateChange::ReadyToNull => {
                // a preroll cancelled before PAUSED may still have announced ports
                self.graph.remove_announced_ports(stage);
                self.graph.mark_errored(stage, false);
            }
            _ => {}
        }
    }

    fn stage_failed(&self, stage: StageId, change: StateChange) {
        let name = self.stage_name(stage);
        if !change.is_upward() {
            return;
        }
        error!(pipeline = %self.name, stage = name, %change, "stage failed to change state");
        if !self.graph.mark_errored(stage, true) {
            self.bus.post(Event::error(
                EventOrigin::Stage(name.to_string()),
                ErrorDetails::new(
                    ErrorCode::StateChange,
                    format!("Stage '{name}' failed to change state"),
                )
                .with_debug(change.to_string()),
            ));
        }
    }

    /// Whether a port announced by `stage` may still be created.
    pub(crate) fn accepts_announcement(&self, stage: StageId, generation: Option<u64>) -> bool {
        if self.graph.state(stage) == State::Null {
            return false;
        }
        generation.map_or(true, |g| self.control.lock().generation == g)
    }

    /// Called by a stage that answered `Async`.
    pub(crate) fn complete_state(
        self: &Arc<Self>,
        stage: StageId,
        origin: Option<u64>,
        outcome: StateChangeOutcome,
    ) {
        if outcome == StateChangeOutcome::Async {
            warn!(stage = self.stage_name(stage), "async is not a completion outcome");
            return;
        }

        let (change, generation) = {
            let mut control = self.control.lock();
            let current_generation = control.generation;
            let Some(slot) = control.slot.as_mut() else {
                debug!(stage = self.stage_name(stage), "no pending state change, ignoring completion");
                return;
            };
            let superseded = origin.is_some_and(|g| g != slot.generation);
            if slot.stage != stage || slot.generation != current_generation || superseded {
                debug!(stage = self.stage_name(stage), "stale state completion ignored");
                return;
            }
            if !slot.returned {
                slot.completed = Some(outcome);
                return;
            }
            let change = slot.change;
            let generation = slot.generation;
            control.slot = None;
            (change, generation)
        };

        match outcome {
            StateChangeOutcome::Success => self.stage_done(stage, change),
            _ => self.stage_failed(stage, change),
        }

        let shared = Arc::clone(self);
        self.handle.spawn_blocking(move || {
            let _serial = shared.transition.lock();
            if outcome == StateChangeOutcome::Failure {
                let reason = format!(
                    "stage '{}' failed to change state {change}",
                    shared.stage_name(stage)
                );
                shared.fail(generation, reason);
                return;
            }
            shared.drive(generation);
        });
    }

    /// Blocks until the pending request settles or `timeout` elapses.
    pub(crate) fn wait_settled(
        &self,
        timeout: Option<Duration>,
    ) -> (StateChangeOutcome, State, Option<State>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut control = self.control.lock();
        loop {
            if control.failure.is_some() {
                return (StateChangeOutcome::Failure, control.current, Some(control.target));
            }
            if control.current == control.target && control.slot.is_none() {
                return (StateChangeOutcome::Success, control.current, None);
            }
            match deadline {
                Some(deadline) => {
                    if self.settled.wait_until(&mut control, deadline).timed_out() {
                        return (StateChangeOutcome::Async, control.current, Some(control.target));
                    }
                }
                None => self.settled.wait(&mut control),
            }
        }
    }

    fn start_streaming(self: &Arc<Self>, stage: StageId) {
        let Some(node) = self.graph.node(stage) else {
            return;
        };
        let behaviour = Arc::clone(&node.behaviour);
        let ctx = StageContext::new(Arc::clone(self), stage);
        let latch = Arc::new(Latch::default());
        let guard = ReleaseOnDrop(Arc::clone(&latch));
        let span = tracing::info_span!("streaming", pipeline = %self.name, stage = %node.name);

        let handle = self.handle.spawn(
            async move {
                let _guard = guard;
                let result = behaviour.produce(&ctx).await;
                ctx.streaming_finished(result);
            }
            .instrument(span),
        );
        debug!(stage = %node.name, "started streaming task");
        self.streaming
            .lock()
            .insert(stage, StreamingTask { handle, done: latch });
    }

    fn stop_streaming(&self, stage: StageId) {
        let task = self.streaming.lock().remove(&stage);
        if let Some(task) = task {
            if task.stop(STOP_TIMEOUT) {
                debug!(stage = self.stage_name(stage), "stopped streaming task");
            } else {
                warn!(stage = self.stage_name(stage), "streaming task did not stop in time");
            }
        }
    }

    pub(crate) fn streaming_finished(&self, stage: StageId, result: Result<(), FlowError>) {
        let name = self.stage_name(stage);
        match result {
            Ok(()) => debug!(stage = name, "streaming task finished"),
            Err(err) if err.is_quiet() => debug!(stage = name, reason = %err, "streaming stopped"),
            Err(FlowError::Error) => debug!(stage = name, "streaming stopped after error"),
            Err(err) => {
                self.post_stage_error(
                    stage,
                    ErrorDetails::new(ErrorCode::StreamFailed, "Internal data stream error.")
                        .with_debug(format!("streaming stopped, reason {err}")),
                );
            }
        }
    }

    pub(crate) fn post_stage_error(&self, stage: StageId, details: ErrorDetails) {
        self.graph.mark_errored(stage, true);
        self.bus.post(Event::error(
            EventOrigin::Stage(self.stage_name(stage).to_string()),
            details,
        ));
    }

    /// A sink consumed its last buffer.
    pub(crate) fn sink_eos(&self, stage: StageId) {
        debug!(pipeline = %self.name, stage = self.stage_name(stage), "sink reached end of stream");
        let post = {
            let mut control = self.control.lock();
            control.eos_sinks.insert(stage);
            self.take_eos(&mut control)
        };
        if post {
            self.post_eos();
        }
    }

    fn take_eos(&self, control: &mut Control) -> bool {
        let ready = control.reached_playing
            && !control.eos_posted
            && !self.sinks.is_empty()
            && self.sinks.iter().all(|s| control.eos_sinks.contains(s));
        if ready {
            control.eos_posted = true;
        }
        ready
    }

    fn post_eos(&self) {
        info!(pipeline = %self.name, "all sinks reached end of stream");
        self.bus.post(Event::end_of_stream(self.name.clone()));
    }

    pub(crate) fn stop_all_streaming(&self) {
        let tasks: Vec<StreamingTask> = self.streaming.lock().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.stop(STOP_TIMEOUT);
        }
    }
}
