//! Mock stages for testing.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::caps::{Capability, CapabilitySet};
use crate::core::{StageKind, StateChange, StateChangeOutcome};
use crate::errors::FlowError;
use crate::events::ErrorCode;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};

/// A source that announces scripted ports and pushes a fixed number of buffers.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    output: Option<Capability>,
    lazy: bool,
    announcements: Vec<Capability>,
    buffers: usize,
    buffer_size: Option<usize>,
    interval: Duration,
    error_after: Option<usize>,
    async_preroll: bool,
    announced: Mutex<Vec<String>>,
    pushed: AtomicUsize,
    changes: Mutex<Vec<StateChange>>,
}

impl ScriptedSource {
    /// Creates a source without ports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an always-present output `src` with the given caps.
    #[must_use]
    pub fn with_output(mut self, caps: Capability) -> Self {
        self.output = Some(caps);
        self
    }

    /// Adds a `src_%u` family of announced outputs accepting any caps.
    #[must_use]
    pub fn with_lazy_outputs(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Announces one port per entry during READY to PAUSED.
    #[must_use]
    pub fn with_announcements(mut self, caps: Vec<Capability>) -> Self {
        self.lazy = true;
        self.announcements = caps;
        self
    }

    /// Number of buffers pushed on every port while PLAYING.
    #[must_use]
    pub fn with_buffers(mut self, count: usize) -> Self {
        self.buffers = count;
        self
    }

    /// Size of every pushed buffer; 16 bytes unless set.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Delay before each buffer.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Posts a stream error after pushing `count` buffers.
    #[must_use]
    pub fn with_error_after(mut self, count: usize) -> Self {
        self.error_after = Some(count);
        self
    }

    /// Announces ports from a worker task and completes READY to PAUSED late.
    #[must_use]
    pub fn with_async_preroll(mut self) -> Self {
        self.async_preroll = true;
        self
    }

    /// Buffers pushed so far, counted per port.
    #[must_use]
    pub fn pushed(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    /// State changes applied so far.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }

    fn announce_all(announcements: &[Capability], ctx: &StageContext) -> Vec<String> {
        announcements
            .iter()
            .enumerate()
            .map(|(i, caps)| {
                let name = format!("src_{i}");
                ctx.announce_port(&name, caps.clone());
                name
            })
            .collect()
    }

    fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.output.iter().map(|_| "src".to_string()).collect();
        ports.extend(self.announced.lock().iter().cloned());
        ports
    }
}

#[async_trait]
impl Stage for ScriptedSource {
    fn factory_name(&self) -> &'static str {
        "scriptedsrc"
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn templates(&self) -> Vec<PortTemplate> {
        let mut templates = Vec::new();
        if let Some(caps) = &self.output {
            templates.push(PortTemplate::output("src", caps.clone()));
        }
        if self.lazy {
            templates.push(PortTemplate::sometimes_output("src_%u", CapabilitySet::any()));
        }
        templates
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        self.changes.lock().push(change);
        match change {
            StateChange::ReadyToPaused if !self.announcements.is_empty() => {
                if self.async_preroll {
                    let task_ctx = ctx.clone();
                    let announcements = self.announcements.clone();
                    // names are known up front; the ports themselves appear later
                    *self.announced.lock() = (0..announcements.len()).map(|i| format!("src_{i}")).collect();
                    ctx.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Self::announce_all(&announcements, &task_ctx);
                        task_ctx.complete_state(StateChangeOutcome::Success);
                    });
                    StateChangeOutcome::Async
                } else {
                    let names = Self::announce_all(&self.announcements, ctx);
                    *self.announced.lock() = names;
                    StateChangeOutcome::Success
                }
            }
            StateChange::PausedToReady => {
                self.announced.lock().clear();
                StateChangeOutcome::Success
            }
            _ => StateChangeOutcome::Success,
        }
    }

    async fn produce(&self, ctx: &StageContext) -> Result<(), FlowError> {
        let ports = self.ports();
        for index in 0..self.buffers {
            if self.error_after == Some(index) {
                return Err(ctx.error(
                    ErrorCode::StreamFailed,
                    "Scripted failure.",
                    Some(format!("after {index} buffers")),
                ));
            }
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }

            let mut linked = 0;
            for port in &ports {
                let buffer = Buffer::new(Bytes::from(vec![0u8; self.buffer_size.unwrap_or(16)]))
                    .with_offset(index as u64)
                    .with_pts(self.interval * u32::try_from(index).unwrap_or(u32::MAX));
                match ctx.push(port, buffer) {
                    Ok(()) => {
                        linked += 1;
                        self.pushed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(FlowError::NotLinked) => {}
                    Err(err) => return Err(err),
                }
            }
            if linked == 0 {
                return Err(FlowError::NotLinked);
            }
        }
        ctx.push_eos_all();
        Ok(())
    }
}

/// A sink that records everything it receives.
#[derive(Debug)]
pub struct RecordingSink {
    accepted: CapabilitySet,
    buffers: Mutex<Vec<Buffer>>,
    caps: Mutex<Option<Capability>>,
    eos: AtomicUsize,
    changes: Mutex<Vec<StateChange>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    /// A sink accepting anything.
    #[must_use]
    pub fn new() -> Self {
        Self::accepting(CapabilitySet::any())
    }

    /// A sink accepting only `caps`.
    #[must_use]
    pub fn accepting(caps: impl Into<CapabilitySet>) -> Self {
        Self {
            accepted: caps.into(),
            buffers: Mutex::new(Vec::new()),
            caps: Mutex::new(None),
            eos: AtomicUsize::new(0),
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Buffers received so far.
    #[must_use]
    pub fn buffers(&self) -> Vec<Buffer> {
        self.buffers.lock().clone()
    }

    /// Number of buffers received so far.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Caps fixed on the input, if any.
    #[must_use]
    pub fn caps(&self) -> Option<Capability> {
        self.caps.lock().clone()
    }

    /// Number of end-of-stream notifications received.
    #[must_use]
    pub fn eos_count(&self) -> usize {
        self.eos.load(Ordering::SeqCst)
    }

    /// State changes applied so far.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }
}

#[async_trait]
impl Stage for RecordingSink {
    fn factory_name(&self) -> &'static str {
        "recordingsink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", self.accepted.clone())]
    }

    fn change_state(&self, change: StateChange, _ctx: &StageContext) -> StateChangeOutcome {
        self.changes.lock().push(change);
        StateChangeOutcome::Success
    }

    fn set_caps(&self, _ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        *self.caps.lock() = Some(caps.clone());
        Ok(())
    }

    fn chain(&self, _ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        self.buffers.lock().push(buffer);
        Ok(())
    }

    fn handle_eos(&self, ctx: &StageContext, _port: &str) {
        self.eos.fetch_add(1, Ordering::SeqCst);
        ctx.post_eos();
    }
}

/// A sink that refuses one state change.
#[derive(Debug)]
pub struct FailingStage {
    change: StateChange,
    asynchronous: bool,
    post_error: bool,
    changes: Mutex<Vec<StateChange>>,
}

impl FailingStage {
    /// Fails `change` synchronously.
    #[must_use]
    pub fn on(change: StateChange) -> Self {
        Self {
            change,
            asynchronous: false,
            post_error: false,
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Answers `Async` and reports the failure from a worker task.
    #[must_use]
    pub fn asynchronously(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Posts its own error event before failing.
    #[must_use]
    pub fn with_error_event(mut self) -> Self {
        self.post_error = true;
        self
    }

    /// State changes attempted so far.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn factory_name(&self) -> &'static str {
        "failingsink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", CapabilitySet::any())]
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        self.changes.lock().push(change);
        if change != self.change {
            return StateChangeOutcome::Success;
        }
        if self.post_error {
            let _ = ctx.error(
                ErrorCode::ResourceOpenFailed,
                "Could not open resource.",
                Some(change.to_string()),
            );
        }
        if self.asynchronous {
            let done = ctx.clone();
            ctx.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.complete_state(StateChangeOutcome::Failure);
            });
            return StateChangeOutcome::Async;
        }
        StateChangeOutcome::Failure
    }
}

/// A sink that answers `Async` for one change and never completes it.
#[derive(Debug)]
pub struct StallingStage {
    change: StateChange,
    changes: Mutex<Vec<StateChange>>,
}

impl StallingStage {
    /// Stalls on `change`.
    #[must_use]
    pub fn on(change: StateChange) -> Self {
        Self {
            change,
            changes: Mutex::new(Vec::new()),
        }
    }

    /// State changes attempted so far.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }
}

#[async_trait]
impl Stage for StallingStage {
    fn factory_name(&self) -> &'static str {
        "stallingsink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", CapabilitySet::any())]
    }

    fn change_state(&self, change: StateChange, _ctx: &StageContext) -> StateChangeOutcome {
        self.changes.lock().push(change);
        if change == self.change {
            StateChangeOutcome::Async
        } else {
            StateChangeOutcome::Success
        }
    }
}
