//! Tracing spans for pipeline runs.

use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::Span;

/// Attributes recorded on the span of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpanAttributes {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Run ID.
    pub run_id: String,
    /// Role the pipeline plays (`send`, `receive`, ...).
    pub role: Option<String>,
    /// Number of stages in the graph.
    pub stage_count: usize,
}

impl RunSpanAttributes {
    /// Collects the attributes of `pipeline`.
    #[must_use]
    pub fn of(pipeline: &Pipeline) -> Self {
        Self {
            pipeline_name: pipeline.name().to_string(),
            run_id: pipeline.run_id().to_string(),
            role: None,
            stage_count: pipeline.graph().len(),
        }
    }

    /// Sets the role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Flattens to dotted keys, e.g. for a JSON log line.
    #[must_use]
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("pipeline.name".to_string(), self.pipeline_name.clone());
        fields.insert("pipeline.run_id".to_string(), self.run_id.clone());
        fields.insert("pipeline.stages".to_string(), self.stage_count.to_string());
        if let Some(role) = &self.role {
            fields.insert("pipeline.role".to_string(), role.clone());
        }
        fields
    }

    /// Opens an info-level span carrying the attributes.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "pipeline_run",
            pipeline = %self.pipeline_name,
            run_id = %self.run_id,
            role = self.role.as_deref().unwrap_or("-"),
            stages = self.stage_count,
        )
    }
}

/// Measures how long something took.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts timing.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Name given at start.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops timing and returns the elapsed time.
    #[must_use]
    pub fn finish(self) -> Duration {
        self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::testing::{test_pipeline, RecordingSink};
    use std::sync::Arc;

    #[test]
    fn test_attributes_of_pipeline() {
        let mut graph = Graph::new("attrs");
        graph.add_stage("sink", Arc::new(RecordingSink::new())).unwrap();
        let pipeline = test_pipeline(graph);

        let attrs = RunSpanAttributes::of(&pipeline).with_role("receive");
        let fields = attrs.to_fields();
        assert_eq!(fields["pipeline.name"], "attrs");
        assert_eq!(fields["pipeline.stages"], "1");
        assert_eq!(fields["pipeline.role"], "receive");
        assert_eq!(fields["pipeline.run_id"], pipeline.run_id().to_string());
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("preroll");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.name(), "preroll");
        assert!(timer.finish() >= Duration::from_millis(5));
    }
}
