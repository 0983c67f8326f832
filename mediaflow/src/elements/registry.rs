//! Factory-name lookup for built-in and user stages.

use super::{
    CapsFilter, FakeSink, RtpDepayloader, RtpPayloader, UdpSink, UdpSource, UriSource,
    VideoConvert, VideoDecoder, VideoEncoder, VideoScale, VideoSink,
};
use crate::errors::ConstructionError;
use crate::stages::Stage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Constructor registered for a factory name.
pub type StageFactory = fn() -> Arc<dyn Stage>;

fn builtin<S: Stage + Default + 'static>() -> Arc<dyn Stage> {
    Arc::new(S::default())
}

/// Maps factory names such as `udpsink` to stage constructors.
#[derive(Clone)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StageRegistry {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding every built-in stage.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("uridecodebin", builtin::<UriSource>);
        registry.register("videoscale", builtin::<VideoScale>);
        registry.register("capsfilter", builtin::<CapsFilter>);
        registry.register("videoconvert", builtin::<VideoConvert>);
        registry.register("x264enc", builtin::<VideoEncoder>);
        registry.register("rtph264pay", builtin::<RtpPayloader>);
        registry.register("udpsink", builtin::<UdpSink>);
        registry.register("udpsrc", builtin::<UdpSource>);
        registry.register("rtph264depay", builtin::<RtpDepayloader>);
        registry.register("avdec_h264", builtin::<VideoDecoder>);
        registry.register("autovideosink", builtin::<VideoSink>);
        registry.register("fakesink", builtin::<FakeSink>);
        registry
    }

    /// Registers (or replaces) a factory.
    pub fn register(&mut self, factory: impl Into<String>, constructor: StageFactory) {
        self.factories.insert(factory.into(), constructor);
    }

    /// Removes a factory. Returns true if it was registered.
    pub fn unregister(&mut self, factory: &str) -> bool {
        self.factories.remove(factory).is_some()
    }

    /// Returns true if `factory` is registered.
    #[must_use]
    pub fn contains(&self, factory: &str) -> bool {
        self.factories.contains_key(factory)
    }

    /// Registered factory names in sorted order.
    pub fn factories(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiates a stage.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::MissingStage`] for unknown factories.
    pub fn make(&self, factory: &str, name: &str) -> Result<Arc<dyn Stage>, ConstructionError> {
        let constructor = self
            .factories
            .get(factory)
            .ok_or_else(|| ConstructionError::MissingStage {
                factory: factory.to_string(),
                name: name.to_string(),
            })?;
        debug!(factory, stage = name, "created stage");
        Ok(constructor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_cover_both_pipelines() {
        let registry = StageRegistry::with_builtins();
        for factory in [
            "uridecodebin",
            "videoscale",
            "capsfilter",
            "videoconvert",
            "x264enc",
            "rtph264pay",
            "udpsink",
            "udpsrc",
            "rtph264depay",
            "avdec_h264",
            "autovideosink",
        ] {
            let stage = registry.make(factory, "x").unwrap();
            assert_eq!(stage.factory_name(), factory);
        }
    }

    #[test]
    fn test_missing_factory() {
        let mut registry = StageRegistry::with_builtins();
        assert!(registry.unregister("x264enc"));
        let err = registry.make("x264enc", "x264_enc").unwrap_err();
        assert!(matches!(
            err,
            ConstructionError::MissingStage { ref factory, ref name } if factory == "x264enc" && name == "x264_enc"
        ));
        assert!(err.to_string().starts_with("Not all elements could be created"));
    }
}
