//! `uridecodebin`: resolves a URI into raw streams announced at runtime.
//!
//! Two schemes are understood:
//!
//! - `test://video?frames=N&width=W&height=H&fps=F&audio=1` generates a
//!   moving test pattern and, with `audio=1`, a silent audio track.
//! - `file:///path?width=W&height=H&fps=F` plays a headerless I420 file.
//!
//! The URI is resolved during READY to PAUSED, which completes
//! asynchronously. Every elementary stream found becomes one announced
//! `src_%u` port.

use super::props;
use super::video::VideoInfo;
use crate::caps::{Capability, CapabilitySet, RAW_AUDIO};
use crate::core::{StageKind, StateChange, StateChangeOutcome};
use crate::errors::{FlowError, PropertyError};
use crate::events::ErrorCode;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

const VIDEO_PORT: &str = "src_0";
const AUDIO_PORT: &str = "src_1";
const AUDIO_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Media {
    Pattern { frames: u64 },
    File { path: PathBuf },
}

/// What a URI resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Plan {
    video: VideoInfo,
    audio: bool,
    media: Media,
}

/// A resolution failure, reported as an error event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolveError {
    code: ErrorCode,
    message: &'static str,
    debug: String,
}

impl ResolveError {
    fn not_found(debug: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ResourceNotFound,
            message: "Resource not found.",
            debug: debug.into(),
        }
    }
}

fn query_u32(url: &Url, key: &str, default: u32) -> Result<u32, ResolveError> {
    match url.query_pairs().find(|(k, _)| k == key) {
        Some((_, value)) => value.parse().map_err(|_| ResolveError {
            code: ErrorCode::ResourceNotFound,
            message: "Invalid URI.",
            debug: format!("query parameter '{key}={value}' is not a number"),
        }),
        None => Ok(default),
    }
}

fn parse_uri(uri: &str) -> Result<(Url, VideoInfo), ResolveError> {
    let url = Url::parse(uri).map_err(|e| ResolveError::not_found(format!("invalid URI '{uri}': {e}")))?;
    let video = VideoInfo::new(
        query_u32(&url, "width", 320)?,
        query_u32(&url, "height", 240)?,
        query_u32(&url, "fps", 30)?,
    );
    if video.width == 0 || video.height == 0 {
        return Err(ResolveError {
            code: ErrorCode::StreamFormat,
            message: "Could not determine type of stream.",
            debug: format!("zero frame size in '{uri}'"),
        });
    }
    Ok((url, video))
}

async fn resolve(uri: &str) -> Result<Plan, ResolveError> {
    let (url, video) = parse_uri(uri)?;
    match url.scheme() {
        "test" => Ok(Plan {
            video,
            audio: query_u32(&url, "audio", 0)? != 0,
            media: Media::Pattern {
                frames: u64::from(query_u32(&url, "frames", 300)?),
            },
        }),
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| ResolveError::not_found(format!("'{uri}' is not a local path")))?;
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ResolveError::not_found(format!("{}: {e}", path.display()))
                } else {
                    ResolveError {
                        code: ErrorCode::ResourceOpenFailed,
                        message: "Could not open resource for reading.",
                        debug: format!("{}: {e}", path.display()),
                    }
                }
            })?;
            if metadata.len() < video.frame_size() as u64 {
                return Err(ResolveError {
                    code: ErrorCode::StreamFormat,
                    message: "Could not determine type of stream.",
                    debug: format!(
                        "{} holds {} bytes, less than one {}x{} frame",
                        path.display(),
                        metadata.len(),
                        video.width,
                        video.height
                    ),
                });
            }
            Ok(Plan {
                video,
                audio: false,
                media: Media::File { path },
            })
        }
        other => Err(ResolveError::not_found(format!(
            "no source handles URI scheme '{other}'"
        ))),
    }
}

fn pattern_frame(info: &VideoInfo, index: u64) -> Vec<u8> {
    let (w, h) = (info.width as usize, info.height as usize);
    let mut frame = Vec::with_capacity(info.frame_size());
    let shift = (index % 256) as usize;
    for y in 0..h {
        frame.extend((0..w).map(|x| ((x + y + shift) % 220 + 16) as u8));
    }
    frame.resize(info.frame_size(), 128);
    frame
}

fn audio_caps() -> Capability {
    Capability::new(RAW_AUDIO)
        .with_str("format", "S16LE")
        .with_int("rate", i64::from(AUDIO_RATE))
        .with_int("channels", i64::from(AUDIO_CHANNELS))
}

/// Resolves a URI and announces one port per elementary stream.
#[derive(Debug, Default)]
pub struct UriSource {
    uri: Mutex<Option<String>>,
    plan: Arc<Mutex<Option<Plan>>>,
    resolver: Mutex<Option<JoinHandle<()>>>,
}

impl UriSource {
    /// Creates a source without a URI.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn preroll(&self, ctx: &StageContext) -> StateChangeOutcome {
        let Some(uri) = self.uri.lock().clone() else {
            let _ = ctx.error(
                ErrorCode::ResourceNotFound,
                "No URI specified to play from.",
                None,
            );
            return StateChangeOutcome::Failure;
        };

        let task_ctx = ctx.clone();
        let plan_slot = Arc::clone(&self.plan);
        let task = ctx.spawn(async move {
            match resolve(&uri).await {
                Ok(plan) => {
                    info!(
                        stage = task_ctx.stage_name(),
                        %uri,
                        width = plan.video.width,
                        height = plan.video.height,
                        audio = plan.audio,
                        "resolved URI"
                    );
                    task_ctx.announce_port(VIDEO_PORT, plan.video.to_caps());
                    if plan.audio {
                        task_ctx.announce_port(AUDIO_PORT, audio_caps());
                    }
                    *plan_slot.lock() = Some(plan);
                    task_ctx.complete_state(StateChangeOutcome::Success);
                }
                Err(err) => {
                    let _ = task_ctx.error(err.code, err.message, Some(err.debug));
                    task_ctx.complete_state(StateChangeOutcome::Failure);
                }
            }
        });
        if let Some(previous) = self.resolver.lock().replace(task) {
            previous.abort();
        }
        StateChangeOutcome::Async
    }

    /// Stops a resolve that is still running.
    fn cancel_resolve(&self) {
        if let Some(task) = self.resolver.lock().take() {
            if !task.is_finished() {
                debug!("cancelling pending URI resolve");
            }
            task.abort();
        }
    }

    fn push_audio(ctx: &StageContext, plan: &Plan, index: u64) -> Result<(), FlowError> {
        let samples = (AUDIO_RATE * plan.video.fps_d / plan.video.fps_n.max(1)) as usize;
        let silence = vec![0u8; samples * AUDIO_CHANNELS as usize * 2];
        let buffer = Buffer::new(silence)
            .with_offset(index)
            .with_pts(plan.video.pts(index));
        match ctx.push(AUDIO_PORT, buffer) {
            // nobody has to consume the audio track
            Err(FlowError::NotLinked) => Ok(()),
            other => other,
        }
    }

    async fn play_pattern(ctx: &StageContext, plan: &Plan, frames: u64) -> Result<(), FlowError> {
        for index in 0..frames {
            let frame = pattern_frame(&plan.video, index);
            let buffer = Buffer::new(frame)
                .with_offset(index)
                .with_pts(plan.video.pts(index));
            ctx.push(VIDEO_PORT, buffer)?;
            if plan.audio {
                Self::push_audio(ctx, plan, index)?;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn play_file(ctx: &StageContext, plan: &Plan, path: &PathBuf) -> Result<(), FlowError> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            ctx.error(
                ErrorCode::ResourceOpenFailed,
                "Could not open resource for reading.",
                Some(format!("{}: {e}", path.display())),
            )
        })?;

        let size = plan.video.frame_size();
        let mut index = 0u64;
        loop {
            let mut frame = vec![0u8; size];
            match file.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(ctx.error(
                        ErrorCode::ResourceRead,
                        "Could not read from resource.",
                        Some(format!("{}: {e}", path.display())),
                    ));
                }
            }
            let buffer = Buffer::new(Bytes::from(frame))
                .with_offset(index)
                .with_pts(plan.video.pts(index));
            ctx.push(VIDEO_PORT, buffer)?;
            index += 1;
        }
        debug!(stage = ctx.stage_name(), frames = index, "reached end of file");
        Ok(())
    }
}

#[async_trait]
impl Stage for UriSource {
    fn factory_name(&self) -> &'static str {
        "uridecodebin"
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::sometimes_output("src_%u", CapabilitySet::any())]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        match key {
            "uri" => {
                *self.uri.lock() = Some(props::string(value)?);
                Ok(())
            }
            _ => Err(PropertyError::Unknown),
        }
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        match change {
            StateChange::ReadyToPaused => self.preroll(ctx),
            StateChange::PausedToReady | StateChange::ReadyToNull => {
                self.cancel_resolve();
                self.plan.lock().take();
                StateChangeOutcome::Success
            }
            _ => StateChangeOutcome::Success,
        }
    }

    async fn produce(&self, ctx: &StageContext) -> Result<(), FlowError> {
        let Some(plan) = self.plan.lock().clone() else {
            return Err(FlowError::NotNegotiated("URI not resolved".to_string()));
        };
        match &plan.media {
            Media::Pattern { frames } => Self::play_pattern(ctx, &plan, *frames).await?,
            Media::File { path } => Self::play_file(ctx, &plan, path).await?,
        }
        ctx.push_eos_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_test_uri_defaults() {
        let (url, video) = parse_uri("test://video").unwrap();
        assert_eq!(url.scheme(), "test");
        assert_eq!(video, VideoInfo::new(320, 240, 30));
    }

    #[test]
    fn test_parse_rejects_bad_numbers() {
        let err = parse_uri("test://video?width=wide").unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
        assert!(err.debug.contains("width=wide"));
        assert!(parse_uri("not a uri").is_err());
    }

    #[tokio::test]
    async fn test_resolve_pattern_with_audio() {
        let plan = resolve("test://video?frames=5&width=64&height=48&fps=10&audio=1")
            .await
            .unwrap();
        assert_eq!(plan.video, VideoInfo::new(64, 48, 10));
        assert!(plan.audio);
        assert_eq!(plan.media, Media::Pattern { frames: 5 });
    }

    #[tokio::test]
    async fn test_resolve_unknown_scheme_is_not_found() {
        let err = resolve("https://example.com/video.webm").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
        assert!(err.debug.contains("https"));
    }

    #[tokio::test]
    async fn test_resolve_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.yuv");
        let info = VideoInfo::new(8, 8, 30);
        std::fs::write(&path, vec![0u8; info.frame_size() * 3]).unwrap();

        let uri = format!("{}?width=8&height=8", Url::from_file_path(&path).unwrap());
        let plan = resolve(&uri).await.unwrap();
        assert_eq!(plan.media, Media::File { path: path.clone() });

        let missing = format!("{}?width=8&height=8", Url::from_file_path(dir.path().join("nope.yuv")).unwrap());
        assert_eq!(resolve(&missing).await.unwrap_err().code, ErrorCode::ResourceNotFound);
    }

    #[test]
    fn test_pattern_frame_size() {
        let info = VideoInfo::new(6, 4, 30);
        let frame = pattern_frame(&info, 7);
        assert_eq!(frame.len(), info.frame_size());
        assert_eq!(frame[0], 7 + 16);
    }
}
