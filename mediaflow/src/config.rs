//! Configuration for the send and receive roles.
//!
//! Both roles read an optional TOML file with one table each:
//!
//! ```toml
//! [send]
//! uri = "test://video?frames=300"
//! host = "127.0.0.1"
//! port = 5000
//! bitrate = 3000
//! resolution = 1080
//!
//! [receive]
//! address = "127.0.0.1"
//! port = 5000
//! idle_timeout_ms = 2000
//! ```
//!
//! Missing fields take the defaults below; command-line flags override both.

use crate::caps::Capability;
use crate::errors::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Output sizes the send role can scale to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// 1280x720.
    Hd720,
    /// 1920x1080.
    Hd1080,
    /// 3840x2160.
    Uhd2160,
}

impl Resolution {
    /// Looks up a resolution by its height.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedResolution`] for anything but
    /// 720, 1080 and 2160.
    pub fn from_height(height: u32) -> Result<Self, ConfigError> {
        match height {
            720 => Ok(Self::Hd720),
            1080 => Ok(Self::Hd1080),
            2160 => Ok(Self::Uhd2160),
            other => Err(ConfigError::UnsupportedResolution(other)),
        }
    }

    /// Frame width in pixels.
    #[must_use]
    pub const fn width(self) -> u32 {
        match self {
            Self::Hd720 => 1280,
            Self::Hd1080 => 1920,
            Self::Uhd2160 => 3840,
        }
    }

    /// Frame height in pixels.
    #[must_use]
    pub const fn height(self) -> u32 {
        match self {
            Self::Hd720 => 720,
            Self::Hd1080 => 1080,
            Self::Uhd2160 => 2160,
        }
    }

    /// Caps string for the scaler's caps filter.
    #[must_use]
    pub fn caps(self) -> String {
        format!("video/x-raw, width={}, height={}", self.width(), self.height())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width(), self.height())
    }
}

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Settings for the send role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Media to stream.
    #[serde(default = "default_uri")]
    pub uri: String,
    /// Destination host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Destination port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Target encoder bitrate in kbps.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Requested output height; see [`Resolution::from_height`].
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    /// Worker threads for the pipeline.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_uri() -> String {
    "test://video?frames=300&width=1280&height=720&fps=30".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_bitrate() -> u32 {
    3000
}

fn default_resolution() -> u32 {
    1080
}

fn default_workers() -> usize {
    2
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            host: default_host(),
            port: default_port(),
            bitrate: default_bitrate(),
            resolution: default_resolution(),
            workers: default_workers(),
        }
    }
}

impl SourceConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the `[send]` table of a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(load_table::<ConfigFile>(path.as_ref())?.send)
    }

    /// Sets the media URI.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn with_destination(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the bitrate in kbps.
    #[must_use]
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Sets the requested output height.
    #[must_use]
    pub fn with_resolution(mut self, height: u32) -> Self {
        self.resolution = height;
        self
    }

    /// The requested output size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedResolution`].
    pub fn resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::from_height(self.resolution)
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolution()?;
        if self.uri.trim().is_empty() {
            return Err(ConfigError::invalid("uri", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must not be 0"));
        }
        if self.bitrate == 0 {
            return Err(ConfigError::invalid("bitrate", "must be at least 1 kbps"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for the receive role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Address to listen on.
    #[serde(default = "default_host")]
    pub address: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Caps of the expected stream; datagrams that do not match are dropped.
    #[serde(default = "default_receive_caps")]
    pub caps: String,
    /// Silence after which the stream is considered finished. 0 waits forever.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Worker threads for the pipeline.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_receive_caps() -> String {
    "application/x-rtp, media=video, clock-rate=90000, encoding-name=H264, payload=96".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    2000
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            address: default_host(),
            port: default_port(),
            caps: default_receive_caps(),
            idle_timeout_ms: default_idle_timeout_ms(),
            workers: default_workers(),
        }
    }
}

impl ReceiveConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the `[receive]` table of a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(load_table::<ConfigFile>(path.as_ref())?.receive)
    }

    /// Sets the listen address and port.
    #[must_use]
    pub fn with_listen(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Parsed stream caps.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCaps`].
    pub fn caps(&self) -> Result<Capability, ConfigError> {
        Capability::parse(&self.caps)
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.caps()?;
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid("address", "must not be empty"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    send: SourceConfig,
    #[serde(default)]
    receive: ReceiveConfig,
}
