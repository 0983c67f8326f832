//! `udpsink` and `udpsrc`: datagram transport.
//!
//! Both stages own their socket between NULL→READY and READY→NULL, so a
//! port that is already taken fails the state change instead of the first
//! push.

use super::props;
use super::rtp_h264::{rtp_video_caps, DEFAULT_PAYLOAD_TYPE};
use crate::caps::{Capability, CapabilitySet, RTP};
use crate::core::{StageKind, StateChange, StateChangeOutcome};
use crate::errors::{FlowError, PropertyError};
use crate::events::ErrorCode;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};
use webrtc_util::marshal::Unmarshal;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const MAX_DATAGRAM: usize = 65_535;

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
    })
}

#[derive(Debug)]
struct SinkSettings {
    host: String,
    port: u16,
}

#[derive(Debug)]
struct OpenSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

/// Sends every buffer as one datagram to `host:port`.
#[derive(Debug)]
pub struct UdpSink {
    settings: Mutex<SinkSettings>,
    open: Mutex<Option<OpenSink>>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Default for UdpSink {
    fn default() -> Self {
        Self {
            settings: Mutex::new(SinkSettings {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            }),
            open: Mutex::new(None),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }
}

impl UdpSink {
    /// Creates a sink aimed at 127.0.0.1:5000.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Datagrams sent since the socket was opened.
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    fn open(&self) -> io::Result<OpenSink> {
        let (host, port) = {
            let settings = self.settings.lock();
            (settings.host.clone(), settings.port)
        };
        let destination = resolve(&host, port)?;
        let local: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        Ok(OpenSink {
            socket,
            destination,
        })
    }
}

#[async_trait]
impl Stage for UdpSink {
    fn factory_name(&self) -> &'static str {
        "udpsink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", CapabilitySet::any())]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        match key {
            "host" => settings.host = props::string(value)?,
            "port" => settings.port = props::port(value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        match change {
            StateChange::NullToReady => match self.open() {
                Ok(open) => {
                    debug!(stage = ctx.stage_name(), destination = %open.destination, "opened socket");
                    self.packets.store(0, Ordering::Relaxed);
                    self.bytes.store(0, Ordering::Relaxed);
                    *self.open.lock() = Some(open);
                    StateChangeOutcome::Success
                }
                Err(e) => {
                    let _ = ctx.error(
                        ErrorCode::ResourceOpenFailed,
                        "Could not open resource for writing.",
                        Some(e.to_string()),
                    );
                    StateChangeOutcome::Failure
                }
            },
            StateChange::ReadyToNull => {
                if self.open.lock().take().is_some() {
                    debug!(
                        stage = ctx.stage_name(),
                        packets = self.packets.load(Ordering::Relaxed),
                        bytes = self.bytes.load(Ordering::Relaxed),
                        "closed socket"
                    );
                }
                StateChangeOutcome::Success
            }
            _ => StateChangeOutcome::Success,
        }
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let open = self.open.lock();
        let Some(open) = open.as_ref() else {
            return Err(FlowError::Flushing);
        };
        match open.socket.send_to(&buffer.data, open.destination) {
            Ok(sent) => {
                self.packets.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(sent as u64, Ordering::Relaxed);
                trace!(stage = ctx.stage_name(), len = sent, "sent datagram");
                Ok(())
            }
            Err(e) => Err(ctx.error(
                ErrorCode::ResourceWrite,
                "Could not write to resource.",
                Some(format!("send to {} failed: {e}", open.destination)),
            )),
        }
    }
}

#[derive(Debug)]
struct SourceSettings {
    address: String,
    port: u16,
    caps: Capability,
    idle_timeout: Option<Duration>,
}

/// Receives datagrams on `address:port` and pushes the ones matching `caps`.
///
/// With `caps` of the RTP family, datagrams that are not RTP version 2 or
/// carry a different `payload` type are dropped before they reach any stage.
#[derive(Debug)]
pub struct UdpSource {
    settings: Mutex<SourceSettings>,
    socket: Mutex<Option<UdpSocket>>,
    filtered: AtomicU64,
}

impl Default for UdpSource {
    fn default() -> Self {
        Self {
            settings: Mutex::new(SourceSettings {
                address: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                caps: rtp_video_caps(DEFAULT_PAYLOAD_TYPE),
                idle_timeout: None,
            }),
            socket: Mutex::new(None),
            filtered: AtomicU64::new(0),
        }
    }
}

impl UdpSource {
    /// Creates a source listening on 127.0.0.1:5000 for payload type 96.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the socket is bound to, while at READY or above.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Datagrams dropped by the caps pre-filter.
    #[must_use]
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    fn bind(&self) -> io::Result<UdpSocket> {
        let (address, port) = {
            let settings = self.settings.lock();
            (settings.address.clone(), settings.port)
        };
        let socket = UdpSocket::bind(resolve(&address, port)?)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Returns true if `data` may carry a stream described by `caps`.
    fn admits(caps: &Capability, data: &[u8]) -> bool {
        if !caps.is_in_family(RTP) {
            return true;
        }
        let Ok(header) = rtp::header::Header::unmarshal(&mut &data[..]) else {
            return false;
        };
        if header.version != 2 {
            return false;
        }
        caps.get_int("payload")
            .map_or(true, |pt| i64::from(header.payload_type) == pt)
    }
}

#[async_trait]
impl Stage for UdpSource {
    fn factory_name(&self) -> &'static str {
        "udpsrc"
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::output("src", CapabilitySet::any())]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        match key {
            "address" => settings.address = props::string(value)?,
            "port" => settings.port = props::port(value)?,
            "caps" => settings.caps = props::caps(value)?,
            "timeout-ms" => {
                let ms = props::uint(value, 0, u64::from(u32::MAX))?;
                settings.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn port_caps(&self, _port: &str) -> Option<CapabilitySet> {
        Some(CapabilitySet::single(self.settings.lock().caps.clone()))
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        match change {
            StateChange::NullToReady => match self.bind() {
                Ok(socket) => {
                    info!(
                        stage = ctx.stage_name(),
                        address = %socket.local_addr().map_or_else(|e| e.to_string(), |a| a.to_string()),
                        "listening"
                    );
                    self.filtered.store(0, Ordering::Relaxed);
                    *self.socket.lock() = Some(socket);
                    StateChangeOutcome::Success
                }
                Err(e) => {
                    let _ = ctx.error(
                        ErrorCode::ResourceOpenFailed,
                        "Could not open resource for reading.",
                        Some(e.to_string()),
                    );
                    StateChangeOutcome::Failure
                }
            },
            StateChange::ReadyToNull => {
                self.socket.lock().take();
                StateChangeOutcome::Success
            }
            _ => StateChangeOutcome::Success,
        }
    }

    async fn produce(&self, ctx: &StageContext) -> Result<(), FlowError> {
        let read_error = |e: io::Error| {
            ctx.error(
                ErrorCode::ResourceRead,
                "Could not read from resource.",
                Some(e.to_string()),
            )
        };
        let socket = {
            let socket = self.socket.lock();
            let Some(socket) = socket.as_ref() else {
                return Err(FlowError::Flushing);
            };
            socket.try_clone().map_err(read_error)?
        };
        let socket = tokio::net::UdpSocket::from_std(socket).map_err(read_error)?;
        let (caps, idle) = {
            let settings = self.settings.lock();
            (settings.caps.clone(), settings.idle_timeout)
        };

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut received: u64 = 0;
        loop {
            let recv = socket.recv_from(&mut buf);
            let result = match idle {
                Some(idle) if received > 0 => match tokio::time::timeout(idle, recv).await {
                    Ok(result) => result,
                    Err(_) => {
                        info!(
                            stage = ctx.stage_name(),
                            idle_ms = idle.as_millis() as u64,
                            packets = received,
                            "transport went quiet, ending stream"
                        );
                        break;
                    }
                },
                _ => recv.await,
            };
            let (len, from) = result.map_err(read_error)?;
            let data = &buf[..len];
            if !Self::admits(&caps, data) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                trace!(stage = ctx.stage_name(), %from, len, "dropped datagram not matching caps");
                continue;
            }
            ctx.push(
                "src",
                Buffer::new(Bytes::copy_from_slice(data)).with_offset(received),
            )?;
            received += 1;
        }
        ctx.push_eos_all();
        Ok(())
    }
}
