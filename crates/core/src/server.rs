use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, ServerError};
use crate::media::{CodecParams, MediaKind, SharedPacketizer};
use crate::rtcp::LivenessValidator;
use crate::session::{LowerTransport, SessionContext, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::tcp::{self, ConnectionTracker};

/// One media track served by the server. Its index in
/// [`ServerConfig::tracks`] is its `trackID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConfig {
    pub kind: MediaKind,
    /// Server RTP port advertised in SETUP; RTCP is the next port up.
    pub server_rtp_port: u16,
}

impl TrackConfig {
    pub fn new(kind: MediaKind, server_rtp_port: u16) -> Self {
        Self {
            kind,
            server_rtp_port,
        }
    }
}

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listener address.
    pub bind_addr: String,
    /// Served tracks, in `trackID` order. The first is the control track:
    /// RTCP liveness is received on its RTCP port.
    pub tracks: Vec<TrackConfig>,
    /// Public host advertised in the SDP `o=` line.
    /// When `None`, the address the client connected to is used.
    pub public_host: Option<String>,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Longest RTCP silence tolerated before a UDP client is dropped.
    pub rtcp_ttl: Duration,
    /// Upper bound a sender waits for a frame before re-checking its stop flag.
    pub frame_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            tracks: vec![
                TrackConfig::new(MediaKind::Video, 5004),
                TrackConfig::new(MediaKind::Audio, 5006),
            ],
            public_host: None,
            sdp_session_name: "Camera Stream".to_string(),
            rtcp_ttl: Duration::from_secs(10),
            frame_wait: Duration::from_millis(250),
        }
    }
}

/// Per-frame metadata from the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub key_frame: bool,
    /// Buffer holds codec configuration (H.265 VPS/SPS/PPS), not media.
    pub codec_config: bool,
}

/// Boundary between the capture/encode side and the server.
///
/// The capture side calls [`on_media_prepared`](Self::on_media_prepared)
/// at most once per track before any frame of that track, and
/// [`on_source_closed`](Self::on_source_closed) when it stops producing.
pub trait CaptureSink: Send + Sync {
    fn on_media_prepared(&self, params: &CodecParams, kind: MediaKind) -> Result<()>;

    fn on_frame_received(
        &self,
        access_unit: &[u8],
        presentation_time_us: i64,
        flags: FrameFlags,
        kind: MediaKind,
    );

    fn on_source_closed(&self, kind: MediaKind);
}

/// Information about a connected viewer (client with an active RTP session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub session: String,
    pub client: IpAddr,
    pub transport: LowerTransport,
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

struct Runtime {
    local_addr: SocketAddr,
    validator: Arc<LivenessValidator>,
}

/// High-level RTSP server orchestrator.
///
/// Owns one [`SharedPacketizer`] per configured track, the session
/// registry and the shutdown coordinator. Delegates RTSP connections to
/// [`transport::tcp`](crate::transport::tcp) and RTCP liveness to
/// [`LivenessValidator`].
pub struct Server {
    config: Arc<ServerConfig>,
    tracks: Vec<Arc<SharedPacketizer>>,
    registry: SessionRegistry,
    coordinator: Arc<ShutdownCoordinator>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        Self {
            tracks: config
                .tracks
                .iter()
                .map(|t| Arc::new(SharedPacketizer::for_kind(t.kind)))
                .collect(),
            registry: SessionRegistry::new(coordinator.clone()),
            coordinator,
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    /// Bind the RTSP listener and the RTCP validator, then start accepting.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }
        let control = self.config.tracks.first().ok_or(ServerError::UnknownTrack(0))?;

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let rtcp_addr = SocketAddr::new(
            local_addr.ip(),
            control.server_rtp_port.wrapping_add(1),
        );
        let validator = Arc::new(LivenessValidator::bind(
            rtcp_addr,
            self.config.rtcp_ttl,
            self.coordinator.clone(),
        )?);

        let ctx = Arc::new(SessionContext {
            config: self.config.clone(),
            tracks: self.tracks.clone(),
            registry: self.registry.clone(),
            validator: validator.clone(),
            coordinator: self.coordinator.clone(),
        });

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let connections = Arc::new(ConnectionTracker::default());

        tracing::info!(addr = %local_addr, rtcp = %rtcp_addr, "RTSP server listening");

        let spawned = thread::Builder::new()
            .name("rtsp-accept".into())
            .spawn(move || tcp::accept_loop(listener, ctx, running, connections));
        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        *runtime = Some(Runtime {
            local_addr,
            validator,
        });
        Ok(())
    }

    /// Stop every component. The termination callback fires once the
    /// listener, the validator and every session have reported stopped.
    pub fn stop(&self) -> Result<()> {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Err(ServerError::NotRunning);
        };
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(sessions = self.registry.len(), "server stopping");
        self.running.store(false, Ordering::SeqCst);
        self.registry.stop_all();
        runtime.validator.stop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the RTSP listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.local_addr)
    }

    /// Address of the RTCP liveness listener, once started.
    pub fn rtcp_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .lock()
            .as_ref()
            .and_then(|r| r.validator.local_addr().ok())
    }

    /// Install the callback run exactly once when shutdown completes.
    pub fn set_on_terminated<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.coordinator.set_on_terminated(callback);
    }

    pub fn is_terminated(&self) -> bool {
        self.coordinator.is_terminated()
    }

    /// Block until shutdown completes or `timeout` elapses.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        self.coordinator.wait(timeout)
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<SharedPacketizer>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.registry
            .sessions()
            .iter()
            .filter(|s| s.is_running())
            .map(|s| {
                let stats = s.stats();
                Viewer {
                    session: s.key().to_string(),
                    client: s.peer(),
                    transport: s.lower_transport(),
                    frames_sent: stats.frames_sent,
                    frames_skipped: stats.frames_skipped,
                }
            })
            .collect()
    }

    fn track_for(&self, kind: MediaKind) -> Result<&Arc<SharedPacketizer>> {
        self.track(kind).ok_or(ServerError::MissingTrack(kind))
    }
}

impl CaptureSink for Server {
    fn on_media_prepared(&self, params: &CodecParams, kind: MediaKind) -> Result<()> {
        if params.kind() != kind {
            return Err(ServerError::TrackKindMismatch {
                expected: kind,
                given: params.kind(),
            });
        }
        self.track_for(kind)?.prepare(params)
    }

    fn on_frame_received(
        &self,
        access_unit: &[u8],
        presentation_time_us: i64,
        flags: FrameFlags,
        kind: MediaKind,
    ) {
        if access_unit.is_empty() {
            tracing::trace!(track = %kind, "empty access unit dropped");
            return;
        }
        let track = match self.track_for(kind) {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(error = %e, "frame for unconfigured track dropped");
                return;
            }
        };

        if flags.codec_config {
            if kind == MediaKind::Video && !track.is_prepared() {
                let params = CodecParams::H265 {
                    parameter_sets: access_unit.to_vec(),
                };
                if let Err(e) = track.prepare(&params) {
                    tracing::warn!(track = %kind, error = %e, "codec config rejected");
                }
            }
            return;
        }

        track.on_frame_received(access_unit, presentation_time_us);
    }

    fn on_source_closed(&self, kind: MediaKind) {
        match self.track_for(kind) {
            Ok(track) => track.close(),
            Err(e) => tracing::warn!(error = %e, "close for unconfigured track"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rtp_port: u16) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            tracks: vec![TrackConfig::new(MediaKind::Audio, rtp_port)],
            ..ServerConfig::default()
        }
    }

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, "0.0.0.0:8554");
        assert_eq!(c.tracks[0], TrackConfig::new(MediaKind::Video, 5004));
        assert_eq!(c.tracks[1], TrackConfig::new(MediaKind::Audio, 5006));
        assert_eq!(c.rtcp_ttl, Duration::from_secs(10));
        assert_eq!(c.sdp_session_name, "Camera Stream");
    }

    #[test]
    fn start_stop_lifecycle() {
        let server = Server::new(config(25100));
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));

        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().unwrap().port() != 0);
        assert_eq!(server.rtcp_addr().unwrap().port(), 25101);
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

        server.stop().unwrap();
        assert!(server.wait_terminated(Duration::from_secs(3)));
        server.stop().unwrap();
    }

    #[test]
    fn capture_routing() {
        let server = Server::new(config(25110));

        let err = server
            .on_media_prepared(&CodecParams::aac_lc(48000, 2), MediaKind::Video)
            .unwrap_err();
        assert!(matches!(err, ServerError::TrackKindMismatch { .. }));

        let err = server
            .on_media_prepared(
                &CodecParams::H265 {
                    parameter_sets: vec![],
                },
                MediaKind::Video,
            )
            .unwrap_err();
        assert!(matches!(err, ServerError::MissingTrack(MediaKind::Video)));

        server
            .on_media_prepared(&CodecParams::aac_lc(48000, 2), MediaKind::Audio)
            .unwrap();
        let audio = server.track(MediaKind::Audio).unwrap();

        server.on_frame_received(&[], 0, FrameFlags::default(), MediaKind::Audio);
        assert_eq!(audio.stats().published(), 0);

        let config_flag = FrameFlags {
            codec_config: true,
            ..FrameFlags::default()
        };
        server.on_frame_received(&[0x12, 0x10], 0, config_flag, MediaKind::Audio);
        assert_eq!(audio.stats().published(), 0);

        server.on_frame_received(&[1, 2, 3], 0, FrameFlags::default(), MediaKind::Audio);
        assert_eq!(audio.stats().published(), 1);

        server.on_source_closed(MediaKind::Audio);
        assert!(audio.is_closed());
    }

    #[test]
    fn codec_config_prepares_video() {
        let server = Server::new(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            tracks: vec![TrackConfig::new(MediaKind::Video, 25120)],
            ..ServerConfig::default()
        });
        let parameter_sets = [
            0, 0, 0, 1, 0x40, 0x01, 0x0c, 0, 0, 0, 1, 0x42, 0x01, 0x01, 0, 0, 0, 1, 0x44, 0x01,
            0xc1,
        ];
        let flags = FrameFlags {
            codec_config: true,
            key_frame: false,
        };
        server.on_frame_received(&parameter_sets, 0, flags, MediaKind::Video);

        let video = server.track(MediaKind::Video).unwrap();
        assert!(video.is_prepared());
        assert_eq!(video.stats().published(), 0);
    }
}
