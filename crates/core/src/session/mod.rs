//! Client RTP sessions.
//!
//! A session is created when a client sends PLAY and lives until TEARDOWN,
//! RTCP silence, a transport failure, the capture source closing, or server
//! shutdown. It runs one sender thread per track:
//!
//! ```text
//! SharedPacketizer ──await_next_frame──▶ cursor ──stamp(seq, ssrc)──▶ PacketSink
//! ```
//!
//! Every sender owns its own sequence counter and SSRC, so two clients of
//! the same track see identical timestamps but independent sequence spaces.
//! When the last sender exits the session removes itself from the
//! [`SessionRegistry`] and reports to the shutdown coordinator.

mod registry;
pub mod transport;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use crate::error::{Result, ServerError};
use crate::media::{FramePacket, FrameWait, SharedPacketizer};
use crate::rtcp::LivenessValidator;
use crate::server::ServerConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::{DeliverySnapshot, DeliveryStats};
use crate::transport::PacketSink;

pub use registry::SessionRegistry;
pub use transport::{LowerTransport, TrackTransport, TransportHeader};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Everything a running server shares with its connections and sessions.
pub(crate) struct SessionContext {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) tracks: Vec<Arc<SharedPacketizer>>,
    pub(crate) registry: SessionRegistry,
    pub(crate) validator: Arc<LivenessValidator>,
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
}

/// One client receiving one or more tracks over a single lower transport.
pub struct RtpSession {
    key: String,
    peer: IpAddr,
    lower: LowerTransport,
    sink: Box<dyn PacketSink>,
    tracks: Vec<usize>,
    stats: Vec<DeliveryStats>,
    running: AtomicBool,
    remaining: AtomicUsize,
    created: Instant,
    ctx: Arc<SessionContext>,
}

impl RtpSession {
    /// Register a session and spawn its sender threads.
    ///
    /// `tracks[slot]` is the track id served by the sink's `slot`. Starting a
    /// session whose key is already registered is a no-op.
    pub(crate) fn start(
        ctx: &Arc<SessionContext>,
        key: String,
        peer: IpAddr,
        lower: LowerTransport,
        sink: Box<dyn PacketSink>,
        tracks: Vec<usize>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Err(ServerError::UnknownTrack(0));
        }
        if let Some(&bad) = tracks.iter().find(|&&id| id >= ctx.tracks.len()) {
            return Err(ServerError::UnknownTrack(bad));
        }

        let session = Arc::new(RtpSession {
            stats: tracks
                .iter()
                .map(|&id| DeliveryStats::new(ctx.tracks[id].kind()))
                .collect(),
            remaining: AtomicUsize::new(tracks.len()),
            running: AtomicBool::new(true),
            created: Instant::now(),
            ctx: ctx.clone(),
            key,
            peer,
            lower,
            sink,
            tracks,
        });

        if !ctx.registry.insert(session.clone())? {
            tracing::debug!(session = %session.key, "session already active");
            return Ok(());
        }
        if lower == LowerTransport::Udp {
            ctx.validator.register(peer);
        }

        tracing::info!(
            session = %session.key,
            client = %peer,
            transport = %lower,
            tracks = session.tracks.len(),
            "RTP session started"
        );

        for (slot, &track_id) in session.tracks.iter().enumerate() {
            let track = ctx.tracks[track_id].clone();
            let sender = session.clone();
            let spawned = thread::Builder::new()
                .name(format!("rtp-{}-{}", track.kind(), slot))
                .spawn(move || sender.run_track(slot, track));

            if let Err(e) = spawned {
                tracing::error!(session = %session.key, error = %e, "failed to spawn RTP sender");
                session.stop();
                session.track_finished();
            }
        }

        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn lower_transport(&self) -> LowerTransport {
        self.lower
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Delivery counters summed over every track of the session.
    pub fn stats(&self) -> DeliverySnapshot {
        self.stats
            .iter()
            .map(DeliveryStats::snapshot)
            .fold(DeliverySnapshot::default(), DeliverySnapshot::merge)
    }

    /// Ask every sender to exit and release the transport.
    ///
    /// Senders observe the flag within one frame wait; the session reports
    /// closed once all of them have returned.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!(session = %self.key, "stopping RTP session");
            self.sink.close();
        }
    }

    fn run_track(self: Arc<Self>, slot: usize, track: Arc<SharedPacketizer>) {
        let mut cursor = FramePacket::new();
        let mut sequence: u16 = rand::random();
        let ssrc: u32 = rand::random();
        let frame_wait = self.ctx.config.frame_wait;
        let mut skipped_at = Vec::new();

        tracing::debug!(
            session = %self.key,
            track = %track.kind(),
            ssrc = format_args!("{ssrc:08X}"),
            "RTP sender started"
        );

        let reason = loop {
            if !self.is_running() {
                break "stopped";
            }
            if self.lower == LowerTransport::Udp && !self.ctx.validator.check(self.peer) {
                if self.is_running() {
                    tracing::info!(session = %self.key, client = %self.peer, "client liveness lost");
                }
                self.stop();
                break "liveness lost";
            }

            let previous = cursor.generation();
            match track.await_next_frame(&mut cursor, frame_wait) {
                FrameWait::TimedOut => continue,
                FrameWait::Closed => {
                    self.stop();
                    break "source closed";
                }
                FrameWait::Ready { skipped } => {
                    if !self.is_running() {
                        break "stopped";
                    }
                    cursor.stamp(&mut sequence, ssrc);
                    if let Err(e) = self.sink.send_frame(slot, &cursor) {
                        if self.is_running() {
                            tracing::debug!(session = %self.key, error = %e, "RTP send failed");
                        }
                        self.stop();
                        break "send failed";
                    }
                    let sent_at = Instant::now();
                    if skipped > 0 {
                        track.publish_times_between(previous, cursor.generation(), &mut skipped_at);
                    } else {
                        skipped_at.clear();
                    }
                    let overhead = cursor
                        .published_at()
                        .map(|at| sent_at.saturating_duration_since(at))
                        .unwrap_or_default();
                    self.stats[slot].record_sent(
                        overhead,
                        skipped,
                        skipped_at.iter().map(|at| sent_at.saturating_duration_since(*at)),
                    );
                    tracing::trace!(
                        session = %self.key,
                        track = %track.kind(),
                        packets = cursor.packets().len(),
                        rtp_timestamp = cursor.rtp_timestamp(),
                        "frame sent"
                    );
                }
            }
        };

        tracing::debug!(session = %self.key, track = %track.kind(), reason, "RTP sender exited");
        self.track_finished();
    }

    fn track_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        self.ctx.registry.remove(&self.key);
        if self.lower == LowerTransport::Udp && !self.ctx.registry.has_client(self.peer) {
            self.ctx.validator.disconnect(self.peer);
        }

        let stats = self.stats();
        tracing::info!(
            session = %self.key,
            frames_sent = stats.frames_sent,
            frames_skipped = stats.frames_skipped,
            "RTP session closed"
        );
        self.ctx.coordinator.session_closed();
    }
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSession")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("lower", &self.lower)
            .field("tracks", &self.tracks)
            .field("running", &self.is_running())
            .finish()
    }
}
