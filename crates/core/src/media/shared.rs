//! Single-producer, many-consumer publication of the newest packetized frame.
//!
//! The capture thread is the only writer. It packetizes each access unit
//! straight into the shared [`FramePacket`] while holding the frame lock,
//! bumps the generation, and broadcasts on a condition variable. Sender
//! loops wait on that condition, copy the frame out into their own cursor,
//! and release the lock before touching the network.
//!
//! There is no queue: a consumer that falls behind only ever sees the most
//! recent frame. The writer never waits for readers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::frame::TimestampClock;
use super::{CodecParams, FramePacket, MediaKind, Packetizer, packetizer_for};
use crate::error::{Result, ServerError};
use crate::stats::TrackStats;

/// Publishes remembered for skipped-frame latency accounting.
const PUBLISH_LOG_LEN: usize = 256;

/// Outcome of [`SharedPacketizer::await_next_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWait {
    /// The cursor now holds a newer frame. `skipped` publishes were missed.
    Ready { skipped: u64 },
    /// No newer frame arrived within the timeout.
    TimedOut,
    /// The capture source closed; no more frames will be published.
    Closed,
}

struct CodecState {
    packetizer: Box<dyn Packetizer>,
    clock: Option<TimestampClock>,
}

/// Shared packetizer for one track.
pub struct SharedPacketizer {
    kind: MediaKind,
    codec: Mutex<CodecState>,
    frame: Mutex<FramePacket>,
    frame_ready: Condvar,
    publish_log: Mutex<VecDeque<(u64, Instant)>>,
    sdp: RwLock<Option<Vec<String>>>,
    closed: AtomicBool,
    stats: TrackStats,
}

impl SharedPacketizer {
    pub fn new(packetizer: Box<dyn Packetizer>) -> Self {
        Self {
            kind: packetizer.kind(),
            codec: Mutex::new(CodecState {
                packetizer,
                clock: None,
            }),
            frame: Mutex::new(FramePacket::new()),
            frame_ready: Condvar::new(),
            publish_log: Mutex::new(VecDeque::with_capacity(PUBLISH_LOG_LEN)),
            sdp: RwLock::new(None),
            closed: AtomicBool::new(false),
            stats: TrackStats::default(),
        }
    }

    /// Shared packetizer using the default codec for `kind`.
    pub fn for_kind(kind: MediaKind) -> Self {
        Self::new(packetizer_for(kind))
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stats(&self) -> &TrackStats {
        &self.stats
    }

    /// Apply codec parameters and store the resulting SDP media section.
    ///
    /// Must be called at most once, before any frame.
    pub fn prepare(&self, params: &CodecParams) -> Result<()> {
        let mut codec = self.codec.lock();
        if self.sdp.read().is_some() {
            return Err(ServerError::AlreadyPrepared(self.kind));
        }

        let lines = codec.packetizer.prepare(params)?;
        codec.clock = Some(TimestampClock::new(codec.packetizer.clock_rate()));
        tracing::info!(track = %self.kind, sdp = %lines.join(" | "), "track prepared");
        *self.sdp.write() = Some(lines);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.sdp.read().is_some()
    }

    /// SDP media section (without `a=control`), once prepared.
    pub fn sdp_fragment(&self) -> Option<Vec<String>> {
        self.sdp.read().clone()
    }

    /// Packetize and publish one access unit, then wake every waiting consumer.
    pub fn on_frame_received(&self, access_unit: &[u8], presentation_time_us: i64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut codec = self.codec.lock();
        let CodecState { packetizer, clock } = &mut *codec;
        let Some(clock) = clock.as_mut() else {
            tracing::warn!(track = %self.kind, "frame before codec preparation, dropped");
            return;
        };
        let rtp_timestamp = clock.advance(presentation_time_us);

        {
            let mut frame = self.frame.lock();
            let count = packetizer.packetize(access_unit, rtp_timestamp, &mut frame);
            if count == 0 {
                return;
            }
            frame.publish(rtp_timestamp, count, presentation_time_us);

            if let Some(at) = frame.published_at() {
                let mut log = self.publish_log.lock();
                if log.len() == PUBLISH_LOG_LEN {
                    log.pop_front();
                }
                log.push_back((frame.generation(), at));
            }
        }

        self.stats.record_published();
        self.frame_ready.notify_all();
    }

    /// Block until a frame newer than `cursor` is published, then copy it
    /// into `cursor`.
    ///
    /// Gives up after `timeout` so sender loops can observe their stop flag.
    pub fn await_next_frame(&self, cursor: &mut FramePacket, timeout: Duration) -> FrameWait {
        let deadline = Instant::now() + timeout;
        let mut frame = self.frame.lock();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return FrameWait::Closed;
            }
            if frame.is_newer_than(cursor) {
                let skipped = frame.frames_skipped_since(cursor);
                frame.clone_into(cursor);
                return FrameWait::Ready { skipped };
            }
            if self.frame_ready.wait_until(&mut frame, deadline).timed_out() {
                if frame.is_newer_than(cursor) {
                    continue;
                }
                return FrameWait::TimedOut;
            }
        }
    }

    /// Publish instants of the generations strictly between `after` and
    /// `before`, i.e. the frames a consumer skipped, as far as the log
    /// still remembers them.
    pub fn publish_times_between(&self, after: u64, before: u64, out: &mut Vec<Instant>) {
        out.clear();
        let log = self.publish_log.lock();
        out.extend(
            log.iter()
                .filter(|(generation, _)| *generation > after && *generation < before)
                .map(|(_, at)| *at),
        );
    }

    /// Capture source stopped producing frames. Wakes every consumer.
    pub fn close(&self) {
        {
            let _frame = self.frame.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.frame_ready.notify_all();
        tracing::info!(track = %self.kind, "capture source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
