//! Frame delivery counters and send latency.
//!
//! A packetizer counts what it publishes; every session-track counts what
//! it actually sends and how many publishes it never observed because it
//! was still busy with an older frame ("latest wins" skipping). Each
//! session-track also bins, per millisecond, how long a frame waited
//! between becoming available and leaving the socket, separately for sent
//! frames and for the frames it skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::media::MediaKind;

/// Interval, in sent frames, between delivery summaries in the log.
const REPORT_INTERVAL: u64 = 1000;

/// Publish-side counters of one track.
#[derive(Debug, Default)]
pub struct TrackStats {
    published: AtomicU64,
}

impl TrackStats {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Frame counts keyed by whole milliseconds of overhead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverheadHistogram {
    bins: BTreeMap<u64, u64>,
}

impl OverheadHistogram {
    pub fn record(&mut self, overhead: Duration) {
        let bin = u64::try_from(overhead.as_millis()).unwrap_or(u64::MAX);
        *self.bins.entry(bin).or_default() += 1;
    }

    /// Frames whose overhead fell in `[ms, ms + 1)`.
    pub fn count(&self, ms: u64) -> u64 {
        self.bins.get(&ms).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.bins.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

impl fmt::Display for OverheadHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (ms, count)) in self.bins.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ms}ms: {count}")?;
        }
        f.write_str("}")
    }
}

/// Snapshot of a session-track's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub frames_sent: u64,
    pub frames_skipped: u64,
}

#[derive(Debug, Default)]
struct Overhead {
    sent: OverheadHistogram,
    skipped: OverheadHistogram,
}

/// Send-side counters of one session-track.
#[derive(Debug)]
pub struct DeliveryStats {
    kind: MediaKind,
    sent: AtomicU64,
    skipped: AtomicU64,
    overhead: Mutex<Overhead>,
}

impl DeliveryStats {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            sent: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            overhead: Mutex::new(Overhead::default()),
        }
    }

    /// Record one sent frame.
    ///
    /// `overhead` is the time from its publication to the end of the send.
    /// `skipped` publishes were missed before it; `skipped_overheads` are the
    /// ages of those still known at send time, which may be fewer.
    pub fn record_sent(
        &self,
        overhead: Duration,
        skipped: u64,
        skipped_overheads: impl IntoIterator<Item = Duration>,
    ) {
        let sent = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let total_skipped = self.skipped.fetch_add(skipped, Ordering::Relaxed) + skipped;

        let mut bins = self.overhead.lock();
        bins.sent.record(overhead);
        for age in skipped_overheads {
            bins.skipped.record(age);
        }

        if sent % REPORT_INTERVAL == 0 {
            tracing::debug!(
                track = %self.kind,
                frames_sent = sent,
                frames_skipped = total_skipped,
                sent_overhead = %bins.sent,
                skipped_overhead = %bins.skipped,
                "delivery stats"
            );
        }
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Overhead histograms of sent and skipped frames, in that order.
    pub fn overhead(&self) -> (OverheadHistogram, OverheadHistogram) {
        let bins = self.overhead.lock();
        (bins.sent.clone(), bins.skipped.clone())
    }
}

impl DeliverySnapshot {
    /// Accumulate another track's counters into this one.
    pub fn merge(self, other: DeliverySnapshot) -> DeliverySnapshot {
        DeliverySnapshot {
            frames_sent: self.frames_sent + other.frames_sent,
            frames_skipped: self.frames_skipped + other.frames_skipped,
        }
    }
}
