use std::time::Instant;

use super::rtp::RtpPacket;

/// One packetized access unit: the RTP packets of a single encoded frame.
///
/// A [`SharedPacketizer`](super::SharedPacketizer) owns exactly one of these
/// and overwrites it on every new access unit. Sender loops own their own
/// copy (the "cursor") which [`clone_into`](Self::clone_into) refreshes
/// without reallocating once buffers have grown to the stream's frame size.
#[derive(Debug, Default, Clone)]
pub struct FramePacket {
    rtp_timestamp: u32,
    packets: Vec<RtpPacket>,
    num_packets: usize,
    presentation_time_us: i64,
    generation: u64,
    published_at: Option<Instant>,
}

impl FramePacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// RTP timestamp shared by every packet of this frame.
    pub fn rtp_timestamp(&self) -> u32 {
        self.rtp_timestamp
    }

    /// Encoder presentation time of the originating access unit.
    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    /// When the frame became available to consumers.
    pub fn published_at(&self) -> Option<Instant> {
        self.published_at
    }

    /// Publish counter of the owning packetizer; 0 means "never filled".
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Packets of the current frame, in transmission order.
    pub fn packets(&self) -> &[RtpPacket] {
        &self.packets[..self.num_packets]
    }

    /// Buffer for the `index`-th packet of the frame being built, growing
    /// the packet list as needed.
    pub fn packet_slot(&mut self, index: usize) -> &mut RtpPacket {
        while self.packets.len() <= index {
            self.packets.push(RtpPacket::new());
        }
        &mut self.packets[index]
    }

    /// Make the first `num_packets` slots visible as a new frame.
    pub(crate) fn publish(&mut self, rtp_timestamp: u32, num_packets: usize, presentation_time_us: i64) {
        self.rtp_timestamp = rtp_timestamp;
        self.num_packets = num_packets;
        self.presentation_time_us = presentation_time_us;
        self.generation += 1;
        self.published_at = Some(Instant::now());
    }

    /// Whether this frame should be delivered to a consumer holding `cursor`.
    ///
    /// A frame is newer when it was published after the cursor's copy and its
    /// timestamp is strictly ahead in RTP serial-number order (mod 2^32). A
    /// frame carrying the same timestamp as the cursor is never delivered, so
    /// a consumer cannot send a duplicate.
    pub fn is_newer_than(&self, cursor: &FramePacket) -> bool {
        if self.generation <= cursor.generation {
            return false;
        }
        cursor.generation == 0 || timestamp_after(self.rtp_timestamp, cursor.rtp_timestamp)
    }

    /// Number of publishes between the cursor's frame and this one that the
    /// cursor never saw.
    pub fn frames_skipped_since(&self, cursor: &FramePacket) -> u64 {
        if cursor.generation == 0 {
            return 0;
        }
        self.generation.saturating_sub(cursor.generation).saturating_sub(1)
    }

    /// Copy this frame into consumer-owned storage.
    pub fn clone_into(&self, dest: &mut FramePacket) {
        for (i, packet) in self.packets().iter().enumerate() {
            dest.packet_slot(i).copy_from(packet);
        }
        dest.rtp_timestamp = self.rtp_timestamp;
        dest.num_packets = self.num_packets;
        dest.presentation_time_us = self.presentation_time_us;
        dest.generation = self.generation;
        dest.published_at = self.published_at;
    }

    /// Assign consecutive sequence numbers starting at `*next_sequence` and
    /// the session's SSRC to every packet. `next_sequence` is left pointing
    /// past the last packet, wrapping mod 65536.
    pub fn stamp(&mut self, next_sequence: &mut u16, ssrc: u32) {
        for packet in &mut self.packets[..self.num_packets] {
            packet.stamp(*next_sequence, ssrc);
            *next_sequence = next_sequence.wrapping_add(1);
        }
    }
}

/// `a` is strictly after `b` in RTP timestamp order (RFC 3550 serial arithmetic).
pub fn timestamp_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Converts encoder presentation times into an RTP timestamp progression.
///
/// The first frame seeds the timestamp with a random value. Every later frame
/// advances it by `round(delta_us * clock_rate / 1_000_000)`, wrapping mod 2^32.
#[derive(Debug)]
pub struct TimestampClock {
    clock_rate: u32,
    last_pts_us: Option<i64>,
    current: u32,
}

impl TimestampClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            last_pts_us: None,
            current: 0,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Advance to the frame presented at `pts_us` and return its RTP timestamp.
    pub fn advance(&mut self, pts_us: i64) -> u32 {
        match self.last_pts_us.replace(pts_us) {
            None => {
                self.current = rand::random::<u32>();
            }
            Some(last) => {
                let delta = rtp_delta(pts_us - last, self.clock_rate);
                self.current = self.current.wrapping_add(delta);
            }
        }
        self.current
    }
}

/// RTP clock ticks for a presentation-time delta, rounded to nearest.
/// Negative deltas (out-of-order presentation times) advance by zero.
pub fn rtp_delta(delta_us: i64, clock_rate: u32) -> u32 {
    if delta_us <= 0 {
        return 0;
    }
    let ticks = (delta_us as u128 * clock_rate as u128 + 500_000) / 1_000_000;
    ticks as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(packets: &[&[u8]], ts: u32) -> FramePacket {
        let mut f = FramePacket::new();
        for (i, payload) in packets.iter().enumerate() {
            f.packet_slot(i)
                .fill(97, i == packets.len() - 1, ts, payload.len())
                .copy_from_slice(payload);
        }
        f.publish(ts, packets.len(), 0);
        f
    }

    #[test]
    fn delta_rounds_to_nearest() {
        // 33_333 us at 90 kHz = 2999.97 ticks
        assert_eq!(rtp_delta(33_333, 90_000), 3000);
        // 1 us at 44.1 kHz = 0.0441 ticks
        assert_eq!(rtp_delta(1, 44_100), 0);
        // 23_219 us at 44.1 kHz = 1023.96
        assert_eq!(rtp_delta(23_219, 44_100), 1024);
        assert_eq!(rtp_delta(-5, 90_000), 0);
    }

    #[test]
    fn clock_follows_presentation_deltas() {
        let mut clock = TimestampClock::new(90_000);
        let pts = [1_000_000i64, 1_033_333, 1_066_667, 1_100_000, 1_200_000];
        let mut prev = clock.advance(pts[0]);
        for w in pts.windows(2) {
            let ts = clock.advance(w[1]);
            assert_eq!(ts, prev.wrapping_add(rtp_delta(w[1] - w[0], 90_000)));
            prev = ts;
        }
    }

    #[test]
    fn first_timestamp_is_random() {
        let a = TimestampClock::new(90_000).advance(0);
        let b = TimestampClock::new(90_000).advance(0);
        let c = TimestampClock::new(90_000).advance(0);
        assert!(a != b || b != c, "three seeds should not all collide");
    }

    #[test]
    fn clock_wraps() {
        let mut clock = TimestampClock::new(90_000);
        clock.advance(0);
        clock.current = u32::MAX - 10;
        assert_eq!(clock.advance(1_000_000), 90_000 - 11);
    }

    #[test]
    fn serial_comparison_handles_wrap() {
        assert!(timestamp_after(5, u32::MAX - 5));
        assert!(!timestamp_after(u32::MAX - 5, 5));
        assert!(!timestamp_after(7, 7));
    }

    #[test]
    fn fresh_cursor_accepts_first_frame() {
        let f = frame_with(&[b"abc"], 0x9000_0000);
        assert!(f.is_newer_than(&FramePacket::new()));
    }

    #[test]
    fn equal_timestamp_is_not_newer() {
        let mut cursor = FramePacket::new();
        let mut shared = frame_with(&[b"a"], 1000);
        shared.clone_into(&mut cursor);
        assert!(!shared.is_newer_than(&cursor));

        // Republished with the same timestamp: still not newer
        shared.publish(1000, 1, 0);
        assert!(!shared.is_newer_than(&cursor));

        shared.publish(1001, 1, 0);
        assert!(shared.is_newer_than(&cursor));
    }

    #[test]
    fn skipped_frames_counted_from_generation_gap() {
        let mut cursor = FramePacket::new();
        let mut shared = frame_with(&[b"a"], 10);
        assert_eq!(shared.frames_skipped_since(&cursor), 0);
        shared.clone_into(&mut cursor);

        shared.publish(20, 1, 0);
        shared.publish(30, 1, 0);
        shared.publish(40, 1, 0);
        assert_eq!(shared.frames_skipped_since(&cursor), 2);
    }

    #[test]
    fn clone_copies_only_live_packets() {
        let big = frame_with(&[b"one", b"two", b"three"], 1);
        let small = frame_with(&[b"x"], 2);
        let mut cursor = FramePacket::new();
        big.clone_into(&mut cursor);
        assert_eq!(cursor.packets().len(), 3);

        small.clone_into(&mut cursor);
        assert_eq!(cursor.packets().len(), 1);
        assert_eq!(cursor.packets()[0].payload(), b"x");
        assert_eq!(cursor.rtp_timestamp(), 2);
        assert_eq!(cursor.published_at(), small.published_at());
        assert!(cursor.published_at().is_some());
    }

    #[test]
    fn stamp_assigns_consecutive_sequences() {
        let mut f = frame_with(&[b"a", b"b", b"c"], 5);
        let mut seq = u16::MAX - 1;
        f.stamp(&mut seq, 0x1234);
        let seqs: Vec<u16> = f.packets().iter().map(|p| p.sequence()).collect();
        assert_eq!(seqs, vec![u16::MAX - 1, u16::MAX, 0]);
        assert_eq!(seq, 1);
        assert!(f.packets().iter().all(|p| p.ssrc() == 0x1234));
    }
}
