/// Size of the RTP fixed header (RFC 3550 §5.1). No CSRCs, no extension.
pub const RTP_HEADER_SIZE: usize = 12;

/// Largest RTP payload produced by any packetizer, chosen to stay under a
/// typical 1500-byte Ethernet MTU after IP/UDP (or TCP + `$` framing) overhead.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// A reusable RTP packet buffer.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Packetizers fill version, marker, payload type and timestamp. The
/// sequence number and SSRC stay zero until a session calls
/// [`stamp`](Self::stamp) right before sending, because every receiving
/// client owns its own sequence space and SSRC.
///
/// The backing storage only ever grows: `len` is the logical size, and a
/// frame that needs fewer bytes than a previous one reuses the allocation.
#[derive(Debug, Default, Clone)]
pub struct RtpPacket {
    data: Vec<u8>,
    len: usize,
}

impl RtpPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated capacity of the backing buffer, in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The wire bytes of this packet (header + payload).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Bytes following the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.data[RTP_HEADER_SIZE.min(self.len)..self.len]
    }

    /// Set the logical length, growing the buffer when needed.
    fn resize(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        self.len = len;
        &mut self.data[..len]
    }

    /// Write a fresh fixed header and size the packet for `payload_len`
    /// bytes of payload. Returns the payload region for the caller to fill.
    ///
    /// Sequence number and SSRC are zeroed.
    pub fn fill(
        &mut self,
        payload_type: u8,
        marker: bool,
        timestamp: u32,
        payload_len: usize,
    ) -> &mut [u8] {
        let buf = self.resize(RTP_HEADER_SIZE + payload_len);
        buf[0] = 2 << 6;
        buf[1] = ((marker as u8) << 7) | (payload_type & 0x7f);
        buf[2..4].fill(0);
        buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        buf[8..12].fill(0);
        &mut buf[RTP_HEADER_SIZE..]
    }

    /// Copy another packet's bytes into this buffer, reusing storage.
    pub fn copy_from(&mut self, other: &RtpPacket) {
        let src = other.as_bytes();
        self.resize(src.len()).copy_from_slice(src);
    }

    /// Write the per-session sequence number and SSRC into the header.
    pub fn stamp(&mut self, sequence: u16, ssrc: u32) {
        if self.len < RTP_HEADER_SIZE {
            return;
        }
        self.data[2..4].copy_from_slice(&sequence.to_be_bytes());
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn marker(&self) -> bool {
        self.len >= 2 && self.data[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        if self.len >= 2 { self.data[1] & 0x7f } else { 0 }
    }

    pub fn sequence(&self) -> u16 {
        if self.len < RTP_HEADER_SIZE {
            return 0;
        }
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn timestamp(&self) -> u32 {
        if self.len < RTP_HEADER_SIZE {
            return 0;
        }
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ssrc(&self) -> u32 {
        if self.len < RTP_HEADER_SIZE {
            return 0;
        }
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(marker: bool) -> RtpPacket {
        let mut p = RtpPacket::new();
        p.fill(97, marker, 0xDEADBEEF, 4).copy_from_slice(&[1, 2, 3, 4]);
        p
    }

    #[test]
    fn version_is_2() {
        let p = filled(false);
        assert_eq!(p.as_bytes()[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        assert!(!filled(false).marker());
        assert!(filled(true).marker());
    }

    #[test]
    fn payload_type_and_timestamp() {
        let p = filled(false);
        assert_eq!(p.payload_type(), 97);
        assert_eq!(p.timestamp(), 0xDEADBEEF);
        assert_eq!(p.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn sequence_and_ssrc_zero_until_stamped() {
        let mut p = filled(true);
        assert_eq!(p.sequence(), 0);
        assert_eq!(p.ssrc(), 0);

        p.stamp(0xBEEF, 0xAABBCCDD);
        assert_eq!(p.sequence(), 0xBEEF);
        assert_eq!(p.ssrc(), 0xAABBCCDD);
        // Stamping leaves the rest of the header alone
        assert!(p.marker());
        assert_eq!(p.timestamp(), 0xDEADBEEF);
    }

    #[test]
    fn buffer_only_grows() {
        let mut p = RtpPacket::new();
        p.fill(96, false, 0, 100);
        assert_eq!(p.len(), RTP_HEADER_SIZE + 100);
        let cap = p.capacity();

        p.fill(96, false, 0, 10);
        assert_eq!(p.len(), RTP_HEADER_SIZE + 10);
        assert_eq!(p.capacity(), cap);
    }

    #[test]
    fn refill_clears_stamped_fields() {
        let mut p = filled(false);
        p.stamp(7, 9);
        p.fill(97, false, 1, 2);
        assert_eq!(p.sequence(), 0);
        assert_eq!(p.ssrc(), 0);
    }

    #[test]
    fn copy_from_reuses_storage() {
        let src = filled(true);
        let mut dst = RtpPacket::new();
        dst.fill(96, false, 0, 500);
        let cap = dst.capacity();
        dst.copy_from(&src);
        assert_eq!(dst.as_bytes(), src.as_bytes());
        assert_eq!(dst.capacity(), cap);
    }
}
