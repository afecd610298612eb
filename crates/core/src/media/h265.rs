use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::rtp::MAX_PAYLOAD_SIZE;
use super::{CodecParams, FramePacket, MediaKind, Packetizer};
use crate::error::{Result, ServerError};

const PAYLOAD_TYPE: u8 = 97;
const CLOCK_RATE: u32 = 90000;

/// H.265 NAL unit header length (RFC 7798 §1.1.4).
const NAL_HEADER_SIZE: usize = 2;
/// PayloadHdr type for Fragmentation Units (RFC 7798 §4.4.3).
const FU_TYPE: u8 = 49;
/// PayloadHdr + FU header.
const FU_OVERHEAD: usize = NAL_HEADER_SIZE + 1;

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

/// H.265 RTP packetizer (RFC 7798).
///
/// Converts H.265 Annex B access units into RTP packets. Two packet types
/// from RFC 7798 are used:
///
/// - **Single NAL Unit** (§4.4.1): NAL units of at most
///   [`MAX_PAYLOAD_SIZE`] bytes are sent as-is, 2-byte NAL header included.
///
/// - **Fragmentation Unit** (§4.4.3): larger NAL units are split. The
///   original NAL header is replaced by a PayloadHdr with type 49, followed
///   by a 1-byte FU header:
///
///   ```text
///   PayloadHdr:  [F|Type=49|LayerId|TID]   (2 bytes)
///   FU header:   [S|E|FuType]              (1 byte)
///   Fragment:    [...]                     (up to MAX_PAYLOAD_SIZE - 3 bytes)
///   ```
///
///   - **S** (start): set on the first fragment only
///   - **E** (end): set on the last fragment only
///   - **FuType**: the original NAL unit type
///
/// ## SDP attributes (RFC 7798 §7.1)
///
/// VPS, SPS and PPS are taken from the encoder's codec-config buffer and
/// announced base64-encoded:
/// - `a=rtpmap:97 H265/90000`
/// - `a=fmtp:97 sprop-vps=...;sprop-sps=...;sprop-pps=...`
///
/// ## Marker bit
///
/// Set on the last RTP packet of the access unit.
#[derive(Debug, Default)]
pub struct H265Packetizer;

impl H265Packetizer {
    pub fn new() -> Self {
        Self
    }
}

/// NAL unit type carried in the first byte of the 2-byte NAL header.
pub fn nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3f
}

/// Extract NAL units from an Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL so that boundaries
/// between adjacent NALs are correct when 3-byte and 4-byte start
/// codes are mixed.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// Number of RTP packets a NAL unit of `len` bytes produces.
fn packet_count(len: usize) -> usize {
    if len <= MAX_PAYLOAD_SIZE {
        1
    } else {
        (len - NAL_HEADER_SIZE).div_ceil(MAX_PAYLOAD_SIZE - FU_OVERHEAD)
    }
}

impl Packetizer for H265Packetizer {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn payload_type(&self) -> u8 {
        PAYLOAD_TYPE
    }

    /// 90 kHz clock rate per RFC 7798 §7.1.
    fn clock_rate(&self) -> u32 {
        CLOCK_RATE
    }

    fn prepare(&mut self, params: &CodecParams) -> Result<Vec<String>> {
        let CodecParams::H265 { parameter_sets } = params else {
            return Err(ServerError::TrackKindMismatch {
                expected: MediaKind::Video,
                given: params.kind(),
            });
        };

        let (mut vps, mut sps, mut pps) = (None, None, None);
        for nal in extract_nal_units(parameter_sets) {
            if nal.len() < NAL_HEADER_SIZE {
                continue;
            }
            match nal_type(nal[0]) {
                NAL_VPS => vps = Some(BASE64_STANDARD.encode(nal)),
                NAL_SPS => sps = Some(BASE64_STANDARD.encode(nal)),
                NAL_PPS => pps = Some(BASE64_STANDARD.encode(nal)),
                _ => {}
            }
        }

        let vps = vps.ok_or(ServerError::MissingParameterSet("VPS"))?;
        let sps = sps.ok_or(ServerError::MissingParameterSet("SPS"))?;
        let pps = pps.ok_or(ServerError::MissingParameterSet("PPS"))?;

        tracing::debug!(
            vps_len = vps.len(),
            sps_len = sps.len(),
            pps_len = pps.len(),
            "H.265 parameter sets captured"
        );

        Ok(vec![
            format!("m=video 0 RTP/AVP {}", PAYLOAD_TYPE),
            format!("a=rtpmap:{} H265/{}", PAYLOAD_TYPE, CLOCK_RATE),
            format!(
                "a=fmtp:{} sprop-vps={};sprop-sps={};sprop-pps={}",
                PAYLOAD_TYPE, vps, sps, pps
            ),
        ])
    }

    fn packetize(
        &mut self,
        access_unit: &[u8],
        rtp_timestamp: u32,
        frame: &mut FramePacket,
    ) -> usize {
        let nal_units: Vec<&[u8]> = extract_nal_units(access_unit)
            .into_iter()
            .filter(|nal| nal.len() >= NAL_HEADER_SIZE)
            .collect();

        let total: usize = nal_units.iter().map(|nal| packet_count(nal.len())).sum();
        let mut count = 0usize;

        for nal in &nal_units {
            if nal.len() <= MAX_PAYLOAD_SIZE {
                count += 1;
                let marker = count == total;
                frame
                    .packet_slot(count - 1)
                    .fill(PAYLOAD_TYPE, marker, rtp_timestamp, nal.len())
                    .copy_from_slice(nal);
                continue;
            }

            let fu_type = nal_type(nal[0]);
            // Keep F, LayerId and TID; replace the 6 type bits with 49.
            let payload_hdr = [(nal[0] & 0x81) | (FU_TYPE << 1), nal[1]];
            let body = &nal[NAL_HEADER_SIZE..];
            let max_fragment = MAX_PAYLOAD_SIZE - FU_OVERHEAD;

            let mut offset = 0usize;
            while offset < body.len() {
                let end = (offset + max_fragment).min(body.len());
                let start_bit = if offset == 0 { 0x80 } else { 0x00 };
                let end_bit = if end == body.len() { 0x40 } else { 0x00 };
                let chunk = &body[offset..end];

                count += 1;
                let marker = count == total;
                let payload = frame.packet_slot(count - 1).fill(
                    PAYLOAD_TYPE,
                    marker,
                    rtp_timestamp,
                    FU_OVERHEAD + chunk.len(),
                );
                payload[..NAL_HEADER_SIZE].copy_from_slice(&payload_hdr);
                payload[NAL_HEADER_SIZE] = start_bit | end_bit | fu_type;
                payload[FU_OVERHEAD..].copy_from_slice(chunk);

                offset = end;
            }

            tracing::trace!(
                nal_type = fu_type,
                nal_size = nal.len(),
                fragments = packet_count(nal.len()),
                "FU fragmented NAL unit"
            );
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = count,
            frame_bytes = access_unit.len(),
            ts = rtp_timestamp,
            "frame packetized"
        );

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VPS: [u8; 5] = [0x40, 0x01, 0x0c, 0x01, 0xff];
    const SPS: [u8; 5] = [0x42, 0x01, 0x01, 0x01, 0x60];
    const PPS: [u8; 4] = [0x44, 0x01, 0xc1, 0x72];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    /// IDR_W_RADL (type 19) slice of the given total length.
    fn idr_nal(len: usize) -> Vec<u8> {
        let mut nal = vec![19 << 1, 0x01];
        nal.extend((0..len - 2).map(|i| (i % 251) as u8));
        nal
    }

    #[test]
    fn nal_type_from_header_byte() {
        assert_eq!(nal_type(VPS[0]), 32);
        assert_eq!(nal_type(SPS[0]), 33);
        assert_eq!(nal_type(PPS[0]), 34);
        assert_eq!(nal_type(idr_nal(4)[0]), 19);
        // F bit and LayerId high bit do not leak into the type
        assert_eq!(nal_type(0x80 | (1 << 1) | 0x01), 1);
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x26, 0x01, 0xAA];
        assert_eq!(extract_nal_units(&data), vec![&[0x26, 0x01, 0xAA][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x40, 0x01];
        data.extend_from_slice(&[0, 0, 1, 0x42, 0x01]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x40, 0x01]);
        assert_eq!(nals[1], &[0x42, 0x01]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
        assert!(extract_nal_units(&[]).is_empty());
    }

    // --- SDP ---

    #[test]
    fn prepare_emits_sprop_sets() {
        let mut p = H265Packetizer::new();
        let csd = annex_b(&[&VPS, &SPS, &PPS]);
        let lines = p
            .prepare(&CodecParams::H265 {
                parameter_sets: csd,
            })
            .unwrap();
        assert_eq!(lines[0], "m=video 0 RTP/AVP 97");
        assert_eq!(lines[1], "a=rtpmap:97 H265/90000");
        assert_eq!(
            lines[2],
            format!(
                "a=fmtp:97 sprop-vps={};sprop-sps={};sprop-pps={}",
                BASE64_STANDARD.encode(VPS),
                BASE64_STANDARD.encode(SPS),
                BASE64_STANDARD.encode(PPS)
            )
        );
    }

    #[test]
    fn prepare_requires_all_parameter_sets() {
        let mut p = H265Packetizer::new();
        let err = p
            .prepare(&CodecParams::H265 {
                parameter_sets: annex_b(&[&VPS, &SPS]),
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::MissingParameterSet("PPS")));
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = H265Packetizer::new();
        let mut frame = FramePacket::new();
        let nal = idr_nal(100);
        let n = p.packetize(&annex_b(&[&nal]), 42, &mut frame);
        assert_eq!(n, 1);
        let pkt = frame.packet_slot(0);
        assert_eq!(pkt.payload(), nal.as_slice());
        assert!(pkt.marker());
        assert_eq!(pkt.timestamp(), 42);
        assert_eq!(pkt.payload_type(), 97);
    }

    #[test]
    fn nal_at_budget_is_not_fragmented() {
        let mut p = H265Packetizer::new();
        let mut frame = FramePacket::new();
        let n = p.packetize(&annex_b(&[&idr_nal(MAX_PAYLOAD_SIZE)]), 0, &mut frame);
        assert_eq!(n, 1);
    }

    #[test]
    fn large_nal_fragments_and_reassembles() {
        let mut p = H265Packetizer::new();
        let mut frame = FramePacket::new();
        let nal = idr_nal(5000);
        let n = p.packetize(&annex_b(&[&nal]), 7, &mut frame);
        frame.publish(7, n, 0);
        let packets = frame.packets();
        assert_eq!(packets.len(), packet_count(nal.len()));
        assert!(packets.len() > 1);

        let mut starts = 0;
        let mut ends = 0;
        let mut rebuilt = Vec::new();
        for pkt in packets {
            let payload = pkt.payload();
            assert!(payload.len() <= MAX_PAYLOAD_SIZE);
            assert_eq!((payload[0] >> 1) & 0x3f, FU_TYPE);
            let fu = payload[2];
            assert_eq!(fu & 0x3f, 19, "FuType carries original NAL type");
            if fu & 0x80 != 0 {
                starts += 1;
                // Rebuild the original NAL header from PayloadHdr + FuType
                rebuilt.push((payload[0] & 0x81) | ((fu & 0x3f) << 1));
                rebuilt.push(payload[1]);
            }
            if fu & 0x40 != 0 {
                ends += 1;
            }
            rebuilt.extend_from_slice(&payload[3..]);
        }
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
        assert_eq!(packets[0].payload()[2] & 0x80, 0x80);
        assert_eq!(packets.last().unwrap().payload()[2] & 0x40, 0x40);
        assert_eq!(rebuilt, nal);

        // Marker only on the final packet
        let markers: Vec<bool> = packets.iter().map(|p| p.marker()).collect();
        assert!(markers[..markers.len() - 1].iter().all(|m| !m));
        assert!(markers[markers.len() - 1]);
    }

    #[test]
    fn marker_on_last_packet_of_multi_nal_access_unit() {
        let mut p = H265Packetizer::new();
        let mut frame = FramePacket::new();
        let au = annex_b(&[&VPS, &SPS, &PPS, &idr_nal(3000)]);
        let n = p.packetize(&au, 0, &mut frame);
        frame.publish(0, n, 0);
        assert_eq!(n, 3 + packet_count(3000));
        let packets = frame.packets();
        assert_eq!(packets[0].payload(), &VPS);
        assert!(!packets[0].marker());
        assert!(packets[n - 1].marker());
        assert_eq!(packets.iter().filter(|p| p.marker()).count(), 1);
    }

    #[test]
    fn truncated_nal_skipped() {
        let mut p = H265Packetizer::new();
        let mut frame = FramePacket::new();
        assert_eq!(p.packetize(&[0, 0, 1, 0x26], 0, &mut frame), 0);
    }
}
