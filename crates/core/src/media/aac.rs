//! AAC RTP packetizer, MPEG4-GENERIC `mode=AAC-hbr` (RFC 3640).
//!
//! Each access unit travels in exactly one RTP packet:
//!
//! ```text
//! +----------------+----------------+--------------------------+
//! | AU-headers-len | AU-header      | raw AAC frame            |
//! | 16 bits = 0x10 | size:13 idx:3  | (AU-size bytes)          |
//! +----------------+----------------+--------------------------+
//! ```
//!
//! `AU-headers-length` counts bits, so a single 16-bit AU header gives
//! the fixed value `0x0010`. The index is always 0 (one AU per packet).

use super::rtp::RTP_HEADER_SIZE;
use super::{CodecParams, FramePacket, MediaKind, Packetizer};
use crate::error::{Result, ServerError};

const PAYLOAD_TYPE: u8 = 96;
const AU_HEADER_SECTION_SIZE: usize = 4;

/// Largest AU size expressible in the 13-bit `AU-size` field.
const MAX_AU_SIZE: usize = (1 << 13) - 1;

/// MPEG-4 sampling frequency table (ISO/IEC 14496-3 §1.6.3.4), indexed by
/// `samplingFrequencyIndex`.
const SAMPLING_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Default)]
pub struct AacPacketizer {
    sample_rate: u32,
}

impl AacPacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the 16-bit AudioSpecificConfig carried in `config=` of the fmtp line.
///
/// ```text
/// audioObjectType:5 | samplingFrequencyIndex:4 | channelConfiguration:4 | 000
/// ```
pub fn audio_specific_config(profile: u8, sample_rate: u32, channel_count: u8) -> Result<u16> {
    let index = SAMPLING_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .ok_or(ServerError::UnsupportedSampleRate(sample_rate))? as u16;

    Ok(((profile as u16 & 0x1f) << 11) | ((index & 0x0f) << 7) | ((channel_count as u16 & 0x0f) << 3))
}

impl Packetizer for AacPacketizer {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn payload_type(&self) -> u8 {
        PAYLOAD_TYPE
    }

    /// Audio RTP clock runs at the sampling rate.
    fn clock_rate(&self) -> u32 {
        self.sample_rate
    }

    fn prepare(&mut self, params: &CodecParams) -> Result<Vec<String>> {
        let (profile, sample_rate, channel_count) = match params {
            CodecParams::Aac {
                profile,
                sample_rate,
                channel_count,
            } => (*profile, *sample_rate, *channel_count),
            other => {
                return Err(ServerError::TrackKindMismatch {
                    expected: MediaKind::Audio,
                    given: other.kind(),
                });
            }
        };

        let config = audio_specific_config(profile, sample_rate, channel_count)?;
        self.sample_rate = sample_rate;

        tracing::debug!(
            sample_rate,
            channel_count,
            config = format_args!("{:04x}", config),
            "AAC track prepared"
        );

        Ok(vec![
            format!("m=audio 0 RTP/AVP {}", PAYLOAD_TYPE),
            format!(
                "a=rtpmap:{} MPEG4-GENERIC/{}/{}",
                PAYLOAD_TYPE, sample_rate, channel_count
            ),
            format!(
                "a=fmtp:{} streamtype=5; profile-level-id=15; mode=AAC-hbr; config={:04x}; \
                 SizeLength=13; IndexLength=3; IndexDeltaLength=3;",
                PAYLOAD_TYPE, config
            ),
        ])
    }

    fn packetize(
        &mut self,
        access_unit: &[u8],
        rtp_timestamp: u32,
        frame: &mut FramePacket,
    ) -> usize {
        let size = access_unit.len();
        if size == 0 {
            return 0;
        }
        if size > MAX_AU_SIZE {
            tracing::warn!(size, "AAC frame exceeds 13-bit AU-size, dropped");
            return 0;
        }

        let payload = frame.packet_slot(0).fill(
            PAYLOAD_TYPE,
            true,
            rtp_timestamp,
            AU_HEADER_SECTION_SIZE + size,
        );
        payload[0] = 0x00;
        payload[1] = 0x10;
        payload[2] = (size >> 5) as u8;
        payload[3] = ((size << 3) & 0xf8) as u8;
        payload[AU_HEADER_SECTION_SIZE..].copy_from_slice(access_unit);

        tracing::trace!(
            size,
            rtp_len = RTP_HEADER_SIZE + AU_HEADER_SECTION_SIZE + size,
            "AAC frame packetized"
        );
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_for_lc_44100_stereo() {
        // 00010 0100 0010 000
        assert_eq!(audio_specific_config(2, 44100, 2).unwrap(), 0x1210);
    }

    #[test]
    fn config_for_lc_48000_mono() {
        assert_eq!(audio_specific_config(2, 48000, 1).unwrap(), 0x1188);
    }

    #[test]
    fn unknown_sample_rate_rejected() {
        assert!(matches!(
            audio_specific_config(2, 44000, 2),
            Err(ServerError::UnsupportedSampleRate(44000))
        ));
    }

    #[test]
    fn prepare_builds_aac_hbr_fmtp() {
        let mut p = AacPacketizer::new();
        let lines = p.prepare(&CodecParams::aac_lc(44100, 2)).unwrap();
        assert_eq!(lines[0], "m=audio 0 RTP/AVP 96");
        assert_eq!(lines[1], "a=rtpmap:96 MPEG4-GENERIC/44100/2");
        assert!(lines[2].starts_with("a=fmtp:96 streamtype=5;"));
        assert!(lines[2].contains("mode=AAC-hbr"));
        assert!(lines[2].contains("config=1210"));
        assert!(lines[2].contains("SizeLength=13; IndexLength=3; IndexDeltaLength=3;"));
        assert_eq!(p.clock_rate(), 44100);
    }

    #[test]
    fn prepare_rejects_video_params() {
        let mut p = AacPacketizer::new();
        let err = p
            .prepare(&CodecParams::H265 {
                parameter_sets: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::TrackKindMismatch { .. }));
    }

    #[test]
    fn single_packet_with_au_header() {
        let mut p = AacPacketizer::new();
        let mut frame = FramePacket::new();
        let au = vec![0x21u8; 371];
        assert_eq!(p.packetize(&au, 0x01020304, &mut frame), 1);

        let pkt = frame.packet_slot(0);
        assert!(pkt.marker());
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.timestamp(), 0x01020304);
        assert_eq!(pkt.sequence(), 0);
        assert_eq!(pkt.ssrc(), 0);

        let payload = pkt.payload();
        assert_eq!(&payload[..2], &[0x00, 0x10]);
        let au_size = ((payload[2] as usize) << 5) | ((payload[3] as usize) >> 3);
        assert_eq!(au_size, 371);
        assert_eq!(payload[3] & 0x07, 0, "AU-index must be 0");
        assert_eq!(&payload[4..], au.as_slice());
    }

    #[test]
    fn oversized_frame_dropped() {
        let mut p = AacPacketizer::new();
        let mut frame = FramePacket::new();
        assert_eq!(p.packetize(&vec![0u8; MAX_AU_SIZE + 1], 0, &mut frame), 0);
        assert_eq!(p.packetize(&[], 0, &mut frame), 0);
    }
}
