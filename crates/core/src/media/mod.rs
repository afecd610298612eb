//! Media codecs and RTP packetization.
//!
//! This module provides the codec-specific [`Packetizer`] trait, its AAC and
//! H.265 implementations, and the [`SharedPacketizer`] that publishes the
//! newest packetized frame to every sender loop.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded access unit is split into one or more RTP packets. Every RTP
//! packet carries a 12-byte fixed header ([`rtp::RtpPacket`]) containing:
//!
//! - **Sequence number** (16-bit, wrapping), owned by each receiving session.
//! - **Timestamp** (32-bit), media clock, shared by every session of a track.
//! - **SSRC** (32-bit), randomly chosen per session and track.
//! - **Marker bit**, set on the last packet of an access unit.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Payload type |
//! |-------|--------|-----|--------------|
//! | AAC (AAC-hbr) | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) | 96 |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | 97 |

pub mod aac;
pub mod frame;
pub mod h265;
pub mod rtp;
pub mod shared;

use std::fmt;

use crate::error::Result;

pub use frame::FramePacket;
pub use shared::{FrameWait, SharedPacketizer};

/// The two media kinds a capture device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Codec parameters delivered once per track by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecParams {
    /// AAC encoder output format.
    Aac {
        /// MPEG-4 audio object type (2 = AAC LC).
        profile: u8,
        sample_rate: u32,
        channel_count: u8,
    },
    /// H.265 codec-config buffer: Annex-B stream holding VPS, SPS and PPS.
    H265 { parameter_sets: Vec<u8> },
}

impl CodecParams {
    /// AAC Low Complexity, the profile hardware encoders produce.
    pub fn aac_lc(sample_rate: u32, channel_count: u8) -> Self {
        Self::Aac {
            profile: 2,
            sample_rate,
            channel_count,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Aac { .. } => MediaKind::Audio,
            Self::H265 { .. } => MediaKind::Video,
        }
    }
}

/// Codec-specific RTP packetizer.
///
/// Each supported codec implements this trait, providing:
/// - **Preparation**: turning codec parameters into SDP media lines.
/// - **Packetization**: writing one access unit into a [`FramePacket`].
///
/// Implementations are driven by a [`SharedPacketizer`], which owns the
/// timestamp progression and publication; a `Packetizer` never sees more
/// than one frame at a time.
pub trait Packetizer: Send {
    fn kind(&self) -> MediaKind;

    /// RTP payload type number (dynamic range 96–127).
    fn payload_type(&self) -> u8;

    /// RTP clock rate in Hz. Only meaningful after [`prepare`](Self::prepare).
    fn clock_rate(&self) -> u32;

    /// Consume codec parameters and return the SDP media section for this
    /// track, one line per entry, starting with the `m=` line.
    ///
    /// The `a=control` line is not included; the server assigns it.
    fn prepare(&mut self, params: &CodecParams) -> Result<Vec<String>>;

    /// Write the RTP packets for one access unit into `frame`, starting at
    /// slot 0, and return how many packets were written.
    ///
    /// Every packet carries `rtp_timestamp`; sequence number and SSRC are
    /// left zeroed. Returning 0 means the access unit produced nothing to
    /// send and `frame` must not be published.
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32, frame: &mut FramePacket)
    -> usize;
}

/// The default packetizer for a media kind: AAC for audio, H.265 for video.
pub fn packetizer_for(kind: MediaKind) -> Box<dyn Packetizer> {
    match kind {
        MediaKind::Audio => Box::new(aac::AacPacketizer::new()),
        MediaKind::Video => Box::new(h265::H265Packetizer::new()),
    }
}
