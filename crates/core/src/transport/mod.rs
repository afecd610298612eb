//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): RTSP request/response signaling, one thread per
//!   connection.
//! - **UDP** ([`udp`]): RTP datagrams, one ephemeral socket per
//!   (client, track).
//! - **Interleaved** ([`interleaved`]): RTP multiplexed onto the RTSP
//!   connection with `$` framing (RFC 2326 §10.12).
//!
//! Sessions see both media paths through [`PacketSink`].

pub mod interleaved;
pub mod tcp;
pub mod udp;

use std::io;

use crate::media::FramePacket;

pub use interleaved::{InterleavedSink, InterleavedWriter};
pub use udp::UdpSink;

/// Outbound path for the RTP packets of one session.
///
/// `slot` indexes the session's track list. A failed send is fatal for the
/// session: a partly written frame is never resent.
pub trait PacketSink: Send + Sync {
    /// Transmit every packet of `frame`, in order.
    fn send_frame(&self, slot: usize, frame: &FramePacket) -> io::Result<()>;

    /// Release the transport. Idempotent.
    fn close(&self);
}

pub(crate) fn unknown_slot(slot: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("no transport for track slot {slot}"),
    )
}
