//! Live RTSP/RTP streaming for an embedded camera.
//!
//! An encoder pushes access units into a [`Server`] through the
//! [`CaptureSink`] boundary. Each track packetizes once into a shared
//! "latest frame" slot; every connected client runs its own sender threads
//! that copy the newest frame, stamp their own sequence numbers and SSRC,
//! and send over UDP or interleaved on the RTSP connection.

pub mod error;
pub mod media;
pub mod protocol;
pub mod rtcp;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod transport;

pub use error::{Result, ServerError};
pub use media::{CodecParams, MediaKind, Packetizer};
pub use server::{CaptureSink, FrameFlags, Server, ServerConfig, TrackConfig, Viewer};
