//! Error types for the camera streaming server.

use std::fmt;

use crate::media::MediaKind;

/// Errors that can occur in the streaming server.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io) for socket/network failures.
/// - **Media**: [`UnknownTrack`](Self::UnknownTrack),
///   [`MissingTrack`](Self::MissingTrack),
///   [`TrackKindMismatch`](Self::TrackKindMismatch),
///   [`AlreadyPrepared`](Self::AlreadyPrepared),
///   [`UnsupportedSampleRate`](Self::UnsupportedSampleRate),
///   [`MissingParameterSet`](Self::MissingParameterSet).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotRunning`](Self::NotRunning), [`ShuttingDown`](Self::ShuttingDown).
///
/// Errors on the streaming hot path (a dead socket, a closed client) are
/// never surfaced through this type; those loops exit and clean up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// The server was never started, or has already been stopped.
    #[error("server not running")]
    NotRunning,

    /// The server is stopping and no longer accepts new sessions.
    #[error("server is shutting down")]
    ShuttingDown,

    /// No track is configured at the requested index.
    #[error("no such track: {0}")]
    UnknownTrack(usize),

    /// No track of this media kind is configured.
    #[error("no {0} track configured")]
    MissingTrack(MediaKind),

    /// Codec parameters do not match the media kind of the track.
    #[error("codec parameters for {given} delivered to a {expected} track")]
    TrackKindMismatch { expected: MediaKind, given: MediaKind },

    /// `on_media_prepared` was called twice for the same track.
    #[error("{0} track already prepared")]
    AlreadyPrepared(MediaKind),

    /// AAC sampling rate has no index in the MPEG-4 sampling frequency table.
    #[error("unsupported AAC sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// An H.265 parameter set (VPS/SPS/PPS) was not found in the codec config.
    #[error("missing H.265 parameter set: {0}")]
    MissingParameterSet(&'static str),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
        }
    }
}

/// Convenience alias for `Result<T, ServerError>`.
pub type Result<T> = std::result::Result<T, ServerError>;
