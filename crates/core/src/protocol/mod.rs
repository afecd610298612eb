//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! requests, building responses, routing methods, and assembling SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: one connection walks Init -> Setup -> Playing -> TornDown.
//! - Session header carries a server-assigned ID (RFC 2326 §12.37), minted
//!   once per connection and echoed on every response.
//! - RTP may share the connection, framed with `$` (RFC 2326 §10.12).
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (UDP ports or interleaved channels) |
//! | PLAY | §10.5 | Start media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::{ConnectionState, MethodHandler, SessionCommand};
pub use request::RtspRequest;
pub use response::{RtspResponse, Status};
