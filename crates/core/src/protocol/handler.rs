use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::protocol::request::{RtspRequest, find_cseq};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::session::{
    DEFAULT_SESSION_TIMEOUT_SECS, LowerTransport, SessionContext, TrackTransport, TransportHeader,
};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";

/// Per-connection RTSP state (RFC 2326 §A.1, without PAUSE).
///
/// ```text
/// Init ──SETUP──▶ Setup ──SETUP──▶ Setup ──PLAY──▶ Playing ──TEARDOWN──▶ TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Setup,
    Playing,
    TornDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "init",
            ConnectionState::Setup => "setup",
            ConnectionState::Playing => "playing",
            ConnectionState::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Session work requested by a method, run by the connection after the
/// response has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Stream to `client`, one `(track id, client RTP port)` per track.
    StartUdp {
        key: String,
        client: IpAddr,
        tracks: Vec<(usize, u16)>,
    },
    /// Stream over the RTSP connection, one `(track id, RTP channel)` per track.
    StartTcp { key: String, tracks: Vec<(usize, u8)> },
    Stop { key: String },
}

/// Handles RTSP method requests for a single TCP connection.
///
/// One session identifier is minted per connection and echoed in every
/// response. Media sessions are never started from here directly; PLAY and
/// TEARDOWN queue a [`SessionCommand`] instead so that no RTP reaches the
/// client before the PLAY response does.
pub struct MethodHandler {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    local: SocketAddr,
    session_id: String,
    state: ConnectionState,
    negotiated: Vec<Option<TrackTransport>>,
    active_session: Option<String>,
    commands: Vec<SessionCommand>,
}

impl MethodHandler {
    pub(crate) fn new(ctx: Arc<SessionContext>, peer: SocketAddr, local: SocketAddr) -> Self {
        let track_count = ctx.tracks.len();
        MethodHandler {
            ctx,
            peer,
            local,
            session_id: format!("{:016X}", rand::random::<u64>()),
            state: ConnectionState::Init,
            negotiated: vec![None; track_count],
            active_session: None,
            commands: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Registry key of the media session started by this connection.
    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Drain commands queued by the last request.
    pub fn take_commands(&mut self) -> Vec<SessionCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let response = match request.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(&request.uri),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(),
            "TEARDOWN" => self.handle_teardown(),
            "GET_PARAMETER" => self.handle_get_parameter(),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented()
            }
        };

        self.finish(response, cseq)
    }

    /// Response to input that did not parse as a request.
    pub fn reject(&self, raw: &str) -> RtspResponse {
        self.finish(RtspResponse::bad_request(), find_cseq(raw).unwrap_or("0"))
    }

    fn finish(&self, response: RtspResponse, cseq: &str) -> RtspResponse {
        response.add_header("CSeq", cseq).add_header(
            "Session",
            &format!("{};timeout={}", self.session_id, DEFAULT_SESSION_TIMEOUT_SECS),
        )
    }

    fn handle_options(&self) -> RtspResponse {
        tracing::debug!(peer = %self.peer, "OPTIONS");
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    /// Origin host for SDP: the configured public host, else the address the
    /// client reached us on.
    fn origin_host(&self) -> String {
        match &self.ctx.config.public_host {
            Some(host) => host.clone(),
            None => self.local.ip().to_string(),
        }
    }

    /// Every track has received its codec parameters, so the session
    /// description is complete.
    fn media_ready(&self) -> bool {
        self.ctx.tracks.iter().all(|t| t.is_prepared())
    }

    fn handle_describe(&self, uri: &str) -> RtspResponse {
        tracing::debug!(peer = %self.peer, uri, "DESCRIBE");

        let fragments: Option<Vec<Vec<String>>> = if self.media_ready() {
            self.ctx.tracks.iter().map(|t| t.sdp_fragment()).collect()
        } else {
            None
        };
        let Some(fragments) = fragments else {
            tracing::warn!(peer = %self.peer, "DESCRIBE before every track is prepared");
            return RtspResponse::bad_request();
        };

        let body = sdp::session_description(
            &self.origin_host(),
            &self.peer.ip().to_string(),
            &self.ctx.config.sdp_session_name,
            &fragments,
        );

        let base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{}/", uri)
        };

        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(body)
    }

    /// Lower transport shared by every track negotiated so far.
    fn lower_transport(&self) -> Option<LowerTransport> {
        self.negotiated.iter().flatten().map(|t| t.lower()).next()
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        if self.state == ConnectionState::Playing {
            tracing::warn!(peer = %self.peer, "SETUP while playing");
            return RtspResponse::method_not_valid();
        }
        if !self.media_ready() {
            tracing::warn!(peer = %self.peer, "SETUP before every track is prepared");
            return RtspResponse::bad_request();
        }

        let Some(track_id) = request
            .track_id()
            .filter(|&id| id < self.ctx.tracks.len())
        else {
            tracing::warn!(peer = %self.peer, uri = %request.uri, "SETUP with missing or unknown trackID");
            return RtspResponse::bad_request();
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(peer = %self.peer, "SETUP missing Transport header");
            return RtspResponse::bad_request();
        };

        let Some(requested) = TransportHeader::parse(transport_header) else {
            tracing::warn!(peer = %self.peer, transport_header, "SETUP invalid Transport header");
            return RtspResponse::bad_request();
        };

        if let Some(existing) = self.lower_transport()
            && existing != requested.lower()
        {
            tracing::warn!(
                peer = %self.peer,
                %existing,
                requested = %requested.lower(),
                "SETUP mixes lower transports"
            );
            return RtspResponse::unsupported_transport();
        }

        let server_rtp_port = self.ctx.config.tracks[track_id].server_rtp_port;
        let negotiated = TrackTransport::negotiate(&requested, track_id, server_rtp_port);
        self.negotiated[track_id] = Some(negotiated);
        self.state = ConnectionState::Setup;

        tracing::debug!(
            peer = %self.peer,
            track_id,
            transport = %negotiated.response_header(),
            "track transport negotiated"
        );

        RtspResponse::ok().add_header("Transport", &negotiated.response_header())
    }

    fn handle_play(&mut self) -> RtspResponse {
        if self.state == ConnectionState::Playing {
            return RtspResponse::ok().add_header("Range", "npt=0.000-");
        }
        if !self.media_ready() {
            tracing::warn!(peer = %self.peer, "PLAY before every track is prepared");
            return RtspResponse::bad_request();
        }

        let negotiated: Option<Vec<TrackTransport>> = self.negotiated.iter().copied().collect();
        let Some(negotiated) = negotiated else {
            tracing::warn!(peer = %self.peer, "PLAY before every track is set up");
            return RtspResponse::bad_request();
        };

        let command = if negotiated[0].lower() == LowerTransport::Udp {
            let tracks: Vec<(usize, u16)> = negotiated
                .iter()
                .enumerate()
                .filter_map(|(id, t)| match *t {
                    TrackTransport::Udp {
                        client_rtp_port, ..
                    } => Some((id, client_rtp_port)),
                    TrackTransport::Tcp { .. } => None,
                })
                .collect();
            let ports: Vec<String> = tracks.iter().map(|(_, p)| p.to_string()).collect();
            SessionCommand::StartUdp {
                key: format!("{}:{}", self.peer.ip(), ports.join("-")),
                client: self.peer.ip(),
                tracks,
            }
        } else {
            let tracks: Vec<(usize, u8)> = negotiated
                .iter()
                .enumerate()
                .filter_map(|(id, t)| match *t {
                    TrackTransport::Tcp { rtp_channel, .. } => Some((id, rtp_channel)),
                    TrackTransport::Udp { .. } => None,
                })
                .collect();
            SessionCommand::StartTcp {
                key: format!("tcp:{}", self.session_id),
                tracks,
            }
        };

        let key = match &command {
            SessionCommand::StartUdp { key, .. }
            | SessionCommand::StartTcp { key, .. }
            | SessionCommand::Stop { key } => key.clone(),
        };
        tracing::info!(peer = %self.peer, session = %key, "PLAY");

        self.active_session = Some(key);
        self.commands.push(command);
        self.state = ConnectionState::Playing;

        RtspResponse::ok().add_header("Range", "npt=0.000-")
    }

    fn handle_teardown(&mut self) -> RtspResponse {
        if let Some(key) = self.active_session.take() {
            tracing::info!(peer = %self.peer, session = %key, "TEARDOWN");
            self.commands.push(SessionCommand::Stop { key });
        }
        self.negotiated.iter_mut().for_each(|t| *t = None);
        self.state = ConnectionState::TornDown;
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self) -> RtspResponse {
        tracing::trace!(peer = %self.peer, "GET_PARAMETER keepalive");
        RtspResponse::ok()
    }
}
