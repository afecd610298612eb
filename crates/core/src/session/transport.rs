use std::fmt;

/// Lower transport carrying RTP for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// One datagram socket per track (`RTP/AVP`).
    Udp,
    /// `$`-framed on the RTSP connection (`RTP/AVP/TCP`, RFC 2326 §10.12).
    Tcp,
}

impl fmt::Display for LowerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerTransport::Udp => write!(f, "udp"),
            LowerTransport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Client-side transport request from the RTSP `Transport` header.
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// `interleaved` is `None` when the client leaves channel choice to us.
    Tcp { interleaved: Option<(u8, u8)> },
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// Only the first transport entry of a comma-separated list is
    /// considered. UDP requires `client_port`; a single port implies
    /// `port+1` for RTCP.
    ///
    /// ## Examples
    ///
    /// ```
    /// use camserver::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }
    /// );
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let first = header.split(',').next()?.trim();
        let mut params = first.split(';').map(str::trim);
        let profile = params.next()?;

        let tcp = profile.eq_ignore_ascii_case("RTP/AVP/TCP");
        let mut client_ports = None;
        let mut interleaved = None;

        for param in params {
            if let Some(ports) = param.strip_prefix("client_port=") {
                client_ports = Some(parse_range(ports)?);
            } else if let Some(channels) = param.strip_prefix("interleaved=") {
                let (rtp, rtcp) = parse_range(channels)?;
                interleaved = Some((u8::try_from(rtp).ok()?, u8::try_from(rtcp).ok()?));
            }
        }

        if tcp || interleaved.is_some() {
            return Some(TransportHeader::Tcp { interleaved });
        }
        if !profile.eq_ignore_ascii_case("RTP/AVP") && !profile.eq_ignore_ascii_case("RTP/AVP/UDP")
        {
            return None;
        }

        let (client_rtp_port, client_rtcp_port) = client_ports?;
        Some(TransportHeader::Udp {
            client_rtp_port,
            client_rtcp_port,
        })
    }

    pub fn lower(&self) -> LowerTransport {
        match self {
            TransportHeader::Udp { .. } => LowerTransport::Udp,
            TransportHeader::Tcp { .. } => LowerTransport::Tcp,
        }
    }
}

/// `a-b` or a lone `a` (meaning `a-(a+1)`).
fn parse_range(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((first, second)) => Some((first.trim().parse().ok()?, second.trim().parse().ok()?)),
        None => {
            let first: u16 = value.trim().parse().ok()?;
            Some((first, first.checked_add(1)?))
        }
    }
}

/// Transport negotiated for one track by SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackTransport {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
        /// Advertised server RTP port; RTCP is `server_rtp_port + 1`.
        server_rtp_port: u16,
    },
    Tcp { rtp_channel: u8, rtcp_channel: u8 },
}

impl TrackTransport {
    /// Resolve a client request for track `track_id`.
    pub fn negotiate(request: &TransportHeader, track_id: usize, server_rtp_port: u16) -> Self {
        match *request {
            TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => TrackTransport::Udp {
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
            },
            TransportHeader::Tcp { interleaved } => {
                let (rtp_channel, rtcp_channel) = interleaved.unwrap_or_else(|| {
                    let base = (track_id * 2) as u8;
                    (base, base.wrapping_add(1))
                });
                TrackTransport::Tcp {
                    rtp_channel,
                    rtcp_channel,
                }
            }
        }
    }

    pub fn lower(&self) -> LowerTransport {
        match self {
            TrackTransport::Udp { .. } => LowerTransport::Udp,
            TrackTransport::Tcp { .. } => LowerTransport::Tcp,
        }
    }

    /// `Transport` header value for the SETUP response.
    pub fn response_header(&self) -> String {
        match *self {
            TrackTransport::Udp {
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_rtp_port,
                client_rtcp_port,
                server_rtp_port,
                server_rtp_port.wrapping_add(1)
            ),
            TrackTransport::Tcp {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_channel, rtcp_channel
            ),
        }
    }
}
