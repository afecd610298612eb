//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                   ← protocol version
//! o=- 0 0 IN IP4 <origin>               ← origin
//! s=<session-name>                      ← session name
//! c=IN IP4 <client>                     ← connection address
//! t=0 0                                 ← timing (live stream)
//! a=control:*                           ← aggregate control URL
//! m=video 0 RTP/AVP 97                  ← first track's media section
//! a=rtpmap:97 H265/90000
//! a=fmtp:97 sprop-vps=...;sprop-sps=...;sprop-pps=...
//! a=control:trackID=0                   ← per-track control URL
//! m=audio 0 RTP/AVP 96                  ← second track ...
//! ```
//!
//! The media sections come from each track's prepared packetizer; this
//! module only adds the session header and control attributes.

/// Address type token for the `o=`/`c=` lines.
fn addr_type(host: &str) -> &'static str {
    if host.contains(':') { "IP6" } else { "IP4" }
}

/// Assemble a session description from per-track media sections.
///
/// `tracks[n]` becomes `trackID=n`.
pub fn session_description(
    origin_host: &str,
    client_host: &str,
    session_name: &str,
    tracks: &[Vec<String>],
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN {} {}", addr_type(origin_host), origin_host));
    sdp.push(format!("s={}", session_name));
    sdp.push(format!("c=IN {} {}", addr_type(client_host), client_host));
    sdp.push("t=0 0".to_string());
    sdp.push("a=control:*".to_string());

    for (track_id, fragment) in tracks.iter().enumerate() {
        sdp.extend(fragment.iter().cloned());
        sdp.push(format!("a=control:trackID={}", track_id));
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> Vec<String> {
        vec![
            "m=video 0 RTP/AVP 97".into(),
            "a=rtpmap:97 H265/90000".into(),
            "a=fmtp:97 sprop-vps=QAE=;sprop-sps=QgE=;sprop-pps=RAE=".into(),
        ]
    }

    fn audio() -> Vec<String> {
        vec![
            "m=audio 0 RTP/AVP 96".into(),
            "a=rtpmap:96 MPEG4-GENERIC/48000/1".into(),
        ]
    }

    #[test]
    fn session_header_layout() {
        let sdp = session_description("192.168.1.100", "192.168.1.7", "Camera Stream", &[video()]);
        let lines: Vec<&str> = sdp.split("\r\n").collect();
        assert_eq!(
            &lines[..6],
            &[
                "v=0",
                "o=- 0 0 IN IP4 192.168.1.100",
                "s=Camera Stream",
                "c=IN IP4 192.168.1.7",
                "t=0 0",
                "a=control:*",
            ]
        );
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");
    }

    #[test]
    fn control_line_follows_each_fragment() {
        let sdp = session_description("10.0.0.1", "10.0.0.2", "s", &[video(), audio()]);

        let m_video = sdp.find("m=video").unwrap();
        let control0 = sdp.find("a=control:trackID=0").unwrap();
        let m_audio = sdp.find("m=audio").unwrap();
        let control1 = sdp.find("a=control:trackID=1").unwrap();
        assert!(m_video < control0 && control0 < m_audio && m_audio < control1);

        // Session-level control must precede the first media section
        assert!(sdp.find("a=control:*").unwrap() < m_video);

        // rtpmap before fmtp within the section
        assert!(sdp.find("a=rtpmap:97").unwrap() < sdp.find("a=fmtp:97").unwrap());
    }

    #[test]
    fn ipv6_addresses() {
        let sdp = session_description("::1", "::1", "s", &[]);
        assert!(sdp.contains("o=- 0 0 IN IP6 ::1\r\n"));
        assert!(sdp.contains("c=IN IP6 ::1\r\n"));
    }
}
