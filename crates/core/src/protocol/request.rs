use crate::error::{ParseErrorKind, Result, ServerError};

/// A request head read from the control connection: request line plus
/// headers, up to the blank line. Any body has already been consumed by the
/// connection and is not kept.
#[derive(Debug)]
pub struct RtspRequest {
    /// Upper-cased method name.
    pub method: String,
    pub uri: String,
    pub version: String,
    /// In arrival order, names as sent by the client.
    pub headers: Vec<(String, String)>,
}

/// `name: value` pairs of a request head, stopping at the blank line.
/// Lines without a colon are passed over.
fn header_pairs<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> impl Iterator<Item = (&'a str, &'a str)> {
    lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| match line.split_once(':') {
            Some((name, value)) => Some((name.trim(), value.trim())),
            None => {
                tracing::trace!(line, "ignoring header line without a colon");
                None
            }
        })
}

impl RtspRequest {
    /// Parse a request head.
    ///
    /// Blank lines before the request line are tolerated (clients sometimes
    /// send a stray CRLF after a body). Only a missing or malformed request
    /// line is an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines().skip_while(|line| line.trim().is_empty());

        let Some(request_line) = lines.next() else {
            return Err(ServerError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            });
        };

        let mut fields = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ServerError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        Ok(RtspRequest {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers: header_pairs(lines)
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        })
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find_map(|(key, value)| key.eq_ignore_ascii_case(name).then_some(value.as_str()))
    }

    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Length of the body following the head, 0 when absent or unparsable.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Track index from a `trackID=<n>` component of the request URI.
    pub fn track_id(&self) -> Option<usize> {
        let (_, rest) = self.uri.split_once("trackID=")?;
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    }
}

/// CSeq of a head that failed to parse, so the 400 can still echo it.
pub fn find_cseq(raw: &str) -> Option<&str> {
    let head = raw.lines().skip_while(|line| line.trim().is_empty()).skip(1);
    header_pairs(head)
        .find_map(|(name, value)| name.eq_ignore_ascii_case("CSeq").then_some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_from_player() {
        let raw = "DESCRIBE rtsp://192.168.1.100:8554/live RTSP/1.0\r\n\
                   CSeq: 2\r\n\
                   User-Agent: LibVLC/3.0.20\r\n\
                   Accept: application/sdp\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "DESCRIBE");
        assert_eq!(req.uri, "rtsp://192.168.1.100:8554/live");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("2"));
        assert_eq!(req.get_header("accept"), Some("application/sdp"));
        assert_eq!(req.headers.len(), 3);
        assert_eq!(req.track_id(), None);
    }

    #[test]
    fn setup_names_track_and_transport() {
        let raw = "setup rtsp://cam/live/trackID=1 RTSP/1.0\r\n\
                   CSeq: 4\r\n\
                   Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.track_id(), Some(1));
        assert_eq!(
            req.get_header("TRANSPORT"),
            Some("RTP/AVP/TCP;unicast;interleaved=2-3")
        );
    }

    #[test]
    fn leading_blank_lines_and_body_length() {
        let raw = "\r\n\r\nGET_PARAMETER rtsp://cam/live RTSP/1.0\r\n\
                   CSeq: 11\r\n\
                   Content-Length: 9\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "GET_PARAMETER");
        assert_eq!(req.content_length(), 9);

        let no_body = RtspRequest::parse("PLAY rtsp://cam/live RTSP/1.0\r\nCSeq: 5\r\n\r\n").unwrap();
        assert_eq!(no_body.content_length(), 0);
    }

    #[test]
    fn bad_request_lines() {
        for raw in ["", "\r\n\r\n"] {
            assert!(matches!(
                RtspRequest::parse(raw),
                Err(ServerError::Parse {
                    kind: ParseErrorKind::EmptyRequest
                })
            ));
        }
        for raw in ["PLAY\r\n\r\n", "PLAY rtsp://cam/live\r\n", "PLAY a b c\r\n"] {
            assert!(matches!(
                RtspRequest::parse(raw),
                Err(ServerError::Parse {
                    kind: ParseErrorKind::InvalidRequestLine
                })
            ));
        }
    }

    #[test]
    fn colonless_header_lines_ignored() {
        let raw = "TEARDOWN rtsp://cam/live RTSP/1.0\r\nnot a header\r\nCSeq: 9\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.headers, vec![("CSeq".to_string(), "9".to_string())]);
    }

    #[test]
    fn track_id_variants() {
        let req = |uri: &str| RtspRequest {
            method: "SETUP".into(),
            uri: uri.into(),
            version: "RTSP/1.0".into(),
            headers: vec![],
        };
        assert_eq!(req("rtsp://h:8554/trackID=0").track_id(), Some(0));
        assert_eq!(req("rtsp://h:8554/live/trackID=12/").track_id(), Some(12));
        assert_eq!(req("rtsp://h:8554/live").track_id(), None);
        assert_eq!(req("rtsp://h:8554/trackID=x").track_id(), None);
    }

    #[test]
    fn cseq_recovered_from_unparsable_head() {
        assert_eq!(find_cseq("garbage\r\nCSeq: 7\r\n\r\n"), Some("7"));
        assert_eq!(find_cseq("garbage\r\ncseq:8\r\n"), Some("8"));
        assert_eq!(find_cseq("garbage\r\n\r\nCSeq: 3\r\n"), None);
    }
}
