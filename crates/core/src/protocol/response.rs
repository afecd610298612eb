use std::fmt::{self, Write as _};

/// Value of the `Server` header on every reply.
pub const SERVER_AGENT: &str = "camserver/0.1";

/// The status codes this server answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Malformed request, missing header, or media not ready yet.
    BadRequest,
    /// SETUP after PLAY (RFC 2326 §11.3.6).
    MethodNotValidInThisState,
    /// Transport the server cannot honour, e.g. mixing UDP and TCP tracks.
    UnsupportedTransport,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::MethodNotValidInThisState => 455,
            Status::UnsupportedTransport => 461,
            Status::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::MethodNotValidInThisState => "Method Not Valid in This State",
            Status::UnsupportedTransport => "Unsupported Transport",
            Status::NotImplemented => "Not Implemented",
        }
    }
}

/// A reply on the control connection.
///
/// Built by chaining [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body); the wire text comes from
/// [`serialize`](Self::serialize), which appends `Content-Length` for an
/// SDP body.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn with_status(status: Status) -> Self {
        RtspResponse {
            status_code: status.code(),
            status_text: status.reason(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn bad_request() -> Self {
        Self::with_status(Status::BadRequest)
    }

    pub fn method_not_valid() -> Self {
        Self::with_status(Status::MethodNotValidInThisState)
    }

    pub fn unsupported_transport() -> Self {
        Self::with_status(Status::UnsupportedTransport)
    }

    pub fn not_implemented() -> Self {
        Self::with_status(Status::NotImplemented)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// First header named `name`, ignoring ASCII case.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find_map(|(key, value)| key.eq_ignore_ascii_case(name).then_some(value.as_str()))
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RtspResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut head = String::with_capacity(128);
        write!(head, "RTSP/1.0 {} {}\r\n", self.status_code, self.status_text)?;
        for (name, value) in &self.headers {
            write!(head, "{name}: {value}\r\n")?;
        }
        if let Some(body) = &self.body {
            write!(head, "Content-Length: {}\r\n", body.len())?;
        }
        head.push_str("\r\n");

        f.write_str(&head)?;
        f.write_str(self.body.as_deref().unwrap_or(""))
    }
}
