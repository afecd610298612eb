use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::interleaved::{INTERLEAVED_HEADER_SIZE, INTERLEAVED_MAGIC, parse_interleaved};
use super::{InterleavedSink, InterleavedWriter, UdpSink};
use crate::error::Result;
use crate::protocol::{ConnectionState, MethodHandler, RtspRequest, SessionCommand};
use crate::session::{LowerTransport, RtpSession, SessionContext};
use crate::shutdown::Component;

/// Open control connections, so shutdown can unblock their readers.
#[derive(Default)]
pub(crate) struct ConnectionTracker {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl ConnectionTracker {
    fn register(&self, stream: TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, stream);
        id
    }

    fn unregister(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    fn shutdown_all(&self) {
        let streams: Vec<TcpStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        if !streams.is_empty() {
            tracing::debug!(count = streams.len(), "closing control connections");
        }
        for stream in streams {
            if let Err(e) = stream.shutdown(Shutdown::Both)
                && e.kind() != io::ErrorKind::NotConnected
            {
                tracing::debug!(error = %e, "control connection shutdown failed");
            }
        }
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly. On
/// exit every open control connection is shut down and the listener
/// reports to the shutdown coordinator.
pub(crate) fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    running: Arc<AtomicBool>,
    connections: Arc<ConnectionTracker>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let Ok(tracked) = stream.try_clone() else {
                    continue;
                };
                let id = connections.register(tracked);

                let ctx = ctx.clone();
                let running = running.clone();
                let tracker = connections.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rtsp-{peer}"))
                    .spawn(move || {
                        Connection::handle(stream, peer, ctx, &running);
                        tracker.unregister(id);
                    });
                if let Err(e) = spawned {
                    tracing::error!(%peer, error = %e, "failed to spawn connection thread");
                    connections.unregister(id);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }

    drop(listener);
    connections.shutdown_all();
    tracing::info!("RTSP listener closed");
    ctx.coordinator.signal(Component::ControlServer);
}

/// One unit read from the control connection.
enum Message {
    Request(String),
    /// `$`-framed data from the client (interleaved RTCP), already consumed.
    Interleaved { channel: u8, len: usize },
    Closed,
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: Arc<InterleavedWriter>,
    handler: MethodHandler,
    ctx: Arc<SessionContext>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        running: &AtomicBool,
    ) {
        let (local_addr, reader_stream) = match (stream.local_addr(), stream.try_clone()) {
            (Ok(local), Ok(reader)) => (local, reader),
            _ => return,
        };
        let writer = match InterleavedWriter::new(stream, peer_addr) {
            Ok(w) => Arc::new(w),
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler: MethodHandler::new(ctx.clone(), peer_addr, local_addr),
            ctx,
            peer_addr,
        };

        let reason = conn.run(running);
        conn.cleanup();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let request_text = match self.read_message() {
                Ok(Message::Request(text)) => text,
                Ok(Message::Interleaved { channel, len }) => {
                    tracing::trace!(peer = %self.peer_addr, channel, len, "discarded interleaved data");
                    continue;
                }
                Ok(Message::Closed) => return "connection closed by client",
                Err(_) => return "read error",
            };

            if request_text.trim().is_empty() {
                continue;
            }

            let response = match RtspRequest::parse(&request_text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let body_len = request.content_length();
                    if body_len > 0 && self.skip(body_len).is_err() {
                        return "read error";
                    }

                    self.handler.handle(&request)
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    self.handler.reject(&request_text)
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                status = response.status_code,
                "response"
            );

            if self
                .writer
                .write_all(response.serialize().as_bytes())
                .is_err()
            {
                return "write error";
            }

            for command in self.handler.take_commands() {
                self.execute(command);
            }

            if self.handler.state() == ConnectionState::TornDown {
                return "teardown";
            }
        }

        "server shutting down"
    }

    /// Read either an interleaved frame or a request head.
    fn read_message(&mut self) -> io::Result<Message> {
        let first = match self.reader.fill_buf()? {
            [] => return Ok(Message::Closed),
            [b, ..] => *b,
        };

        if first == INTERLEAVED_MAGIC {
            let mut header = [0u8; INTERLEAVED_HEADER_SIZE];
            self.reader.read_exact(&mut header)?;
            let (channel, len) = parse_interleaved(&header).unwrap_or((0, 0));
            self.skip(len)?;
            return Ok(Message::Interleaved { channel, len });
        }

        let mut request_text = String::new();
        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(Message::Closed);
            }
            let line = String::from_utf8_lossy(&line);
            request_text.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }
        Ok(Message::Request(request_text))
    }

    /// Consume and discard `len` bytes.
    fn skip(&mut self, len: usize) -> io::Result<()> {
        let copied = io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
        if copied < len as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    fn execute(&self, command: SessionCommand) {
        let result = match command {
            SessionCommand::StartUdp {
                key,
                client,
                tracks,
            } => self.start_udp(key, client, tracks),
            SessionCommand::StartTcp { key, tracks } => {
                let (ids, channels): (Vec<usize>, Vec<u8>) = tracks.into_iter().unzip();
                let sink = InterleavedSink::new(self.writer.clone(), channels);
                RtpSession::start(
                    &self.ctx,
                    key,
                    self.peer_addr.ip(),
                    LowerTransport::Tcp,
                    Box::new(sink),
                    ids,
                )
            }
            SessionCommand::Stop { key } => {
                if !self.ctx.registry.stop(&key) {
                    tracing::debug!(session = %key, "TEARDOWN for inactive session");
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(peer = %self.peer_addr, error = %e, "failed to start RTP session");
        }
    }

    fn start_udp(&self, key: String, client: IpAddr, tracks: Vec<(usize, u16)>) -> Result<()> {
        let (ids, ports): (Vec<usize>, Vec<u16>) = tracks.into_iter().unzip();
        let sink = UdpSink::bind(client, &ports)?;
        RtpSession::start(&self.ctx, key, client, LowerTransport::Udp, Box::new(sink), ids)
    }

    /// Stop the media session this connection started, if still running.
    fn cleanup(&self) {
        if let Some(key) = self.handler.active_session()
            && self.ctx.registry.stop(key)
        {
            tracing::info!(peer = %self.peer_addr, session = key, "stopped session on disconnect");
        }
        self.writer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn shutdown_all_unblocks_readers_and_forgets_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tracker = ConnectionTracker::default();

        let (_client_a, server_a) = pair(&listener);
        let (client_b, server_b) = pair(&listener);
        tracker.register(server_a.try_clone().unwrap());
        tracker.register(server_b.try_clone().unwrap());
        // Peer already gone: shutting it down again must not disturb the rest
        server_b.shutdown(Shutdown::Both).unwrap();
        drop(client_b);

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            (&server_a).read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));

        tracker.shutdown_all();
        assert!(matches!(reader.join().unwrap(), Ok(0) | Err(_)));
        assert!(tracker.streams.lock().is_empty());

        // Idempotent
        tracker.shutdown_all();
    }

    #[test]
    fn unregister_removes_only_that_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tracker = ConnectionTracker::default();
        let (_c1, s1) = pair(&listener);
        let (_c2, s2) = pair(&listener);
        let a = tracker.register(s1);
        let b = tracker.register(s2);
        assert_ne!(a, b);

        tracker.unregister(a);
        let streams = tracker.streams.lock();
        assert_eq!(streams.len(), 1);
        assert!(streams.contains_key(&b));
    }
}
