//! RTP over the RTSP connection (RFC 2326 §10.12).
//!
//! Each RTP packet is prefixed with a 4-byte frame header:
//!
//! ```text
//! +-----+---------+----------------+
//! | '$' | channel | length (16 BE) |  payload...
//! +-----+---------+----------------+
//! ```
//!
//! RTSP responses and every track's RTP share one stream, so all writes
//! go through [`InterleavedWriter`], which holds the stream lock for the
//! whole header and payload.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{PacketSink, unknown_slot};
use crate::media::FramePacket;

/// Leading byte of an interleaved frame.
pub const INTERLEAVED_MAGIC: u8 = b'$';

/// Size of the `$`, channel, length header.
pub const INTERLEAVED_HEADER_SIZE: usize = 4;

/// Build the frame header for a `len`-byte payload on `channel`.
pub fn frame_header(channel: u8, len: u16) -> [u8; INTERLEAVED_HEADER_SIZE] {
    let [hi, lo] = len.to_be_bytes();
    [INTERLEAVED_MAGIC, channel, hi, lo]
}

/// Parse a frame header into `(channel, payload length)`.
pub fn parse_interleaved(header: &[u8]) -> Option<(u8, usize)> {
    match header {
        [INTERLEAVED_MAGIC, channel, hi, lo, ..] => {
            Some((*channel, u16::from_be_bytes([*hi, *lo]) as usize))
        }
        _ => None,
    }
}

/// Serialized writer over the RTSP connection.
pub struct InterleavedWriter {
    stream: Mutex<TcpStream>,
    // Second handle for shutdown, so a writer blocked on a full socket
    // buffer cannot hold it off.
    control: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl InterleavedWriter {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            control: stream.try_clone()?,
            stream: Mutex::new(stream),
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write raw bytes (an RTSP response).
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Write one `$`-framed packet. Header and payload go out under a single
    /// lock hold so another track can never split them.
    pub fn write_frame(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "interleaved payload exceeds 65535 bytes",
            )
        })?;

        let mut stream = self.stream.lock();
        stream.write_all(&frame_header(channel, len))?;
        stream.write_all(payload)
    }

    /// Shut the connection down in both directions, unblocking its reader
    /// and any blocked writer.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer, error = %e, "shutdown on closed stream");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Interleaved RTP for one session. `channels[slot]` is the RTP channel of
/// the session's `slot`-th track.
pub struct InterleavedSink {
    writer: Arc<InterleavedWriter>,
    channels: Vec<u8>,
}

impl InterleavedSink {
    pub fn new(writer: Arc<InterleavedWriter>, channels: Vec<u8>) -> Self {
        Self { writer, channels }
    }
}

impl PacketSink for InterleavedSink {
    fn send_frame(&self, slot: usize, frame: &FramePacket) -> io::Result<()> {
        let channel = *self.channels.get(slot).ok_or_else(|| unknown_slot(slot))?;
        for packet in frame.packets() {
            self.writer.write_frame(channel, packet.as_bytes())?;
        }
        Ok(())
    }

    fn close(&self) {
        self.writer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (Arc<InterleavedWriter>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Arc::new(InterleavedWriter::new(server, peer).unwrap()), client)
    }

    #[test]
    fn header_round_trip() {
        let header = frame_header(3, 1212);
        assert_eq!(header, [b'$', 3, 0x04, 0xbc]);
        assert_eq!(parse_interleaved(&header), Some((3, 1212)));
        assert_eq!(parse_interleaved(b"RTSP"), None);
        assert_eq!(parse_interleaved(b"$"), None);
    }

    #[test]
    fn concurrent_frames_never_interleave() {
        let (writer, mut client) = pair();
        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            received
        });
        let senders: Vec<_> = [0u8, 2u8]
            .into_iter()
            .map(|channel| {
                let writer = writer.clone();
                thread::spawn(move || {
                    let payload = vec![channel; 900];
                    for _ in 0..200 {
                        writer.write_frame(channel, &payload).unwrap();
                    }
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }
        writer.shutdown();
        let received = reader.join().unwrap();

        let mut frames = 0;
        let mut rest = &received[..];
        while !rest.is_empty() {
            let (channel, len) = parse_interleaved(rest).expect("frame header");
            let payload = &rest[INTERLEAVED_HEADER_SIZE..INTERLEAVED_HEADER_SIZE + len];
            assert!(payload.iter().all(|&b| b == channel));
            rest = &rest[INTERLEAVED_HEADER_SIZE + len..];
            frames += 1;
        }
        assert_eq!(frames, 400);
    }

    #[test]
    fn sink_maps_slots_to_channels() {
        let (writer, mut client) = pair();
        let sink = InterleavedSink::new(writer.clone(), vec![4]);

        let mut frame = FramePacket::new();
        frame.packet_slot(0).fill(96, true, 7, 2).copy_from_slice(b"hi");
        frame.publish(7, 1, 0);
        sink.send_frame(0, &frame).unwrap();
        assert!(sink.send_frame(1, &frame).is_err());
        sink.close();
        assert!(writer.is_closed());

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(parse_interleaved(&received), Some((4, 14)));
        assert_eq!(&received[16..], b"hi");
    }
}
