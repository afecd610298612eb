use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::{PacketSink, unknown_slot};
use crate::error::Result;
use crate::media::FramePacket;

struct UdpTarget {
    socket: UdpSocket,
    dest: SocketAddr,
}

/// UDP transport for outbound RTP packet delivery.
///
/// Binds one ephemeral socket per track and sends every packet as one
/// datagram to `client_ip:client_rtp_port`. The sockets stay unconnected
/// so ICMP port-unreachable replies from a vanished client do not turn
/// into send errors; client loss is detected through RTCP instead.
///
/// The datagrams therefore leave from an OS-assigned source port, not from
/// the `server_port` advertised in the SETUP reply. That advertised pair is
/// `TrackConfig::server_rtp_port` and `+1`; only the RTCP port of the first
/// track is actually bound, by the liveness validator. See
/// [`source_ports`](Self::source_ports).
pub struct UdpSink {
    targets: Vec<UdpTarget>,
}

impl UdpSink {
    /// Bind one socket per entry of `client_rtp_ports`.
    pub fn bind(client_ip: IpAddr, client_rtp_ports: &[u16]) -> Result<Self> {
        let local: IpAddr = match client_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let targets = client_rtp_ports
            .iter()
            .map(|&port| -> Result<UdpTarget> {
                let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
                Ok(UdpTarget {
                    socket,
                    dest: SocketAddr::new(client_ip, port),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { targets })
    }

    /// Local port each slot sends from, assigned by the OS at bind time.
    pub fn source_ports(&self) -> Vec<u16> {
        self.targets
            .iter()
            .filter_map(|t| t.socket.local_addr().ok())
            .map(|addr| addr.port())
            .collect()
    }

    /// Destination address of each slot.
    pub fn destinations(&self) -> Vec<SocketAddr> {
        self.targets.iter().map(|t| t.dest).collect()
    }
}

impl PacketSink for UdpSink {
    fn send_frame(&self, slot: usize, frame: &FramePacket) -> io::Result<()> {
        let target = self.targets.get(slot).ok_or_else(|| unknown_slot(slot))?;
        for packet in frame.packets() {
            target.socket.send_to(packet.as_bytes(), target.dest)?;
        }
        Ok(())
    }

    // Sockets are released when the session drops.
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sends_each_packet_as_datagram() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = client.local_addr().unwrap().port();

        let sink = UdpSink::bind("127.0.0.1".parse().unwrap(), &[port]).unwrap();
        assert_eq!(sink.destinations(), vec![client.local_addr().unwrap()]);

        let mut frame = FramePacket::new();
        frame.packet_slot(0).fill(97, false, 1, 3).copy_from_slice(b"abc");
        frame.packet_slot(1).fill(97, true, 1, 2).copy_from_slice(b"de");
        frame.publish(1, 2, 0);
        sink.send_frame(0, &frame).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[12..n], b"abc");
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[12..n], b"de");
        assert_eq!(buf[1] & 0x80, 0x80);
    }

    #[test]
    fn sends_from_ephemeral_source_port() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = client.local_addr().unwrap().port();

        let a = UdpSink::bind("127.0.0.1".parse().unwrap(), &[port]).unwrap();
        let b = UdpSink::bind("127.0.0.1".parse().unwrap(), &[port]).unwrap();
        let (pa, pb) = (a.source_ports()[0], b.source_ports()[0]);
        assert_ne!(pa, 0);
        assert_ne!(pa, pb, "concurrent sessions never share a local port");

        let mut frame = FramePacket::new();
        frame.packet_slot(0).fill(96, true, 1, 1).copy_from_slice(b"x");
        frame.publish(1, 1, 0);
        a.send_frame(0, &frame).unwrap();

        let mut buf = [0u8; 64];
        let (_, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(from.port(), pa);
    }

    #[test]
    fn unknown_slot_is_error() {
        let sink = UdpSink::bind("127.0.0.1".parse().unwrap(), &[9]).unwrap();
        let err = sink.send_frame(1, &FramePacket::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
