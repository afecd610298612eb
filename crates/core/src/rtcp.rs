//! RTCP-based client liveness.
//!
//! Receivers send RTCP reports roughly every 5 s (RFC 3550 §6.2). A client
//! silent for longer than the TTL is presumed gone, and its sessions are
//! torn down on their next liveness check.
//!
//! Only the fixed header is inspected:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    RC   |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         SSRC of sender                        |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;
use crate::shutdown::{Component, ShutdownCoordinator};

const RTCP_VERSION: u8 = 2;
const RTCP_MIN_LEN: usize = 8;

const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;

/// Liveness classification of one RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpSignal {
    /// SR, RR or SDES: the receiver is still there.
    Alive,
    /// BYE: the receiver is leaving.
    Leaving,
}

/// Classify a datagram by its first RTCP header. Anything that is not a
/// version 2 SR/RR/SDES/BYE yields `None`.
pub fn classify(data: &[u8]) -> Option<RtcpSignal> {
    if data.len() < RTCP_MIN_LEN || data[0] >> 6 != RTCP_VERSION {
        return None;
    }
    match data[1] {
        PT_SR | PT_RR | PT_SDES => Some(RtcpSignal::Alive),
        PT_BYE => Some(RtcpSignal::Leaving),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct LivenessEntry {
    last_seen: Instant,
    signal: RtcpSignal,
}

/// Tracks per-IP RTCP freshness on the control track's RTCP port.
///
/// The listener thread starts on the first [`check`](Self::check) and
/// suspends itself whenever no client is tracked.
pub struct LivenessValidator {
    socket: UdpSocket,
    ttl: Duration,
    clients: Mutex<HashMap<IpAddr, LivenessEntry>>,
    listening: AtomicBool,
    stopped: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl LivenessValidator {
    /// Bind the RTCP listener socket. No thread is started yet.
    pub fn bind(
        addr: SocketAddr,
        ttl: Duration,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(ttl))?;
        tracing::debug!(addr = %socket.local_addr()?, ?ttl, "RTCP validator bound");

        Ok(Self {
            socket,
            ttl,
            clients: Mutex::new(HashMap::new()),
            listening: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            listener: Mutex::new(None),
            coordinator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `ip` is still considered connected.
    ///
    /// Registers the client on first use, with a fresh last-seen time, and
    /// expires every entry silent for longer than the TTL.
    pub fn check(self: &Arc<Self>, ip: IpAddr) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let now = Instant::now();
        let mut clients = self.clients.lock();
        clients.entry(ip).or_insert_with(|| {
            tracing::debug!(client = %ip, "tracking RTCP liveness");
            LivenessEntry {
                last_seen: now,
                signal: RtcpSignal::Alive,
            }
        });

        for (client, entry) in clients.iter_mut() {
            if entry.signal == RtcpSignal::Alive && now.duration_since(entry.last_seen) > self.ttl
            {
                tracing::info!(client = %client, ttl = ?self.ttl, "RTCP silence exceeded TTL");
                entry.signal = RtcpSignal::Leaving;
            }
        }

        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_listener();
        }

        clients
            .get(&ip)
            .is_some_and(|entry| entry.signal == RtcpSignal::Alive)
    }

    /// A new session for `ip` is starting: treat the client as freshly alive,
    /// even if an earlier session from the same address was marked leaving
    /// and has not finished draining yet.
    pub fn register(&self, ip: IpAddr) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let fresh = LivenessEntry {
            last_seen: Instant::now(),
            signal: RtcpSignal::Alive,
        };
        if let Some(previous) = self.clients.lock().insert(ip, fresh)
            && previous.signal == RtcpSignal::Leaving
        {
            tracing::debug!(client = %ip, "client rejoined, liveness reset");
        }
    }

    /// Forget a client whose sessions are gone.
    pub fn disconnect(&self, ip: IpAddr) {
        if self.clients.lock().remove(&ip).is_some() {
            tracing::debug!(client = %ip, "stopped tracking RTCP liveness");
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Stop the listener and report to the shutdown coordinator.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            self.wake_listener();
            if handle.join().is_err() {
                tracing::warn!("RTCP listener thread panicked");
            }
        }
        self.clients.lock().clear();

        tracing::info!("RTCP validator stopped");
        self.coordinator.signal(Component::RtcpValidator);
    }

    // The caller holds the clients lock, which the listener also takes
    // before deciding to suspend, so the handle slot is never raced.
    fn spawn_listener(self: &Arc<Self>) {
        let validator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("rtcp-listener".into())
            .spawn(move || validator.listen());

        match spawned {
            Ok(handle) => {
                tracing::debug!("RTCP listener started");
                *self.listener.lock() = Some(handle);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn RTCP listener");
                self.listening.store(false, Ordering::SeqCst);
            }
        }
    }

    fn wake_listener(&self) {
        let Ok(mut addr) = self.socket.local_addr() else {
            return;
        };
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        if let Err(e) = self.socket.send_to(&[], addr) {
            tracing::trace!(error = %e, "RTCP listener wake-up failed");
        }
    }

    fn listen(&self) {
        let mut buf = [0u8; 1500];

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.record(&buf[..len], from),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    if !self.stopped.load(Ordering::SeqCst) {
                        tracing::warn!(error = %e, "RTCP receive failed");
                    }
                    break;
                }
            }

            let clients = self.clients.lock();
            if clients.is_empty() && !self.stopped.load(Ordering::SeqCst) {
                self.listening.store(false, Ordering::SeqCst);
                tracing::debug!("no tracked clients, RTCP listener suspended");
                return;
            }
        }

        self.listening.store(false, Ordering::SeqCst);
        tracing::debug!("RTCP listener exited");
    }

    fn record(&self, data: &[u8], from: SocketAddr) {
        let Some(signal) = classify(data) else {
            tracing::trace!(peer = %from, len = data.len(), "ignoring non-RTCP datagram");
            return;
        };

        let mut clients = self.clients.lock();
        let Some(entry) = clients.get_mut(&from.ip()) else {
            tracing::trace!(peer = %from, "RTCP from untracked client");
            return;
        };

        if entry.signal == RtcpSignal::Leaving {
            return;
        }
        entry.last_seen = Instant::now();
        entry.signal = signal;
        if signal == RtcpSignal::Leaving {
            tracing::info!(peer = %from, "RTCP BYE received");
        } else {
            tracing::trace!(peer = %from, "RTCP report");
        }
    }
}
