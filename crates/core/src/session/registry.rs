use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use super::RtpSession;
use crate::error::{Result, ServerError};
use crate::shutdown::ShutdownCoordinator;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<RtpSession>>,
    closing: bool,
}

/// Thread-safe registry of active RTP sessions.
///
/// Keys are `ip:port-port` for UDP sessions and `tcp:<session id>` for
/// interleaved ones. Every successful insert is counted by the shutdown
/// coordinator; the session reports its own close.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl SessionRegistry {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        SessionRegistry {
            inner: Arc::new(RwLock::new(Inner::default())),
            coordinator,
        }
    }

    /// Register a session. Returns `Ok(false)` if the key is taken.
    pub fn insert(&self, session: Arc<RtpSession>) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.closing {
            return Err(ServerError::ShuttingDown);
        }
        if inner.sessions.contains_key(session.key()) {
            return Ok(false);
        }

        self.coordinator.session_opened();
        inner.sessions.insert(session.key().to_string(), session);
        tracing::debug!(total_sessions = inner.sessions.len(), "session registered");
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<Arc<RtpSession>> {
        self.inner.read().sessions.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RtpSession>> {
        let mut inner = self.inner.write();
        let removed = inner.sessions.remove(key);
        if removed.is_some() {
            tracing::debug!(session = key, total_sessions = inner.sessions.len(), "session removed");
        }
        removed
    }

    /// Stop the session registered under `key`, if any.
    pub fn stop(&self, key: &str) -> bool {
        match self.get(key) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Whether any remaining session streams to `ip`.
    pub fn has_client(&self, ip: IpAddr) -> bool {
        self.inner.read().sessions.values().any(|s| s.peer() == ip)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<Arc<RtpSession>> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Refuse new sessions and stop every existing one.
    pub fn stop_all(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.inner.write();
            inner.closing = true;
            inner.sessions.values().cloned().collect()
        };

        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "stopping all RTP sessions");
        }
        for session in sessions {
            session.stop();
        }
    }
}
