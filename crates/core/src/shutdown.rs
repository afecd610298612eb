//! Coordinated termination.
//!
//! The server stops in pieces: the RTSP listener, the RTCP validator and
//! every live RTP session each report in from their own thread. The
//! termination callback runs once, after the last of them.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A server component that reports its own stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    ControlServer,
    RtcpValidator,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::ControlServer => write!(f, "control server"),
            Component::RtcpValidator => write!(f, "rtcp validator"),
        }
    }
}

type TerminationCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    control_stopped: bool,
    validator_stopped: bool,
    active_sessions: usize,
    terminated: bool,
    on_terminated: Option<TerminationCallback>,
}

impl State {
    fn ready(&self) -> bool {
        !self.terminated
            && self.control_stopped
            && self.validator_stopped
            && self.active_sessions == 0
    }
}

/// Merges stop signals and fires the termination callback exactly once.
#[derive(Default)]
pub struct ShutdownCoordinator {
    state: Mutex<State>,
    terminated: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback run on termination. Replaces any previous one.
    ///
    /// If termination already happened the callback runs immediately.
    pub fn set_on_terminated<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.terminated {
            drop(state);
            callback();
            return;
        }
        state.on_terminated = Some(Box::new(callback));
    }

    pub fn signal(&self, component: Component) {
        let mut state = self.state.lock();
        let already = match component {
            Component::ControlServer => std::mem::replace(&mut state.control_stopped, true),
            Component::RtcpValidator => std::mem::replace(&mut state.validator_stopped, true),
        };
        if already {
            tracing::trace!(%component, "duplicate stop signal ignored");
            return;
        }
        tracing::debug!(%component, sessions = state.active_sessions, "component stopped");
        self.try_terminate(state);
    }

    pub fn session_opened(&self) {
        self.state.lock().active_sessions += 1;
    }

    pub fn session_closed(&self) {
        let mut state = self.state.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
        tracing::trace!(remaining = state.active_sessions, "session stop reported");
        self.try_terminate(state);
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().active_sessions
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Block until termination or until `timeout` elapses. Returns whether
    /// termination happened.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.terminated {
            self.terminated
                .wait_while_for(&mut state, |s| !s.terminated, timeout);
        }
        state.terminated
    }

    fn try_terminate(&self, mut state: parking_lot::MutexGuard<'_, State>) {
        if !state.ready() {
            return;
        }
        state.terminated = true;
        let callback = state.on_terminated.take();
        drop(state);

        tracing::info!("all components stopped, server terminated");
        self.terminated.notify_all();
        if let Some(callback) = callback {
            callback();
        }
    }
}
