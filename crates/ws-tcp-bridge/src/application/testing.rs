//! Test doubles shared by the application-layer tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::{ClientSession, CloseStatus, MessageKind, SessionState};

/// A [`ClientSession`] that records every call and behaves like the real
/// one: sends are dropped unless open, and only the first close counts.
pub(crate) struct RecordingSession {
    state: Mutex<SessionState>,
    sent: Mutex<Vec<(Vec<u8>, MessageKind)>>,
    closes: Mutex<Vec<(CloseStatus, String)>>,
}

impl RecordingSession {
    pub(crate) fn open() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::Open),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<(Vec<u8>, MessageKind)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn closes(&self) -> Vec<(CloseStatus, String)> {
        self.closes.lock().unwrap().clone()
    }
}

impl ClientSession for RecordingSession {
    fn send(&self, payload: Vec<u8>, kind: MessageKind) {
        if self.state() == SessionState::Open {
            self.sent.lock().unwrap().push((payload, kind));
        }
    }

    fn close(&self, status: CloseStatus, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Open {
            *state = SessionState::Closing;
            self.closes.lock().unwrap().push((status, reason.to_string()));
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}

/// Polls `cond` until it holds, panicking after five seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
