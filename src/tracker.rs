use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;

/// Registry of running sessions, used for listing and cancellation
///
/// Every session token is a child of the server-wide shutdown token, so
/// cancelling that one reaches all running sessions at once.
pub struct SessionTracker {
    shutdown: CancellationToken,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

struct ActiveSession {
    environment: String,
    created_time: String,
    token: CancellationToken,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub environment: String,
    pub created_time: String,
}

impl SessionTracker {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a session; it stays listed until the guard is dropped
    pub fn register(self: &Arc<Self>, id: &str, environment: &str) -> SessionGuard {
        let token = self.shutdown.child_token();
        self.sessions.lock().insert(
            id.to_string(),
            ActiveSession {
                environment: environment.to_string(),
                created_time: create_timestamp(),
                token: token.clone(),
            },
        );
        SessionGuard {
            tracker: Arc::clone(self),
            id: id.to_string(),
            token,
        }
    }

    /// Cancels one running session, returns false if it is not running
    pub fn cancel(&self, id: &str) -> bool {
        match self.sessions.lock().get(id) {
            Some(session) => {
                log::info!("Cancelling session {id} on request");
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| SessionSummary {
                id: id.clone(),
                environment: s.environment.clone(),
                created_time: s.created_time.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.created_time.cmp(&b.created_time).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every running session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
    id: String,
    token: CancellationToken,
}

impl SessionGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.sessions.lock().remove(&self.id);
    }
}
