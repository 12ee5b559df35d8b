//! Browser sessions and the clinician identity threaded through requests.
//!
//! A session token is issued at sign-in. Starting the OAuth flow binds a
//! one-time `state` value to that session so the provider's redirect back
//! can be attributed to the right clinician without any ambient lookup.
//!
//! Sessions and pending states both expire; expired entries are pruned
//! whenever a new one is issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PortalError, PortalResult};

/// Longest accepted local user reference
pub const MAX_USER_REF_LENGTH: usize = 150;

/// How long a signed-in session stays valid
pub const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// How long the provider has to redirect back after `/authorize`
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Outstanding OAuth states kept per session; the oldest is dropped first
pub const MAX_PENDING_STATES: usize = 5;

/// The clinician a request acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClinicianContext {
    pub user_ref: String,
}

struct SessionEntry {
    clinician: ClinicianContext,
    issued_at: Instant,
}

struct PendingState {
    session_token: String,
    issued_at: Instant,
    /// Issue order, for evicting the oldest
    seq: u64,
}

#[derive(Default)]
struct Sessions {
    by_token: HashMap<String, SessionEntry>,
    /// OAuth state value -> owning session
    pending_states: HashMap<String, PendingState>,
    next_seq: u64,
}

impl Sessions {
    fn prune(&mut self, now: Instant, session_ttl: Duration, state_ttl: Duration) {
        let before = self.by_token.len() + self.pending_states.len();
        self.by_token
            .retain(|_, s| now.duration_since(s.issued_at) < session_ttl);
        let live = &self.by_token;
        self.pending_states.retain(|_, p| {
            now.duration_since(p.issued_at) < state_ttl && live.contains_key(&p.session_token)
        });
        let removed = before - (self.by_token.len() + self.pending_states.len());
        if removed > 0 {
            debug!(removed, "Pruned expired sessions and OAuth states");
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<Sessions>>,
    session_ttl: Duration,
    state_ttl: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_ttl(SESSION_TTL, STATE_TTL)
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(session_ttl: Duration, state_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Sessions::default())),
            session_ttl,
            state_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session for a local user and return its token
    pub fn sign_in(&self, user_ref: &str) -> PortalResult<String> {
        let user_ref = user_ref.trim();
        if user_ref.is_empty() {
            return Err(PortalError::Validation("Please enter a username.".to_string()));
        }
        if user_ref.len() > MAX_USER_REF_LENGTH {
            return Err(PortalError::Validation("Username is too long.".to_string()));
        }

        let now = Instant::now();
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.lock();
        sessions.prune(now, self.session_ttl, self.state_ttl);
        sessions.by_token.insert(
            token.clone(),
            SessionEntry {
                clinician: ClinicianContext {
                    user_ref: user_ref.to_string(),
                },
                issued_at: now,
            },
        );
        info!(user_ref = %user_ref, "Session opened");
        Ok(token)
    }

    /// Clinician behind a live session; an expired session is removed
    pub fn identity(&self, token: &str) -> PortalResult<ClinicianContext> {
        let mut sessions = self.lock();
        let expired = match sessions.by_token.get(token) {
            Some(entry) if entry.issued_at.elapsed() < self.session_ttl => {
                return Ok(entry.clinician.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            sessions.by_token.remove(token);
            sessions.pending_states.retain(|_, p| p.session_token != token);
            debug!("Session expired");
        }
        Err(PortalError::InvalidSession)
    }

    /// Issue a one-time OAuth state value for the session
    pub fn begin_authorization(&self, token: &str) -> PortalResult<String> {
        self.identity(token)?;

        let now = Instant::now();
        let mut sessions = self.lock();
        sessions.prune(now, self.session_ttl, self.state_ttl);

        let mut outstanding: Vec<(String, u64)> = sessions
            .pending_states
            .iter()
            .filter(|(_, p)| p.session_token == token)
            .map(|(state, p)| (state.clone(), p.seq))
            .collect();
        outstanding.sort_by_key(|(_, seq)| *seq);
        let excess = (outstanding.len() + 1).saturating_sub(MAX_PENDING_STATES);
        for (state, _) in outstanding.into_iter().take(excess) {
            sessions.pending_states.remove(&state);
        }

        let state = Uuid::new_v4().simple().to_string();
        let seq = sessions.next_seq;
        sessions.next_seq += 1;
        sessions.pending_states.insert(
            state.clone(),
            PendingState {
                session_token: token.to_string(),
                issued_at: now,
                seq,
            },
        );
        debug!("OAuth state issued");
        Ok(state)
    }

    /// Consume an OAuth state value, returning the clinician it was issued to.
    /// Unknown and expired states are both rejected.
    pub fn complete_authorization(&self, state: &str) -> PortalResult<ClinicianContext> {
        let pending = self
            .lock()
            .pending_states
            .remove(state)
            .ok_or(PortalError::StateMismatch)?;
        if pending.issued_at.elapsed() >= self.state_ttl {
            debug!("OAuth state expired");
            return Err(PortalError::StateMismatch);
        }
        self.identity(&pending.session_token)
    }

    /// Drop a session and any authorization still pending for it
    pub fn sign_out(&self, token: &str) -> bool {
        let mut sessions = self.lock();
        sessions.pending_states.retain(|_, p| p.session_token != token);
        let removed = sessions.by_token.remove(token);
        if let Some(ref entry) = removed {
            info!(user_ref = %entry.clinician.user_ref, "Session closed");
        }
        removed.is_some()
    }

    #[cfg(test)]
    fn pending_state_count(&self) -> usize {
        self.lock().pending_states.len()
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.lock().by_token.len()
    }
}
