//! Push sessions: the per-request state shared between the git invoker and the hook server.
//!
//! A session is opened before `receive-pack` is spawned and registered under a random bearer
//! token that is handed to the hooks. Hook calls are only served for registered tokens, and the
//! session, not the request body, is authoritative for who pushes where.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::hooks::{Environment, HookInput, HookOutput};
use crate::refs::RefUpdate;
use crate::Error;

/// Where a push stands from the orchestrator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushState {
    /// The session is open, pre-receive has not completed.
    Received,
    /// All checks ran.
    Validated,
    /// No check objected, git may move the refs.
    Accepted,
    /// The push is refused, refs stay where they are.
    Rejected,
}

impl PushState {
    fn can_advance_to(self, next: PushState) -> bool {
        matches!(
            (self, next),
            (PushState::Received, PushState::Validated | PushState::Rejected)
                | (PushState::Validated, PushState::Accepted | PushState::Rejected)
        )
    }
}

#[derive(Debug, Default)]
struct Recorded {
    ref_updates: Vec<RefUpdate>,
    environment: Environment,
    output: HookOutput,
}

/// The state of a single push request.
#[derive(Debug)]
pub struct PushSession {
    id: uuid::Uuid,
    repo_id: i64,
    principal_id: i64,
    internal: bool,
    cancel: CancellationToken,
    state: Mutex<PushState>,
    recorded: Mutex<Recorded>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PushSession {
    pub fn new(repo_id: i64, principal_id: i64, internal: bool, cancel: CancellationToken) -> Self {
        PushSession {
            id: uuid::Uuid::new_v4(),
            repo_id,
            principal_id,
            internal,
            cancel,
            state: Mutex::new(PushState::Received),
            recorded: Mutex::default(),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn repo_id(&self) -> i64 {
        self.repo_id
    }

    pub fn principal_id(&self) -> i64 {
        self.principal_id
    }

    pub fn internal(&self) -> bool {
        self.internal
    }

    /// Cancelled when the client goes away.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> PushState {
        *lock(&self.state)
    }

    /// Move to `next`, failing on transitions the state machine does not allow.
    pub fn advance(&self, next: PushState) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if !state.can_advance_to(next) {
            return Err(Error::Bug(format!("push session {} cannot go from {:?} to {next:?}", self.id, *state)));
        }
        tracing::debug!(session = %self.id, from = ?*state, to = ?next, "push state");
        *state = next;
        Ok(())
    }

    /// Fail with [`Error::Forbidden`] if `input` claims a different identity than the session.
    pub fn verify(&self, input: &HookInput) -> Result<(), Error> {
        if input.repo_id != self.repo_id || input.principal_id != self.principal_id || input.internal != self.internal {
            return Err(Error::Forbidden(format!(
                "hook payload does not match push session {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Remember the updates and environment pre-receive validated.
    pub fn record_input(&self, input: &HookInput) {
        let mut recorded = lock(&self.recorded);
        recorded.ref_updates.clone_from(&input.ref_updates);
        recorded.environment = input.environment.clone();
    }

    pub fn ref_updates(&self) -> Vec<RefUpdate> {
        lock(&self.recorded).ref_updates.clone()
    }

    pub fn environment(&self) -> Environment {
        lock(&self.recorded).environment.clone()
    }

    /// True if `update` was among the updates pre-receive saw.
    pub fn was_validated(&self, update: &RefUpdate) -> bool {
        lock(&self.recorded).ref_updates.contains(update)
    }

    /// Append a hook call's output to the session's transcript.
    pub fn append_output(&self, out: &HookOutput) {
        lock(&self.recorded).output.absorb(out.clone());
    }

    /// Everything the hooks reported so far.
    pub fn output(&self) -> HookOutput {
        lock(&self.recorded).output.clone()
    }
}

/// Live push sessions by bearer token.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<PushSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under a fresh token; it is unregistered when the guard drops.
    pub fn open(&self, session: PushSession) -> SessionGuard {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(session);
        lock(&self.sessions).insert(token.clone(), session.clone());
        tracing::debug!(session = %session.id, repo_id = session.repo_id, "push session opened");
        SessionGuard {
            token,
            session,
            registry: self.clone(),
        }
    }

    /// The live session of `token`, if any.
    pub fn get(&self, token: &str) -> Option<Arc<PushSession>> {
        lock(&self.sessions).get(token).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a session registered for as long as it lives.
#[derive(Debug)]
pub struct SessionGuard {
    token: String,
    session: Arc<PushSession>,
    registry: SessionRegistry,
}

impl SessionGuard {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn session(&self) -> &Arc<PushSession> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.registry.sessions).remove(&self.token);
        tracing::debug!(session = %self.session.id, state = ?self.session.state(), "push session closed");
    }
}
