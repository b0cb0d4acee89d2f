//! Login session tracker.
//!
//! Each wait-token moves Pending -> Succeeded | Failed exactly once. Modern
//! sessions replay their result until they expire; legacy sessions are
//! removed by the first read that sees a result.

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{InteractionKind, ParsedCondition, Protocol, WaitId, WaitState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("wait id {0} not found")]
    NotFound(WaitId),

    #[error("timed out waiting for login")]
    Timeout,
}

/// The caveat a session was opened for and the providers that can serve it.
#[derive(Debug, Clone)]
pub struct CaveatContext {
    pub caveat_id: Vec<u8>,
    pub condition: ParsedCondition,
    /// Interaction kind -> name of the provider serving it, for every kind
    /// the caveat allows. Each requester is shown only the kinds it declared.
    pub available: BTreeMap<InteractionKind, String>,
}

impl CaveatContext {
    pub fn protocol(&self) -> Protocol {
        self.condition.protocol()
    }
}

struct Session {
    context: Arc<CaveatContext>,
    state: watch::Sender<WaitState>,
    expires_at: Instant,
}

/// Result of [`SessionTracker::create`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub wait_id: WaitId,
    pub context: Arc<CaveatContext>,
    pub state: WaitState,
    /// An earlier live session for the same caveat was returned.
    pub reused: bool,
}

/// Lock order: a `by_caveat` shard, then a `sessions` shard.
pub struct SessionTracker {
    sessions: DashMap<WaitId, Session>,
    by_caveat: DashMap<Vec<u8>, WaitId>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            by_caveat: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Open a session for a caveat. A Pending or Succeeded session for the
    /// same caveat is handed back instead, so one caveat never yields two
    /// discharges; a Failed or expired one is replaced.
    pub fn create(&self, context: CaveatContext) -> SessionHandle {
        let now = Instant::now();
        match self.by_caveat.entry(context.caveat_id.clone()) {
            MapEntry::Occupied(mut slot) => {
                if let Some(existing) = self.sessions.get(slot.get()) {
                    let state = existing.state.borrow().clone();
                    if existing.expires_at > now && !matches!(state, WaitState::Failed(_)) {
                        return SessionHandle {
                            wait_id: slot.get().clone(),
                            context: existing.context.clone(),
                            state,
                            reused: true,
                        };
                    }
                }
                let stale = slot.get().clone();
                let handle = self.insert(context, now);
                slot.insert(handle.wait_id.clone());
                self.sessions.remove(&stale);
                handle
            }
            MapEntry::Vacant(slot) => {
                let handle = self.insert(context, now);
                slot.insert(handle.wait_id.clone());
                handle
            }
        }
    }

    fn insert(&self, context: CaveatContext, now: Instant) -> SessionHandle {
        let wait_id = WaitId::generate();
        let context = Arc::new(context);
        let (state, _) = watch::channel(WaitState::Pending);
        self.sessions.insert(
            wait_id.clone(),
            Session {
                context: context.clone(),
                state,
                expires_at: now + self.ttl,
            },
        );
        tracing::debug!(wait_id = %wait_id, protocol = context.protocol().as_str(), "login session created");
        SessionHandle {
            wait_id,
            context,
            state: WaitState::Pending,
            reused: false,
        }
    }

    pub fn context(&self, wait_id: &WaitId) -> Result<Arc<CaveatContext>, SessionError> {
        self.live(wait_id, |s| s.context.clone())
    }

    pub fn state(&self, wait_id: &WaitId) -> Result<WaitState, SessionError> {
        self.live(wait_id, |s| s.state.borrow().clone())
    }

    fn live<T>(&self, wait_id: &WaitId, f: impl FnOnce(&Session) -> T) -> Result<T, SessionError> {
        match self.sessions.get(wait_id) {
            Some(session) if session.expires_at > Instant::now() => Ok(f(&session)),
            _ => Err(SessionError::NotFound(wait_id.clone())),
        }
    }

    /// Move a session to a terminal state. Returns `false` when it was
    /// already terminal; duplicate callbacks are not an error.
    pub fn resolve(&self, wait_id: &WaitId, result: WaitState) -> Result<bool, SessionError> {
        if !result.is_terminal() {
            return Ok(false);
        }
        let session = self
            .sessions
            .get(wait_id)
            .ok_or_else(|| SessionError::NotFound(wait_id.clone()))?;

        let changed = session.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = result;
                true
            }
        });
        if !changed {
            tracing::debug!(wait_id = %wait_id, "duplicate resolve ignored");
        }
        Ok(changed)
    }

    /// Wait up to `timeout` for a terminal state.
    pub async fn wait(&self, wait_id: &WaitId, timeout: Duration) -> Result<WaitState, SessionError> {
        // The map guard must not be held across the await.
        let (mut rx, protocol) = self.live(wait_id, |s| (s.state.subscribe(), s.context.protocol()))?;

        let state = match tokio::time::timeout(timeout, rx.wait_for(WaitState::is_terminal)).await {
            Err(_) => return Err(SessionError::Timeout),
            Ok(Err(_)) => return Err(SessionError::NotFound(wait_id.clone())),
            Ok(Ok(state)) => (*state).clone(),
        };

        if protocol == Protocol::Legacy {
            // Only the reader that removes the entry gets the result.
            let (_, session) = self
                .sessions
                .remove(wait_id)
                .ok_or_else(|| SessionError::NotFound(wait_id.clone()))?;
            self.by_caveat
                .remove_if(&session.context.caveat_id, |_, id| id == wait_id);
            tracing::debug!(wait_id = %wait_id, "legacy session consumed");
        }
        Ok(state)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.sessions.retain(|id, session| {
            let keep = session.expires_at > now;
            if !keep {
                expired.push((id.clone(), session.context.caveat_id.clone()));
            }
            keep
        });
        for (id, caveat_id) in &expired {
            self.by_caveat.remove_if(caveat_id, |_, current| current == id);
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = self.len(), "expired login sessions swept");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DischargeFailure, Macaroon};

    fn context(caveat: &str, legacy: bool) -> CaveatContext {
        let raw = if legacy { "<is-authenticated-user" } else { "is-authenticated-user" };
        CaveatContext {
            caveat_id: caveat.as_bytes().to_vec(),
            condition: raw.parse().unwrap(),
            available: BTreeMap::new(),
        }
    }

    fn macaroon(tag: &str) -> Macaroon {
        Macaroon::new(b"root", tag.as_bytes().to_vec(), "loc")
    }

    fn failure() -> WaitState {
        WaitState::Failed(DischargeFailure {
            code: "authentication failed".to_string(),
            message: "authentication failed for user \"test\"".to_string(),
        })
    }

    #[tokio::test]
    async fn second_resolve_is_a_no_op() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let handle = tracker.create(context("c1", false));

        assert!(tracker.resolve(&handle.wait_id, WaitState::Succeeded(macaroon("one"))).unwrap());
        assert!(!tracker.resolve(&handle.wait_id, WaitState::Succeeded(macaroon("two"))).unwrap());
        assert!(!tracker.resolve(&handle.wait_id, failure()).unwrap());

        for _ in 0..3 {
            let state = tracker.wait(&handle.wait_id, Duration::from_millis(10)).await.unwrap();
            assert_eq!(state, WaitState::Succeeded(macaroon("one")));
        }
    }

    #[tokio::test]
    async fn legacy_sessions_are_read_once() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let handle = tracker.create(context("c1", true));
        tracker.resolve(&handle.wait_id, WaitState::Succeeded(macaroon("one"))).unwrap();

        assert!(tracker.wait(&handle.wait_id, Duration::from_millis(10)).await.is_ok());
        assert_eq!(
            tracker.wait(&handle.wait_id, Duration::from_millis(10)).await.unwrap_err(),
            SessionError::NotFound(handle.wait_id.clone())
        );
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_while_pending() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let handle = tracker.create(context("c1", false));
        assert_eq!(
            tracker.wait(&handle.wait_id, Duration::from_millis(20)).await.unwrap_err(),
            SessionError::Timeout
        );
        assert_eq!(tracker.state(&handle.wait_id).unwrap(), WaitState::Pending);
    }

    #[tokio::test]
    async fn waiter_wakes_on_resolve() {
        let tracker = Arc::new(SessionTracker::new(Duration::from_secs(60)));
        let handle = tracker.create(context("c1", false));

        let waiter = {
            let tracker = tracker.clone();
            let id = handle.wait_id.clone();
            tokio::spawn(async move { tracker.wait(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        tracker.resolve(&handle.wait_id, failure()).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), failure());
    }

    #[test]
    fn live_session_is_reused_per_caveat() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let first = tracker.create(context("c1", false));
        let again = tracker.create(context("c1", false));
        let other = tracker.create(context("c2", false));

        assert!(again.reused);
        assert_eq!(first.wait_id, again.wait_id);
        assert_ne!(first.wait_id, other.wait_id);
    }

    #[test]
    fn failed_session_is_replaced() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let first = tracker.create(context("c1", false));
        tracker.resolve(&first.wait_id, failure()).unwrap();

        let retry = tracker.create(context("c1", false));
        assert!(!retry.reused);
        assert_ne!(first.wait_id, retry.wait_id);
        assert!(tracker.state(&first.wait_id).is_err());
    }

    #[tokio::test]
    async fn expired_sessions_are_purged() {
        let tracker = SessionTracker::new(Duration::from_millis(10));
        let handle = tracker.create(context("c1", false));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(tracker.state(&handle.wait_id).is_err());
        assert_eq!(tracker.purge_expired(), 1);
        assert!(tracker.is_empty());
        assert!(!tracker.create(context("c1", false)).reused);
    }
}
