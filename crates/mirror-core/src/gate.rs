//! Session gate for session-dependent consumers.
//!
//! The gate maps the session phase to what a protected view should do:
//! - `resolving`: show a placeholder; subscriptions may be taken but their
//!   fetches wait for the session to settle
//! - `authenticated`: render
//! - `unauthenticated` / `error`: redirect to the entry point
//!
//! When the session leaves `authenticated` for good, the gate releases every
//! subscription taken through it and clears session-requiring entries, so
//! nothing fetched under the old identity stays visible. Entries still
//! observed elsewhere are fetched again on the next sign-in.

use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{Cache, SubscriptionHandle};
use crate::error::{MirrorError, Result};
use crate::observer::ObserverId;
use crate::session::{Identity, Session, SessionMachine, SessionPhase};

/// What a gated view should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Placeholder,
    Open { identity: Identity },
    Redirect { to: String },
}

impl GateState {
    pub fn from_session(session: &Session, entry_point: &str) -> Self {
        match (session.phase, &session.identity) {
            (SessionPhase::Resolving, _) => GateState::Placeholder,
            (SessionPhase::Authenticated, Some(identity)) => GateState::Open {
                identity: identity.clone(),
            },
            _ => GateState::Redirect {
                to: entry_point.to_string(),
            },
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, GateState::Open { .. })
    }
}

struct GateInner {
    cache: Cache,
    session: SessionMachine,
    entry_point: String,
    held: Mutex<Vec<SubscriptionHandle>>,
    observer: Mutex<Option<ObserverId>>,
}

impl GateInner {
    fn teardown(&self, phase: SessionPhase) {
        let handles = std::mem::take(&mut *self.held.lock().expect("gate lock poisoned"));
        let released = handles.iter().filter(|handle| handle.release()).count();
        let cleared = self.cache.clear_session_entries();
        info!(
            "Session {}: released {} gated subscriptions, cleared {} entries",
            phase,
            released,
            cleared.len()
        );
    }
}

impl GateInner {
    fn resume(&self) {
        let resumed = self.cache.resume_session_entries();
        if !resumed.is_empty() {
            info!("Session authenticated: re-fetching {} entries", resumed.len());
        }
    }
}

impl Drop for GateInner {
    fn drop(&mut self) {
        if let Some(id) = self.observer.lock().expect("gate lock poisoned").take() {
            self.session.unobserve(id);
        }
    }
}

/// Gate bound to one cache and one session. Cloning is cheap.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("state", &self.state())
            .field("held", &self.held_count())
            .finish()
    }
}

impl Gate {
    pub fn new(cache: Cache, session: SessionMachine, entry_point: impl Into<String>) -> Self {
        let inner = Arc::new(GateInner {
            cache,
            session: session.clone(),
            entry_point: entry_point.into(),
            held: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        });

        let weak: Weak<GateInner> = Arc::downgrade(&inner);
        let id = session.observe(move |session: &Session| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match session.phase {
                SessionPhase::Unauthenticated | SessionPhase::Error => {
                    inner.teardown(session.phase)
                }
                SessionPhase::Authenticated => inner.resume(),
                SessionPhase::Resolving => {}
            }
        });
        *inner.observer.lock().expect("gate lock poisoned") = Some(id);

        Self { inner }
    }

    pub fn state(&self) -> GateState {
        GateState::from_session(&self.inner.session.snapshot(), &self.inner.entry_point)
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.entry_point
    }

    /// Refuse when the gate is redirecting.
    pub fn admit(&self) -> Result<()> {
        let phase = self.inner.session.phase();
        match phase {
            SessionPhase::Unauthenticated | SessionPhase::Error => {
                debug!("Gate closed ({}), redirecting to {}", phase, self.inner.entry_point);
                Err(MirrorError::SessionUnavailable { phase })
            }
            _ => Ok(()),
        }
    }

    /// Track `handle` so it is released when the session ends.
    pub fn hold(&self, handle: SubscriptionHandle) {
        let mut held = self.inner.held.lock().expect("gate lock poisoned");
        held.retain(|existing| !existing.is_released());
        held.push(handle);
    }

    /// Live subscriptions taken through the gate.
    pub fn held_count(&self) -> usize {
        self.inner
            .held
            .lock()
            .expect("gate lock poisoned")
            .iter()
            .filter(|handle| !handle.is_released())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticIdentityProvider;

    fn ada() -> Identity {
        Identity::new("ada").with_access_token("t0k3n")
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            GateState::from_session(&Session::resolving(), "/login"),
            GateState::Placeholder
        );
        assert!(GateState::from_session(&Session::authenticated(ada()), "/login").is_open());
        assert_eq!(
            GateState::from_session(&Session::failed("x"), "/login"),
            GateState::Redirect {
                to: "/login".to_string()
            }
        );
        assert_eq!(
            GateState::from_session(&Session::unauthenticated(), "/signin"),
            GateState::Redirect {
                to: "/signin".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_admit_follows_session() {
        let provider = StaticIdentityProvider::new().with_user(ada(), "pw");
        let session = SessionMachine::new(Arc::new(provider));
        let cache = Cache::new(std::time::Duration::from_secs(1));
        let gate = Gate::new(cache, session.clone(), "/login");

        assert!(gate.admit().is_ok());
        assert_eq!(gate.state(), GateState::Placeholder);

        session.resolve().await.unwrap();
        assert!(matches!(
            gate.admit(),
            Err(MirrorError::SessionUnavailable {
                phase: SessionPhase::Unauthenticated
            })
        ));

        session
            .sign_in(&crate::session::Credentials::new("ada", "pw"))
            .await
            .unwrap();
        assert!(gate.admit().is_ok());
        assert_eq!(gate.state(), GateState::Open { identity: ada() });
    }

    #[tokio::test]
    async fn test_observed_entries_refetch_after_next_sign_in() {
        use crate::cache::{EntryStatus, FetchSource, Fetched, RequestFn};
        use crate::endpoint::{tags, CacheKey};
        use futures::FutureExt;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let provider = StaticIdentityProvider::new()
            .with_user(ada(), "pw")
            .signed_in_as(ada());
        let session = SessionMachine::new(Arc::new(provider));
        let cache = Cache::new(std::time::Duration::from_secs(60));
        let _gate = Gate::new(cache.clone(), session.clone(), "/login");
        session.resolve().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let request: RequestFn = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok(Fetched {
                    data: serde_json::json!(n),
                    tags: tags(["inbox"]),
                })
            }
            .boxed()
        });
        let key = CacheKey::new("inbox", &serde_json::Value::Null);
        let source = FetchSource::new(request, std::time::Duration::from_secs(60))
            .session_required(true);
        let mut view = cache.subscribe(key.clone(), tags(["inbox"]), source).unwrap();
        view.settled().await.unwrap();

        session.sign_out().await.unwrap();
        let reset = cache.get(&key).unwrap();
        assert_eq!(reset.status, EntryStatus::Uninitialized);
        assert_eq!(reset.data, None);

        session
            .sign_in(&crate::session::Credentials::new("ada", "pw"))
            .await
            .unwrap();
        let snapshot = view.settled().await.unwrap();
        assert_eq!(snapshot.status, EntryStatus::Fulfilled);
        assert_eq!(snapshot.data, Some(serde_json::json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_gate_unregisters_observer() {
        let session = SessionMachine::new(Arc::new(StaticIdentityProvider::new()));
        let cache = Cache::new(std::time::Duration::from_secs(1));
        let gate = Gate::new(cache, session.clone(), "/login");
        assert_eq!(session.observer_count(), 1);
        drop(gate);
        assert_eq!(session.observer_count(), 0);
        session.resolve().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Unauthenticated);
    }
}
