//! Asynchronous session state machine.
//!
//! One [`SessionMachine`] exists per client. It starts in `resolving`, settles
//! once the startup identity check completes, and moves through `resolving`
//! again on every sign-in or sign-out:
//!
//! ```text
//! resolving ──> authenticated | unauthenticated | error
//! authenticated | unauthenticated | error ──> resolving
//! ```
//!
//! Every transition is published to registered observers synchronously, before
//! the call that caused it returns. An identity check that is overtaken by a
//! later sign-in or sign-out is discarded when it completes.

mod provider;
mod types;

pub use provider::{DynIdentityProvider, IdentityProvider, StaticIdentityProvider};
pub use types::{Credentials, Identity, Session, SessionPhase};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};
use crate::observer::{ObserverId, ObserverSet};

struct MachineState {
    session: Session,
    /// Bumped whenever a new resolution starts; stale completions are dropped.
    epoch: u64,
}

struct SessionInner {
    state: Mutex<MachineState>,
    sender: watch::Sender<Session>,
    observers: ObserverSet<Session>,
    provider: DynIdentityProvider,
}

/// Shared handle to the process-wide session. Cloning is cheap.
#[derive(Clone)]
pub struct SessionMachine {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMachine")
            .field("session", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    /// Create a machine in the `resolving` phase. Call [`resolve`](Self::resolve)
    /// to run the startup identity check.
    pub fn new(provider: DynIdentityProvider) -> Self {
        let (sender, _) = watch::channel(Session::resolving());
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(MachineState {
                    session: Session::resolving(),
                    epoch: 0,
                }),
                sender,
                observers: ObserverSet::new(),
                provider,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.inner.state.lock().expect("session state lock poisoned")
    }

    /// Current session.
    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().session.phase
    }

    /// Register a callback invoked synchronously on every transition.
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.inner.observers.register(callback)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Receiver for async consumers that prefer polling the session.
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.inner.sender.subscribe()
    }

    /// Suspend until the session is in a terminal phase.
    pub async fn wait_resolved(&self) -> Session {
        let mut receiver = self.inner.sender.subscribe();
        let resolved = match receiver.wait_for(|session| session.phase.is_terminal()).await {
            Ok(session) => Some((*session).clone()),
            // The sender lives as long as `self`.
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| self.snapshot())
    }

    /// Ask the identity provider who is signed in.
    ///
    /// Run once at startup; may be called again to re-validate the session.
    pub async fn resolve(&self) -> Result<Session> {
        let epoch = self.begin("identity check")?;
        let next = match self.inner.provider.current_identity().await {
            Ok(Some(identity)) => Session::authenticated(identity),
            Ok(None) => Session::unauthenticated(),
            Err(e) => {
                warn!("Identity check failed: {}", e);
                Session::failed(e.to_string())
            }
        };
        self.complete(epoch, next)
    }

    /// Sign in with `credentials`.
    ///
    /// A rejected sign-in is not an error of this call: the returned session
    /// is in the `error` phase and carries the message.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        let epoch = self.begin("sign-in")?;
        let next = match self.inner.provider.sign_in(credentials).await {
            Ok(identity) => Session::authenticated(identity),
            Err(e) => {
                warn!("Sign-in for {} failed: {}", credentials.username, e);
                Session::failed(e.to_string())
            }
        };
        self.complete(epoch, next)
    }

    /// Sign out. The session becomes `unauthenticated` before the provider is
    /// told; a provider failure is logged and otherwise ignored.
    pub async fn sign_out(&self) -> Result<Session> {
        let epoch = self.begin("sign-out")?;
        let session = self.complete(epoch, Session::unauthenticated())?;
        if let Err(e) = self.inner.provider.sign_out().await {
            warn!("Provider sign-out failed: {}", e);
        }
        Ok(session)
    }

    /// Apply `next` directly, for hosts that learn about the session out of band.
    ///
    /// Fails with [`MirrorError::InvalidTransition`] unless the move is allowed
    /// by the transition table.
    pub fn transition(&self, next: Session) -> Result<Session> {
        let session = {
            let mut state = self.lock();
            Self::check(state.session.phase, next.phase)?;
            state.epoch += 1;
            self.apply(&mut state, next)
        };
        self.inner.observers.notify(&session);
        Ok(session)
    }

    /// Enter `resolving` and open a new epoch.
    fn begin(&self, reason: &str) -> Result<u64> {
        let (epoch, published) = {
            let mut state = self.lock();
            state.epoch += 1;
            let epoch = state.epoch;
            if state.session.phase == SessionPhase::Resolving {
                // Already resolving; the earlier attempt is superseded.
                debug!("Session {} supersedes resolution #{}", reason, epoch - 1);
                (epoch, None)
            } else {
                Self::check(state.session.phase, SessionPhase::Resolving)?;
                let identity = state.session.identity.clone();
                let next = Session {
                    phase: SessionPhase::Resolving,
                    identity,
                    error: None,
                };
                (epoch, Some(self.apply(&mut state, next)))
            }
        };
        debug!("Session {} started (epoch {})", reason, epoch);
        if let Some(session) = published {
            self.inner.observers.notify(&session);
        }
        Ok(epoch)
    }

    /// Finish resolution `epoch` with `next`, unless a later one started.
    fn complete(&self, epoch: u64, next: Session) -> Result<Session> {
        let session = {
            let mut state = self.lock();
            if state.epoch != epoch {
                debug!(
                    "Discarding superseded session result (epoch {} < {})",
                    epoch, state.epoch
                );
                return Ok(state.session.clone());
            }
            Self::check(state.session.phase, next.phase)?;
            self.apply(&mut state, next)
        };
        self.inner.observers.notify(&session);
        Ok(session)
    }

    fn check(from: SessionPhase, to: SessionPhase) -> Result<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(MirrorError::InvalidTransition { from, to })
        }
    }

    fn apply(&self, state: &mut MachineState, next: Session) -> Session {
        info!("Session {} -> {}", state.session.phase, next.phase);
        state.session = next.clone();
        self.inner.sender.send_replace(next.clone());
        next
    }
}
