//! Session, observation and inspection methods.

use crate::cache::{CacheEvent, CacheStats};
use crate::error::Result;
use crate::gate::GateState;
use crate::observer::ObserverId;
use crate::session::{Credentials, Session};
use crate::MirrorClient;

impl MirrorClient {
    /// Run the identity check. Called by the builder unless disabled.
    pub async fn resolve_session(&self) -> Result<Session> {
        self.inner.session.resolve().await
    }

    /// Sign in. A rejected sign-in yields a session in the `error` phase.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        self.inner.session.sign_in(credentials).await
    }

    /// Sign out. Gated subscriptions are released and session-requiring
    /// entries cleared before this returns.
    pub async fn sign_out(&self) -> Result<Session> {
        self.inner.session.sign_out().await
    }

    pub fn session(&self) -> Session {
        self.inner.session.snapshot()
    }

    pub fn gate_state(&self) -> GateState {
        self.inner.gate.state()
    }

    /// Register a callback for every committed cache change.
    pub fn observe_cache<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.cache.observe(callback)
    }

    pub fn unobserve_cache(&self, id: ObserverId) -> bool {
        self.inner.cache.unobserve(id)
    }

    /// Register a callback for every session transition.
    pub fn observe_session<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.inner.session.observe(callback)
    }

    pub fn unobserve_session(&self, id: ObserverId) -> bool {
        self.inner.session.unobserve(id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}
