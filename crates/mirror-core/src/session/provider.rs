//! Identity provider seam.
//!
//! The session machine never talks to a server itself. Hosts implement
//! [`IdentityProvider`] to answer "who is signed in?" and to exchange
//! credentials for an identity.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::types::{Credentials, Identity};
use crate::error::FetchError;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Identity of the current user, or `None` if nobody is signed in.
    async fn current_identity(&self) -> Result<Option<Identity>, FetchError>;

    /// Exchange credentials for an identity.
    async fn sign_in(&self, credentials: &Credentials) -> Result<Identity, FetchError>;

    /// Tell the server the session is over. The local session is cleared
    /// regardless of the outcome.
    async fn sign_out(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

pub type DynIdentityProvider = Arc<dyn IdentityProvider>;

/// Provider that holds a single identity in memory.
///
/// `sign_in` accepts any credentials whose username matches one of the
/// configured users. Useful for tests and offline demos.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    users: Vec<(Identity, String)>,
    current: Mutex<Option<Identity>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user that may sign in with `password`.
    pub fn with_user(mut self, identity: Identity, password: impl Into<String>) -> Self {
        self.users.push((identity, password.into()));
        self
    }

    /// Start out signed in as `identity`.
    pub fn signed_in_as(self, identity: Identity) -> Self {
        *self.current.lock().expect("identity lock poisoned") = Some(identity);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn current_identity(&self) -> Result<Option<Identity>, FetchError> {
        Ok(self.current.lock().expect("identity lock poisoned").clone())
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Identity, FetchError> {
        let identity = self
            .users
            .iter()
            .find(|(identity, password)| {
                identity.user_id == credentials.username && *password == credentials.password
            })
            .map(|(identity, _)| identity.clone())
            .ok_or_else(|| FetchError::unauthenticated("Invalid username or password"))?;
        *self.current.lock().expect("identity lock poisoned") = Some(identity.clone());
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), FetchError> {
        *self.current.lock().expect("identity lock poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_round() {
        let provider = StaticIdentityProvider::new().with_user(Identity::new("ada"), "pw");
        assert_eq!(provider.current_identity().await.unwrap(), None);

        let err = provider
            .sign_in(&Credentials::new("ada", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::FetchErrorKind::Unauthenticated);

        let identity = provider.sign_in(&Credentials::new("ada", "pw")).await.unwrap();
        assert_eq!(identity.user_id, "ada");
        assert_eq!(provider.current_identity().await.unwrap(), Some(identity));

        provider.sign_out().await.unwrap();
        assert_eq!(provider.current_identity().await.unwrap(), None);
    }
}
