//! Session value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the process-wide session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// An identity check or sign-in/sign-out is in progress.
    Resolving,
    Authenticated,
    Unauthenticated,
    /// The identity check failed. Treated like `Unauthenticated` by the gate.
    Error,
}

impl SessionPhase {
    /// Every phase except `Resolving`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionPhase::Resolving)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Resolving` leads to any terminal phase and every terminal phase leads
    /// back to `Resolving`; nothing else is allowed.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        match self {
            SessionPhase::Resolving => next.is_terminal(),
            _ => next == SessionPhase::Resolving,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Resolving => "resolving",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::Error => "error",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Bearer token attached to session-requiring requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            access_token: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// Sign-in credentials handed to the identity provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Snapshot of the session published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub phase: SessionPhase,
    pub identity: Option<Identity>,
    pub error: Option<String>,
}

impl Session {
    pub fn resolving() -> Self {
        Self {
            phase: SessionPhase::Resolving,
            identity: None,
            error: None,
        }
    }

    pub fn authenticated(identity: Identity) -> Self {
        Self {
            phase: SessionPhase::Authenticated,
            identity: Some(identity),
            error: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            identity: None,
            error: None,
        }
    }

    /// Identity is always cleared on failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            phase: SessionPhase::Error,
            identity: None,
            error: Some(error.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::resolving()
    }
}
