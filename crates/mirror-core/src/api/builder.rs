//! Builder for configuring a [`MirrorClient`].

use std::sync::Arc;

use crate::cache::Cache;
use crate::config::ClientConfig;
use crate::endpoint::{EndpointDescriptor, EndpointRegistry};
use crate::error::{MirrorError, Result};
use crate::gate::Gate;
use crate::network::{DynTransport, HttpTransport};
use crate::session::{DynIdentityProvider, SessionMachine, StaticIdentityProvider};
use crate::{ClientInner, MirrorClient};

/// Builder for configuring a [`MirrorClient`].
///
/// # Example
///
/// ```rust,ignore
/// use mirror_cache::{ClientConfig, EndpointDescriptor, MirrorClient};
///
/// let client = MirrorClient::builder()
///     .config(ClientConfig::default().with_base_url("https://chat.example.com/api"))
///     .endpoint(messages_endpoint())
///     .endpoint(send_message_endpoint())
///     .build()
///     .await?;
/// ```
pub struct MirrorClientBuilder {
    config: ClientConfig,
    registry: EndpointRegistry,
    registration_error: Option<MirrorError>,
    transport: Option<DynTransport>,
    identity_provider: Option<DynIdentityProvider>,
    resolve_session: bool,
}

impl Default for MirrorClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            registry: EndpointRegistry::new(),
            registration_error: None,
            transport: None,
            identity_provider: None,
            resolve_session: true,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an endpoint. A duplicate name makes [`build`](Self::build) fail.
    pub fn endpoint(mut self, descriptor: EndpointDescriptor) -> Self {
        if let Err(e) = self.registry.register(descriptor) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Transport used for every request.
    ///
    /// Default: an [`HttpTransport`] built from the config's `base_url`.
    pub fn transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Source of the session identity.
    ///
    /// Default: a provider with no users, so the session resolves to
    /// `unauthenticated`.
    pub fn identity_provider(mut self, provider: DynIdentityProvider) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Run the startup identity check inside [`build`](Self::build).
    ///
    /// When disabled the session stays `resolving` until
    /// [`MirrorClient::resolve_session`] is called.
    ///
    /// Default: `true`
    pub fn resolve_session(mut self, enable: bool) -> Self {
        self.resolve_session = enable;
        self
    }

    /// Build the client.
    pub async fn build(self) -> Result<MirrorClient> {
        let client = self.build_unresolved()?;
        if client.inner.resolve_on_build {
            client.resolve_session().await?;
        }
        Ok(client)
    }

    fn build_unresolved(self) -> Result<MirrorClient> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&self.config)?),
        };
        let provider = self
            .identity_provider
            .unwrap_or_else(|| Arc::new(StaticIdentityProvider::new()));

        let cache = Cache::new(self.config.eviction_grace());
        let session = SessionMachine::new(provider);
        let gate = Gate::new(cache.clone(), session.clone(), self.config.entry_point.clone());

        tracing::info!(
            "Mirror client ready with {} endpoints (grace {:?})",
            self.registry.len(),
            cache.default_grace()
        );

        Ok(MirrorClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                registry: self.registry,
                cache,
                session,
                gate,
                transport,
                resolve_on_build: self.resolve_session,
            }),
        })
    }
}
