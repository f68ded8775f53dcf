//! Mirror Cache - client-side mirror of server data for many small views.
//!
//! The crate provides a normalized, subscription-counted remote-data cache
//! with tag-based invalidation, request de-duplication and grace-period
//! eviction, together with an asynchronous session state machine and a gate
//! that defers or redirects session-dependent consumers.
//!
//! # Example
//!
//! ```rust,ignore
//! use mirror_cache::endpoint::{tags, EndpointDescriptor, RequestDescription};
//! use mirror_cache::MirrorClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> mirror_cache::Result<()> {
//!     let client = MirrorClient::builder()
//!         .transport(my_transport())
//!         .endpoint(
//!             EndpointDescriptor::query("messages", |args| {
//!                 let thread = args["threadId"].as_u64().ok_or("threadId is required")?;
//!                 Ok(RequestDescription::get(format!("/threads/{thread}/messages")))
//!             })
//!             .provides_tags(|args, _| tags([format!("thread:{}", args["threadId"])])),
//!         )
//!         .build()
//!         .await?;
//!
//!     let mut messages = client.subscribe("messages", json!({ "threadId": 42 }))?;
//!     let snapshot = messages.settled().await;
//!     println!("{:?}", snapshot);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod network;
pub mod observer;
pub mod session;

mod api;

// Re-export commonly used types
pub use cache::{
    Cache, CacheEntry, CacheEvent, CacheStats, EntryStatus, FetchHandle, FetchStart,
    InvalidationReport, QuerySnapshot, Subscription, SubscriptionHandle,
};
pub use cancel::{CancellationToken, CancelledError};
pub use config::ClientConfig;
pub use endpoint::{CacheKey, EndpointDescriptor, RequestDescription, Tag, TagSet};
pub use error::{FetchError, FetchErrorKind, MirrorError, Result};
pub use gate::{Gate, GateState};
pub use network::{HttpTransport, Transport};
pub use observer::ObserverId;
pub use session::{Credentials, Identity, IdentityProvider, Session, SessionPhase};

pub use api::{MirrorClientBuilder, MutationOutcome};

use std::sync::Arc;

use endpoint::EndpointRegistry;
use network::DynTransport;
use session::SessionMachine;

/// Main entry point: owns the cache, the session and the gate of one process.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct MirrorClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    registry: EndpointRegistry,
    cache: Cache,
    session: SessionMachine,
    gate: Gate,
    transport: DynTransport,
    resolve_on_build: bool,
}

impl std::fmt::Debug for MirrorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorClient")
            .field("endpoints", &self.inner.registry.len())
            .field("session", &self.inner.session.snapshot().phase)
            .field("cache", &self.inner.cache.stats())
            .finish()
    }
}

impl MirrorClient {
    pub fn builder() -> MirrorClientBuilder {
        MirrorClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The underlying cache, for inspection and manual invalidation.
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    pub fn session_machine(&self) -> &SessionMachine {
        &self.inner.session
    }

    pub fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    /// Invalidate `tags` outside of a mutation, e.g. after a server push.
    pub fn invalidate(&self, tags: &TagSet) -> InvalidationReport {
        self.inner.cache.invalidate(tags)
    }
}
