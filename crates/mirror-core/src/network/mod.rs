//! Transport seam between the cache and the server.
//!
//! The cache only knows [`RequestDescription`]s. A [`Transport`] turns one into
//! a JSON payload or a [`FetchError`]; [`HttpTransport`] does so over HTTP.

mod http;

pub use http::HttpTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::endpoint::RequestDescription;
use crate::error::FetchError;
use crate::session::Identity;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform `request`, authenticated as `identity` when given.
    ///
    /// Timeouts are the transport's business and surface as
    /// [`FetchErrorKind::Timeout`](crate::error::FetchErrorKind::Timeout).
    async fn execute(
        &self,
        request: &RequestDescription,
        identity: Option<&Identity>,
    ) -> Result<Value, FetchError>;
}

pub type DynTransport = Arc<dyn Transport>;
