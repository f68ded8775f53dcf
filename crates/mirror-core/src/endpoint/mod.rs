//! Declarative endpoint descriptors.
//!
//! Every remote resource a view can read or write is described once at startup
//! by an [`EndpointDescriptor`]: its name, how arguments become a request, which
//! tags its results carry, which tags a successful write invalidates, and
//! whether it needs an authenticated session. Descriptors are plain data; the
//! cache looks them up by name and never special-cases a particular endpoint.
//!
//! ```rust
//! use mirror_cache::endpoint::{tags, EndpointDescriptor, RequestDescription};
//! use serde_json::json;
//!
//! let messages = EndpointDescriptor::query("messages", |args| {
//!     let thread = args["threadId"].as_u64().ok_or("threadId is required")?;
//!     Ok(RequestDescription::get(format!("/threads/{thread}/messages")))
//! })
//! .provides_tags(|args, _| tags([format!("thread:{}", args["threadId"])]))
//! .requires_session(true);
//!
//! let request = messages.build_request(&json!({"threadId": 1})).unwrap();
//! assert_eq!(request.path, "/threads/1/messages");
//! ```

mod key;

pub use key::{tags, CacheKey, Tag, TagSet};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MirrorError, Result};

/// HTTP verb of a request description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Transport-independent description of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescription {
    pub method: HttpMethod,
    /// Path relative to the transport's base URL.
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestDescription {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Whether an endpoint reads (and is cached) or writes (and invalidates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl EndpointKind {
    fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Query => "query",
            EndpointKind::Mutation => "mutation",
        }
    }
}

/// Maps call arguments to a request. An `Err` means the arguments are malformed.
pub type RequestBuilder =
    Arc<dyn Fn(&Value) -> std::result::Result<RequestDescription, String> + Send + Sync>;

/// Computes the tags of a query entry from its arguments and, once fetched, its data.
pub type ProvidedTags = Arc<dyn Fn(&Value, Option<&Value>) -> TagSet + Send + Sync>;

/// Computes the tags a successful mutation invalidates from its arguments and body.
pub type InvalidatedTags = Arc<dyn Fn(&Value, &Value) -> TagSet + Send + Sync>;

/// Immutable description of one endpoint.
#[derive(Clone)]
pub struct EndpointDescriptor {
    name: String,
    kind: EndpointKind,
    to_request: RequestBuilder,
    provides: Option<ProvidedTags>,
    invalidates: Option<InvalidatedTags>,
    requires_session: bool,
    eviction_grace: Option<Duration>,
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("provides_tags", &self.provides.is_some())
            .field("invalidates_tags", &self.invalidates.is_some())
            .field("requires_session", &self.requires_session)
            .field("eviction_grace", &self.eviction_grace)
            .finish()
    }
}

impl EndpointDescriptor {
    fn new<F>(name: impl Into<String>, kind: EndpointKind, to_request: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<RequestDescription, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            to_request: Arc::new(to_request),
            provides: None,
            invalidates: None,
            requires_session: false,
            eviction_grace: None,
        }
    }

    /// Describe a cached read endpoint.
    pub fn query<F>(name: impl Into<String>, to_request: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<RequestDescription, String> + Send + Sync + 'static,
    {
        Self::new(name, EndpointKind::Query, to_request)
    }

    /// Describe a write endpoint.
    pub fn mutation<F>(name: impl Into<String>, to_request: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<RequestDescription, String> + Send + Sync + 'static,
    {
        Self::new(name, EndpointKind::Mutation, to_request)
    }

    /// Tags attached to entries of this endpoint.
    ///
    /// Called with `None` when the entry is created and with the payload after
    /// each successful fetch.
    pub fn provides_tags<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> TagSet + Send + Sync + 'static,
    {
        self.provides = Some(Arc::new(f));
        self
    }

    /// Tags invalidated after a successful call of this endpoint.
    pub fn invalidates_tags<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> TagSet + Send + Sync + 'static,
    {
        self.invalidates = Some(Arc::new(f));
        self
    }

    pub fn requires_session(mut self, required: bool) -> Self {
        self.requires_session = required;
        self
    }

    /// Override the client-wide eviction grace period for this endpoint.
    pub fn eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = Some(grace);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn is_session_required(&self) -> bool {
        self.requires_session
    }

    pub fn grace_or(&self, default: Duration) -> Duration {
        self.eviction_grace.unwrap_or(default)
    }

    pub fn cache_key(&self, args: &Value) -> CacheKey {
        CacheKey::new(&self.name, args)
    }

    /// Turn arguments into a request description.
    pub fn build_request(&self, args: &Value) -> Result<RequestDescription> {
        (self.to_request)(args).map_err(|message| MirrorError::InvalidArguments {
            endpoint: self.name.clone(),
            message,
        })
    }

    pub fn provided_tags(&self, args: &Value, data: Option<&Value>) -> TagSet {
        self.provides
            .as_ref()
            .map(|f| f(args, data))
            .unwrap_or_default()
    }

    pub fn invalidated_tags(&self, args: &Value, body: &Value) -> TagSet {
        self.invalidates
            .as_ref()
            .map(|f| f(args, body))
            .unwrap_or_default()
    }
}

/// Name-indexed set of endpoint descriptors, frozen after startup.
#[derive(Debug, Default, Clone)]
pub struct EndpointRegistry {
    endpoints: HashMap<String, Arc<EndpointDescriptor>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Names must be unique.
    pub fn register(&mut self, descriptor: EndpointDescriptor) -> Result<()> {
        if self.endpoints.contains_key(descriptor.name()) {
            return Err(MirrorError::DuplicateEndpoint {
                name: descriptor.name().to_string(),
            });
        }
        self.endpoints
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<EndpointDescriptor>> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| MirrorError::UnknownEndpoint {
                name: name.to_string(),
            })
    }

    /// Look up `name` and require it to be of `kind`.
    pub fn get_kind(&self, name: &str, kind: EndpointKind) -> Result<Arc<EndpointDescriptor>> {
        let descriptor = self.get(name)?;
        if descriptor.kind() != kind {
            return Err(MirrorError::WrongEndpointKind {
                name: name.to_string(),
                expected: kind.as_str(),
                actual: descriptor.kind().as_str(),
            });
        }
        Ok(descriptor)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
