//! Reads and writes through registered endpoints.

use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::{
    FetchHandle, FetchResult, FetchSource, Fetched, InvalidationReport, RequestFn, Subscription,
};
use crate::endpoint::{EndpointDescriptor, EndpointKind, RequestDescription};
use crate::error::{FetchError, MirrorError, Result};
use crate::network::DynTransport;
use crate::session::{Identity, SessionMachine};
use crate::MirrorClient;

/// Result of a successful [`MirrorClient::mutate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationOutcome {
    /// Server response body (`null` when empty).
    pub data: Value,
    pub invalidated: InvalidationReport,
}

/// A resolved query: descriptor, normalized arguments and request.
struct QueryCall {
    descriptor: Arc<EndpointDescriptor>,
    args: Value,
    request: RequestDescription,
}

impl MirrorClient {
    /// Subscribe to `endpoint` with `args`.
    ///
    /// Returns immediately; the subscription's snapshot moves through
    /// `pending` to `fulfilled` or `rejected` as the fetch progresses. For a
    /// session-requiring endpoint the subscription goes through the gate: it
    /// fails with [`MirrorError::SessionUnavailable`] while redirecting, and is
    /// released automatically when the session ends.
    pub fn subscribe(&self, endpoint: &str, args: impl Serialize) -> Result<Subscription> {
        let call = self.query_call(endpoint, args)?;
        let session_required = call.descriptor.is_session_required();
        if session_required {
            self.inner.gate.admit()?;
        }

        let key = call.descriptor.cache_key(&call.args);
        let tags = call.descriptor.provided_tags(&call.args, None);
        let subscription = self.inner.cache.subscribe(key, tags, self.fetch_source(call))?;
        if session_required {
            self.inner.gate.hold(subscription.handle());
        }
        Ok(subscription)
    }

    /// Re-fetch the entry for `endpoint` with `args`, e.g. after a rejection.
    ///
    /// Returns `None` if nothing has subscribed to or prefetched it.
    pub fn refetch(&self, endpoint: &str, args: impl Serialize) -> Result<Option<FetchHandle>> {
        let call = self.query_call(endpoint, args)?;
        let key = call.descriptor.cache_key(&call.args);
        self.inner.cache.refetch(&key)
    }

    /// Load the entry for `endpoint` with `args` without subscribing.
    pub fn prefetch(&self, endpoint: &str, args: impl Serialize) -> Result<FetchHandle> {
        let call = self.query_call(endpoint, args)?;
        if call.descriptor.is_session_required() {
            self.inner.gate.admit()?;
        }
        let key = call.descriptor.cache_key(&call.args);
        let tags = call.descriptor.provided_tags(&call.args, None);
        self.inner.cache.prefetch(key, tags, self.fetch_source(call))
    }

    /// Perform a write and invalidate the tags it declares.
    ///
    /// Transport failures are returned as [`MirrorError::Fetch`] and leave the
    /// cache untouched.
    pub async fn mutate(
        &self,
        endpoint: &str,
        args: impl Serialize,
        body: impl Serialize,
    ) -> Result<MutationOutcome> {
        let descriptor = self
            .inner
            .registry
            .get_kind(endpoint, EndpointKind::Mutation)?;
        let args = to_json(&descriptor, args)?;
        let body = to_json(&descriptor, body)?;
        let mut request = descriptor.build_request(&args)?;
        if request.body.is_none() && !body.is_null() {
            request.body = Some(body.clone());
        }

        let identity = if descriptor.is_session_required() {
            self.inner.gate.admit()?;
            let session = self.inner.session.wait_resolved().await;
            if !session.is_authenticated() {
                return Err(MirrorError::SessionUnavailable {
                    phase: session.phase,
                });
            }
            session.identity
        } else {
            current_identity(&self.inner.session)
        };

        let data = self
            .inner
            .transport
            .execute(&request, identity.as_ref())
            .await?;
        let tags = descriptor.invalidated_tags(&args, &body);
        debug!("{} succeeded, invalidating {:?}", endpoint, tags);
        let invalidated = self.inner.cache.invalidate(&tags);
        Ok(MutationOutcome { data, invalidated })
    }

    fn query_call(&self, endpoint: &str, args: impl Serialize) -> Result<QueryCall> {
        let descriptor = self.inner.registry.get_kind(endpoint, EndpointKind::Query)?;
        let args = to_json(&descriptor, args)?;
        // Malformed arguments are reported here, not stored as a rejection.
        let request = descriptor.build_request(&args)?;
        Ok(QueryCall {
            descriptor,
            args,
            request,
        })
    }

    fn fetch_source(&self, call: QueryCall) -> FetchSource {
        let grace = call.descriptor.grace_or(self.inner.cache.default_grace());
        let session_required = call.descriptor.is_session_required();
        let request = request_fn(
            call,
            self.inner.transport.clone(),
            self.inner.session.clone(),
        );
        FetchSource::new(request, grace).session_required(session_required)
    }
}

/// Build the request function recorded for a cache key.
fn request_fn(call: QueryCall, transport: DynTransport, session: SessionMachine) -> RequestFn {
    let call = Arc::new(call);
    Arc::new(move || run_query(call.clone(), transport.clone(), session.clone()).boxed())
}

/// Session-requiring requests wait for the session to settle before touching
/// the transport and fail as unauthenticated if it settles signed out.
async fn run_query(
    call: Arc<QueryCall>,
    transport: DynTransport,
    session: SessionMachine,
) -> FetchResult {
    let identity = if call.descriptor.is_session_required() {
        let resolved = session.wait_resolved().await;
        if !resolved.is_authenticated() {
            return Err(FetchError::unauthenticated(format!(
                "{} requires a session ({})",
                call.descriptor.name(),
                resolved.phase
            )));
        }
        resolved.identity
    } else {
        current_identity(&session)
    };

    let data = transport.execute(&call.request, identity.as_ref()).await?;
    let tags = call.descriptor.provided_tags(&call.args, Some(&data));
    Ok(Fetched { data, tags })
}

fn current_identity(session: &SessionMachine) -> Option<Identity> {
    let snapshot = session.snapshot();
    if snapshot.is_authenticated() {
        snapshot.identity
    } else {
        None
    }
}

fn to_json(descriptor: &EndpointDescriptor, value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| MirrorError::InvalidArguments {
        endpoint: descriptor.name().to_string(),
        message: e.to_string(),
    })
}
