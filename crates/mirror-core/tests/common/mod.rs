//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mirror_cache::endpoint::{tags, HttpMethod};
use mirror_cache::session::{DynIdentityProvider, StaticIdentityProvider};
use mirror_cache::{
    EndpointDescriptor, FetchError, Identity, MirrorClient, RequestDescription, Subscription,
    Transport,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Chat server double: threads of messages plus a public announcements list.
#[derive(Default)]
pub struct MockServer {
    threads: Mutex<HashMap<u64, Vec<Value>>>,
    gets: AtomicUsize,
    posts: AtomicUsize,
    hold: Mutex<Option<Arc<Notify>>>,
    reject_posts: Mutex<bool>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(self, thread: u64, texts: &[&str]) -> Self {
        let messages = texts
            .iter()
            .map(|text| json!({ "author": "bob", "text": text }))
            .collect();
        self.threads.lock().unwrap().insert(thread, messages);
        self
    }

    /// GET requests received so far.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    /// Make every following GET wait until the returned notifier fires.
    pub fn hold_gets(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn reject_posts(&self) {
        *self.reject_posts.lock().unwrap() = true;
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn execute(
        &self,
        request: &RequestDescription,
        identity: Option<&Identity>,
    ) -> Result<Value, FetchError> {
        if request.path == "/announcements" {
            self.gets.fetch_add(1, Ordering::SeqCst);
            return Ok(json!(["maintenance on sunday"]));
        }

        let thread: u64 = request
            .path
            .trim_start_matches("/threads/")
            .trim_end_matches("/messages")
            .parse()
            .map_err(|_| FetchError::status(404, "no such route"))?;

        match request.method {
            HttpMethod::Get => {
                self.gets.fetch_add(1, Ordering::SeqCst);
                let hold = self.hold.lock().unwrap().clone();
                if let Some(hold) = hold {
                    hold.notified().await;
                }
                if identity.is_none() {
                    return Err(FetchError::unauthenticated("no token"));
                }
                let threads = self.threads.lock().unwrap();
                Ok(Value::Array(threads.get(&thread).cloned().unwrap_or_default()))
            }
            HttpMethod::Post => {
                self.posts.fetch_add(1, Ordering::SeqCst);
                if *self.reject_posts.lock().unwrap() {
                    return Err(FetchError::status(503, "try later"));
                }
                let author = identity
                    .map(|identity| identity.user_id.clone())
                    .ok_or_else(|| FetchError::unauthenticated("no token"))?;
                let text = request
                    .body
                    .as_ref()
                    .and_then(|body| body["text"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let message = json!({ "author": author, "text": text });
                self.threads
                    .lock()
                    .unwrap()
                    .entry(thread)
                    .or_default()
                    .push(message.clone());
                Ok(message)
            }
            _ => Err(FetchError::status(405, "method not allowed")),
        }
    }
}

pub fn messages() -> EndpointDescriptor {
    EndpointDescriptor::query("messages", |args| {
        let thread = args["threadId"]
            .as_u64()
            .ok_or_else(|| "threadId is required".to_string())?;
        Ok(RequestDescription::get(format!("/threads/{}/messages", thread)))
    })
    .provides_tags(|args, _| tags([format!("thread:{}", args["threadId"])]))
    .requires_session(true)
}

pub fn send_message() -> EndpointDescriptor {
    EndpointDescriptor::mutation("sendMessage", |args| {
        let thread = args["threadId"]
            .as_u64()
            .ok_or_else(|| "threadId is required".to_string())?;
        Ok(RequestDescription::post(format!("/threads/{}/messages", thread)))
    })
    .invalidates_tags(|args, _| tags([format!("thread:{}", args["threadId"])]))
    .requires_session(true)
}

pub fn announcements() -> EndpointDescriptor {
    EndpointDescriptor::query("announcements", |_| Ok(RequestDescription::get("/announcements")))
        .provides_tags(|_, _| tags(["announcements"]))
}

pub fn ada() -> Identity {
    Identity::new("ada").with_access_token("token-ada")
}

/// Provider with user `ada` / `pw`, optionally already signed in.
pub fn provider(signed_in: bool) -> DynIdentityProvider {
    let provider = StaticIdentityProvider::new().with_user(ada(), "pw");
    if signed_in {
        Arc::new(provider.signed_in_as(ada()))
    } else {
        Arc::new(provider)
    }
}

pub async fn client_with(
    server: Arc<MockServer>,
    provider: DynIdentityProvider,
    resolve: bool,
) -> MirrorClient {
    MirrorClient::builder()
        .transport(server)
        .identity_provider(provider)
        .endpoint(messages())
        .endpoint(send_message())
        .endpoint(announcements())
        .resolve_session(resolve)
        .build()
        .await
        .expect("client should build")
}

pub async fn signed_in_client(server: Arc<MockServer>) -> MirrorClient {
    client_with(server, provider(true), true).await
}

/// Drain pending updates; `true` once the subscription's entry is gone.
pub async fn wait_closed(subscription: &mut Subscription) -> bool {
    for _ in 0..5 {
        if subscription.changed().await.is_none() {
            return true;
        }
    }
    false
}

/// Let spawned tasks run.
pub async fn settle_tasks() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
