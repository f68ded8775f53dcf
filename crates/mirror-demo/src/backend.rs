//! In-memory chat backend used as the demo's transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mirror_cache::endpoint::HttpMethod;
use mirror_cache::{FetchError, Identity, RequestDescription, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub author: String,
    pub text: String,
}

/// Threads of messages behind a simulated network delay.
pub struct ChatBackend {
    threads: Mutex<HashMap<u64, Vec<Message>>>,
    latency: Duration,
    requests: AtomicUsize,
    next_id: AtomicUsize,
}

impl ChatBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            latency,
            requests: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Seed `thread` with messages from `author`.
    pub fn with_thread(self, thread: u64, author: &str, texts: &[&str]) -> Self {
        {
            let mut threads = self.threads.lock().expect("chat lock poisoned");
            let messages = threads.entry(thread).or_default();
            for text in texts {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
                messages.push(Message {
                    id,
                    author: author.to_string(),
                    text: text.to_string(),
                });
            }
        }
        self
    }

    /// Requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn list(&self, thread: u64) -> Value {
        let threads = self.threads.lock().expect("chat lock poisoned");
        let messages = threads.get(&thread).cloned().unwrap_or_default();
        serde_json::to_value(messages).unwrap_or(Value::Null)
    }

    fn post(&self, thread: u64, author: &str, body: Option<&Value>) -> Result<Value, FetchError> {
        let text = body
            .and_then(|body| body["text"].as_str())
            .ok_or_else(|| FetchError::status(400, "text is required"))?;
        let message = Message {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
            author: author.to_string(),
            text: text.to_string(),
        };
        self.threads
            .lock()
            .expect("chat lock poisoned")
            .entry(thread)
            .or_default()
            .push(message.clone());
        serde_json::to_value(message).map_err(|e| FetchError::decode(e.to_string()))
    }
}

#[async_trait]
impl Transport for ChatBackend {
    async fn execute(
        &self,
        request: &RequestDescription,
        identity: Option<&Identity>,
    ) -> Result<Value, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let identity = identity.ok_or_else(|| {
            let mut error = FetchError::unauthenticated("Sign in to read messages");
            error.status = Some(401);
            error
        })?;
        debug!("{} {} as {}", request.method, request.path, identity.user_id);

        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        let thread = match segments.as_slice() {
            ["threads", id, "messages"] => id
                .parse::<u64>()
                .map_err(|_| FetchError::status(404, format!("No thread {}", id)))?,
            _ => return Err(FetchError::status(404, format!("No route {}", request.path))),
        };

        match request.method {
            HttpMethod::Get => Ok(self.list(thread)),
            HttpMethod::Post => self.post(thread, &identity.user_id, request.body.as_ref()),
            other => Err(FetchError::status(405, format!("{} not allowed", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ada() -> Identity {
        Identity::new("ada")
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_post() {
        let backend = ChatBackend::new(Duration::from_millis(10)).with_thread(1, "bob", &["hi"]);
        let list = RequestDescription::get("/threads/1/messages");

        let before = backend.execute(&list, Some(&ada())).await.unwrap();
        assert_eq!(before.as_array().unwrap().len(), 1);

        let post =
            RequestDescription::post("/threads/1/messages").with_body(json!({"text": "hello"}));
        let created = backend.execute(&post, Some(&ada())).await.unwrap();
        assert_eq!(created["author"], "ada");

        let after = backend.execute(&list, Some(&ada())).await.unwrap();
        assert_eq!(after.as_array().unwrap().len(), 2);
        assert_eq!(backend.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requires_identity() {
        let backend = ChatBackend::new(Duration::ZERO);
        let err = backend
            .execute(&RequestDescription::get("/threads/1/messages"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_route() {
        let backend = ChatBackend::new(Duration::ZERO);
        let err = backend
            .execute(&RequestDescription::get("/users"), Some(&ada()))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(404));
    }
}
