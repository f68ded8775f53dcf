//! Endpoint descriptors of the chat demo.

use mirror_cache::endpoint::tags;
use mirror_cache::{EndpointDescriptor, RequestDescription};
use serde_json::Value;

fn thread_id(args: &Value) -> Result<u64, String> {
    args["threadId"]
        .as_u64()
        .ok_or_else(|| "threadId must be a non-negative integer".to_string())
}

/// `messages(threadId)`: the messages of one thread.
pub fn messages() -> EndpointDescriptor {
    EndpointDescriptor::query("messages", |args| {
        let thread = thread_id(args)?;
        Ok(RequestDescription::get(format!("/threads/{}/messages", thread)))
    })
    .provides_tags(|args, _| tags([format!("thread:{}", args["threadId"])]))
    .requires_session(true)
}

/// `sendMessage(threadId, text)`: append to a thread.
pub fn send_message() -> EndpointDescriptor {
    EndpointDescriptor::mutation("sendMessage", |args| {
        let thread = thread_id(args)?;
        Ok(RequestDescription::post(format!("/threads/{}/messages", thread)))
    })
    .invalidates_tags(|args, _| tags([format!("thread:{}", args["threadId"])]))
    .requires_session(true)
}

pub fn all() -> Vec<EndpointDescriptor> {
    vec![messages(), send_message()]
}
