//! Cache keys and invalidation tags.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deterministic identifier for one `(endpoint, arguments)` pair.
///
/// The arguments are rendered as canonical JSON (object keys sorted at every
/// depth), so structurally equal arguments always produce the same key no
/// matter how the caller built them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `endpoint` called with `args`.
    pub fn new(endpoint: &str, args: &Value) -> Self {
        let mut rendered = String::with_capacity(endpoint.len() + 16);
        rendered.push_str(endpoint);
        rendered.push('(');
        write_canonical(args, &mut rendered);
        rendered.push(')');
        Self(rendered)
    }

    /// Name of the endpoint this key belongs to.
    pub fn endpoint(&self) -> &str {
        self.0.split_once('(').map(|(name, _)| name).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are strings; serde_json escapes them consistently.
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Opaque label grouping cache entries for bulk invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Tag::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Tag(value)
    }
}

/// Set of tags carried by an entry or named by an invalidation.
pub type TagSet = BTreeSet<Tag>;

/// Collect anything tag-like into a [`TagSet`].
pub fn tags<I, T>(items: I) -> TagSet
where
    I: IntoIterator<Item = T>,
    T: Into<Tag>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_object_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"threadId": 1, "page": {"size": 20, "n": 2}}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"page": {"n": 2, "size": 20}, "threadId": 1}"#).unwrap();
        assert_eq!(CacheKey::new("messages", &a), CacheKey::new("messages", &b));
    }

    #[test]
    fn test_key_distinguishes_values_and_endpoints() {
        let args = json!({"threadId": 1});
        assert_ne!(
            CacheKey::new("messages", &args),
            CacheKey::new("messages", &json!({"threadId": 2}))
        );
        assert_ne!(
            CacheKey::new("messages", &args),
            CacheKey::new("threads", &args)
        );
        // Array order is significant.
        assert_ne!(
            CacheKey::new("photos", &json!([1, 2])),
            CacheKey::new("photos", &json!([2, 1]))
        );
    }

    #[test]
    fn test_key_rendering() {
        let key = CacheKey::new("messages", &json!({"threadId": 1, "q": "a\"b"}));
        assert_eq!(key.as_str(), r#"messages({"q":"a\"b","threadId":1})"#);
        assert_eq!(key.endpoint(), "messages");
    }

    #[test]
    fn test_tags_helper() {
        let set = tags(["thread:1", "thread:1", "thread:2"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Tag::new("thread:2")));
    }
}
