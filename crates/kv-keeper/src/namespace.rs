//! Key namespacing for the flat store.
//!
//! A flat host store is shared with unrelated data, so every key this crate
//! writes carries a prefix derived from the store identity name and the
//! record-collection name. Each component is escaped before joining so that
//! two different `(name, collection)` pairs can never produce the same prefix,
//! nor one prefix that is a prefix of another pair's.

use crate::error::{KeeperError, KeeperResult};

/// Separator placed after each escaped component.
const SEPARATOR: char = ':';

/// Escape character for separator and itself.
const ESCAPE: char = '\\';

/// Validate a configuration component (store name or collection name).
///
/// Components must be non-empty and must not contain the null byte.
pub(crate) fn validate_component(what: &str, value: &str) -> KeeperResult<()> {
    if value.is_empty() {
        return Err(KeeperError::Validation(format!("{what} must not be empty")));
    }
    if value.contains('\0') {
        return Err(KeeperError::Validation(format!(
            "{what} must not contain null bytes"
        )));
    }
    Ok(())
}

fn push_escaped(buf: &mut String, component: &str) {
    for c in component.chars() {
        if c == SEPARATOR || c == ESCAPE {
            buf.push(ESCAPE);
        }
        buf.push(c);
    }
    buf.push(SEPARATOR);
}

/// Build the namespace prefix `"{name}:{collection}:"` with both components
/// escaped.
#[must_use]
pub fn namespace_prefix(name: &str, collection: &str) -> String {
    let capacity = name.len().saturating_add(collection.len()).saturating_add(2);
    let mut buf = String::with_capacity(capacity);
    push_escaped(&mut buf, name);
    push_escaped(&mut buf, collection);
    buf
}

/// A prefix bound to one configuration, used by the flat-store adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Wrap an already-derived prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The raw prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Host key for a caller key.
    #[must_use]
    pub fn wrap(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Caller key for a host key, or `None` if the host key is foreign.
    #[must_use]
    pub fn unwrap_key<'a>(&self, host_key: &'a str) -> Option<&'a str> {
        host_key.strip_prefix(self.prefix.as_str())
    }

    /// Whether a host key belongs to this namespace.
    #[must_use]
    pub fn owns(&self, host_key: &str) -> bool {
        host_key.starts_with(self.prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_shape() {
        assert_eq!(namespace_prefix("kv-keeper", "items"), "kv-keeper:items:");
    }

    #[test]
    fn test_prefix_escapes_separator() {
        assert_eq!(namespace_prefix("a:b", "c"), "a\\:b:c:");
        assert_eq!(namespace_prefix("a\\", "c"), "a\\\\:c:");
    }

    #[test]
    fn test_prefix_is_collision_safe() {
        let pairs = [("a:b", "c"), ("a", "b:c"), ("a", "b"), ("a\\", "b"), ("a", "\\b")];
        for (i, x) in pairs.iter().enumerate() {
            for (j, y) in pairs.iter().enumerate() {
                if i == j {
                    continue;
                }
                let px = namespace_prefix(x.0, x.1);
                let py = namespace_prefix(y.0, y.1);
                assert!(!px.starts_with(&py), "{px:?} overlaps {py:?}");
            }
        }
    }

    #[test]
    fn test_namespace_wrap_and_unwrap() {
        let ns = Namespace::new(namespace_prefix("app", "items"));
        let host_key = ns.wrap("foo");
        assert_eq!(host_key, "app:items:foo");
        assert!(ns.owns(&host_key));
        assert_eq!(ns.unwrap_key(&host_key), Some("foo"));
        assert_eq!(ns.unwrap_key("foo"), None);
        assert!(!ns.owns("other:items:foo"));
    }

    #[test]
    fn test_validate_component() {
        assert!(validate_component("name", "ok").is_ok());
        assert!(validate_component("name", "").is_err());
        assert!(validate_component("name", "bad\0").is_err());
    }
}
