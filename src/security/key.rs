use crate::error::LeafError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const WILDCARD: char = '*';

/// Collapses every run of `/` into a single `/`.
fn collapse_slashes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut previous_slash = false;
    for ch in raw.chars() {
        if ch == '/' {
            if !previous_slash {
                out.push(ch);
            }
            previous_slash = true;
        } else {
            out.push(ch);
            previous_slash = false;
        }
    }
    out
}

fn invalid(value: &str, reason: impl Into<String>) -> LeafError {
    LeafError::InvalidKey {
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn normalize_absolute(raw: &str) -> Result<String, LeafError> {
    if raw.is_empty() {
        return Err(invalid(raw, "must not be empty"));
    }
    let normalized = collapse_slashes(raw);
    if !normalized.starts_with('/') {
        return Err(invalid(raw, "must start with '/'"));
    }
    if normalized == "/" {
        return Err(invalid(raw, "must not equal '/'"));
    }
    Ok(normalized)
}

/// The normalized name of a stored value, such as `/config/db/host`.
///
/// Ordering and equality are defined over the normalized text, so
/// `//a//b/` and `/a/b` name the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyName(String);

impl KeyName {
    pub fn create(raw: &str) -> Result<Self, LeafError> {
        let normalized = normalize_absolute(raw)?;
        let trimmed = normalized.trim_end_matches('/');
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KeyName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for KeyName {
    type Err = LeafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::create(s)
    }
}

impl TryFrom<String> for KeyName {
    type Error = LeafError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::create(&value)
    }
}

impl From<KeyName> for String {
    fn from(value: KeyName) -> Self {
        value.0
    }
}

/// A pattern over key names: either an exact path, or a prefix terminated by
/// a single trailing `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyExpression {
    prefix: String,
    wildcard: bool,
}

impl KeyExpression {
    pub fn create(raw: &str) -> Result<Self, LeafError> {
        let normalized = normalize_absolute(raw)?;
        let Some(body) = normalized.strip_suffix(WILDCARD) else {
            if normalized.contains(WILDCARD) {
                return Err(invalid(raw, "wildcards can only appear at the end"));
            }
            return Ok(Self {
                prefix: normalized,
                wildcard: false,
            });
        };
        if body.contains(WILDCARD) {
            return Err(invalid(raw, "wildcards can only appear at the end"));
        }
        Ok(Self {
            prefix: body.to_string(),
            wildcard: true,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The expression without its wildcard marker.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, key: &KeyName) -> bool {
        if self.wildcard {
            key.as_str().starts_with(&self.prefix)
        } else {
            key.as_str() == self.prefix
        }
    }
}

impl fmt::Display for KeyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)?;
        if self.wildcard {
            write!(f, "{WILDCARD}")?;
        }
        Ok(())
    }
}

impl FromStr for KeyExpression {
    type Err = LeafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::create(s)
    }
}

impl TryFrom<String> for KeyExpression {
    type Error = LeafError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::create(&value)
    }
}

impl From<KeyExpression> for String {
    fn from(value: KeyExpression) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyExpression, KeyName};
    use crate::error::LeafError;
    use std::collections::BTreeSet;

    fn key(raw: &str) -> KeyName {
        KeyName::create(raw).expect("valid key")
    }

    #[test]
    fn key_names_are_normalized() {
        assert_eq!(key("//a//b/"), key("/a/b"));
        assert_eq!(key("/a/b///").as_str(), "/a/b");
        assert_eq!(key("///x").as_str(), "/x");
    }

    #[test]
    fn degenerate_key_names_are_rejected() {
        for raw in ["", "/", "//", "///", "a/b", "wrong!"] {
            let err = KeyName::create(raw).expect_err(raw);
            assert!(matches!(err, LeafError::InvalidKey { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn key_names_order_by_normalized_text() {
        let set: BTreeSet<KeyName> = ["/b", "//a", "/a/c/", "/a"]
            .into_iter()
            .map(key)
            .collect();
        let ordered: Vec<&str> = set.iter().map(KeyName::as_str).collect();
        assert_eq!(ordered, vec!["/a", "/a/c", "/b"]);
    }

    #[test]
    fn wildcard_must_be_final() {
        assert!(KeyExpression::create("/a/*/b").is_err());
        assert!(KeyExpression::create("/a/**").is_err());
        assert!(KeyExpression::create("*").is_err());
        assert!(KeyExpression::create("/").is_err());
        assert!(KeyExpression::create("").is_err());

        let expr = KeyExpression::create("/a/*").expect("expr");
        assert!(expr.is_wildcard());
        assert_eq!(expr.prefix(), "/a/");
        assert_eq!(expr.to_string(), "/a/*");
    }

    #[test]
    fn wildcard_matches_by_prefix() {
        let expr = KeyExpression::create("//a//*").expect("expr");
        assert!(expr.matches(&key("/a/b/c")));
        assert!(expr.matches(&key("/a/b")));
        assert!(!expr.matches(&key("/a")));
        assert!(!expr.matches(&key("/ab")));

        let everything = KeyExpression::create("/*").expect("expr");
        assert!(everything.matches(&key("/anything/at/all")));
    }

    #[test]
    fn exact_expression_requires_equality() {
        let expr = KeyExpression::create("/a/b").expect("expr");
        assert!(!expr.is_wildcard());
        assert!(expr.matches(&key("/a//b")));
        assert!(!expr.matches(&key("/a/b/c")));
        assert!(!expr.matches(&key("/a")));
    }

    #[test]
    fn keys_deserialize_through_validation() {
        let parsed: KeyName = serde_json::from_str("\"//x//y/\"").expect("parse");
        assert_eq!(parsed.as_str(), "/x/y");
        assert!(serde_json::from_str::<KeyName>("\"nope\"").is_err());
        assert!(serde_json::from_str::<KeyExpression>("\"/a/*/b\"").is_err());
    }
}
