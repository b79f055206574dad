use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content hash of a normalized prompt, used as the cache key and artifact file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash already-normalized text.
    pub fn of(normalized: &str) -> Self {
        let digest = Sha256::digest(normalized.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user request as typed into the chat.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    text: String,
    created_at: DateTime<Utc>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Trimmed text with every whitespace run collapsed to one space. Case is kept.
    pub fn normalized(&self) -> String {
        normalize(&self.text)
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.normalized())
    }
}

pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text returned by the model gateway for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RawModelResponse {
    pub fingerprint: Fingerprint,
    pub model: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_whitespace_layout() {
        let a = Prompt::new("  Start leads to   Validate\n");
        let b = Prompt::new("Start leads to Validate");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_case_sensitive() {
        let a = Prompt::new("start leads to end");
        let b = Prompt::new("Start leads to End");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = Prompt::new("hello").fingerprint();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
        assert!(fp.as_str().starts_with(fp.short()));
    }

    #[test]
    fn test_blank_prompt() {
        assert!(Prompt::new("   \n\t").is_blank());
        assert!(!Prompt::new(" a ").is_blank());
    }
}
