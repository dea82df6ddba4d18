//! Shared data types for the chain engine
//!
//! These types cross crate boundaries: the store persists them, the pool
//! carries them in task payloads, and the batcher produces them from raw
//! message streams.

use serde::{Deserialize, Serialize};

/// Logical namespace isolating the chains of one origin (a "guild").
///
/// Tenant ids arrive from the external adapter as opaque strings; the
/// engine never inspects their structure beyond using them in file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId(s)
    }
}

/// One observed suffix for a prefix: the token and how often it was seen.
///
/// Weights are strictly positive; a zero weight never persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffixEntry {
    /// The suffix token.
    pub word: String,
    /// Observation count.
    pub weight: u64,
}

impl SuffixEntry {
    /// Create a suffix entry.
    pub fn new(word: impl Into<String>, weight: u64) -> Self {
        SuffixEntry {
            word: word.into(),
            weight,
        }
    }
}

/// The normalized unit of training: one (prefix, suffix, weight) observation.
///
/// Produced by the batcher from message text or accepted directly from an
/// external import. The prefix is the canonical space-joined key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// Canonical space-joined prefix key.
    pub prefix: String,
    /// Suffix token observed after the prefix.
    pub suffix: String,
    /// Observation weight, >= 1.
    pub weight: u64,
}

impl TrainingRecord {
    /// Create a training record.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, weight: u64) -> Self {
        TrainingRecord {
            prefix: prefix.into(),
            suffix: suffix.into(),
            weight,
        }
    }
}

/// One raw training input: a message plus optional attachment URLs.
///
/// Matches the external JSON import format
/// `{ "message": string, "attachments"?: [string] }`. The engine ignores
/// attachments; the adapter may associate them with messages in its own
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingMessage {
    /// Raw message text; whitespace-tokenized by the batcher.
    pub message: String,
    /// Attachment URLs, ignored by the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl TrainingMessage {
    /// Create a training message without attachments.
    pub fn new(message: impl Into<String>) -> Self {
        TrainingMessage {
            message: message.into(),
            attachments: Vec::new(),
        }
    }
}

/// Point-in-time statistics for one chain store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of distinct prefixes.
    pub prefix_count: usize,
    /// Total suffix entries across all prefixes.
    pub total_suffixes: usize,
    /// Rough estimate of resident bytes for this store's chains.
    pub approx_memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_roundtrip() {
        let t = TenantId::new("guild-42");
        assert_eq!(t.as_str(), "guild-42");
        assert_eq!(t.to_string(), "guild-42");

        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"guild-42\"");
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_training_message_attachments_default() {
        let msg: TrainingMessage = serde_json::from_str(r#"{"message":"hello world"}"#).unwrap();
        assert_eq!(msg.message, "hello world");
        assert!(msg.attachments.is_empty());

        let msg: TrainingMessage =
            serde_json::from_str(r#"{"message":"hi","attachments":["http://x/a.png"]}"#).unwrap();
        assert_eq!(msg.attachments.len(), 1);
    }

    #[test]
    fn test_training_message_array_format() {
        let raw = r#"[{"message":"one two three"},{"message":"four","attachments":[]}]"#;
        let msgs: Vec<TrainingMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message, "one two three");
    }

    #[test]
    fn test_store_stats_default() {
        let s = StoreStats::default();
        assert_eq!(s.prefix_count, 0);
        assert_eq!(s.total_suffixes, 0);
        assert_eq!(s.approx_memory_bytes, 0);
    }
}
