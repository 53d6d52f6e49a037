use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RecallError, RecallResult};

/// Identifier of an interview session.
pub type SessionId = Uuid;

/// Tenant that owns knowledge chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OwnerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Isolation scope attached to every stored record and index node.
///
/// Searches restrict their candidate set by scope, so a node's scope is the
/// unit of tenant and session isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Scope {
    /// Visible to everyone (e.g. a deployment-wide semantic cache).
    Global,
    /// Owned by a tenant.
    Owner(OwnerId),
    /// Belongs to a single conversation session.
    Session(SessionId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Owner(owner) => write!(f, "owner:{owner}"),
            Scope::Session(session) => write!(f, "session:{session}"),
        }
    }
}

#[allow(clippy::expect_used)]
fn topic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static topic pattern"))
}

/// A short controlled key for session facts, e.g. `salary` or `location`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Default upper bound on topic length.
    pub const DEFAULT_MAX_LEN: usize = 32;

    /// Normalizes (trim + lowercase) and validates a topic.
    pub fn parse(raw: &str, max_len: usize) -> RecallResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(RecallError::InvalidInput("topic cannot be empty".into()));
        }
        if normalized.chars().count() > max_len {
            return Err(RecallError::InvalidInput(format!(
                "topic '{normalized}' exceeds {max_len} characters"
            )));
        }
        if !topic_pattern().is_match(&normalized) {
            return Err(RecallError::InvalidInput(format!(
                "topic '{normalized}' may only contain [a-z0-9_-]"
            )));
        }
        Ok(Self(normalized))
    }

    /// The topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata attached to a knowledge chunk.
///
/// A handful of keys are recognized and type-checked at ingestion; anything
/// else lands in `extra` untouched. Ranking never reads metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Where the chunk came from (file name, URL, upload id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Human-readable title of the parent document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Identifier grouping chunks of the same document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Page number within the parent document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unrecognized keys, preserved opaquely.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    /// Keys with a defined meaning and type.
    pub const RECOGNIZED_KEYS: [&'static str; 5] = ["source", "title", "document_id", "page", "tags"];

    /// Validates an untyped key/value map into typed metadata.
    pub fn from_map(map: HashMap<String, serde_json::Value>) -> RecallResult<Self> {
        let mut meta = ChunkMetadata::default();
        for (key, value) in map {
            match key.as_str() {
                "source" => meta.source = Some(expect_string(&key, value)?),
                "title" => meta.title = Some(expect_string(&key, value)?),
                "document_id" => meta.document_id = Some(expect_string(&key, value)?),
                "page" => {
                    let page = value
                        .as_u64()
                        .and_then(|p| u32::try_from(p).ok())
                        .ok_or_else(|| {
                            RecallError::InvalidInput(format!(
                                "metadata key 'page' must be a non-negative integer, got {value}"
                            ))
                        })?;
                    meta.page = Some(page);
                }
                "tags" => {
                    let serde_json::Value::Array(items) = value else {
                        return Err(RecallError::InvalidInput(
                            "metadata key 'tags' must be an array of strings".into(),
                        ));
                    };
                    meta.tags = items
                        .into_iter()
                        .map(|item| expect_string("tags", item))
                        .collect::<RecallResult<Vec<_>>>()?;
                }
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
        Ok(meta)
    }

    /// Flattens back to an untyped map (the persisted form).
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(obj)) => obj.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

fn expect_string(key: &str, value: serde_json::Value) -> RecallResult<String> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        other => Err(RecallError::InvalidInput(format!(
            "metadata key '{key}' must be a string, got {other}"
        ))),
    }
}
