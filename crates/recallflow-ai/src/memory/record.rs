//! Long-term memory records and the scope they belong to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  MemoryScope  "acme:alice:session-42"                         │
//! │                                                               │
//! │  MemoryRecord                                                 │
//! │  ├── id: "mem-5f1c..."                                        │
//! │  ├── memory_type: Preference                                  │
//! │  ├── content: "User prefers oat milk in coffee"               │
//! │  ├── importance: 0.8   decay_factor: 1.0                      │
//! │  └── created_at: 1760000000000                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are created by an extractor and afterwards only replaced, merged
//! or deleted by conflict resolution. Embeddings are owned by the store and
//! are never carried on the record itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AiError;

/// Partition key for long-term memory and chat history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryScope {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MemoryScope {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// `tenant:user` or `tenant:user:session`.
    pub fn key(&self) -> String {
        match &self.session_id {
            Some(session) => format!("{}:{}:{}", self.tenant_id, self.user_id, session),
            None => format!("{}:{}", self.tenant_id, self.user_id),
        }
    }

    /// Same tenant and user, regardless of session.
    pub fn same_owner(&self, other: &MemoryScope) -> bool {
        self.tenant_id == other.tenant_id && self.user_id == other.user_id
    }

    /// A scope with a blank tenant or user addresses nothing.
    pub fn is_empty(&self) -> bool {
        self.tenant_id.trim().is_empty() || self.user_id.trim().is_empty()
    }
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Kind of durable fact a record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Preference,
    Instruction,
    Event,
    Relationship,
}

impl MemoryType {
    pub const ALL: [MemoryType; 5] = [
        MemoryType::Fact,
        MemoryType::Preference,
        MemoryType::Instruction,
        MemoryType::Event,
        MemoryType::Relationship,
    ];

    /// Upper-case tag used when records are rendered into context.
    pub fn tag(&self) -> &'static str {
        match self {
            MemoryType::Fact => "FACT",
            MemoryType::Preference => "PREFERENCE",
            MemoryType::Instruction => "INSTRUCTION",
            MemoryType::Event => "EVENT",
            MemoryType::Relationship => "RELATIONSHIP",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MemoryType {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        MemoryType::ALL
            .into_iter()
            .find(|t| t.tag().eq_ignore_ascii_case(tag))
            .ok_or_else(|| AiError::InvalidFormat(format!("unknown memory type: {tag}")))
    }
}

/// A durable fact about a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub scope: MemoryScope,
    pub content: String,
    pub memory_type: MemoryType,
    /// In `[0, 1]`.
    pub importance: f64,
    /// In `[0, 1]`; 1.0 means no decay.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    /// SHA-256 of the content, hex encoded.
    pub content_hash: String,
}

pub const DEFAULT_IMPORTANCE: f64 = 0.5;

fn default_decay_factor() -> f64 {
    1.0
}

impl MemoryRecord {
    /// New record with a generated id, default importance and no decay.
    pub fn new(scope: MemoryScope, memory_type: MemoryType, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: format!("mem-{}", uuid::Uuid::new_v4()),
            scope,
            content_hash: content_hash(&content),
            content,
            memory_type,
            importance: DEFAULT_IMPORTANCE,
            decay_factor: default_decay_factor(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = clamp_unit(importance);
        self
    }

    #[must_use]
    pub fn with_decay_factor(mut self, decay_factor: f64) -> Self {
        self.decay_factor = clamp_unit(decay_factor);
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, timestamp_ms: i64) -> Self {
        self.created_at = timestamp_ms;
        self
    }

    /// Replace the content, keeping the hash in sync.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self.content_hash = content_hash(&self.content);
        self
    }

    /// Ranking score: importance × decay.
    pub fn score(&self) -> f64 {
        clamp_unit(self.importance) * clamp_unit(self.decay_factor)
    }
}

pub(crate) fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
