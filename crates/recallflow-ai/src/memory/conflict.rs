//! Detection and reconciliation of overlapping long-term memories.
//!
//! Topics are derived with a deliberately simple heuristic: the three most
//! frequent significant words of a record (at least three characters, not a
//! stopword). Records of the same type sharing a topic form a
//! [`ConflictGroup`], which a [`ConflictStrategy`] reduces to one record.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::record::{MemoryRecord, MemoryType};
use crate::error::AiError;
use crate::llm::{CompletionRequest, LlmClient, Message};

pub const MERGE_PROMPT: &str = include_str!("templates/merge_prompt.md");

/// Topic assigned to records without a single significant word.
pub const DEFAULT_TOPIC: &str = "general";
const TOPIC_WORDS: usize = 3;
const MIN_TOPIC_WORD_LEN: usize = 3;
/// Group size at which the conflict score saturates.
const SCORE_SATURATION: f64 = 5.0;

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "been", "before", "being",
    "both", "but", "can", "could", "did", "does", "doing", "each", "for", "from", "had", "has",
    "have", "her", "here", "hers", "him", "his", "how", "into", "its", "just", "more", "most",
    "not", "now", "off", "once", "only", "other", "our", "out", "over", "own", "same", "she",
    "should", "some", "such", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "too", "under", "until", "user", "very", "was", "were",
    "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would",
    "you", "your",
];

pub const DEFAULT_MERGE_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default = "default_merge_temperature")]
    pub merge_temperature: f32,
    /// Model override for merge synthesis.
    #[serde(default)]
    pub merge_model: Option<String>,
}

fn default_merge_temperature() -> f32 {
    DEFAULT_MERGE_TEMPERATURE
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            merge_temperature: default_merge_temperature(),
            merge_model: None,
        }
    }
}

/// How a conflict group is reduced to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    NewestWins,
    ImportanceBased,
    /// LLM synthesis into a brand-new record.
    Merge,
    /// LLM synthesis written over the newest record.
    #[default]
    NewestWithMerge,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [
        ConflictStrategy::NewestWins,
        ConflictStrategy::ImportanceBased,
        ConflictStrategy::Merge,
        ConflictStrategy::NewestWithMerge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::ImportanceBased => "importance_based",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::NewestWithMerge => "newest_with_merge",
        }
    }

    /// Whether the losing records must be deleted from the store.
    pub fn implies_replacement(&self) -> bool {
        matches!(self, ConflictStrategy::Merge | ConflictStrategy::NewestWithMerge)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `snake_case` and `kebab-case` names.
impl FromStr for ConflictStrategy {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().replace('-', "_");
        ConflictStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(&name))
            .ok_or_else(|| {
                let known: Vec<&str> = ConflictStrategy::ALL.iter().map(|s| s.as_str()).collect();
                AiError::InvalidFormat(format!(
                    "unknown conflict strategy '{}', expected one of: {}",
                    s.trim(),
                    known.join(", ")
                ))
            })
    }
}

/// Records of one type sharing a derived topic.
#[derive(Debug, Clone)]
pub struct ConflictGroup {
    pub topic: String,
    pub members: Vec<MemoryRecord>,
    /// `min(1, members / 5)`.
    pub conflict_score: f64,
}

impl ConflictGroup {
    pub fn new(topic: impl Into<String>, members: Vec<MemoryRecord>) -> Self {
        let conflict_score = if members.len() > 1 {
            (members.len() as f64 / SCORE_SATURATION).min(1.0)
        } else {
            0.0
        };
        Self {
            topic: topic.into(),
            members,
            conflict_score,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.members.len() > 1
    }
}

/// Result of resolving one group.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: MemoryRecord,
    /// Ids of group members the store must delete.
    pub superseded: Vec<String>,
    /// True if the record was synthesized by the LLM.
    pub merged: bool,
}

/// Result of resolving a whole batch of candidates.
#[derive(Debug, Clone, Default)]
pub struct BatchResolution {
    pub kept: Vec<MemoryRecord>,
    pub superseded_ids: Vec<String>,
}

#[derive(Clone, Default)]
pub struct ConflictResolver {
    config: ConflictConfig,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { config, llm }
    }

    /// Topic key: top significant words by frequency, ties by first use.
    pub fn topic_key(content: &str) -> String {
        let words = topic_words(content);
        if words.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            words.join(" ")
        }
    }

    /// Group records by type, then by identical topic key.
    pub fn detect_conflicts(&self, records: &[MemoryRecord]) -> Vec<ConflictGroup> {
        let mut by_type: BTreeMap<MemoryType, BTreeMap<String, Vec<MemoryRecord>>> =
            BTreeMap::new();
        for record in records {
            by_type
                .entry(record.memory_type)
                .or_default()
                .entry(Self::topic_key(&record.content))
                .or_default()
                .push(record.clone());
        }

        by_type
            .into_values()
            .flat_map(BTreeMap::into_iter)
            .filter(|(_, members)| members.len() > 1)
            .map(|(topic, members)| ConflictGroup::new(topic, members))
            .collect()
    }

    /// Same type, same owner, and at least one shared topic word.
    pub fn may_conflict(a: &MemoryRecord, b: &MemoryRecord) -> bool {
        if a.memory_type != b.memory_type || !a.scope.same_owner(&b.scope) {
            return false;
        }
        let a_words: HashSet<String> = topic_words(&a.content).into_iter().collect();
        if a_words.is_empty() {
            return Self::topic_key(&b.content) == DEFAULT_TOPIC;
        }
        topic_words(&b.content).iter().any(|w| a_words.contains(w))
    }

    /// Reduce a group to one record. `None` only for an empty group.
    pub async fn resolve_group(
        &self,
        group: &ConflictGroup,
        strategy: ConflictStrategy,
    ) -> Option<Resolution> {
        let first = group.members.first()?;
        if !group.is_conflict() {
            return Some(Resolution {
                record: first.clone(),
                superseded: Vec::new(),
                merged: false,
            });
        }

        let (record, merged) = match strategy {
            ConflictStrategy::NewestWins => (newest(&group.members)?.clone(), false),
            ConflictStrategy::ImportanceBased => (most_important(&group.members)?.clone(), false),
            ConflictStrategy::Merge | ConflictStrategy::NewestWithMerge => {
                match self.merge(group, strategy).await {
                    Some(merged) => (merged, true),
                    None => {
                        tracing::debug!(topic = %group.topic, "Merge unavailable, newest record wins");
                        (newest(&group.members)?.clone(), false)
                    }
                }
            }
        };

        let superseded = if strategy.implies_replacement() {
            group
                .members
                .iter()
                .filter(|m| m.id != record.id)
                .map(|m| m.id.clone())
                .collect()
        } else {
            Vec::new()
        };

        tracing::debug!(
            topic = %group.topic,
            ?strategy,
            members = group.members.len(),
            merged,
            "Resolved memory conflict"
        );

        Some(Resolution {
            record,
            superseded,
            merged,
        })
    }

    /// Resolve conflicts inside a batch of fresh candidates.
    pub async fn resolve_batch(
        &self,
        records: Vec<MemoryRecord>,
        strategy: ConflictStrategy,
    ) -> BatchResolution {
        let groups = self.detect_conflicts(&records);
        if groups.is_empty() {
            return BatchResolution {
                kept: records,
                superseded_ids: Vec::new(),
            };
        }

        let grouped: HashSet<&str> = groups
            .iter()
            .flat_map(|g| g.members.iter().map(|m| m.id.as_str()))
            .collect();
        let mut kept: Vec<MemoryRecord> = records
            .iter()
            .filter(|r| !grouped.contains(r.id.as_str()))
            .cloned()
            .collect();
        let mut superseded_ids = Vec::new();

        for group in &groups {
            if let Some(resolution) = self.resolve_group(group, strategy).await {
                kept.push(resolution.record);
                superseded_ids.extend(resolution.superseded);
            }
        }

        BatchResolution {
            kept,
            superseded_ids,
        }
    }

    async fn merge(&self, group: &ConflictGroup, strategy: ConflictStrategy) -> Option<MemoryRecord> {
        let llm = self.llm.as_ref()?;

        let mut ordered: Vec<&MemoryRecord> = group.members.iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let newest = *ordered.last()?;

        let listing = ordered
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}", i + 1, r.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = CompletionRequest::new(vec![
            Message::system(MERGE_PROMPT),
            Message::user(format!("Topic: {}\n\n{}", group.topic, listing)),
        ])
        .with_temperature(self.config.merge_temperature);
        if let Some(model) = &self.config.merge_model {
            request = request.with_model(model.clone());
        }

        let text = match llm.complete_text(request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!(topic = %group.topic, "Merge returned empty text");
                return None;
            }
            Err(err) => {
                tracing::warn!(topic = %group.topic, error = %err, "Merge failed");
                return None;
            }
        };

        let importance = ordered
            .iter()
            .map(|r| r.importance)
            .fold(0.0_f64, f64::max);

        let merged = match strategy {
            ConflictStrategy::Merge => {
                MemoryRecord::new(newest.scope.clone(), newest.memory_type, text)
                    .with_decay_factor(newest.decay_factor)
            }
            _ => newest
                .clone()
                .with_content(text)
                .with_created_at(chrono::Utc::now().timestamp_millis().max(newest.created_at)),
        };
        Some(merged.with_importance(importance))
    }
}

/// Significant words ranked by frequency, ties broken by first position.
fn topic_words(content: &str) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let words = content
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_TOPIC_WORD_LEN && !STOPWORDS.contains(&w.as_str()));

    for (position, word) in words.enumerate() {
        counts.entry(word).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|(_, (ca, pa)), (_, (cb, pb))| cb.cmp(ca).then_with(|| pa.cmp(pb)));
    ranked
        .into_iter()
        .take(TOPIC_WORDS)
        .map(|(word, _)| word)
        .collect()
}

fn newest(members: &[MemoryRecord]) -> Option<&MemoryRecord> {
    members
        .iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| b.id.cmp(&a.id)))
}

fn most_important(members: &[MemoryRecord]) -> Option<&MemoryRecord> {
    members.iter().max_by(|a, b| {
        a.importance
            .total_cmp(&b.importance)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| b.id.cmp(&a.id))
    })
}
