//! Storage seams for long-term memory and chat history.
//!
//! The engine only talks to [`MemoryStore`] and [`ChatHistoryStore`]; vector
//! search and persistence live behind them. The in-memory backends here are
//! used by tests and the CLI and are enough for a single process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::record::{MemoryRecord, MemoryScope};
use crate::embedding::ensure_vector_count;
use crate::error::{AiError, Result};
use crate::llm::Message;

/// Long-term memory backend.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert or replace a record by id.
    async fn save(&self, record: &MemoryRecord, embedding: &[f32]) -> Result<()>;

    /// Save records with their embeddings, pairwise.
    ///
    /// Fails without writing anything when the counts differ.
    async fn save_all(&self, records: &[MemoryRecord], embeddings: &[Vec<f32>]) -> Result<()> {
        ensure_vector_count(records.len(), embeddings)?;
        for (record, embedding) in records.iter().zip(embeddings) {
            self.save(record, embedding).await?;
        }
        Ok(())
    }

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Up to `k` records owned by `scope`, most similar to `text` first.
    async fn recall_similar(
        &self,
        scope: &MemoryScope,
        text: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>>;
}

/// Per-scope conversation log with an extraction watermark.
///
/// Positions are indices into the full log for the scope.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn load(&self, scope: &MemoryScope) -> Result<Vec<Message>>;

    /// Messages after the last position passed to [`mark_extracted`](Self::mark_extracted).
    async fn load_unextracted(&self, scope: &MemoryScope) -> Result<Vec<(usize, Message)>>;

    async fn count(&self, scope: &MemoryScope) -> Result<usize>;

    async fn mark_extracted(&self, scope: &MemoryScope, last_index: i64) -> Result<()>;

    async fn save(&self, scope: &MemoryScope, message: Message) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: MemoryRecord,
    embedding: Vec<f32>,
}

/// `MemoryStore` backed by a map, ranking by word overlap.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    records: RwLock<HashMap<String, StoredRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`AiError::Store`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.records.read().get(id).map(|s| s.record.clone())
    }

    pub fn embedding(&self, id: &str) -> Option<Vec<f32>> {
        self.records.read().get(id).map(|s| s.embedding.clone())
    }

    /// All records owned by `scope`, oldest first.
    pub fn list(&self, scope: &MemoryScope) -> Vec<MemoryRecord> {
        let mut records: Vec<MemoryRecord> = self
            .records
            .read()
            .values()
            .filter(|s| s.record.scope.same_owner(scope))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AiError::Store("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn save(&self, record: &MemoryRecord, embedding: &[f32]) -> Result<()> {
        self.check_writable()?;
        self.records.write().insert(
            record.id.clone(),
            StoredRecord {
                record: record.clone(),
                embedding: embedding.to_vec(),
            },
        );
        Ok(())
    }

    async fn save_all(&self, records: &[MemoryRecord], embeddings: &[Vec<f32>]) -> Result<()> {
        ensure_vector_count(records.len(), embeddings)?;
        self.check_writable()?;
        let mut guard = self.records.write();
        for (record, embedding) in records.iter().zip(embeddings) {
            guard.insert(
                record.id.clone(),
                StoredRecord {
                    record: record.clone(),
                    embedding: embedding.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.records.write().remove(id).is_some())
    }

    async fn recall_similar(
        &self,
        scope: &MemoryScope,
        text: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let query = words(text);
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let guard = self.records.read();
        let mut ranked: Vec<(usize, &MemoryRecord)> = guard
            .values()
            .filter(|s| s.record.scope.same_owner(scope))
            .map(|s| (words(&s.record.content).intersection(&query).count(), &s.record))
            .filter(|(overlap, _)| *overlap > 0)
            .collect();

        ranked.sort_by(|(oa, a), (ob, b)| {
            ob.cmp(oa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug)]
struct ScopeLog {
    messages: Vec<Message>,
    last_extracted: i64,
}

/// `ChatHistoryStore` backed by a map of per-scope logs.
#[derive(Debug, Default)]
pub struct InMemoryChatHistoryStore {
    logs: RwLock<HashMap<String, ScopeLog>>,
}

impl InMemoryChatHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watermark last recorded for `scope`, `-1` if none.
    pub fn last_extracted(&self, scope: &MemoryScope) -> i64 {
        self.logs
            .read()
            .get(&scope.key())
            .map_or(-1, |log| log.last_extracted)
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryChatHistoryStore {
    async fn load(&self, scope: &MemoryScope) -> Result<Vec<Message>> {
        Ok(self
            .logs
            .read()
            .get(&scope.key())
            .map(|log| log.messages.clone())
            .unwrap_or_default())
    }

    async fn load_unextracted(&self, scope: &MemoryScope) -> Result<Vec<(usize, Message)>> {
        let guard = self.logs.read();
        let Some(log) = guard.get(&scope.key()) else {
            return Ok(Vec::new());
        };
        Ok(log
            .messages
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx as i64 > log.last_extracted)
            .map(|(idx, msg)| (idx, msg.clone()))
            .collect())
    }

    async fn count(&self, scope: &MemoryScope) -> Result<usize> {
        Ok(self
            .logs
            .read()
            .get(&scope.key())
            .map_or(0, |log| log.messages.len()))
    }

    async fn mark_extracted(&self, scope: &MemoryScope, last_index: i64) -> Result<()> {
        let mut guard = self.logs.write();
        let log = guard.entry(scope.key()).or_insert_with(|| ScopeLog {
            messages: Vec::new(),
            last_extracted: -1,
        });
        log.last_extracted = log.last_extracted.max(last_index);
        Ok(())
    }

    async fn save(&self, scope: &MemoryScope, message: Message) -> Result<()> {
        self.logs
            .write()
            .entry(scope.key())
            .or_insert_with(|| ScopeLog {
                messages: Vec::new(),
                last_extracted: -1,
            })
            .messages
            .push(message);
        Ok(())
    }
}
