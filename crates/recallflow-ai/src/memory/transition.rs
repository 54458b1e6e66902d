//! Session-boundary pipeline: extract, reconcile against stored memory,
//! embed, persist.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::conflict::{ConflictGroup, ConflictResolver, ConflictStrategy};
use super::extraction::MemoryExtractor;
use super::record::{MemoryRecord, MemoryScope};
use super::store::MemoryStore;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::llm::Message;

pub const DEFAULT_SIMILAR_TOP_K: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Existing records compared against each candidate.
    #[serde(default = "default_similar_top_k")]
    pub similar_top_k: usize,
    #[serde(default)]
    pub default_strategy: ConflictStrategy,
}

fn default_similar_top_k() -> usize {
    DEFAULT_SIMILAR_TOP_K
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            similar_top_k: default_similar_top_k(),
            default_strategy: ConflictStrategy::default(),
        }
    }
}

/// A record to write and the stored records it replaces.
struct PlannedWrite {
    record: MemoryRecord,
    supersedes: Vec<String>,
}

impl PlannedWrite {
    fn new(record: MemoryRecord) -> Self {
        Self {
            record,
            supersedes: Vec::new(),
        }
    }
}

pub struct TransitionService {
    config: TransitionConfig,
    extractor: Arc<dyn MemoryExtractor>,
    resolver: ConflictResolver,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl TransitionService {
    pub fn new(
        config: TransitionConfig,
        extractor: Arc<dyn MemoryExtractor>,
        resolver: ConflictResolver,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            extractor,
            resolver,
            store,
            embedder,
        }
    }

    /// Extract memories from `messages` and merge them into the store.
    ///
    /// Returns the records actually written. Records whose embedding fails
    /// are skipped and the records they would have replaced stay stored.
    /// Superseded records are only deleted once the new ones are saved.
    pub async fn extract_and_save(
        &self,
        scope: &MemoryScope,
        messages: &[Message],
    ) -> Result<Vec<MemoryRecord>> {
        let candidates = self.extractor.extract(scope, messages).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let strategy = self.config.default_strategy;
        let mut planned: Vec<PlannedWrite> = Vec::new();
        // Superseded by a stored record that won untouched.
        let mut retired: Vec<String> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();

        for candidate in candidates {
            let existing: Vec<MemoryRecord> = self
                .store
                .recall_similar(scope, &candidate.content, self.config.similar_top_k)
                .await?
                .into_iter()
                .filter(|r| !claimed.contains(&r.id))
                .filter(|r| ConflictResolver::may_conflict(r, &candidate))
                .collect();

            if existing.is_empty() {
                planned.push(PlannedWrite::new(candidate));
                continue;
            }

            let unchanged: Vec<MemoryRecord> = existing.clone();
            let mut members = existing;
            members.push(candidate);
            let topic = ConflictResolver::topic_key(&members[members.len() - 1].content);
            let group = ConflictGroup::new(topic, members);

            let Some(resolution) = self.resolver.resolve_group(&group, strategy).await else {
                continue;
            };

            let supersedes: Vec<String> = if strategy.implies_replacement() {
                resolution
                    .superseded
                    .iter()
                    .filter(|id| unchanged.iter().any(|r| &r.id == *id))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            claimed.extend(supersedes.iter().cloned());

            if unchanged.iter().any(|r| *r == resolution.record) {
                tracing::debug!(id = %resolution.record.id, "Existing memory kept as-is");
                retired.extend(supersedes);
                continue;
            }
            planned.push(PlannedWrite {
                record: resolution.record,
                supersedes,
            });
        }

        let mut records = Vec::with_capacity(planned.len());
        let mut embeddings = Vec::with_capacity(planned.len());
        let mut doomed = retired;
        for write in planned {
            match self.embedder.embed(&write.record.content).await {
                Ok(embedding) => {
                    records.push(write.record);
                    embeddings.push(embedding);
                    doomed.extend(write.supersedes);
                }
                Err(err) => {
                    tracing::warn!(
                        id = %write.record.id,
                        kept = write.supersedes.len(),
                        error = %err,
                        "Skipping memory without embedding"
                    );
                }
            }
        }

        if !records.is_empty() {
            self.store.save_all(&records, &embeddings).await?;
        }

        let mut superseded = 0usize;
        for id in &doomed {
            match self.store.delete(id).await {
                Ok(_) => superseded += 1,
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "Failed to delete superseded memory");
                }
            }
        }

        tracing::info!(
            scope = %scope,
            saved = records.len(),
            superseded,
            "Saved session memories"
        );
        Ok(records)
    }

    /// [`extract_and_save`](Self::extract_and_save) with every failure logged
    /// and swallowed.
    pub async fn on_session_end(
        &self,
        scope: &MemoryScope,
        session_messages: &[Message],
    ) -> Vec<MemoryRecord> {
        match self.extract_and_save(scope, session_messages).await {
            Ok(saved) => saved,
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "Session-end memory transition failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::embedding::MockEmbedding;
    use crate::llm::{MockLlmClient, MockStep};
    use crate::memory::conflict::ConflictConfig;
    use crate::memory::record::MemoryType;
    use crate::memory::store::InMemoryMemoryStore;

    struct FixedExtractor(Vec<MemoryRecord>);

    #[async_trait]
    impl MemoryExtractor for FixedExtractor {
        async fn extract(
            &self,
            _scope: &MemoryScope,
            _messages: &[Message],
        ) -> Result<Vec<MemoryRecord>> {
            Ok(self.0.clone())
        }
    }

    fn scope() -> MemoryScope {
        MemoryScope::new("acme", "alice")
    }

    /// Store whose batch writes fail while single writes and deletes work.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryMemoryStore,
    }

    #[async_trait]
    impl MemoryStore for FlakyStore {
        async fn save(&self, record: &MemoryRecord, embedding: &[f32]) -> Result<()> {
            self.inner.save(record, embedding).await
        }

        async fn save_all(&self, _records: &[MemoryRecord], _embeddings: &[Vec<f32>]) -> Result<()> {
            Err(crate::error::AiError::Store("disk full".to_string()))
        }

        async fn delete(&self, id: &str) -> Result<bool> {
            self.inner.delete(id).await
        }

        async fn recall_similar(
            &self,
            scope: &MemoryScope,
            text: &str,
            k: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner.recall_similar(scope, text, k).await
        }
    }

    fn pref(id: &str, content: &str, created_at: i64) -> MemoryRecord {
        MemoryRecord::new(scope(), MemoryType::Preference, content)
            .with_id(id)
            .with_created_at(created_at)
    }

    fn service(
        candidates: Vec<MemoryRecord>,
        strategy: ConflictStrategy,
        llm: Option<MockLlmClient>,
        store: Arc<InMemoryMemoryStore>,
        embedder: MockEmbedding,
    ) -> TransitionService {
        TransitionService::new(
            TransitionConfig {
                default_strategy: strategy,
                ..TransitionConfig::default()
            },
            Arc::new(FixedExtractor(candidates)),
            ConflictResolver::new(
                ConflictConfig::default(),
                llm.map(|l| Arc::new(l) as Arc<dyn crate::llm::LlmClient>),
            ),
            store,
            Arc::new(embedder),
        )
    }

    #[tokio::test]
    async fn unrelated_candidates_are_saved_as_is() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.save(&pref("old", "enjoys hiking", 1), &[0.0]).await.unwrap();
        let svc = service(
            vec![pref("new", "drinks coffee", 2)],
            ConflictStrategy::NewestWithMerge,
            None,
            store.clone(),
            MockEmbedding::new(4),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn newest_with_merge_without_llm_replaces_older_record() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store
            .save(&pref("old", "coffee preference: black", 100), &[0.0])
            .await
            .unwrap();
        let svc = service(
            vec![pref("new", "coffee preference: oat latte", 200)],
            ConflictStrategy::NewestWithMerge,
            None,
            store.clone(),
            MockEmbedding::new(4),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, "new");
        assert!(store.get("old").is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn merge_with_llm_deletes_all_sources() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.save(&pref("old", "drinks black coffee", 100), &[0.0]).await.unwrap();
        let llm = MockLlmClient::from_steps("m", vec![MockStep::text("User now drinks oat latte coffee")]);
        let svc = service(
            vec![pref("new", "drinks oat latte coffee", 200)],
            ConflictStrategy::Merge,
            Some(llm),
            store.clone(),
            MockEmbedding::new(4),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, "User now drinks oat latte coffee");
        assert_eq!(store.len(), 1);
        assert!(store.get("old").is_none());
    }

    #[tokio::test]
    async fn newest_wins_keeps_existing_records() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.save(&pref("old", "drinks black coffee", 300), &[0.0]).await.unwrap();
        let svc = service(
            vec![pref("new", "drinks coffee with milk", 200)],
            ConflictStrategy::NewestWins,
            None,
            store.clone(),
            MockEmbedding::new(4),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        // The stored record is newer and wins; nothing to write or delete.
        assert!(saved.is_empty());
        assert_eq!(store.len(), 1);
        assert!(store.get("old").is_some());
    }

    #[tokio::test]
    async fn failed_embeddings_are_skipped() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let svc = service(
            vec![pref("a", "likes tea", 1), pref("b", "plays chess", 2)],
            ConflictStrategy::NewestWithMerge,
            None,
            store.clone(),
            MockEmbedding::new(4).failing_on("tea"),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, "b");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_merge_embedding_keeps_superseded_record() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.save(&pref("old", "drinks black coffee", 100), &[0.0]).await.unwrap();
        let llm = MockLlmClient::from_steps("m", vec![MockStep::text("MERGED coffee drinker")]);
        let svc = service(
            vec![pref("new", "drinks oat latte coffee", 200)],
            ConflictStrategy::Merge,
            Some(llm),
            store.clone(),
            MockEmbedding::new(4).failing_on("MERGED"),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert!(saved.is_empty());
        assert_eq!(store.len(), 1);
        assert!(store.get("old").is_some());
    }

    #[tokio::test]
    async fn superseded_record_survives_a_failed_save() {
        let store = Arc::new(FlakyStore::default());
        store
            .inner
            .save(&pref("old", "coffee preference: black", 100), &[0.0])
            .await
            .unwrap();
        let svc = TransitionService::new(
            TransitionConfig::default(),
            Arc::new(FixedExtractor(vec![pref("new", "coffee preference: oat latte", 200)])),
            ConflictResolver::default(),
            store.clone(),
            Arc::new(MockEmbedding::new(4)),
        );

        assert!(svc.extract_and_save(&scope(), &[]).await.is_err());
        assert!(store.inner.get("old").is_some());
        assert!(store.inner.get("new").is_none());
    }

    #[tokio::test]
    async fn reconciliation_only_sees_top_k_similar_records() {
        let store = Arc::new(InMemoryMemoryStore::new());
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            store
                .save(&pref(id, &format!("coffee preference: blend {i}"), 10 + i as i64), &[0.0])
                .await
                .unwrap();
        }
        let svc = TransitionService::new(
            TransitionConfig {
                similar_top_k: 1,
                default_strategy: ConflictStrategy::NewestWithMerge,
            },
            Arc::new(FixedExtractor(vec![pref("new", "coffee preference: oat latte", 200)])),
            ConflictResolver::default(),
            store.clone(),
            Arc::new(MockEmbedding::new(4)),
        );

        let saved = svc.extract_and_save(&scope(), &[]).await.unwrap();

        assert_eq!(saved.len(), 1);
        // One stored neighbour was replaced; the other two were never compared.
        assert_eq!(store.len(), 3);
        assert!(store.get("new").is_some());
        assert!(store.get("c").is_none());
    }

    #[tokio::test]
    async fn session_end_swallows_store_errors() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store.set_fail_writes(true);
        let svc = service(
            vec![pref("a", "likes tea", 1)],
            ConflictStrategy::NewestWithMerge,
            None,
            store.clone(),
            MockEmbedding::new(4),
        );

        assert!(svc.on_session_end(&scope(), &[]).await.is_empty());
        assert!(svc.extract_and_save(&scope(), &[]).await.is_err());
    }
}
