//! End-to-end behaviour of the memory engine across components.

use std::sync::Arc;
use std::time::Duration;

use recallflow_ai::embedding::MockEmbedding;
use recallflow_ai::llm::{Message, MockLlmClient, MockStep, Role, ToolCall};
use recallflow_ai::memory::{
    BudgetConfig, ChatHistoryStore, CompressionConfig, CompressionEngine, ConflictGroup,
    ConflictResolver, ConflictStrategy, ContextBudgetManager, ContextGuard, ExtractionConfig,
    ExtractionCoordinator, LlmMemoryExtractor, InMemoryChatHistoryStore, InMemoryMemoryStore,
    MemoryRecord, MemoryScope, MemoryType, SlidingWindowConfig, SlidingWindowEngine, TokenCounter,
    pending_tool_calls,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn scope() -> MemoryScope {
    MemoryScope::new("acme", "alice").with_session("session-1")
}

const THREE_MEMORIES: &str = r#"[
    {"type": "fact", "content": "User works at Acme", "importance": 0.8},
    {"type": "preference", "content": "User prefers tea", "importance": 0.6},
    {"type": "event", "content": "User moves to Oslo in May", "importance": 0.5}
]"#;

async fn add_turns(history: &InMemoryChatHistoryStore, from: usize, turns: usize) {
    for i in from..from + turns {
        history
            .save(&scope(), Message::user(format!("message {i}")))
            .await
            .unwrap();
        history
            .save(&scope(), Message::assistant(format!("reply {i}")))
            .await
            .unwrap();
    }
}

fn coordinator(
    config: ExtractionConfig,
    llm: &MockLlmClient,
    history: Arc<InMemoryChatHistoryStore>,
    store: Arc<InMemoryMemoryStore>,
    embedder: MockEmbedding,
) -> ExtractionCoordinator {
    ExtractionCoordinator::new(
        config,
        Arc::new(LlmMemoryExtractor::new(Arc::new(llm.clone()))),
        history,
        store,
        Arc::new(embedder),
    )
}

/// Deterministic mixed conversation: plain turns, tool turns, parallel calls.
fn mixed_conversation(seed: usize, turns: usize) -> Vec<Message> {
    let mut msgs = vec![Message::system("You are a helpful assistant.")];
    for i in 0..turns {
        msgs.push(Message::user(format!("turn {i} {}", "u".repeat((seed * 7 + i * 13) % 90))));
        match (seed + i) % 3 {
            0 => msgs.push(Message::assistant(format!("plain {i}"))),
            1 => {
                let id = format!("c{seed}_{i}");
                msgs.push(Message::assistant_with_tool_calls(
                    None,
                    vec![ToolCall::new(id.clone(), "bash", json!({"cmd": "ls"}))],
                ));
                msgs.push(Message::tool_result(id, "r".repeat((seed * 31 + i) % 400)));
                msgs.push(Message::assistant(format!("done {i}")));
            }
            _ => {
                let a = format!("a{seed}_{i}");
                let b = format!("b{seed}_{i}");
                msgs.push(Message::assistant_with_tool_calls(
                    Some("checking two things".to_string()),
                    vec![
                        ToolCall::new(a.clone(), "read", json!({"path": "a"})),
                        ToolCall::new(b.clone(), "read", json!({"path": "b"})),
                    ],
                ));
                msgs.push(Message::tool_result(a, "alpha"));
                msgs.push(Message::tool_result(b, "beta"));
            }
        }
    }
    msgs
}

fn assert_no_orphans(msgs: &[Message]) {
    for (idx, msg) in msgs.iter().enumerate() {
        if msg.role == Role::Tool {
            let id = msg.tool_call_id.as_deref().unwrap();
            assert!(
                msgs[..idx]
                    .iter()
                    .any(|m| m.tool_calls().iter().any(|c| c.id == id)),
                "tool result {id} has no preceding call"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Short-term context
// ---------------------------------------------------------------------------

#[test]
fn slide_never_starts_mid_tool_exchange() {
    for seed in 0..12 {
        let msgs = mixed_conversation(seed, 15);
        for max_tokens in [200, 500, 1_000, 5_000] {
            let engine = SlidingWindowEngine::new(SlidingWindowConfig {
                max_turns: 4,
                max_tokens,
                ..SlidingWindowConfig::default()
            });
            let kept = engine.slide(msgs.clone());
            assert_eq!(kept[0].role, Role::System);
            assert_eq!(kept[1].role, Role::User);
            assert_no_orphans(&kept);
            assert!(pending_tool_calls(&kept).is_empty());
        }
    }
}

#[test]
fn unresolved_call_blocks_slide_regardless_of_size() {
    let engine = SlidingWindowEngine::new(SlidingWindowConfig {
        max_turns: 0,
        max_tokens: 1,
        ..SlidingWindowConfig::default()
    });
    let mut msgs = mixed_conversation(3, 40);
    msgs.push(Message::user("hi"));
    msgs.push(Message::assistant_with_tool_calls(
        None,
        vec![ToolCall::new("c1", "search", json!({"q": "x"}))],
    ));
    assert!(!engine.should_slide(&msgs));
}

#[tokio::test]
async fn compressed_history_is_stable_under_repeated_guarding() {
    let llm = MockLlmClient::from_steps(
        "summarizer",
        vec![MockStep::text("User set up the project; all tool runs succeeded.")],
    );
    let guard = ContextGuard::new(
        SlidingWindowEngine::new(SlidingWindowConfig {
            max_turns: 1_000,
            auto_protect: false,
            ..SlidingWindowConfig::default()
        }),
        CompressionEngine::new(
            CompressionConfig {
                max_context_tokens: 3_000,
                keep_recent_turns: 3,
                ..CompressionConfig::default()
            },
            Some(Arc::new(llm.clone())),
        ),
    );

    let first = guard.prepare(mixed_conversation(1, 120)).await;
    assert!(first.compressed);
    assert_no_orphans(&first.messages);
    assert!(
        !guard
            .compression()
            .should_compress(TokenCounter::default().count_messages(&first.messages))
    );

    let second = guard.prepare(first.messages.clone()).await;
    assert!(!second.compressed);
    assert_eq!(second.messages, first.messages);
    assert_eq!(llm.requests().await.len(), 1);
}

// ---------------------------------------------------------------------------
// Budget and conflicts
// ---------------------------------------------------------------------------

#[test]
fn selection_is_never_empty_with_positive_budget() {
    let manager = ContextBudgetManager::new(BudgetConfig::default());
    let candidates: Vec<MemoryRecord> = (0..6)
        .map(|i| {
            MemoryRecord::new(scope(), MemoryType::Fact, "w".repeat(50 * (i + 1)))
                .with_importance(0.1 * i as f64)
        })
        .collect();

    for budget in [1, 5, 20, 100, 1_000] {
        for n in 1..=candidates.len() {
            let selected = manager.select_within_budget(candidates[..n].to_vec(), budget);
            assert!(!selected.is_empty(), "budget {budget}, {n} candidates");
        }
    }
}

#[tokio::test]
async fn newest_wins_is_order_independent() {
    let resolver = ConflictResolver::default();
    let base: Vec<MemoryRecord> = [40, 10, 30, 20]
        .into_iter()
        .enumerate()
        .map(|(i, ts)| {
            MemoryRecord::new(scope(), MemoryType::Preference, format!("drinks coffee {i}"))
                .with_id(format!("r{ts}"))
                .with_created_at(ts)
        })
        .collect();

    let orders: [[usize; 4]; 6] = [
        [0, 1, 2, 3],
        [3, 2, 1, 0],
        [1, 3, 0, 2],
        [2, 0, 3, 1],
        [1, 0, 2, 3],
        [3, 1, 2, 0],
    ];
    for order in orders {
        let members = order.iter().map(|&i| base[i].clone()).collect();
        let resolution = resolver
            .resolve_group(&ConflictGroup::new("coffee", members), ConflictStrategy::NewestWins)
            .await
            .unwrap();
        assert_eq!(resolution.record.id, "r40");
    }
}

#[tokio::test]
async fn coffee_preference_merge_without_llm_keeps_latest() {
    let resolver = ConflictResolver::default();
    let earlier = MemoryRecord::new(scope(), MemoryType::Preference, "coffee preference: espresso")
        .with_created_at(1_000);
    let later = MemoryRecord::new(scope(), MemoryType::Preference, "coffee preference: flat white")
        .with_created_at(2_000);

    let group = ConflictGroup::new("coffee preference", vec![later.clone(), earlier.clone()]);
    let resolution = resolver
        .resolve_group(&group, ConflictStrategy::NewestWithMerge)
        .await
        .unwrap();

    assert_eq!(resolution.record, later);
    assert_eq!(resolution.superseded, vec![earlier.id]);
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_trigger_is_a_no_op_and_index_advances_once() {
    let llm = MockLlmClient::from_steps(
        "extractor",
        vec![MockStep::text(THREE_MEMORIES).with_delay(150)],
    );
    let history = Arc::new(InMemoryChatHistoryStore::new());
    let store = Arc::new(InMemoryMemoryStore::new());
    let coordinator = coordinator(
        ExtractionConfig {
            max_buffer_turns: 2,
            ..ExtractionConfig::default()
        },
        &llm,
        history.clone(),
        store.clone(),
        MockEmbedding::new(8),
    );
    add_turns(&history, 0, 2).await;

    let first = coordinator.trigger_extraction(&scope()).await;
    assert!(first.is_some());
    // Let the batch load its input before more turns arrive.
    tokio::time::sleep(Duration::from_millis(30)).await;
    add_turns(&history, 2, 2).await;

    assert!(coordinator.trigger_extraction(&scope()).await.is_none());
    assert!(!coordinator.should_extract(&scope()).await);

    assert!(
        coordinator
            .wait_for_completion(&scope(), Duration::from_secs(5))
            .await
    );

    assert_eq!(llm.requests().await.len(), 1);
    assert_eq!(store.len(), 3);
    assert_eq!(coordinator.state(&scope()).last_extracted_index, 3);
    // The backlog is picked up by the next natural trigger.
    assert!(coordinator.should_extract(&scope()).await);
}

#[tokio::test]
async fn embedding_shortfall_aborts_whole_batch() {
    let llm = MockLlmClient::from_steps("extractor", vec![MockStep::text(THREE_MEMORIES)]);
    let history = Arc::new(InMemoryChatHistoryStore::new());
    let store = Arc::new(InMemoryMemoryStore::new());
    let coordinator = coordinator(
        ExtractionConfig {
            max_buffer_turns: 1,
            run_in_background: false,
            ..ExtractionConfig::default()
        },
        &llm,
        history.clone(),
        store.clone(),
        MockEmbedding::new(8).with_batch_shortfall(1),
    );
    add_turns(&history, 0, 2).await;

    coordinator.trigger_extraction(&scope()).await;

    assert!(store.is_empty());
    assert_eq!(coordinator.state(&scope()).last_extracted_index, -1);
    assert_eq!(history.load_unextracted(&scope()).await.unwrap().len(), 4);
}
