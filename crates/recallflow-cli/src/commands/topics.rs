use anyhow::Result;
use comfy_table::{Cell, Table};
use recallflow_ai::memory::{
    ConflictResolver, ConflictStrategy, MemoryRecord, MemoryScope, MemoryType,
};
use serde::{Deserialize, Serialize};

use crate::cli::TopicsArgs;
use crate::commands::shared::read_json;
use crate::output::{OutputFormat, print_json, print_table};

#[derive(Debug, Deserialize)]
struct RecordInput {
    #[serde(rename = "type")]
    memory_type: MemoryType,
    content: String,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    id: Option<String>,
}

impl RecordInput {
    fn into_record(self, scope: &MemoryScope) -> MemoryRecord {
        let mut record = MemoryRecord::new(scope.clone(), self.memory_type, self.content);
        if let Some(importance) = self.importance {
            record = record.with_importance(importance);
        }
        if let Some(created_at) = self.created_at {
            record = record.with_created_at(created_at);
        }
        if let Some(id) = self.id {
            record = record.with_id(id);
        }
        record
    }
}

#[derive(Debug, Serialize)]
struct TopicGroup {
    topic: String,
    memory_type: MemoryType,
    members: Vec<String>,
    conflict_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    superseded: Vec<String>,
}

pub async fn run(args: TopicsArgs, format: OutputFormat) -> Result<()> {
    let inputs: Vec<RecordInput> = read_json(&args.records)?;
    let scope = MemoryScope::new(args.tenant, args.user);
    let records: Vec<MemoryRecord> = inputs.into_iter().map(|r| r.into_record(&scope)).collect();

    // Offline: merge strategies fall back to the newest record.
    let resolver = ConflictResolver::default();
    let strategy: Option<ConflictStrategy> = args.strategy;

    let mut groups = Vec::new();
    for group in resolver.detect_conflicts(&records) {
        let Some(memory_type) = group.members.first().map(|m| m.memory_type) else {
            continue;
        };
        let resolution = match strategy {
            Some(strategy) => resolver.resolve_group(&group, strategy).await,
            None => None,
        };
        groups.push(TopicGroup {
            topic: group.topic,
            memory_type,
            members: group.members.iter().map(|m| m.content.clone()).collect(),
            conflict_score: group.conflict_score,
            resolved: resolution.as_ref().map(|r| r.record.content.clone()),
            superseded: resolution.map(|r| r.superseded).unwrap_or_default(),
        });
    }
    tracing::info!(records = records.len(), groups = groups.len(), "Detected topic conflicts");

    if format.is_json() {
        return print_json(&groups);
    }

    if groups.is_empty() {
        println!("No conflicting records.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Topic"),
        Cell::new("Type"),
        Cell::new("Members"),
        Cell::new("Score"),
        Cell::new("Resolved"),
    ]);
    for group in &groups {
        table.add_row(vec![
            Cell::new(&group.topic),
            Cell::new(group.memory_type.to_string()),
            Cell::new(group.members.join("\n")),
            Cell::new(format!("{:.2}", group.conflict_score)),
            Cell::new(group.resolved.as_deref().unwrap_or("-")),
        ]);
    }
    print_table(table);
    Ok(())
}
