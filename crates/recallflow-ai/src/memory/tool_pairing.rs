//! Tool-call pairing analysis.
//!
//! An assistant message that requests tools is resolved only once every call
//! id has a matching tool-result message. History may only be cut where no
//! call is waiting for its result.

use std::collections::HashSet;

use crate::llm::{Message, Role};

/// Ids of tool calls that have no result message yet, in request order.
pub fn pending_tool_calls(messages: &[Message]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut pending: HashSet<&str> = HashSet::new();

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                for call in msg.tool_calls() {
                    if pending.insert(call.id.as_str()) {
                        order.push(call.id.clone());
                    }
                }
            }
            Role::Tool => {
                if let Some(id) = msg.tool_call_id.as_deref() {
                    pending.remove(id);
                }
            }
            Role::System | Role::User => {}
        }
    }

    order.retain(|id| pending.contains(id.as_str()));
    order
}

/// True if any tool call in the sequence is still waiting for its result.
pub fn has_unresolved_tool_calls(messages: &[Message]) -> bool {
    !pending_tool_calls(messages).is_empty()
}

/// Indices of user messages reached with zero pending tool calls.
///
/// Each index starts a turn; truncating the history so that it begins at one
/// of these indices never separates a tool call from its result.
pub fn safe_cut_points(messages: &[Message]) -> Vec<usize> {
    let mut pending: HashSet<&str> = HashSet::new();
    let mut points = Vec::new();

    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::User => {
                if pending.is_empty() {
                    points.push(idx);
                }
            }
            Role::Assistant => {
                for call in msg.tool_calls() {
                    pending.insert(call.id.as_str());
                }
            }
            Role::Tool => {
                if let Some(id) = msg.tool_call_id.as_deref() {
                    pending.remove(id);
                }
            }
            Role::System => {}
        }
    }

    points
}

/// True if splitting at `split` leaves no tool result in `messages[split..]`
/// answering a call issued in `messages[..split]`.
pub fn is_clean_split(messages: &[Message], split: usize) -> bool {
    let split = split.min(messages.len());
    let issued_before: HashSet<&str> = messages[..split]
        .iter()
        .flat_map(|m| m.tool_calls().iter().map(|c| c.id.as_str()))
        .collect();

    messages[split..].iter().all(|m| {
        m.role != Role::Tool
            || m
                .tool_call_id
                .as_deref()
                .is_none_or(|id| !issued_before.contains(id))
    })
}

/// Largest clean split index that is `<= from`.
pub fn clean_split_at_or_before(messages: &[Message], from: usize) -> usize {
    let mut split = from.min(messages.len());
    while split > 0 && !is_clean_split(messages, split) {
        split -= 1;
    }
    split
}
