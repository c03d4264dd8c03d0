//! Derived statistics over the active session's message log

use std::collections::HashMap;

use streams_core::{ConversationMessage, MessageKind, TokenUsage, UsageTotals};

/// Headline numbers for a session, recomputed from a log snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Model reported by the most recent assistant message that named one.
    pub model: Option<String>,
    /// Context occupancy taken from the most recent assistant usage: live
    /// input plus cache creation plus cache read.
    pub context_tokens: u64,
    /// User messages typed by a human (tool-result carriers excluded).
    pub human_count: usize,
    pub assistant_count: usize,
}

impl SessionStats {
    pub fn from_messages(messages: &[ConversationMessage]) -> Self {
        let mut stats = SessionStats::default();
        let mut last_usage: Option<TokenUsage> = None;

        for msg in messages {
            match msg.kind {
                MessageKind::User if !msg.is_tool_result() => stats.human_count += 1,
                MessageKind::Assistant => {
                    stats.assistant_count += 1;
                    if let Some(payload) = &msg.message {
                        if let Some(model) = &payload.model {
                            stats.model = Some(model.clone());
                        }
                        if let Some(usage) = payload.usage {
                            last_usage = Some(usage);
                        }
                    }
                }
                _ => {}
            }
        }

        stats.context_tokens = last_usage.map(|u| u.context_tokens()).unwrap_or(0);
        stats
    }
}

/// Compact model label: `claude-opus-4-5-20251101` becomes `opus-4.5`.
/// Names that do not follow the `claude-<family>-<major>-<minor>` shape are
/// returned unchanged.
pub fn short_model(model: &str) -> String {
    let parts: Vec<&str> = model.split('-').collect();
    if parts.len() >= 4
        && parts[0] == "claude"
        && !parts[2].is_empty()
        && parts[2].chars().all(|c| c.is_ascii_digit())
        && !parts[3].is_empty()
        && parts[3].chars().all(|c| c.is_ascii_digit())
    {
        format!("{}-{}.{}", parts[1], parts[2], parts[3])
    } else {
        model.to_string()
    }
}

/// Aggregate token usage per model across the log, for cost estimation.
/// Messages without a model name or usage counters contribute nothing.
pub fn usage_totals_by_model(messages: &[ConversationMessage]) -> HashMap<String, UsageTotals> {
    let mut totals: HashMap<String, UsageTotals> = HashMap::new();
    for msg in messages {
        let Some(payload) = &msg.message else { continue };
        let (Some(model), Some(usage)) = (&payload.model, &payload.usage) else {
            continue;
        };
        totals.entry(model.clone()).or_default().add(usage);
    }
    totals
}
