//! Conversation truncation helper (spec §4.G.7): when a provider executor
//! reports a context-length failure, the Conductor drops the oldest
//! non-system messages and retries the same auth once before cooldown-ing
//! it.

use serde_json::Value;

/// Per-model context window, consulted to decide how aggressively to trim.
/// Falls back to a conservative default for unknown models.
pub fn model_context_limit(model: &str) -> u32 {
    let lower = model.to_ascii_lowercase();
    if lower.contains("gemini-3") || lower.contains("gemini-2.5") {
        1_048_576
    } else if lower.contains("gemini") {
        32_768
    } else if lower.contains("claude") {
        200_000
    } else if lower.contains("gpt-4.1") || lower.contains("gpt-5") {
        1_047_576
    } else if lower.contains("gpt-4o") || lower.contains("o3") || lower.contains("o4") {
        128_000
    } else {
        32_768
    }
}

/// Drops the oldest `fraction` (rounded up, at least one) of non-system
/// messages from a `{"messages": [...]}`-shaped payload, keeping every
/// leading `system` message untouched. Returns `false` when nothing could be
/// dropped (already down to the system messages plus one).
pub fn truncate_messages(payload: &mut Value, fraction: f32) -> bool {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };

    let system_prefix = messages
        .iter()
        .take_while(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .count();

    let droppable = messages.len().saturating_sub(system_prefix);
    if droppable <= 1 {
        return false;
    }

    let to_drop = ((droppable as f32 * fraction).ceil() as usize).clamp(1, droppable - 1);
    messages.drain(system_prefix..system_prefix + to_drop);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_system_messages_and_drops_oldest_fraction() {
        let mut payload = json!({
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "1"},
                {"role": "assistant", "content": "2"},
                {"role": "user", "content": "3"},
                {"role": "assistant", "content": "4"},
            ]
        });
        assert!(truncate_messages(&mut payload, 0.5));
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages.last().unwrap()["content"], "4");
    }

    #[test]
    fn refuses_to_drop_below_one_remaining_message() {
        let mut payload = json!({
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "only one left"},
            ]
        });
        assert!(!truncate_messages(&mut payload, 0.9));
    }

    #[test]
    fn model_context_limits_are_reasonable() {
        assert_eq!(model_context_limit("claude-sonnet-4-5"), 200_000);
        assert_eq!(model_context_limit("gemini-2.5-pro"), 1_048_576);
        assert!(model_context_limit("unknown-model") > 0);
    }
}
