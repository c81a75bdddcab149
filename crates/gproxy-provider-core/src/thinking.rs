//! Thinking/reasoning-effort budget injection (spec §4.F step 4): before an
//! executor sends its translated payload upstream, a "thinking" block is
//! injected or normalized against the target model's capability and the
//! requester's desired budget, or stripped entirely when the model doesn't
//! support it. Shared across every executor's request-preparation path
//! rather than duplicated per provider family, the same way
//! `truncate::model_context_limit` is one static table every executor
//! consults instead of each keeping its own copy.

use serde_json::Value;

/// Which upstream wire shape the thinking block takes. Picked from the
/// executor/provider identifier, not the client-facing dialect, since that's
/// what determines the payload's shape by the time it reaches this seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingDialect {
    /// `generationConfig.thinkingConfig.thinkingBudget` (Gemini family).
    Gemini,
    /// `thinking.budget_tokens` (Claude Messages API family).
    Claude,
    /// `reasoning_effort` (OpenAI-compatible family); enum-valued, so no
    /// numeric budget clamp applies — only stripped when unsupported.
    OpenAiReasoningEffort,
    /// No known thinking block for this provider; a no-op.
    None,
}

pub fn dialect_for_provider(provider: &str) -> ThinkingDialect {
    match provider {
        "gemini" | "vertex" | "vertex_express" | "aistudio" | "geminicli" | "antigravity" => {
            ThinkingDialect::Gemini
        }
        "claude" | "claudecode" => ThinkingDialect::Claude,
        "codex" | "copilot" | "minimax" | "deepseek" | "nvidia" | "custom" => {
            ThinkingDialect::OpenAiReasoningEffort
        }
        _ => ThinkingDialect::None,
    }
}

/// Min/max thinking-token budget a model accepts, from a static capability
/// registry (spec §4.F step 4 "min/max budget from the static registry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingCapability {
    pub min_budget: u32,
    pub max_budget: u32,
}

/// Returns `None` when the model doesn't support a thinking block at all —
/// the caller should then strip any thinking block the client requested.
pub fn thinking_capability(model: &str) -> Option<ThinkingCapability> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("claude-opus-4") || lower.contains("claude-sonnet-4") || lower.contains("claude-3-7") {
        Some(ThinkingCapability { min_budget: 1024, max_budget: 65_536 })
    } else if lower.contains("gemini-3") || lower.contains("gemini-2.5") {
        Some(ThinkingCapability { min_budget: 0, max_budget: 32_768 })
    } else if lower.contains("gpt-5") || lower.contains("o3") || lower.contains("o4") {
        // OpenAI reasoning-effort models: enum-valued, not budget-valued, but
        // still "supports thinking" for the strip-if-unsupported check.
        Some(ThinkingCapability { min_budget: 0, max_budget: 0 })
    } else {
        None
    }
}

pub fn is_claude_family(model: &str) -> bool {
    model.to_ascii_lowercase().contains("claude")
}

fn clamp_budget(requested: Option<u32>, cap: ThinkingCapability, max_tokens_minus_one: Option<u32>) -> u32 {
    let mut budget = requested.unwrap_or(cap.max_budget).clamp(cap.min_budget, cap.max_budget);
    if let Some(ceiling) = max_tokens_minus_one {
        budget = budget.min(ceiling);
    }
    budget
}

/// Applies or strips the thinking block in place. `clamp_to_max_tokens_minus_one`
/// is the Claude-via-Antigravity rule (§4.F: "for Claude via Antigravity,
/// clamp budget to `max_tokens - 1`"). Returns `true` when the payload was
/// changed.
pub fn apply_thinking_budget(
    payload: &mut Value,
    model: &str,
    dialect: ThinkingDialect,
    clamp_to_max_tokens_minus_one: bool,
) -> bool {
    match dialect {
        ThinkingDialect::Gemini => apply_gemini(payload, model, clamp_to_max_tokens_minus_one),
        ThinkingDialect::Claude => apply_claude(payload, model, clamp_to_max_tokens_minus_one),
        ThinkingDialect::OpenAiReasoningEffort => apply_openai(payload, model),
        ThinkingDialect::None => false,
    }
}

fn apply_gemini(payload: &mut Value, model: &str, clamp_to_max_tokens_minus_one: bool) -> bool {
    let Some(cap) = thinking_capability(model) else {
        let Some(gen_config) = payload.get_mut("generationConfig").and_then(Value::as_object_mut) else {
            return false;
        };
        return gen_config.remove("thinkingConfig").is_some();
    };

    let max_tokens_minus_one = clamp_to_max_tokens_minus_one
        .then(|| {
            payload
                .get("generationConfig")
                .and_then(|c| c.get("maxOutputTokens"))
                .and_then(Value::as_u64)
                .map(|t| (t as u32).saturating_sub(1))
        })
        .flatten();

    let gen_config = payload
        .as_object_mut()
        .expect("Gemini payload is always an object")
        .entry("generationConfig")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));

    let requested = gen_config
        .get("thinkingConfig")
        .and_then(|tc| tc.get("thinkingBudget"))
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    let budget = clamp_budget(requested, cap, max_tokens_minus_one);

    gen_config["thinkingConfig"] = serde_json::json!({
        "includeThoughts": true,
        "thinkingBudget": budget,
    });
    true
}

fn apply_claude(payload: &mut Value, model: &str, clamp_to_max_tokens_minus_one: bool) -> bool {
    let Some(cap) = thinking_capability(model) else {
        return payload
            .as_object_mut()
            .map(|obj| obj.remove("thinking").is_some())
            .unwrap_or(false);
    };

    let max_tokens_minus_one = clamp_to_max_tokens_minus_one
        .then(|| payload.get("max_tokens").and_then(Value::as_u64).map(|t| (t as u32).saturating_sub(1)))
        .flatten();

    let requested = payload
        .get("thinking")
        .and_then(|t| t.get("budget_tokens"))
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    let budget = clamp_budget(requested, cap, max_tokens_minus_one);

    payload["thinking"] = serde_json::json!({
        "type": "enabled",
        "budget_tokens": budget,
    });
    true
}

fn apply_openai(payload: &mut Value, model: &str) -> bool {
    if thinking_capability(model).is_some() {
        return false;
    }
    payload
        .as_object_mut()
        .map(|obj| obj.remove("reasoning_effort").is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_gemini_thinking_budget_for_capable_model() {
        let mut payload = serde_json::json!({"contents": []});
        let changed = apply_thinking_budget(&mut payload, "gemini-2.5-pro", ThinkingDialect::Gemini, false);
        assert!(changed);
        assert_eq!(payload["generationConfig"]["thinkingConfig"]["thinkingBudget"], 32_768);
    }

    #[test]
    fn strips_gemini_thinking_config_for_incapable_model() {
        let mut payload = serde_json::json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1000, "includeThoughts": true}},
        });
        let changed = apply_thinking_budget(&mut payload, "gemini-1.0-pro", ThinkingDialect::Gemini, false);
        assert!(changed);
        assert!(payload["generationConfig"].get("thinkingConfig").is_none());
    }

    #[test]
    fn clamps_claude_budget_below_requested_max() {
        let mut payload = serde_json::json!({"thinking": {"type": "enabled", "budget_tokens": 999_999}});
        apply_thinking_budget(&mut payload, "claude-sonnet-4-5", ThinkingDialect::Claude, false);
        assert_eq!(payload["thinking"]["budget_tokens"], 65_536);
    }

    #[test]
    fn clamps_claude_via_antigravity_to_max_tokens_minus_one() {
        let mut payload = serde_json::json!({"max_tokens": 2000, "thinking": {"budget_tokens": 65_000}});
        apply_thinking_budget(&mut payload, "claude-opus-4-1", ThinkingDialect::Claude, true);
        assert_eq!(payload["thinking"]["budget_tokens"], 1999);
    }

    #[test]
    fn openai_reasoning_effort_stripped_when_model_cannot_think() {
        let mut payload = serde_json::json!({"reasoning_effort": "high"});
        let changed = apply_thinking_budget(&mut payload, "gpt-4o", ThinkingDialect::OpenAiReasoningEffort, false);
        assert!(changed);
        assert!(payload.get("reasoning_effort").is_none());
    }

    #[test]
    fn openai_reasoning_effort_kept_for_capable_model() {
        let mut payload = serde_json::json!({"reasoning_effort": "high"});
        let changed = apply_thinking_budget(&mut payload, "gpt-5", ThinkingDialect::OpenAiReasoningEffort, false);
        assert!(!changed);
        assert_eq!(payload["reasoning_effort"], "high");
    }
}
