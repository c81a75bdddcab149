//! Antigravity executor (spec §4.F, §4.G.7): the same Google internal-API
//! shape as GeminiCli, plus inbound conversation truncation when a request's
//! `contents` would overrun the target model's context window. The generic
//! `gproxy_provider_core::truncate_messages` helper assumes an OpenAI-style
//! flat `messages` array; Gemini's `contents` array needs its own walk, kept
//! local to this executor rather than folded into the shared helper.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, InMemoryMemoryStore, MemoryEvent, MemoryStore, Options,
    ProviderExecutor, Request, Response, StreamChunk, UnavailableDecision, UpstreamFailure,
    UpstreamHttpRequest, UpstreamPassthroughError, model_context_limit, session_id_from_metadata,
};
use serde_json::Value;

use crate::providers::google_cli::GoogleCliExecutor;

/// §4.G.7 step 2's safety factor: truncate down to 70% of the model's
/// context window, never the raw limit.
const SAFETY_FACTOR: f64 = 0.7;
/// §4.G.7 step 7: at most this many characters of stored summary are
/// prepended to the system instruction.
const MAX_SUMMARY_PREPEND_CHARS: usize = 8_000;
/// §4.G.7 step 5: the anchored summary's "latest user intent" is capped here.
const MAX_LATEST_INTENT_CHARS: usize = 1_500;
const SESSION_CONTEXT_HEADER: &str = "Session Context (from previous turns)";

pub struct AntigravityExecutor {
    inner: GoogleCliExecutor,
    memory: Arc<dyn MemoryStore>,
}

impl AntigravityExecutor {
    pub fn new() -> Self {
        Self::with_memory_store(Arc::new(InMemoryMemoryStore::new()))
    }

    /// Lets a caller (or test) supply a shared `MemoryStore` instead of the
    /// in-process default — the same seam the teacher's providers take a
    /// `StateSink` through.
    pub fn with_memory_store(memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            inner: GoogleCliExecutor::antigravity(),
            memory,
        }
    }
}

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn identifier(&self) -> &'static str {
        "antigravity"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        self.inner.prepare_request(req, auth)
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let truncated = self.truncated_request(request).await;
        self.inner.execute(auth, &truncated, options).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &Request,
        options: &Options,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure> {
        let truncated = self.truncated_request(request).await;
        self.inner.execute_stream(auth, &truncated, options).await
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: &Request,
        options: &Options,
    ) -> Result<Response, AttemptFailure> {
        self.inner.count_tokens(auth, request, options).await
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        self.inner.refresh(auth).await
    }

    fn decide_unavailable(&self, failure: &UpstreamFailure) -> Option<UnavailableDecision> {
        self.inner.decide_unavailable(failure)
    }
}

impl AntigravityExecutor {
    async fn truncated_request(&self, request: &Request) -> Request {
        let payload = self
            .truncate_contents_if_needed(&request.payload, &request.model, &request.metadata)
            .await;
        Request {
            model: request.model.clone(),
            payload,
            metadata: request.metadata.clone(),
        }
    }

    /// Implements spec §4.G.7 in full: safety-factored context estimate
    /// (steps 1-3), a backwards walk that keeps the newest turns and never
    /// splits a `functionCall`/`functionResponse` pair (step 4, §8 property
    /// 10), archival of the dropped turns plus an anchored summary of the
    /// latest user intent into the memory store when a session id is present
    /// (step 5), rebuilding `contents` (step 6), and prepending the stored
    /// summary to the system instruction when it isn't already there (step
    /// 7).
    async fn truncate_contents_if_needed(
        &self,
        payload: &Bytes,
        model: &str,
        metadata: &std::collections::HashMap<String, Value>,
    ) -> Bytes {
        let Ok(mut value) = serde_json::from_slice::<Value>(payload) else {
            return payload.clone();
        };

        let limit_tokens = model_context_limit(model) as f64;
        let safe_limit_tokens = limit_tokens * SAFETY_FACTOR;
        let chars_per_token = chars_per_token_for(model);
        let approx_tokens = payload.len() as f64 / chars_per_token;

        let session_id = session_id_from_metadata(metadata);

        if approx_tokens <= safe_limit_tokens {
            return self
                .apply_stored_summary(&mut value, session_id.as_deref())
                .await
                .unwrap_or_else(|| payload.clone());
        }

        let Some(contents) = value.get("contents").and_then(Value::as_array).cloned() else {
            return payload.clone();
        };

        let units = group_droppable_units(&contents);
        if units.len() <= 1 {
            return payload.clone();
        }

        let safe_byte_budget = (safe_limit_tokens * chars_per_token).max(0.0) as usize;
        let keep_indices = select_kept_indices(&contents, &units, safe_byte_budget);

        let dropped: Vec<(usize, &Value)> = contents
            .iter()
            .enumerate()
            .filter(|(i, _)| !keep_indices.contains(i))
            .collect();

        if let Some(session_id) = session_id.as_deref() {
            if !dropped.is_empty() {
                let dropped_events: Vec<MemoryEvent> = dropped
                    .iter()
                    .map(|(_, c)| MemoryEvent {
                        role: c
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("user")
                            .to_string(),
                        text: plain_text(c),
                    })
                    .collect();
                let latest_intent = latest_user_intent(&contents, &keep_indices);
                self.memory
                    .append(session_id, dropped_events.clone())
                    .await;
                self.memory
                    .upsert_anchored_summary(session_id, dropped_events, "", &latest_intent)
                    .await;
            }
        }

        let kept: Vec<Value> = contents
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep_indices.contains(i))
            .map(|(_, v)| v)
            .collect();
        if let Some(contents_slot) = value.get_mut("contents") {
            *contents_slot = Value::Array(kept);
        } else {
            value["contents"] = Value::Array(kept);
        }

        self.apply_stored_summary(&mut value, session_id.as_deref())
            .await
            .unwrap_or_else(|| {
                serde_json::to_vec(&value).map(Bytes::from).unwrap_or_else(|_| payload.clone())
            })
    }

    /// §4.G.7 step 7. Returns `None` when nothing changed, so the caller can
    /// fall back to re-serializing the already-truncated value itself.
    async fn apply_stored_summary(
        &self,
        value: &mut Value,
        session_id: Option<&str>,
    ) -> Option<Bytes> {
        let session_id = session_id?;
        let summary = self
            .memory
            .read_summary(session_id, MAX_SUMMARY_PREPEND_CHARS)
            .await;
        if summary.is_empty() {
            return None;
        }

        let existing_text = value
            .get("systemInstruction")
            .and_then(|si| si.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if existing_text.contains(SESSION_CONTEXT_HEADER) {
            return None;
        }

        let prefix = format!("{SESSION_CONTEXT_HEADER}:\n{summary}\n\n");
        let new_text = format!("{prefix}{existing_text}");
        value["systemInstruction"] = serde_json::json!({
            "role": "system",
            "parts": [{"text": new_text}],
        });

        serde_json::to_vec(value).ok().map(Bytes::from)
    }
}

fn chars_per_token_for(model: &str) -> f64 {
    if model.to_ascii_lowercase().contains("claude") {
        3.0
    } else {
        3.5
    }
}

fn has_function_call(msg: &Value) -> bool {
    msg.get("parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().any(|p| p.get("functionCall").is_some()))
        .unwrap_or(false)
}

fn has_function_response(msg: &Value) -> bool {
    msg.get("parts")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().any(|p| p.get("functionResponse").is_some()))
        .unwrap_or(false)
}

/// Groups `contents` indices into atomic drop/keep units: a `functionCall`
/// turn immediately followed by its `functionResponse` turn is one unit, so
/// dropping never separates a tool call from its response (§8 property 10).
/// Leading `system` turns are excluded entirely — they're never droppable.
fn group_droppable_units(contents: &[Value]) -> Vec<Vec<usize>> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < contents.len() {
        if contents[i].get("role").and_then(Value::as_str) == Some("system") {
            i += 1;
            continue;
        }
        if has_function_call(&contents[i])
            && i + 1 < contents.len()
            && has_function_response(&contents[i + 1])
        {
            units.push(vec![i, i + 1]);
            i += 2;
        } else {
            units.push(vec![i]);
            i += 1;
        }
    }
    units
}

/// Walks units newest-to-oldest (§4.G.7 step 4: "walk `request.contents`
/// backwards accumulating bytes"), keeping whole units until the next older
/// one would exceed `safe_byte_budget`. The last unit (the most recent user
/// turn) is always kept regardless of budget.
fn select_kept_indices(
    contents: &[Value],
    units: &[Vec<usize>],
    safe_byte_budget: usize,
) -> std::collections::HashSet<usize> {
    let mut kept = std::collections::HashSet::new();
    for (i, c) in contents.iter().enumerate() {
        if c.get("role").and_then(Value::as_str) == Some("system") {
            kept.insert(i);
        }
    }

    let mut budget_used = 0usize;
    for (pos, unit) in units.iter().enumerate().rev() {
        let unit_bytes: usize = unit
            .iter()
            .map(|&i| serde_json::to_vec(&contents[i]).map(|v| v.len()).unwrap_or(0))
            .sum();
        let is_last_unit = pos == units.len() - 1;
        if is_last_unit || budget_used + unit_bytes <= safe_byte_budget {
            budget_used += unit_bytes;
            kept.extend(unit.iter().copied());
        } else {
            break;
        }
    }
    kept
}

/// Plain text of a content entry, skipping `thought` parts (§4.G.7 step 5).
fn plain_text(content: &Value) -> String {
    content
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// The most recent surviving `user` turn's text, capped at
/// `MAX_LATEST_INTENT_CHARS` (§4.G.7 step 5).
fn latest_user_intent(contents: &[Value], keep_indices: &std::collections::HashSet<usize>) -> String {
    let text = contents
        .iter()
        .enumerate()
        .filter(|(i, c)| keep_indices.contains(i) && c.get("role").and_then(Value::as_str) == Some("user"))
        .next_back()
        .map(|(_, c)| plain_text(c))
        .unwrap_or_default();
    text.chars().take(MAX_LATEST_INTENT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> AntigravityExecutor {
        AntigravityExecutor::with_memory_store(Arc::new(InMemoryMemoryStore::new()))
    }

    #[tokio::test]
    async fn leaves_small_requests_untouched() {
        let payload = Bytes::from_static(br#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#);
        let exec = executor();
        let out = exec
            .truncate_contents_if_needed(&payload, "gemini-2.5-pro", &Default::default())
            .await;
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn drops_oldest_non_system_turns_when_oversized() {
        let mut contents = vec![serde_json::json!({"role": "system", "parts": [{"text": "sys"}]})];
        for i in 0..20 {
            contents.push(serde_json::json!({
                "role": "user",
                "parts": [{"text": "x".repeat(200000).replace('x', &format!("turn-{i}-"))}]
            }));
        }
        let payload = serde_json::to_vec(&serde_json::json!({"contents": contents})).unwrap();
        let exec = executor();
        let out = exec
            .truncate_contents_if_needed(&Bytes::from(payload), "gemini-1.0-pro", &Default::default())
            .await;
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let kept = value["contents"].as_array().unwrap();
        assert!(kept.len() < 21);
        assert_eq!(kept[0]["role"], "system");
        // the most recent user turn always survives
        let last_text = kept.last().unwrap()["parts"][0]["text"].as_str().unwrap();
        assert!(last_text.starts_with("turn-19-"));
    }

    #[tokio::test]
    async fn keeps_function_call_and_response_paired() {
        let mut contents = vec![serde_json::json!({"role": "system", "parts": [{"text": "sys"}]})];
        contents.push(serde_json::json!({
            "role": "model",
            "parts": [{"functionCall": {"name": "lookup", "args": {}}}, {"text": "x".repeat(300000)}],
        }));
        contents.push(serde_json::json!({
            "role": "function",
            "parts": [{"functionResponse": {"name": "lookup", "response": {}}}],
        }));
        for i in 0..5 {
            contents.push(serde_json::json!({
                "role": "user",
                "parts": [{"text": "x".repeat(200000).replace('x', &format!("turn-{i}-"))}]
            }));
        }
        let payload = serde_json::to_vec(&serde_json::json!({"contents": contents})).unwrap();
        let exec = executor();
        let out = exec
            .truncate_contents_if_needed(&Bytes::from(payload), "gemini-1.0-pro", &Default::default())
            .await;
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let kept = value["contents"].as_array().unwrap();
        let has_call = kept.iter().any(|c| {
            c["parts"]
                .as_array()
                .map(|p| p.iter().any(|part| part.get("functionCall").is_some()))
                .unwrap_or(false)
        });
        let has_response = kept.iter().any(|c| {
            c["parts"]
                .as_array()
                .map(|p| p.iter().any(|part| part.get("functionResponse").is_some()))
                .unwrap_or(false)
        });
        // both present or both absent -- never split
        assert_eq!(has_call, has_response);
    }

    #[tokio::test]
    async fn archives_dropped_turns_and_prepends_summary_on_next_call() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let exec = AntigravityExecutor::with_memory_store(memory.clone());
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("session_id".to_string(), serde_json::Value::String("s1".to_string()));

        let mut contents = vec![serde_json::json!({"role": "system", "parts": [{"text": "sys"}]})];
        for i in 0..20 {
            contents.push(serde_json::json!({
                "role": "user",
                "parts": [{"text": "x".repeat(200000).replace('x', &format!("turn-{i}-"))}]
            }));
        }
        let payload = serde_json::to_vec(&serde_json::json!({"contents": contents})).unwrap();
        let _ = exec
            .truncate_contents_if_needed(&Bytes::from(payload), "gemini-1.0-pro", &metadata)
            .await;

        let summary = memory.read_summary("s1", 8000).await;
        assert!(!summary.is_empty());

        // a later small request in the same session should get the summary
        // prepended to its system instruction.
        let small = serde_json::to_vec(&serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": "hi again"}]}],
        }))
        .unwrap();
        let out = exec
            .truncate_contents_if_needed(&Bytes::from(small), "gemini-1.0-pro", &metadata)
            .await;
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let system_text = value["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(system_text.contains(SESSION_CONTEXT_HEADER));
    }
}
