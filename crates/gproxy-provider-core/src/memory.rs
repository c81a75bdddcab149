//! Memory store collaborator (spec §6 "Memory store (for truncation)"), used
//! by §4.G.7 steps 5/7: when conversation truncation drops messages, the
//! dropped turns are archived per session and an anchored summary of the
//! latest user intent is kept so a later turn can be told what it's missing.
//!
//! The interface is implementation-agnostic (spec treats it as an external
//! collaborator); this crate ships one in-process implementation so the
//! Antigravity executor has something to truncate against without an actual
//! database, the same way `gproxy-storage`'s file-backed `AuthStore` stands
//! in for a real persistence layer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// One archived conversation turn, reduced to its plain text (thought parts
/// are skipped before events reach this type — see spec §4.G.7 step 5).
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    pub role: String,
    pub text: String,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Archives `events` under `session_id`.
    async fn append(&self, session_id: &str, events: Vec<MemoryEvent>);

    /// Upserts the anchored summary for `session_id`: `dropped_events` is
    /// folded in, `anchor` optionally pins the summary to a point in the
    /// conversation (spec's third positional argument, `""` when unused),
    /// `latest_intent` is the most recent user ask (≤ 1500 chars per §4.G.7
    /// step 5).
    async fn upsert_anchored_summary(
        &self,
        session_id: &str,
        dropped_events: Vec<MemoryEvent>,
        anchor: &str,
        latest_intent: &str,
    );

    /// Reads back up to `max_chars` of the stored summary for `session_id`.
    async fn read_summary(&self, session_id: &str, max_chars: usize) -> String;
}

#[derive(Default)]
struct SessionMemory {
    events: Vec<MemoryEvent>,
    summary: String,
}

/// In-process `MemoryStore` backed by a `Mutex<HashMap<..>>`. Sessions are
/// never evicted here; a real deployment would back this with the database
/// the teacher's `gproxy-storage` crate already wires up for everything else.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    sessions: Mutex<HashMap<String, SessionMemory>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn append(&self, session_id: &str, events: Vec<MemoryEvent>) {
        let mut sessions = self.sessions.lock().expect("memory store mutex poisoned");
        sessions
            .entry(session_id.to_string())
            .or_default()
            .events
            .extend(events);
    }

    async fn upsert_anchored_summary(
        &self,
        session_id: &str,
        dropped_events: Vec<MemoryEvent>,
        anchor: &str,
        latest_intent: &str,
    ) {
        let mut sessions = self.sessions.lock().expect("memory store mutex poisoned");
        let entry = sessions.entry(session_id.to_string()).or_default();
        let mut summary = String::new();
        if !anchor.is_empty() {
            summary.push_str(anchor);
            summary.push('\n');
        }
        if !dropped_events.is_empty() {
            summary.push_str(&format!("{} earlier turn(s) summarized.\n", dropped_events.len()));
        }
        summary.push_str("Latest user intent: ");
        summary.push_str(latest_intent);
        entry.summary = summary;
    }

    async fn read_summary(&self, session_id: &str, max_chars: usize) -> String {
        let sessions = self.sessions.lock().expect("memory store mutex poisoned");
        let Some(entry) = sessions.get(session_id) else {
            return String::new();
        };
        entry.summary.chars().take(max_chars).collect()
    }
}

/// Known metadata keys (in priority order) a session id may arrive under
/// (spec §4.G.7 step 5).
pub const SESSION_ID_METADATA_KEYS: [&str; 3] =
    ["X-CLIProxyAPI-Session", "X-Session-Id", "session_id"];

/// Extracts the session id from request metadata, trying each well-known key
/// in turn.
pub fn session_id_from_metadata(metadata: &HashMap<String, serde_json::Value>) -> Option<String> {
    SESSION_ID_METADATA_KEYS.iter().find_map(|key| {
        metadata
            .get(*key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_summary_round_trips() {
        let store = InMemoryMemoryStore::new();
        store
            .append(
                "s1",
                vec![MemoryEvent {
                    role: "user".to_string(),
                    text: "hello".to_string(),
                }],
            )
            .await;
        store
            .upsert_anchored_summary("s1", vec![], "", "please keep going")
            .await;
        let summary = store.read_summary("s1", 8000).await;
        assert!(summary.contains("please keep going"));
    }

    #[test]
    fn session_id_prefers_first_known_key() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "X-Session-Id".to_string(),
            serde_json::Value::String("abc".to_string()),
        );
        assert_eq!(session_id_from_metadata(&metadata).as_deref(), Some("abc"));
    }
}
