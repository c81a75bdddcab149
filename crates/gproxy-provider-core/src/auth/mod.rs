//! The auth record: one credential plus its availability state (spec §3).

pub mod secret;
mod state;

pub use secret::Credential;
pub use state::{AuthStatus, LastError, ModelState, Quota};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;

pub type Attributes = HashMap<String, String>;
pub type Metadata = HashMap<String, Value>;

/// Opaque per-auth transport hook (spec §3 `Runtime`). Not deep-cloned: it is
/// a shared handle, not state, so a pointer clone on `Auth::clone` is
/// correct.
pub type Runtime = Arc<dyn std::any::Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    pub prefix: Option<String>,
    pub label: Option<String>,
    pub file_name: Option<String>,
    pub attributes: Attributes,
    pub metadata: Metadata,
    pub status: AuthStatus,
    pub status_message: Option<String>,
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub last_error: Option<LastError>,
    pub quota: Quota,
    pub model_states: HashMap<String, ModelState>,
    pub proxy_url: Option<String>,
    #[allow(dead_code)]
    pub runtime: Option<Runtime>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub last_refreshed_at: Option<SystemTime>,
    pub next_refresh_after: Option<SystemTime>,
    pub disabled: bool,
    pub index: Option<String>,
}

impl Auth {
    pub fn new(provider: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: String::new(),
            provider: provider.into(),
            prefix: None,
            label: None,
            file_name: None,
            attributes: HashMap::new(),
            metadata: HashMap::new(),
            status: AuthStatus::Active,
            status_message: None,
            unavailable: false,
            next_retry_after: None,
            last_error: None,
            quota: Quota::default(),
            model_states: HashMap::new(),
            proxy_url: None,
            runtime: None,
            created_at: now,
            updated_at: now,
            last_refreshed_at: None,
            next_refresh_after: None,
            disabled: false,
            index: None,
        }
    }

    /// §4.C `EnsureIndex`: first call computes an 8-byte (16 hex char) hash of
    /// the first non-empty identifier among `file_name`, `Attributes.api_key`,
    /// `id`; idempotent thereafter.
    pub fn ensure_index(&mut self) -> &str {
        if self.index.is_none() {
            let seed = self
                .file_name
                .as_deref()
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    self.attributes
                        .get("api_key")
                        .map(String::as_str)
                        .filter(|s| !s.is_empty())
                })
                .unwrap_or(&self.id);
            let hash = blake3::hash(seed.as_bytes());
            let hex = hash.to_hex();
            self.index = Some(hex[..16].to_string());
        }
        self.index.as_deref().unwrap()
    }

    /// §4.C `AccountInfo`.
    pub fn account_info(&self) -> (&'static str, String) {
        if let Some(email) = self.metadata.get("email").and_then(Value::as_str) {
            if !email.is_empty() {
                let value = match self.metadata.get("project_id").and_then(Value::as_str) {
                    Some(project) if !project.is_empty() => format!("{email} ({project})"),
                    _ => email.to_string(),
                };
                return ("oauth", value);
            }
        }
        if let Some(api_key) = self.attributes.get("api_key") {
            if !api_key.is_empty() {
                return ("api_key", api_key.clone());
            }
        }
        ("", String::new())
    }

    /// §4.C `ProxyInfo`.
    pub fn proxy_info(&self) -> String {
        match &self.proxy_url {
            Some(url) if !url.is_empty() => match url.split("://").next() {
                Some(scheme) if !scheme.is_empty() && scheme != url => {
                    format!("via {scheme} proxy")
                }
                _ => "via proxy".to_string(),
            },
            _ => String::new(),
        }
    }

    /// §3 invariant: a record with no `Metadata` and no identifying flat key
    /// is runtime-only and must never be persisted, nor may one explicitly
    /// flagged `Attributes.runtime_only == "true"`.
    pub fn is_persistable(&self) -> bool {
        if self
            .attributes
            .get("runtime_only")
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            return false;
        }
        if !self.metadata.is_empty() {
            return true;
        }
        self.attributes
            .get("api_key")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Recompute aggregate `unavailable`/`next_retry_after`/`quota.backoff_level`
    /// from `model_states` (§3 invariant).
    pub fn recompute_aggregate(&mut self) {
        if self.model_states.is_empty() {
            return;
        }
        let all_unavailable = self.model_states.values().all(|m| m.unavailable);
        self.unavailable = all_unavailable;
        self.next_retry_after = self
            .model_states
            .values()
            .filter_map(|m| m.effective_unblock_at())
            .min();
        self.quota.backoff_level = self
            .model_states
            .values()
            .map(|m| m.quota.backoff_level)
            .max()
            .unwrap_or(0);
        if !self.model_states.values().any(|m| m.last_error.is_some()) {
            self.last_error = None;
            self.status_message = None;
            self.status = AuthStatus::Active;
        }
    }

    pub fn mark_success(&mut self, model: &str, now: SystemTime) {
        self.model_states
            .entry(model.to_string())
            .or_default()
            .reset(now);
        self.recompute_aggregate();
        self.updated_at = now;
    }

    /// §4.G.3 MarkResult failure branch: mark `model`'s state unavailable and
    /// apply the status-code cooldown table. `quota_cooldown_disabled` gates
    /// the 408/500/502/503/504 row per auth/global toggle.
    pub fn mark_failure(
        &mut self,
        model: &str,
        http_status: Option<u16>,
        retry_after: Option<std::time::Duration>,
        message: Option<String>,
        now: SystemTime,
        quota_cooldown_disabled: bool,
    ) {
        let ms = self.model_states.entry(model.to_string()).or_default();
        ms.unavailable = true;
        ms.status = AuthStatus::Error;
        ms.updated_at = Some(now);
        ms.last_error = Some(LastError {
            code: http_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "error".to_string()),
            message: message.clone().unwrap_or_default(),
            retryable: !matches!(http_status, Some(401) | Some(402) | Some(403) | Some(404)),
            http_status,
        });

        match http_status {
            Some(401) => {
                ms.next_retry_after = Some(now + Duration::from_secs(30 * 60));
                ms.status_message = Some("unauthorized".to_string());
            }
            Some(402) | Some(403) => {
                ms.next_retry_after = Some(now + Duration::from_secs(30 * 60));
                ms.status_message = Some("payment_required".to_string());
            }
            Some(404) => {
                ms.next_retry_after = Some(now + Duration::from_secs(12 * 60 * 60));
                ms.status_message = Some("not_found".to_string());
            }
            Some(429) => {
                let wait = retry_after.unwrap_or_else(|| {
                    let prev_level = ms.quota.backoff_level;
                    let capped_secs = (1u64 << prev_level.min(10)).min(30 * 60);
                    Duration::from_secs(capped_secs)
                });
                ms.next_retry_after = Some(now + wait);
                ms.quota.exceeded = true;
                ms.quota.reason = Some("quota".to_string());
                ms.quota.next_recover_at = Some(now + wait);
                if retry_after.is_none() {
                    ms.quota.backoff_level = ms.quota.backoff_level.saturating_add(1);
                }
                ms.status_message = Some("quota".to_string());
            }
            Some(408) | Some(500) | Some(502) | Some(503) | Some(504) => {
                if !quota_cooldown_disabled {
                    ms.next_retry_after = Some(now + Duration::from_secs(60));
                } else {
                    ms.next_retry_after = None;
                }
            }
            _ => {
                ms.next_retry_after = None;
            }
        }

        self.status = AuthStatus::Error;
        self.status_message = ms.status_message.clone();
        self.last_error = ms.last_error.clone();
        self.recompute_aggregate();
        self.updated_at = now;
    }

    /// §4.G.3 "On failure without a model (pre-dispatch failure)": the same
    /// status-code table, applied directly to the aggregate fields instead
    /// of a per-model entry.
    pub fn mark_failure_aggregate(
        &mut self,
        http_status: Option<u16>,
        retry_after: Option<Duration>,
        message: Option<String>,
        now: SystemTime,
        quota_cooldown_disabled: bool,
    ) {
        self.unavailable = true;
        self.status = AuthStatus::Error;
        self.last_error = Some(LastError {
            code: http_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "error".to_string()),
            message: message.unwrap_or_default(),
            retryable: !matches!(http_status, Some(401) | Some(402) | Some(403) | Some(404)),
            http_status,
        });

        match http_status {
            Some(401) => {
                self.next_retry_after = Some(now + Duration::from_secs(30 * 60));
                self.status_message = Some("unauthorized".to_string());
            }
            Some(402) | Some(403) => {
                self.next_retry_after = Some(now + Duration::from_secs(30 * 60));
                self.status_message = Some("payment_required".to_string());
            }
            Some(404) => {
                self.next_retry_after = Some(now + Duration::from_secs(12 * 60 * 60));
                self.status_message = Some("not_found".to_string());
            }
            Some(429) => {
                let wait = retry_after.unwrap_or_else(|| {
                    let prev_level = self.quota.backoff_level;
                    let capped_secs = (1u64 << prev_level.min(10)).min(30 * 60);
                    Duration::from_secs(capped_secs)
                });
                self.next_retry_after = Some(now + wait);
                self.quota.exceeded = true;
                self.quota.reason = Some("quota".to_string());
                self.quota.next_recover_at = Some(now + wait);
                if retry_after.is_none() {
                    self.quota.backoff_level = self.quota.backoff_level.saturating_add(1);
                }
                self.status_message = Some("quota".to_string());
            }
            Some(408) | Some(500) | Some(502) | Some(503) | Some(504) => {
                self.next_retry_after = if quota_cooldown_disabled {
                    None
                } else {
                    Some(now + Duration::from_secs(60))
                };
            }
            _ => {
                self.next_retry_after = None;
            }
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_failure_401_sets_thirty_minute_cooldown() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        auth.mark_failure(
            "claude-3-5-sonnet",
            Some(401),
            None,
            Some("unauthorized".to_string()),
            now,
            false,
        );
        let ms = &auth.model_states["claude-3-5-sonnet"];
        assert!(ms.unavailable);
        assert_eq!(
            ms.next_retry_after.unwrap().duration_since(now).unwrap(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(auth.status, AuthStatus::Error);
    }

    #[test]
    fn mark_failure_429_backs_off_exponentially_and_caps_at_thirty_minutes() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        for _ in 0..8 {
            auth.mark_failure("m", Some(429), None, None, now, false);
        }
        let ms = &auth.model_states["m"];
        assert!(ms.quota.exceeded);
        assert!(ms.next_retry_after.unwrap().duration_since(now).unwrap() <= Duration::from_secs(30 * 60));
    }

    #[test]
    fn mark_failure_429_honors_explicit_retry_after() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        auth.mark_failure("m", Some(429), Some(Duration::from_secs(5)), None, now, false);
        let ms = &auth.model_states["m"];
        assert_eq!(
            ms.next_retry_after.unwrap().duration_since(now).unwrap(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn mark_failure_5xx_skips_cooldown_when_disabled() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        auth.mark_failure("m", Some(503), None, None, now, true);
        assert!(auth.model_states["m"].next_retry_after.is_none());
    }

    #[test]
    fn mark_failure_404_sets_twelve_hour_cooldown() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        auth.mark_failure("m", Some(404), None, None, now, false);
        let ms = &auth.model_states["m"];
        assert_eq!(
            ms.next_retry_after.unwrap().duration_since(now).unwrap(),
            Duration::from_secs(12 * 60 * 60)
        );
    }

    #[test]
    fn mark_success_clears_prior_failure() {
        let mut auth = Auth::new("claude");
        let now = SystemTime::now();
        auth.mark_failure("m", Some(500), None, None, now, false);
        auth.mark_success("m", now);
        assert!(!auth.model_states["m"].unavailable);
        assert_eq!(auth.status, AuthStatus::Active);
    }
}
