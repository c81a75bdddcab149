//! Per-auth and per-model availability state (spec §3, §4.C, §4.G.3).

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    #[default]
    Active,
    Error,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct LastError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct Quota {
    pub exceeded: bool,
    pub reason: Option<String>,
    pub next_recover_at: Option<SystemTime>,
    pub backoff_level: u32,
}

impl Quota {
    pub fn clear(&mut self) {
        self.exceeded = false;
        self.reason = None;
        self.next_recover_at = None;
        self.backoff_level = 0;
    }
}

/// Per-model override of availability. When present for a model, it
/// dominates the aggregate (top-level) state for lookups scoped to that
/// model (spec §3 invariants, §4.D filtering step 2).
#[derive(Debug, Clone, Default)]
pub struct ModelState {
    pub status: AuthStatus,
    pub status_message: Option<String>,
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub last_error: Option<LastError>,
    pub quota: Quota,
    pub updated_at: Option<SystemTime>,
}

impl ModelState {
    /// Reset after a successful call against this model (spec §3: "After a
    /// success on model M ...").
    pub fn reset(&mut self, now: SystemTime) {
        self.unavailable = false;
        self.quota.clear();
        self.status = AuthStatus::Active;
        self.last_error = None;
        self.status_message = None;
        self.next_retry_after = None;
        self.updated_at = Some(now);
    }

    /// The effective time after which this model becomes retryable again —
    /// `max(NextRetryAfter, Quota.NextRecoverAt)` per §4.D step 2.
    pub fn effective_unblock_at(&self) -> Option<SystemTime> {
        match (self.next_retry_after, self.quota.next_recover_at) {
            (Some(a), Some(b)) => Some(if a > b { a } else { b }),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub fn is_blocked(&self, now: SystemTime) -> bool {
        if self.status == AuthStatus::Disabled {
            return true;
        }
        if !self.unavailable {
            return false;
        }
        match self.effective_unblock_at() {
            Some(until) => until > now,
            None => false,
        }
    }

    pub fn blocked_by_cooldown(&self) -> bool {
        self.quota.exceeded
    }
}
