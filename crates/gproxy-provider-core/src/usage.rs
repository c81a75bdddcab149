//! Usage reporting for streaming upstream calls (spec §4.I).
//!
//! Executors accumulate usage as they decode stream chunks, then hand the
//! final tally to a `UsageReporter` so it reaches the event hub exactly once
//! even when the upstream connection drops before a terminal event arrives.

use std::sync::Mutex;

use crate::events::{Event, EventHub, OperationalEvent, ResultEvent, UsageSummary};
use crate::executor::UnavailableReason;

#[derive(Debug, Default)]
struct PendingResult {
    auth_id: String,
    provider: String,
    model: String,
    usage: Option<UsageSummary>,
    error_status: Option<u16>,
    error_message: Option<String>,
    retry_after_secs: Option<u64>,
    reason: Option<UnavailableReason>,
    published: bool,
}

/// Tracks the final usage/result of one in-flight call and guarantees the
/// hub sees exactly one `Result` event for it, published either explicitly
/// or on drop if the caller never got the chance (connection aborted
/// mid-stream).
pub struct UsageReporter {
    hub: EventHub,
    state: Mutex<PendingResult>,
}

impl UsageReporter {
    pub fn new(hub: EventHub, auth_id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            hub,
            state: Mutex::new(PendingResult {
                auth_id: auth_id.into(),
                provider: provider.into(),
                model: model.into(),
                ..Default::default()
            }),
        }
    }

    /// Records the successful usage tally; does not publish yet, so a
    /// stream's trailing chunks can still update it before the caller calls
    /// `ensure_published`.
    pub fn track_usage(&self, usage: UsageSummary) {
        let mut state = self.state.lock().expect("usage reporter mutex poisoned");
        state.usage = Some(usage);
    }

    /// Records a deferred failure for publication once the caller finishes
    /// with the stream (spec §4.I "failures discovered mid-stream are
    /// deferred until the stream ends").
    pub fn track_failure(&self, status: Option<u16>, message: impl Into<String>, retry_after_secs: Option<u64>, reason: Option<UnavailableReason>) {
        let mut state = self.state.lock().expect("usage reporter mutex poisoned");
        state.error_status = status;
        state.error_message = Some(message.into());
        state.retry_after_secs = retry_after_secs;
        state.reason = reason;
    }

    /// Publishes the accumulated result immediately, marking the reporter
    /// done so no duplicate event follows.
    pub async fn publish(&self) {
        let event = {
            let mut state = self.state.lock().expect("usage reporter mutex poisoned");
            if state.published {
                return;
            }
            state.published = true;
            ResultEvent {
                auth_id: state.auth_id.clone(),
                provider: state.provider.clone(),
                model: state.model.clone(),
                success: state.error_status.is_none(),
                error_status: state.error_status,
                error_message: state.error_message.clone(),
                retry_after_secs: state.retry_after_secs,
                reason: state.reason,
            }
        };
        self.hub
            .emit(Event::Operational(OperationalEvent::Result(event)))
            .await;
    }

    pub async fn publish_failure(&self, status: Option<u16>, message: impl Into<String>, retry_after_secs: Option<u64>, reason: Option<UnavailableReason>) {
        self.track_failure(status, message, retry_after_secs, reason);
        self.publish().await;
    }

    /// Called when the caller is about to drop the reporter without an
    /// explicit `publish` — publishes whatever was tracked so far so a
    /// mid-stream abort still reaches the hub.
    pub async fn ensure_published(&self) {
        self.publish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_idempotent() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        let reporter = UsageReporter::new(hub, "a1", "kiro", "claude-sonnet");
        reporter.track_usage(UsageSummary {
            total_tokens: Some(42),
            ..Default::default()
        });
        reporter.publish().await;
        reporter.publish().await;

        let event = rx.recv().await.unwrap();
        match event {
            Event::Operational(OperationalEvent::Result(r)) => assert!(r.success),
            _ => panic!("unexpected event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ensure_published_reports_deferred_failure() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        let reporter = UsageReporter::new(hub, "a1", "kiro", "claude-sonnet");
        reporter.track_failure(Some(429), "rate limited", Some(30), Some(UnavailableReason::RateLimit));
        reporter.ensure_published().await;

        let event = rx.recv().await.unwrap();
        match event {
            Event::Operational(OperationalEvent::Result(r)) => {
                assert!(!r.success);
                assert_eq!(r.error_status, Some(429));
                assert_eq!(r.retry_after_secs, Some(30));
            }
            _ => panic!("unexpected event"),
        }
    }
}
