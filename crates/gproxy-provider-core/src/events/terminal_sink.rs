use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink, OperationalEvent};

/// Default `EventSink`: routes every event through `tracing` with structured
/// fields instead of string interpolation, matching the rest of the crate's
/// logging convention.
#[derive(Default)]
pub struct TerminalEventSink;

impl TerminalEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::Upstream(e) => {
                    tracing::info!(
                        provider = %e.provider,
                        auth_id = %e.auth_id,
                        model = %e.model,
                        attempt = e.attempt_no,
                        status = ?e.response_status,
                        error = ?e.error_code,
                        "upstream attempt"
                    );
                }
                Event::Operational(OperationalEvent::AuthRegistered { auth_id, provider }) => {
                    tracing::info!(auth_id = %auth_id, provider = %provider, "auth registered");
                }
                Event::Operational(OperationalEvent::AuthUpdated { auth_id, provider }) => {
                    tracing::debug!(auth_id = %auth_id, provider = %provider, "auth updated");
                }
                Event::Operational(OperationalEvent::Result(r)) => {
                    tracing::info!(
                        auth_id = %r.auth_id,
                        provider = %r.provider,
                        model = %r.model,
                        success = r.success,
                        status = ?r.error_status,
                        reason = ?r.reason,
                        "execute result"
                    );
                }
            }
        })
    }
}
