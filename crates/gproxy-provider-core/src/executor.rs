//! Provider executor contract (spec §4.E) and the status-error taxonomy
//! (spec §7) the Conductor classifies on.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::auth::{Auth, Credential};
use crate::headers::Headers;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

/// One client-dialect request carried through the executor seam (§4.E).
#[derive(Debug, Clone)]
pub struct Request {
    pub model: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, Value>,
}

/// Well-known metadata key the Conductor stamps on every request so
/// executors can recover the originally requested model for alias reversal
/// (§4.G.2).
pub const REQUESTED_MODEL_KEY: &str = "requested_model";

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub source_dialect: String,
    pub original_payload: Option<Bytes>,
    pub stream: bool,
    pub alt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub payload: Bytes,
    pub usage: Option<crate::events::UsageSummary>,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub payload: Option<Bytes>,
    pub error: Option<UpstreamPassthroughError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// The `StatusError` contract of §4.E/§7: any error that can expose a status
/// code (and optionally headers / a parsed Retry-After) without the caller
/// needing to downcast a concrete type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream error: {code} ({status})")]
pub struct UpstreamPassthroughError {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    pub headers: Headers,
    pub retry_after: Option<Duration>,
}

impl UpstreamPassthroughError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: "upstream_error",
            status,
            message: message.into(),
            headers: Vec::new(),
            retry_after: None,
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message).with_code("auth_unavailable")
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::new(501, what).with_code("not_supported")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(400, message).with_code("invalid_request")
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// A provider attempt failure paired with the optional unavailability
/// decision the Conductor should apply to the auth/model on this failure.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub passthrough: UpstreamPassthroughError,
    pub mark: Option<UnavailableDecision>,
}

/// Lets executor bodies use `?` on a bare `UpstreamPassthroughError` (e.g.
/// credential decode failures) without deciding an unavailability mark.
impl From<UpstreamPassthroughError> for AttemptFailure {
    fn from(passthrough: UpstreamPassthroughError) -> Self {
        Self {
            passthrough,
            mark: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnavailableDecision {
    pub duration: Duration,
    pub reason: UnavailableReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UnavailableReason {
    RateLimit,
    Timeout,
    Upstream5xx,
    AuthInvalid,
    ModelDisallow,
    Manual,
    Unknown,
}

#[derive(Debug)]
pub enum AuthRetryAction {
    None,
    RetrySame,
    UpdateCredential(Box<Credential>),
}

const RATE_LIMIT_FALLBACK_SECS: u64 = 30;
const SHORT_COOLDOWN_SECS: u64 = 10;
const AUTH_INVALID_SECS: u64 = 9_999 * 365 * 24 * 60 * 60;

/// Maps an [`UpstreamFailure`] to an unavailability decision using the
/// default table every executor falls back to unless it overrides
/// `decide_unavailable` (spec §4.E, §4.F step 6).
pub fn default_decide_unavailable(failure: &UpstreamFailure) -> Option<UnavailableDecision> {
    match failure {
        UpstreamFailure::Http {
            status, headers, ..
        } => match *status {
            404 => None,
            429 => Some(UnavailableDecision {
                duration: parse_retry_after(headers)
                    .unwrap_or_else(|| Duration::from_secs(RATE_LIMIT_FALLBACK_SECS)),
                reason: UnavailableReason::RateLimit,
            }),
            401 | 403 => Some(UnavailableDecision {
                duration: Duration::from_secs(AUTH_INVALID_SECS),
                reason: UnavailableReason::AuthInvalid,
            }),
            s if (500..600).contains(&s) => Some(UnavailableDecision {
                duration: Duration::from_secs(SHORT_COOLDOWN_SECS),
                reason: UnavailableReason::Upstream5xx,
            }),
            _ => None,
        },
        UpstreamFailure::Transport { .. } => Some(UnavailableDecision {
            duration: Duration::from_secs(SHORT_COOLDOWN_SECS),
            reason: UnavailableReason::Timeout,
        }),
    }
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = crate::headers::header_get(headers, "retry-after")?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    httpdate::parse_http_date(value)
        .ok()
        .and_then(|when| when.duration_since(std::time::SystemTime::now()).ok())
}

/// Every upstream provider family implements this (spec §4.E).
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Lowercased provider key; matches `Auth.provider`.
    fn identifier(&self) -> &'static str;

    /// Stamp credentials/headers onto an outbound HTTP request without
    /// sending it.
    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError>;

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        options: &Options,
    ) -> Result<Response, AttemptFailure>;

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &Request,
        options: &Options,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure>;

    async fn count_tokens(
        &self,
        _auth: &Auth,
        _request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        Err(AttemptFailure {
            passthrough: UpstreamPassthroughError::not_supported(format!(
                "{}.count_tokens",
                self.identifier()
            )),
            mark: None,
        })
    }

    async fn embed(
        &self,
        _auth: &Auth,
        _request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        Err(AttemptFailure {
            passthrough: UpstreamPassthroughError::not_supported(format!(
                "{}.embed",
                self.identifier()
            )),
            mark: None,
        })
    }

    /// Produce a refreshed auth, or clone the input unchanged when no
    /// refresh is needed or due yet.
    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        Ok(auth.clone())
    }

    /// Classify an upstream failure into an unavailability decision;
    /// providers override this only when their status-code semantics differ
    /// from the default table.
    fn decide_unavailable(&self, failure: &UpstreamFailure) -> Option<UnavailableDecision> {
        default_decide_unavailable(failure)
    }

    /// Optional hook fired on a 401/403-shaped failure before the default
    /// cooldown applies, so a provider can attempt an inline token refresh
    /// and retry the same auth instead of burning a cooldown.
    fn on_auth_failure<'a>(
        &'a self,
        _auth: &'a Auth,
        _failure: &'a UpstreamFailure,
    ) -> Pin<Box<dyn Future<Output = AuthRetryAction> + Send + 'a>> {
        Box::pin(async { AuthRetryAction::None })
    }
}
