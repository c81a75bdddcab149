use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::executor::UnavailableReason;
use crate::headers::Headers;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Upstream(UpstreamEvent),
    Operational(OperationalEvent),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub context_usage_percent: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub trace_id: Option<String>,
    #[serde(skip, default = "SystemTime::now")]
    pub at: SystemTime,
    pub provider: String,
    pub auth_id: String,
    pub model: String,
    pub attempt_no: u32,
    pub request_headers: Headers,
    pub response_status: Option<u16>,
    pub response_headers: Headers,
    pub usage: Option<UsageSummary>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Backs the Hook interface of spec §6: `OnAuthRegistered`, `OnAuthUpdated`,
/// `OnResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    AuthRegistered { auth_id: String, provider: String },
    AuthUpdated { auth_id: String, provider: String },
    Result(ResultEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub error_status: Option<u16>,
    pub error_message: Option<String>,
    pub retry_after_secs: Option<u64>,
    pub reason: Option<UnavailableReason>,
}
