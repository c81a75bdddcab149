//! Shared OAuth refresh-token exchange used by every executor whose
//! credential carries a `refresh_token` (GeminiCli, Antigravity, Codex,
//! ClaudeCode, Kiro). Each provider posts to its own token endpoint with its
//! own client id/secret, but the grant shape and the response fields are the
//! same `refresh_token` grant every OAuth2 authorization server implements.

use gproxy_provider_core::{AttemptFailure, UpstreamPassthroughError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Exchange a refresh token for a new access token via the standard
/// `grant_type=refresh_token` form-encoded flow.
pub(crate) async fn refresh_token(
    client: &wreq::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<RefreshedToken, AttemptFailure> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    let resp = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|err| AttemptFailure {
            passthrough: UpstreamPassthroughError::service_unavailable(format!(
                "token refresh request failed: {err}"
            )),
            mark: None,
        })?;
    let status = resp.status();
    let body = resp.bytes().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AttemptFailure {
            passthrough: UpstreamPassthroughError::new(
                401,
                format!(
                    "token refresh rejected ({}): {}",
                    status.as_u16(),
                    crate::providers::support::error_message(&body)
                ),
            )
            .with_code("auth_invalid"),
            mark: None,
        });
    }
    serde_json::from_slice(&body).map_err(|err| AttemptFailure {
        passthrough: UpstreamPassthroughError::service_unavailable(format!(
            "token refresh response unparsable: {err}"
        )),
        mark: None,
    })
}

pub(crate) fn is_expired(expires_at: i64, skew_secs: i64) -> bool {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    expires_at != 0 && now + skew_secs >= expires_at
}
