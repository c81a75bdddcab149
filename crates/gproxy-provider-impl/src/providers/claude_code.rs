//! Claude Pro/Max subscription OAuth executor (spec §4.F "claudecode").
//! Same `/v1/messages` wire shape as the direct API key executor, but
//! authorized with a bearer token minted by the `claude.ai` OAuth flow
//! instead of an API key, and carrying the `oauth-2025-04-20` beta header
//! plus a CLI system prelude so upstream treats it as a subscription client.
//! Grounded on the teacher's `providers::claudecode` module (UA string,
//! beta header, prelude injection, `/v1/oauth/token` refresh endpoint).

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError, header_get,
    header_set,
};

use crate::auth_extractor;
use crate::providers::support;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_CODE_UA: &str = "claude-code/2.1.27";
const SYSTEM_PRELUDE: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const HEADER_BETA: &str = "anthropic-beta";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const TOKEN_URL_PATH: &str = "/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub struct ClaudeCodeExecutor;

impl ClaudeCodeExecutor {
    pub fn new() -> Self {
        Self
    }

    fn credential<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<&'a gproxy_provider_core::auth::secret::ClaudeCodeCredential, UpstreamPassthroughError>
    {
        match credential {
            Credential::ClaudeCode(c) => Ok(c),
            _ => Err(UpstreamPassthroughError::invalid_request(
                "expected Credential::ClaudeCode",
            )),
        }
    }

    fn base_url(&self, auth: &Auth) -> String {
        auth.metadata
            .get("base_url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn stamp_headers(&self, headers: &mut gproxy_provider_core::Headers, access_token: &str) {
        auth_extractor::set_bearer(headers, access_token);
        auth_extractor::set_header(headers, "anthropic-version", DEFAULT_ANTHROPIC_VERSION);
        auth_extractor::set_accept_json(headers);
        auth_extractor::set_content_type_json(headers);
        auth_extractor::set_user_agent(headers, CLAUDE_CODE_UA);
        ensure_oauth_beta(headers);
    }

    fn classify(&self, failure: UpstreamFailure) -> AttemptFailure {
        let mark = self.decide_unavailable(&failure);
        let passthrough = match &failure {
            UpstreamFailure::Http { status, body, .. } => {
                support::passthrough_for_status(*status, support::error_message(body))
            }
            UpstreamFailure::Transport { message, .. } => {
                UpstreamPassthroughError::service_unavailable(message.clone())
            }
        };
        AttemptFailure { passthrough, mark }
    }
}

fn ensure_oauth_beta(headers: &mut gproxy_provider_core::Headers) {
    let mut values: Vec<String> = header_get(headers, HEADER_BETA)
        .map(|value| {
            value
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !values.iter().any(|v| v.eq_ignore_ascii_case(OAUTH_BETA)) {
        values.push(OAUTH_BETA.to_string());
    }
    header_set(headers, HEADER_BETA, values.join(","));
}

fn stamp_body(payload: &Bytes, model: &str, stream: bool) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return payload.clone();
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("model".to_string(), serde_json::Value::String(model.to_string()));
        obj.insert("stream".to_string(), serde_json::Value::Bool(stream));
        if !obj.contains_key("system") {
            obj.insert(
                "system".to_string(),
                serde_json::json!([{"type": "text", "text": SYSTEM_PRELUDE}]),
            );
        }
    }
    serde_json::to_vec(&value).map(Bytes::from).unwrap_or_else(|_| payload.clone())
}

#[async_trait]
impl ProviderExecutor for ClaudeCodeExecutor {
    fn identifier(&self) -> &'static str {
        "claudecode"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        self.stamp_headers(&mut req.headers, &c.access_token);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, &c.access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages", self.base_url(auth)),
            headers,
            body: Some(stamp_body(&request.payload, &request.model, false)),
            is_stream: false,
        };
        let resp = support::send_buffered(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        let gproxy_provider_core::UpstreamBody::Bytes(body) = resp.body else {
            unreachable!("send_buffered always returns a buffered body")
        };
        if !(200..300).contains(&resp.status) {
            return Err(self.classify(UpstreamFailure::Http {
                status: resp.status,
                headers: resp.headers,
                body,
            }));
        }
        let usage = support::extract_usage(&body);
        Ok(Response { payload: body, usage })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, &c.access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages", self.base_url(auth)),
            headers,
            body: Some(stamp_body(&request.payload, &request.model, true)),
            is_stream: true,
        };
        let (_, _, rx) = support::send_streamed(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, &c.access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages/count_tokens", self.base_url(auth)),
            headers,
            body: Some(stamp_body(&request.payload, &request.model, false)),
            is_stream: false,
        };
        let resp = support::send_buffered(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        let gproxy_provider_core::UpstreamBody::Bytes(body) = resp.body else {
            unreachable!("send_buffered always returns a buffered body")
        };
        if !(200..300).contains(&resp.status) {
            return Err(self.classify(UpstreamFailure::Http {
                status: resp.status,
                headers: resp.headers,
                body,
            }));
        }
        Ok(Response { payload: body, usage: None })
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        if c.refresh_token.is_empty() || !crate::providers::oauth::is_expired(c.expires_at, 60) {
            return Ok(auth.clone());
        }
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let token_url = format!("{}{}", self.base_url(auth), TOKEN_URL_PATH);
        let refreshed = crate::providers::oauth::refresh_token(
            &client,
            &token_url,
            CLIENT_ID,
            "",
            &c.refresh_token,
        )
        .await?;
        let mut next = auth.clone();
        let expires_at = refreshed
            .expires_in
            .map(|secs| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64 + secs)
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        crate::credential::apply_refresh(&mut next, refreshed.access_token, refreshed.refresh_token, expires_at);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_body_injects_default_prelude() {
        let payload = Bytes::from_static(br#"{"messages":[]}"#);
        let out = stamp_body(&payload, "claude-sonnet-4-5", false);
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["system"][0]["text"], SYSTEM_PRELUDE);
    }

    #[test]
    fn stamp_body_keeps_existing_system() {
        let payload = Bytes::from_static(br#"{"messages":[],"system":"custom"}"#);
        let out = stamp_body(&payload, "claude-sonnet-4-5", false);
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["system"], "custom");
    }

    #[test]
    fn ensure_oauth_beta_appends_without_duplicating() {
        let mut headers = Vec::new();
        header_set(&mut headers, HEADER_BETA, "context-1m-2025-08-07");
        ensure_oauth_beta(&mut headers);
        ensure_oauth_beta(&mut headers);
        let value = header_get(&headers, HEADER_BETA).unwrap();
        assert_eq!(value.matches(OAUTH_BETA).count(), 1);
    }
}
