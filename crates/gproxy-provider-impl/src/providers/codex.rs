//! Codex (ChatGPT OAuth) executor (spec §4.F "codex"): OpenAI's
//! Responses-shaped backend behind a Bearer access token obtained from the
//! ChatGPT login flow, refreshed against OpenAI's public OAuth client.

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};

use crate::auth_extractor;
use crate::providers::{oauth, support};

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
// Public installed-app client id used by the Codex CLI's own OAuth login flow.
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

pub struct CodexExecutor;

impl CodexExecutor {
    pub fn new() -> Self {
        Self
    }

    fn credential<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<&'a gproxy_provider_core::auth::secret::CodexCredential, UpstreamPassthroughError> {
        match credential {
            Credential::Codex(c) => Ok(c),
            _ => Err(UpstreamPassthroughError::invalid_request(
                "expected Credential::Codex",
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

    fn stamp_headers(
        &self,
        headers: &mut gproxy_provider_core::Headers,
        access_token: &str,
        account_id: &str,
    ) {
        auth_extractor::set_bearer(headers, access_token);
        auth_extractor::set_accept_json(headers);
        auth_extractor::set_content_type_json(headers);
        if !account_id.is_empty() {
            auth_extractor::set_header(headers, "chatgpt-account-id", account_id);
        }
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

fn stamp_model(payload: &Bytes, model: &str, stream: bool) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return payload.clone();
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("model".to_string(), serde_json::Value::String(model.to_string()));
        obj.insert("stream".to_string(), serde_json::Value::Bool(stream));
    }
    serde_json::to_vec(&value).map(Bytes::from).unwrap_or_else(|_| payload.clone())
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        "codex"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        self.stamp_headers(&mut req.headers, &c.access_token, &c.account_id);
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
        self.stamp_headers(&mut headers, &c.access_token, &c.account_id);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/responses", self.base_url(auth)),
            headers,
            body: Some(stamp_model(&request.payload, &request.model, false)),
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
        self.stamp_headers(&mut headers, &c.access_token, &c.account_id);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/responses", self.base_url(auth)),
            headers,
            body: Some(stamp_model(&request.payload, &request.model, true)),
            is_stream: true,
        };
        let (_, _, rx) = support::send_streamed(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        Ok(rx)
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        if c.refresh_token.is_empty() || !oauth::is_expired(c.expires_at, 60) {
            return Ok(auth.clone());
        }
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let refreshed = oauth::refresh_token(&client, TOKEN_URL, CLIENT_ID, "", &c.refresh_token).await?;
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
        if let Some(id_token) = &refreshed.id_token {
            next.metadata
                .insert("id_token".to_string(), serde_json::json!(id_token));
        }
        crate::credential::apply_refresh(&mut next, refreshed.access_token, refreshed.refresh_token, expires_at);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_account_id_header_when_present() {
        let exec = CodexExecutor::new();
        let mut headers = Vec::new();
        exec.stamp_headers(&mut headers, "tok", "acct-1");
        assert_eq!(
            gproxy_provider_core::header_get(&headers, "chatgpt-account-id"),
            Some("acct-1")
        );
    }

    #[test]
    fn omits_account_id_header_when_blank() {
        let exec = CodexExecutor::new();
        let mut headers = Vec::new();
        exec.stamp_headers(&mut headers, "tok", "");
        assert_eq!(gproxy_provider_core::header_get(&headers, "chatgpt-account-id"), None);
    }
}
