//! Shared shape for the two Google "internal" OAuth executors, GeminiCli and
//! Antigravity (spec §4.F). Both wrap the Gemini request as
//! `{model, project, user_prompt_id, request}` and POST it to Google's
//! Code Assist endpoint, refreshing via the standard OAuth2 endpoint with a
//! provider-specific installed-app client id/secret — grounded on the
//! teacher's `providers::geminicli` (`build_gemini_request`,
//! `wrap_internal_request`, `generate_user_prompt_id`, OAuth constants).

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};
use rand::RngCore;

use crate::auth_extractor;
use crate::providers::{oauth, support};

const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USER_AGENT: &str = "GeminiCLI/0.1.5 (linux; x86_64)";

pub enum Flavor {
    GeminiCli,
    Antigravity,
}

pub struct GoogleCliExecutor {
    flavor: Flavor,
    identifier: &'static str,
    default_base_url: &'static str,
}

impl GoogleCliExecutor {
    pub fn gemini_cli() -> Self {
        Self {
            flavor: Flavor::GeminiCli,
            identifier: "geminicli",
            default_base_url: "https://cloudcode-pa.googleapis.com",
        }
    }

    pub fn antigravity() -> Self {
        Self {
            flavor: Flavor::Antigravity,
            identifier: "antigravity",
            default_base_url: "https://cloudcode-pa.googleapis.com",
        }
    }

    fn base_url(&self, auth: &Auth) -> String {
        auth.metadata
            .get("base_url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(self.default_base_url)
            .trim_end_matches('/')
            .to_string()
    }

    fn credential_fields<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<(&'a str, &'a str, i64, &'a str, &'a str, &'a str), UpstreamPassthroughError> {
        match (&self.flavor, credential) {
            (Flavor::GeminiCli, Credential::GeminiCli(c)) => Ok((
                c.access_token.as_str(),
                c.refresh_token.as_str(),
                c.expires_at,
                c.project_id.as_str(),
                c.client_id.as_str(),
                c.client_secret.as_str(),
            )),
            (Flavor::Antigravity, Credential::Antigravity(c)) => Ok((
                c.access_token.as_str(),
                c.refresh_token.as_str(),
                c.expires_at,
                c.project_id.as_str(),
                c.client_id.as_str(),
                c.client_secret.as_str(),
            )),
            _ => Err(UpstreamPassthroughError::invalid_request(format!(
                "credential variant does not match provider {}",
                self.identifier
            ))),
        }
    }

    fn wrap_body(&self, payload: &Bytes, model: &str, project: &str) -> Bytes {
        let request: serde_json::Value =
            serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null);
        let wrapped = serde_json::json!({
            "model": model,
            "project": project,
            "user_prompt_id": generate_user_prompt_id(),
            "request": request,
        });
        serde_json::to_vec(&wrapped).map(Bytes::from).unwrap_or_else(|_| payload.clone())
    }

    fn endpoint(&self, auth: &Auth, method: &str) -> String {
        format!("{}/v1internal:{method}", self.base_url(auth))
    }

    fn stamp_headers(&self, headers: &mut gproxy_provider_core::Headers, access_token: &str) {
        auth_extractor::set_bearer(headers, access_token);
        auth_extractor::set_accept_json(headers);
        auth_extractor::set_content_type_json(headers);
        auth_extractor::set_user_agent(headers, USER_AGENT);
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

#[async_trait]
impl ProviderExecutor for GoogleCliExecutor {
    fn identifier(&self) -> &'static str {
        self.identifier
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let (access_token, ..) = self.credential_fields(&credential)?;
        self.stamp_headers(&mut req.headers, access_token);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let (access_token, _, _, project, ..) = self.credential_fields(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(auth, "generateContent"),
            headers,
            body: Some(self.wrap_body(&request.payload, &request.model, project)),
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
        let (access_token, _, _, project, ..) = self.credential_fields(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}?alt=sse", self.endpoint(auth, "streamGenerateContent")),
            headers,
            body: Some(self.wrap_body(&request.payload, &request.model, project)),
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
        let (access_token, _, _, project, ..) = self.credential_fields(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, access_token);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(auth, "countTokens"),
            headers,
            body: Some(self.wrap_body(&request.payload, &request.model, project)),
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
        let (access_token, refresh_token, expires_at, _, client_id, client_secret) =
            self.credential_fields(&credential)?;
        if refresh_token.is_empty() || !oauth::is_expired(expires_at, 60) {
            return Ok(auth.clone());
        }
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let refreshed = oauth::refresh_token(
            &client,
            DEFAULT_TOKEN_URL,
            client_id,
            client_secret,
            refresh_token,
        )
        .await?;
        let _ = access_token;
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
        crate::credential::apply_refresh(
            &mut next,
            refreshed.access_token,
            refreshed.refresh_token,
            expires_at,
        );
        Ok(next)
    }
}

fn generate_user_prompt_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_body_nests_request_with_model_and_project() {
        let exec = GoogleCliExecutor::gemini_cli();
        let payload = Bytes::from_static(br#"{"contents":[]}"#);
        let out = exec.wrap_body(&payload, "gemini-2.5-pro", "proj-1");
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "gemini-2.5-pro");
        assert_eq!(value["project"], "proj-1");
        assert!(value["request"].is_object());
        assert!(value["user_prompt_id"].as_str().unwrap().len() == 32);
    }

    #[test]
    fn endpoint_uses_v1internal_path() {
        let exec = GoogleCliExecutor::antigravity();
        let auth = Auth::new("antigravity");
        assert!(exec.endpoint(&auth, "generateContent").ends_with("/v1internal:generateContent"));
    }
}
