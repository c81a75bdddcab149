//! Direct Anthropic API-key executor (spec §4.F "claude"). Grounded on the
//! teacher's `providers::claude` dispatch (header names, `/v1/messages`
//! family of paths, `anthropic-beta`/`anthropic-version` passthrough).

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};

use crate::auth_extractor;
use crate::providers::support;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeExecutor;

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self
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

    fn api_key<'a>(&self, credential: &'a Credential) -> Result<&'a str, UpstreamPassthroughError> {
        match credential {
            Credential::Claude(c) => Ok(c.api_key.as_str()),
            _ => Err(UpstreamPassthroughError::invalid_request(
                "expected Credential::Claude",
            )),
        }
    }

    fn stamp_headers(&self, headers: &mut gproxy_provider_core::Headers, api_key: &str) {
        auth_extractor::set_header(headers, "x-api-key", api_key);
        auth_extractor::set_header(headers, "anthropic-version", DEFAULT_ANTHROPIC_VERSION);
        auth_extractor::set_accept_json(headers);
        auth_extractor::set_content_type_json(headers);
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
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let api_key = self.api_key(&credential)?;
        self.stamp_headers(&mut req.headers, api_key);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let api_key = self.api_key(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;

        let body = stamp_model(&request.payload, &request.model, false);
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages", self.base_url(auth)),
            headers,
            body: Some(body),
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
        let api_key = self.api_key(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;

        let body = stamp_model(&request.payload, &request.model, true);
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages", self.base_url(auth)),
            headers,
            body: Some(body),
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
        let api_key = self.api_key(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;

        let body = stamp_model(&request.payload, &request.model, false);
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/v1/messages/count_tokens", self.base_url(auth)),
            headers,
            body: Some(body),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_model_and_stream() {
        let body = Bytes::from_static(br#"{"messages":[]}"#);
        let out = stamp_model(&body, "claude-3-5-sonnet-latest", true);
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "claude-3-5-sonnet-latest");
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn base_url_defaults_to_public_api() {
        let exec = ClaudeExecutor::new();
        let auth = Auth::new("claude");
        assert_eq!(exec.base_url(&auth), DEFAULT_BASE_URL);
    }
}
