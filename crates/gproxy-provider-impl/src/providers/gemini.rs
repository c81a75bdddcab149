//! API-key Gemini executors: Google AI Studio and Vertex AI Express Mode
//! (spec §4.F "gemini"/"vertex_express"). Both speak the public
//! `generativelanguage.googleapis.com`-shaped wire format; they differ only
//! in base URL and how the key is carried (AI Studio: `key` query param,
//! Vertex Express: `x-goog-api-key` header).

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};

use crate::auth_extractor;
use crate::providers::support;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GeminiKeyMode {
    AiStudioQueryParam,
    VertexExpressHeader,
}

pub struct GeminiApiKeyExecutor {
    identifier: &'static str,
    default_base_url: &'static str,
    mode: GeminiKeyMode,
}

impl GeminiApiKeyExecutor {
    pub fn ai_studio() -> Self {
        Self {
            identifier: "aistudio",
            default_base_url: "https://generativelanguage.googleapis.com",
            mode: GeminiKeyMode::AiStudioQueryParam,
        }
    }

    pub fn vertex_express() -> Self {
        Self {
            identifier: "vertex_express",
            default_base_url: "https://aiplatform.googleapis.com",
            mode: GeminiKeyMode::VertexExpressHeader,
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

    fn api_key<'a>(&self, credential: &'a Credential) -> Result<&'a str, UpstreamPassthroughError> {
        match (self.identifier, credential) {
            ("aistudio", Credential::AIStudio(c)) => Ok(c.api_key.as_str()),
            ("vertex_express", Credential::VertexExpress(c)) => Ok(c.api_key.as_str()),
            _ => Err(UpstreamPassthroughError::invalid_request(format!(
                "credential variant does not match provider {}",
                self.identifier
            ))),
        }
    }

    fn endpoint(&self, auth: &Auth, model: &str, method: &str, api_key: &str) -> String {
        let base = self.base_url(auth);
        let path = format!("/v1beta/models/{model}:{method}");
        match self.mode {
            GeminiKeyMode::AiStudioQueryParam => format!("{base}{path}?key={api_key}"),
            GeminiKeyMode::VertexExpressHeader => format!("{base}{path}"),
        }
    }

    fn stamp_headers(&self, headers: &mut gproxy_provider_core::Headers, api_key: &str) {
        auth_extractor::set_accept_json(headers);
        auth_extractor::set_content_type_json(headers);
        if self.mode == GeminiKeyMode::VertexExpressHeader {
            auth_extractor::set_header(headers, "x-goog-api-key", api_key);
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

    async fn call(
        &self,
        auth: &Auth,
        request: &Request,
        method: &str,
        is_stream: bool,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let api_key = self.api_key(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(auth, &request.model, method, api_key),
            headers,
            body: Some(request.payload.clone()),
            is_stream,
        };
        let (_, _, rx) = support::send_streamed(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        Ok(rx)
    }
}

#[async_trait]
impl ProviderExecutor for GeminiApiKeyExecutor {
    fn identifier(&self) -> &'static str {
        self.identifier
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
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(auth, &request.model, "generateContent", api_key),
            headers,
            body: Some(request.payload.clone()),
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
        self.call(auth, request, "streamGenerateContent", true).await
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
        let mut headers = Vec::new();
        self.stamp_headers(&mut headers, api_key);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(auth, &request.model, "countTokens", api_key),
            headers,
            body: Some(request.payload.clone()),
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

#[allow(dead_code)]
fn normalize_model_name(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_studio_endpoint_carries_key_as_query_param() {
        let exec = GeminiApiKeyExecutor::ai_studio();
        let auth = Auth::new("aistudio");
        let url = exec.endpoint(&auth, "gemini-2.5-pro", "generateContent", "AIzaSy-test");
        assert!(url.ends_with("gemini-2.5-pro:generateContent?key=AIzaSy-test"));
    }

    #[test]
    fn vertex_express_endpoint_has_no_key_in_url() {
        let exec = GeminiApiKeyExecutor::vertex_express();
        let auth = Auth::new("vertex_express");
        let url = exec.endpoint(&auth, "gemini-2.5-pro", "generateContent", "key-123");
        assert!(!url.contains("key-123"));
    }

    #[test]
    fn normalize_strips_models_prefix() {
        assert_eq!(normalize_model_name("models/gemini-2.5-pro"), "gemini-2.5-pro");
        assert_eq!(normalize_model_name("gemini-2.5-pro"), "gemini-2.5-pro");
    }
}
