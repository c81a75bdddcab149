//! One executor shape reused by every OpenAI-wire-compatible upstream:
//! OpenAI itself, Copilot, MiniMax, Nvidia NIM, DeepSeek, and arbitrary
//! user-configured "custom" channels (spec §4.F). They differ only in base
//! URL, which `Credential` variant carries the key, and a handful of extra
//! headers (Copilot's editor/plugin identification).

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Headers, Options, ProviderExecutor, Request,
    Response, StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};

use crate::auth_extractor;
use crate::providers::support;

#[derive(Clone, Copy)]
pub struct OpenAiCompatSpec {
    pub identifier: &'static str,
    pub default_base_url: Option<&'static str>,
    pub chat_path: &'static str,
    pub embeddings_path: Option<&'static str>,
}

pub const OPENAI: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "openai",
    default_base_url: Some("https://api.openai.com/v1"),
    chat_path: "/chat/completions",
    embeddings_path: Some("/embeddings"),
};

pub const COPILOT: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "copilot",
    default_base_url: Some("https://api.githubcopilot.com"),
    chat_path: "/chat/completions",
    embeddings_path: Some("/embeddings"),
};

pub const MINIMAX: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "minimax",
    default_base_url: Some("https://api.minimax.chat/v1"),
    chat_path: "/text/chatcompletion_v2",
    embeddings_path: None,
};

pub const NVIDIA: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "nvidia",
    default_base_url: Some("https://integrate.api.nvidia.com/v1"),
    chat_path: "/chat/completions",
    embeddings_path: Some("/embeddings"),
};

pub const DEEPSEEK: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "deepseek",
    default_base_url: Some("https://api.deepseek.com/v1"),
    chat_path: "/chat/completions",
    embeddings_path: None,
};

pub const CUSTOM: OpenAiCompatSpec = OpenAiCompatSpec {
    identifier: "custom",
    default_base_url: None,
    chat_path: "/chat/completions",
    embeddings_path: Some("/embeddings"),
};

pub struct OpenAiCompatibleExecutor {
    spec: OpenAiCompatSpec,
}

impl OpenAiCompatibleExecutor {
    pub fn new(spec: OpenAiCompatSpec) -> Self {
        Self { spec }
    }

    fn base_url(&self, auth: &Auth) -> Result<String, UpstreamPassthroughError> {
        let configured = auth
            .metadata
            .get("base_url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| auth.attributes.get("base_url").map(String::as_str));
        let base = configured
            .or(self.spec.default_base_url)
            .ok_or_else(|| {
                UpstreamPassthroughError::invalid_request(format!(
                    "{} auth has no base_url configured",
                    self.spec.identifier
                ))
            })?;
        Ok(base.trim_end_matches('/').to_string())
    }

    fn api_key<'a>(&self, credential: &'a Credential) -> Result<&'a str, UpstreamPassthroughError> {
        let key = match (self.spec.identifier, credential) {
            ("openai", Credential::OpenAI(c)) => &c.api_key,
            ("copilot", Credential::Copilot(c)) => &c.api_key,
            ("minimax", Credential::MiniMax(c)) => &c.api_key,
            ("nvidia", Credential::Nvidia(c)) => &c.api_key,
            ("deepseek", Credential::DeepSeek(c)) => &c.api_key,
            ("custom", Credential::Custom(c)) => &c.api_key,
            _ => {
                return Err(UpstreamPassthroughError::invalid_request(format!(
                    "credential variant does not match provider {}",
                    self.spec.identifier
                )));
            }
        };
        Ok(key.as_str())
    }

    fn credential(&self, auth: &Auth) -> Result<Credential, UpstreamPassthroughError> {
        crate::credential::decode(auth)
    }

    fn with_model(&self, payload: &Bytes, model: &str, stream: bool) -> Bytes {
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(payload) else {
            return payload.clone();
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("model".to_string(), serde_json::Value::String(model.to_string()));
            obj.insert("stream".to_string(), serde_json::Value::Bool(stream));
        }
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .unwrap_or_else(|_| payload.clone())
    }

    fn extra_headers(&self, headers: &mut Headers) {
        if self.spec.identifier == "copilot" {
            auth_extractor::set_header(headers, "Editor-Version", "vscode/1.93.0");
            auth_extractor::set_header(headers, "Editor-Plugin-Version", "copilot-chat/0.22.0");
            auth_extractor::set_header(headers, "Copilot-Integration-Id", "vscode-chat");
        }
    }

    fn build_request(
        &self,
        auth: &Auth,
        path: &str,
        body: Bytes,
        is_stream: bool,
    ) -> Result<UpstreamHttpRequest, AttemptFailure> {
        let base = self.base_url(auth).map_err(|passthrough| AttemptFailure {
            passthrough,
            mark: None,
        })?;
        let credential = self.credential(auth).map_err(|passthrough| AttemptFailure {
            passthrough,
            mark: None,
        })?;
        let api_key = self.api_key(&credential).map_err(|passthrough| AttemptFailure {
            passthrough,
            mark: None,
        })?;
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, api_key);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        self.extra_headers(&mut headers);
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{base}{path}"),
            headers,
            body: Some(body),
            is_stream,
        })
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
impl ProviderExecutor for OpenAiCompatibleExecutor {
    fn identifier(&self) -> &'static str {
        self.spec.identifier
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = self.credential(auth)?;
        let api_key = self.api_key(&credential)?;
        auth_extractor::set_bearer(&mut req.headers, api_key);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let body = self.with_model(&request.payload, &request.model, false);
        let req = self.build_request(auth, self.spec.chat_path, body, false)?;
        let resp = support::send_buffered(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        if !(200..300).contains(&resp.status) {
            let gproxy_provider_core::UpstreamBody::Bytes(body) = resp.body else {
                unreachable!("send_buffered always returns a buffered body")
            };
            return Err(self.classify(UpstreamFailure::Http {
                status: resp.status,
                headers: resp.headers,
                body,
            }));
        }
        let gproxy_provider_core::UpstreamBody::Bytes(body) = resp.body else {
            unreachable!("send_buffered always returns a buffered body")
        };
        let usage = support::extract_usage(&body);
        Ok(Response {
            payload: body,
            usage,
        })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure> {
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let body = self.with_model(&request.payload, &request.model, true);
        let req = self.build_request(auth, self.spec.chat_path, body, true)?;
        let (_, _, rx) = support::send_streamed(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        Ok(rx)
    }

    async fn embed(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let Some(path) = self.spec.embeddings_path else {
            return Err(AttemptFailure {
                passthrough: UpstreamPassthroughError::not_supported(format!(
                    "{}.embed",
                    self.spec.identifier
                )),
                mark: None,
            });
        };
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let body = self.with_model(&request.payload, &request.model, false);
        let req = self.build_request(auth, path, body, false)?;
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
        Ok(Response {
            payload: body,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_model_stamps_model_and_stream_flag() {
        let exec = OpenAiCompatibleExecutor::new(OPENAI);
        let payload = Bytes::from_static(br#"{"messages":[]}"#);
        let out = exec.with_model(&payload, "gpt-4.1", true);
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "gpt-4.1");
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn base_url_prefers_metadata_override() {
        let exec = OpenAiCompatibleExecutor::new(CUSTOM);
        let mut auth = Auth::new("custom");
        auth.metadata
            .insert("base_url".to_string(), serde_json::json!("https://my-host/v1"));
        assert_eq!(exec.base_url(&auth).unwrap(), "https://my-host/v1");
    }

    #[test]
    fn custom_without_base_url_is_invalid_config() {
        let exec = OpenAiCompatibleExecutor::new(CUSTOM);
        let auth = Auth::new("custom");
        assert!(exec.base_url(&auth).is_err());
    }
}
