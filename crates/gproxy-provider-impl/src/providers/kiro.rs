//! AWS CodeWhisperer ("Kiro") executor (spec §4.F). Unlike every other
//! upstream here, Kiro's wire format is the AWS Event Stream binary envelope
//! rather than SSE, so this executor decodes it itself and re-emits
//! Claude-Messages-shaped `data: {...}\n\n` chunks — the registry maps the
//! `"kiro"` dialect onto `Proto::Claude`, so downstream consumers never see
//! the difference. Grounded on the `other_examples` Kiro client/provider
//! pair (header set, URL shape, retry-once-on-401 pattern, refresh
//! endpoints) and on `gproxy_provider_core::eventstream` for framing.

use async_trait::async_trait;
use bytes::Bytes;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, EventStreamDecoder, HttpMethod, Options, ProviderExecutor,
    Request, Response, StreamChunk, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamPassthroughError,
};
use gproxy_provider_core::auth::secret::KiroCredential;
use serde::Deserialize;
use serde_json::Value;

use crate::auth_extractor;
use crate::providers::support;

const DEFAULT_REGION: &str = "us-east-1";
const API_ORIGIN: &str = "AI_EDITOR";
const FALLBACK_ORIGIN: &str = "CLI";
const TARGET_HEADER: &str = "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const SSO_TOKEN_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";
const SOCIAL_REFRESH_URL_TEMPLATE: &str = "https://prod.{region}.auth.desktop.kiro.dev/refreshToken";
const REFRESH_LEAD_SECS: i64 = 20 * 60;

pub struct KiroExecutor;

impl KiroExecutor {
    pub fn new() -> Self {
        Self
    }

    fn credential<'a>(&self, credential: &'a Credential) -> Result<&'a KiroCredential, UpstreamPassthroughError> {
        match credential {
            Credential::Kiro(c) => Ok(c),
            _ => Err(UpstreamPassthroughError::invalid_request("expected Credential::Kiro")),
        }
    }

    fn region(&self, c: &KiroCredential) -> String {
        c.region.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    fn host(&self, region: &str) -> String {
        format!("https://q.{region}.amazonaws.com")
    }

    fn url(&self, region: &str, profile_arn: Option<&str>, origin: &str) -> String {
        let host = self.host(region);
        match profile_arn {
            Some(arn) if !arn.is_empty() => {
                format!("{host}/generateAssistantResponse?origin={origin}&profileArn={}", urlencoding::encode(arn))
            }
            _ => format!("{host}/generateAssistantResponse?origin={origin}"),
        }
    }

    fn user_agent(&self, c: &KiroCredential) -> String {
        if c.auth_method == "idc" || c.auth_method == "builder-id" {
            format!("aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs#22 api/codewhispererstreaming#1.0.27 m/E KiroIDE-0.7.45-{}", machine_fingerprint())
        } else {
            "aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs#22 api/codewhispererstreaming#1.0.27 m/E AmazonQ".to_string()
        }
    }

    fn stamp_headers(&self, headers: &mut gproxy_provider_core::Headers, access_token: &str, ua: &str) {
        auth_extractor::set_bearer(headers, access_token);
        auth_extractor::set_header(headers, "content-type", "application/x-amz-json-1.0");
        auth_extractor::set_header(headers, "x-amz-target", TARGET_HEADER);
        auth_extractor::set_header(headers, "user-agent", ua);
        auth_extractor::set_header(headers, "x-amz-user-agent", &format!("aws-sdk-js/1.0.27 {ua}"));
        auth_extractor::set_header(headers, "x-amzn-codewhisperer-optout", "true");
        auth_extractor::set_header(headers, "x-amzn-kiro-agent-mode", "vibe");
        auth_extractor::set_header(headers, "amz-sdk-invocation-id", &uuid::Uuid::new_v4().to_string());
        auth_extractor::set_header(headers, "amz-sdk-request", "attempt=1; max=3");
    }

    /// Wraps a Claude-Messages-shaped payload into CodeWhisperer's
    /// `conversationState` envelope (spec §4.F).
    fn wrap_body(&self, payload: &Bytes, model: &str) -> Bytes {
        let value: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let content = value
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|msgs| msgs.last())
            .and_then(|m| m.get("content"))
            .map(flatten_content)
            .unwrap_or_default();
        let wrapped = serde_json::json!({
            "conversationState": {
                "chatTriggerType": "MANUAL",
                "conversationId": uuid::Uuid::new_v4().to_string(),
                "currentMessage": {
                    "userInputMessage": {
                        "content": content,
                        "modelId": model,
                        "origin": "AI_EDITOR",
                        "userInputMessageContext": {},
                    }
                },
                "source": "FeatureDev",
            }
        });
        serde_json::to_vec(&wrapped).map(Bytes::from).unwrap_or_else(|_| payload.clone())
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

    async fn send(&self, auth: &Auth, request: &Request, stream: bool) -> Result<(u16, gproxy_provider_core::Headers, Bytes), AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        let region = self.region(c);
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let ua = self.user_agent(c);

        // Kiro retries once on 429 with the fallback origin, per spec §4.F.
        let mut origin = API_ORIGIN;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut headers = Vec::new();
            self.stamp_headers(&mut headers, &c.access_token, &ua);
            let req = UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.url(&region, c.profile_arn.as_deref(), origin),
                headers,
                body: Some(self.wrap_body(&request.payload, &request.model)),
                is_stream: stream,
            };
            let resp = support::send_buffered(&client, req)
                .await
                .map_err(|failure| self.classify(failure))?;
            let UpstreamBody::Bytes(body) = resp.body else {
                unreachable!("send_buffered always returns a buffered body")
            };
            if resp.status == 429 && attempts == 1 && origin == API_ORIGIN {
                origin = FALLBACK_ORIGIN;
                continue;
            }
            if !(200..300).contains(&resp.status) {
                return Err(self.classify(UpstreamFailure::Http {
                    status: resp.status,
                    headers: resp.headers,
                    body,
                }));
            }
            return Ok((resp.status, resp.headers, body));
        }
    }
}

#[async_trait]
impl ProviderExecutor for KiroExecutor {
    fn identifier(&self) -> &'static str {
        "kiro"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        let ua = self.user_agent(c);
        self.stamp_headers(&mut req.headers, &c.access_token, &ua);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let (_, _, body) = self.send(auth, request, false).await?;
        let decoded = decode_event_stream_to_claude(&body, false);
        let usage = support::extract_usage(&decoded.payload);
        Ok(Response {
            payload: decoded.payload,
            usage,
        })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, AttemptFailure> {
        let (_, _, body) = self.send(auth, request, true).await?;
        let decoded = decode_event_stream_to_claude(&body, true);
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let _ = tx.send(StreamChunk { payload: Some(decoded.payload), error: None }).await;
        Ok(rx)
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let c = self.credential(&credential)?;
        if c.refresh_token.is_empty() {
            return Ok(auth.clone());
        }
        if !needs_refresh(c) {
            return Ok(auth.clone());
        }
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let region = self.region(c);

        let refreshed = if c.auth_method == "idc" || c.auth_method == "builder-id" {
            let token_url = SSO_TOKEN_URL_TEMPLATE.replace("{region}", &region);
            let client_id = c.client_id.clone().unwrap_or_default();
            let client_secret = c.client_secret.clone().unwrap_or_default();
            crate::providers::oauth::refresh_token(&client, &token_url, &client_id, &client_secret, &c.refresh_token).await?
        } else {
            let refresh_url = SOCIAL_REFRESH_URL_TEMPLATE.replace("{region}", &region);
            social_refresh(&client, &refresh_url, &c.refresh_token).await?
        };

        let mut next = auth.clone();
        let expires_at = refreshed
            .expires_in
            .map(|secs| now_unix() + secs)
            .unwrap_or_else(|| now_unix() + 3600);
        crate::credential::apply_refresh(&mut next, refreshed.access_token, refreshed.refresh_token, expires_at);
        Ok(next)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Spec §4.F: refresh iff the token is expired (with JWT `exp`-claim skew
/// where available) or within the provider-specific 20-minute lead.
fn needs_refresh(c: &KiroCredential) -> bool {
    if c.expires_at == 0 {
        return true;
    }
    let deadline = c.expires_at - REFRESH_LEAD_SECS;
    now_unix() >= deadline
}

#[derive(Debug, Deserialize)]
struct SocialRefreshResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: String,
    #[serde(rename = "refreshToken", alias = "refresh_token", default)]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn", alias = "expires_in", default)]
    expires_in: Option<i64>,
}

async fn social_refresh(
    client: &wreq::Client,
    url: &str,
    refresh_token: &str,
) -> Result<crate::providers::oauth::RefreshedToken, AttemptFailure> {
    let resp = client
        .post(url)
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .map_err(|err| AttemptFailure {
            passthrough: UpstreamPassthroughError::service_unavailable(format!("kiro refresh request failed: {err}")),
            mark: None,
        })?;
    let status = resp.status();
    let body = resp.bytes().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AttemptFailure {
            passthrough: UpstreamPassthroughError::new(
                401,
                format!("kiro refresh rejected ({}): {}", status.as_u16(), support::error_message(&body)),
            )
            .with_code("auth_invalid"),
            mark: None,
        });
    }
    let parsed: SocialRefreshResponse = serde_json::from_slice(&body).map_err(|err| AttemptFailure {
        passthrough: UpstreamPassthroughError::service_unavailable(format!("kiro refresh response unparsable: {err}")),
        mark: None,
    })?;
    Ok(crate::providers::oauth::RefreshedToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_in: parsed.expires_in,
        id_token: None,
    })
}

fn machine_fingerprint() -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(b"gproxy-kiro-gateway");
    hash.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

struct DecodedBody {
    payload: Bytes,
}

/// Decodes the AWS Event Stream response body into a single Claude-Messages
/// response (non-stream) or a single SSE-framed chunk carrying the full
/// Claude-shaped event sequence (stream) — the central `SseParser` downstream
/// sees ordinary `data: {...}\n\n` text either way (spec §4.I).
fn decode_event_stream_to_claude(body: &Bytes, as_sse: bool) -> DecodedBody {
    let mut decoder = EventStreamDecoder::new(false);
    decoder.feed(body);

    let mut text = String::new();
    let mut output_tokens: Option<u64> = None;
    let mut input_tokens: Option<u64> = None;

    while let Ok(Some(message)) = decoder.next_message() {
        match message.event_type.as_deref() {
            Some("assistantResponseEvent") => {
                if let Ok(value) = serde_json::from_slice::<Value>(&message.payload) {
                    if let Some(content) = value.get("content").and_then(Value::as_str) {
                        text.push_str(content);
                    }
                }
            }
            Some("messageMetadataEvent") => {
                if let Ok(value) = serde_json::from_slice::<Value>(&message.payload) {
                    output_tokens = value.pointer("/tokenUsage/outputTokens").and_then(Value::as_u64);
                    input_tokens = value.pointer("/tokenUsage/inputTokens").and_then(Value::as_u64);
                }
            }
            _ => {}
        }
    }

    let response = serde_json::json!({
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {
            "input_tokens": input_tokens.unwrap_or(0),
            "output_tokens": output_tokens.unwrap_or(0),
        },
    });
    let json = serde_json::to_vec(&response).unwrap_or_default();
    let payload = if as_sse {
        Bytes::from(format!("data: {}\n\n", String::from_utf8_lossy(&json)))
    } else {
        Bytes::from(json)
    };
    DecodedBody { payload }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_body_extracts_last_message_text() {
        let exec = KiroExecutor::new();
        let payload = Bytes::from_static(br#"{"messages":[{"role":"user","content":"hello"}]}"#);
        let out = exec.wrap_body(&payload, "claude-sonnet-4-5");
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "hello"
        );
        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"]["modelId"],
            "claude-sonnet-4-5"
        );
    }

    #[test]
    fn url_includes_profile_arn_when_present() {
        let exec = KiroExecutor::new();
        let url = exec.url("us-east-1", Some("arn:aws:foo"), API_ORIGIN);
        assert!(url.contains("profileArn=arn%3Aaws%3Afoo"));
    }

    #[test]
    fn decodes_event_stream_scenario_s5() {
        let mut bytes = encode_message("assistantResponseEvent", br#"{"content":"Hi"}"#);
        bytes.extend(encode_message(
            "messageMetadataEvent",
            br#"{"tokenUsage":{"outputTokens":3}}"#,
        ));
        let decoded = decode_event_stream_to_claude(&Bytes::from(bytes), false);
        let value: Value = serde_json::from_slice(&decoded.payload).unwrap();
        assert_eq!(value["content"][0]["text"], "Hi");
        assert_eq!(value["usage"]["output_tokens"], 3);
    }

    #[test]
    fn needs_refresh_when_past_twenty_minute_lead() {
        let mut c = KiroCredential {
            access_token: "tok".into(),
            refresh_token: "r".into(),
            expires_at: now_unix() + 60,
            auth_method: "idc".into(),
            region: None,
            start_url: None,
            profile_arn: None,
            client_id: None,
            client_secret: None,
            user_email: None,
        };
        assert!(needs_refresh(&c));
        c.expires_at = now_unix() + 3600;
        assert!(!needs_refresh(&c));
    }

    fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn encode_message(event_type: &str, payload: &[u8]) -> Vec<u8> {
        let headers = encode_string_header(":event-type", event_type);
        let headers_len = headers.len() as u32;
        let total_len = 12 + headers.len() as u32 + payload.len() as u32 + 4;
        let mut prelude = Vec::new();
        prelude.extend_from_slice(&total_len.to_be_bytes());
        prelude.extend_from_slice(&headers_len.to_be_bytes());
        let prelude_crc = crc32fast::hash(&prelude);
        let mut out = prelude;
        out.extend_from_slice(&prelude_crc.to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(payload);
        let message_crc = crc32fast::hash(&out);
        out.extend_from_slice(&message_crc.to_be_bytes());
        out
    }
}
