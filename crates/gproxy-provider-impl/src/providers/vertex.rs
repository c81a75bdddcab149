//! Vertex AI executor using a Google service-account credential (spec §4.F
//! "vertex"): requests are authorized with a self-signed JWT-bearer assertion
//! exchanged for a short-lived access token, cached on the `Auth` until it's
//! within a minute of expiry.

use async_trait::async_trait;
use gproxy_provider_core::{
    Auth, AttemptFailure, Credential, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UpstreamFailure, UpstreamHttpRequest, UpstreamPassthroughError,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::auth_extractor;
use crate::providers::{oauth, support};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REGION: &str = "us-central1";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Serialize)]
struct Claims {
    iss: String,
    scope: &'static str,
    aud: String,
    iat: i64,
    exp: i64,
}

pub struct VertexExecutor;

impl VertexExecutor {
    pub fn new() -> Self {
        Self
    }

    fn credential<'a>(
        &self,
        credential: &'a Credential,
    ) -> Result<&'a gproxy_provider_core::auth::secret::ServiceAccountCredential, UpstreamPassthroughError>
    {
        match credential {
            Credential::Vertex(c) => Ok(c),
            _ => Err(UpstreamPassthroughError::invalid_request(
                "expected Credential::Vertex",
            )),
        }
    }

    fn region(&self, auth: &Auth) -> String {
        auth.metadata
            .get("region")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string()
    }

    fn endpoint(&self, project: &str, region: &str, model: &str, method: &str) -> String {
        let query = if method == "streamGenerateContent" { "?alt=sse" } else { "" };
        format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/google/models/{model}:{method}{query}"
        )
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

    async fn mint_access_token(
        &self,
        client: &wreq::Client,
        sa: &gproxy_provider_core::auth::secret::ServiceAccountCredential,
    ) -> Result<(String, i64), AttemptFailure> {
        let token_uri = sa.token_uri.clone().unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let claims = Claims {
            iss: sa.client_email.clone(),
            scope: SCOPE,
            aud: token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(sa.private_key.as_bytes()).map_err(|err| {
            AttemptFailure::from(UpstreamPassthroughError::invalid_request(format!(
                "invalid service account private key: {err}"
            )))
        })?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| {
                AttemptFailure::from(UpstreamPassthroughError::invalid_request(format!(
                    "failed to sign service account assertion: {err}"
                )))
            })?;

        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ];
        let resp = client
            .post(&token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|err| {
                AttemptFailure::from(UpstreamPassthroughError::service_unavailable(format!(
                    "vertex token exchange failed: {err}"
                )))
            })?;
        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AttemptFailure::from(
                UpstreamPassthroughError::new(
                    401,
                    format!(
                        "vertex token exchange rejected ({}): {}",
                        status.as_u16(),
                        support::error_message(&body)
                    ),
                )
                .with_code("auth_invalid"),
            ));
        }
        let parsed: oauth::RefreshedToken = serde_json::from_slice(&body).map_err(|err| {
            AttemptFailure::from(UpstreamPassthroughError::service_unavailable(format!(
                "vertex token response unparsable: {err}"
            )))
        })?;
        let expires_at = now + parsed.expires_in.unwrap_or(3600);
        Ok((parsed.access_token, expires_at))
    }
}

#[async_trait]
impl ProviderExecutor for VertexExecutor {
    fn identifier(&self) -> &'static str {
        "vertex"
    }

    fn prepare_request(
        &self,
        req: &mut UpstreamHttpRequest,
        auth: &Auth,
    ) -> Result<(), UpstreamPassthroughError> {
        let credential = crate::credential::decode(auth)?;
        let sa = self.credential(&credential)?;
        auth_extractor::set_bearer(&mut req.headers, &sa.access_token);
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: &Request,
        _options: &Options,
    ) -> Result<Response, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let sa = self.credential(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let region = self.region(auth);
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, &sa.access_token);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(&sa.project_id, &region, &request.model, "generateContent"),
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
        let credential = crate::credential::decode(auth)?;
        let sa = self.credential(&credential)?;
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let region = self.region(auth);
        let mut headers = Vec::new();
        auth_extractor::set_bearer(&mut headers, &sa.access_token);
        auth_extractor::set_accept_json(&mut headers);
        auth_extractor::set_content_type_json(&mut headers);
        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.endpoint(&sa.project_id, &region, &request.model, "streamGenerateContent"),
            headers,
            body: Some(request.payload.clone()),
            is_stream: true,
        };
        let (_, _, rx) = support::send_streamed(&client, req)
            .await
            .map_err(|failure| self.classify(failure))?;
        Ok(rx)
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, AttemptFailure> {
        let credential = crate::credential::decode(auth)?;
        let sa = self.credential(&credential)?;
        if !oauth::is_expired(sa.expires_at, 60) {
            return Ok(auth.clone());
        }
        let client = crate::client::shared_client(auth.proxy_url.as_deref())?;
        let (access_token, expires_at) = self.mint_access_token(&client, sa).await?;
        let mut next = auth.clone();
        crate::credential::apply_refresh(&mut next, access_token, None, expires_at);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_embeds_project_region_and_model() {
        let exec = VertexExecutor::new();
        let url = exec.endpoint("proj-1", "us-central1", "gemini-2.5-pro", "generateContent");
        assert!(url.contains("/projects/proj-1/"));
        assert!(url.contains("/locations/us-central1/"));
        assert!(url.ends_with("gemini-2.5-pro:generateContent"));
    }

    #[test]
    fn stream_endpoint_has_alt_sse_query() {
        let exec = VertexExecutor::new();
        let url = exec.endpoint("proj-1", "us-central1", "gemini-2.5-pro", "streamGenerateContent");
        assert!(url.ends_with("?alt=sse"));
    }
}
