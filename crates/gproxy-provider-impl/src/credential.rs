//! Maps the generic `Auth.attributes`/`Auth.metadata` maps the store
//! round-trips onto the typed `Credential` view executors work with, and
//! writes refreshed OAuth fields back after `ProviderExecutor::refresh`
//! (spec §3, §4.B). API-key providers keep the key in `Attributes` (the flat
//! string map); OAuth providers keep their fields in `Metadata`.

use gproxy_provider_core::auth::secret::{
    AntigravityCredential, ApiKeyCredential, ClaudeCodeCredential, CodexCredential,
    GeminiCliCredential, KiroCredential, ServiceAccountCredential,
};
use gproxy_provider_core::{Auth, Credential, UpstreamPassthroughError};

fn api_key(auth: &Auth) -> Result<ApiKeyCredential, UpstreamPassthroughError> {
    let api_key = auth
        .attributes
        .get("api_key")
        .cloned()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            UpstreamPassthroughError::invalid_request(format!(
                "{} auth {} has no api_key",
                auth.provider, auth.id
            ))
        })?;
    Ok(ApiKeyCredential { api_key })
}

fn metadata_str(auth: &Auth, key: &str) -> String {
    auth.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn metadata_i64(auth: &Auth, key: &str) -> i64 {
    auth.metadata.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn metadata_opt_str(auth: &Auth, key: &str) -> Option<String> {
    auth.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

pub fn decode(auth: &Auth) -> Result<Credential, UpstreamPassthroughError> {
    Ok(match auth.provider.as_str() {
        "openai" => Credential::OpenAI(api_key(auth)?),
        "claude" => Credential::Claude(api_key(auth)?),
        "aistudio" => Credential::AIStudio(api_key(auth)?),
        "vertex_express" => Credential::VertexExpress(api_key(auth)?),
        "nvidia" => Credential::Nvidia(api_key(auth)?),
        "deepseek" => Credential::DeepSeek(api_key(auth)?),
        "custom" => Credential::Custom(api_key(auth)?),
        "copilot" => Credential::Copilot(api_key(auth)?),
        "minimax" => Credential::MiniMax(api_key(auth)?),
        "geminicli" => Credential::GeminiCli(GeminiCliCredential {
            access_token: metadata_str(auth, "access_token"),
            refresh_token: metadata_str(auth, "refresh_token"),
            expires_at: metadata_i64(auth, "expires_at"),
            project_id: metadata_str(auth, "project_id"),
            client_id: metadata_str(auth, "client_id"),
            client_secret: metadata_str(auth, "client_secret"),
            user_email: metadata_opt_str(auth, "user_email"),
        }),
        "antigravity" => Credential::Antigravity(AntigravityCredential {
            access_token: metadata_str(auth, "access_token"),
            refresh_token: metadata_str(auth, "refresh_token"),
            expires_at: metadata_i64(auth, "expires_at"),
            project_id: metadata_str(auth, "project_id"),
            client_id: metadata_str(auth, "client_id"),
            client_secret: metadata_str(auth, "client_secret"),
            user_email: metadata_opt_str(auth, "user_email"),
        }),
        "codex" => Credential::Codex(CodexCredential {
            access_token: metadata_str(auth, "access_token"),
            refresh_token: metadata_str(auth, "refresh_token"),
            id_token: metadata_str(auth, "id_token"),
            user_email: metadata_opt_str(auth, "user_email"),
            account_id: metadata_str(auth, "account_id"),
            expires_at: metadata_i64(auth, "expires_at"),
        }),
        "claudecode" => Credential::ClaudeCode(ClaudeCodeCredential {
            access_token: metadata_str(auth, "access_token"),
            refresh_token: metadata_str(auth, "refresh_token"),
            expires_at: metadata_i64(auth, "expires_at"),
            enable_claude_1m_sonnet: auth
                .metadata
                .get("enable_claude_1m_sonnet")
                .and_then(|v| v.as_bool()),
            enable_claude_1m_opus: auth
                .metadata
                .get("enable_claude_1m_opus")
                .and_then(|v| v.as_bool()),
            supports_claude_1m_sonnet: auth
                .metadata
                .get("supports_claude_1m_sonnet")
                .and_then(|v| v.as_bool()),
            supports_claude_1m_opus: auth
                .metadata
                .get("supports_claude_1m_opus")
                .and_then(|v| v.as_bool()),
            subscription_type: metadata_str(auth, "subscription_type"),
            rate_limit_tier: metadata_str(auth, "rate_limit_tier"),
            session_key: metadata_opt_str(auth, "session_key"),
            user_email: metadata_opt_str(auth, "user_email"),
        }),
        "kiro" => Credential::Kiro(KiroCredential {
            access_token: metadata_str(auth, "access_token"),
            refresh_token: metadata_str(auth, "refresh_token"),
            expires_at: metadata_i64(auth, "expires_at"),
            auth_method: metadata_str(auth, "auth_method"),
            region: metadata_opt_str(auth, "region"),
            start_url: metadata_opt_str(auth, "start_url"),
            profile_arn: metadata_opt_str(auth, "profile_arn"),
            client_id: metadata_opt_str(auth, "client_id"),
            client_secret: metadata_opt_str(auth, "client_secret"),
            user_email: metadata_opt_str(auth, "user_email"),
        }),
        "vertex" => Credential::Vertex(ServiceAccountCredential {
            project_id: metadata_str(auth, "project_id"),
            client_email: metadata_str(auth, "client_email"),
            private_key: metadata_str(auth, "private_key"),
            private_key_id: metadata_str(auth, "private_key_id"),
            client_id: metadata_str(auth, "client_id"),
            auth_uri: metadata_opt_str(auth, "auth_uri"),
            token_uri: metadata_opt_str(auth, "token_uri"),
            auth_provider_x509_cert_url: metadata_opt_str(auth, "auth_provider_x509_cert_url"),
            client_x509_cert_url: metadata_opt_str(auth, "client_x509_cert_url"),
            universe_domain: metadata_opt_str(auth, "universe_domain"),
            access_token: metadata_str(auth, "access_token"),
            expires_at: metadata_i64(auth, "expires_at"),
        }),
        other => {
            return Err(UpstreamPassthroughError::invalid_request(format!(
                "unknown provider {other}"
            )));
        }
    })
}

/// Replace the stored access/refresh token set after a refresh (spec §4.G.4:
/// refresh replaces, it does not append to, the stored credential fields).
pub fn apply_refresh(
    auth: &mut Auth,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: i64,
) {
    auth.metadata
        .insert("access_token".to_string(), serde_json::json!(access_token));
    if let Some(refresh_token) = refresh_token {
        auth.metadata
            .insert("refresh_token".to_string(), serde_json::json!(refresh_token));
    }
    if expires_at != 0 {
        auth.metadata
            .insert("expires_at".to_string(), serde_json::json!(expires_at));
    }
    auth.last_refreshed_at = Some(std::time::SystemTime::now());
    auth.updated_at = auth.last_refreshed_at.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_api_key_provider_from_attributes() {
        let mut auth = Auth::new("claude");
        auth.attributes
            .insert("api_key".to_string(), "sk-ant-123".to_string());
        match decode(&auth).unwrap() {
            Credential::Claude(c) => assert_eq!(c.api_key, "sk-ant-123"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_oauth_provider_from_metadata() {
        let mut auth = Auth::new("geminicli");
        auth.metadata
            .insert("access_token".to_string(), serde_json::json!("tok"));
        auth.metadata
            .insert("project_id".to_string(), serde_json::json!("proj-1"));
        match decode(&auth).unwrap() {
            Credential::GeminiCli(c) => {
                assert_eq!(c.access_token, "tok");
                assert_eq!(c.project_id, "proj-1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_api_key_is_invalid_config() {
        let auth = Auth::new("claude");
        assert!(decode(&auth).is_err());
    }
}
