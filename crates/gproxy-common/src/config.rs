//! The process-wide Configuration bag (spec §4 "Configuration").
//!
//! Distinct from [`crate::GlobalConfig`] (the ingress host/port/DB settings):
//! this is the upstream-provider-facing configuration — static credential
//! pools, model aliasing, and proxy/quota knobs — read by the Conductor and
//! executors on every request. Readers take a cheap `Arc` snapshot via
//! `ArcSwap` rather than locking, since this bag changes only on admin
//! reload, never per-request.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAlias {
    /// Name the client dialect requests.
    pub from: String,
    /// Name actually sent upstream.
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelAlias>,
}

/// Behavior toggles for quota-exhaustion handling across providers that
/// support multiple backing projects or a cheaper fallback model (spec
/// §4.G.3, §4.F Antigravity project rotation).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaExceededPolicy {
    pub switch_project: bool,
    pub switch_preview_model: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub quota_exceeded: QuotaExceededPolicy,
    #[serde(default)]
    pub gemini: Vec<ProviderCredential>,
    #[serde(default)]
    pub claude: Vec<ProviderCredential>,
    #[serde(default)]
    pub codex: Vec<ProviderCredential>,
    #[serde(default)]
    pub vertex: Vec<ProviderCredential>,
    #[serde(default)]
    pub openai_compat: Vec<ProviderCredential>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Directory the file-backed Auth Store persists under (spec §4.B).
    pub auth_dir: String,
}

/// Lock-free shared handle to the live `Configuration`, swapped wholesale on
/// reload (e.g. SIGHUP or an admin endpoint), never mutated in place.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Configuration>>,
}

impl ConfigHandle {
    pub fn new(config: Configuration) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<Configuration> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Configuration) {
        self.inner.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_replaces_snapshot_atomically() {
        let handle = ConfigHandle::new(Configuration {
            auth_dir: "/tmp/a".to_string(),
            ..Default::default()
        });
        let before = handle.load();
        assert_eq!(before.auth_dir, "/tmp/a");

        handle.store(Configuration {
            auth_dir: "/tmp/b".to_string(),
            ..Default::default()
        });
        let after = handle.load();
        assert_eq!(after.auth_dir, "/tmp/b");
        assert_eq!(before.auth_dir, "/tmp/a");
    }
}
