//! Default provider seed shapes (spec §6 Configuration, supplemented): the
//! config a registry can bootstrap from before any auth file or YAML config
//! has been loaded. Each seed names a provider identifier, whether it is
//! enabled out of the box, and the default JSON shape its `ProviderConfig`
//! would take — used mainly by the `openai-compatible` family, where a
//! user-configured endpoint (Nvidia, DeepSeek, a private "custom" gateway)
//! needs a starting point rather than hardcoded constants.

use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct BuiltinProviderSeed {
    pub identifier: &'static str,
    pub enabled: bool,
    pub default_config: Value,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            identifier: "openai",
            enabled: true,
            default_config: json!({"base_url": "https://api.openai.com/v1"}),
        },
        BuiltinProviderSeed {
            identifier: "claude",
            enabled: true,
            default_config: json!({"base_url": "https://api.anthropic.com"}),
        },
        BuiltinProviderSeed {
            identifier: "claudecode",
            enabled: true,
            default_config: json!({"base_url": "https://api.anthropic.com"}),
        },
        BuiltinProviderSeed {
            identifier: "aistudio",
            enabled: true,
            default_config: json!({"base_url": "https://generativelanguage.googleapis.com"}),
        },
        BuiltinProviderSeed {
            identifier: "vertex_express",
            enabled: true,
            default_config: json!({"base_url": "https://aiplatform.googleapis.com"}),
        },
        BuiltinProviderSeed {
            identifier: "vertex",
            enabled: true,
            default_config: json!({"region": "us-central1"}),
        },
        BuiltinProviderSeed {
            identifier: "geminicli",
            enabled: true,
            default_config: json!({"base_url": "https://cloudcode-pa.googleapis.com"}),
        },
        BuiltinProviderSeed {
            identifier: "antigravity",
            enabled: true,
            default_config: json!({"base_url": "https://cloudcode-pa.googleapis.com"}),
        },
        BuiltinProviderSeed {
            identifier: "codex",
            enabled: true,
            default_config: json!({"base_url": "https://chatgpt.com/backend-api/codex"}),
        },
        BuiltinProviderSeed {
            identifier: "kiro",
            enabled: true,
            default_config: json!({"region": "us-east-1"}),
        },
        BuiltinProviderSeed {
            identifier: "copilot",
            enabled: true,
            default_config: json!({"base_url": "https://api.githubcopilot.com"}),
        },
        BuiltinProviderSeed {
            identifier: "minimax",
            enabled: true,
            default_config: json!({"base_url": "https://api.minimax.chat/v1"}),
        },
        BuiltinProviderSeed {
            identifier: "nvidia",
            enabled: true,
            default_config: json!({"base_url": "https://integrate.api.nvidia.com/v1"}),
        },
        BuiltinProviderSeed {
            identifier: "deepseek",
            enabled: true,
            default_config: json!({"base_url": "https://api.deepseek.com/v1"}),
        },
        BuiltinProviderSeed {
            identifier: "custom",
            enabled: false,
            default_config: json!({"base_url": Value::Null}),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_seed_has_a_unique_identifier() {
        let seeds = builtin_provider_seeds();
        let mut seen = std::collections::HashSet::new();
        for seed in &seeds {
            assert!(seen.insert(seed.identifier), "duplicate seed {}", seed.identifier);
        }
    }

    #[test]
    fn custom_channel_is_disabled_until_configured() {
        let seeds = builtin_provider_seeds();
        let custom = seeds.iter().find(|s| s.identifier == "custom").unwrap();
        assert!(!custom.enabled);
    }
}
