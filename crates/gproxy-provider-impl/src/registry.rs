//! Populates an `ExecutorRegistry` with every built-in provider executor
//! (spec §4.G: "Registered executors keyed by `Auth.Provider`"). Grounded on
//! the teacher's `build_registry`/`build_registry_with_sink` (one `Arc::new`
//! per provider, inserted under its own name), adapted to the single
//! `ExecutorRegistry::register` seam instead of per-field provider slots.

use std::sync::Arc;

use gproxy_provider_core::ExecutorRegistry;

use crate::providers::{
    AntigravityExecutor, COPILOT, ClaudeCodeExecutor, ClaudeExecutor, CodexExecutor, CUSTOM,
    DEEPSEEK, GeminiApiKeyExecutor, GoogleCliExecutor, KiroExecutor, MINIMAX, NVIDIA, OPENAI,
    OpenAiCompatibleExecutor, VertexExecutor,
};

/// Registers every built-in executor under its provider identifier. Callers
/// that need a `custom` openai-compatible channel with a different identifier
/// (multiple user-configured gateways) register additional
/// `OpenAiCompatibleExecutor::new(CUSTOM)` instances under their own key
/// directly against the registry; this only seeds the seam's default set.
pub fn register_builtin_providers(registry: &mut ExecutorRegistry) {
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(OPENAI)));
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(COPILOT)));
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(MINIMAX)));
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(NVIDIA)));
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(DEEPSEEK)));
    registry.register(Arc::new(OpenAiCompatibleExecutor::new(CUSTOM)));
    registry.register(Arc::new(ClaudeExecutor::new()));
    registry.register(Arc::new(ClaudeCodeExecutor::new()));
    registry.register(Arc::new(CodexExecutor::new()));
    registry.register(Arc::new(GoogleCliExecutor::gemini_cli()));
    registry.register(Arc::new(AntigravityExecutor::new()));
    registry.register(Arc::new(VertexExecutor::new()));
    registry.register(Arc::new(GeminiApiKeyExecutor::ai_studio()));
    registry.register(Arc::new(GeminiApiKeyExecutor::vertex_express()));
    registry.register(Arc::new(KiroExecutor::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin_identifier() {
        let mut registry = ExecutorRegistry::new();
        register_builtin_providers(&mut registry);
        for id in [
            "openai", "copilot", "minimax", "nvidia", "deepseek", "custom", "claude",
            "claudecode", "codex", "geminicli", "antigravity", "vertex", "aistudio",
            "vertex_express", "kiro",
        ] {
            assert!(registry.contains(id), "missing executor for {id}");
        }
    }
}
