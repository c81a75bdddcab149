//! One module per upstream provider family (spec §4.F), plus the `oauth` and
//! `support` helpers they share.

mod antigravity;
mod claude;
mod claude_code;
mod codex;
mod gemini;
mod google_cli;
mod kiro;
mod oauth;
mod openai_compatible;
mod support;
mod vertex;

pub use antigravity::AntigravityExecutor;
pub use claude::ClaudeExecutor;
pub use claude_code::ClaudeCodeExecutor;
pub use codex::CodexExecutor;
pub use gemini::GeminiApiKeyExecutor;
pub use google_cli::GoogleCliExecutor;
pub use kiro::KiroExecutor;
pub use openai_compatible::{
    CUSTOM, COPILOT, DEEPSEEK, MINIMAX, NVIDIA, OPENAI, OpenAiCompatibleExecutor, OpenAiCompatSpec,
};
pub use vertex::VertexExecutor;
