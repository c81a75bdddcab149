//! Core abstractions shared by every provider executor: the auth record and
//! its state machine, the selector, the executor contract, and the event
//! hub. This crate performs no network IO.

pub mod auth;
pub mod errors;
pub mod eventstream;
pub mod events;
pub mod executor;
pub mod headers;
pub mod memory;
pub mod registry;
pub mod selector;
pub mod thinking;
pub mod truncate;
pub mod usage;

pub use auth::{Attributes, Auth, AuthStatus, Credential, LastError, Metadata, ModelState, Quota};
pub use errors::{ProviderError, ProviderResult};
pub use eventstream::{EventStreamDecoder, EventStreamError, EventStreamMessage, HeaderValue};
pub use events::{Event, EventHub, EventSink, OperationalEvent, ResultEvent, TerminalEventSink, UsageSummary};
pub use executor::{
    AttemptFailure, AuthRetryAction, HttpMethod, Options, ProviderExecutor, Request, Response,
    StreamChunk, UnavailableDecision, UnavailableReason, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamPassthroughError,
    UpstreamTransportErrorKind, default_decide_unavailable, REQUESTED_MODEL_KEY,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use memory::{InMemoryMemoryStore, MemoryEvent, MemoryStore, session_id_from_metadata};
pub use registry::ExecutorRegistry;
pub use selector::{BlockReason, SelectOptions, Selector, SelectorError};
pub use thinking::{ThinkingCapability, ThinkingDialect, apply_thinking_budget, dialect_for_provider, is_claude_family, thinking_capability};
pub use truncate::{model_context_limit, truncate_messages};
pub use usage::UsageReporter;
