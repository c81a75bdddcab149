//! Translator Registry (spec §4.A): string-dialect-keyed wrapper around the
//! typed-struct converters in [`crate::middleware`]. Callers never see
//! `Proto`/`TransformContext` directly — they pass the dialect names a
//! downstream client or upstream provider speaks (`"openai"`, `"claude"`,
//! `"gemini"`, `"antigravity"`, `"kiro"`, `"openai-responses"`) and raw JSON
//! bytes, and get raw JSON bytes (or framed SSE strings, for streaming) back.
//!
//! `"antigravity"` is an alias for `"gemini"`-shaped payloads and `"kiro"` is
//! an alias for `"claude"`-shaped payloads: both upstreams speak the aliased
//! dialect's wire format, they just live behind a different executor.

use gproxy_protocol::claude::count_tokens::request::CountTokensRequest as ClaudeCountTokensRequest;
use gproxy_protocol::claude::count_tokens::response::CountTokensResponse as ClaudeCountTokensResponse;
use gproxy_protocol::claude::create_message::request::CreateMessageRequest as ClaudeCreateMessageRequest;
use gproxy_protocol::claude::create_message::response::CreateMessageResponse as ClaudeCreateMessageResponse;
use gproxy_protocol::claude::create_message::stream::BetaStreamEvent;
use gproxy_protocol::claude::get_model::request::GetModelRequest as ClaudeGetModelRequest;
use gproxy_protocol::claude::get_model::response::GetModelResponse as ClaudeGetModelResponse;
use gproxy_protocol::claude::list_models::request::ListModelsRequest as ClaudeListModelsRequest;
use gproxy_protocol::claude::list_models::response::ListModelsResponse as ClaudeListModelsResponse;
use gproxy_protocol::gemini::count_tokens::request::CountTokensRequest as GeminiCountTokensRequest;
use gproxy_protocol::gemini::count_tokens::response::CountTokensResponse as GeminiCountTokensResponse;
use gproxy_protocol::gemini::generate_content::request::GenerateContentRequest as GeminiGenerateContentRequest;
use gproxy_protocol::gemini::generate_content::response::GenerateContentResponse as GeminiGenerateContentResponse;
use gproxy_protocol::gemini::get_model::request::GetModelRequest as GeminiGetModelRequest;
use gproxy_protocol::gemini::get_model::response::GetModelResponse as GeminiGetModelResponse;
use gproxy_protocol::gemini::list_models::request::ListModelsRequest as GeminiListModelsRequest;
use gproxy_protocol::gemini::list_models::response::ListModelsResponse as GeminiListModelsResponse;
use gproxy_protocol::gemini::stream_content::request::StreamGenerateContentRequest as GeminiStreamGenerateContentRequest;
use gproxy_protocol::gemini::stream_content::response::StreamGenerateContentResponse;
use gproxy_protocol::openai::count_tokens::request::InputTokenCountRequest as OpenAICountTokensRequest;
use gproxy_protocol::openai::count_tokens::response::InputTokenCountResponse as OpenAICountTokensResponse;
use gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest as OpenAIChatCompletionRequest;
use gproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse as OpenAIChatCompletionResponse;
use gproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use gproxy_protocol::openai::create_response::request::CreateResponseRequest as OpenAIResponseRequest;
use gproxy_protocol::openai::create_response::response::Response as OpenAIResponse;
use gproxy_protocol::openai::create_response::stream::ResponseStreamEvent;
use gproxy_protocol::openai::get_model::request::GetModelRequest as OpenAIGetModelRequest;
use gproxy_protocol::openai::get_model::response::GetModelResponse as OpenAIGetModelResponse;
use gproxy_protocol::openai::list_models::request::ListModelsRequest as OpenAIListModelsRequest;
use gproxy_protocol::openai::list_models::response::ListModelsResponse as OpenAIListModelsResponse;

use crate::middleware::{
    CountTokensRequest, CountTokensResponse, GenerateContentRequest, GenerateContentResponse,
    ModelGetRequest, ModelGetResponse, ModelListRequest, ModelListResponse, Op, Proto, Request,
    Response, StreamEvent, StreamFormat, StreamTransformer, TransformContext, TransformError,
    stream_format, transform_request, transform_response,
};

#[derive(Debug, thiserror::Error)]
pub enum TranslatorRegistryError {
    #[error("unknown dialect {0:?}")]
    UnknownDialect(String),
    #[error("dialect {dialect:?} does not support operation {op:?}")]
    UnsupportedOp { dialect: String, op: Op },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("malformed {what} payload: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("translator produced a payload shape the caller didn't ask for")]
    ShapeMismatch,
}

/// Resolves a dialect name to the [`Proto`] it maps to for a given
/// operation. `"openai"` is `OpenAIChat` for generate-content operations and
/// the basic `OpenAI` proto for list/get/count-tokens operations, matching
/// the teacher's split between "basic" and "generate" protocol families.
fn resolve(dialect: &str, op: Op) -> Result<Proto, TranslatorRegistryError> {
    let is_generate = matches!(op, Op::GenerateContent | Op::StreamGenerateContent);
    match dialect {
        "claude" => Ok(Proto::Claude),
        "kiro" => Ok(Proto::Claude),
        "gemini" => Ok(Proto::Gemini),
        "antigravity" => Ok(Proto::Gemini),
        "openai" if is_generate => Ok(Proto::OpenAIChat),
        "openai" => Ok(Proto::OpenAI),
        "openai-responses" if is_generate => Ok(Proto::OpenAIResponse),
        "openai-responses" => Err(TranslatorRegistryError::UnsupportedOp {
            dialect: dialect.to_string(),
            op,
        }),
        other => Err(TranslatorRegistryError::UnknownDialect(other.to_string())),
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    what: &'static str,
    raw: &[u8],
) -> Result<T, TranslatorRegistryError> {
    serde_json::from_slice(raw).map_err(|source| TranslatorRegistryError::Decode { what, source })
}

fn encode(what: &'static str, value: &impl serde::Serialize) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|err| {
        panic!("{what} always serializes back to JSON: {err}");
    })
}

/// The registry itself carries no mutable state: every (source, target,
/// operation) pair the teacher's converters support is reachable through
/// [`transform_request`]/[`transform_response`], so "registration" is
/// exhaustiveness in that dispatch rather than a runtime map. Unsupported
/// pairs surface as [`TransformError::UnsupportedPair`] /
/// [`TransformError::ProtoMismatch`], satisfying the "unknown pairs fail
/// with a registry-not-found error" contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct TranslatorRegistry;

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn request_transform(
        &self,
        source: &str,
        target: &str,
        op: Op,
        raw: &[u8],
        stream: bool,
    ) -> Result<Vec<u8>, TranslatorRegistryError> {
        let src = resolve(source, op)?;
        let dst = resolve(target, op)?;
        let dst_op = if stream {
            Op::StreamGenerateContent
        } else {
            op
        };
        let ctx = TransformContext {
            src,
            dst,
            src_op: op,
            dst_op,
        };
        let req = decode_request(src, op, raw)?;
        let out = transform_request(&ctx, req)?;
        Ok(encode_request(out))
    }

    pub fn response_transform_nonstream(
        &self,
        source: &str,
        target: &str,
        op: Op,
        raw: &[u8],
    ) -> Result<Vec<u8>, TranslatorRegistryError> {
        let src = resolve(source, op)?;
        let dst = resolve(target, op)?;
        let ctx = TransformContext {
            src,
            dst,
            src_op: op,
            dst_op: op,
        };
        let resp = decode_response(src, op, raw)?;
        let out = transform_response(&ctx, resp)?;
        encode_response(dst, out)
    }

    /// Open a per-request streaming translation handle (the spec's `param*`
    /// mutable state slot). Each call to [`StreamHandle::push`] feeds one
    /// upstream chunk and returns zero or more fully-framed strings ready to
    /// write to the downstream connection.
    pub fn stream_handle(
        &self,
        source: &str,
        target: &str,
    ) -> Result<StreamHandle, TranslatorRegistryError> {
        let src = resolve(source, Op::StreamGenerateContent)?;
        let dst = resolve(target, Op::StreamGenerateContent)?;
        let ctx = TransformContext {
            src,
            dst,
            src_op: Op::StreamGenerateContent,
            dst_op: Op::StreamGenerateContent,
        };
        let transformer = StreamTransformer::new(&ctx)?;
        Ok(StreamHandle {
            src,
            dst,
            transformer,
        })
    }
}

pub struct StreamHandle {
    src: Proto,
    dst: Proto,
    transformer: StreamTransformer,
}

impl StreamHandle {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, TranslatorRegistryError> {
        let event = decode_stream_event(self.src, chunk)?;
        let out = self.transformer.push(event)?;
        Ok(out.into_iter().map(|event| frame_event(self.dst, event)).collect())
    }
}

fn decode_stream_event(
    proto: Proto,
    raw: &[u8],
) -> Result<StreamEvent, TranslatorRegistryError> {
    Ok(match proto {
        Proto::Claude => StreamEvent::Claude(decode::<BetaStreamEvent>("claude stream event", raw)?),
        Proto::OpenAIChat => StreamEvent::OpenAIChat(decode::<CreateChatCompletionStreamResponse>(
            "openai chat stream event",
            raw,
        )?),
        Proto::OpenAIResponse => StreamEvent::OpenAIResponse(decode::<ResponseStreamEvent>(
            "openai response stream event",
            raw,
        )?),
        Proto::Gemini => StreamEvent::Gemini(decode::<StreamGenerateContentResponse>(
            "gemini stream event",
            raw,
        )?),
        Proto::OpenAI => return Err(TranslatorRegistryError::ShapeMismatch),
    })
}

fn frame_event(dst: Proto, event: StreamEvent) -> String {
    let (name, value) = match event {
        StreamEvent::Claude(ev) => {
            let value = serde_json::to_value(&ev).expect("stream event serializes");
            let name = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("message")
                .to_string();
            (name, value)
        }
        StreamEvent::OpenAIResponse(ev) => {
            let value = serde_json::to_value(&ev).expect("stream event serializes");
            let name = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("response")
                .to_string();
            (name, value)
        }
        StreamEvent::OpenAIChat(ev) => (
            String::new(),
            serde_json::to_value(&ev).expect("stream event serializes"),
        ),
        StreamEvent::Gemini(ev) => (
            String::new(),
            serde_json::to_value(&ev).expect("stream event serializes"),
        ),
    };
    let body = serde_json::to_string(&value).expect("stream event value serializes");
    match stream_format(dst) {
        Some(StreamFormat::SseNamedEvent) => format!("event: {name}\ndata: {body}\n\n"),
        Some(StreamFormat::SseDataOnly) => format!("data: {body}\n\n"),
        Some(StreamFormat::JsonStream) | None => body,
    }
}

fn decode_request(
    proto: Proto,
    op: Op,
    raw: &[u8],
) -> Result<Request, TranslatorRegistryError> {
    Ok(match op {
        Op::ModelList => Request::ModelList(match proto {
            Proto::Claude => ModelListRequest::Claude(decode::<ClaudeListModelsRequest>(
                "claude list_models request",
                raw,
            )?),
            Proto::OpenAI => ModelListRequest::OpenAI(decode::<OpenAIListModelsRequest>(
                "openai list_models request",
                raw,
            )?),
            Proto::Gemini => ModelListRequest::Gemini(decode::<GeminiListModelsRequest>(
                "gemini list_models request",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::ModelGet => Request::ModelGet(match proto {
            Proto::Claude => ModelGetRequest::Claude(decode::<ClaudeGetModelRequest>(
                "claude get_model request",
                raw,
            )?),
            Proto::OpenAI => ModelGetRequest::OpenAI(decode::<OpenAIGetModelRequest>(
                "openai get_model request",
                raw,
            )?),
            Proto::Gemini => ModelGetRequest::Gemini(decode::<GeminiGetModelRequest>(
                "gemini get_model request",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::CountTokens => Request::CountTokens(match proto {
            Proto::Claude => CountTokensRequest::Claude(decode::<ClaudeCountTokensRequest>(
                "claude count_tokens request",
                raw,
            )?),
            Proto::OpenAI => CountTokensRequest::OpenAI(decode::<OpenAICountTokensRequest>(
                "openai count_tokens request",
                raw,
            )?),
            Proto::Gemini => CountTokensRequest::Gemini(decode::<GeminiCountTokensRequest>(
                "gemini count_tokens request",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::GenerateContent => Request::GenerateContent(match proto {
            Proto::Claude => GenerateContentRequest::Claude(decode::<ClaudeCreateMessageRequest>(
                "claude generate_content request",
                raw,
            )?),
            Proto::OpenAIChat => GenerateContentRequest::OpenAIChat(decode::<
                OpenAIChatCompletionRequest,
            >(
                "openai chat generate_content request", raw
            )?),
            Proto::OpenAIResponse => GenerateContentRequest::OpenAIResponse(decode::<
                OpenAIResponseRequest,
            >(
                "openai responses generate_content request", raw
            )?),
            Proto::Gemini => GenerateContentRequest::Gemini(decode::<
                GeminiGenerateContentRequest,
            >(
                "gemini generate_content request", raw
            )?),
            Proto::OpenAI => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::StreamGenerateContent => Request::GenerateContent(match proto {
            Proto::Gemini => GenerateContentRequest::GeminiStream(decode::<
                GeminiStreamGenerateContentRequest,
            >(
                "gemini stream_generate_content request", raw
            )?),
            Proto::Claude => GenerateContentRequest::Claude(decode::<ClaudeCreateMessageRequest>(
                "claude generate_content request",
                raw,
            )?),
            Proto::OpenAIChat => GenerateContentRequest::OpenAIChat(decode::<
                OpenAIChatCompletionRequest,
            >(
                "openai chat generate_content request", raw
            )?),
            Proto::OpenAIResponse => GenerateContentRequest::OpenAIResponse(decode::<
                OpenAIResponseRequest,
            >(
                "openai responses generate_content request", raw
            )?),
            Proto::OpenAI => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
    })
}

fn encode_request(req: Request) -> Vec<u8> {
    match req {
        Request::ModelList(ModelListRequest::Claude(r)) => encode("claude list_models request", &r),
        Request::ModelList(ModelListRequest::OpenAI(r)) => encode("openai list_models request", &r),
        Request::ModelList(ModelListRequest::Gemini(r)) => encode("gemini list_models request", &r),
        Request::ModelGet(ModelGetRequest::Claude(r)) => encode("claude get_model request", &r),
        Request::ModelGet(ModelGetRequest::OpenAI(r)) => encode("openai get_model request", &r),
        Request::ModelGet(ModelGetRequest::Gemini(r)) => encode("gemini get_model request", &r),
        Request::CountTokens(CountTokensRequest::Claude(r)) => {
            encode("claude count_tokens request", &r)
        }
        Request::CountTokens(CountTokensRequest::OpenAI(r)) => {
            encode("openai count_tokens request", &r)
        }
        Request::CountTokens(CountTokensRequest::Gemini(r)) => {
            encode("gemini count_tokens request", &r)
        }
        Request::GenerateContent(GenerateContentRequest::Claude(r)) => {
            encode("claude generate_content request", &r)
        }
        Request::GenerateContent(GenerateContentRequest::OpenAIChat(r)) => {
            encode("openai chat generate_content request", &r)
        }
        Request::GenerateContent(GenerateContentRequest::OpenAIResponse(r)) => {
            encode("openai responses generate_content request", &r)
        }
        Request::GenerateContent(GenerateContentRequest::Gemini(r)) => {
            encode("gemini generate_content request", &r)
        }
        Request::GenerateContent(GenerateContentRequest::GeminiStream(r)) => {
            encode("gemini stream_generate_content request", &r)
        }
    }
}

fn decode_response(
    proto: Proto,
    op: Op,
    raw: &[u8],
) -> Result<Response, TranslatorRegistryError> {
    Ok(match op {
        Op::ModelList => Response::ModelList(match proto {
            Proto::Claude => ModelListResponse::Claude(decode::<ClaudeListModelsResponse>(
                "claude list_models response",
                raw,
            )?),
            Proto::OpenAI => ModelListResponse::OpenAI(decode::<OpenAIListModelsResponse>(
                "openai list_models response",
                raw,
            )?),
            Proto::Gemini => ModelListResponse::Gemini(decode::<GeminiListModelsResponse>(
                "gemini list_models response",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::ModelGet => Response::ModelGet(match proto {
            Proto::Claude => ModelGetResponse::Claude(decode::<ClaudeGetModelResponse>(
                "claude get_model response",
                raw,
            )?),
            Proto::OpenAI => ModelGetResponse::OpenAI(decode::<OpenAIGetModelResponse>(
                "openai get_model response",
                raw,
            )?),
            Proto::Gemini => ModelGetResponse::Gemini(decode::<GeminiGetModelResponse>(
                "gemini get_model response",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::CountTokens => Response::CountTokens(match proto {
            Proto::Claude => CountTokensResponse::Claude(decode::<ClaudeCountTokensResponse>(
                "claude count_tokens response",
                raw,
            )?),
            Proto::OpenAI => CountTokensResponse::OpenAI(decode::<OpenAICountTokensResponse>(
                "openai count_tokens response",
                raw,
            )?),
            Proto::Gemini => CountTokensResponse::Gemini(decode::<GeminiCountTokensResponse>(
                "gemini count_tokens response",
                raw,
            )?),
            _ => return Err(TranslatorRegistryError::ShapeMismatch),
        }),
        Op::GenerateContent | Op::StreamGenerateContent => {
            Response::GenerateContent(match proto {
                Proto::Claude => GenerateContentResponse::Claude(decode::<
                    ClaudeCreateMessageResponse,
                >(
                    "claude generate_content response", raw
                )?),
                Proto::OpenAIChat => GenerateContentResponse::OpenAIChat(decode::<
                    OpenAIChatCompletionResponse,
                >(
                    "openai chat generate_content response", raw
                )?),
                Proto::OpenAIResponse => GenerateContentResponse::OpenAIResponse(decode::<
                    OpenAIResponse,
                >(
                    "openai responses generate_content response", raw
                )?),
                Proto::Gemini => GenerateContentResponse::Gemini(decode::<
                    GeminiGenerateContentResponse,
                >(
                    "gemini generate_content response", raw
                )?),
                Proto::OpenAI => return Err(TranslatorRegistryError::ShapeMismatch),
            })
        }
    })
}

fn encode_response(_dst: Proto, resp: Response) -> Result<Vec<u8>, TranslatorRegistryError> {
    Ok(match resp {
        Response::ModelList(ModelListResponse::Claude(r)) => {
            encode("claude list_models response", &r)
        }
        Response::ModelList(ModelListResponse::OpenAI(r)) => {
            encode("openai list_models response", &r)
        }
        Response::ModelList(ModelListResponse::Gemini(r)) => {
            encode("gemini list_models response", &r)
        }
        Response::ModelGet(ModelGetResponse::Claude(r)) => encode("claude get_model response", &r),
        Response::ModelGet(ModelGetResponse::OpenAI(r)) => encode("openai get_model response", &r),
        Response::ModelGet(ModelGetResponse::Gemini(r)) => encode("gemini get_model response", &r),
        Response::CountTokens(CountTokensResponse::Claude(r)) => {
            encode("claude count_tokens response", &r)
        }
        Response::CountTokens(CountTokensResponse::OpenAI(r)) => {
            encode("openai count_tokens response", &r)
        }
        Response::CountTokens(CountTokensResponse::Gemini(r)) => {
            encode("gemini count_tokens response", &r)
        }
        Response::GenerateContent(GenerateContentResponse::Claude(r)) => {
            encode("claude generate_content response", &r)
        }
        Response::GenerateContent(GenerateContentResponse::OpenAIChat(r)) => {
            encode("openai chat generate_content response", &r)
        }
        Response::GenerateContent(GenerateContentResponse::OpenAIResponse(r)) => {
            encode("openai responses generate_content response", &r)
        }
        Response::GenerateContent(GenerateContentResponse::Gemini(r)) => {
            encode("gemini generate_content response", &r)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_antigravity_and_kiro_aliases() {
        assert_eq!(
            resolve("antigravity", Op::GenerateContent).unwrap(),
            Proto::Gemini
        );
        assert_eq!(resolve("kiro", Op::GenerateContent).unwrap(), Proto::Claude);
    }

    #[test]
    fn openai_resolves_differently_by_operation() {
        assert_eq!(
            resolve("openai", Op::GenerateContent).unwrap(),
            Proto::OpenAIChat
        );
        assert_eq!(resolve("openai", Op::ModelList).unwrap(), Proto::OpenAI);
    }

    #[test]
    fn unknown_dialect_is_rejected() {
        assert!(matches!(
            resolve("made-up", Op::GenerateContent),
            Err(TranslatorRegistryError::UnknownDialect(_))
        ));
    }

    #[test]
    fn passthrough_pair_round_trips_request_bytes() {
        let registry = TranslatorRegistry::new();
        let body = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let raw = serde_json::to_vec(&body).unwrap();
        let out = registry
            .request_transform("claude", "claude", Op::GenerateContent, &raw, false)
            .unwrap();
        let out_value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out_value["model"], "claude-3-5-sonnet");
    }
}
