//! Per-dialect-pair request/response/stream converters and the cross-dialect
//! translator registry (spec §4.A) built on top of them.
//!
//! The `generate_content`/`count_tokens`/`list_models`/`get_model` modules
//! each hold one submodule per ordered (source, target) dialect pair and do
//! the field-level mapping. `stream2nostream` collapses a streaming response
//! into the single non-streaming shape a dialect would have returned.
//! `middleware` ties all of it together behind `Proto`/`Op`/`TransformContext`
//! so callers never match on dialect pairs themselves.

pub mod count_tokens;
pub mod generate_content;
pub mod get_model;
pub mod list_models;
pub mod middleware;
pub mod registry;
pub mod stream2nostream;

pub use middleware::{
    CountTokensRequest, CountTokensResponse, GenerateContentRequest, GenerateContentResponse,
    ModelGetRequest, ModelGetResponse, ModelListRequest, ModelListResponse, NostreamToStream, Op,
    Proto, Request, Response, StreamEvent, StreamFormat, StreamToNostream, StreamTransformer,
    TransformContext, TransformError, stream_format, transform_request, transform_response,
};
pub use registry::{TranslatorRegistry, TranslatorRegistryError};
