//! Shared HTTP plumbing used by every concrete executor: sending a prepared
//! `UpstreamHttpRequest` through the shared client and mapping the result
//! (or transport error) onto the `UpstreamFailure` shape executors classify
//! through `decide_unavailable`.

use bytes::Bytes;
use gproxy_provider_core::{
    Headers, HttpMethod, StreamChunk, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamPassthroughError, UpstreamTransportErrorKind,
};

fn transport_failure(err: &wreq::Error) -> UpstreamFailure {
    let kind = if err.is_timeout() {
        UpstreamTransportErrorKind::Timeout
    } else if err.is_connect() {
        UpstreamTransportErrorKind::Connect
    } else if err.is_request() {
        UpstreamTransportErrorKind::Other
    } else {
        UpstreamTransportErrorKind::Other
    };
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

fn response_headers(resp: &wreq::Response) -> Headers {
    resp.headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

fn apply_request(
    client: &wreq::Client,
    req: &UpstreamHttpRequest,
) -> wreq::RequestBuilder {
    let mut builder = match req.method {
        HttpMethod::Get => client.get(&req.url),
        HttpMethod::Post => client.post(&req.url),
        HttpMethod::Put => client.put(&req.url),
        HttpMethod::Patch => client.patch(&req.url),
        HttpMethod::Delete => client.delete(&req.url),
    };
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &req.body {
        builder = builder.body(body.clone());
    }
    builder
}

/// Send a request expecting a single buffered body; used for every
/// non-streaming operation (generate, count_tokens, models, embed).
pub(crate) async fn send_buffered(
    client: &wreq::Client,
    req: UpstreamHttpRequest,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let resp = apply_request(client, &req)
        .send()
        .await
        .map_err(|err| transport_failure(&err))?;
    let status = resp.status().as_u16();
    let headers = response_headers(&resp);
    let body = resp.bytes().await.map_err(|err| transport_failure(&err))?;
    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Bytes(body),
    })
}

/// Send a request whose success body is forwarded chunk-by-chunk. On a
/// non-2xx status the body is buffered instead so the caller can classify it
/// like any other HTTP failure.
pub(crate) async fn send_streamed(
    client: &wreq::Client,
    req: UpstreamHttpRequest,
) -> Result<(u16, Headers, tokio::sync::mpsc::Receiver<StreamChunk>), UpstreamFailure> {
    use futures_util::StreamExt;

    let resp = apply_request(client, &req)
        .send()
        .await
        .map_err(|err| transport_failure(&err))?;
    let status = resp.status().as_u16();
    let headers = response_headers(&resp);

    if !(200..300).contains(&status) {
        let body = resp.bytes().await.map_err(|err| transport_failure(&err))?;
        return Err(UpstreamFailure::Http {
            status,
            headers,
            body,
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let sent = match chunk {
                Ok(bytes) => {
                    tx.send(StreamChunk {
                        payload: Some(bytes),
                        error: None,
                    })
                    .await
                }
                Err(err) => {
                    tx.send(StreamChunk {
                        payload: None,
                        error: Some(UpstreamPassthroughError::service_unavailable(
                            err.to_string(),
                        )),
                    })
                    .await
                }
            };
            if sent.is_err() {
                break;
            }
        }
    });
    Ok((status, headers, rx))
}

/// Best-effort extraction of a human-readable error message from an upstream
/// JSON error body; falls back to the raw body (truncated) when the shape is
/// unrecognized.
pub(crate) fn error_message(body: &Bytes) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.pointer("/message"),
            value.pointer("/error_description"),
            value.pointer("/error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(s) = candidate.as_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    text.chars().take(500).collect()
}

pub(crate) fn passthrough_for_status(status: u16, message: String) -> UpstreamPassthroughError {
    let code = match status {
        400 => "invalid_request",
        401 | 403 => "auth_invalid",
        404 => "not_found",
        429 => "rate_limited",
        s if (500..600).contains(&s) => "upstream_error",
        _ => "upstream_error",
    };
    UpstreamPassthroughError::new(status, message).with_code(code)
}

/// Heuristically pull a usage summary out of an OpenAI/Claude/Gemini-shaped
/// JSON body; each provider's response lands in one of these spots.
pub(crate) fn extract_usage(body: &[u8]) -> Option<gproxy_provider_core::UsageSummary> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage").or_else(|| value.get("usageMetadata"))?;
    let get_u64 = |keys: &[&str]| -> Option<u64> {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
    };
    let prompt_tokens = get_u64(&["prompt_tokens", "input_tokens", "promptTokenCount"]);
    let completion_tokens =
        get_u64(&["completion_tokens", "output_tokens", "candidatesTokenCount"]);
    let total_tokens = get_u64(&["total_tokens", "totalTokenCount"]).or(match (
        prompt_tokens,
        completion_tokens,
    ) {
        (Some(p), Some(c)) => Some(p + c),
        _ => None,
    });
    let cache_read_tokens = get_u64(&[
        "cache_read_input_tokens",
        "cached_tokens",
        "cachedContentTokenCount",
    ]);
    if prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none() {
        return None;
    }
    Some(gproxy_provider_core::UsageSummary {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cache_read_tokens,
        context_usage_percent: None,
    })
}
