//! The proxy engine: entry point for every non-admin request.
//!
//! Each inbound request is authenticated, its target model extracted, and
//! the ordered candidate list walked until one upstream succeeds. The
//! response is forwarded transparently: headers and body unchanged except
//! for the documented credential substitution and the optional single-field
//! model-alias rewrite. Failures classify into client faults (forwarded
//! verbatim, no failover) and upstream faults (cooldown + next candidate);
//! retries never target the same provider twice within one caller request.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::auth::verify_auth;
use crate::api::handlers::AppState;
use crate::api::streaming::{passthrough_response, StreamLogContext};
use crate::core::error::{AppError, ProviderFailure, Result};
use crate::core::header_policy::{
    detect_auth_scheme, inbound_response_headers, outbound_request_headers,
};
use crate::core::request_log::{extract_usage, RequestLogRecord, RequestLogRing};
use crate::services::model_resolver::rewrite_model_field;

/// Upper bound on the buffered inbound body (model extraction requires it in
/// memory; larger bodies are rejected rather than truncated).
const MAX_INBOUND_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Axum handler: wraps the engine and stamps the request id on every
/// response, including error responses.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let mut response = match handle_proxy_request(state, request_id.clone(), request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn handle_proxy_request(
    state: Arc<AppState>,
    request_id: String,
    request: Request,
) -> Result<Response> {
    let request_start = Instant::now();
    let snapshot = state.config.snapshot();
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // The admin surface is a separate application; nothing under /admin is
    // ever proxied.
    if path.starts_with("/admin") {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "not found"})),
        )
            .into_response());
    }

    verify_auth(&parts.headers, &snapshot.api_key)?;

    let body_bytes = axum::body::to_bytes(body, MAX_INBOUND_BODY_BYTES)
        .await
        .map_err(|_| AppError::BadRequest("request body too large".to_string()))?;

    let json_body: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };
    let query = parts.uri.query().unwrap_or("");
    let model = extract_model(json_body.as_ref(), query);

    let mut record = RequestLogRecord {
        request_id: request_id.clone(),
        endpoint: path.clone(),
        model_requested: model.clone(),
        ..Default::default()
    };

    let Some(model) = model else {
        finish_record(&state.request_log, record, 400, request_start);
        return Err(AppError::BadRequest("model field required".to_string()));
    };

    let stream_requested = stream_requested(&parts.headers, json_body.as_ref(), query);
    let timeout = state.attempt_timeout();

    state
        .resolver
        .ensure_discovered(&state.providers, timeout)
        .await;

    let candidates = state.providers.candidates(&model);
    if candidates.is_empty() {
        tracing::warn!(
            request_id = %request_id,
            model = %model,
            "No provider available"
        );
        finish_record(&state.request_log, record, 503, request_start);
        return Err(AppError::NoProviderAvailable);
    }

    let client = state.clients.client();
    let auth_scheme = detect_auth_scheme(&parts.headers);
    let mut base_headers = outbound_request_headers(&parts.headers);
    if json_body.is_some() && !base_headers.contains_key(header::CONTENT_TYPE) {
        base_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    let mut failures: Vec<ProviderFailure> = Vec::new();

    for spec in candidates {
        let provider_name = spec.config.name.clone();
        let Some(matched) = state.providers.match_model(&spec, &model) else {
            continue;
        };

        let outbound_body: Bytes = if matched.rewritten {
            match rewrite_model_field(&body_bytes, &matched.effective_model) {
                Some(rewritten) => Bytes::from(rewritten),
                None => body_bytes.clone(),
            }
        } else {
            body_bytes.clone()
        };

        let url = build_target_url(
            spec.config.normalized_base_url(),
            &path,
            parts.uri.query(),
        );

        let mut headers = base_headers.clone();
        if let Some((name, value)) = auth_scheme.apply(&spec.config.api_key) {
            headers.insert(name, value);
        }

        tracing::info!(
            request_id = %request_id,
            method = %parts.method,
            path = %path,
            provider = %provider_name,
            model = %matched.effective_model,
            "Dispatching request to provider"
        );

        let attempt_start = Instant::now();
        let mut upstream_request = client
            .request(parts.method.clone(), url.as_str())
            .headers(headers);
        if !outbound_body.is_empty() {
            upstream_request = upstream_request.body(outbound_body);
        }

        // The attempt deadline bounds the wait for the response head only.
        // Whether a response streams is not known until the head arrives
        // (the upstream may answer with an event stream unprompted), so no
        // attempt may carry a total deadline: it would sever any stream
        // outliving it. Buffered body reads get their own bound below.
        let response = match tokio::time::timeout(timeout, upstream_request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                record_attempt_failure(
                    &state,
                    &mut failures,
                    &provider_name,
                    transport_reason(error),
                );
                continue;
            }
            Err(_) => {
                record_attempt_failure(&state, &mut failures, &provider_name, "timeout".into());
                continue;
            }
        };

        let status = status_of(&response);

        if status.as_u16() >= 500 || status == StatusCode::TOO_MANY_REQUESTS {
            record_attempt_failure(
                &state,
                &mut failures,
                &provider_name,
                format!("HTTP {}", status.as_u16()),
            );
            continue;
        }

        if status.is_client_error() {
            // Client fault: the upstream is healthy, the request is not.
            // Forward verbatim and stop; no cooldown, no failover.
            let response_headers = inbound_response_headers(response.headers());
            let payload = match read_body(response, timeout).await {
                Ok(payload) => payload,
                Err(reason) => {
                    record_attempt_failure(&state, &mut failures, &provider_name, reason);
                    continue;
                }
            };
            tracing::warn!(
                request_id = %request_id,
                provider = %provider_name,
                status = status.as_u16(),
                "Provider returned client error; forwarding verbatim"
            );
            state
                .providers
                .mark_success(&provider_name, elapsed_ms(attempt_start));
            record.provider_name = Some(provider_name);
            record.model_effective = Some(matched.effective_model);
            finish_record(&state.request_log, record, status.as_u16(), request_start);
            return Ok(build_response(status, response_headers, payload));
        }

        // 2xx/3xx: success. Stream when the caller asked for it or the
        // upstream answers with an event stream.
        let is_streaming = stream_requested || is_event_stream(response.headers());
        record.provider_name = Some(provider_name.clone());
        record.model_effective = Some(matched.effective_model.clone());
        record.status_code = Some(status.as_u16());

        if is_streaming {
            state
                .providers
                .mark_success(&provider_name, elapsed_ms(attempt_start));
            record.is_streaming = true;
            let ctx = StreamLogContext {
                ring: state.request_log.clone(),
                record,
                request_start,
            };
            return Ok(passthrough_response(response, ctx));
        }

        let response_headers = inbound_response_headers(response.headers());
        let payload = match read_body(response, timeout).await {
            Ok(payload) => payload,
            Err(reason) => {
                record.provider_name = None;
                record.model_effective = None;
                record.status_code = None;
                record_attempt_failure(&state, &mut failures, &provider_name, reason);
                continue;
            }
        };

        state
            .providers
            .mark_success(&provider_name, elapsed_ms(attempt_start));
        if let Ok(parsed) = serde_json::from_slice::<Value>(&payload) {
            extract_usage(&parsed).apply_to(&mut record);
        }
        finish_record(&state.request_log, record, status.as_u16(), request_start);
        return Ok(build_response(status, response_headers, payload));
    }

    tracing::error!(
        request_id = %request_id,
        model = %model,
        attempts = failures.len(),
        "All providers failed"
    );
    finish_record(&state.request_log, record, 502, request_start);
    Err(AppError::AllProvidersFailed(failures))
}

/// Target URL: provider origin + original path and query, byte for byte.
fn build_target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{base_url}{path}");
    if let Some(query) = query {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }
    url
}

/// Model from the top-level JSON `model` field, else the `model` query
/// parameter.
fn extract_model(json_body: Option<&Value>, query: &str) -> Option<String> {
    if let Some(model) = json_body
        .and_then(|body| body.get("model"))
        .and_then(Value::as_str)
    {
        return Some(model.to_string());
    }
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "model")
        .map(|(_, value)| value.into_owned())
}

/// Whether the caller asked for a streamed response: `Accept` mentions an
/// event stream, or the body/query carries a truthy `stream`/`streaming`.
fn stream_requested(headers: &HeaderMap, json_body: Option<&Value>, query: &str) -> bool {
    let accept_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false);
    if accept_stream {
        return true;
    }

    if let Some(body) = json_body {
        if truthy_value(body.get("stream")) || truthy_value(body.get("streaming")) {
            return true;
        }
    }

    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| (key == "stream" || key == "streaming") && truthy_str(&value))
}

fn truthy_value(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::String(s)) => truthy_str(s),
        _ => false,
    }
}

fn truthy_str(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn status_of(response: &reqwest::Response) -> StatusCode {
    StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Short failure summary for the 502 aggregate and the cooldown record.
fn transport_reason(error: reqwest::Error) -> String {
    if error.is_timeout() {
        "timeout".to_string()
    } else if error.is_connect() {
        format!("connect error: {}", error.without_url())
    } else {
        format!("transport error: {}", error.without_url())
    }
}

fn record_attempt_failure(
    state: &AppState,
    failures: &mut Vec<ProviderFailure>,
    provider: &str,
    reason: String,
) {
    tracing::warn!(provider = %provider, reason = %reason, "Upstream attempt failed");
    state.providers.mark_failure(provider, &reason);
    failures.push(ProviderFailure {
        provider: provider.to_string(),
        reason,
    });
}

/// Read a buffered upstream body. Attempts carry no request-level deadline
/// (it would bound stream bodies too), so buffered reads are bounded here.
async fn read_body(
    response: reqwest::Response,
    timeout: Duration,
) -> std::result::Result<Bytes, String> {
    match tokio::time::timeout(timeout, response.bytes()).await {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(error)) => Err(transport_reason(error)),
        Err(_) => Err("timeout".to_string()),
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, payload: Bytes) -> Response {
    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn finish_record(
    ring: &RequestLogRing,
    mut record: RequestLogRecord,
    status: u16,
    request_start: Instant,
) {
    record.status_code = Some(status);
    record.latency_ms = Some(elapsed_ms(request_start));
    ring.push(record);
}
