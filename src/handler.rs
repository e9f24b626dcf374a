//! Entry Handler (§4.7): the `POST /v1/*` pipeline — correlation ID, auth, request
//! classification, usage pre-check, source selection, transformation, and relay — wired up
//! as the single axum handler function for the dispatch route.

use axum::body::{Body, to_bytes};
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::errors::{Error, ErrorResponse};
use crate::store::{Store, UsageDenialReason};
use crate::transform;
use crate::usage::{self, UsageCommit};
use crate::{AppState, selector};

const CORRELATION_ID_HEADER: &str = "x-correlation-id";
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Handles every `POST /v1/*` request (§4.7). Non-POST methods are rejected with 405 by the
/// router's method filter before this is ever reached for those routes; this function only
/// ever sees POST, but still guards on it defensively since it's invoked for every `/v1/*`
/// path regardless of sub-route.
pub async fn dispatch(State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, request: Request<Body>) -> Response {
    let correlation_id = adopt_correlation_id(&headers);

    let outcome = run_pipeline(&state, method, &uri, &headers, request, correlation_id).await;

    match outcome {
        Ok(mut response) => {
            if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
            response
        }
        Err(error) => {
            let mut response = ErrorResponse { error, correlation_id }.into_response();
            if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
            response
        }
    }
}

fn adopt_correlation_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

async fn run_pipeline(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    request: Request<Body>,
    correlation_id: Uuid,
) -> Result<Response, Error> {
    // Step 2: reject non-POST.
    if method != Method::POST {
        return Err(Error::MethodNotAllowed);
    }

    let path = uri.path().to_string();
    let path_and_query = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.clone(),
    };

    // Step 3: auth.
    let token = extract_bearer_token(headers)?;
    let key_record = state.store.get_key(token).await?;
    if key_record.is_expired(Utc::now().date_naive()) {
        return Err(Error::KeyExpired);
    }

    let body_bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::Internal(format!("failed to read request body: {e}")))?;
    let mut body: Value = serde_json::from_slice(&body_bytes).map_err(|e| Error::Internal(format!("invalid JSON body: {e}")))?;

    // Step 4: classification.
    let should_count_usage = usage::should_count_usage(&path, &body);
    let client_fingerprint = client_fingerprint(headers);
    let conversation_id = usage::conversation_id(&client_fingerprint, &user_agent(headers));

    // Step 5: quota pre-check.
    let check = state.store.check_usage(token).await?;
    if !check.allowed {
        return match check.reason {
            Some(UsageDenialReason::InvalidKey) => Err(Error::InvalidApiKey),
            _ => Err(Error::DailyLimitReached { current_usage: check.current, daily_limit: check.limit }),
        };
    }

    // Step 6: source selection.
    let settings = state
        .store
        .get_settings()
        .await?
        .with_fallbacks(state.config.primary_backend_api_key.as_deref(), state.config.default_upstream_base_url.as_ref().map(Url::as_str));
    let active = selector::select(
        &state.store,
        &key_record,
        &settings,
        state.config.concurrency.default_limit,
        state.config.concurrency.backup_limit,
        state.config.lock_ttl_secs,
        state.metrics.as_ref(),
    )
    .await?;

    // Step 7: request transformation. Any failure from here releases the acquired slot.
    let model_actual = active
        .model_actual
        .clone()
        .or_else(|| Some(settings.model_actual.clone()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| settings.model_actual.clone());

    if let Err(err) = transform::validate_and_swap_model(&mut body, &settings, Some(model_actual.as_str())) {
        active.slot.release().await;
        return Err(err);
    }

    let model_configs = state.store.get_model_configs().await;
    let prompt = transform::resolve_system_prompt(
        key_record.selected_model.as_deref(),
        &model_configs,
        &settings,
        state.config.system_prompt_char_cap,
    );
    transform::inject_system_prompt(&mut body, prompt.as_deref(), &path, &active);

    let url = transform::build_upstream_url(&active.api_url, &path_and_query);

    let usage_commit = if should_count_usage {
        UsageCommit::armed(token.to_string(), Some(conversation_id))
    } else {
        UsageCommit::disarmed(token.to_string())
    };

    // Step 8: relay & rewrite. Timed end to end for `dispatch_request_duration_seconds`; for
    // streaming responses the same span also stands in for TTFB, since `dispatch` returns as
    // soon as the upstream status is known and the SSE body starts streaming.
    let source_kind = active.kind.label();
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let relay_start = std::time::Instant::now();

    let response = state
        .relay
        .dispatch(&state.store, active, url, body, model_actual, settings.model_display.clone(), correlation_id, usage_commit)
        .await;

    if let Some(metrics) = &state.metrics {
        let elapsed = relay_start.elapsed().as_secs_f64();
        metrics.record_request_duration(elapsed, if response.is_ok() { "success" } else { "error" }, source_kind, streaming);
        if streaming && response.is_ok() {
            metrics.record_time_to_first_byte(elapsed, source_kind);
        }
    }

    response
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, Error> {
    let value = headers.get(header::AUTHORIZATION).ok_or(Error::MissingAuth)?;
    let text = value.to_str().map_err(|_| Error::MissingAuth)?;
    text.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty()).ok_or(Error::MissingAuth)
}

fn user_agent(headers: &HeaderMap) -> String {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("").to_string()
}

/// Best-effort caller IP used as half of the conversation-dedup fingerprint (§4.3). Prefers
/// a proxy-forwarded address since the process typically sits behind a load balancer; falls
/// back to an empty string (degrading to a coarser, UA-only fingerprint) when neither header
/// is present, rather than depending on the raw TCP peer address plumbing.
fn client_fingerprint(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .unwrap_or("")
        .to_string()
}

/// Handles `OPTIONS *` with a permissive, empty 200 (§6) — CORS headers themselves are
/// applied by the router's `CorsLayer`, not here.
pub async fn options_preflight() -> StatusCode {
    StatusCode::OK
}

#[allow(unused_imports)]
use RawQuery as _unused_ignore_unused_extractor_import;
