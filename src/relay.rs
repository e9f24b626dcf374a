//! Relay & Rewriter (§4.6): the shared upstream HTTP client, the non-streaming and SSE
//! streaming response paths, and the model-name/brand rewriting applied to both.
//!
//! Concurrency-slot release and the deferred usage commit are guaranteed on every exit path
//! (upstream error, non-2xx status, EOF, caller disconnect) per §9's scoped-resource
//! guidance — see [`crate::concurrency::ConcurrencySlot`] and [`crate::usage::UsageCommit`].

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::{ClientIdentityConfig, UpstreamClientConfig};
use crate::errors::{Error, Result};
use crate::selector::ActiveSource;
use crate::store::Store;
use crate::usage::UsageCommit;

const CHANNEL_CAPACITY: usize = 16;

/// Owns the shared reqwest client and the per-request relay logic.
#[derive(Clone)]
pub struct Relay {
    client: reqwest::Client,
    identity: ClientIdentityConfig,
    heartbeat_interval: Duration,
    request_deadline: Duration,
    brand_rewrite: Option<(String, String)>,
}

impl Relay {
    pub fn new(
        upstream: &UpstreamClientConfig,
        identity: ClientIdentityConfig,
        heartbeat_interval: Duration,
        brand_rewrite: Option<(String, String)>,
    ) -> reqwest::Result<Self> {
        // reqwest has no knob for a hard per-host concurrent-connection ceiling distinct from
        // idle pool sizing; `max_connections_per_host` is kept in config as an operator-facing
        // target and documented here rather than silently dropped.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(upstream.pool_idle_timeout)
            .pool_max_idle_per_host(upstream.pool_max_idle_per_host)
            .timeout(upstream.socket_timeout)
            .build()?;

        Ok(Self {
            client,
            identity,
            heartbeat_interval,
            request_deadline: upstream.request_deadline,
            brand_rewrite,
        })
    }

    async fn fetch<S: Store>(&self, active: &ActiveSource<S>, url: &str, body: &Value) -> Result<reqwest::Response> {
        let req = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", active.api_key))
            .header("x-api-key", &active.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CONNECTION, "keep-alive")
            .header(header::USER_AGENT, &self.identity.user_agent)
            .header("anthropic-client-version", &self.identity.anthropic_client_version)
            .json(body);

        match tokio::time::timeout(self.request_deadline, req.send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(Error::UpstreamFailure(e.to_string())),
            Err(_) => Err(Error::UpstreamTimeout),
        }
    }

    /// Drives the full relay for one request: upstream fetch, then non-streaming or streaming
    /// handling, with the concurrency slot and usage commit threaded through to every exit.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch<S: Store>(
        &self,
        store: &S,
        active: ActiveSource<S>,
        url: String,
        body: Value,
        model_actual: String,
        model_display: String,
        correlation_id: Uuid,
        usage_commit: UsageCommit,
    ) -> Result<Response<Body>> {
        let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let upstream = match self.fetch(&active, &url, &body).await {
            Ok(resp) => resp,
            Err(err) => {
                active.slot.release().await;
                return Err(err);
            }
        };

        if !streaming {
            return self.relay_unary(active, upstream, store, &model_actual, &model_display, usage_commit).await;
        }

        let status = upstream.status();
        if !status.is_success() {
            let details = upstream.text().await.unwrap_or_default();
            active.slot.release().await;
            return Err(Error::UpstreamStatus { status, details });
        }

        Ok(self.relay_stream(store.clone(), active, upstream, model_actual, model_display, usage_commit, correlation_id))
    }

    async fn relay_unary<S: Store>(
        &self,
        active: ActiveSource<S>,
        upstream: reqwest::Response,
        store: &S,
        model_actual: &str,
        model_display: &str,
        usage_commit: UsageCommit,
    ) -> Result<Response<Body>> {
        let status = upstream.status();
        let headers = upstream.headers().clone();

        if !status.is_success() {
            let details = upstream.text().await.unwrap_or_default();
            active.slot.release().await;
            return Err(Error::UpstreamStatus { status, details });
        }

        let raw = match upstream.text().await {
            Ok(text) => text,
            Err(err) => {
                active.slot.release().await;
                return Err(Error::UpstreamFailure(err.to_string()));
            }
        };

        let rewritten_body = rewrite_body_text(&raw, model_actual, model_display);

        active.slot.release().await;
        usage_commit.commit(store).await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in headers.iter() {
            if matches!(name, &header::CONTENT_LENGTH | &header::TRANSFER_ENCODING | &header::CONNECTION) {
                continue;
            }
            if let Ok(text) = value.to_str() {
                let rewritten = literal_rewrite(text, model_actual, model_display);
                if let Ok(hv) = HeaderValue::from_str(&rewritten) {
                    builder = builder.header(name, hv);
                }
            }
        }

        builder.body(Body::from(rewritten_body)).map_err(|e| Error::Internal(e.to_string()))
    }

    fn relay_stream<S: Store>(
        &self,
        store: S,
        active: ActiveSource<S>,
        upstream: reqwest::Response,
        model_actual: String,
        model_display: String,
        usage_commit: UsageCommit,
        correlation_id: Uuid,
    ) -> Response<Body> {
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);
        let heartbeat_interval = self.heartbeat_interval;
        let brand_rewrite = self.brand_rewrite.clone();

        tokio::spawn(async move {
            let _ = tx.send(Ok(Bytes::from_static(b":connected\n\n"))).await;

            let mut upstream_chunks = upstream.bytes_stream();
            let mut buffer = String::new();
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await; // the first tick fires immediately; consume it

            let clean_eof = loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if tx.send(Ok(Bytes::from_static(b":heartbeat\n\n"))).await.is_err() {
                            break false;
                        }
                    }
                    chunk = upstream_chunks.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                let transformed = drain_complete_lines(&mut buffer, &model_actual, &model_display, brand_rewrite.as_ref(), correlation_id);
                                if !transformed.is_empty() && tx.send(Ok(Bytes::from(transformed))).await.is_err() {
                                    break false;
                                }
                            }
                            Some(Err(err)) => {
                                tracing::warn!(%correlation_id, error = %err, "upstream stream read failed");
                                break false;
                            }
                            None => break true,
                        }
                    }
                }
            };

            if clean_eof && !buffer.is_empty() {
                let tail = apply_brand_rewrite(&transform_line(&buffer, &model_actual, &model_display, correlation_id), brand_rewrite.as_ref());
                let _ = tx.send(Ok(Bytes::from(tail))).await;
            }

            active.slot.release().await;
            if clean_eof {
                if let Err(err) = usage_commit.commit(&store).await {
                    tracing::warn!(%correlation_id, error = %err, "failed to commit deferred usage increment");
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

fn rewrite_body_text(raw: &str, model_actual: &str, model_display: &str) -> Vec<u8> {
    match serde_json::from_str::<Value>(raw) {
        Ok(mut value) => {
            rewrite_value_strings(&mut value, &|s| literal_rewrite(s, model_actual, model_display));
            serde_json::to_vec(&value).unwrap_or_else(|_| raw.as_bytes().to_vec())
        }
        Err(_) => literal_rewrite(raw, model_actual, model_display).into_bytes(),
    }
}

fn rewrite_value_strings(value: &mut Value, rewrite: &impl Fn(&str) -> String) {
    match value {
        Value::String(s) => *s = rewrite(s),
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_value_strings(v, rewrite)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_value_strings(v, rewrite)),
        _ => {}
    }
}

/// Case-insensitive, metacharacter-escaped literal replacement of `model_actual` with
/// `model_display` (§4.6). A no-op when there's nothing distinct to swap.
fn literal_rewrite(text: &str, model_actual: &str, model_display: &str) -> String {
    if model_actual.is_empty() || model_actual.eq_ignore_ascii_case(model_display) {
        return text.to_string();
    }
    let pattern = format!("(?i){}", regex::escape(model_actual));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, model_display.replace('$', "$$")).into_owned(),
        Err(_) => text.to_string(),
    }
}

fn apply_brand_rewrite(text: &str, brand_rewrite: Option<&(String, String)>) -> String {
    match brand_rewrite {
        Some((from, to)) => text.replace(from.as_str(), to.as_str()),
        None => text.to_string(),
    }
}

/// Transforms one `data: ` (or other) SSE line: JSON-parseable payloads get a deep string
/// rewrite; anything else (including `data: [DONE]`) gets a literal line-level rewrite
/// (§4.6 step 1).
fn transform_line(line: &str, model_actual: &str, model_display: &str, correlation_id: Uuid) -> String {
    match line.strip_prefix("data: ") {
        Some(payload) => match serde_json::from_str::<Value>(payload) {
            Ok(mut event) => {
                harvest_and_log_usage(&event, correlation_id);
                rewrite_value_strings(&mut event, &|s| literal_rewrite(s, model_actual, model_display));
                format!("data: {}", serde_json::to_string(&event).unwrap_or_else(|_| payload.to_string()))
            }
            Err(_) => literal_rewrite(line, model_actual, model_display),
        },
        None => literal_rewrite(line, model_actual, model_display),
    }
}

/// Drains every complete (`\n`-terminated) line out of `buffer`, transforming each, and
/// returns the concatenated result. Leaves a trailing partial line in `buffer` for the next
/// chunk, since a single upstream read can split an SSE line across chunk boundaries.
fn drain_complete_lines(buffer: &mut String, model_actual: &str, model_display: &str, brand_rewrite: Option<&(String, String)>, correlation_id: Uuid) -> String {
    let mut out = String::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let content = line.strip_suffix('\n').unwrap_or(&line);
        let rewritten = transform_line(content, model_actual, model_display, correlation_id);
        out.push_str(&apply_brand_rewrite(&rewritten, brand_rewrite));
        out.push('\n');
    }
    out
}

/// Opportunistically logs token usage surfaced in an SSE event, for observability only —
/// never fed back into the quota ledger (§4.6, §4.3).
fn harvest_and_log_usage(event: &Value, correlation_id: Uuid) {
    if let Some(input) = event.pointer("/message/usage/input_tokens").and_then(Value::as_u64) {
        tracing::debug!(%correlation_id, input_tokens = input, "anthropic message_start usage");
    }
    if let Some(output) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
        tracing::debug!(%correlation_id, output_tokens = output, "anthropic message_delta usage");
    }
    if let Some(usage) = event.get("usage").and_then(Value::as_object) {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
        let completion = usage.get("completion_tokens").and_then(Value::as_u64);
        if prompt.is_some() || completion.is_some() {
            tracing::debug!(%correlation_id, ?prompt, ?completion, "openai usage");
        }
    }
}
