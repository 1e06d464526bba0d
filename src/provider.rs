//! Markdown generation providers.
//!
//! Defines the [`MarkdownProvider`] trait consumed by the importer and two
//! HTTP implementations:
//! - **[`OpenAiProvider`]**: OpenAI-compatible `POST /chat/completions` with
//!   base64 data-URL page images; streaming via server-sent events.
//! - **[`OllamaProvider`]**: a local Ollama instance's `POST /api/chat` with
//!   base64 images; streaming via newline-delimited JSON.
//!
//! # Provider Selection
//!
//! A [`ProviderFactory`] builds one provider per generation preset. The
//! importer asks once per preset and keeps the provider for the whole run.
//!
//! # Retry Strategy
//!
//! Both providers use exponential backoff for transient errors, before any
//! response body has been consumed:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Every network wait also races the cancellation token; a fired token
//! ends the call with [`ProviderError::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{GenerationPreset, ProviderKind};
use crate::convert::png_scaled_to_width;
use crate::error::ProviderError;
use crate::models::ConvertedNote;

/// Receives streamed Markdown fragments in arrival order.
#[async_trait]
pub trait FragmentSink: Send {
    async fn push(&mut self, fragment: &str) -> std::io::Result<()>;
}

/// Collects fragments in memory.
#[async_trait]
impl FragmentSink for String {
    async fn push(&mut self, fragment: &str) -> std::io::Result<()> {
        self.push_str(fragment);
        Ok(())
    }
}

/// A vision model that turns note pages into Markdown.
#[async_trait]
pub trait MarkdownProvider: Send + Sync {
    /// Short label used in logs (e.g. `"openai:gpt-4o-mini"`).
    fn name(&self) -> &str;

    /// Request the full Markdown for `note` in one response.
    ///
    /// Fails with [`ProviderError::EmptyResponse`] or
    /// [`ProviderError::Malformed`] when the response carries no text.
    async fn generate_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    /// Deliver the Markdown incrementally to `sink`.
    ///
    /// Providers without an incremental transport fall back to a single
    /// fragment holding the full text.
    async fn stream_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        sink: &mut dyn FragmentSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let text = self.generate_markdown(note, max_width, cancel).await?;
        sink.push(&text).await?;
        Ok(())
    }
}

/// Builds the provider for a generation preset.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, preset: &GenerationPreset) -> Result<Arc<dyn MarkdownProvider>, ProviderError>;
}

/// Factory for the built-in HTTP providers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, preset: &GenerationPreset) -> Result<Arc<dyn MarkdownProvider>, ProviderError> {
        match preset.provider {
            ProviderKind::Openai => Ok(Arc::new(OpenAiProvider::new(preset)?)),
            ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(preset)?)),
        }
    }
}

// ============ Shared HTTP plumbing ============

struct HttpSettings {
    client: reqwest::Client,
    url: String,
    model: String,
    prompt: String,
    max_retries: u32,
}

impl HttpSettings {
    fn from_preset(preset: &GenerationPreset, default_base: &str, path: &str) -> Result<Self, ProviderError> {
        let model = preset.model.clone().ok_or_else(|| {
            ProviderError::Misconfigured(format!("preset '{}' has no model", preset.id))
        })?;
        let base = preset.endpoint.as_deref().unwrap_or(default_base);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(preset.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", base.trim_end_matches('/'), path),
            model,
            prompt: preset.prompt.clone(),
            max_retries: preset.max_retries,
        })
    }
}

/// Base64-encode each page, downscaled to `max_width`.
fn encode_pages(note: &ConvertedNote, max_width: u32) -> Result<Vec<String>, ProviderError> {
    note.pages
        .iter()
        .map(|page| {
            let png = png_scaled_to_width(&page.png, max_width)
                .map_err(|e| ProviderError::Image(e.to_string()))?;
            Ok(STANDARD.encode(png))
        })
        .collect()
}

async fn send_with_retry<F>(
    build: F,
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ProviderError>
where
    F: Fn() -> reqwest::RequestBuilder + Sync,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            resp = build().send() => resp,
        };

        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    body = response.text() => body.unwrap_or_default(),
                };
                let err = ProviderError::Api {
                    status: status.as_u16(),
                    body,
                };

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }

                // Client error (not 429), no retry
                return Err(err);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or(ProviderError::EmptyResponse))
}

async fn read_json(
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<Value, ProviderError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        json = response.json::<Value>() => Ok(json?),
    }
}

/// One parsed line of a streaming response.
#[derive(Debug, PartialEq, Eq)]
enum StreamEvent {
    Text(String),
    Done,
    Skip,
}

/// Splits a byte stream into complete lines, tolerating UTF-8 sequences
/// that straddle chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Some(line)
    }
}

/// Pump a line-oriented streaming response into `sink`.
async fn pump_stream<P>(
    response: reqwest::Response,
    parse: P,
    sink: &mut dyn FragmentSink,
    cancel: &CancellationToken,
) -> Result<(), ProviderError>
where
    P: Fn(&str) -> Result<StreamEvent, ProviderError> + Sync,
{
    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut emitted = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        for line in lines.push(&chunk) {
            match parse(&line)? {
                StreamEvent::Text(text) if !text.is_empty() => {
                    sink.push(&text).await?;
                    emitted = true;
                }
                StreamEvent::Done => return finish_stream(emitted),
                _ => {}
            }
        }
    }

    if let Some(line) = lines.finish() {
        if let StreamEvent::Text(text) = parse(&line)? {
            if !text.is_empty() {
                sink.push(&text).await?;
                emitted = true;
            }
        }
    }
    finish_stream(emitted)
}

fn finish_stream(emitted: bool) -> Result<(), ProviderError> {
    if emitted {
        Ok(())
    } else {
        Err(ProviderError::EmptyResponse)
    }
}

// ============ OpenAI Provider ============

/// Provider for the OpenAI chat completions API (or a compatible endpoint).
///
/// Requires a credential: the preset's inline `api_key` or the variable
/// named by `api_key_env` (default `OPENAI_API_KEY`).
pub struct OpenAiProvider {
    http: HttpSettings,
    api_key: String,
    label: String,
}

impl OpenAiProvider {
    pub fn new(preset: &GenerationPreset) -> Result<Self, ProviderError> {
        let api_key = preset
            .resolve_api_key()
            .ok_or_else(|| ProviderError::MissingCredential(preset.provider.as_str().to_string()))?;
        let http = HttpSettings::from_preset(preset, "https://api.openai.com/v1", "/chat/completions")?;
        let label = format!("openai:{}", http.model);
        Ok(Self {
            http,
            api_key,
            label,
        })
    }

    fn body(&self, images: &[String], stream: bool) -> Value {
        let mut content = vec![json!({ "type": "text", "text": self.http.prompt })];
        content.extend(images.iter().map(|b64| {
            json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", b64) }
            })
        }));
        json!({
            "model": self.http.model,
            "stream": stream,
            "messages": [{ "role": "user", "content": content }],
        })
    }

    async fn send(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        send_with_retry(
            || {
                self.http
                    .client
                    .post(&self.http.url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(body)
            },
            self.http.max_retries,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl MarkdownProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let images = encode_pages(note, max_width)?;
        let response = self.send(&self.body(&images, false), cancel).await?;
        let json = read_json(response, cancel).await?;
        parse_openai_response(&json)
    }

    async fn stream_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        sink: &mut dyn FragmentSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let images = encode_pages(note, max_width)?;
        let response = self.send(&self.body(&images, true), cancel).await?;
        pump_stream(response, parse_openai_sse_line, sink, cancel).await
    }
}

/// Extract `choices[0].message.content` from a chat completion.
fn parse_openai_response(json: &Value) -> Result<String, ProviderError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?;
    if content.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(content.to_string())
}

/// Parse one server-sent-events line of a streamed chat completion.
fn parse_openai_sse_line(line: &str) -> Result<StreamEvent, ProviderError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let json: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::Malformed(format!("bad stream event: {}", e)))?;
    if let Some(err) = json.get("error") {
        return Err(ProviderError::Malformed(err.to_string()));
    }
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(|s| StreamEvent::Text(s.to_string()))
        .unwrap_or(StreamEvent::Skip))
}

// ============ Ollama Provider ============

/// Provider using a local Ollama instance.
///
/// Calls `POST /api/chat` on the configured endpoint (default:
/// `http://localhost:11434`) with a vision model (e.g. `llama3.2-vision`).
pub struct OllamaProvider {
    http: HttpSettings,
    label: String,
}

impl OllamaProvider {
    pub fn new(preset: &GenerationPreset) -> Result<Self, ProviderError> {
        let http = HttpSettings::from_preset(preset, "http://localhost:11434", "/api/chat")?;
        let label = format!("ollama:{}", http.model);
        Ok(Self { http, label })
    }

    fn body(&self, images: &[String], stream: bool) -> Value {
        json!({
            "model": self.http.model,
            "stream": stream,
            "messages": [{
                "role": "user",
                "content": self.http.prompt,
                "images": images,
            }],
        })
    }

    async fn send(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        send_with_retry(
            || {
                self.http
                    .client
                    .post(&self.http.url)
                    .header("Content-Type", "application/json")
                    .json(body)
            },
            self.http.max_retries,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl MarkdownProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let images = encode_pages(note, max_width)?;
        let response = self.send(&self.body(&images, false), cancel).await?;
        let json = read_json(response, cancel).await?;
        parse_ollama_response(&json)
    }

    async fn stream_markdown(
        &self,
        note: &ConvertedNote,
        max_width: u32,
        sink: &mut dyn FragmentSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let images = encode_pages(note, max_width)?;
        let response = self.send(&self.body(&images, true), cancel).await?;
        pump_stream(response, parse_ollama_stream_line, sink, cancel).await
    }
}

fn parse_ollama_response(json: &Value) -> Result<String, ProviderError> {
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return Err(ProviderError::Malformed(err.to_string()));
    }
    let content = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Malformed("missing message.content".into()))?;
    if content.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(content.to_string())
}

/// Parse one NDJSON line of a streamed Ollama chat response.
fn parse_ollama_stream_line(line: &str) -> Result<StreamEvent, ProviderError> {
    if line.is_empty() {
        return Ok(StreamEvent::Skip);
    }
    let json: Value = serde_json::from_str(line)
        .map_err(|e| ProviderError::Malformed(format!("bad stream line: {}", e)))?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return Err(ProviderError::Malformed(err.to_string()));
    }
    let text = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if !text.is_empty() {
        return Ok(StreamEvent::Text(text.to_string()));
    }
    if json.get("done").and_then(|d| d.as_bool()) == Some(true) {
        return Ok(StreamEvent::Done);
    }
    Ok(StreamEvent::Skip)
}
