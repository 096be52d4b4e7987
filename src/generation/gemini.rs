//! Gemini streaming backend.
//!
//! Calls `models/{model}:streamGenerateContent?alt=sse` with Google Search
//! grounding enabled and turns each SSE `data:` line into a [`StreamChunk`].
//! The body is read on a spawned task that stops when the receiver is dropped.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChunkReceiver, GenerationBackend, GenerationError, GenerationRequest};
use crate::message::{Role, Source, StreamChunk};

const CHANNEL_CAPACITY: usize = 32;

pub struct GeminiBackend {
    host: String,
    api_key: String,
    client: Client,
}

impl GeminiBackend {
    pub fn new(host: &str, api_key: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn stream_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:streamGenerateContent?alt=sse", self.host)
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError::NotConfigured("missing API key".into()));
        }

        debug!(
            "Opening answer stream: model={} history={} image={}",
            request.model,
            request.history.len(),
            request.turn.image.is_some()
        );

        let response = self
            .client
            .post(self.stream_url(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .header("Accept", "text/event-stream")
            .json(&request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(response, tx));
        Ok(rx)
    }
}

/// Build the JSON body for a streaming generation call.
pub fn request_body(request: &GenerationRequest) -> Value {
    let mut instruction = request.system_instruction.clone();
    if !request.allowed_domains.is_empty() {
        instruction.push_str("\n\nOnly search and cite these domains: ");
        instruction.push_str(&request.allowed_domains.join(", "));
        instruction.push('.');
    }

    let mut contents: Vec<Value> = request
        .history
        .iter()
        .map(|turn| {
            json!({
                "role": wire_role(turn.role),
                "parts": [{ "text": turn.text }],
            })
        })
        .collect();

    let mut parts = vec![json!({ "text": request.turn.text })];
    if let Some(image) = &request.turn.image {
        parts.push(json!({
            "inlineData": { "mimeType": image.mime_type, "data": image.data }
        }));
    }
    contents.push(json!({ "role": "user", "parts": parts }));

    json!({
        "systemInstruction": { "parts": [{ "text": instruction }] },
        "contents": contents,
        "tools": [{ "googleSearch": {} }],
    })
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

// --- SSE payloads ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
struct GroundingChunk {
    web: Option<WebChunk>,
}

#[derive(Deserialize)]
struct WebChunk {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

/// Parse one SSE line. Non-data lines and chunks with no text or sources
/// yield `Ok(None)`.
pub fn parse_sse_line(line: &str) -> Result<Option<StreamChunk>, GenerationError> {
    let line = line.trim_end();
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }

    let response: StreamResponse = serde_json::from_str(payload)
        .map_err(|e| GenerationError::InvalidResponse(format!("bad stream payload: {e}")))?;

    if let Some(err) = response.error {
        return Err(GenerationError::Status {
            status: err.code.unwrap_or(500),
            body: format!(
                "{} {}",
                err.status.unwrap_or_default(),
                err.message.unwrap_or_default()
            )
            .trim()
            .to_string(),
        });
    }

    let mut text = String::new();
    let mut sources = Vec::new();
    for candidate in response.candidates {
        if let Some(content) = candidate.content {
            for part in content.parts.into_iter().filter(|p| !p.thought) {
                if let Some(t) = part.text {
                    text.push_str(&t);
                }
            }
        }
        if let Some(meta) = candidate.grounding_metadata {
            for web in meta.grounding_chunks.into_iter().filter_map(|c| c.web) {
                if let Some(uri) = web.uri.filter(|u| !u.is_empty()) {
                    let title = web.title.unwrap_or_else(|| uri.clone());
                    sources.push(Source::new(title, uri));
                }
            }
        }
    }

    let chunk = if text.is_empty() {
        StreamChunk::default()
    } else {
        StreamChunk::text(text)
    }
    .with_sources(sources);
    Ok((!chunk.is_empty()).then_some(chunk))
}

/// Read the SSE body line by line and forward parsed chunks.
async fn pump_sse(mut response: reqwest::Response, tx: mpsc::Sender<Result<StreamChunk, GenerationError>>) {
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward_line(&tx, &String::from_utf8_lossy(&line)).await {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Answer stream read error: {e}");
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }

    if !buffer.is_empty() {
        forward_line(&tx, &String::from_utf8_lossy(&buffer)).await;
    }
    debug!("Answer stream finished");
}

/// Returns false once the stream should stop (receiver gone or error sent).
async fn forward_line(tx: &mpsc::Sender<Result<StreamChunk, GenerationError>>, line: &str) -> bool {
    match parse_sse_line(line) {
        Ok(Some(chunk)) => tx.send(Ok(chunk)).await.is_ok(),
        Ok(None) => true,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}
