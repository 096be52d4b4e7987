//! Remote speech synthesis, one utterance per request.
//!
//! Calls are serialized and preceded by a small fixed delay to stay under
//! the provider's rate limits. Any failure yields `None` so the caller can
//! skip the segment and keep going.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::config::SpeechConfig;

/// Renders one utterance to raw 16-bit little-endian PCM.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// `None` means the segment could not be synthesized and should be skipped.
    async fn synthesize(&self, text: &str, voice: &str) -> Option<Vec<u8>>;
}

pub struct GeminiSpeechClient {
    host: String,
    api_key: String,
    model: String,
    request_delay: Duration,
    client: Client,
    call_lock: AsyncMutex<()>,
}

impl GeminiSpeechClient {
    pub fn new(config: &SpeechConfig, api_key: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            request_delay: config.request_delay(),
            client,
            call_lock: AsyncMutex::new(()),
        })
    }

    async fn request(&self, text: &str, voice: &str) -> Result<Vec<u8>, String> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.host, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
                }
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("failed to parse response: {e}"))?;

        let encoded = data["candidates"][0]["content"]["parts"]
            .as_array()
            .and_then(|parts| {
                parts
                    .iter()
                    .find_map(|p| p["inlineData"]["data"].as_str())
            })
            .ok_or("response has no audio data")?;

        let pcm = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("bad base64 audio: {e}"))?;
        if pcm.is_empty() {
            return Err("empty audio payload".into());
        }
        Ok(pcm)
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiSpeechClient {
    async fn synthesize(&self, text: &str, voice: &str) -> Option<Vec<u8>> {
        let _guard = self.call_lock.lock().await;
        tokio::time::sleep(self.request_delay).await;

        let t_start = Instant::now();
        match self.request(text, voice).await {
            Ok(pcm) => {
                debug!(
                    "Synthesized {} chars → {} bytes ({:.0}ms)",
                    text.chars().count(),
                    pcm.len(),
                    t_start.elapsed().as_secs_f64() * 1000.0
                );
                Some(pcm)
            }
            Err(e) => {
                warn!("Speech synthesis failed, skipping segment: {e}");
                None
            }
        }
    }
}
