//! Streaming answer generation.
//!
//! Components:
//! - `gemini`: remote backend that streams chunks from the Gemini API
//! - `retry`: error classification and bounded retry around opening a stream
//! - `aggregator`: folds the chunk stream into a growing [`Message`](crate::message::Message)

pub mod aggregator;
pub mod gemini;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{ImageAttachment, Role, StreamChunk};

/// Chunks of one streamed answer. An `Err` item ends the stream.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, GenerationError>>;

/// Errors raised by a generation backend, before classification.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct UserTurn {
    pub text: String,
    pub image: Option<ImageAttachment>,
}

/// Everything one generation call needs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system_instruction: String,
    /// Search grounding is restricted to these domains.
    pub allowed_domains: Vec<String>,
    pub history: Vec<HistoryTurn>,
    pub turn: UserTurn,
}

/// A remote capability that streams an answer for a request.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Issue a fresh remote call. Fails only if the call could not be opened;
    /// later failures arrive as `Err` items on the receiver.
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, GenerationError>;
}
