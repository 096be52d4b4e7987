//! Folds a classified chunk stream into a growing assistant [`Message`].
//!
//! Text deltas are appended, sources are merged by URI in first-seen order,
//! and a snapshot is emitted after every chunk that changed something. A
//! stream failure replaces the content with a terminal notice.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{ChunkStream, RequestError};
use crate::message::{Message, StreamChunk};

pub const QUOTA_NOTICE: &str = "The service is receiving too many requests right now and \
retries were exhausted. Please wait a moment and ask again.";

pub const AUTH_NOTICE: &str = "The API key was rejected. Check the configured Gemini API key \
(generation.api_key or GEMINI_API_KEY) and try again.";

pub const GENERIC_NOTICE: &str = "Something went wrong while generating the answer. Please try again.";

/// User-facing notice for a failed turn.
pub fn notice_for(err: &RequestError) -> &'static str {
    match err {
        RequestError::Quota { .. } => QUOTA_NOTICE,
        RequestError::AuthInvalid(_) => AUTH_NOTICE,
        RequestError::Generic(_) => GENERIC_NOTICE,
    }
}

/// How a streaming turn ended.
#[derive(Debug)]
pub enum TurnEnd {
    Completed,
    Cancelled,
    Failed(RequestError),
}

pub struct AnswerAggregator {
    message: Message,
    seen: HashSet<String>,
}

impl AnswerAggregator {
    pub fn new(message: Message) -> Self {
        let seen = message.sources.iter().map(|s| s.uri.clone()).collect();
        Self { message, seen }
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Merge one chunk. Returns whether the message changed.
    pub fn apply(&mut self, chunk: StreamChunk) -> bool {
        let mut changed = false;

        if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
            self.message.content.push_str(&text);
            changed = true;
        }

        for source in chunk.sources {
            if self.seen.insert(source.uri.clone()) {
                self.message.sources.push(source);
                changed = true;
            }
        }

        changed
    }

    /// Replace the content with the notice for `err` and mark the message failed.
    pub fn fail(&mut self, err: &RequestError) {
        self.message.content = notice_for(err).to_string();
        self.message.failed = true;
    }

    /// Consume `stream` until it ends, fails, or `cancel` fires.
    ///
    /// `on_snapshot` sees the message after every meaningful chunk and, on
    /// failure, once more with the error notice.
    pub async fn run<F>(
        mut self,
        stream: &mut ChunkStream,
        cancel: &CancellationToken,
        mut on_snapshot: F,
    ) -> (Message, TurnEnd)
    where
        F: FnMut(&Message),
    {
        let end = loop {
            if cancel.is_cancelled() {
                break TurnEnd::Cancelled;
            }

            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => break TurnEnd::Cancelled,
            };

            match next {
                Some(Ok(chunk)) => {
                    if self.apply(chunk) {
                        on_snapshot(&self.message);
                    }
                }
                Some(Err(err)) => {
                    warn!("Answer stream failed: {err}");
                    self.fail(&err);
                    on_snapshot(&self.message);
                    break TurnEnd::Failed(err);
                }
                None => break TurnEnd::Completed,
            }
        };

        match &end {
            TurnEnd::Completed => info!(
                "Answer complete: {} chars, {} sources",
                self.message.content.len(),
                self.message.sources.len()
            ),
            TurnEnd::Cancelled => info!(
                "Answer cancelled after {} chars",
                self.message.content.len()
            ),
            TurnEnd::Failed(_) => debug!("Answer replaced with error notice"),
        }

        (self.message, end)
    }
}
