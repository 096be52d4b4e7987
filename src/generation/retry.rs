//! Error classification and bounded retry for streaming generation calls.
//!
//! Errors are classified by scanning their text for rate-limit and
//! credential markers. Only [`ErrorClassification::Quota`] is retried, with a
//! delay that grows linearly with the attempt number. Retry covers opening
//! the stream and its first chunk; once a chunk has reached the consumer a
//! failure is propagated as-is.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChunkReceiver, GenerationError};
use crate::message::StreamChunk;

const QUOTA_MARKERS: &[&str] = &[
    "429",
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "resource_exhausted",
    "too many requests",
];

const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "unauthenticated",
    "permission_denied",
    "api_key_invalid",
    "api key not valid",
    "invalid api key",
    "missing api key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Quota,
    AuthInvalid,
    Generic,
}

/// Classify an error from its textual form. Quota markers win over auth markers.
pub fn classify(text: &str) -> ErrorClassification {
    let lower = text.to_lowercase();
    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClassification::Quota
    } else if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClassification::AuthInvalid
    } else {
        ErrorClassification::Generic
    }
}

/// A generation failure after classification.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("quota exhausted after {attempts} attempt(s): {message}")]
    Quota { attempts: u32, message: String },

    #[error("invalid credentials: {0}")]
    AuthInvalid(String),

    #[error("generation failed: {0}")]
    Generic(String),
}

impl RequestError {
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::Quota { .. } => ErrorClassification::Quota,
            Self::AuthInvalid(_) => ErrorClassification::AuthInvalid,
            Self::Generic(_) => ErrorClassification::Generic,
        }
    }

    fn classified(err: &GenerationError, attempts: u32) -> Self {
        let message = err.to_string();
        match classify(&message) {
            ErrorClassification::Quota => Self::Quota { attempts, message },
            ErrorClassification::AuthInvalid => Self::AuthInvalid(message),
            ErrorClassification::Generic => Self::Generic(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one, for quota errors only.
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_unit * n`.
    pub backoff_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_unit.saturating_mul(retry)
    }
}

/// Chunks of an opened stream with failures already classified.
pub struct ChunkStream {
    pending: Option<StreamChunk>,
    rx: Option<ChunkReceiver>,
    attempts: u32,
}

impl ChunkStream {
    pub(crate) fn new(pending: Option<StreamChunk>, rx: Option<ChunkReceiver>, attempts: u32) -> Self {
        Self {
            pending,
            rx,
            attempts,
        }
    }

    pub fn empty() -> Self {
        Self::new(None, None, 0)
    }

    /// Number of remote calls it took to open this stream.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next chunk, a classified failure, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<StreamChunk, RequestError>> {
        if let Some(chunk) = self.pending.take() {
            return Some(Ok(chunk));
        }
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(err)) => {
                self.rx = None;
                Some(Err(RequestError::classified(&err, self.attempts)))
            }
            None => {
                self.rx = None;
                None
            }
        }
    }
}

/// Opens generation streams, retrying quota failures with linear backoff.
pub struct RetryingExecutor {
    config: RetryConfig,
}

impl RetryingExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Call `factory` until a stream opens or a non-retryable error occurs.
    ///
    /// Each attempt is a fresh remote call. If `cancel` fires before an
    /// attempt, while one is in flight, or during backoff, an empty stream is
    /// returned once the in-flight call has come back.
    pub async fn execute<F, Fut>(
        &self,
        mut factory: F,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ChunkReceiver, GenerationError>>,
    {
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("Generation cancelled before attempt {}", retries + 1);
                return Ok(ChunkStream::empty());
            }

            let attempts = retries + 1;
            // An in-flight call is never interrupted; cancellation only
            // prevents work after it returns.
            let opened = open_first(&mut factory).await;
            if cancel.is_cancelled() {
                info!("Generation cancelled while the stream was opening");
                return Ok(ChunkStream::empty());
            }
            let err = match opened {
                Ok((first, rx)) => {
                    if retries > 0 {
                        debug!(attempts, "stream opened after retry");
                    }
                    return Ok(ChunkStream::new(first, rx, attempts));
                }
                Err(err) => err,
            };

            let error = RequestError::classified(&err, attempts);
            if error.classification() != ErrorClassification::Quota {
                warn!(attempts, error = %error, "generation failed, not retrying");
                return Err(error);
            }
            if retries >= self.config.max_retries {
                warn!(attempts, error = %error, "quota retries exhausted");
                return Err(error);
            }

            retries += 1;
            let delay = self.config.delay_for(retries);
            warn!(
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "rate limited, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!("Generation cancelled during backoff");
                    return Ok(ChunkStream::empty());
                }
            }
        }
    }
}

/// Open a stream and wait for its first item. A stream that closes with no
/// items opens successfully as an empty one.
async fn open_first<F, Fut>(
    factory: &mut F,
) -> Result<(Option<StreamChunk>, Option<ChunkReceiver>), GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ChunkReceiver, GenerationError>>,
{
    let mut rx = factory().await?;
    match rx.recv().await {
        Some(Ok(first)) => Ok((Some(first), Some(rx))),
        Some(Err(err)) => Err(err),
        None => Ok((None, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn receiver(items: Vec<Result<StreamChunk, GenerationError>>) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        rx
    }

    fn status(code: u16, body: &str) -> GenerationError {
        GenerationError::Status {
            status: code,
            body: body.into(),
        }
    }

    fn fast(max_retries: u32) -> RetryingExecutor {
        RetryingExecutor::new(RetryConfig {
            max_retries,
            backoff_unit: Duration::from_millis(1),
        })
    }

    #[test]
    fn classify_markers() {
        assert_eq!(classify("HTTP 429: RESOURCE_EXHAUSTED"), ErrorClassification::Quota);
        assert_eq!(classify("You exceeded your current quota"), ErrorClassification::Quota);
        assert_eq!(classify("Rate limit reached"), ErrorClassification::Quota);
        assert_eq!(classify("HTTP 401: Unauthorized"), ErrorClassification::AuthInvalid);
        assert_eq!(
            classify("HTTP 400: API key not valid. Please pass a valid API key."),
            ErrorClassification::AuthInvalid
        );
        assert_eq!(classify("not configured: missing API key"), ErrorClassification::AuthInvalid);
        assert_eq!(classify("HTTP 500: internal"), ErrorClassification::Generic);
        assert_eq!(classify("connection reset"), ErrorClassification::Generic);
    }

    #[test]
    fn backoff_is_linear() {
        let config = RetryConfig {
            max_retries: 3,
            backoff_unit: Duration::from_millis(250),
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(250));
        assert_eq!(config.delay_for(2), Duration::from_millis(500));
        assert_eq!(config.delay_for(3), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn quota_retries_configured_times_then_surfaces_quota() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast(2)
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(status(429, "RESOURCE_EXHAUSTED"))
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RequestError::Quota { attempts, .. }) => assert_eq!(attempts, 3),
            Err(other) => panic!("expected quota, got {other}"),
            Ok(_) => panic!("expected quota error"),
        }
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast(2)
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(status(401, "Unauthorized"))
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RequestError::AuthInvalid(_))));
    }

    #[tokio::test]
    async fn generic_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast(2)
            .execute(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(status(500, "boom"))
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RequestError::Generic(_))));
    }

    #[tokio::test]
    async fn quota_in_first_chunk_is_retried_with_fresh_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut stream = fast(1)
            .execute(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Ok(receiver(vec![Err(status(429, "slow down"))]))
                        } else {
                            Ok(receiver(vec![Ok(StreamChunk::text("a")), Ok(StreamChunk::text("b"))]))
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(stream.attempts(), 2);
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamChunk::text("a"));
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamChunk::text("b"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_after_first_chunk_is_classified_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut stream = fast(2)
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok(receiver(vec![
                            Ok(StreamChunk::text("partial")),
                            Err(status(429, "quota")),
                        ]))
                    }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), StreamChunk::text("partial"));
        assert!(matches!(
            stream.next().await,
            Some(Err(RequestError::Quota { attempts: 1, .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_remote_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = fast(2)
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(receiver(vec![Ok(StreamChunk::text("x"))])) }
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_during_open_waits_for_the_call_then_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let returned = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (counter, done, trigger) = (calls.clone(), returned.clone(), cancel.clone());

        let mut stream = fast(2)
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (done, trigger) = (done.clone(), trigger.clone());
                    async move {
                        trigger.cancel();
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        done.store(true, Ordering::SeqCst);
                        Ok(receiver(vec![Ok(StreamChunk::text("x"))]))
                    }
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(returned.load(Ordering::SeqCst));
        assert!(stream.next().await.is_none());
    }
}
