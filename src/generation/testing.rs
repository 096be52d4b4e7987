//! Scripted generation backend for pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChunkReceiver, GenerationBackend, GenerationError, GenerationRequest};
use crate::message::StreamChunk;

/// What one `open_stream` call produces: an open failure, or the items the
/// stream will yield before closing.
pub type Script = Result<Vec<Result<StreamChunk, GenerationError>>, GenerationError>;

pub struct FakeBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerationRequest>>,
    stall_next: AtomicBool,
}

impl FakeBackend {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            stall_next: AtomicBool::new(false),
        })
    }

    /// The first call never answers; later calls follow `scripts`.
    pub fn stalled(scripts: Vec<Script>) -> Arc<Self> {
        let backend = Self::new(scripts);
        backend.stall_next.store(true, Ordering::SeqCst);
        backend
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ChunkReceiver, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.stall_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::InvalidResponse("no script".into())))?;
        let (tx, rx) = mpsc::channel(script.len().max(1));
        for item in script {
            tx.try_send(item).unwrap();
        }
        Ok(rx)
    }
}
