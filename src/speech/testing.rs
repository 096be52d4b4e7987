//! Test doubles for the speech pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::scheduler::{AudioError, AudioOutput, PlaybackBuffer, Voice};
use super::synthesis::SpeechSynthesizer;

struct FakeVoiceState {
    finished: AtomicBool,
    stopped: AtomicBool,
}

struct FakeVoice(Arc<FakeVoiceState>);

impl Voice for FakeVoice {
    fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::SeqCst)
    }
}

/// Output with a hand-driven clock. Buffers never finish on their own.
pub struct FakeOutput {
    clock: Mutex<f64>,
    started: Mutex<Vec<(f64, Arc<FakeVoiceState>)>>,
    auto_finish: bool,
}

impl FakeOutput {
    pub fn new(now: f64) -> Arc<Self> {
        Arc::new(Self {
            clock: Mutex::new(now),
            started: Mutex::new(Vec::new()),
            auto_finish: false,
        })
    }

    /// Buffers report finished as soon as they start.
    pub fn instant(now: f64) -> Arc<Self> {
        Arc::new(Self {
            clock: Mutex::new(now),
            started: Mutex::new(Vec::new()),
            auto_finish: true,
        })
    }

    pub fn set_time(&self, now: f64) {
        *self.clock.lock().unwrap() = now;
    }

    pub fn started_at(&self) -> Vec<f64> {
        self.started.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn finish_all(&self) {
        for (_, voice) in self.started.lock().unwrap().iter() {
            voice.finished.store(true, Ordering::SeqCst);
        }
    }

    pub fn stopped_count(&self) -> usize {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| v.stopped.load(Ordering::SeqCst))
            .count()
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn start(&self, _buffer: PlaybackBuffer, start_time: f64) -> Result<Box<dyn Voice>, AudioError> {
        let state = Arc::new(FakeVoiceState {
            finished: AtomicBool::new(self.auto_finish),
            stopped: AtomicBool::new(false),
        });
        self.started.lock().unwrap().push((start_time, state.clone()));
        Ok(Box::new(FakeVoice(state)))
    }
}

/// Returns scripted results in order; `None` entries simulate failures.
/// A gated synthesizer parks each call until its `Notify` is signalled.
pub struct FakeSynthesizer {
    results: Mutex<VecDeque<Option<Vec<u8>>>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeSynthesizer {
    pub fn new(results: Vec<Option<Vec<u8>>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(results: Vec<Option<Vec<u8>>>) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let synth = Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
            gate: Some(gate.clone()),
        });
        (synth, gate)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Option<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.results.lock().unwrap().pop_front().flatten()
    }
}

/// 0.1s of silence at 24 kHz mono.
pub fn pcm_tenth_second() -> Vec<u8> {
    vec![0u8; 4800]
}
