//! Speech output: reads finished or growing answers aloud.
//!
//! Components:
//! - `segmenter`: sentence-bounded utterances, incrementally over a growing answer
//! - `synthesis`: serialized remote speech synthesis, one utterance per call
//! - `scheduler`: PCM decoding and gapless buffer scheduling on the audio output
//! - `controller`: per-message play/stop state machine
//! - `narrator`: per-message controllers with a single-voice policy

pub mod controller;
pub mod narrator;
pub mod scheduler;
pub mod segmenter;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use controller::OutputFactory;
use scheduler::{AudioOutput, RodioOutput};

/// Factory for the default device output, opened lazily per controller.
pub fn default_output() -> OutputFactory {
    Arc::new(|| RodioOutput::open().map(|output| Arc::new(output) as Arc<dyn AudioOutput>))
}
