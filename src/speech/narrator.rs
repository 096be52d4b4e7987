//! Per-message playback controllers with a single-voice policy.
//!
//! Each message gets its own [`PlaybackController`], created on first use.
//! Starting playback on one message stops whatever another message is
//! playing, so two answers never talk over each other. All controllers
//! share one output device, opened on first playback. Idle controllers of
//! other messages are dropped when a new one is created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::controller::{OutputFactory, PlayOutcome, PlaybackController, PlaybackSettings, PlaybackState};
use super::scheduler::{AudioError, AudioOutput};
use super::synthesis::SpeechSynthesizer;

pub struct Narrator {
    settings: PlaybackSettings,
    synth: Arc<dyn SpeechSynthesizer>,
    open_output: OutputFactory,
    controllers: Mutex<HashMap<Uuid, Arc<PlaybackController>>>,
}

impl Narrator {
    pub fn new(settings: PlaybackSettings, synth: Arc<dyn SpeechSynthesizer>, open_output: OutputFactory) -> Self {
        Self {
            settings,
            synth,
            open_output: shared_output(open_output),
            controllers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<PlaybackController>>> {
        self.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The controller for `message_id`, created if needed.
    pub fn controller(&self, message_id: Uuid) -> Arc<PlaybackController> {
        let mut controllers = self.lock();
        if !controllers.contains_key(&message_id) {
            let before = controllers.len();
            controllers.retain(|_, c| c.is_active() || Arc::strong_count(c) > 1);
            if controllers.len() < before {
                debug!("Dropped {} idle controller(s)", before - controllers.len());
            }
        }
        controllers
            .entry(message_id)
            .or_insert_with(|| {
                Arc::new(PlaybackController::new(
                    self.settings.clone(),
                    self.synth.clone(),
                    self.open_output.clone(),
                ))
            })
            .clone()
    }

    /// Play `text` for `message_id`, or stop it if it is already playing.
    pub async fn toggle(&self, message_id: Uuid, text: &str) -> Result<PlayOutcome, AudioError> {
        let controller = self.controller(message_id);
        if !controller.is_active() {
            self.stop_others(message_id);
        }
        controller.play(text).await
    }

    /// Read an answer aloud while it is still being generated.
    pub async fn play_stream(
        &self,
        message_id: Uuid,
        text: watch::Receiver<String>,
    ) -> Result<PlayOutcome, AudioError> {
        let controller = self.controller(message_id);
        if !controller.is_active() {
            self.stop_others(message_id);
        }
        controller.play_stream(text).await
    }

    pub fn stop(&self, message_id: Uuid) {
        let controller = self.lock().get(&message_id).cloned();
        if let Some(controller) = controller {
            controller.stop();
        }
    }

    pub fn stop_all(&self) {
        for controller in self.snapshot() {
            controller.stop();
        }
    }

    fn stop_others(&self, message_id: Uuid) {
        let others: Vec<(Uuid, Arc<PlaybackController>)> = self
            .lock()
            .iter()
            .filter(|(id, c)| **id != message_id && c.is_active())
            .map(|(id, c)| (*id, c.clone()))
            .collect();
        for (id, controller) in others {
            info!("Stopping playback of {id} for {message_id}");
            controller.stop();
        }
    }

    fn snapshot(&self) -> Vec<Arc<PlaybackController>> {
        self.lock().values().cloned().collect()
    }

    pub fn states(&self) -> Vec<(Uuid, PlaybackState)> {
        self.lock().iter().map(|(id, c)| (*id, c.state())).collect()
    }

    pub fn is_any_active(&self) -> bool {
        self.snapshot().iter().any(|c| c.is_active())
    }
}

/// Wrap `open` so it runs at most once successfully; every caller shares
/// the result. A failed open is retried on the next call.
fn shared_output(open: OutputFactory) -> OutputFactory {
    let cached: Mutex<Option<Arc<dyn AudioOutput>>> = Mutex::new(None);
    Arc::new(move || {
        let mut cached = cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(output) = cached.as_ref() {
            return Ok(output.clone());
        }
        let output = open()?;
        *cached = Some(output.clone());
        Ok(output)
    })
}
