//! Playback controller with state machine.
//!
//! IDLE → REQUESTING → PLAYING → IDLE
//!
//! `play()` walks the answer's segments in order, synthesizing one at a time
//! and scheduling each result gaplessly. Calling `play()` while a session is
//! live acts as `stop()`. Every exit path ends in IDLE with no active buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::scheduler::{decode, AudioError, AudioOutput, AudioScheduler};
use super::segmenter::SegmentCursor;
use super::synthesis::SpeechSynthesizer;
use crate::config::SpeechConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Requesting,
    Playing,
    Stopped,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Requesting => write!(f, "REQUESTING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// How a `play()` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Every segment was processed and all audio played out.
    Completed,
    /// The session was stopped before it finished.
    Cancelled,
    /// A session was already live, so this call stopped it.
    Toggled,
}

/// Opens the audio output on first use.
pub type OutputFactory = Arc<dyn Fn() -> Result<Arc<dyn AudioOutput>, AudioError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub voice: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<&SpeechConfig> for PlaybackSettings {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

#[derive(Clone)]
struct Session {
    id: u64,
    cancel: CancellationToken,
    scheduler: Arc<AudioScheduler>,
}

impl Session {
    fn halt(&self) {
        self.cancel.cancel();
        self.scheduler.stop();
    }
}

/// Drives playback for one message.
pub struct PlaybackController {
    settings: PlaybackSettings,
    synth: Arc<dyn SpeechSynthesizer>,
    open_output: OutputFactory,
    output: Mutex<Option<Arc<dyn AudioOutput>>>,
    state: watch::Sender<PlaybackState>,
    current: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

impl PlaybackController {
    pub fn new(settings: PlaybackSettings, synth: Arc<dyn SpeechSynthesizer>, open_output: OutputFactory) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            settings,
            synth,
            open_output,
            output: Mutex::new(None),
            state,
            current: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// A session is requesting or playing audio.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), PlaybackState::Requesting | PlaybackState::Playing)
    }

    /// Play a finished answer, or stop if already playing.
    pub async fn play(&self, text: &str) -> Result<PlayOutcome, AudioError> {
        let (tx, rx) = watch::channel(text.to_string());
        drop(tx);
        self.play_stream(rx).await
    }

    /// Play an answer that may still be growing. The answer is complete once
    /// the sender side of `text` is dropped.
    pub async fn play_stream(&self, mut text: watch::Receiver<String>) -> Result<PlayOutcome, AudioError> {
        if self.is_active() {
            info!("Play requested while active, stopping");
            self.stop();
            return Ok(PlayOutcome::Toggled);
        }

        let output = self.output()?;
        let session = self.begin(output);
        let result = self.run_session(&session, &mut text).await;
        self.end(&session, &result);
        result
    }

    /// Stop any live session. Safe to call at any time.
    pub fn stop(&self) {
        if let Some(session) = self.lock_current().take() {
            session.halt();
        }
        self.transition(PlaybackState::Stopped);
        self.transition(PlaybackState::Idle);
    }

    fn output(&self) -> Result<Arc<dyn AudioOutput>, AudioError> {
        let mut slot = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(output) = slot.as_ref() {
            return Ok(output.clone());
        }
        let output = (self.open_output)()?;
        *slot = Some(output.clone());
        Ok(output)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Session>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, output: Arc<dyn AudioOutput>) -> Session {
        let session = Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
            scheduler: Arc::new(AudioScheduler::new(output)),
        };
        if let Some(previous) = self.lock_current().replace(session.clone()) {
            debug!("Cancelling previous session #{}", previous.id);
            previous.halt();
        }
        self.transition(PlaybackState::Requesting);
        session
    }

    async fn run_session(
        &self,
        session: &Session,
        text: &mut watch::Receiver<String>,
    ) -> Result<PlayOutcome, AudioError> {
        let mut cursor = SegmentCursor::default();
        let mut index = 0usize;
        let mut scheduled = 0usize;

        loop {
            let current = text.borrow_and_update().clone();
            let complete = text.has_changed().is_err();
            let batch = if complete {
                cursor.finish(&current)
            } else {
                cursor.advance(&current)
            };

            for segment in batch {
                index += 1;
                if session.cancel.is_cancelled() {
                    info!("Cancelled before segment {index}");
                    return Ok(PlayOutcome::Cancelled);
                }

                let Some(pcm) = self.synth.synthesize(&segment, &self.settings.voice).await else {
                    debug!("Segment {index}: no audio, skipping");
                    continue;
                };

                if session.cancel.is_cancelled() {
                    info!("Cancelled after synthesizing segment {index}");
                    return Ok(PlayOutcome::Cancelled);
                }

                let buffer = decode(&pcm, self.settings.sample_rate, self.settings.channels);
                if buffer.frames() == 0 {
                    debug!("Segment {index}: empty audio, skipping");
                    continue;
                }

                match session.scheduler.schedule(buffer) {
                    Ok(_) => {}
                    Err(AudioError::Stopped) => return Ok(PlayOutcome::Cancelled),
                    Err(e) => return Err(e),
                }
                scheduled += 1;
                if scheduled == 1 {
                    self.transition(PlaybackState::Playing);
                }
            }

            if complete {
                break;
            }

            tokio::select! {
                _ = text.changed() => {}
                _ = session.cancel.cancelled() => return Ok(PlayOutcome::Cancelled),
            }
        }

        debug!("Session #{}: {index} segment(s), {scheduled} scheduled", session.id);
        session.scheduler.seal();

        tokio::select! {
            _ = session.scheduler.finished() => Ok(PlayOutcome::Completed),
            _ = session.cancel.cancelled() => Ok(PlayOutcome::Cancelled),
        }
    }

    fn end(&self, session: &Session, result: &Result<PlayOutcome, AudioError>) {
        let still_current = {
            let mut current = self.lock_current();
            let is_current = current.as_ref().is_some_and(|s| s.id == session.id);
            if is_current {
                *current = None;
            }
            is_current
        };

        session.scheduler.stop();

        // A newer session or an explicit stop() already owns the state.
        if !still_current {
            return;
        }
        if !matches!(result, Ok(PlayOutcome::Completed)) {
            self.transition(PlaybackState::Stopped);
        }
        self.transition(PlaybackState::Idle);
    }

    fn transition(&self, next: PlaybackState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Playback: {previous} → {next}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::testing::{pcm_tenth_second, FakeOutput, FakeSynthesizer};
    use std::time::Duration;

    const ANSWER: &str = "Salah requires wudu. Wudu breaks with sleep. Renew it before prayer.";

    fn settings() -> PlaybackSettings {
        PlaybackSettings {
            voice: "Kore".into(),
            sample_rate: 24000,
            channels: 1,
        }
    }

    fn controller(synth: Arc<FakeSynthesizer>, output: Arc<FakeOutput>) -> Arc<PlaybackController> {
        let factory: OutputFactory = Arc::new(move || Ok(output.clone() as Arc<dyn AudioOutput>));
        Arc::new(PlaybackController::new(settings(), synth, factory))
    }

    async fn wait_for_state(controller: &PlaybackController, wanted: PlaybackState) {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn plays_every_segment_in_order_then_idles() {
        let synth = FakeSynthesizer::new(vec![Some(pcm_tenth_second()); 3]);
        let output = FakeOutput::instant(0.0);
        let controller = controller(synth.clone(), output.clone());

        let outcome = controller.play(ANSWER).await.unwrap();

        assert_eq!(outcome, PlayOutcome::Completed);
        assert_eq!(controller.state(), PlaybackState::Idle);
        assert_eq!(
            synth.calls(),
            vec!["Salah requires wudu.", "Wudu breaks with sleep.", "Renew it before prayer."]
        );
        let starts = output.started_at();
        assert_eq!(starts.len(), 3);
        assert!((starts[1] - 0.1).abs() < 1e-9);
        assert!((starts[2] - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_synthesis_skips_segment() {
        let synth = FakeSynthesizer::new(vec![Some(pcm_tenth_second()), None, Some(pcm_tenth_second())]);
        let output = FakeOutput::instant(0.0);
        let controller = controller(synth.clone(), output.clone());

        let outcome = controller.play(ANSWER).await.unwrap();

        assert_eq!(outcome, PlayOutcome::Completed);
        assert_eq!(synth.calls().len(), 3);
        assert_eq!(output.started_count(), 2);
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn all_segments_failing_still_completes() {
        let synth = FakeSynthesizer::new(vec![None, None, None]);
        let output = FakeOutput::instant(0.0);
        let controller = controller(synth, output.clone());

        assert_eq!(controller.play(ANSWER).await.unwrap(), PlayOutcome::Completed);
        assert_eq!(output.started_count(), 0);
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn stop_with_nothing_active_stays_idle() {
        let controller = controller(FakeSynthesizer::new(vec![]), FakeOutput::new(0.0));
        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn play_while_requesting_stops_before_next_synthesis() {
        let (synth, gate) = FakeSynthesizer::gated(vec![Some(pcm_tenth_second()); 3]);
        let output = FakeOutput::new(0.0);
        let controller = controller(synth.clone(), output.clone());

        let running = tokio::spawn({
            let controller = controller.clone();
            async move { controller.play(ANSWER).await }
        });
        wait_for_state(&controller, PlaybackState::Requesting).await;

        assert_eq!(controller.play(ANSWER).await.unwrap(), PlayOutcome::Toggled);
        assert_eq!(controller.state(), PlaybackState::Idle);

        gate.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, PlayOutcome::Cancelled);
        assert_eq!(synth.calls().len(), 1);
        assert_eq!(output.started_count(), 0);
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn stop_while_playing_halts_buffers() {
        let synth = FakeSynthesizer::new(vec![Some(pcm_tenth_second()); 3]);
        let output = FakeOutput::new(0.0);
        let controller = controller(synth, output.clone());

        let running = tokio::spawn({
            let controller = controller.clone();
            async move { controller.play(ANSWER).await }
        });
        wait_for_state(&controller, PlaybackState::Playing).await;

        controller.stop();
        let outcome = running.await.unwrap().unwrap();

        assert_eq!(outcome, PlayOutcome::Cancelled);
        assert_eq!(controller.state(), PlaybackState::Idle);
        assert!(output.stopped_count() >= 1);
        assert_eq!(output.stopped_count(), output.started_count());
    }

    #[tokio::test]
    async fn growing_answer_plays_segments_as_they_complete() {
        let synth = FakeSynthesizer::new(vec![Some(pcm_tenth_second()); 3]);
        let output = FakeOutput::instant(0.0);
        let controller = controller(synth.clone(), output.clone());

        let (tx, rx) = watch::channel(String::from("Salah requires wudu. Wudu"));
        let running = tokio::spawn({
            let controller = controller.clone();
            async move { controller.play_stream(rx).await }
        });

        wait_for_state(&controller, PlaybackState::Playing).await;
        assert_eq!(synth.calls(), vec!["Salah requires wudu."]);

        tx.send_replace("Salah requires wudu. Wudu breaks with sleep. Renew".into());
        tx.send_replace("Salah requires wudu. Wudu breaks with sleep. Renew it before prayer".into());
        drop(tx);

        assert_eq!(running.await.unwrap().unwrap(), PlayOutcome::Completed);
        assert_eq!(
            synth.calls(),
            vec!["Salah requires wudu.", "Wudu breaks with sleep.", "Renew it before prayer"]
        );
        assert_eq!(controller.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn output_open_failure_leaves_idle() {
        let factory: OutputFactory = Arc::new(|| Err(AudioError::Device("no device".into())));
        let controller = PlaybackController::new(settings(), FakeSynthesizer::new(vec![]), factory);

        assert!(matches!(controller.play(ANSWER).await, Err(AudioError::Device(_))));
        assert_eq!(controller.state(), PlaybackState::Idle);
    }
}
