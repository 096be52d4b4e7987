//! Gapless audio scheduling.
//!
//! Synthesized PCM is decoded into a [`PlaybackBuffer`] and started on an
//! [`AudioOutput`] at `max(next_free_time, now)`, so consecutive buffers play
//! back-to-back regardless of how long each synthesis call took. Active
//! buffers are tracked so `stop()` can silence all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::mixer::Mixer;
use rodio::{OutputStreamBuilder, Sink};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("failed to open audio output: {0}")]
    Device(String),

    #[error("audio output rejected buffer: {0}")]
    Output(String),

    #[error("playback session was stopped")]
    Stopped,
}

/// Decoded, de-interleaved audio in the range [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    #[cfg(test)]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames() * self.channels.len());
        for frame in 0..self.frames() {
            for channel in &self.channels {
                out.push(channel[frame]);
            }
        }
        out
    }
}

/// Interpret `raw` as little-endian signed 16-bit PCM with `channel_count`
/// interleaved channels. A trailing partial frame is ignored.
pub fn decode(raw: &[u8], sample_rate: u32, channel_count: u16) -> PlaybackBuffer {
    let channel_count = usize::from(channel_count.max(1));
    let frames = raw.len() / 2 / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];

    for (i, pair) in raw.chunks_exact(2).take(frames * channel_count).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count].push(f32::from(sample) / 32768.0);
    }

    PlaybackBuffer::new(sample_rate, channels)
}

/// A buffer that has been handed to the output.
pub trait Voice: Send + Sync {
    /// Halt immediately. Stopping a finished voice is a no-op.
    fn stop(&self);
    fn is_finished(&self) -> bool;
}

/// An audio output device with its own clock, in seconds.
pub trait AudioOutput: Send + Sync {
    fn current_time(&self) -> f64;
    /// Start `buffer` at `start_time` on this output's clock.
    fn start(&self, buffer: PlaybackBuffer, start_time: f64) -> Result<Box<dyn Voice>, AudioError>;
}

/// Start and end of a scheduled buffer on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub start: f64,
    pub end: f64,
}

struct SchedulerState {
    next_free_time: f64,
    next_id: u64,
    active: HashMap<u64, Box<dyn Voice>>,
    sealed: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    finished: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules the buffers of one playback session.
pub struct AudioScheduler {
    output: Arc<dyn AudioOutput>,
    shared: Arc<Shared>,
}

impl AudioScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            output,
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    next_free_time: 0.0,
                    next_id: 0,
                    active: HashMap::new(),
                    sealed: false,
                    stopped: false,
                }),
                finished,
            }),
        }
    }

    /// Queue `buffer` right after the previous one, never in the past.
    pub fn schedule(&self, buffer: PlaybackBuffer) -> Result<Slot, AudioError> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(AudioError::Stopped);
        }

        let now = self.output.current_time();
        let start = state.next_free_time.max(now);
        let end = start + buffer.duration();
        let voice = self.output.start(buffer, start)?;

        state.next_free_time = end;
        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(id, voice);
        drop(state);

        debug!("Scheduled buffer #{id}: start={start:.3}s end={end:.3}s (now={now:.3}s)");
        tokio::spawn(watch_voice(self.shared.clone(), id));

        Ok(Slot { start, end })
    }

    /// No more buffers will be scheduled; signal finished once the active set drains.
    pub fn seal(&self) {
        let mut state = self.shared.lock();
        state.sealed = true;
        if state.active.is_empty() {
            self.shared.finished.send_replace(true);
        }
    }

    /// Halt every active buffer and refuse further scheduling.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.stopped = true;
        let halted = state.active.len();
        for (_, voice) in state.active.drain() {
            voice.stop();
        }
        if halted > 0 {
            info!("Stopped {halted} active buffer(s)");
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// Resolves once the session is sealed and every buffer has played out.
    pub async fn finished(&self) {
        let mut rx = self.shared.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Deregister voice `id` when it finishes on its own.
async fn watch_voice(shared: Arc<Shared>, id: u64) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let mut state = shared.lock();
        let done = match state.active.get(&id) {
            Some(voice) => voice.is_finished(),
            None => return,
        };
        if !done {
            continue;
        }

        state.active.remove(&id);
        if state.sealed && state.active.is_empty() {
            shared.finished.send_replace(true);
        }
        return;
    }
}

// --- rodio output ---

/// Shorter gaps than this are float noise between the scheduler's clock and
/// the queued run, not real silence.
const MIN_GAP_SECS: f64 = 0.002;

/// End of the audio queued on the current sink, on the output clock.
#[derive(Debug, Default)]
struct SinkTimeline {
    run_end: Option<f64>,
}

impl SinkTimeline {
    /// Frames of silence to queue before a buffer of `duration` seconds
    /// meant to start at `start_time`. A drained sink starts a new run at `now`.
    fn place(&mut self, now: f64, start_time: f64, duration: f64, drained: bool, sample_rate: u32) -> usize {
        let base = match self.run_end {
            Some(end) if !drained => end,
            _ => now,
        };
        let gap = start_time - base;
        let lead_frames = if gap > MIN_GAP_SECS {
            (gap * f64::from(sample_rate)).round() as usize
        } else {
            0
        };
        self.run_end = Some(base + lead_frames as f64 / f64::from(sample_rate) + duration);
        lead_frames
    }

    fn reset(&mut self) {
        self.run_end = None;
    }
}

/// One rodio sink. Everything appended to it plays back to back at sample
/// accuracy.
struct SinkRun {
    sink: Sink,
    appended: AtomicUsize,
    stopped: AtomicBool,
}

impl SinkRun {
    /// Sources that have finished playing.
    fn consumed(&self) -> usize {
        self.appended.load(Ordering::SeqCst).saturating_sub(self.sink.len())
    }
}

#[derive(Default)]
struct OutputState {
    run: Option<Arc<SinkRun>>,
    timeline: SinkTimeline,
}

/// The default output device, driven through a rodio mixer.
///
/// Buffers are queued on a single sink, so consecutive buffers join without
/// depending on callback timing. Silence is queued only when a buffer is
/// scheduled past the end of what is already queued. Stopping any voice
/// halts the whole sink; the next buffer starts a fresh one.
///
/// The rodio stream lives on its own thread and closes when this handle
/// is dropped.
pub struct RodioOutput {
    mixer: Mixer,
    epoch: Instant,
    state: Arc<Mutex<OutputState>>,
    _keep_alive: std::sync::mpsc::Sender<()>,
}

impl RodioOutput {
    pub fn open() -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (keep_tx, keep_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStreamBuilder::open_default_stream() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(stream.mixer().clone()));
                    // Blocks until the handle is dropped.
                    let _ = keep_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        let mixer = ready_rx
            .recv()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .map_err(AudioError::Device)?;

        info!("Audio output opened");
        Ok(Self {
            mixer,
            epoch: Instant::now(),
            state: Arc::new(Mutex::new(OutputState::default())),
            _keep_alive: keep_tx,
        })
    }
}

fn lock_output(state: &Mutex<OutputState>) -> MutexGuard<'_, OutputState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AudioOutput for RodioOutput {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start(&self, buffer: PlaybackBuffer, start_time: f64) -> Result<Box<dyn Voice>, AudioError> {
        let channels = buffer.channel_count();
        let sample_rate = buffer.sample_rate();
        if channels == 0 || sample_rate == 0 {
            return Err(AudioError::Output("empty buffer format".into()));
        }

        let mut state = lock_output(&self.state);
        let run = match &state.run {
            Some(run) => run.clone(),
            None => {
                let run = Arc::new(SinkRun {
                    sink: Sink::connect_new(&self.mixer),
                    appended: AtomicUsize::new(0),
                    stopped: AtomicBool::new(false),
                });
                state.run = Some(run.clone());
                state.timeline.reset();
                run
            }
        };

        let drained = run.sink.empty();
        let lead_frames = state
            .timeline
            .place(self.current_time(), start_time, buffer.duration(), drained, sample_rate);
        if lead_frames > 0 {
            debug!("Queueing {lead_frames} frame(s) of silence");
            let silence = vec![0.0; lead_frames * usize::from(channels)];
            run.sink.append(SamplesBuffer::new(channels, sample_rate, silence));
            run.appended.fetch_add(1, Ordering::SeqCst);
        }

        run.sink
            .append(SamplesBuffer::new(channels, sample_rate, buffer.interleaved()));
        // Counted after the append so a voice never looks finished early.
        let index = run.appended.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(RodioVoice {
            state: self.state.clone(),
            run,
            index,
        }))
    }
}

struct RodioVoice {
    state: Arc<Mutex<OutputState>>,
    run: Arc<SinkRun>,
    index: usize,
}

impl Voice for RodioVoice {
    fn stop(&self) {
        if self.run.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run.sink.stop();
        let mut state = lock_output(&self.state);
        if state.run.as_ref().is_some_and(|r| Arc::ptr_eq(r, &self.run)) {
            state.run = None;
            state.timeline.reset();
        }
    }

    fn is_finished(&self) -> bool {
        self.run.stopped.load(Ordering::SeqCst) || self.run.consumed() > self.index
    }
}
