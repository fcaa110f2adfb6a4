//! Listen/recognize loop.
//!
//! Alternates between a one-shot keyword listen and a one-shot recognition.
//! `KeywordDone` is consumed exactly once per satisfied wait: every keyword
//! listen gets its own [`KeywordSink`] session, the session is disarmed once
//! the listen is stopped, and only then is the flag cleared. Events arriving
//! late from a finished listen can therefore never satisfy the next wait.
//!
//! A capture feeder thread pushes microphone frames into the engine for as
//! long as the loop runs. On `SttStop` it also releases the loop: it forces
//! `KeywordDone` and aborts any in-flight recognition until the loop exits.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    AudioBackend, AudioSink, CancellationReason, ControlSignals, DeviceInfo, Flag, Listener,
    Recognition, RecognitionState, Recognizer, Result, SpeechCallback, SpeechError, SpeechHandle,
};

const FRAME_POLL: Duration = Duration::from_millis(50);
const ABORT_RETRY: Duration = Duration::from_millis(100);
const KEYWORD_RETRY: Duration = Duration::from_millis(500);

struct KeywordSession {
    armed: Mutex<bool>,
    callback: Arc<dyn SpeechCallback>,
    speech: SpeechHandle,
}

/// Receives the outcome of one keyword listen.
#[derive(Clone)]
pub struct KeywordSink {
    session: Arc<KeywordSession>,
}

impl KeywordSink {
    fn new(callback: Arc<dyn SpeechCallback>, speech: SpeechHandle) -> Self {
        Self {
            session: Arc::new(KeywordSession {
                armed: Mutex::new(true),
                callback,
                speech,
            }),
        }
    }

    fn armed(&self) -> MutexGuard<'_, bool> {
        self.session
            .armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The keyword was detected.
    pub fn recognized(&self, keyword: &str) {
        let armed = self.armed();
        if !*armed {
            debug!("keyword detection from a finished listen dropped");
            return;
        }
        info!(keyword, "keyword recognized");
        self.session
            .callback
            .on_keyword_recognized(keyword, &self.session.speech);
        self.session.speech.signals().set(Flag::KeywordDone);
    }

    /// The engine ended the listen without a detection.
    pub fn canceled(&self, reason: CancellationReason) {
        let armed = self.armed();
        if !*armed {
            debug!(?reason, "keyword cancellation from a finished listen dropped");
            return;
        }
        if reason == CancellationReason::CancelledByUser {
            debug!("keyword listen stopped on request");
            return;
        }
        warn!(?reason, "keyword listen canceled by engine");
        self.session.speech.signals().set(Flag::KeywordDone);
    }

    pub fn is_armed(&self) -> bool {
        *self.armed()
    }

    fn disarm(&self) {
        *self.armed() = false;
    }
}

/// Where microphone frames come from.
#[derive(Clone)]
pub struct CaptureSource {
    pub backend: Arc<dyn AudioBackend>,
    pub device: DeviceInfo,
    pub sample_rate_hz: u32,
}

pub struct SttManager {
    speech: SpeechHandle,
    callback: Arc<dyn SpeechCallback>,
    listener: Listener,
    capture: CaptureSource,
    keyword_model: PathBuf,
    state: RecognitionState,
}

impl SttManager {
    pub fn new(
        speech: SpeechHandle,
        callback: Arc<dyn SpeechCallback>,
        listener: Listener,
        capture: CaptureSource,
        keyword_model: PathBuf,
    ) -> Self {
        Self {
            speech,
            callback,
            listener,
            capture,
            keyword_model,
            state: RecognitionState::WaitingForKeyword,
        }
    }

    /// Start the capture feeder and the listen loop. The feeder is what
    /// releases the loop on stop, so failing to start it is an error.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let (exited_tx, exited_rx) = mpsc::channel::<()>();
        let feeder = self.spawn_feeder(exited_rx)?;
        let signals = Arc::clone(self.speech.signals());
        thread::Builder::new()
            .name("speech-stt".to_string())
            .spawn(move || self.run(feeder, exited_tx))
            .map_err(|e| {
                // The dropped sender lets the feeder finish.
                signals.set(Flag::SttStop);
                SpeechError::Worker(format!("spawning listen loop: {e}"))
            })
    }

    fn spawn_feeder(&self, listen_exited: Receiver<()>) -> Result<JoinHandle<()>> {
        let signals = Arc::clone(self.speech.signals());
        let capture = self.capture.clone();
        let audio = Arc::clone(&self.listener.audio);
        let recognizer = Arc::clone(&self.listener.recognizer);
        thread::Builder::new()
            .name("speech-stt-capture".to_string())
            .spawn(move || {
                feed_audio(
                    &signals,
                    &capture,
                    audio.as_ref(),
                    recognizer.as_ref(),
                    &listen_exited,
                )
            })
            .map_err(|e| SpeechError::Worker(format!("spawning capture feeder: {e}")))
    }

    /// Run until `SttStop` is observed.
    fn run(mut self, feeder: JoinHandle<()>, exited_tx: mpsc::Sender<()>) {
        info!("listen loop started");
        self.listen_loop();

        drop(exited_tx);
        if feeder.join().is_err() {
            warn!("capture feeder panicked");
        }
        info!("listen loop exited");
    }

    fn enter(&mut self, state: RecognitionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "recognition state");
            self.state = state;
        }
    }

    fn listen_loop(&mut self) {
        let signals = Arc::clone(self.speech.signals());
        while !signals.is_set(Flag::SttStop) {
            self.enter(RecognitionState::WaitingForKeyword);
            if signals.is_set(Flag::KeywordDone) {
                debug!("keyword wait already satisfied, skipping listen");
            } else if !self.await_keyword() {
                continue;
            }
            signals.clear(Flag::KeywordDone);
            if signals.is_set(Flag::SttStop) {
                break;
            }

            self.enter(RecognitionState::Recognizing);
            self.recognize();
        }
    }

    /// Returns `false` when the listen could not be started and nothing
    /// satisfied the wait in the meantime.
    fn await_keyword(&self) -> bool {
        let signals = self.speech.signals();
        let sink = KeywordSink::new(Arc::clone(&self.callback), self.speech.clone());
        debug!(model = %self.keyword_model.display(), "waiting for keyword");
        let satisfied = match self.listener.spotter.start(&self.keyword_model, sink.clone()) {
            Ok(()) => {
                signals.wait_any(&[Flag::KeywordDone, Flag::SttStop]);
                if let Err(e) = self.listener.spotter.stop() {
                    warn!(error = %e, "failed to stop keyword listen");
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "keyword listen failed to start");
                signals
                    .wait_any_timeout(&[Flag::KeywordDone, Flag::SttStop], KEYWORD_RETRY)
                    .is_some()
            }
        };
        sink.disarm();
        satisfied
    }

    fn recognize(&self) {
        debug!("recognizing utterance");
        match self.listener.recognizer.recognize_once() {
            Ok(Recognition::Speech(text)) if !text.trim().is_empty() => {
                info!(chars = text.chars().count(), "utterance recognized");
                self.callback.on_text_recognized(&text, &self.speech);
            }
            Ok(Recognition::Speech(_)) | Ok(Recognition::NoMatch) => {
                debug!("no speech recognized");
            }
            Ok(Recognition::Canceled(reason)) => {
                debug!(?reason, "recognition canceled");
            }
            Err(e) => {
                warn!(error = %e, "recognition failed");
            }
        }
    }
}

fn feed_audio(
    signals: &ControlSignals,
    capture: &CaptureSource,
    audio: &dyn AudioSink,
    recognizer: &dyn Recognizer,
    listen_exited: &Receiver<()>,
) {
    match capture
        .backend
        .open_input(&capture.device, capture.sample_rate_hz)
    {
        Ok(mut stream) => {
            info!(
                device = %capture.device.name,
                sample_rate_hz = capture.sample_rate_hz,
                "audio capture started"
            );
            while !signals.is_set(Flag::SttStop) {
                match stream.next_frame(FRAME_POLL) {
                    Ok(Some(frame)) => audio.write(&frame),
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "audio capture failed");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            error!(device = %capture.device.name, error = %e, "could not open capture device");
        }
    }

    signals.wait_until_set(Flag::SttStop);
    debug!("stop observed, releasing listen loop");
    signals.set(Flag::KeywordDone);
    loop {
        if let Err(e) = recognizer.abort() {
            debug!(error = %e, "recognition abort failed");
        }
        match listen_exited.recv_timeout(ABORT_RETRY) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("audio capture stopped");
}
