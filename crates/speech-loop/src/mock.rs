//! In-process engine and audio backend for tests and demos.
//!
//! The engine is scripted from the outside: synthesis outcomes, keyword
//! detections and recognition results are driven by calls on [`MockEngine`]
//! while the worker loops run against it as if it were a real service.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{
    AudioBackend, AudioSink, CancellationReason, CaptureStream, DeviceInfo, DeviceKind,
    EngineSettings, KeywordSink, KeywordSpotter, Listener, Recognition, Recognizer, RequestId,
    Result, SpeechCallback, SpeechEngine, SpeechError, SpeechHandle, SynthesisNotifier,
    Synthesizer,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block on `condvar` until `done` holds or `timeout` elapses.
fn wait_for<'a, T>(
    mutex: &'a Mutex<T>,
    condvar: &Condvar,
    timeout: Duration,
    mut done: impl FnMut(&T) -> bool,
) -> (MutexGuard<'a, T>, bool) {
    let deadline = Instant::now().checked_add(timeout);
    let mut guard = lock(mutex);
    loop {
        if done(&guard) {
            return (guard, true);
        }
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        };
        if remaining.is_zero() {
            return (guard, false);
        }
        guard = condvar
            .wait_timeout(guard, remaining)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

/// How the mock synthesizer settles a `speak` call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SynthesisMode {
    /// Completes before `speak` returns.
    #[default]
    Immediate,
    /// Stays pending until completed or cancelled from the outside.
    Hold,
    /// `speak` itself fails.
    Fail,
    /// Completes after the given time per character, like real playback.
    Paced(Duration),
}

/// Engine settings as the factory saw them, minus the credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeenSettings {
    pub region: String,
    pub voice_name: String,
    pub keyword_model: PathBuf,
    pub output_device: String,
    pub silence_timeout: Duration,
}

struct PendingSynthesis {
    text: String,
    notifier: SynthesisNotifier,
}

#[derive(Default)]
struct Synthesis {
    mode: SynthesisMode,
    spoken: Vec<String>,
    pending: Option<PendingSynthesis>,
    stop_calls: usize,
}

#[derive(Default)]
struct Keyword {
    active: Option<KeywordSink>,
    /// Every sink handed to `start`, in order.
    sessions: Vec<KeywordSink>,
    model: Option<PathBuf>,
}

#[derive(Default)]
struct Script {
    results: VecDeque<core::result::Result<Recognition, String>>,
    aborted: bool,
    started: usize,
}

#[derive(Default)]
struct MockState {
    synthesis: Mutex<Synthesis>,
    synthesis_changed: Condvar,
    keyword: Mutex<Keyword>,
    keyword_changed: Condvar,
    script: Mutex<Script>,
    script_changed: Condvar,
    frames: AtomicUsize,
    factory_calls: AtomicUsize,
    seen: Mutex<Option<SeenSettings>>,
}

/// Scriptable speech engine. Clones share state.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_synthesis_mode(&self, mode: SynthesisMode) {
        lock(&self.state.synthesis).mode = mode;
    }

    pub fn mock_synthesizer(&self) -> Arc<dyn Synthesizer> {
        Arc::new(MockDriver {
            state: Arc::clone(&self.state),
        })
    }

    pub fn mock_listener(&self) -> Listener {
        let driver = Arc::new(MockDriver {
            state: Arc::clone(&self.state),
        });
        Listener {
            spotter: driver.clone(),
            recognizer: driver.clone(),
            audio: driver,
        }
    }

    /// Texts passed to `speak`, in call order.
    pub fn spoken(&self) -> Vec<String> {
        lock(&self.state.synthesis).spoken.clone()
    }

    /// Wait for a held synthesis and return its text.
    pub fn wait_for_pending_synthesis(&self, timeout: Duration) -> Option<String> {
        let (synthesis, _) = wait_for(
            &self.state.synthesis,
            &self.state.synthesis_changed,
            timeout,
            |s| s.pending.is_some(),
        );
        synthesis.pending.as_ref().map(|p| p.text.clone())
    }

    /// Wait until the held synthesis is the one for `text`.
    pub fn wait_for_synthesis_of(&self, text: &str, timeout: Duration) -> bool {
        wait_for(
            &self.state.synthesis,
            &self.state.synthesis_changed,
            timeout,
            |s| s.pending.as_ref().is_some_and(|p| p.text == text),
        )
        .1
    }

    /// Finish the held synthesis successfully.
    pub fn complete_pending(&self) -> bool {
        let Some(pending) = lock(&self.state.synthesis).pending.take() else {
            return false;
        };
        pending.notifier.completed();
        true
    }

    /// End the held synthesis as if the engine had cancelled it.
    pub fn cancel_pending(&self) -> bool {
        let Some(pending) = lock(&self.state.synthesis).pending.take() else {
            return false;
        };
        pending.notifier.canceled();
        true
    }

    pub fn stop_speaking_calls(&self) -> usize {
        lock(&self.state.synthesis).stop_calls
    }

    pub fn keyword_listens(&self) -> usize {
        lock(&self.state.keyword).sessions.len()
    }

    pub fn wait_for_keyword_listens(&self, count: usize, timeout: Duration) -> bool {
        wait_for(
            &self.state.keyword,
            &self.state.keyword_changed,
            timeout,
            |k| k.sessions.len() >= count && k.active.is_some(),
        )
        .1
    }

    /// Model path of the most recent keyword listen.
    pub fn keyword_model(&self) -> Option<PathBuf> {
        lock(&self.state.keyword).model.clone()
    }

    fn active_sink(&self) -> Option<KeywordSink> {
        lock(&self.state.keyword).active.clone()
    }

    /// Report a detection on the active listen.
    pub fn trigger_keyword(&self, keyword: &str) -> bool {
        let Some(sink) = self.active_sink() else {
            return false;
        };
        sink.recognized(keyword);
        true
    }

    /// End the active listen without a detection.
    pub fn cancel_keyword(&self, reason: CancellationReason) -> bool {
        let Some(sink) = self.active_sink() else {
            return false;
        };
        sink.canceled(reason);
        true
    }

    /// Deliver a late detection and cancellation to listen number `listen`
    /// (1-based), whether or not it is still running.
    pub fn fire_on_finished_listen(&self, listen: usize) -> bool {
        let sink = listen
            .checked_sub(1)
            .and_then(|i| lock(&self.state.keyword).sessions.get(i).cloned());
        let Some(sink) = sink else {
            return false;
        };
        sink.recognized("stale");
        sink.canceled(CancellationReason::Error);
        true
    }

    pub fn push_recognition(&self, result: Recognition) {
        lock(&self.state.script).results.push_back(Ok(result));
        self.state.script_changed.notify_all();
    }

    pub fn push_recognition_error(&self, message: &str) {
        lock(&self.state.script)
            .results
            .push_back(Err(message.to_string()));
        self.state.script_changed.notify_all();
    }

    pub fn recognitions_started(&self) -> usize {
        lock(&self.state.script).started
    }

    pub fn wait_for_recognitions(&self, count: usize, timeout: Duration) -> bool {
        wait_for(
            &self.state.script,
            &self.state.script_changed,
            timeout,
            |s| s.started >= count,
        )
        .1
    }

    pub fn frames_written(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    /// How many times the loop asked this engine for a collaborator.
    pub fn engine_calls(&self) -> usize {
        self.state.factory_calls.load(Ordering::SeqCst)
    }

    pub fn seen_settings(&self) -> Option<SeenSettings> {
        lock(&self.state.seen).clone()
    }

    fn record(&self, settings: &EngineSettings) {
        self.state.factory_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.seen) = Some(SeenSettings {
            region: settings.region.clone(),
            voice_name: settings.voice_name.clone(),
            keyword_model: settings.keyword_model.clone(),
            output_device: settings.output_device.clone(),
            silence_timeout: settings.silence_timeout,
        });
    }
}

impl SpeechEngine for MockEngine {
    fn synthesizer(&self, settings: &EngineSettings) -> Result<Arc<dyn Synthesizer>> {
        self.record(settings);
        Ok(self.mock_synthesizer())
    }

    fn listener(&self, settings: &EngineSettings) -> Result<Listener> {
        self.record(settings);
        Ok(self.mock_listener())
    }
}

struct MockDriver {
    state: Arc<MockState>,
}

impl Synthesizer for MockDriver {
    fn speak(&self, text: &str, notifier: SynthesisNotifier) -> Result<()> {
        let mut synthesis = lock(&self.state.synthesis);
        match synthesis.mode {
            SynthesisMode::Fail => {
                return Err(SpeechError::Engine("synthesis rejected".to_string()));
            }
            SynthesisMode::Immediate => {
                synthesis.spoken.push(text.to_string());
                drop(synthesis);
                notifier.completed();
                return Ok(());
            }
            SynthesisMode::Hold => {}
            SynthesisMode::Paced(per_char) => {
                let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
                let duration = per_char.saturating_mul(chars);
                let finisher = notifier.clone();
                thread::spawn(move || {
                    thread::sleep(duration);
                    finisher.completed();
                });
            }
        }
        synthesis.spoken.push(text.to_string());
        synthesis.pending = Some(PendingSynthesis {
            text: text.to_string(),
            notifier,
        });
        self.state.synthesis_changed.notify_all();
        Ok(())
    }

    fn stop_speaking(&self) -> Result<()> {
        let pending = {
            let mut synthesis = lock(&self.state.synthesis);
            synthesis.stop_calls += 1;
            synthesis.pending.take()
        };
        self.state.synthesis_changed.notify_all();
        if let Some(pending) = pending {
            pending.notifier.canceled();
        }
        Ok(())
    }
}

impl KeywordSpotter for MockDriver {
    fn start(&self, model: &Path, sink: KeywordSink) -> Result<()> {
        let mut keyword = lock(&self.state.keyword);
        keyword.active = Some(sink.clone());
        keyword.sessions.push(sink);
        keyword.model = Some(model.to_path_buf());
        self.state.keyword_changed.notify_all();
        Ok(())
    }

    /// Like a real engine, stopping a listen reports it as ended.
    fn stop(&self) -> Result<()> {
        let sink = lock(&self.state.keyword).active.take();
        self.state.keyword_changed.notify_all();
        if let Some(sink) = sink {
            sink.canceled(CancellationReason::EndOfStream);
        }
        Ok(())
    }
}

impl Recognizer for MockDriver {
    fn recognize_once(&self) -> Result<Recognition> {
        let mut script = lock(&self.state.script);
        script.started += 1;
        self.state.script_changed.notify_all();
        loop {
            if script.aborted {
                script.aborted = false;
                return Ok(Recognition::Canceled(CancellationReason::CancelledByUser));
            }
            if let Some(next) = script.results.pop_front() {
                return next.map_err(SpeechError::Engine);
            }
            script = self
                .state
                .script_changed
                .wait(script)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn abort(&self) -> Result<()> {
        lock(&self.state.script).aborted = true;
        self.state.script_changed.notify_all();
        Ok(())
    }
}

impl AudioSink for MockDriver {
    fn write(&self, _pcm_s16le: &[i16]) {
        self.state.frames.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audio backend with a fixed device list and a silent microphone.
#[derive(Clone, Debug)]
pub struct MockAudio {
    devices: Vec<DeviceInfo>,
    frame_interval: Duration,
}

impl MockAudio {
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo {
                index: 0,
                name: "Mock Microphone".to_string(),
                max_input_channels: 1,
                max_output_channels: 0,
            },
            DeviceInfo {
                index: 1,
                name: "Mock Speaker: USB Audio (hw:1,0)".to_string(),
                max_input_channels: 0,
                max_output_channels: 2,
            },
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            frame_interval: Duration::from_millis(10),
        }
    }

    pub fn devices_of(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .filter(|d| d.supports(kind))
            .cloned()
            .collect()
    }
}

impl Default for MockAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockAudio {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn open_input(
        &self,
        device: &DeviceInfo,
        sample_rate_hz: u32,
    ) -> Result<Box<dyn CaptureStream>> {
        if !device.supports(DeviceKind::Input) {
            return Err(SpeechError::Audio(format!(
                "'{}' has no input channels",
                device.name
            )));
        }
        // 10 ms of mono samples per frame.
        let frame_len = usize::try_from(sample_rate_hz / 100).unwrap_or(160).max(1);
        Ok(Box::new(SilentCapture {
            frame_len,
            interval: self.frame_interval,
        }))
    }
}

struct SilentCapture {
    frame_len: usize,
    interval: Duration,
}

impl CaptureStream for SilentCapture {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        if timeout < self.interval {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(self.interval);
        Ok(Some(vec![0; self.frame_len]))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpeechEvent {
    Keyword(String),
    Text(String),
    SynthesisDone { request_id: RequestId, success: bool },
}

/// Callback that records everything it is told.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SpeechEvent>>,
    changed: Condvar,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SpeechEvent> {
        lock(&self.events).clone()
    }

    pub fn synthesis_outcomes(&self) -> Vec<(RequestId, bool)> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                SpeechEvent::SynthesisDone {
                    request_id,
                    success,
                } => Some((*request_id, *success)),
                _ => None,
            })
            .collect()
    }

    pub fn wait_until(&self, done: impl Fn(&[SpeechEvent]) -> bool, timeout: Duration) -> bool {
        wait_for(&self.events, &self.changed, timeout, |events| done(events)).1
    }

    fn record(&self, event: SpeechEvent) {
        lock(&self.events).push(event);
        self.changed.notify_all();
    }
}

impl SpeechCallback for EventLog {
    fn on_keyword_recognized(&self, keyword: &str, _speech: &SpeechHandle) {
        self.record(SpeechEvent::Keyword(keyword.to_string()));
    }

    fn on_text_recognized(&self, text: &str, _speech: &SpeechHandle) {
        self.record(SpeechEvent::Text(text.to_string()));
    }

    fn on_synthesis_done(&self, request_id: RequestId, success: bool) {
        self.record(SpeechEvent::SynthesisDone {
            request_id,
            success,
        });
    }
}

/// Join `handle`, giving up after `timeout`.
pub fn join_within(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(handle.join().is_ok());
    });
    rx.recv_timeout(timeout).unwrap_or(false)
}
