use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    DeviceInfo, EngineSettings, KeywordSink, Recognition, RequestId, Result, SpeechHandle,
    SynthesisNotifier,
};

/// Receives events from the worker loops.
///
/// Methods run on worker threads and must return promptly; a blocked
/// callback stalls the loop that invoked it.
pub trait SpeechCallback: Send + Sync {
    fn on_keyword_recognized(&self, _keyword: &str, _speech: &SpeechHandle) {}

    fn on_text_recognized(&self, _text: &str, _speech: &SpeechHandle) {}

    /// Called exactly once for every request the playback loop dequeued.
    fn on_synthesis_done(&self, _request_id: RequestId, _success: bool) {}
}

/// Builds the engine-side collaborators used by the two loops.
pub trait SpeechEngine: Send + Sync {
    fn synthesizer(&self, settings: &EngineSettings) -> Result<Arc<dyn Synthesizer>>;

    fn listener(&self, settings: &EngineSettings) -> Result<Listener>;
}

/// Keyword spotting and recognition share one pushed audio input.
pub struct Listener {
    pub spotter: Arc<dyn KeywordSpotter>,
    pub recognizer: Arc<dyn Recognizer>,
    pub audio: Arc<dyn AudioSink>,
}

pub trait Synthesizer: Send + Sync {
    /// Start speaking without blocking. The outcome is reported through
    /// `notifier`; only the first report counts.
    fn speak(&self, text: &str, notifier: SynthesisNotifier) -> Result<()>;

    /// Cancel whatever is being spoken.
    fn stop_speaking(&self) -> Result<()>;
}

pub trait KeywordSpotter: Send + Sync {
    /// Start a one-shot keyword listen. Detections and cancellations are
    /// delivered to `sink`, possibly from engine threads.
    fn start(&self, model: &Path, sink: KeywordSink) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

pub trait Recognizer: Send + Sync {
    /// Recognize one utterance. Blocks until the engine settles.
    fn recognize_once(&self) -> Result<Recognition>;

    /// Make an in-flight `recognize_once` return.
    fn abort(&self) -> Result<()>;
}

pub trait AudioSink: Send + Sync {
    fn write(&self, pcm_s16le: &[i16]);
}

/// Device enumeration and capture.
pub trait AudioBackend: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a mono capture stream. Called on the thread that will read it.
    fn open_input(
        &self,
        device: &DeviceInfo,
        sample_rate_hz: u32,
    ) -> Result<Box<dyn CaptureStream>>;
}

pub trait CaptureStream {
    /// Next frame of mono samples, or `None` if nothing arrived in `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>>;
}
