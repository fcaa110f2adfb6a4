//! speech-loop: keyword-gated speech recognition and interruptible speech
//! playback, run as two cooperating worker threads behind a small
//! synchronous control API.

mod error;
pub use error::{Result, SpeechError};

mod types;
pub use types::{
    CancellationReason, DeviceInfo, DeviceKind, QueueItem, Recognition, RecognitionState,
    RequestId, SpeakRequest,
};

mod traits;
pub use traits::{
    AudioBackend, AudioSink, CaptureStream, KeywordSpotter, Listener, Recognizer,
    SpeechCallback, SpeechEngine, Synthesizer,
};

mod signals;
pub use signals::{ControlSignals, Flag};

mod queue;
pub use queue::PlaybackQueue;

mod config;
pub use config::{load_config_file, load_subscription_key, EngineSettings, SpeechConfig};

pub mod devices;

mod tts;
pub use tts::{SynthesisNotifier, TtsManager};

mod stt;
pub use stt::{CaptureSource, KeywordSink, SttManager};

mod orchestrator;
pub use orchestrator::{SpeechHandle, SpeechLoop};

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "audio")]
pub mod mic;
