use core::fmt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque token identifying one speak request for its whole lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Text waiting to be synthesized.
///
/// `epoch` is stamped by the playback queue when the request is inserted and
/// is used to tell superseded requests apart from the ones queued after an
/// immediate enqueue.
#[derive(Clone, Debug)]
pub struct SpeakRequest {
    pub id: RequestId,
    pub text: String,
    pub epoch: u64,
    pub enqueued_at: OffsetDateTime,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            text: text.into(),
            epoch: 0,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum QueueItem {
    Speak(SpeakRequest),
    /// Makes the playback loop exit once dequeued. Never synthesized.
    Terminate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecognitionState {
    WaitingForKeyword,
    Recognizing,
}

/// Why the engine ended a keyword listen or recognition without a result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CancellationReason {
    Error,
    EndOfStream,
    /// We asked for it. Never treated as a keyword trigger.
    CancelledByUser,
}

/// Outcome of one one-shot recognition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Recognition {
    Speech(String),
    NoMatch,
    Canceled(CancellationReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeviceKind {
    Input,
    Output,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// One entry of an audio backend's device listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
}

impl DeviceInfo {
    pub fn supports(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Input => self.max_input_channels > 0,
            DeviceKind::Output => self.max_output_channels > 0,
        }
    }
}
