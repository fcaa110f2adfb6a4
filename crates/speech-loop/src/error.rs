use thiserror::Error;

use crate::DeviceKind;

pub type Result<T, E = SpeechError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SpeechError {
    /// Invalid or missing configuration. Messages never carry credential
    /// values or the name of the variable they were read from.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no {kind} device matches '{fragment}'")]
    DeviceNotFound { kind: DeviceKind, fragment: String },
    #[error("multiple {kind} devices match '{fragment}': {candidates}")]
    DeviceAmbiguous {
        kind: DeviceKind,
        fragment: String,
        candidates: String,
    },
    #[error("audio backend error: {0}")]
    Audio(String),
    #[error("speech engine error: {0}")]
    Engine(String),
    #[error("worker thread error: {0}")]
    Worker(String),
}

impl SpeechError {
    /// Errors that are fatal at startup and must not be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::DeviceNotFound { .. } | Self::DeviceAmbiguous { .. }
        )
    }
}
