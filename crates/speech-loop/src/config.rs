use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{Result, SpeechError};

/// Startup configuration of a [`crate::SpeechLoop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Keyword model table handed to the keyword spotter.
    pub wake_word_model: PathBuf,
    /// Case-insensitive fragment of the capture device name.
    pub microphone: String,
    /// Case-insensitive fragment of the playback device name. The device
    /// must carry an ALSA tag such as `(hw:1,0)`.
    pub speaker: String,
    pub voice_name: String,
    /// Environment variable holding the speech service key.
    pub key_env_var: String,
    pub region: String,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    /// End-of-utterance silence used by recognition.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
}

fn default_sample_rate_hz() -> u32 {
    16_000
}

fn default_silence_timeout_ms() -> u64 {
    250
}

impl SpeechConfig {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("wake_word_model", self.wake_word_model.as_os_str().is_empty()),
            ("microphone", self.microphone.trim().is_empty()),
            ("speaker", self.speaker.trim().is_empty()),
            ("voice_name", self.voice_name.trim().is_empty()),
            ("key_env_var", self.key_env_var.trim().is_empty()),
            ("region", self.region.trim().is_empty()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, empty)| *empty) {
            return Err(SpeechError::Config(format!("{field} must not be empty")));
        }
        if self.sample_rate_hz == 0 {
            return Err(SpeechError::Config(
                "sample_rate_hz must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Everything an engine needs to build its collaborators.
#[derive(Debug)]
pub struct EngineSettings {
    pub subscription_key: SecretString,
    pub region: String,
    pub voice_name: String,
    pub keyword_model: PathBuf,
    /// ALSA playback device, e.g. `plughw:1,0`.
    pub output_device: String,
    pub silence_timeout: Duration,
}

/// Read the speech service key from `env_var`. A missing or blank value is
/// a configuration error; the message names neither the variable nor its
/// contents.
pub fn load_subscription_key(env_var: &str) -> Result<SecretString> {
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
        _ => Err(SpeechError::Config(
            "speech service key is not configured in the environment".to_string(),
        )),
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<SpeechConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading speech config: {}", path.display()))?;
    let config: SpeechConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating speech config: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    const YAML: &str = "\
wake_word_model: models/hey_robot.table
microphone: C922
speaker: USB Audio
voice_name: en-US-AvaMultilingualNeural
key_env_var: SPEECH_LOOP_TEST_KEY_UNUSED
region: westeurope
";

    fn sample() -> SpeechConfig {
        serde_yaml::from_str(YAML).unwrap()
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.wake_word_model, PathBuf::from("models/hey_robot.table"));
        assert_eq!(config.region, "westeurope");
        assert_eq!(config.sample_rate_hz, 16_000);
        assert_eq!(config.silence_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_blank_fields() {
        let mut config = sample();
        config.speaker = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: speaker must not be empty");

        let mut config = sample();
        config.sample_rate_hz = 0;
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn invalid_file_reports_its_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"microphone: [unterminated").unwrap();
        let err = load_config_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_key_error_does_not_leak_its_source() {
        let var = "SPEECH_LOOP_TEST_KEY_MISSING";
        std::env::remove_var(var);
        let err = load_subscription_key(var).unwrap_err();
        assert!(err.is_configuration());
        assert!(!err.to_string().contains(var));
    }

    #[test]
    fn blank_key_is_rejected_without_echoing_it() {
        let var = "SPEECH_LOOP_TEST_KEY_BLANK";
        std::env::set_var(var, "   ");
        let err = load_subscription_key(var).unwrap_err();
        assert!(!err.to_string().contains(var));
        assert_eq!(
            err.to_string(),
            "configuration error: speech service key is not configured in the environment"
        );
    }

    #[test]
    fn key_is_read_from_the_environment() {
        let var = "SPEECH_LOOP_TEST_KEY_PRESENT";
        std::env::set_var(var, "s3cr3t");
        let key = load_subscription_key(var).unwrap();
        assert_eq!(key.expose_secret(), "s3cr3t");
        assert!(!format!("{key:?}").contains("s3cr3t"));
    }
}
