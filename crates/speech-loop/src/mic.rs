//! Microphone capture through cpal.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, warn};

use crate::{AudioBackend, CaptureStream, DeviceInfo, Result, SpeechError};

/// Samples buffered before a frame is handed to the reader.
const FRAME_SAMPLES: usize = 1600;

fn audio_err(context: &str, e: impl std::fmt::Display) -> SpeechError {
    SpeechError::Audio(format!("{context}: {e}"))
}

/// Devices of the default cpal host. Indices follow the host's enumeration
/// order and stay valid while the device set does not change.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_device(&self, wanted: &DeviceInfo) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let devices = host
            .devices()
            .map_err(|e| audio_err("enumerating devices", e))?;
        for (index, device) in devices.enumerate() {
            let name = device.name().unwrap_or_default();
            if index == wanted.index && name == wanted.name {
                return Ok(device);
            }
        }
        Err(SpeechError::Audio(format!(
            "device '{}' is no longer available",
            wanted.name
        )))
    }
}

fn max_channels<I>(configs: std::result::Result<I, impl std::fmt::Display>) -> u16
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    configs
        .map(|c| c.map(|range| range.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

impl AudioBackend for CpalBackend {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let devices = host
            .devices()
            .map_err(|e| audio_err("enumerating devices", e))?;
        Ok(devices
            .enumerate()
            .map(|(index, device)| DeviceInfo {
                index,
                name: device.name().unwrap_or_else(|_| format!("device {index}")),
                max_input_channels: max_channels(device.supported_input_configs()),
                max_output_channels: max_channels(device.supported_output_configs()),
            })
            .collect())
    }

    fn open_input(
        &self,
        device: &DeviceInfo,
        sample_rate_hz: u32,
    ) -> Result<Box<dyn CaptureStream>> {
        let input = self.find_device(device)?;
        let default = input
            .default_input_config()
            .map_err(|e| audio_err("input config", e))?;
        let channels = default.channels();
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate_hz),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = mpsc::channel::<Vec<i16>>();
        let err_fn = |err: cpal::StreamError| warn!(error = %err, "input stream error");
        let stream = match default.sample_format() {
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&input, &config, channels, tx, err_fn, |s| s)?
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&input, &config, channels, tx, err_fn, |s| {
                    (i32::from(s) - 32768) as i16
                })?
            }
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&input, &config, channels, tx, err_fn, |s| {
                    (s.clamp(-1.0, 1.0) * 32767.0) as i16
                })?
            }
            other => {
                return Err(SpeechError::Audio(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        };
        stream.play().map_err(|e| audio_err("stream play", e))?;
        debug!(device = %device.name, channels, sample_rate_hz, "input stream playing");
        Ok(Box::new(CpalCapture {
            _stream: stream,
            rx,
        }))
    }
}

/// Keeps the first channel of every interleaved frame.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    tx: Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    to_i16: impl Fn(T) -> i16 + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let channels = usize::from(channels.max(1));
    let mut buf = Vec::<i16>::with_capacity(FRAME_SAMPLES * 2);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                buf.extend(data.chunks_exact(channels).map(|frame| to_i16(frame[0])));
                if buf.len() >= FRAME_SAMPLES {
                    let out =
                        std::mem::replace(&mut buf, Vec::with_capacity(FRAME_SAMPLES * 2));
                    let _ = tx.send(out);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| audio_err("building input stream", e))
}

struct CpalCapture {
    _stream: cpal::Stream,
    rx: Receiver<Vec<i16>>,
}

impl CaptureStream for CpalCapture {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SpeechError::Audio("input stream closed".to_string()))
            }
        }
    }
}
