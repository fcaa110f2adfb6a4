//! Resolve configured device-name fragments against a backend's listing.

use std::sync::LazyLock;

use regex::Regex;

use crate::{DeviceInfo, DeviceKind, Result, SpeechError};

#[allow(clippy::expect_used)]
static ALSA_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((plughw:\d+,\d+|hw:\d+,\d+)\)").expect("valid ALSA tag pattern")
});

fn matching<'a>(
    devices: &'a [DeviceInfo],
    kind: DeviceKind,
    fragment: &str,
) -> impl Iterator<Item = &'a DeviceInfo> {
    let needle = fragment.to_lowercase();
    devices
        .iter()
        .filter(move |d| d.supports(kind) && d.name.to_lowercase().contains(&needle))
}

/// The single input device whose name contains `fragment`, ignoring case.
pub fn resolve_input_device(devices: &[DeviceInfo], fragment: &str) -> Result<DeviceInfo> {
    let found: Vec<&DeviceInfo> = matching(devices, DeviceKind::Input, fragment).collect();
    match found.as_slice() {
        [] => Err(SpeechError::DeviceNotFound {
            kind: DeviceKind::Input,
            fragment: fragment.to_string(),
        }),
        [device] => Ok((*device).clone()),
        many => Err(SpeechError::DeviceAmbiguous {
            kind: DeviceKind::Input,
            fragment: fragment.to_string(),
            candidates: many
                .iter()
                .map(|d| format!("[{}] {}", d.index, d.name))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// ALSA identifier (`plughw:X,Y`) of the single output device whose name
/// contains `fragment`. Devices without an ALSA tag in their name are not
/// candidates; a bare `hw:X,Y` tag is promoted to `plughw:X,Y`.
pub fn resolve_output_device(devices: &[DeviceInfo], fragment: &str) -> Result<String> {
    let found: Vec<String> = matching(devices, DeviceKind::Output, fragment)
        .filter_map(|d| alsa_name(&d.name))
        .collect();
    match found.as_slice() {
        [] => Err(SpeechError::DeviceNotFound {
            kind: DeviceKind::Output,
            fragment: fragment.to_string(),
        }),
        [name] => Ok(name.clone()),
        many => Err(SpeechError::DeviceAmbiguous {
            kind: DeviceKind::Output,
            fragment: fragment.to_string(),
            candidates: many.join(", "),
        }),
    }
}

fn alsa_name(device_name: &str) -> Option<String> {
    let tag = ALSA_TAG.captures(device_name)?.get(1)?.as_str();
    if tag.starts_with("hw:") {
        Some(format!("plug{tag}"))
    } else {
        Some(tag.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: usize, name: &str, inputs: u16, outputs: u16) -> DeviceInfo {
        DeviceInfo {
            index,
            name: name.to_string(),
            max_input_channels: inputs,
            max_output_channels: outputs,
        }
    }

    fn listing() -> Vec<DeviceInfo> {
        vec![
            device(0, "HDA Intel PCH: ALC3246 Analog (hw:0,0)", 2, 2),
            device(1, "HDA Intel PCH: HDMI 0 (hw:0,3)", 0, 8),
            device(2, "C922 Pro Stream Webcam: USB Audio (hw:1,0)", 2, 0),
            device(3, "USB Audio Device: - (plughw:2,0)", 1, 2),
            device(4, "pulse", 32, 32),
            device(5, "default", 32, 32),
        ]
    }

    #[test]
    fn input_match_is_case_insensitive() {
        let found = resolve_input_device(&listing(), "c922").unwrap();
        assert_eq!(found.index, 2);
    }

    #[test]
    fn input_match_ignores_output_only_devices() {
        let err = resolve_input_device(&listing(), "HDMI").unwrap_err();
        assert!(matches!(
            err,
            SpeechError::DeviceNotFound {
                kind: DeviceKind::Input,
                ..
            }
        ));
    }

    #[test]
    fn ambiguous_input_lists_candidates() {
        let err = resolve_input_device(&listing(), "usb audio").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, SpeechError::DeviceAmbiguous { .. }));
        assert!(message.contains("[2] C922"));
        assert!(message.contains("[3] USB Audio Device"));
    }

    #[test]
    fn output_hw_tag_is_promoted_to_plughw() {
        assert_eq!(
            resolve_output_device(&listing(), "hdmi").unwrap(),
            "plughw:0,3"
        );
        assert_eq!(
            resolve_output_device(&listing(), "USB Audio Device").unwrap(),
            "plughw:2,0"
        );
    }

    #[test]
    fn output_without_alsa_tag_is_not_a_candidate() {
        let err = resolve_output_device(&listing(), "pulse").unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "no output device matches 'pulse'");
    }

    #[test]
    fn ambiguous_output_is_an_error() {
        let err = resolve_output_device(&listing(), "HDA Intel").unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple output devices match 'HDA Intel': plughw:0,0, plughw:0,3"
        );
    }
}
