//! Protocol analyzers known to the simulated backend.
//!
//! Each analyzer declares its settings the way Logic 2 names them in the analyzer
//! settings dialog. Requests are checked against that table: unknown setting names,
//! wrong value types, unknown choices and channels that are not part of the capture are
//! rejected with `INVALID_REQUEST`.
//!
//! Decoding is synthetic: an analyzer emits one frame per rising edge of its clock (or
//! only) channel, carrying an incrementing byte.

use std::path::Path;

use tonic::Status;

use crate::error::abort_status;
use crate::models::{AnalyzerSettingValue, AnalyzerSettings};
use crate::proto::ErrorCode;
use crate::simulator::signal::Recording;

/// Upper bound on frames decoded per analyzer.
pub const MAX_FRAMES: usize = 100_000;

/// Expected value type of a setting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingKind {
    /// Digital channel index; `required` settings must be present
    Channel {
        /// Whether the setting must be given
        required: bool,
    },
    /// One of a fixed list of strings
    Choice(Vec<String>),
    /// Integer value
    Integer,
    /// Checkbox
    Boolean,
}

/// Settings table of one analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSpec {
    /// Analyzer name as shown in Logic 2
    pub name: &'static str,
    /// `type` column of decoded frames
    pub frame_type: &'static str,
    /// Setting that names the channel frames are decoded from
    pub clock_setting: &'static str,
    /// Accepted settings
    pub settings: Vec<(&'static str, SettingKind)>,
}

fn choices(values: &[&str]) -> SettingKind {
    SettingKind::Choice(values.iter().map(|v| (*v).to_string()).collect())
}

fn bits_per_transfer() -> SettingKind {
    SettingKind::Choice(
        (1..=16)
            .map(|n| match n {
                1 => "1 Bit per Transfer".to_string(),
                8 => "8 Bits per Transfer (Standard)".to_string(),
                n => format!("{n} Bits per Transfer"),
            })
            .collect(),
    )
}

impl AnalyzerSpec {
    /// Settings table for `name`, `None` if the analyzer is unknown.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        let channel = |required| SettingKind::Channel { required };
        let spec = match name {
            "SPI" => Self {
                name: "SPI",
                frame_type: "result",
                clock_setting: "Clock",
                settings: vec![
                    ("MISO", channel(false)),
                    ("MOSI", channel(false)),
                    ("Clock", channel(true)),
                    ("Enable", channel(false)),
                    ("Bits per Transfer", bits_per_transfer()),
                    (
                        "Significant Bit",
                        choices(&[
                            "Most Significant Bit First (Standard)",
                            "Least Significant Bit First",
                        ]),
                    ),
                    (
                        "Clock State",
                        choices(&[
                            "Clock is Low when inactive (CPOL = 0)",
                            "Clock is High when inactive (CPOL = 1)",
                        ]),
                    ),
                    (
                        "Clock Phase",
                        choices(&[
                            "Data is Valid on Clock Leading Edge (CPHA = 0)",
                            "Data is Valid on Clock Trailing Edge (CPHA = 1)",
                        ]),
                    ),
                    (
                        "Enable Line",
                        choices(&[
                            "Enable line is Active Low (Standard)",
                            "Enable line is Active High",
                        ]),
                    ),
                ],
            },
            "I2C" => Self {
                name: "I2C",
                frame_type: "data",
                clock_setting: "SCL",
                settings: vec![("SDA", channel(true)), ("SCL", channel(true))],
            },
            "Async Serial" => Self {
                name: "Async Serial",
                frame_type: "data",
                clock_setting: "Input Channel",
                settings: vec![
                    ("Input Channel", channel(true)),
                    ("Bit Rate (Bits/s)", SettingKind::Integer),
                    (
                        "Stop Bits",
                        choices(&["1 Stop Bit (Standard)", "1.5 Stop Bits", "2 Stop Bits"]),
                    ),
                    (
                        "Parity Bit",
                        choices(&[
                            "No Parity Bit (Standard)",
                            "Even Parity Bit",
                            "Odd Parity Bit",
                        ]),
                    ),
                ],
            },
            "CAN" => Self {
                name: "CAN",
                frame_type: "identifier_field",
                clock_setting: "Input Channel",
                settings: vec![
                    ("Input Channel", channel(true)),
                    ("Bit Rate (Bits/s)", SettingKind::Integer),
                    ("Inverted (CAN High)", SettingKind::Boolean),
                ],
            },
            "SMBus" => Self {
                name: "SMBus",
                frame_type: "data",
                clock_setting: "SMBCLK",
                settings: vec![
                    ("SMBDAT", channel(true)),
                    ("SMBCLK", channel(true)),
                    ("Calculate PEC on packets", SettingKind::Boolean),
                ],
            },
            _ => return None,
        };
        Some(spec)
    }

    /// Check `settings` against this table and the capture's digital channels.
    pub fn validate(&self, settings: &AnalyzerSettings, digital_channels: &[u32]) -> Result<(), Status> {
        let invalid = |detail: String| abort_status(ErrorCode::InvalidRequest, detail);

        for (key, value) in settings {
            let Some((_, kind)) = self.settings.iter().find(|(name, _)| *name == key.as_str()) else {
                return Err(invalid(format!(
                    "'{key}' is not a setting of the {} analyzer",
                    self.name
                )));
            };
            match (kind, value) {
                (SettingKind::Channel { .. }, AnalyzerSettingValue::Int(channel)) => {
                    let enabled = u32::try_from(*channel)
                        .map(|c| digital_channels.contains(&c))
                        .unwrap_or(false);
                    if !enabled {
                        return Err(invalid(format!(
                            "{key}: digital channel {channel} is not enabled in this capture"
                        )));
                    }
                }
                (SettingKind::Choice(options), AnalyzerSettingValue::String(choice)) => {
                    if !options.contains(choice) {
                        return Err(invalid(format!("{key}: '{choice}' is not a valid option")));
                    }
                }
                (SettingKind::Integer, AnalyzerSettingValue::Int(_))
                | (SettingKind::Boolean, AnalyzerSettingValue::Bool(_)) => {}
                (kind, value) => {
                    return Err(invalid(format!(
                        "{key}: expected {kind:?}, got {value:?}"
                    )))
                }
            }
        }

        for (name, kind) in &self.settings {
            if matches!(kind, SettingKind::Channel { required: true }) && !settings.contains_key(*name) {
                return Err(invalid(format!(
                    "the {} analyzer requires the '{name}' setting",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Channel frames are decoded from.
    #[must_use]
    pub fn clock_channel(&self, settings: &AnalyzerSettings) -> Option<u32> {
        match settings.get(self.clock_setting) {
            Some(AnalyzerSettingValue::Int(channel)) => u32::try_from(*channel).ok(),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame type (`type` column)
    pub frame_type: String,
    /// Seconds after acquisition start
    pub start_seconds: f64,
    /// Frame length in seconds
    pub duration_seconds: f64,
    /// Decoded byte
    pub value: u8,
}

/// Decode frames from the rising edges of `channel` within the kept window.
#[must_use]
pub fn decode_frames(recording: &Recording, channel: u32, frame_type: &str) -> Vec<Frame> {
    let wave = recording.wave(channel);
    let rate = f64::from(recording.digital_sample_rate.max(1));
    let first = (recording.begin_seconds * rate).round() as u64;
    let last = (recording.end_seconds * rate).round() as u64;
    wave.rising_edges(first, last)
        .take(MAX_FRAMES)
        .enumerate()
        .map(|(index, sample)| Frame {
            frame_type: frame_type.to_string(),
            start_seconds: sample as f64 / rate,
            duration_seconds: wave.pulse_seconds(),
            value: (index % 256) as u8,
        })
        .collect()
}

/// Check that `extension_directory/extension.json` declares a high-level analyzer
/// called `name`.
pub fn check_extension(extension_directory: &Path, name: &str) -> Result<(), Status> {
    let manifest_path = extension_directory.join("extension.json");
    let invalid = |detail: String| abort_status(ErrorCode::InvalidRequest, detail);

    let raw = std::fs::read_to_string(&manifest_path)
        .map_err(|e| invalid(format!("cannot read {}: {e}", manifest_path.display())))?;
    let manifest: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| invalid(format!("invalid {}: {e}", manifest_path.display())))?;

    let declared = manifest
        .get("extensions")
        .and_then(|extensions| extensions.get(name))
        .and_then(|extension| extension.get("type"))
        .and_then(serde_json::Value::as_str);

    match declared {
        Some("HighLevelAnalyzer") => Ok(()),
        Some(other) => Err(invalid(format!(
            "extension '{name}' is a {other}, not a HighLevelAnalyzer"
        ))),
        None => Err(invalid(format!(
            "{} does not declare an extension named '{name}'",
            manifest_path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn spi_settings() -> AnalyzerSettings {
        let mut settings = AnalyzerSettings::new();
        settings.insert("MISO".into(), 0.into());
        settings.insert("Clock".into(), 1.into());
        settings.insert("Enable".into(), 2.into());
        settings.insert("Bits per Transfer".into(), "8 Bits per Transfer (Standard)".into());
        settings
    }

    #[test]
    fn spi_settings_are_accepted() {
        let spec = AnalyzerSpec::lookup("SPI").unwrap();
        assert!(spec.validate(&spi_settings(), &[0, 1, 2, 3]).is_ok());
        assert_eq!(spec.clock_channel(&spi_settings()), Some(1));
    }

    #[test]
    fn channel_must_be_enabled() {
        let spec = AnalyzerSpec::lookup("SPI").unwrap();
        let mut settings = spi_settings();
        settings.insert("Enable".into(), 7.into());
        assert!(spec.validate(&settings, &[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn invalid_choice_and_unknown_setting() {
        let spec = AnalyzerSpec::lookup("SPI").unwrap();
        let mut settings = spi_settings();
        settings.insert("Bits per Transfer".into(), "9 Bits per Transfer (Standard)".into());
        assert!(spec.validate(&settings, &[0, 1, 2]).is_err());

        let mut settings = spi_settings();
        settings.insert("Bogus".into(), true.into());
        assert!(spec.validate(&settings, &[0, 1, 2]).is_err());
    }

    #[test]
    fn required_channel_and_types() {
        let spec = AnalyzerSpec::lookup("CAN").unwrap();
        let mut settings = AnalyzerSettings::new();
        settings.insert("Bit Rate (Bits/s)".into(), 500_000.into());
        assert!(spec.validate(&settings, &[0]).is_err());

        settings.insert("Input Channel".into(), 0.into());
        settings.insert("Inverted (CAN High)".into(), true.into());
        assert!(spec.validate(&settings, &[0]).is_ok());

        settings.insert("Inverted (CAN High)".into(), "yes".into());
        assert!(spec.validate(&settings, &[0]).is_err());
    }

    #[test]
    fn unknown_analyzer() {
        assert!(AnalyzerSpec::lookup("Parallel Bus 9000").is_none());
    }

    #[test]
    fn frames_follow_rising_edges() {
        let recording = Recording {
            device_type: crate::models::DeviceType::Logic8,
            digital_channels: vec![0],
            analog_channels: vec![],
            digital_sample_rate: 10_000_000,
            analog_sample_rate: 0,
            glitch_filters: vec![],
            begin_seconds: 0.0,
            end_seconds: 0.001,
            started_at: Utc::now(),
        };
        let frames = decode_frames(&recording, 0, "result");
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[0].value, 0);
        assert_eq!(frames[3].value, 3);
        assert!((frames[0].start_seconds - 50e-6).abs() < 1e-12);
    }

    #[test]
    fn extension_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("extension.json"),
            r#"{"name": "Demo", "extensions": {"Text Messages": {"type": "HighLevelAnalyzer", "entryPoint": "HighLevelAnalyzer.Hla"}}}"#,
        )
        .unwrap();

        assert!(check_extension(dir.path(), "Text Messages").is_ok());
        assert!(check_extension(dir.path(), "Other").is_err());
        assert!(check_extension(&dir.path().join("missing"), "Text Messages").is_err());
    }
}
