//! Conversions between the value objects in [`crate::models`] and the generated
//! protobuf types in [`crate::proto`].
//!
//! Optional domain values travel as proto3 scalars: `None` is encoded as `0`
//! (or `0.0`) and decoded back to `None`.

use crate::models::{
    AnalyzerHandle, AnalyzerInfo, AnalyzerSettingValue, AppInfo, CaptureConfiguration,
    CaptureMode, ChannelSet, DataTableExportConfiguration, DataTableFilter, DeviceConfiguration,
    DeviceDesc, DeviceType, DigitalTriggerCaptureMode, DigitalTriggerLinkedChannel,
    DigitalTriggerType, GlitchFilterEntry, HighLevelAnalyzerSettingValue, LinkedChannelState,
    LogicDeviceConfiguration, ManualCaptureMode, RadixType, TimedCaptureMode, Version,
};
use crate::proto;

/// Trait for converting proto types to domain types
pub trait ToDomain<T> {
    /// Perform the conversion.
    fn to_domain(self) -> T;
}

fn opt_f64(value: f64) -> Option<f64> {
    (value != 0.0).then_some(value)
}

fn opt_u32(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

// =============================================================================
// Descriptors (proto -> domain)
// =============================================================================

impl From<Version> for proto::Version {
    fn from(version: Version) -> Self {
        proto::Version {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
        }
    }
}

impl ToDomain<Version> for proto::Version {
    fn to_domain(self) -> Version {
        Version::new(self.major, self.minor, self.patch)
    }
}

impl ToDomain<AppInfo> for proto::AppInfo {
    fn to_domain(self) -> AppInfo {
        AppInfo {
            api_version: self.api_version.unwrap_or_default().to_domain(),
            app_version: self.application_version,
            app_pid: self.launch_pid,
        }
    }
}

impl From<DeviceType> for i32 {
    fn from(device_type: DeviceType) -> Self {
        let wire = match device_type {
            DeviceType::Logic => proto::DeviceType::Logic,
            DeviceType::Logic4 => proto::DeviceType::Logic4,
            DeviceType::Logic8 => proto::DeviceType::Logic8,
            DeviceType::Logic16 => proto::DeviceType::Logic16,
            DeviceType::LogicPro8 => proto::DeviceType::LogicPro8,
            DeviceType::LogicPro16 => proto::DeviceType::LogicPro16,
            DeviceType::Unknown(raw) => return raw,
        };
        wire as i32
    }
}

impl ToDomain<DeviceType> for i32 {
    fn to_domain(self) -> DeviceType {
        match proto::DeviceType::try_from(self) {
            Ok(proto::DeviceType::Logic) => DeviceType::Logic,
            Ok(proto::DeviceType::Logic4) => DeviceType::Logic4,
            Ok(proto::DeviceType::Logic8) => DeviceType::Logic8,
            Ok(proto::DeviceType::Logic16) => DeviceType::Logic16,
            Ok(proto::DeviceType::LogicPro8) => DeviceType::LogicPro8,
            Ok(proto::DeviceType::LogicPro16) => DeviceType::LogicPro16,
            Ok(proto::DeviceType::Unspecified) | Err(_) => DeviceType::Unknown(self),
        }
    }
}

impl From<&DeviceDesc> for proto::Device {
    fn from(device: &DeviceDesc) -> Self {
        proto::Device {
            device_id: device.device_id.clone(),
            device_type: device.device_type.into(),
            is_simulation: device.is_simulation,
        }
    }
}

impl ToDomain<DeviceDesc> for proto::Device {
    fn to_domain(self) -> DeviceDesc {
        DeviceDesc {
            device_id: self.device_id,
            device_type: self.device_type.to_domain(),
            is_simulation: self.is_simulation,
        }
    }
}

impl From<&ChannelSet> for proto::LogicChannels {
    fn from(channels: &ChannelSet) -> Self {
        proto::LogicChannels {
            analog_channels: channels.analog.clone(),
            digital_channels: channels.digital.clone(),
        }
    }
}

impl ToDomain<ChannelSet> for proto::LogicChannels {
    fn to_domain(self) -> ChannelSet {
        ChannelSet {
            digital: self.digital_channels,
            analog: self.analog_channels,
        }
    }
}

impl From<&AnalyzerInfo> for proto::AnalyzerInfo {
    fn from(info: &AnalyzerInfo) -> Self {
        proto::AnalyzerInfo {
            analyzer_id: info.handle.analyzer_id,
            name: info.name.clone(),
            label: info.label.clone().unwrap_or_default(),
            high_level: info.high_level,
        }
    }
}

impl ToDomain<AnalyzerInfo> for proto::AnalyzerInfo {
    fn to_domain(self) -> AnalyzerInfo {
        AnalyzerInfo {
            handle: AnalyzerHandle {
                analyzer_id: self.analyzer_id,
            },
            name: self.name,
            label: (!self.label.is_empty()).then_some(self.label),
            high_level: self.high_level,
        }
    }
}

// =============================================================================
// Device configuration
// =============================================================================

impl From<&LogicDeviceConfiguration> for proto::LogicDeviceConfiguration {
    fn from(config: &LogicDeviceConfiguration) -> Self {
        proto::LogicDeviceConfiguration {
            logic_channels: Some(proto::LogicChannels {
                analog_channels: config.enabled_analog_channels.clone(),
                digital_channels: config.enabled_digital_channels.clone(),
            }),
            digital_sample_rate: config.digital_sample_rate.unwrap_or(0),
            analog_sample_rate: config.analog_sample_rate.unwrap_or(0),
            digital_threshold_volts: config.digital_threshold_volts.unwrap_or(0.0),
            glitch_filters: config
                .glitch_filters
                .iter()
                .map(|entry| proto::GlitchFilterEntry {
                    channel_index: entry.channel_index,
                    pulse_width_seconds: entry.pulse_width_seconds,
                })
                .collect(),
        }
    }
}

impl ToDomain<LogicDeviceConfiguration> for proto::LogicDeviceConfiguration {
    fn to_domain(self) -> LogicDeviceConfiguration {
        let channels = self.logic_channels.unwrap_or_default();
        LogicDeviceConfiguration {
            enabled_analog_channels: channels.analog_channels,
            enabled_digital_channels: channels.digital_channels,
            analog_sample_rate: opt_u32(self.analog_sample_rate),
            digital_sample_rate: opt_u32(self.digital_sample_rate),
            digital_threshold_volts: opt_f64(self.digital_threshold_volts),
            glitch_filters: self
                .glitch_filters
                .into_iter()
                .map(|entry| GlitchFilterEntry {
                    channel_index: entry.channel_index,
                    pulse_width_seconds: entry.pulse_width_seconds,
                })
                .collect(),
        }
    }
}

impl From<&DeviceConfiguration> for proto::start_capture_request::DeviceConfiguration {
    fn from(config: &DeviceConfiguration) -> Self {
        match config {
            DeviceConfiguration::Logic(logic) => Self::LogicDeviceConfiguration(logic.into()),
        }
    }
}

// =============================================================================
// Capture configuration
// =============================================================================

impl From<DigitalTriggerType> for proto::DigitalTriggerType {
    fn from(trigger_type: DigitalTriggerType) -> Self {
        match trigger_type {
            DigitalTriggerType::Rising => Self::Rising,
            DigitalTriggerType::Falling => Self::Falling,
            DigitalTriggerType::PulseHigh => Self::PulseHigh,
            DigitalTriggerType::PulseLow => Self::PulseLow,
        }
    }
}

impl From<LinkedChannelState> for proto::DigitalTriggerLinkedChannelState {
    fn from(state: LinkedChannelState) -> Self {
        match state {
            LinkedChannelState::Low => Self::Low,
            LinkedChannelState::High => Self::High,
        }
    }
}

impl From<&CaptureMode> for proto::capture_configuration::CaptureMode {
    fn from(mode: &CaptureMode) -> Self {
        match mode {
            CaptureMode::Manual(manual) => Self::ManualCaptureMode(proto::ManualCaptureMode {
                trim_data_seconds: manual.trim_data_seconds.unwrap_or(0.0),
            }),
            CaptureMode::Timed(timed) => Self::TimedCaptureMode(proto::TimedCaptureMode {
                duration_seconds: timed.duration_seconds,
                trim_data_seconds: timed.trim_data_seconds.unwrap_or(0.0),
            }),
            CaptureMode::DigitalTrigger(trigger) => {
                Self::DigitalCaptureMode(proto::DigitalTriggerCaptureMode {
                    trigger_type: proto::DigitalTriggerType::from(trigger.trigger_type) as i32,
                    trigger_channel_index: trigger.trigger_channel_index,
                    min_pulse_width_seconds: trigger.min_pulse_width_seconds.unwrap_or(0.0),
                    max_pulse_width_seconds: trigger.max_pulse_width_seconds.unwrap_or(0.0),
                    linked_channels: trigger
                        .linked_channels
                        .iter()
                        .map(|linked| proto::DigitalTriggerLinkedChannel {
                            channel_index: linked.channel_index,
                            state: proto::DigitalTriggerLinkedChannelState::from(linked.state)
                                as i32,
                        })
                        .collect(),
                    trim_data_seconds: trigger.trim_data_seconds.unwrap_or(0.0),
                    after_trigger_seconds: trigger.after_trigger_seconds.unwrap_or(0.0),
                })
            }
        }
    }
}

impl From<&CaptureConfiguration> for proto::CaptureConfiguration {
    fn from(config: &CaptureConfiguration) -> Self {
        proto::CaptureConfiguration {
            buffer_size_megabytes: config.buffer_size_megabytes.unwrap_or(0),
            capture_mode: Some((&config.capture_mode).into()),
        }
    }
}

impl TryFrom<proto::DigitalTriggerCaptureMode> for DigitalTriggerCaptureMode {
    type Error = String;

    fn try_from(mode: proto::DigitalTriggerCaptureMode) -> Result<Self, Self::Error> {
        let trigger_type = match proto::DigitalTriggerType::try_from(mode.trigger_type) {
            Ok(proto::DigitalTriggerType::Rising) => DigitalTriggerType::Rising,
            Ok(proto::DigitalTriggerType::Falling) => DigitalTriggerType::Falling,
            Ok(proto::DigitalTriggerType::PulseHigh) => DigitalTriggerType::PulseHigh,
            Ok(proto::DigitalTriggerType::PulseLow) => DigitalTriggerType::PulseLow,
            Ok(proto::DigitalTriggerType::Unspecified) | Err(_) => {
                return Err(format!("invalid trigger type {}", mode.trigger_type))
            }
        };

        let linked_channels = mode
            .linked_channels
            .into_iter()
            .map(|linked| {
                let state = match proto::DigitalTriggerLinkedChannelState::try_from(linked.state) {
                    Ok(proto::DigitalTriggerLinkedChannelState::Low) => LinkedChannelState::Low,
                    Ok(proto::DigitalTriggerLinkedChannelState::High) => LinkedChannelState::High,
                    Ok(proto::DigitalTriggerLinkedChannelState::Unspecified) | Err(_) => {
                        return Err(format!(
                            "invalid state {} for linked channel {}",
                            linked.state, linked.channel_index
                        ))
                    }
                };
                Ok(DigitalTriggerLinkedChannel {
                    channel_index: linked.channel_index,
                    state,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(DigitalTriggerCaptureMode {
            trigger_type,
            trigger_channel_index: mode.trigger_channel_index,
            min_pulse_width_seconds: opt_f64(mode.min_pulse_width_seconds),
            max_pulse_width_seconds: opt_f64(mode.max_pulse_width_seconds),
            linked_channels,
            trim_data_seconds: opt_f64(mode.trim_data_seconds),
            after_trigger_seconds: opt_f64(mode.after_trigger_seconds),
        })
    }
}

impl TryFrom<proto::CaptureConfiguration> for CaptureConfiguration {
    type Error = String;

    fn try_from(config: proto::CaptureConfiguration) -> Result<Self, Self::Error> {
        use proto::capture_configuration::CaptureMode as Wire;

        let capture_mode = match config.capture_mode {
            None => return Err("capture mode not set".to_string()),
            Some(Wire::ManualCaptureMode(manual)) => CaptureMode::Manual(ManualCaptureMode {
                trim_data_seconds: opt_f64(manual.trim_data_seconds),
            }),
            Some(Wire::TimedCaptureMode(timed)) => CaptureMode::Timed(TimedCaptureMode {
                duration_seconds: timed.duration_seconds,
                trim_data_seconds: opt_f64(timed.trim_data_seconds),
            }),
            Some(Wire::DigitalCaptureMode(trigger)) => {
                CaptureMode::DigitalTrigger(trigger.try_into()?)
            }
        };

        Ok(CaptureConfiguration {
            buffer_size_megabytes: opt_u32(config.buffer_size_megabytes),
            capture_mode,
        })
    }
}

// =============================================================================
// Analyzers and exports
// =============================================================================

impl From<&AnalyzerSettingValue> for proto::AnalyzerSettingValue {
    fn from(value: &AnalyzerSettingValue) -> Self {
        use proto::analyzer_setting_value::Value;
        let value = match value {
            AnalyzerSettingValue::String(s) => Value::StringValue(s.clone()),
            AnalyzerSettingValue::Int(i) => Value::Int64Value(*i),
            AnalyzerSettingValue::Bool(b) => Value::BoolValue(*b),
            AnalyzerSettingValue::Float(f) => Value::DoubleValue(*f),
        };
        proto::AnalyzerSettingValue { value: Some(value) }
    }
}

impl ToDomain<Option<AnalyzerSettingValue>> for proto::AnalyzerSettingValue {
    fn to_domain(self) -> Option<AnalyzerSettingValue> {
        use proto::analyzer_setting_value::Value;
        Some(match self.value? {
            Value::StringValue(s) => AnalyzerSettingValue::String(s),
            Value::Int64Value(i) => AnalyzerSettingValue::Int(i),
            Value::BoolValue(b) => AnalyzerSettingValue::Bool(b),
            Value::DoubleValue(f) => AnalyzerSettingValue::Float(f),
        })
    }
}

impl From<&HighLevelAnalyzerSettingValue> for proto::HighLevelAnalyzerSettingValue {
    fn from(value: &HighLevelAnalyzerSettingValue) -> Self {
        use proto::high_level_analyzer_setting_value::Value;
        let value = match value {
            HighLevelAnalyzerSettingValue::String(s) => Value::StringValue(s.clone()),
            HighLevelAnalyzerSettingValue::Number(n) => Value::NumberValue(*n),
        };
        proto::HighLevelAnalyzerSettingValue { value: Some(value) }
    }
}

impl ToDomain<Option<HighLevelAnalyzerSettingValue>> for proto::HighLevelAnalyzerSettingValue {
    fn to_domain(self) -> Option<HighLevelAnalyzerSettingValue> {
        use proto::high_level_analyzer_setting_value::Value;
        Some(match self.value? {
            Value::StringValue(s) => HighLevelAnalyzerSettingValue::String(s),
            Value::NumberValue(n) => HighLevelAnalyzerSettingValue::Number(n),
        })
    }
}

impl From<RadixType> for proto::RadixType {
    fn from(radix: RadixType) -> Self {
        match radix {
            RadixType::Binary => Self::Binary,
            RadixType::Decimal => Self::Decimal,
            RadixType::Hexadecimal => Self::Hexadecimal,
            RadixType::Ascii => Self::Ascii,
        }
    }
}

/// Encode an optional radix; `None` leaves the choice to the backend.
#[must_use]
pub fn radix_to_wire(radix: Option<RadixType>) -> i32 {
    radix.map_or(proto::RadixType::Unspecified as i32, |r| {
        proto::RadixType::from(r) as i32
    })
}

impl ToDomain<Option<RadixType>> for i32 {
    fn to_domain(self) -> Option<RadixType> {
        match proto::RadixType::try_from(self) {
            Ok(proto::RadixType::Binary) => Some(RadixType::Binary),
            Ok(proto::RadixType::Decimal) => Some(RadixType::Decimal),
            Ok(proto::RadixType::Hexadecimal) => Some(RadixType::Hexadecimal),
            Ok(proto::RadixType::Ascii) => Some(RadixType::Ascii),
            Ok(proto::RadixType::Unspecified) | Err(_) => None,
        }
    }
}

impl From<&DataTableExportConfiguration> for proto::DataTableAnalyzerConfiguration {
    fn from(config: &DataTableExportConfiguration) -> Self {
        proto::DataTableAnalyzerConfiguration {
            analyzer_id: config.analyzer.analyzer_id,
            radix_type: radix_to_wire(config.radix),
        }
    }
}

impl From<&DataTableFilter> for proto::DataTableFilter {
    fn from(filter: &DataTableFilter) -> Self {
        proto::DataTableFilter {
            query: filter.query.clone(),
            columns: filter.columns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_values_travel_as_zero() {
        let config = LogicDeviceConfiguration::digital([0, 1], 10_000_000);
        let wire = proto::LogicDeviceConfiguration::from(&config);

        assert_eq!(wire.analog_sample_rate, 0);
        assert_eq!(wire.digital_threshold_volts, 0.0);
        let back: LogicDeviceConfiguration = wire.to_domain();
        assert_eq!(back, config);
    }

    #[test]
    fn capture_mode_survives_the_wire() {
        let mut trigger = DigitalTriggerCaptureMode::new(DigitalTriggerType::PulseLow, 2);
        trigger.min_pulse_width_seconds = Some(1e-6);
        trigger.after_trigger_seconds = Some(0.25);
        trigger.linked_channels.push(DigitalTriggerLinkedChannel {
            channel_index: 4,
            state: LinkedChannelState::High,
        });
        let config =
            CaptureConfiguration::new(CaptureMode::DigitalTrigger(trigger)).with_buffer_size(64);

        let wire = proto::CaptureConfiguration::from(&config);
        let back = CaptureConfiguration::try_from(wire).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_capture_mode_is_rejected() {
        let wire = proto::CaptureConfiguration {
            buffer_size_megabytes: 16,
            capture_mode: None,
        };
        assert!(CaptureConfiguration::try_from(wire).is_err());
    }

    #[test]
    fn unknown_device_type_keeps_raw_value() {
        let pro: DeviceType = 5_i32.to_domain();
        let unknown: DeviceType = 42_i32.to_domain();
        assert_eq!(pro, DeviceType::LogicPro8);
        assert_eq!(unknown, DeviceType::Unknown(42));
        assert_eq!(i32::from(DeviceType::Unknown(42)), 42);
    }

    #[test]
    fn empty_label_is_none() {
        let info = proto::AnalyzerInfo {
            analyzer_id: 3,
            name: "SPI".into(),
            label: String::new(),
            high_level: false,
        }
        .to_domain();
        assert_eq!(info.label, None);
        assert_eq!(info.handle, AnalyzerHandle { analyzer_id: 3 });
    }

    #[test]
    fn radix_defaults_to_unspecified() {
        assert_eq!(radix_to_wire(None), 0);
        let wire = radix_to_wire(Some(RadixType::Hexadecimal));
        let back: Option<RadixType> = wire.to_domain();
        assert_eq!(back, Some(RadixType::Hexadecimal));
    }
}
