//! Value objects passed to and returned from the automation API.
//!
//! Configuration types are plain data: they are never validated on construction.
//! Logic 2 validates a device/capture configuration against the capabilities of the
//! target device when [`Manager::start_capture`](crate::Manager::start_capture) submits it.
//!
//! Every type derives `serde` traits so capture setups can be kept in TOML files and
//! loaded through the configuration layer.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Application / device descriptors
// =============================================================================

/// Semantic version of the automation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Incompatible protocol changes
    pub major: u32,
    /// Backward compatible additions
    pub minor: u32,
    /// Backward compatible fixes
    pub patch: u32,
}

impl Version {
    /// Create a version triple.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a client speaking `self` can talk to a backend speaking `server`.
    ///
    /// Majors must match. Minor and patch differences are backward compatible as long as
    /// the client is not newer than the backend.
    #[must_use]
    pub fn is_compatible_with(&self, server: &Version) -> bool {
        self.major == server.major && self <= server
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of the connected Logic 2 instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Automation API version implemented by the backend
    pub api_version: Version,
    /// Logic 2 application version string
    pub app_version: String,
    /// Pid of the Logic 2 main process
    pub app_pid: u64,
}

/// Saleae device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Saleae Logic
    Logic,
    /// Saleae Logic 4
    Logic4,
    /// Saleae Logic 8
    Logic8,
    /// Saleae Logic 16
    Logic16,
    /// Saleae Logic Pro 8
    LogicPro8,
    /// Saleae Logic Pro 16
    LogicPro16,
    /// A device type this client does not know about (raw wire value)
    Unknown(i32),
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logic => write!(f, "Logic"),
            Self::Logic4 => write!(f, "Logic 4"),
            Self::Logic8 => write!(f, "Logic 8"),
            Self::Logic16 => write!(f, "Logic 16"),
            Self::LogicPro8 => write!(f, "Logic Pro 8"),
            Self::LogicPro16 => write!(f, "Logic Pro 16"),
            Self::Unknown(raw) => write!(f, "Unknown device type ({raw})"),
        }
    }
}

/// A device reported by device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDesc {
    /// Device id (serial number) used with `start_capture`
    pub device_id: String,
    /// Device model
    pub device_type: DeviceType,
    /// True for simulation devices
    pub is_simulation: bool,
}

// =============================================================================
// Device configuration
// =============================================================================

/// Glitch filter for a single digital channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlitchFilterEntry {
    /// Digital channel index
    pub channel_index: u32,
    /// Minimum pulse width in seconds; rounded by the backend to whole samples
    pub pulse_width_seconds: f64,
}

/// Channel and sampling setup for Logic 8, Logic Pro 8 and Logic Pro 16.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicDeviceConfiguration {
    /// Enabled analog channels, e.g. `[0, 1]`
    pub enabled_analog_channels: Vec<u32>,
    /// Enabled digital channels, e.g. `[0, 1]`
    pub enabled_digital_channels: Vec<u32>,
    /// Analog samples per second; must match a rate offered for the enabled channels
    pub analog_sample_rate: Option<u32>,
    /// Digital samples per second; must match a rate offered for the enabled channels
    pub digital_sample_rate: Option<u32>,
    /// Logic Pro only: 1.2, 1.8 or 3.3. Leave unset on Logic 8.
    pub digital_threshold_volts: Option<f64>,
    /// Per-channel glitch filters (digital channels only)
    pub glitch_filters: Vec<GlitchFilterEntry>,
}

impl LogicDeviceConfiguration {
    /// Digital-only configuration.
    #[must_use]
    pub fn digital(channels: impl IntoIterator<Item = u32>, sample_rate: u32) -> Self {
        Self {
            enabled_digital_channels: channels.into_iter().collect(),
            digital_sample_rate: Some(sample_rate),
            ..Self::default()
        }
    }

    /// Enable analog channels at the given rate.
    #[must_use]
    pub fn with_analog(mut self, channels: impl IntoIterator<Item = u32>, sample_rate: u32) -> Self {
        self.enabled_analog_channels = channels.into_iter().collect();
        self.analog_sample_rate = Some(sample_rate);
        self
    }

    /// Set the digital threshold voltage.
    #[must_use]
    pub fn with_threshold(mut self, volts: f64) -> Self {
        self.digital_threshold_volts = Some(volts);
        self
    }

    /// Add a glitch filter.
    #[must_use]
    pub fn with_glitch_filter(mut self, channel_index: u32, pulse_width_seconds: f64) -> Self {
        self.glitch_filters.push(GlitchFilterEntry {
            channel_index,
            pulse_width_seconds,
        });
        self
    }
}

/// Device-specific configuration submitted with `start_capture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum DeviceConfiguration {
    /// Logic 8 / Logic Pro 8 / Logic Pro 16
    Logic(LogicDeviceConfiguration),
}

impl From<LogicDeviceConfiguration> for DeviceConfiguration {
    fn from(config: LogicDeviceConfiguration) -> Self {
        Self::Logic(config)
    }
}

// =============================================================================
// Capture configuration
// =============================================================================

/// Edge or pulse the digital trigger looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalTriggerType {
    /// Rising edge
    Rising,
    /// Falling edge
    Falling,
    /// High pulse
    PulseHigh,
    /// Low pulse
    PulseLow,
}

impl DigitalTriggerType {
    /// Whether this trigger matches pulses (and honours pulse width bounds).
    #[must_use]
    pub fn is_pulse(self) -> bool {
        matches!(self, Self::PulseHigh | Self::PulseLow)
    }
}

/// Level a linked channel must hold while the trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkedChannelState {
    /// Channel must be low
    Low,
    /// Channel must be high
    High,
}

/// Digital channel that must be high or low while the trigger event is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalTriggerLinkedChannel {
    /// Digital channel index
    pub channel_index: u32,
    /// Required level
    pub state: LinkedChannelState,
}

/// Record until the capture is stopped with `stop()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualCaptureMode {
    /// Seconds of data at the end of the capture to keep; `None` keeps everything
    #[serde(default)]
    pub trim_data_seconds: Option<f64>,
}

/// Record for a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedCaptureMode {
    /// Stop recording after this many seconds
    pub duration_seconds: f64,
    /// Seconds of data at the end of the capture to keep; `None` keeps everything
    #[serde(default)]
    pub trim_data_seconds: Option<f64>,
}

impl TimedCaptureMode {
    /// Timed capture without trimming.
    #[must_use]
    pub fn new(duration_seconds: f64) -> Self {
        Self {
            duration_seconds,
            trim_data_seconds: None,
        }
    }
}

/// Record until a digital trigger is found plus a post-trigger length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalTriggerCaptureMode {
    /// Edge or pulse to detect
    pub trigger_type: DigitalTriggerType,
    /// Channel the trigger is detected on
    pub trigger_channel_index: u32,
    /// Minimum pulse width (pulse triggers only)
    #[serde(default)]
    pub min_pulse_width_seconds: Option<f64>,
    /// Maximum pulse width (pulse triggers only)
    #[serde(default)]
    pub max_pulse_width_seconds: Option<f64>,
    /// Channels that must hold a level when the trigger fires
    #[serde(default)]
    pub linked_channels: Vec<DigitalTriggerLinkedChannel>,
    /// Seconds of data at the end of the capture to keep; `None` keeps everything
    #[serde(default)]
    pub trim_data_seconds: Option<f64>,
    /// Seconds to keep recording after the trigger
    #[serde(default)]
    pub after_trigger_seconds: Option<f64>,
}

impl DigitalTriggerCaptureMode {
    /// Trigger on `trigger_type` at `channel` with no other constraints.
    #[must_use]
    pub fn new(trigger_type: DigitalTriggerType, channel: u32) -> Self {
        Self {
            trigger_type,
            trigger_channel_index: channel,
            min_pulse_width_seconds: None,
            max_pulse_width_seconds: None,
            linked_channels: Vec::new(),
            trim_data_seconds: None,
            after_trigger_seconds: None,
        }
    }
}

/// Stop condition of a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    /// Looping capture; stop with `stop()`
    Manual(ManualCaptureMode),
    /// Fixed duration; wait with `wait()`
    Timed(TimedCaptureMode),
    /// Digital trigger; wait with `wait()`
    DigitalTrigger(DigitalTriggerCaptureMode),
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Manual(ManualCaptureMode::default())
    }
}

impl CaptureMode {
    /// Trim length shared by all modes.
    #[must_use]
    pub fn trim_data_seconds(&self) -> Option<f64> {
        match self {
            Self::Manual(mode) => mode.trim_data_seconds,
            Self::Timed(mode) => mode.trim_data_seconds,
            Self::DigitalTrigger(mode) => mode.trim_data_seconds,
        }
    }
}

/// Top-level capture configuration for `start_capture`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfiguration {
    /// Capture buffer size in megabytes; backend default when `None`
    #[serde(default)]
    pub buffer_size_megabytes: Option<u32>,
    /// Stop condition
    #[serde(default)]
    pub capture_mode: CaptureMode,
}

impl CaptureConfiguration {
    /// Configuration with the given mode and the default buffer size.
    #[must_use]
    pub fn new(capture_mode: CaptureMode) -> Self {
        Self {
            buffer_size_megabytes: None,
            capture_mode,
        }
    }

    /// Timed capture of `duration_seconds`.
    #[must_use]
    pub fn timed(duration_seconds: f64) -> Self {
        Self::new(CaptureMode::Timed(TimedCaptureMode::new(duration_seconds)))
    }

    /// Set the buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, megabytes: u32) -> Self {
        self.buffer_size_megabytes = Some(megabytes);
        self
    }
}

// =============================================================================
// Analyzers and exports
// =============================================================================

/// Handle to an analyzer or high-level analyzer attached to a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalyzerHandle {
    /// Backend analyzer id
    pub analyzer_id: u64,
}

/// Analyzer attached to a capture, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerInfo {
    /// Handle for removal and export
    pub handle: AnalyzerHandle,
    /// Analyzer (or HLA) name
    pub name: String,
    /// User-visible label, if one was given
    pub label: Option<String>,
    /// True for high-level analyzers
    pub high_level: bool,
}

/// Value of a protocol analyzer setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalyzerSettingValue {
    /// Choice or text setting
    String(String),
    /// Integer setting (channel indices, bit rates, ...)
    Int(i64),
    /// Checkbox setting
    Bool(bool),
    /// Floating point setting
    Float(f64),
}

impl From<&str> for AnalyzerSettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AnalyzerSettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AnalyzerSettingValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AnalyzerSettingValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for AnalyzerSettingValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for AnalyzerSettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for AnalyzerSettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Value of a high-level analyzer setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HighLevelAnalyzerSettingValue {
    /// String or choices setting
    String(String),
    /// Number setting
    Number(f64),
}

impl From<&str> for HighLevelAnalyzerSettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HighLevelAnalyzerSettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for HighLevelAnalyzerSettingValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for HighLevelAnalyzerSettingValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Analyzer settings keyed by the exact names shown in the Logic 2 UI.
pub type AnalyzerSettings = HashMap<String, AnalyzerSettingValue>;

/// High-level analyzer settings keyed by the names declared by the extension.
pub type HighLevelAnalyzerSettings = HashMap<String, HighLevelAnalyzerSettingValue>;

/// Numeric base used when rendering decoded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadixType {
    /// Base 2
    Binary,
    /// Base 10
    Decimal,
    /// Base 16
    Hexadecimal,
    /// ASCII characters
    Ascii,
}

impl RadixType {
    /// All radix types, in wire order.
    pub const ALL: [RadixType; 4] = [
        RadixType::Binary,
        RadixType::Decimal,
        RadixType::Hexadecimal,
        RadixType::Ascii,
    ];
}

/// Analyzer to include in a data table export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTableExportConfiguration {
    /// Analyzer to export
    pub analyzer: AnalyzerHandle,
    /// Radix for decoded values; backend default when `None`
    pub radix: Option<RadixType>,
}

impl From<AnalyzerHandle> for DataTableExportConfiguration {
    fn from(analyzer: AnalyzerHandle) -> Self {
        Self {
            analyzer,
            radix: None,
        }
    }
}

impl DataTableExportConfiguration {
    /// Export `analyzer` using `radix`.
    #[must_use]
    pub fn new(analyzer: AnalyzerHandle, radix: RadixType) -> Self {
        Self {
            analyzer,
            radix: Some(radix),
        }
    }
}

/// Free-form query applied to the data table before export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTableFilter {
    /// Columns to search; all columns when empty
    pub columns: Vec<String>,
    /// Query string
    pub query: String,
}

/// Options of `export_data_table`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTableExportOptions {
    /// Columns to write; all columns when empty
    pub columns: Vec<String>,
    /// Row filter
    pub filter: Option<DataTableFilter>,
    /// Wall-clock ISO-8601 timestamps instead of capture-relative seconds
    pub iso8601_timestamp: bool,
}

/// Set of digital and analog channel indices.
///
/// Used both to describe the channels of a capture and to select channels for a raw
/// export, where an empty set means "all channels of the capture".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSet {
    /// Digital channel indices
    pub digital: Vec<u32>,
    /// Analog channel indices
    pub analog: Vec<u32>,
}

impl ChannelSet {
    /// Digital channels only.
    #[must_use]
    pub fn digital(channels: impl IntoIterator<Item = u32>) -> Self {
        Self {
            digital: channels.into_iter().collect(),
            analog: Vec::new(),
        }
    }

    /// Analog channels only.
    #[must_use]
    pub fn analog(channels: impl IntoIterator<Item = u32>) -> Self {
        Self {
            digital: Vec::new(),
            analog: channels.into_iter().collect(),
        }
    }

    /// True when no channel is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digital.is_empty() && self.analog.is_empty()
    }
}

/// Options of `export_raw_data_csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCsvExportOptions {
    /// Channels to export; all channels when empty
    pub channels: ChannelSet,
    /// Keep every n-th analog sample (1 = full resolution)
    pub analog_downsample_ratio: u64,
    /// Wall-clock ISO-8601 timestamps instead of capture-relative seconds
    pub iso8601_timestamp: bool,
}

impl Default for RawCsvExportOptions {
    fn default() -> Self {
        Self {
            channels: ChannelSet::default(),
            analog_downsample_ratio: 1,
            iso8601_timestamp: false,
        }
    }
}

/// Options of `export_raw_data_binary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBinaryExportOptions {
    /// Channels to export; all channels when empty
    pub channels: ChannelSet,
    /// Keep every n-th analog sample (1 = full resolution)
    pub analog_downsample_ratio: u64,
}

impl Default for RawBinaryExportOptions {
    fn default() -> Self {
        Self {
            channels: ChannelSet::default(),
            analog_downsample_ratio: 1,
        }
    }
}
