//! Simulation device catalog and configuration checks.
//!
//! Capabilities per model:
//!
//! | Model        | Digital | Analog | Max digital | Max analog | Bandwidth (ch·S/s) | Thresholds     |
//! |--------------|---------|--------|-------------|------------|--------------------|----------------|
//! | Logic 8      | 8       | 8      | 100 MS/s    | 10 MS/s    | 400 M              | fixed          |
//! | Logic Pro 8  | 8       | 8      | 500 MS/s    | 50 MS/s    | 2 000 M            | 1.2, 1.8, 3.3 V |
//! | Logic Pro 16 | 16      | 16     | 500 MS/s    | 50 MS/s    | 4 000 M            | 1.2, 1.8, 3.3 V |
//!
//! A sample rate is offered when it divides the model's maximum rate.

use tonic::Status;

use crate::error::abort_status;
use crate::models::{DeviceDesc, DeviceType, LogicDeviceConfiguration};
use crate::proto::ErrorCode;

/// The three simulation devices Logic 2 exposes, in discovery order.
#[must_use]
pub fn simulation_devices() -> Vec<DeviceDesc> {
    [
        ("F4243", DeviceType::Logic8),
        ("F4244", DeviceType::LogicPro8),
        ("F4241", DeviceType::LogicPro16),
    ]
    .into_iter()
    .map(|(id, device_type)| DeviceDesc {
        device_id: id.to_string(),
        device_type,
        is_simulation: true,
    })
    .collect()
}

/// Hardware limits of one device model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    /// Number of digital channels
    pub digital_channels: u32,
    /// Number of analog channels
    pub analog_channels: u32,
    /// Highest digital sample rate
    pub max_digital_rate: u32,
    /// Highest analog sample rate
    pub max_analog_rate: u32,
    /// Sustained channel-samples per second before the stream starves
    pub bandwidth: u64,
    /// Accepted threshold voltages; empty when the threshold is fixed
    pub thresholds: &'static [f64],
}

impl Capabilities {
    /// Limits of `device_type`, `None` for models the simulator does not emulate.
    #[must_use]
    pub fn of(device_type: DeviceType) -> Option<Self> {
        match device_type {
            DeviceType::Logic8 => Some(Self {
                digital_channels: 8,
                analog_channels: 8,
                max_digital_rate: 100_000_000,
                max_analog_rate: 10_000_000,
                bandwidth: 400_000_000,
                thresholds: &[],
            }),
            DeviceType::LogicPro8 => Some(Self {
                digital_channels: 8,
                analog_channels: 8,
                max_digital_rate: 500_000_000,
                max_analog_rate: 50_000_000,
                bandwidth: 2_000_000_000,
                thresholds: &[1.2, 1.8, 3.3],
            }),
            DeviceType::LogicPro16 => Some(Self {
                digital_channels: 16,
                analog_channels: 16,
                max_digital_rate: 500_000_000,
                max_analog_rate: 50_000_000,
                bandwidth: 4_000_000_000,
                thresholds: &[1.2, 1.8, 3.3],
            }),
            _ => None,
        }
    }

    fn offers_rate(max: u32, rate: u32) -> bool {
        rate > 0 && rate <= max && max % rate == 0
    }

    /// Channel-samples per second requested by `config`.
    #[must_use]
    pub fn load(config: &LogicDeviceConfiguration) -> u64 {
        let digital = u64::from(config.digital_sample_rate.unwrap_or(0))
            * config.enabled_digital_channels.len() as u64;
        let analog = u64::from(config.analog_sample_rate.unwrap_or(0))
            * config.enabled_analog_channels.len() as u64;
        digital + analog
    }

    /// Check a device configuration against these limits.
    ///
    /// Malformed requests fail with `INVALID_REQUEST`; settings the hardware cannot
    /// provide fail with `DEVICE_ERROR`.
    pub fn validate(&self, config: &LogicDeviceConfiguration) -> Result<(), Status> {
        let digital = &config.enabled_digital_channels;
        let analog = &config.enabled_analog_channels;

        if digital.is_empty() && analog.is_empty() {
            return Err(abort_status(
                ErrorCode::InvalidRequest,
                "at least one channel must be enabled",
            ));
        }
        if has_duplicates(digital) || has_duplicates(analog) {
            return Err(abort_status(
                ErrorCode::InvalidRequest,
                "channel list contains duplicates",
            ));
        }
        if let Some(channel) = digital.iter().find(|&&c| c >= self.digital_channels) {
            return Err(abort_status(
                ErrorCode::DeviceError,
                format!("digital channel {channel} does not exist on this device"),
            ));
        }
        if let Some(channel) = analog.iter().find(|&&c| c >= self.analog_channels) {
            return Err(abort_status(
                ErrorCode::DeviceError,
                format!("analog channel {channel} does not exist on this device"),
            ));
        }

        if !digital.is_empty() {
            match config.digital_sample_rate {
                None => {
                    return Err(abort_status(
                        ErrorCode::InvalidRequest,
                        "digital sample rate is required when digital channels are enabled",
                    ))
                }
                Some(rate) if !Self::offers_rate(self.max_digital_rate, rate) => {
                    return Err(abort_status(
                        ErrorCode::DeviceError,
                        format!("digital sample rate {rate} is not supported"),
                    ))
                }
                Some(_) => {}
            }
        }
        if !analog.is_empty() {
            match config.analog_sample_rate {
                None => {
                    return Err(abort_status(
                        ErrorCode::InvalidRequest,
                        "analog sample rate is required when analog channels are enabled",
                    ))
                }
                Some(rate) if !Self::offers_rate(self.max_analog_rate, rate) => {
                    return Err(abort_status(
                        ErrorCode::DeviceError,
                        format!("analog sample rate {rate} is not supported"),
                    ))
                }
                Some(_) => {}
            }
        }

        if let Some(volts) = config.digital_threshold_volts {
            let supported = self.thresholds.iter().any(|t| (t - volts).abs() < 1e-9);
            if !supported {
                return Err(abort_status(
                    ErrorCode::DeviceError,
                    format!("digital threshold {volts} V is not supported by this device"),
                ));
            }
        }

        for filter in &config.glitch_filters {
            if !digital.contains(&filter.channel_index) {
                return Err(abort_status(
                    ErrorCode::InvalidRequest,
                    format!(
                        "glitch filter set on digital channel {} which is not enabled",
                        filter.channel_index
                    ),
                ));
            }
            if !(filter.pulse_width_seconds > 0.0) {
                return Err(abort_status(
                    ErrorCode::InvalidRequest,
                    format!(
                        "glitch filter pulse width must be positive, got {}",
                        filter.pulse_width_seconds
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn has_duplicates(channels: &[u32]) -> bool {
    let mut sorted = channels.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).any(|w| w[0] == w[1])
}
