//! Deterministic test signals.
//!
//! Digital channel `n` is a square wave that starts low at sample 0 and toggles every
//! `max((n + 1) · 50 µs, 2 samples)`. Analog channel `n` is a 1.5 V sine around 1.65 V
//! at `(n + 1)` kHz. Nothing is stored: a [`Recording`] only keeps the parameters and
//! time window, and samples are generated on demand for exports and analyzers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChannelSet, DeviceType, DigitalTriggerCaptureMode, GlitchFilterEntry, LinkedChannelState};

const BASE_HALF_PERIOD_SECONDS: f64 = 50e-6;

/// How far ahead the trigger search looks before concluding it never fires.
const TRIGGER_HORIZON_SECONDS: f64 = 10.0;

/// A finished acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Model that recorded the data
    pub device_type: DeviceType,
    /// Enabled digital channels
    pub digital_channels: Vec<u32>,
    /// Enabled analog channels
    pub analog_channels: Vec<u32>,
    /// Digital rate (0 when no digital channel is enabled)
    pub digital_sample_rate: u32,
    /// Analog rate (0 when no analog channel is enabled)
    pub analog_sample_rate: u32,
    /// Glitch filters applied while recording
    pub glitch_filters: Vec<GlitchFilterEntry>,
    /// Start of the kept data, seconds after acquisition start
    pub begin_seconds: f64,
    /// End of the kept data, seconds after acquisition start
    pub end_seconds: f64,
    /// Wall-clock time of acquisition start
    pub started_at: DateTime<Utc>,
}

impl Recording {
    /// Enabled channels.
    #[must_use]
    pub fn channels(&self) -> ChannelSet {
        ChannelSet {
            digital: self.digital_channels.clone(),
            analog: self.analog_channels.clone(),
        }
    }

    /// Square wave of a digital channel as recorded (glitch filter applied).
    #[must_use]
    pub fn wave(&self, channel: u32) -> DigitalWave {
        let glitch = self
            .glitch_filters
            .iter()
            .find(|f| f.channel_index == channel)
            .map(|f| f.pulse_width_seconds);
        DigitalWave::new(channel, self.digital_sample_rate, glitch)
    }

    /// Digital data of `channel` inside the kept window.
    #[must_use]
    pub fn digital(&self, channel: u32) -> DigitalTrace {
        let wave = self.wave(channel);
        let rate = f64::from(self.digital_sample_rate.max(1));
        let first = seconds_to_sample(self.begin_seconds, rate);
        let last = seconds_to_sample(self.end_seconds, rate);
        DigitalTrace {
            initial_state: wave.state_at(first),
            begin_seconds: self.begin_seconds,
            end_seconds: self.end_seconds,
            transitions: wave
                .transitions(first, last)
                .map(|s| s as f64 / rate)
                .collect(),
        }
    }

    /// Analog samples of `channel` inside the kept window, keeping every
    /// `downsample`-th sample.
    #[must_use]
    pub fn analog(&self, channel: u32, downsample: u64) -> AnalogTrace {
        let downsample = downsample.max(1);
        let rate = f64::from(self.analog_sample_rate.max(1));
        let first = seconds_to_sample(self.begin_seconds, rate);
        let last = seconds_to_sample(self.end_seconds, rate);
        let samples = (first..last)
            .step_by(usize::try_from(downsample).unwrap_or(usize::MAX))
            .map(|s| analog_value(channel, s as f64 / rate))
            .collect();
        AnalogTrace {
            begin_seconds: self.begin_seconds,
            sample_rate: u64::from(self.analog_sample_rate),
            downsample,
            samples,
        }
    }
}

/// Digital channel data over a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalTrace {
    /// Level at `begin_seconds`
    pub initial_state: bool,
    /// Window start
    pub begin_seconds: f64,
    /// Window end
    pub end_seconds: f64,
    /// Toggle times inside the window, ascending
    pub transitions: Vec<f64>,
}

/// Analog channel data over a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogTrace {
    /// Time of the first sample
    pub begin_seconds: f64,
    /// Recording rate
    pub sample_rate: u64,
    /// Kept every n-th sample
    pub downsample: u64,
    /// Volts
    pub samples: Vec<f32>,
}

impl AnalogTrace {
    /// Time of the `index`-th kept sample.
    #[must_use]
    pub fn time_of(&self, index: usize) -> f64 {
        self.begin_seconds + (index as u64 * self.downsample) as f64 / self.sample_rate.max(1) as f64
    }
}

/// Square wave generator for one digital channel, in sample units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigitalWave {
    half_period: u64,
    rate: u32,
    suppressed: bool,
}

impl DigitalWave {
    /// Wave of `channel` sampled at `rate`, optionally glitch filtered.
    ///
    /// Pulses shorter than the glitch filter width are removed; since every pulse of a
    /// channel has the same width, a wide enough filter flattens the channel to low.
    #[must_use]
    pub fn new(channel: u32, rate: u32, glitch_width_seconds: Option<f64>) -> Self {
        let rate_f = f64::from(rate.max(1));
        let nominal = BASE_HALF_PERIOD_SECONDS * f64::from(channel + 1) * rate_f;
        let half_period = (nominal.ceil() as u64).max(2);
        let pulse_seconds = half_period as f64 / rate_f;
        Self {
            half_period,
            rate,
            suppressed: glitch_width_seconds.is_some_and(|w| w > pulse_seconds),
        }
    }

    /// Samples between toggles.
    #[must_use]
    pub fn half_period(&self) -> u64 {
        self.half_period
    }

    /// Pulse width in seconds.
    #[must_use]
    pub fn pulse_seconds(&self) -> f64 {
        self.half_period as f64 / f64::from(self.rate.max(1))
    }

    /// True when the level at `sample` is high.
    #[must_use]
    pub fn state_at(&self, sample: u64) -> bool {
        !self.suppressed && (sample / self.half_period) % 2 == 1
    }

    /// Samples in `(from, to]` where the level toggles.
    pub fn transitions(&self, from: u64, to: u64) -> impl Iterator<Item = u64> {
        let h = self.half_period;
        let first = from / h + 1;
        let count = if self.suppressed || to <= from { 0 } else { to / h + 1 - first };
        (first..first + count).map(move |k| k * h)
    }

    /// Rising edges in `(from, to]`.
    pub fn rising_edges(&self, from: u64, to: u64) -> impl Iterator<Item = u64> {
        let h = self.half_period;
        self.transitions(from, to).filter(move |s| (s / h) % 2 == 1)
    }
}

/// Sample at which the digital trigger fires, or `None` if it never does.
///
/// Edge triggers fire on the edge; pulse triggers fire at the end of a qualifying pulse.
/// Linked channels must hold their level at the trigger sample.
pub fn find_trigger<F>(mode: &DigitalTriggerCaptureMode, rate: u32, wave_of: F) -> Option<u64>
where
    F: Fn(u32) -> DigitalWave,
{
    use crate::models::DigitalTriggerType as T;

    let wave = wave_of(mode.trigger_channel_index);
    if wave.suppressed {
        return None;
    }

    if mode.trigger_type.is_pulse() {
        let width = wave.pulse_seconds();
        let too_short = mode.min_pulse_width_seconds.is_some_and(|min| width < min);
        let too_long = mode.max_pulse_width_seconds.is_some_and(|max| width > max);
        if too_short || too_long {
            return None;
        }
    }

    // Index k of the toggle at k * half_period: odd k rise, even k fall.
    let first_k = match mode.trigger_type {
        T::Rising => 1,
        T::Falling | T::PulseHigh => 2,
        T::PulseLow => 3,
    };
    let horizon = (TRIGGER_HORIZON_SECONDS * f64::from(rate.max(1))) as u64;
    let linked: Vec<(DigitalWave, bool)> = mode
        .linked_channels
        .iter()
        .map(|l| (wave_of(l.channel_index), l.state == LinkedChannelState::High))
        .collect();

    (first_k..)
        .step_by(2)
        .map(|k| k * wave.half_period)
        .take_while(|&s| s <= horizon)
        .find(|&s| linked.iter().all(|(w, high)| w.state_at(s) == *high))
}

/// Voltage of analog channel `channel` at `t` seconds.
#[must_use]
pub fn analog_value(channel: u32, t: f64) -> f32 {
    let freq = 1_000.0 * f64::from(channel + 1);
    (1.65 + 1.5 * (std::f64::consts::TAU * freq * t).sin()) as f32
}

fn seconds_to_sample(seconds: f64, rate: f64) -> u64 {
    (seconds * rate).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DigitalTriggerLinkedChannel, DigitalTriggerType};

    fn recording(begin: f64, end: f64) -> Recording {
        Recording {
            device_type: DeviceType::Logic8,
            digital_channels: vec![0, 1],
            analog_channels: vec![0],
            digital_sample_rate: 10_000_000,
            analog_sample_rate: 625_000,
            glitch_filters: Vec::new(),
            begin_seconds: begin,
            end_seconds: end,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn square_wave_timing() {
        let wave = DigitalWave::new(0, 10_000_000, None);
        assert_eq!(wave.half_period(), 500);
        assert!(!wave.state_at(0));
        assert!(wave.state_at(500));
        assert!(!wave.state_at(1000));

        let edges: Vec<u64> = wave.transitions(0, 2000).collect();
        assert_eq!(edges, vec![500, 1000, 1500, 2000]);
        let rising: Vec<u64> = wave.rising_edges(0, 2000).collect();
        assert_eq!(rising, vec![500, 1500]);
    }

    #[test]
    fn slow_rates_keep_two_samples_per_level() {
        let wave = DigitalWave::new(0, 1_000, None);
        assert_eq!(wave.half_period(), 2);
    }

    #[test]
    fn wide_glitch_filter_flattens_channel() {
        let wave = DigitalWave::new(0, 10_000_000, Some(100e-6));
        assert_eq!(wave.transitions(0, 100_000).count(), 0);
        let narrow = DigitalWave::new(0, 10_000_000, Some(1e-6));
        assert!(narrow.transitions(0, 100_000).count() > 0);
    }

    #[test]
    fn digital_trace_of_window() {
        let trace = recording(0.0, 0.001).digital(0);
        assert!(!trace.initial_state);
        // 1 ms window, 50 us half period
        assert_eq!(trace.transitions.len(), 20);
        assert!((trace.transitions[0] - 50e-6).abs() < 1e-12);
    }

    #[test]
    fn analog_downsampling() {
        let rec = recording(0.0, 0.01);
        assert_eq!(rec.analog(0, 1).samples.len(), 6250);
        assert_eq!(rec.analog(0, 10).samples.len(), 625);
        let trace = rec.analog(0, 10);
        assert!((trace.time_of(1) - 10.0 / 625_000.0).abs() < 1e-12);
    }

    #[test]
    fn edge_triggers() {
        let wave_of = |c| DigitalWave::new(c, 10_000_000, None);
        let rising = DigitalTriggerCaptureMode::new(DigitalTriggerType::Rising, 0);
        assert_eq!(find_trigger(&rising, 10_000_000, wave_of), Some(500));
        let falling = DigitalTriggerCaptureMode::new(DigitalTriggerType::Falling, 0);
        assert_eq!(find_trigger(&falling, 10_000_000, wave_of), Some(1000));
    }

    #[test]
    fn pulse_width_bounds() {
        let wave_of = |c| DigitalWave::new(c, 10_000_000, None);
        let mut pulse = DigitalTriggerCaptureMode::new(DigitalTriggerType::PulseHigh, 0);
        pulse.min_pulse_width_seconds = Some(10e-6);
        pulse.max_pulse_width_seconds = Some(100e-6);
        assert_eq!(find_trigger(&pulse, 10_000_000, wave_of), Some(1000));

        pulse.min_pulse_width_seconds = Some(60e-6);
        assert_eq!(find_trigger(&pulse, 10_000_000, wave_of), None);
    }

    #[test]
    fn linked_channels_gate_the_trigger() {
        let wave_of = |c| DigitalWave::new(c, 10_000_000, None);
        let mut rising = DigitalTriggerCaptureMode::new(DigitalTriggerType::Rising, 0);
        // Channel 1 toggles every 1000 samples: high during [1000, 2000).
        rising.linked_channels.push(DigitalTriggerLinkedChannel {
            channel_index: 1,
            state: LinkedChannelState::High,
        });
        assert_eq!(find_trigger(&rising, 10_000_000, wave_of), Some(1500));
    }
}
