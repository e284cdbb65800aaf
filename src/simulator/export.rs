//! Export file writers.
//!
//! * `digital.csv`: `Time [s],Channel 0,...`, one row at the start of the window and
//!   one row per transition on any exported channel.
//! * `analog.csv`: `Time [s],Channel 0,...`, one row per kept sample.
//! * `digital_<n>.bin` / `analog_<n>.bin`: Logic 2 binary format version 0,
//!   little endian (see [`encode_digital`] and [`encode_analog`]).
//! * Data tables: `name,type,start_time,duration,data`.
//! * Legacy analyzer export: `Time [s],Value`.
//!
//! Times are seconds relative to the start of the exported window unless ISO-8601
//! timestamps are requested. Every failure is reported as `EXPORT_FAILED`.

use std::fs;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use tonic::Status;

use crate::error::abort_status;
use crate::models::{ChannelSet, DataTableFilter, RadixType};
use crate::proto::ErrorCode;
use crate::simulator::analyzers::Frame;
use crate::simulator::signal::{AnalogTrace, DigitalTrace, Recording};

/// Magic bytes at the start of every binary export.
pub const BINARY_MAGIC: &[u8; 8] = b"<SALEAE>";
/// Binary export format version.
pub const BINARY_VERSION: i32 = 0;
const BINARY_TYPE_DIGITAL: i32 = 0;
const BINARY_TYPE_ANALOG: i32 = 1;

/// Columns of a data table export, in file order.
pub const DATA_TABLE_COLUMNS: [&str; 5] = ["name", "type", "start_time", "duration", "data"];

fn export_failed(detail: impl std::fmt::Display) -> Status {
    abort_status(ErrorCode::ExportFailed, detail)
}

fn csv_error(err: csv::Error) -> Status {
    export_failed(format!("failed to write CSV: {err}"))
}

/// Renders capture-relative times.
#[derive(Debug, Clone, Copy)]
struct Clock {
    origin_seconds: f64,
    started_at: DateTime<Utc>,
    iso8601: bool,
}

impl Clock {
    fn render(&self, t: f64) -> String {
        if self.iso8601 {
            let nanos = (t * 1e9).round() as i64;
            (self.started_at + chrono::Duration::nanoseconds(nanos))
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
        } else {
            format!("{:.9}", t - self.origin_seconds)
        }
    }
}

/// Resolve an export channel selection against the recorded channels.
///
/// An empty selection means every recorded channel; naming a channel that was not
/// recorded is an error.
pub fn resolve_channels(requested: &ChannelSet, recorded: &ChannelSet) -> Result<ChannelSet, Status> {
    if requested.is_empty() {
        return Ok(recorded.clone());
    }
    if let Some(c) = requested.digital.iter().find(|c| !recorded.digital.contains(c)) {
        return Err(export_failed(format!("digital channel {c} was not recorded")));
    }
    if let Some(c) = requested.analog.iter().find(|c| !recorded.analog.contains(c)) {
        return Err(export_failed(format!("analog channel {c} was not recorded")));
    }
    Ok(requested.clone())
}

fn prepare_directory(directory: &Path) -> Result<(), Status> {
    fs::create_dir_all(directory)
        .map_err(|e| export_failed(format!("cannot create {}: {e}", directory.display())))
}

fn channel_header(channels: &[u32]) -> Vec<String> {
    std::iter::once("Time [s]".to_string())
        .chain(channels.iter().map(|c| format!("Channel {c}")))
        .collect()
}

/// Write `digital.csv` and/or `analog.csv` into `directory`.
pub fn write_raw_csv(
    recording: &Recording,
    directory: &Path,
    channels: &ChannelSet,
    analog_downsample_ratio: u64,
    iso8601: bool,
) -> Result<(), Status> {
    prepare_directory(directory)?;
    let clock = Clock {
        origin_seconds: recording.begin_seconds,
        started_at: recording.started_at,
        iso8601,
    };

    if !channels.digital.is_empty() {
        let traces: Vec<DigitalTrace> = channels.digital.iter().map(|&c| recording.digital(c)).collect();
        let mut writer = csv::Writer::from_path(directory.join("digital.csv")).map_err(csv_error)?;
        writer.write_record(channel_header(&channels.digital)).map_err(csv_error)?;

        let mut states: Vec<bool> = traces.iter().map(|t| t.initial_state).collect();
        let mut events: Vec<(f64, usize)> = traces
            .iter()
            .enumerate()
            .flat_map(|(i, t)| t.transitions.iter().map(move |&time| (time, i)))
            .collect();
        events.sort_by(|a, b| a.0.total_cmp(&b.0));

        let row = |time: f64, states: &[bool]| {
            std::iter::once(clock.render(time))
                .chain(states.iter().map(|&s| u8::from(s).to_string()))
                .collect::<Vec<_>>()
        };
        writer.write_record(row(recording.begin_seconds, &states)).map_err(csv_error)?;

        let mut index = 0;
        while index < events.len() {
            let time = events[index].0;
            while index < events.len() && events[index].0 == time {
                let channel = events[index].1;
                states[channel] = !states[channel];
                index += 1;
            }
            writer.write_record(row(time, &states)).map_err(csv_error)?;
        }
        writer.flush().map_err(|e| export_failed(e))?;
    }

    if !channels.analog.is_empty() {
        let traces: Vec<AnalogTrace> = channels
            .analog
            .iter()
            .map(|&c| recording.analog(c, analog_downsample_ratio))
            .collect();
        let mut writer = csv::Writer::from_path(directory.join("analog.csv")).map_err(csv_error)?;
        writer.write_record(channel_header(&channels.analog)).map_err(csv_error)?;

        let rows = traces.first().map_or(0, |t| t.samples.len());
        for i in 0..rows {
            let mut record = vec![clock.render(traces[0].time_of(i))];
            record.extend(traces.iter().map(|t| format!("{:.6}", t.samples[i])));
            writer.write_record(&record).map_err(csv_error)?;
        }
        writer.flush().map_err(|e| export_failed(e))?;
    }

    Ok(())
}

fn binary_header(buf: &mut BytesMut, kind: i32) {
    buf.put_slice(BINARY_MAGIC);
    buf.put_i32_le(BINARY_VERSION);
    buf.put_i32_le(kind);
}

/// Encode one digital channel.
///
/// Layout after the header: initial state `u32`, begin time `f64`, end time `f64`,
/// transition count `u64`, transition times `f64`.
#[must_use]
pub fn encode_digital(trace: &DigitalTrace) -> Bytes {
    let mut buf = BytesMut::with_capacity(44 + trace.transitions.len() * 8);
    binary_header(&mut buf, BINARY_TYPE_DIGITAL);
    buf.put_u32_le(u32::from(trace.initial_state));
    buf.put_f64_le(trace.begin_seconds);
    buf.put_f64_le(trace.end_seconds);
    buf.put_u64_le(trace.transitions.len() as u64);
    for &time in &trace.transitions {
        buf.put_f64_le(time);
    }
    buf.freeze()
}

/// Encode one analog channel.
///
/// Layout after the header: begin time `f64`, sample rate `u64`, downsample `u64`,
/// sample count `u64`, samples `f32`.
#[must_use]
pub fn encode_analog(trace: &AnalogTrace) -> Bytes {
    let mut buf = BytesMut::with_capacity(48 + trace.samples.len() * 4);
    binary_header(&mut buf, BINARY_TYPE_ANALOG);
    buf.put_f64_le(trace.begin_seconds);
    buf.put_u64_le(trace.sample_rate);
    buf.put_u64_le(trace.downsample);
    buf.put_u64_le(trace.samples.len() as u64);
    for &sample in &trace.samples {
        buf.put_f32_le(sample);
    }
    buf.freeze()
}

/// Write `digital_<n>.bin` / `analog_<n>.bin` into `directory`.
pub fn write_raw_binary(
    recording: &Recording,
    directory: &Path,
    channels: &ChannelSet,
    analog_downsample_ratio: u64,
) -> Result<(), Status> {
    prepare_directory(directory)?;
    let write = |name: String, bytes: Bytes| {
        let path = directory.join(name);
        fs::write(&path, &bytes).map_err(|e| export_failed(format!("cannot write {}: {e}", path.display())))
    };

    for &channel in &channels.digital {
        write(format!("digital_{channel}.bin"), encode_digital(&recording.digital(channel)))?;
    }
    for &channel in &channels.analog {
        write(
            format!("analog_{channel}.bin"),
            encode_analog(&recording.analog(channel, analog_downsample_ratio)),
        )?;
    }
    Ok(())
}

/// Render a decoded byte.
#[must_use]
pub fn format_value(value: u8, radix: RadixType) -> String {
    match radix {
        RadixType::Binary => format!("0b{value:08b}"),
        RadixType::Decimal => value.to_string(),
        RadixType::Hexadecimal => format!("0x{value:02X}"),
        RadixType::Ascii => {
            let c = char::from(value);
            if c.is_ascii_graphic() || c == ' ' {
                c.to_string()
            } else {
                format!("\\x{value:02X}")
            }
        }
    }
}

/// One analyzer's contribution to a data table.
#[derive(Debug, Clone)]
pub struct TableSource {
    /// `name` column: label, or analyzer name when unlabelled
    pub name: String,
    /// Radix for the `data` column
    pub radix: RadixType,
    /// Decoded frames
    pub frames: Vec<Frame>,
}

fn column_index(column: &str) -> Result<usize, Status> {
    DATA_TABLE_COLUMNS
        .iter()
        .position(|c| *c == column)
        .ok_or_else(|| {
            export_failed(format!(
                "unknown data table column '{column}'; expected one of {}",
                DATA_TABLE_COLUMNS.join(", ")
            ))
        })
}

/// Write a data table CSV.
///
/// Rows from all sources are merged in start time order. `columns` selects and orders
/// the written columns (all when empty); `filter` keeps rows whose filter columns
/// contain the query, case-insensitively.
pub fn write_data_table(
    path: &Path,
    recording: &Recording,
    sources: &[TableSource],
    columns: &[String],
    filter: Option<&DataTableFilter>,
    iso8601: bool,
) -> Result<(), Status> {
    let selected: Vec<usize> = if columns.is_empty() {
        (0..DATA_TABLE_COLUMNS.len()).collect()
    } else {
        columns.iter().map(|c| column_index(c)).collect::<Result<_, _>>()?
    };
    let filter_columns: Vec<usize> = match filter {
        Some(f) if !f.columns.is_empty() => {
            f.columns.iter().map(|c| column_index(c)).collect::<Result<_, _>>()?
        }
        _ => (0..DATA_TABLE_COLUMNS.len()).collect(),
    };
    let query = filter
        .map(|f| f.query.to_lowercase())
        .filter(|q| !q.is_empty());

    if let Some(parent) = path.parent() {
        prepare_directory(parent)?;
    }
    let clock = Clock {
        origin_seconds: recording.begin_seconds,
        started_at: recording.started_at,
        iso8601,
    };

    let mut rows: Vec<(f64, [String; 5])> = sources
        .iter()
        .flat_map(|source| {
            source.frames.iter().map(move |frame| {
                (
                    frame.start_seconds,
                    [
                        source.name.clone(),
                        frame.frame_type.clone(),
                        clock.render(frame.start_seconds),
                        format!("{:.9}", frame.duration_seconds),
                        format_value(frame.value, source.radix),
                    ],
                )
            })
        })
        .collect();
    rows.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer
        .write_record(selected.iter().map(|&i| DATA_TABLE_COLUMNS[i]))
        .map_err(csv_error)?;
    for (_, cells) in &rows {
        if let Some(query) = &query {
            let hit = filter_columns
                .iter()
                .any(|&i| cells[i].to_lowercase().contains(query.as_str()));
            if !hit {
                continue;
            }
        }
        writer
            .write_record(selected.iter().map(|&i| cells[i].as_str()))
            .map_err(csv_error)?;
    }
    writer.flush().map_err(|e| export_failed(e))?;
    Ok(())
}

/// Write the legacy single-analyzer export.
pub fn write_legacy(path: &Path, recording: &Recording, frames: &[Frame], radix: RadixType) -> Result<(), Status> {
    if let Some(parent) = path.parent() {
        prepare_directory(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(["Time [s]", "Value"]).map_err(csv_error)?;
    for frame in frames {
        writer
            .write_record([
                format!("{:.9}", frame.start_seconds - recording.begin_seconds),
                format_value(frame.value, radix),
            ])
            .map_err(csv_error)?;
    }
    writer.flush().map_err(|e| export_failed(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceType;

    fn recording() -> Recording {
        Recording {
            device_type: DeviceType::Logic8,
            digital_channels: vec![0, 1],
            analog_channels: vec![0],
            digital_sample_rate: 10_000_000,
            analog_sample_rate: 625_000,
            glitch_filters: vec![],
            begin_seconds: 0.0,
            end_seconds: 0.001,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn digital_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recording();
        write_raw_csv(&rec, dir.path(), &ChannelSet::digital([0, 1]), 1, false).unwrap();

        let mut reader = csv::Reader::from_path(dir.path().join("digital.csv")).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers, vec!["Time [s]", "Channel 0", "Channel 1"]);

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        // Initial row plus 20 distinct transition times (channel 1 edges coincide with channel 0)
        assert_eq!(rows.len(), 21);
        assert_eq!(&rows[0], vec!["0.000000000", "0", "0"]);
        assert_eq!(&rows[1], vec!["0.000050000", "1", "0"]);
        assert_eq!(&rows[2], vec!["0.000100000", "0", "1"]);
        assert!(!dir.path().join("analog.csv").exists());
    }

    #[test]
    fn analog_csv_downsampled() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recording();
        write_raw_csv(&rec, dir.path(), &ChannelSet::analog([0]), 25, true).unwrap();

        let mut reader = csv::Reader::from_path(dir.path().join("analog.csv")).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 25);
        assert!(rows[0][0].contains('T'), "ISO-8601 timestamp expected");
    }

    #[test]
    fn binary_layout() {
        let trace = recording().digital(0);
        let bytes = encode_digital(&trace);
        assert_eq!(&bytes[..8], BINARY_MAGIC);
        assert_eq!(i32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0);
        assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 0);
        let count = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        assert_eq!(count, 20);
        assert_eq!(bytes.len(), 44 + 20 * 8);

        let analog = encode_analog(&recording().analog(0, 1));
        assert_eq!(i32::from_le_bytes(analog[12..16].try_into().unwrap()), 1);
        let samples = u64::from_le_bytes(analog[40..48].try_into().unwrap());
        assert_eq!(samples, 625);
        assert_eq!(analog.len(), 48 + 625 * 4);
    }

    #[test]
    fn channel_resolution() {
        let recorded = ChannelSet::digital([0, 1]);
        assert_eq!(resolve_channels(&ChannelSet::default(), &recorded).unwrap(), recorded);
        assert!(resolve_channels(&ChannelSet::digital([5]), &recorded).is_err());
    }

    #[test]
    fn radix_rendering() {
        assert_eq!(format_value(65, RadixType::Ascii), "A");
        assert_eq!(format_value(1, RadixType::Ascii), "\\x01");
        assert_eq!(format_value(10, RadixType::Hexadecimal), "0x0A");
        assert_eq!(format_value(5, RadixType::Binary), "0b00000101");
        assert_eq!(format_value(200, RadixType::Decimal), "200");
    }

    #[test]
    fn data_table_columns_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recording();
        let frames = crate::simulator::analyzers::decode_frames(&rec, 0, "result");
        let sources = vec![TableSource {
            name: "spi".to_string(),
            radix: RadixType::Decimal,
            frames,
        }];
        let path = dir.path().join("table.csv");

        let filter = DataTableFilter {
            columns: vec!["data".to_string()],
            query: "7".to_string(),
        };
        write_data_table(
            &path,
            &rec,
            &sources,
            &["name".to_string(), "data".to_string()],
            Some(&filter),
            false,
        )
        .unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), vec!["name", "data"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0], vec!["spi", "7"]);

        let bad = write_data_table(&path, &rec, &sources, &["bogus".to_string()], None, false);
        assert!(bad.is_err());
    }
}
