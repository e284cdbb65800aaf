//! `Manager` service implementation backed by generated signals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::convert::ToDomain;
use crate::error::abort_status;
use crate::models::{
    AnalyzerSettings, CaptureConfiguration, CaptureMode, ChannelSet, DataTableFilter,
    DeviceDesc, HighLevelAnalyzerSettings, LogicDeviceConfiguration, RadixType,
};
use crate::proto::{self, manager_server::Manager as ManagerService, ErrorCode};
use crate::simulator::analyzers::{check_extension, decode_frames, AnalyzerSpec, Frame};
use crate::simulator::devices::Capabilities;
use crate::simulator::export::{self, TableSource};
use crate::simulator::signal::{find_trigger, Recording};
use crate::simulator::storage::{AnalyzerKind, CaptureFile, StoredAnalyzer};
use crate::simulator::SimulatorOptions;

/// Capture buffer used when the request leaves it at 0.
pub const DEFAULT_BUFFER_MEGABYTES: u32 = 1024;

/// Time until a capture that exceeds the device bandwidth reports starvation.
const STARVATION_DELAY: Duration = Duration::from_millis(20);

type RpcResult<T> = Result<Response<T>, Status>;

fn invalid(detail: impl std::fmt::Display) -> Status {
    abort_status(ErrorCode::InvalidRequest, detail)
}

/// Acquisition progress of one capture.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Running,
    Completed,
    Failed(ErrorCode, String),
}

impl Phase {
    fn into_result(self) -> Result<(), Status> {
        match self {
            Self::Failed(code, detail) => Err(abort_status(code, detail)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct CaptureData {
    recording: Recording,
    analyzers: Vec<StoredAnalyzer>,
}

impl CaptureData {
    fn analyzer(&self, id: u64) -> Result<&StoredAnalyzer, Status> {
        self.analyzers
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| invalid(format!("analyzer {id} does not exist")))
    }

    /// Frames of an analyzer; high-level analyzers re-type their input's frames.
    fn frames(&self, analyzer: &StoredAnalyzer) -> Result<Vec<Frame>, Status> {
        match &analyzer.kind {
            AnalyzerKind::Protocol { settings } => {
                let spec = AnalyzerSpec::lookup(&analyzer.name)
                    .ok_or_else(|| invalid(format!("unknown analyzer '{}'", analyzer.name)))?;
                Ok(spec
                    .clock_channel(settings)
                    .map(|channel| decode_frames(&self.recording, channel, spec.frame_type))
                    .unwrap_or_default())
            }
            AnalyzerKind::HighLevel { input, .. } => {
                let source = self.analyzer(*input)?;
                let mut frames = self.frames(source)?;
                for frame in &mut frames {
                    frame.frame_type.clone_from(&analyzer.name);
                }
                Ok(frames)
            }
        }
    }

    fn info(&self, capture_id: u64) -> proto::CaptureInfo {
        proto::CaptureInfo {
            capture_id,
            logic_channels: Some((&self.recording.channels()).into()),
            analyzers: self
                .analyzers
                .iter()
                .map(|a| (&a.info()).into())
                .collect(),
        }
    }
}

#[derive(Debug)]
struct CaptureRecord {
    manual: bool,
    phase: watch::Sender<Phase>,
    stop: Notify,
    data: Mutex<CaptureData>,
}

impl CaptureRecord {
    fn new(manual: bool, phase: Phase, data: CaptureData) -> Self {
        let (phase, _) = watch::channel(phase);
        Self {
            manual,
            phase,
            stop: Notify::new(),
            data: Mutex::new(data),
        }
    }

    fn is_running(&self) -> bool {
        *self.phase.borrow() == Phase::Running
    }

    async fn finished(&self) -> Phase {
        let mut rx = self.phase.subscribe();
        let phase = match rx.wait_for(|p| *p != Phase::Running).await {
            Ok(phase) => phase.clone(),
            // Sender lives in self, so the channel cannot close while we hold it.
            Err(_) => Phase::Failed(ErrorCode::InternalException, "capture vanished".into()),
        };
        phase
    }

    /// Stop acquisition if it is still going and wait for the outcome.
    async fn halt(&self) -> Phase {
        if self.is_running() {
            self.stop.notify_one();
        }
        self.finished().await
    }

    fn ensure_finished(&self) -> Result<(), Status> {
        if self.is_running() {
            return Err(invalid("capture is still running"));
        }
        Ok(())
    }
}

/// How an acquisition ends if nobody stops it.
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    /// Natural end in seconds after start
    end_seconds: Option<f64>,
    /// Failure and when it happens
    failure: Option<(f64, ErrorCode, String)>,
    /// Keep only the last n seconds
    trim_seconds: Option<f64>,
}

fn bytes_per_second(config: &LogicDeviceConfiguration) -> f64 {
    let digital = f64::from(config.digital_sample_rate.unwrap_or(0))
        * config.enabled_digital_channels.len() as f64
        / 8.0;
    let analog = f64::from(config.analog_sample_rate.unwrap_or(0))
        * config.enabled_analog_channels.len() as f64
        * 4.0;
    digital + analog
}

fn validate_capture_mode(
    config: &CaptureConfiguration,
    device: &LogicDeviceConfiguration,
) -> Result<(), Status> {
    if config.capture_mode.trim_data_seconds().is_some_and(|t| !(t > 0.0)) {
        return Err(invalid("trim_data_seconds must be positive"));
    }
    match &config.capture_mode {
        CaptureMode::Manual(_) => {}
        CaptureMode::Timed(timed) => {
            if !(timed.duration_seconds > 0.0) {
                return Err(invalid(format!(
                    "capture duration must be positive, got {}",
                    timed.duration_seconds
                )));
            }
        }
        CaptureMode::DigitalTrigger(trigger) => {
            let enabled = &device.enabled_digital_channels;
            if !enabled.contains(&trigger.trigger_channel_index) {
                return Err(invalid(format!(
                    "trigger channel {} is not enabled",
                    trigger.trigger_channel_index
                )));
            }
            for linked in &trigger.linked_channels {
                if linked.channel_index == trigger.trigger_channel_index {
                    return Err(invalid("the trigger channel cannot also be a linked channel"));
                }
                if !enabled.contains(&linked.channel_index) {
                    return Err(invalid(format!(
                        "linked channel {} is not enabled",
                        linked.channel_index
                    )));
                }
            }
            if let (Some(min), Some(max)) = (
                trigger.min_pulse_width_seconds,
                trigger.max_pulse_width_seconds,
            ) {
                if min > max {
                    return Err(invalid(format!(
                        "minimum pulse width {min} exceeds maximum {max}"
                    )));
                }
            }
            if trigger.after_trigger_seconds.is_some_and(|s| s < 0.0) {
                return Err(invalid("after_trigger_seconds cannot be negative"));
            }
        }
    }
    Ok(())
}

fn plan_acquisition(
    capabilities: &Capabilities,
    device: &LogicDeviceConfiguration,
    config: &CaptureConfiguration,
    recording: &Recording,
) -> Plan {
    let end_seconds = match &config.capture_mode {
        CaptureMode::Manual(_) => None,
        CaptureMode::Timed(timed) => Some(timed.duration_seconds),
        CaptureMode::DigitalTrigger(trigger) => {
            let rate = recording.digital_sample_rate;
            find_trigger(trigger, rate, |c| recording.wave(c)).map(|sample| {
                sample as f64 / f64::from(rate.max(1)) + trigger.after_trigger_seconds.unwrap_or(0.0)
            })
        }
    };

    let mut failures = Vec::new();
    let load = Capabilities::load(device);
    if load > capabilities.bandwidth {
        failures.push((
            STARVATION_DELAY.as_secs_f64(),
            ErrorCode::CaptureFailed,
            format!(
                "data starvation: {load} samples/s exceeds the device bandwidth of {} samples/s; \
                 reduce the sample rate or the number of channels",
                capabilities.bandwidth
            ),
        ));
    }
    let buffer_bytes =
        f64::from(config.buffer_size_megabytes.unwrap_or(DEFAULT_BUFFER_MEGABYTES)) * 1024.0 * 1024.0;
    let rate = bytes_per_second(device);
    if rate > 0.0 {
        failures.push((
            buffer_bytes / rate,
            ErrorCode::OutOfMemory,
            format!(
                "capture buffer of {} MB is full",
                config.buffer_size_megabytes.unwrap_or(DEFAULT_BUFFER_MEGABYTES)
            ),
        ));
    }
    let failure = failures
        .into_iter()
        .filter(|(at, _, _)| end_seconds.map_or(true, |end| *at < end))
        .min_by(|a, b| a.0.total_cmp(&b.0));

    Plan {
        end_seconds,
        failure,
        trim_seconds: config.capture_mode.trim_data_seconds(),
    }
}

/// Simulated Logic 2 backend.
#[derive(Debug)]
pub struct SimulatedLogic2 {
    options: SimulatorOptions,
    next_id: AtomicU64,
    captures: RwLock<HashMap<u64, Arc<CaptureRecord>>>,
    busy: Arc<Mutex<HashMap<String, u64>>>,
}

impl SimulatedLogic2 {
    /// Backend with the given identity and devices.
    #[must_use]
    pub fn new(options: SimulatorOptions) -> Self {
        Self {
            options,
            next_id: AtomicU64::new(1),
            captures: RwLock::new(HashMap::new()),
            busy: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn capture(&self, capture_id: u64) -> Result<Arc<CaptureRecord>, Status> {
        self.captures
            .read()
            .await
            .get(&capture_id)
            .cloned()
            .ok_or_else(|| invalid(format!("capture {capture_id} does not exist")))
    }

    fn find_device(&self, device_id: &str) -> Result<&DeviceDesc, Status> {
        if device_id.is_empty() {
            return self
                .options
                .devices
                .first()
                .ok_or_else(|| abort_status(ErrorCode::MissingDevice, "no devices are connected"));
        }
        self.options
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| {
                abort_status(
                    ErrorCode::MissingDevice,
                    format!("device {device_id} is not connected"),
                )
            })
    }

    async fn acquire(
        record: Arc<CaptureRecord>,
        plan: Plan,
        busy: Arc<Mutex<HashMap<String, u64>>>,
        device_id: String,
        capture_id: u64,
    ) {
        let started = Instant::now();
        let event = match (plan.end_seconds, &plan.failure) {
            (_, Some((at, _, _))) => Some(*at),
            (end, None) => end,
        };
        let deadline = event.map(|secs| started + Duration::from_secs_f64(secs));

        let stopped = tokio::select! {
            () = record.stop.notified() => true,
            () = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => false,
        };

        let (end_seconds, phase) = if stopped {
            (started.elapsed().as_secs_f64(), Phase::Completed)
        } else {
            match plan.failure {
                Some((at, code, detail)) => (at, Phase::Failed(code, detail)),
                None => (event.unwrap_or_default(), Phase::Completed),
            }
        };

        {
            let mut data = record.data.lock().await;
            data.recording.end_seconds = end_seconds;
            data.recording.begin_seconds = plan
                .trim_seconds
                .map_or(0.0, |trim| (end_seconds - trim).max(0.0));
        }
        busy.lock().await.remove(&device_id);

        match &phase {
            Phase::Failed(code, detail) => {
                warn!(capture_id, code = ?code, %detail, "Simulated capture failed");
            }
            _ => info!(capture_id, end_seconds, stopped, "Simulated capture finished"),
        }
        record.phase.send_replace(phase);
    }

    async fn export_target(&self, capture_id: u64) -> Result<Arc<CaptureRecord>, Status> {
        let record = self.capture(capture_id).await?;
        record.ensure_finished()?;
        Ok(record)
    }
}

fn protocol_settings(
    raw: HashMap<String, proto::AnalyzerSettingValue>,
) -> Result<AnalyzerSettings, Status> {
    raw.into_iter()
        .map(|(key, value)| {
            let value = value
                .to_domain()
                .ok_or_else(|| invalid(format!("setting '{key}' has no value")))?;
            Ok((key, value))
        })
        .collect()
}

fn high_level_settings(
    raw: HashMap<String, proto::HighLevelAnalyzerSettingValue>,
) -> Result<HighLevelAnalyzerSettings, Status> {
    raw.into_iter()
        .map(|(key, value)| {
            let value = value
                .to_domain()
                .ok_or_else(|| invalid(format!("setting '{key}' has no value")))?;
            Ok((key, value))
        })
        .collect()
}

fn non_empty_label(label: String) -> Option<String> {
    (!label.is_empty()).then_some(label)
}

fn radix_or_default(raw: i32) -> RadixType {
    let radix: Option<RadixType> = raw.to_domain();
    radix.unwrap_or(RadixType::Hexadecimal)
}

fn require_path(raw: &str, what: &str, code: ErrorCode) -> Result<PathBuf, Status> {
    if raw.is_empty() {
        return Err(abort_status(code, format!("{what} must not be empty")));
    }
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(abort_status(code, format!("{what} must be absolute, got {raw}")));
    }
    Ok(path.to_path_buf())
}

#[tonic::async_trait]
impl ManagerService for SimulatedLogic2 {
    async fn get_app_info(
        &self,
        _request: Request<proto::GetAppInfoRequest>,
    ) -> RpcResult<proto::GetAppInfoReply> {
        Ok(Response::new(proto::GetAppInfoReply {
            app_info: Some(proto::AppInfo {
                api_version: Some(self.options.api_version.into()),
                application_version: self.options.app_version.clone(),
                launch_pid: self.options.app_pid,
            }),
        }))
    }

    async fn get_devices(
        &self,
        request: Request<proto::GetDevicesRequest>,
    ) -> RpcResult<proto::GetDevicesReply> {
        let include_simulation = request.into_inner().include_simulation_devices;
        let devices = self
            .options
            .devices
            .iter()
            .filter(|d| include_simulation || !d.is_simulation)
            .map(Into::into)
            .collect();
        Ok(Response::new(proto::GetDevicesReply { devices }))
    }

    async fn start_capture(
        &self,
        request: Request<proto::StartCaptureRequest>,
    ) -> RpcResult<proto::StartCaptureReply> {
        let req = request.into_inner();
        let device = self.find_device(&req.device_id)?.clone();
        let capabilities = Capabilities::of(device.device_type).ok_or_else(|| {
            abort_status(
                ErrorCode::DeviceError,
                format!("{} is not supported", device.device_type),
            )
        })?;

        let proto::start_capture_request::DeviceConfiguration::LogicDeviceConfiguration(raw_device) =
            req.device_configuration
                .ok_or_else(|| invalid("device configuration is required"))?;
        let device_config: LogicDeviceConfiguration = raw_device.to_domain();
        let capture_config = CaptureConfiguration::try_from(
            req.capture_configuration
                .ok_or_else(|| invalid("capture configuration is required"))?,
        )
        .map_err(invalid)?;

        capabilities.validate(&device_config)?;
        validate_capture_mode(&capture_config, &device_config)?;

        let recording = Recording {
            device_type: device.device_type,
            digital_channels: device_config.enabled_digital_channels.clone(),
            analog_channels: device_config.enabled_analog_channels.clone(),
            digital_sample_rate: if device_config.enabled_digital_channels.is_empty() {
                0
            } else {
                device_config.digital_sample_rate.unwrap_or(0)
            },
            analog_sample_rate: if device_config.enabled_analog_channels.is_empty() {
                0
            } else {
                device_config.analog_sample_rate.unwrap_or(0)
            },
            glitch_filters: device_config.glitch_filters.clone(),
            begin_seconds: 0.0,
            end_seconds: 0.0,
            started_at: Utc::now(),
        };
        let plan = plan_acquisition(&capabilities, &device_config, &capture_config, &recording);

        let capture_id;
        {
            let mut busy = self.busy.lock().await;
            if let Some(active) = busy.get(&device.device_id) {
                return Err(abort_status(
                    ErrorCode::DeviceError,
                    format!(
                        "device {} is busy with capture {active}; stop or close it first",
                        device.device_id
                    ),
                ));
            }
            capture_id = self.allocate_id();
            busy.insert(device.device_id.clone(), capture_id);
        }

        let manual = matches!(capture_config.capture_mode, CaptureMode::Manual(_));
        let data = CaptureData {
            recording,
            analyzers: Vec::new(),
        };
        let info = data.info(capture_id);
        let record = Arc::new(CaptureRecord::new(manual, Phase::Running, data));
        self.captures
            .write()
            .await
            .insert(capture_id, Arc::clone(&record));

        info!(
            capture_id,
            device_id = %device.device_id,
            mode = ?capture_config.capture_mode,
            "Simulated capture started"
        );
        tokio::spawn(Self::acquire(
            record,
            plan,
            Arc::clone(&self.busy),
            device.device_id,
            capture_id,
        ));

        Ok(Response::new(proto::StartCaptureReply {
            capture_info: Some(info),
        }))
    }

    async fn stop_capture(
        &self,
        request: Request<proto::StopCaptureRequest>,
    ) -> RpcResult<proto::StopCaptureReply> {
        let record = self.capture(request.into_inner().capture_id).await?;
        record.halt().await.into_result()?;
        Ok(Response::new(proto::StopCaptureReply {}))
    }

    async fn wait_capture(
        &self,
        request: Request<proto::WaitCaptureRequest>,
    ) -> RpcResult<proto::WaitCaptureReply> {
        let capture_id = request.into_inner().capture_id;
        let record = self.capture(capture_id).await?;
        if record.manual {
            return Err(invalid(format!(
                "capture {capture_id} uses manual capture mode and never finishes on its own; stop it instead"
            )));
        }
        record.finished().await.into_result()?;
        Ok(Response::new(proto::WaitCaptureReply {}))
    }

    async fn load_capture(
        &self,
        request: Request<proto::LoadCaptureRequest>,
    ) -> RpcResult<proto::LoadCaptureReply> {
        let path = require_path(
            &request.into_inner().filepath,
            "filepath",
            ErrorCode::LoadCaptureFailed,
        )?;
        let file = CaptureFile::load(&path)?;

        let ids: HashMap<u64, u64> = file
            .analyzers
            .iter()
            .map(|a| (a.id, self.allocate_id()))
            .collect();
        let analyzers = file
            .analyzers
            .into_iter()
            .map(|mut analyzer| {
                analyzer.id = ids[&analyzer.id];
                if let AnalyzerKind::HighLevel { input, .. } = &mut analyzer.kind {
                    *input = ids.get(input).copied().ok_or_else(|| {
                        abort_status(
                            ErrorCode::LoadCaptureFailed,
                            format!("high-level analyzer '{}' has no input analyzer", analyzer.name),
                        )
                    })?;
                }
                Ok(analyzer)
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let capture_id = self.allocate_id();
        let data = CaptureData {
            recording: file.recording,
            analyzers,
        };
        let info = data.info(capture_id);
        self.captures.write().await.insert(
            capture_id,
            Arc::new(CaptureRecord::new(false, Phase::Completed, data)),
        );
        info!(capture_id, path = %path.display(), "Capture loaded");
        Ok(Response::new(proto::LoadCaptureReply {
            capture_info: Some(info),
        }))
    }

    async fn save_capture(
        &self,
        request: Request<proto::SaveCaptureRequest>,
    ) -> RpcResult<proto::SaveCaptureReply> {
        let req = request.into_inner();
        let path = require_path(&req.filepath, "filepath", ErrorCode::InvalidRequest)?;
        let record = self.export_target(req.capture_id).await?;
        let data = record.data.lock().await;
        CaptureFile::new(data.recording.clone(), data.analyzers.clone()).save(&path)?;
        debug!(capture_id = req.capture_id, path = %path.display(), "Capture saved");
        Ok(Response::new(proto::SaveCaptureReply {}))
    }

    async fn close_capture(
        &self,
        request: Request<proto::CloseCaptureRequest>,
    ) -> RpcResult<proto::CloseCaptureReply> {
        let capture_id = request.into_inner().capture_id;
        let record = self.capture(capture_id).await?;
        // Failures no longer matter once the capture is released.
        let _ = record.halt().await;
        self.captures.write().await.remove(&capture_id);
        debug!(capture_id, "Capture closed");
        Ok(Response::new(proto::CloseCaptureReply {}))
    }

    async fn add_analyzer(
        &self,
        request: Request<proto::AddAnalyzerRequest>,
    ) -> RpcResult<proto::AddAnalyzerReply> {
        let req = request.into_inner();
        let record = self.export_target(req.capture_id).await?;
        let spec = AnalyzerSpec::lookup(&req.analyzer_name)
            .ok_or_else(|| invalid(format!("unknown analyzer '{}'", req.analyzer_name)))?;
        let settings = protocol_settings(req.settings)?;

        let mut data = record.data.lock().await;
        spec.validate(&settings, &data.recording.digital_channels)?;

        let analyzer_id = self.allocate_id();
        data.analyzers.push(StoredAnalyzer {
            id: analyzer_id,
            name: req.analyzer_name,
            label: non_empty_label(req.analyzer_label),
            kind: AnalyzerKind::Protocol { settings },
        });
        debug!(capture_id = req.capture_id, analyzer_id, "Analyzer added");
        Ok(Response::new(proto::AddAnalyzerReply { analyzer_id }))
    }

    async fn remove_analyzer(
        &self,
        request: Request<proto::RemoveAnalyzerRequest>,
    ) -> RpcResult<proto::RemoveAnalyzerReply> {
        let req = request.into_inner();
        let record = self.export_target(req.capture_id).await?;
        let mut data = record.data.lock().await;
        if data.analyzer(req.analyzer_id)?.is_high_level() {
            return Err(invalid(format!(
                "analyzer {} is a high-level analyzer",
                req.analyzer_id
            )));
        }
        let feeds_hla = data.analyzers.iter().any(|a| {
            matches!(a.kind, AnalyzerKind::HighLevel { input, .. } if input == req.analyzer_id)
        });
        if feeds_hla {
            return Err(invalid(format!(
                "analyzer {} feeds a high-level analyzer; remove that first",
                req.analyzer_id
            )));
        }
        data.analyzers.retain(|a| a.id != req.analyzer_id);
        Ok(Response::new(proto::RemoveAnalyzerReply {}))
    }

    async fn add_high_level_analyzer(
        &self,
        request: Request<proto::AddHighLevelAnalyzerRequest>,
    ) -> RpcResult<proto::AddHighLevelAnalyzerReply> {
        let req = request.into_inner();
        let record = self.export_target(req.capture_id).await?;
        let extension_directory = require_path(
            &req.extension_directory,
            "extension_directory",
            ErrorCode::InvalidRequest,
        )?;
        check_extension(&extension_directory, &req.hla_name)?;
        let settings = high_level_settings(req.settings)?;

        let mut data = record.data.lock().await;
        if data.analyzer(req.input_analyzer_id)?.is_high_level() {
            return Err(invalid("the input of a high-level analyzer must be a protocol analyzer"));
        }

        let analyzer_id = self.allocate_id();
        data.analyzers.push(StoredAnalyzer {
            id: analyzer_id,
            name: req.hla_name,
            label: non_empty_label(req.hla_label),
            kind: AnalyzerKind::HighLevel {
                extension_directory,
                input: req.input_analyzer_id,
                settings,
            },
        });
        debug!(capture_id = req.capture_id, analyzer_id, "High-level analyzer added");
        Ok(Response::new(proto::AddHighLevelAnalyzerReply { analyzer_id }))
    }

    async fn remove_high_level_analyzer(
        &self,
        request: Request<proto::RemoveHighLevelAnalyzerRequest>,
    ) -> RpcResult<proto::RemoveHighLevelAnalyzerReply> {
        let req = request.into_inner();
        let record = self.export_target(req.capture_id).await?;
        let mut data = record.data.lock().await;
        if !data.analyzer(req.analyzer_id)?.is_high_level() {
            return Err(invalid(format!(
                "analyzer {} is not a high-level analyzer",
                req.analyzer_id
            )));
        }
        data.analyzers.retain(|a| a.id != req.analyzer_id);
        Ok(Response::new(proto::RemoveHighLevelAnalyzerReply {}))
    }

    async fn export_raw_data_csv(
        &self,
        request: Request<proto::ExportRawDataCsvRequest>,
    ) -> RpcResult<proto::ExportRawDataCsvReply> {
        let req = request.into_inner();
        let directory = require_path(&req.directory, "directory", ErrorCode::ExportFailed)?;
        let record = self.export_target(req.capture_id).await?;
        let data = record.data.lock().await;
        let requested: ChannelSet = req.logic_channels.unwrap_or_default().to_domain();
        let channels = export::resolve_channels(&requested, &data.recording.channels())?;
        export::write_raw_csv(
            &data.recording,
            &directory,
            &channels,
            req.analog_downsample_ratio.max(1),
            req.iso8601_timestamp,
        )?;
        debug!(capture_id = req.capture_id, directory = %directory.display(), "Raw CSV written");
        Ok(Response::new(proto::ExportRawDataCsvReply {}))
    }

    async fn export_raw_data_binary(
        &self,
        request: Request<proto::ExportRawDataBinaryRequest>,
    ) -> RpcResult<proto::ExportRawDataBinaryReply> {
        let req = request.into_inner();
        let directory = require_path(&req.directory, "directory", ErrorCode::ExportFailed)?;
        let record = self.export_target(req.capture_id).await?;
        let data = record.data.lock().await;
        let requested: ChannelSet = req.logic_channels.unwrap_or_default().to_domain();
        let channels = export::resolve_channels(&requested, &data.recording.channels())?;
        export::write_raw_binary(
            &data.recording,
            &directory,
            &channels,
            req.analog_downsample_ratio.max(1),
        )?;
        debug!(capture_id = req.capture_id, directory = %directory.display(), "Raw binary written");
        Ok(Response::new(proto::ExportRawDataBinaryReply {}))
    }

    async fn export_data_table_csv(
        &self,
        request: Request<proto::ExportDataTableCsvRequest>,
    ) -> RpcResult<proto::ExportDataTableCsvReply> {
        let req = request.into_inner();
        let path = require_path(&req.filepath, "filepath", ErrorCode::ExportFailed)?;
        let record = self.export_target(req.capture_id).await?;
        if req.analyzers.is_empty() {
            return Err(abort_status(
                ErrorCode::ExportFailed,
                "no analyzers selected for the data table",
            ));
        }

        let data = record.data.lock().await;
        let sources = req
            .analyzers
            .iter()
            .map(|selected| {
                let analyzer = data.analyzer(selected.analyzer_id).map_err(|_| {
                    abort_status(
                        ErrorCode::ExportFailed,
                        format!("analyzer {} does not exist", selected.analyzer_id),
                    )
                })?;
                Ok(TableSource {
                    name: analyzer.label.clone().unwrap_or_else(|| analyzer.name.clone()),
                    radix: radix_or_default(selected.radix_type),
                    frames: data.frames(analyzer)?,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        let filter = req.filter.map(|f| DataTableFilter {
            columns: f.columns,
            query: f.query,
        });
        export::write_data_table(
            &path,
            &data.recording,
            &sources,
            &req.export_columns,
            filter.as_ref(),
            req.iso8601_timestamp,
        )?;
        debug!(capture_id = req.capture_id, path = %path.display(), "Data table written");
        Ok(Response::new(proto::ExportDataTableCsvReply {}))
    }

    async fn legacy_export_analyzer(
        &self,
        request: Request<proto::LegacyExportAnalyzerRequest>,
    ) -> RpcResult<proto::LegacyExportAnalyzerReply> {
        let req = request.into_inner();
        let path = require_path(&req.filepath, "filepath", ErrorCode::ExportFailed)?;
        let record = self.export_target(req.capture_id).await?;
        let data = record.data.lock().await;
        let analyzer = data.analyzer(req.analyzer_id).map_err(|_| {
            abort_status(
                ErrorCode::ExportFailed,
                format!("analyzer {} does not exist", req.analyzer_id),
            )
        })?;
        if analyzer.is_high_level() {
            return Err(abort_status(
                ErrorCode::ExportFailed,
                "high-level analyzers have no legacy exporter",
            ));
        }
        let frames = data.frames(analyzer)?;
        export::write_legacy(&path, &data.recording, &frames, radix_or_default(req.radix_type))?;
        Ok(Response::new(proto::LegacyExportAnalyzerReply {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceType, DigitalTriggerCaptureMode, DigitalTriggerType, TimedCaptureMode};

    fn recording_for(config: &LogicDeviceConfiguration) -> Recording {
        Recording {
            device_type: DeviceType::Logic8,
            digital_channels: config.enabled_digital_channels.clone(),
            analog_channels: config.enabled_analog_channels.clone(),
            digital_sample_rate: config.digital_sample_rate.unwrap_or(0),
            analog_sample_rate: config.analog_sample_rate.unwrap_or(0),
            glitch_filters: vec![],
            begin_seconds: 0.0,
            end_seconds: 0.0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn timed_plan_within_limits() {
        let caps = Capabilities::of(DeviceType::Logic8).unwrap();
        let device = LogicDeviceConfiguration::digital(0..8, 10_000_000);
        let config = CaptureConfiguration::timed(0.5);
        let plan = plan_acquisition(&caps, &device, &config, &recording_for(&device));
        assert_eq!(plan.end_seconds, Some(0.5));
        assert!(plan.failure.is_none());
    }

    #[test]
    fn starvation_is_planned() {
        let caps = Capabilities::of(DeviceType::Logic8).unwrap();
        let device = LogicDeviceConfiguration::digital(0..8, 100_000_000);
        let config = CaptureConfiguration::timed(1.0);
        let plan = plan_acquisition(&caps, &device, &config, &recording_for(&device));
        let (_, code, _) = plan.failure.unwrap();
        assert_eq!(code, ErrorCode::CaptureFailed);
    }

    #[test]
    fn small_buffer_runs_out_of_memory() {
        let caps = Capabilities::of(DeviceType::Logic8).unwrap();
        let device = LogicDeviceConfiguration::default().with_analog(0..8, 10_000_000);
        let config = CaptureConfiguration::timed(1.0).with_buffer_size(1);
        let plan = plan_acquisition(&caps, &device, &config, &recording_for(&device));
        let (at, code, _) = plan.failure.unwrap();
        assert_eq!(code, ErrorCode::OutOfMemory);
        assert!(at < 0.01);
    }

    #[test]
    fn trigger_sets_the_end() {
        let caps = Capabilities::of(DeviceType::Logic8).unwrap();
        let device = LogicDeviceConfiguration::digital([0, 1], 10_000_000);
        let mut trigger = DigitalTriggerCaptureMode::new(DigitalTriggerType::Rising, 0);
        trigger.after_trigger_seconds = Some(0.1);
        let config = CaptureConfiguration::new(CaptureMode::DigitalTrigger(trigger));
        let plan = plan_acquisition(&caps, &device, &config, &recording_for(&device));
        let end = plan.end_seconds.unwrap();
        assert!((end - (50e-6 + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn capture_mode_checks() {
        let device = LogicDeviceConfiguration::digital([0, 1], 10_000_000);
        let zero = CaptureConfiguration::new(CaptureMode::Timed(TimedCaptureMode::new(0.0)));
        assert!(validate_capture_mode(&zero, &device).is_err());

        let off_channel = CaptureConfiguration::new(CaptureMode::DigitalTrigger(
            DigitalTriggerCaptureMode::new(DigitalTriggerType::Falling, 5),
        ));
        assert!(validate_capture_mode(&off_channel, &device).is_err());

        let mut pulse = DigitalTriggerCaptureMode::new(DigitalTriggerType::PulseHigh, 0);
        pulse.min_pulse_width_seconds = Some(2e-6);
        pulse.max_pulse_width_seconds = Some(1e-6);
        let inverted = CaptureConfiguration::new(CaptureMode::DigitalTrigger(pulse));
        assert!(validate_capture_mode(&inverted, &device).is_err());
    }
}
