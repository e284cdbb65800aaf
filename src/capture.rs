//! A started or loaded capture.
//!
//! ```text
//! Running ──wait()/stop()──▶ Stopped ──close()──▶ Closed
//!    │                                      ▲
//!    └──capture error──▶ Failed ──close()───┘
//! Loaded ──────────────────────close()──────▶ Closed
//! ```
//!
//! Analyzer, export and save operations require a finished capture (`Stopped` or
//! `Loaded`). A capture-kind error from `wait()` or `stop()` (see
//! [`AutomationError::requires_new_capture`]) moves the capture to `Failed`; the only
//! useful call left is `close()`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::convert::{radix_to_wire, ToDomain};
use crate::error::{AutomationError, Result};
use crate::manager::{absolute_path, rpc_error, Session};
use crate::models::{
    AnalyzerHandle, AnalyzerInfo, AnalyzerSettings, ChannelSet, DataTableExportConfiguration,
    DataTableExportOptions, HighLevelAnalyzerSettings, RadixType, RawBinaryExportOptions,
    RawCsvExportOptions,
};
use crate::proto;

/// Lifecycle state of a [`Capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    /// Acquisition in progress
    Running,
    /// Acquisition finished (stop condition reached or stopped)
    Stopped,
    /// Opened from a capture file
    Loaded,
    /// Acquisition failed; close and start a new capture
    Failed,
    /// Released on the backend
    Closed,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Stops a running capture from another task.
///
/// Obtained from [`Capture::stopper`] so that one task can sit in
/// [`Capture::wait`] while another decides when to end acquisition.
#[derive(Clone)]
pub struct CaptureStopper {
    capture_id: u64,
    session: Arc<Session>,
}

impl std::fmt::Debug for CaptureStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStopper")
            .field("capture_id", &self.capture_id)
            .finish_non_exhaustive()
    }
}

impl CaptureStopper {
    /// Ask the backend to stop the capture. A pending `wait()` then returns.
    pub async fn stop(&self) -> Result<()> {
        stop_capture(&self.session, self.capture_id).await
    }
}

async fn stop_capture(session: &Session, capture_id: u64) -> Result<()> {
    let mut client = session.client().await?;
    client
        .stop_capture(proto::StopCaptureRequest { capture_id })
        .await
        .map_err(|s| rpc_error("StopCapture", s))?;
    Ok(())
}

/// Handle to one capture held by the backend.
pub struct Capture {
    id: u64,
    session: Arc<Session>,
    state: CaptureState,
    channels: ChannelSet,
    analyzers: Vec<AnalyzerInfo>,
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("channels", &self.channels)
            .field("analyzers", &self.analyzers)
            .finish_non_exhaustive()
    }
}

impl Capture {
    pub(crate) fn new(session: Arc<Session>, info: proto::CaptureInfo, state: CaptureState) -> Self {
        Self {
            id: info.capture_id,
            session,
            state,
            channels: info.logic_channels.unwrap_or_default().to_domain(),
            analyzers: info.analyzers.into_iter().map(ToDomain::to_domain).collect(),
        }
    }

    /// Backend capture id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Channels recorded by this capture.
    #[must_use]
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Analyzers currently attached.
    #[must_use]
    pub fn analyzers(&self) -> &[AnalyzerInfo] {
        &self.analyzers
    }

    /// Handle that can stop this capture from another task.
    #[must_use]
    pub fn stopper(&self) -> CaptureStopper {
        CaptureStopper {
            capture_id: self.id,
            session: Arc::clone(&self.session),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            CaptureState::Closed => Err(AutomationError::CaptureClosed(self.id)),
            CaptureState::Failed => Err(AutomationError::InvalidState(format!(
                "capture {} failed; close it and start a new capture",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state != CaptureState::Running {
            return Err(AutomationError::InvalidState(format!(
                "capture {} is {}, not running",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn ensure_finished(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state == CaptureState::Running {
            return Err(AutomationError::InvalidState(format!(
                "capture {} is still running; call wait() or stop() first",
                self.id
            )));
        }
        Ok(())
    }

    fn settle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = CaptureState::Stopped;
                Ok(())
            }
            Err(err) => {
                if err.requires_new_capture() {
                    warn!(capture_id = self.id, error = %err, "Capture failed");
                    self.state = CaptureState::Failed;
                }
                Err(err)
            }
        }
    }

    async fn wait_capture(session: &Session, capture_id: u64) -> Result<()> {
        let mut client = session.client().await?;
        client
            .wait_capture(proto::WaitCaptureRequest { capture_id })
            .await
            .map_err(|s| rpc_error("WaitCapture", s))?;
        Ok(())
    }

    /// Block until the capture's stop condition is reached.
    ///
    /// Manual captures never finish on their own and are rejected by the backend with
    /// an invalid-request error; use [`Capture::stop`] or a [`CaptureStopper`].
    /// Dropping the returned future cancels the wait without affecting the capture.
    #[instrument(skip(self), fields(capture_id = self.id))]
    pub async fn wait(&mut self) -> Result<()> {
        self.ensure_running()?;
        let result = Self::wait_capture(&self.session, self.id).await;
        self.settle(result)
    }

    /// Like [`Capture::wait`], but give up when `cancel` completes first.
    ///
    /// On cancellation the capture stays `Running` and
    /// [`AutomationError::Cancelled`] is returned.
    #[instrument(skip(self, cancel), fields(capture_id = self.id))]
    pub async fn wait_or_cancel<F>(&mut self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.ensure_running()?;
        let result = tokio::select! {
            result = Self::wait_capture(&self.session, self.id) => result,
            () = cancel => {
                debug!("Wait cancelled by caller");
                return Err(AutomationError::Cancelled);
            }
        };
        self.settle(result)
    }

    /// Stop acquisition; the backend keeps what was recorded so far.
    #[instrument(skip(self), fields(capture_id = self.id))]
    pub async fn stop(&mut self) -> Result<()> {
        self.ensure_running()?;
        let result = stop_capture(&self.session, self.id).await;
        self.settle(result)
    }

    /// Attach a protocol analyzer.
    ///
    /// `name` is the analyzer name shown in Logic 2 (e.g. `"SPI"`); `settings` use the
    /// exact setting names from the analyzer's settings dialog. A label already used by
    /// another analyzer on this capture is rejected.
    #[instrument(skip(self, settings), fields(capture_id = self.id))]
    pub async fn add_analyzer(
        &mut self,
        name: &str,
        label: Option<&str>,
        settings: &AnalyzerSettings,
    ) -> Result<AnalyzerHandle> {
        self.ensure_finished()?;
        self.check_label(label)?;

        let mut client = self.session.client().await?;
        let reply = client
            .add_analyzer(proto::AddAnalyzerRequest {
                capture_id: self.id,
                analyzer_name: name.to_string(),
                analyzer_label: label.unwrap_or_default().to_string(),
                settings: settings
                    .iter()
                    .map(|(key, value)| (key.clone(), value.into()))
                    .collect(),
            })
            .await
            .map_err(|s| rpc_error("AddAnalyzer", s))?
            .into_inner();

        let handle = AnalyzerHandle {
            analyzer_id: reply.analyzer_id,
        };
        self.analyzers.push(AnalyzerInfo {
            handle,
            name: name.to_string(),
            label: label.map(str::to_string),
            high_level: false,
        });
        debug!(analyzer_id = handle.analyzer_id, "Analyzer added");
        Ok(handle)
    }

    /// Detach an analyzer added with [`Capture::add_analyzer`].
    #[instrument(skip(self), fields(capture_id = self.id))]
    pub async fn remove_analyzer(&mut self, analyzer: AnalyzerHandle) -> Result<()> {
        self.ensure_finished()?;
        self.find_analyzer(analyzer, false)?;

        let mut client = self.session.client().await?;
        client
            .remove_analyzer(proto::RemoveAnalyzerRequest {
                capture_id: self.id,
                analyzer_id: analyzer.analyzer_id,
            })
            .await
            .map_err(|s| rpc_error("RemoveAnalyzer", s))?;

        self.analyzers.retain(|a| a.handle != analyzer);
        Ok(())
    }

    /// Attach a high-level analyzer from an extension directory.
    ///
    /// The extension's `extension.json` must declare `name`; `input_analyzer` is the
    /// analyzer whose frames feed it.
    #[instrument(skip(self, extension_directory, settings), fields(capture_id = self.id))]
    pub async fn add_high_level_analyzer(
        &mut self,
        extension_directory: impl AsRef<Path>,
        name: &str,
        input_analyzer: AnalyzerHandle,
        label: Option<&str>,
        settings: &HighLevelAnalyzerSettings,
    ) -> Result<AnalyzerHandle> {
        self.ensure_finished()?;
        self.check_label(label)?;

        let mut client = self.session.client().await?;
        let reply = client
            .add_high_level_analyzer(proto::AddHighLevelAnalyzerRequest {
                capture_id: self.id,
                extension_directory: absolute_path(extension_directory.as_ref())?,
                hla_name: name.to_string(),
                hla_label: label.unwrap_or_default().to_string(),
                input_analyzer_id: input_analyzer.analyzer_id,
                settings: settings
                    .iter()
                    .map(|(key, value)| (key.clone(), value.into()))
                    .collect(),
            })
            .await
            .map_err(|s| rpc_error("AddHighLevelAnalyzer", s))?
            .into_inner();

        let handle = AnalyzerHandle {
            analyzer_id: reply.analyzer_id,
        };
        self.analyzers.push(AnalyzerInfo {
            handle,
            name: name.to_string(),
            label: label.map(str::to_string),
            high_level: true,
        });
        Ok(handle)
    }

    /// Detach a high-level analyzer.
    #[instrument(skip(self), fields(capture_id = self.id))]
    pub async fn remove_high_level_analyzer(&mut self, analyzer: AnalyzerHandle) -> Result<()> {
        self.ensure_finished()?;
        self.find_analyzer(analyzer, true)?;

        let mut client = self.session.client().await?;
        client
            .remove_high_level_analyzer(proto::RemoveHighLevelAnalyzerRequest {
                capture_id: self.id,
                analyzer_id: analyzer.analyzer_id,
            })
            .await
            .map_err(|s| rpc_error("RemoveHighLevelAnalyzer", s))?;

        self.analyzers.retain(|a| a.handle != analyzer);
        Ok(())
    }

    fn check_label(&self, label: Option<&str>) -> Result<()> {
        let Some(label) = label else {
            return Ok(());
        };
        if self
            .analyzers
            .iter()
            .any(|a| a.label.as_deref() == Some(label))
        {
            return Err(AutomationError::InvalidRequest(format!(
                "an analyzer labelled '{label}' already exists on capture {}",
                self.id
            )));
        }
        Ok(())
    }

    fn find_analyzer(&self, analyzer: AnalyzerHandle, high_level: bool) -> Result<&AnalyzerInfo> {
        self.analyzers
            .iter()
            .find(|a| a.handle == analyzer && a.high_level == high_level)
            .ok_or_else(|| {
                AutomationError::InvalidRequest(format!(
                    "{} {} is not attached to capture {}",
                    if high_level { "high-level analyzer" } else { "analyzer" },
                    analyzer.analyzer_id,
                    self.id
                ))
            })
    }

    /// Write the decoded frames of `analyzers` to a CSV file.
    #[instrument(skip(self, filepath, analyzers, options), fields(capture_id = self.id))]
    pub async fn export_data_table(
        &mut self,
        filepath: impl AsRef<Path>,
        analyzers: &[DataTableExportConfiguration],
        options: &DataTableExportOptions,
    ) -> Result<()> {
        self.ensure_finished()?;
        let mut client = self.session.client().await?;
        client
            .export_data_table_csv(proto::ExportDataTableCsvRequest {
                capture_id: self.id,
                filepath: absolute_path(filepath.as_ref())?,
                analyzers: analyzers.iter().map(Into::into).collect(),
                iso8601_timestamp: options.iso8601_timestamp,
                export_columns: options.columns.clone(),
                filter: options.filter.as_ref().map(Into::into),
            })
            .await
            .map_err(|s| rpc_error("ExportDataTableCsv", s))?;
        Ok(())
    }

    /// Export raw samples as `digital.csv` / `analog.csv` inside `directory`.
    ///
    /// The directory is created if needed. An empty channel selection exports every
    /// channel of the capture.
    #[instrument(skip(self, directory, options), fields(capture_id = self.id))]
    pub async fn export_raw_data_csv(
        &mut self,
        directory: impl AsRef<Path>,
        options: &RawCsvExportOptions,
    ) -> Result<()> {
        self.ensure_finished()?;
        let mut client = self.session.client().await?;
        client
            .export_raw_data_csv(proto::ExportRawDataCsvRequest {
                capture_id: self.id,
                directory: absolute_path(directory.as_ref())?,
                logic_channels: Some((&options.channels).into()),
                analog_downsample_ratio: options.analog_downsample_ratio,
                iso8601_timestamp: options.iso8601_timestamp,
            })
            .await
            .map_err(|s| rpc_error("ExportRawDataCsv", s))?;
        info!(directory = %directory.as_ref().display(), "Exported raw CSV");
        Ok(())
    }

    /// Export raw samples as `digital_<n>.bin` / `analog_<n>.bin` inside `directory`.
    #[instrument(skip(self, directory, options), fields(capture_id = self.id))]
    pub async fn export_raw_data_binary(
        &mut self,
        directory: impl AsRef<Path>,
        options: &RawBinaryExportOptions,
    ) -> Result<()> {
        self.ensure_finished()?;
        let mut client = self.session.client().await?;
        client
            .export_raw_data_binary(proto::ExportRawDataBinaryRequest {
                capture_id: self.id,
                directory: absolute_path(directory.as_ref())?,
                logic_channels: Some((&options.channels).into()),
                analog_downsample_ratio: options.analog_downsample_ratio,
            })
            .await
            .map_err(|s| rpc_error("ExportRawDataBinary", s))?;
        info!(directory = %directory.as_ref().display(), "Exported raw binary");
        Ok(())
    }

    /// Export one analyzer through its legacy per-analyzer exporter.
    #[instrument(skip(self, filepath), fields(capture_id = self.id))]
    pub async fn legacy_export_analyzer(
        &mut self,
        filepath: impl AsRef<Path>,
        analyzer: AnalyzerHandle,
        radix: RadixType,
    ) -> Result<()> {
        self.ensure_finished()?;
        let mut client = self.session.client().await?;
        client
            .legacy_export_analyzer(proto::LegacyExportAnalyzerRequest {
                capture_id: self.id,
                filepath: absolute_path(filepath.as_ref())?,
                analyzer_id: analyzer.analyzer_id,
                radix_type: radix_to_wire(Some(radix)),
            })
            .await
            .map_err(|s| rpc_error("LegacyExportAnalyzer", s))?;
        Ok(())
    }

    /// Save the capture (samples and analyzers) for [`Manager::load_capture`](crate::Manager::load_capture).
    #[instrument(skip(self, filepath), fields(capture_id = self.id))]
    pub async fn save_capture(&mut self, filepath: impl AsRef<Path>) -> Result<()> {
        self.ensure_finished()?;
        let mut client = self.session.client().await?;
        client
            .save_capture(proto::SaveCaptureRequest {
                capture_id: self.id,
                filepath: absolute_path(filepath.as_ref())?,
            })
            .await
            .map_err(|s| rpc_error("SaveCapture", s))?;
        info!(filepath = %filepath.as_ref().display(), "Capture saved");
        Ok(())
    }

    /// Release the capture on the backend. Idempotent.
    ///
    /// If the owning manager is already closed there is nothing left to release and the
    /// capture is simply marked closed.
    #[instrument(skip(self), fields(capture_id = self.id))]
    pub async fn close(&mut self) -> Result<()> {
        if self.state == CaptureState::Closed {
            return Ok(());
        }
        let mut client = match self.session.client().await {
            Ok(client) => client,
            Err(AutomationError::ManagerClosed) => {
                self.state = CaptureState::Closed;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        client
            .close_capture(proto::CloseCaptureRequest {
                capture_id: self.id,
            })
            .await
            .map_err(|s| rpc_error("CloseCapture", s))?;
        self.state = CaptureState::Closed;
        debug!("Capture closed");
        Ok(())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if self.state == CaptureState::Closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(capture_id = self.id, "Capture dropped without close() outside a runtime");
            return;
        };
        warn!(capture_id = self.id, state = %self.state, "Capture dropped without close()");
        let session = Arc::clone(&self.session);
        let capture_id = self.id;
        runtime.spawn(async move {
            if let Ok(mut client) = session.client().await {
                if let Err(status) = client
                    .close_capture(proto::CloseCaptureRequest { capture_id })
                    .await
                {
                    debug!(capture_id, error = %status, "Best-effort close failed");
                }
            }
        });
    }
}
