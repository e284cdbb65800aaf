//! # Logic 2 Automation Library
//!
//! This crate drives the Logic 2 logic-analyzer application from Rust. Logic 2 exposes an
//! automation server over a local gRPC channel; this library wraps that channel in a small,
//! strongly typed API for discovering devices, running captures, attaching protocol
//! analyzers, exporting data and saving/loading captures.
//!
//! ## Crate Structure
//!
//! - **`manager`**: [`Manager`], the connection to one Logic 2 instance. Launches the
//!   application or attaches to a running one, negotiates the API version and starts or
//!   loads captures.
//! - **`capture`**: [`Capture`], a started or loaded capture with its state machine
//!   (`Running → Stopped → Closed`, `Loaded → Closed`) and every per-capture operation.
//! - **`models`**: Configuration value objects (device and capture configuration, capture
//!   modes, analyzer settings, export options) and descriptors returned by the backend.
//! - **`error`**: [`AutomationError`] and the decoding of backend error codes.
//! - **`config`**: figment-based configuration for the CLI and [`Manager::from_config`].
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`simulator`**: An in-process backend with three simulation devices, used by the
//!   test suite and the `logic2-sim` binary.
//! - **`proto`** / **`convert`**: Generated protobuf types and their conversions.
//!
//! ## Example
//!
//! ```no_run
//! use logic2_automation::{
//!     CaptureConfiguration, ConnectOptions, LogicDeviceConfiguration, Manager,
//! };
//!
//! # async fn run() -> logic2_automation::Result<()> {
//! let manager = Manager::connect(ConnectOptions::default()).await?;
//! let device = LogicDeviceConfiguration::digital(0..8, 10_000_000);
//! let mut capture = manager
//!     .start_capture(None, &device.into(), &CaptureConfiguration::timed(1.0))
//!     .await?;
//! capture.wait().await?;
//! capture
//!     .export_raw_data_csv("/tmp/out", &Default::default())
//!     .await?;
//! capture.close().await?;
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod convert;
pub mod error;
pub mod logging;
pub mod manager;
pub mod models;
pub mod simulator;

/// Generated protobuf types for the `saleae.automation` package.
#[allow(missing_docs, clippy::all, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("saleae.automation");
}

pub use capture::{Capture, CaptureState, CaptureStopper};
pub use config::AutomationConfig;
pub use error::{AutomationError, ErrorKind, Result};
pub use manager::{ConnectOptions, LaunchOptions, Manager, API_VERSION, DEFAULT_PORT};
pub use models::{
    AnalyzerHandle, AnalyzerInfo, AnalyzerSettingValue, AnalyzerSettings, AppInfo,
    CaptureConfiguration, CaptureMode, ChannelSet, DataTableExportConfiguration,
    DataTableExportOptions, DataTableFilter, DeviceConfiguration, DeviceDesc, DeviceType,
    DigitalTriggerCaptureMode, DigitalTriggerLinkedChannel, DigitalTriggerType,
    GlitchFilterEntry, HighLevelAnalyzerSettingValue, HighLevelAnalyzerSettings,
    LinkedChannelState, LogicDeviceConfiguration, ManualCaptureMode, RadixType,
    RawBinaryExportOptions, RawCsvExportOptions, TimedCaptureMode, Version,
};
