//! Error types for the automation client.
//!
//! This module defines [`AutomationError`], the single error type returned by every
//! [`Manager`](crate::Manager) and [`Capture`](crate::Capture) operation. Using the
//! `thiserror` crate, it folds three sources of failure into one closed enum:
//!
//! - **Backend errors**: Logic 2 reports failures as gRPC `ABORTED` statuses whose
//!   message has the form `"<code>: <detail>"`. [`AutomationError::from_status`] decodes
//!   the numeric [`ErrorCode`] into a dedicated variant (`MissingDevice`, `Export`, ...).
//! - **Client-local errors**: connection timeouts, launch failures, version mismatches
//!   and misuse of a closed capture never reach the backend.
//! - **Wrapped errors**: transport, I/O and configuration errors from the crates this
//!   library builds on.
//!
//! Each variant maps to an [`ErrorKind`], the coarse category callers usually branch on.
//! No variant is ever converted into a generic status code; the backend detail string
//! is preserved verbatim.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::models::Version;
use crate::proto::ErrorCode;

/// Result type alias using [`AutomationError`].
pub type Result<T> = std::result::Result<T, AutomationError>;

/// Coarse failure category of an [`AutomationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Launching or connecting to the backend failed.
    Connection,
    /// The device is missing or cannot be configured as requested.
    Device,
    /// Acquisition failed on the backend (for example data starvation).
    Capture,
    /// The backend ran out of capture memory.
    ResourceExhaustion,
    /// An export call failed.
    Export,
    /// A saved capture could not be loaded.
    Load,
    /// The request was malformed or referenced something that does not exist.
    InvalidRequest,
    /// Unclassified backend failure.
    Internal,
    /// The operation is not valid in the current client-side state.
    InvalidState,
    /// The caller cancelled the operation.
    Cancelled,
    /// Local configuration, file system or option error.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connection => "connection",
            Self::Device => "device",
            Self::Capture => "capture",
            Self::ResourceExhaustion => "resource-exhaustion",
            Self::Export => "export",
            Self::Load => "load",
            Self::InvalidRequest => "invalid-request",
            Self::Internal => "internal",
            Self::InvalidState => "invalid-state",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while automating Logic 2.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// The RPC channel did not become ready within the connect timeout.
    #[error("Timed out after {timeout:?} connecting to Logic 2 at {address}")]
    ConnectionTimeout {
        /// Address that was dialled
        address: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// gRPC transport error (invalid endpoint, connection refused, ...).
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The backend process could not be started or exited during startup.
    #[error("Failed to launch Logic 2: {0}")]
    Launch(String),

    /// Another Logic 2 instance answered on the port of the launched process.
    #[error("Logic 2 is already running (launched pid {launched}, connected to pid {connected})")]
    Logic2AlreadyRunning {
        /// Pid of the process this client spawned
        launched: u32,
        /// Pid reported by the backend that answered
        connected: u64,
    },

    /// The backend speaks a different major version of the automation API.
    #[error("Incompatible automation API version: client {client}, server {server}")]
    IncompatibleApiVersion {
        /// API version compiled into this client
        client: Version,
        /// API version reported by the backend
        server: Version,
    },

    /// The requested device is not attached or was not detected.
    #[error("Missing device: {0}")]
    MissingDevice(String),

    /// The device rejected the configuration or failed while recording.
    #[error("Device error: {0}")]
    Device(String),

    /// The backend terminated the capture (for example it could not keep up).
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// The capture buffer filled up and the capture was terminated.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Raw data, data table or legacy analyzer export failed.
    #[error("Export failed: {0}")]
    Export(String),

    /// The capture file is missing, corrupt or from a newer version.
    #[error("Failed to load capture: {0}")]
    LoadCaptureFailed(String),

    /// The request was rejected as malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unexpected failure inside the backend.
    #[error("Internal server error: {0}")]
    InternalServer(String),

    /// The backend error could not be understood (possible version skew).
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// A gRPC status that does not carry a Logic 2 error code.
    #[error("gRPC status error: {0}")]
    Rpc(tonic::Status),

    /// The capture was closed by this client.
    #[error("Capture {0} is closed")]
    CaptureClosed(u64),

    /// The manager owning this capture was closed.
    #[error("Manager is closed")]
    ManagerClosed,

    /// The operation is not valid in the capture's current state.
    #[error("Invalid capture state: {0}")]
    InvalidState(String),

    /// The caller cancelled a pending operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid client options (address, paths, ...).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error while spawning processes or touching files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for AutomationError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<tonic::Status> for AutomationError {
    fn from(status: tonic::Status) -> Self {
        Self::from_status(status)
    }
}

fn error_message_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"(?s)^(\d+): (.*)$").expect("error message pattern is valid"))
}

impl AutomationError {
    /// Decode a gRPC status returned by the backend.
    ///
    /// Only `ABORTED` statuses carry Logic 2 error codes. Any other status code is kept
    /// as [`AutomationError::Rpc`]; an `ABORTED` message that does not match the
    /// `"<code>: <detail>"` shape becomes [`AutomationError::Unknown`].
    #[must_use]
    pub fn from_status(status: tonic::Status) -> Self {
        if status.code() != tonic::Code::Aborted {
            return Self::Rpc(status);
        }

        let message = status.message();
        let Some(captures) = error_message_regex().captures(message) else {
            return Self::Unknown(message.to_string());
        };

        let code = captures[1]
            .parse::<i32>()
            .ok()
            .and_then(|raw| ErrorCode::try_from(raw).ok())
            .unwrap_or(ErrorCode::Unspecified);

        Self::from_code(code, captures[2].to_string())
    }

    /// Build the variant that corresponds to a backend error code.
    #[must_use]
    pub fn from_code(code: ErrorCode, detail: String) -> Self {
        match code {
            ErrorCode::Unspecified => Self::Unknown(detail),
            ErrorCode::InternalException => Self::InternalServer(detail),
            ErrorCode::InvalidRequest => Self::InvalidRequest(detail),
            ErrorCode::LoadCaptureFailed => Self::LoadCaptureFailed(detail),
            ErrorCode::ExportFailed => Self::Export(detail),
            ErrorCode::MissingDevice => Self::MissingDevice(detail),
            ErrorCode::DeviceError => Self::Device(detail),
            ErrorCode::OutOfMemory => Self::OutOfMemory(detail),
            ErrorCode::CaptureFailed => Self::CaptureFailed(detail),
        }
    }

    /// Backend error code carried by this error, if it came from the backend.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Unknown(_) => Some(ErrorCode::Unspecified),
            Self::InternalServer(_) => Some(ErrorCode::InternalException),
            Self::InvalidRequest(_) => Some(ErrorCode::InvalidRequest),
            Self::LoadCaptureFailed(_) => Some(ErrorCode::LoadCaptureFailed),
            Self::Export(_) => Some(ErrorCode::ExportFailed),
            Self::MissingDevice(_) => Some(ErrorCode::MissingDevice),
            Self::Device(_) => Some(ErrorCode::DeviceError),
            Self::OutOfMemory(_) => Some(ErrorCode::OutOfMemory),
            Self::CaptureFailed(_) => Some(ErrorCode::CaptureFailed),
            _ => None,
        }
    }

    /// Failure category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionTimeout { .. }
            | Self::Transport(_)
            | Self::Launch(_)
            | Self::Logic2AlreadyRunning { .. }
            | Self::IncompatibleApiVersion { .. } => ErrorKind::Connection,
            Self::MissingDevice(_) | Self::Device(_) => ErrorKind::Device,
            Self::CaptureFailed(_) => ErrorKind::Capture,
            Self::OutOfMemory(_) => ErrorKind::ResourceExhaustion,
            Self::Export(_) => ErrorKind::Export,
            Self::LoadCaptureFailed(_) => ErrorKind::Load,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InternalServer(_) | Self::Unknown(_) | Self::Rpc(_) => ErrorKind::Internal,
            Self::CaptureClosed(_) | Self::ManagerClosed | Self::InvalidState(_) => {
                ErrorKind::InvalidState
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidConfiguration(_) | Self::Config(_) | Self::Io(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Whether the capture that produced this error should be discarded.
    ///
    /// Capture failures are never resumable: close the capture and start a new one.
    #[must_use]
    pub fn requires_new_capture(&self) -> bool {
        matches!(
            self,
            Self::CaptureFailed(_) | Self::OutOfMemory(_) | Self::Device(_)
        )
    }
}

/// Encode a backend error the way Logic 2 reports it on the wire.
///
/// This is the inverse of [`AutomationError::from_status`] and is used by the
/// simulated backend.
#[must_use]
pub fn abort_status(code: ErrorCode, detail: impl fmt::Display) -> tonic::Status {
    tonic::Status::aborted(format!("{}: {detail}", code as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_error_code() {
        let cases = [
            (ErrorCode::Unspecified, ErrorKind::Internal),
            (ErrorCode::InternalException, ErrorKind::Internal),
            (ErrorCode::InvalidRequest, ErrorKind::InvalidRequest),
            (ErrorCode::LoadCaptureFailed, ErrorKind::Load),
            (ErrorCode::ExportFailed, ErrorKind::Export),
            (ErrorCode::MissingDevice, ErrorKind::Device),
            (ErrorCode::DeviceError, ErrorKind::Device),
            (ErrorCode::OutOfMemory, ErrorKind::ResourceExhaustion),
            (ErrorCode::CaptureFailed, ErrorKind::Capture),
        ];

        for (code, kind) in cases {
            let err = AutomationError::from_status(abort_status(code, "boom"));
            assert_eq!(err.kind(), kind, "code {code:?}");
            assert_eq!(err.code(), Some(code));
            assert!(err.to_string().ends_with("boom"));
        }
    }

    #[test]
    fn keeps_detail_verbatim() {
        let err = AutomationError::from_status(tonic::Status::aborted(
            "21: Analyzer 7 not found: check id",
        ));
        match err {
            AutomationError::Export(detail) => assert_eq!(detail, "Analyzer 7 not found: check id"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn multiline_detail_is_decoded() {
        let err = AutomationError::from_status(tonic::Status::aborted("51: line one\nline two"));
        assert!(matches!(err, AutomationError::Device(ref d) if d == "line one\nline two"));
    }

    #[test]
    fn unparsable_aborted_message_is_unknown() {
        let err = AutomationError::from_status(tonic::Status::aborted("something odd"));
        assert!(matches!(err, AutomationError::Unknown(ref m) if m == "something odd"));
    }

    #[test]
    fn unknown_numeric_code_is_unknown() {
        let err = AutomationError::from_status(tonic::Status::aborted("999: from the future"));
        assert!(matches!(err, AutomationError::Unknown(ref m) if m == "from the future"));
    }

    #[test]
    fn non_aborted_status_is_passed_through() {
        let err = AutomationError::from_status(tonic::Status::unavailable("connection refused"));
        match err {
            AutomationError::Rpc(status) => assert_eq!(status.code(), tonic::Code::Unavailable),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn capture_failures_require_new_capture() {
        assert!(AutomationError::CaptureFailed("starved".into()).requires_new_capture());
        assert!(AutomationError::OutOfMemory("full".into()).requires_new_capture());
        assert!(!AutomationError::Export("bad".into()).requires_new_capture());
        assert!(!AutomationError::CaptureClosed(3).requires_new_capture());
    }

    #[test]
    fn client_local_errors_have_no_code() {
        assert_eq!(AutomationError::ManagerClosed.code(), None);
        assert_eq!(AutomationError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            AutomationError::CaptureClosed(1).kind(),
            ErrorKind::InvalidState
        );
    }
}
