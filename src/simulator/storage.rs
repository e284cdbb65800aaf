//! Saved capture files.
//!
//! A capture file is JSON holding the recording parameters and the analyzers attached
//! at save time. Samples are regenerated from the recording on load, so files stay
//! small regardless of capture length.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tonic::Status;

use crate::error::abort_status;
use crate::models::{AnalyzerHandle, AnalyzerInfo, AnalyzerSettings, HighLevelAnalyzerSettings};
use crate::proto::ErrorCode;
use crate::simulator::signal::Recording;

/// `format` field of every capture file.
pub const FILE_FORMAT: &str = "logic2-sim-capture";

/// Version written by this build. Files with a higher major version are refused.
pub const FILE_VERSION: FileVersion = FileVersion { major: 1, minor: 0 };

/// Capture file format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Incompatible layout changes
    pub major: u32,
    /// Additive changes
    pub minor: u32,
}

/// What an attached analyzer is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyzerKind {
    /// Built-in protocol analyzer
    Protocol {
        /// Settings it was added with
        settings: AnalyzerSettings,
    },
    /// High-level analyzer fed by another analyzer
    HighLevel {
        /// Extension it was loaded from
        extension_directory: PathBuf,
        /// Id of the input analyzer
        input: u64,
        /// Settings it was added with
        settings: HighLevelAnalyzerSettings,
    },
}

/// An analyzer attached to a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalyzer {
    /// Analyzer id within its capture
    pub id: u64,
    /// Analyzer name
    pub name: String,
    /// User label
    pub label: Option<String>,
    /// Protocol or high-level analyzer
    #[serde(flatten)]
    pub kind: AnalyzerKind,
}

impl StoredAnalyzer {
    /// True for high-level analyzers.
    #[must_use]
    pub fn is_high_level(&self) -> bool {
        matches!(self.kind, AnalyzerKind::HighLevel { .. })
    }

    /// Client-facing description.
    #[must_use]
    pub fn info(&self) -> AnalyzerInfo {
        AnalyzerInfo {
            handle: AnalyzerHandle {
                analyzer_id: self.id,
            },
            name: self.name.clone(),
            label: self.label.clone(),
            high_level: self.is_high_level(),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureFile {
    /// Always [`FILE_FORMAT`]
    pub format: String,
    /// Layout version
    pub version: FileVersion,
    /// Recording parameters and window
    pub recording: Recording,
    /// Attached analyzers
    #[serde(default)]
    pub analyzers: Vec<StoredAnalyzer>,
}

impl CaptureFile {
    /// File contents for a capture.
    #[must_use]
    pub fn new(recording: Recording, analyzers: Vec<StoredAnalyzer>) -> Self {
        Self {
            format: FILE_FORMAT.to_string(),
            version: FILE_VERSION,
            recording,
            analyzers,
        }
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), Status> {
        let failed = |detail: String| abort_status(ErrorCode::ExportFailed, detail);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| failed(format!("cannot create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| abort_status(ErrorCode::InternalException, e))?;
        std::fs::write(path, json).map_err(|e| failed(format!("cannot write {}: {e}", path.display())))
    }

    /// Read and check a capture file.
    pub fn load(path: &Path) -> Result<Self, Status> {
        let failed = |detail: String| abort_status(ErrorCode::LoadCaptureFailed, detail);

        let raw = std::fs::read_to_string(path)
            .map_err(|e| failed(format!("cannot read {}: {e}", path.display())))?;
        let file: Self = serde_json::from_str(&raw)
            .map_err(|e| failed(format!("{} is not a capture file: {e}", path.display())))?;

        if file.format != FILE_FORMAT {
            return Err(failed(format!(
                "{} has format '{}', expected '{FILE_FORMAT}'",
                path.display(),
                file.format
            )));
        }
        if file.version.major > FILE_VERSION.major {
            return Err(failed(format!(
                "{} was saved by a newer version (file format {}.{}, supported {}.{})",
                path.display(),
                file.version.major,
                file.version.minor,
                FILE_VERSION.major,
                FILE_VERSION.minor
            )));
        }
        Ok(file)
    }
}
