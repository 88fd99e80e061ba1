//! Error taxonomy for every phase of a provisioning job.
//!
//! Each component returns its own error type. [`JobError`] is the job-level
//! view the orchestrator records when a phase fails; cancellation reported by
//! any component collapses into [`JobError::Cancelled`].
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("device probe tool `{tool}` is unavailable: {source}")]
    ToolUnavailable { tool: String, source: io::Error },

    #[error("device probe tool `{tool}` exited with {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("malformed device probe output: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("image catalog unavailable and no fallback images configured: {0}")]
    Unusable(String),

    #[error("invalid catalog URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server answered HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("download truncated: expected {expected} bytes, wrote {written}")]
    Truncated { expected: u64, written: u64 },

    #[error("I/O error while downloading: {0}")]
    Io(#[from] io::Error),

    #[error("download cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => DownloadError::HttpStatus {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            },
            None => DownloadError::Network(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("cannot read file for verification: {0}")]
    Io(#[from] io::Error),

    #[error("`{0}` is not a 32 or 64 character hex digest")]
    InvalidDigest(String),

    #[error("verification cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("loader archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("installer `{0}` not found in the loader archive")]
    ToolMissing(String),

    #[error("installer exited with {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("I/O error while installing the loader: {0}")]
    Io(#[from] io::Error),
}

impl From<zip::result::ZipError> for InstallError {
    fn from(e: zip::result::ZipError) -> Self {
        InstallError::ArchiveCorrupt(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("no `{label}` volume found on {device}")]
    TargetNotFound { device: String, label: String },

    #[error("not enough free space on target: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("I/O error while writing image: {0}")]
    Io(#[from] io::Error),

    #[error("image copy incomplete: expected {expected} bytes, target holds {written}")]
    Incomplete { expected: u64, written: u64 },

    #[error("write cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EjectError {
    #[error("`{tool}` exited with {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error while ejecting: {0}")]
    Io(#[from] io::Error),
}

/// The failure recorded on a provisioning job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Download(DownloadError),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("checksum reference `{reference}` could not be resolved: {reason}")]
    ChecksumUnavailable { reference: String, reason: String },

    #[error(transparent)]
    Verify(VerifyError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Write(WriteError),

    #[error(transparent)]
    Eject(#[from] EjectError),

    #[error("device {0} already has an active provisioning job")]
    DeviceBusy(String),

    #[error("device {0} is not among the scanned removable devices")]
    DeviceNotFound(String),

    #[error("image {0} is not in the catalog")]
    ImageNotFound(String),

    #[error("device selection for {0} is stale; rescan and confirm again")]
    SelectionExpired(String),

    #[error("device {0} changed since it was confirmed; rescan and confirm again")]
    DeviceChanged(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<DownloadError> for JobError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => JobError::Cancelled,
            other => JobError::Download(other),
        }
    }
}

impl From<VerifyError> for JobError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Cancelled => JobError::Cancelled,
            other => JobError::Verify(other),
        }
    }
}

impl From<WriteError> for JobError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Cancelled => JobError::Cancelled,
            other => JobError::Write(other),
        }
    }
}
