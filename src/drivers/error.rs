use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ChannelId, RunState};

/// Failure to open a source backend. Fatal to `configure`.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("unknown ADC device \"{0}\"")]
    UnknownDevice(String),
    #[error("channel {channel} is not available on ADC \"{adc}\"")]
    UnknownChannel { adc: String, channel: ChannelId },
    #[error("replay file {} not found", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to start acquisition task: {0}")]
    Device(String),
    #[error("I/O error opening {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot reconfigure while a run is active (state {0:?})")]
    AlreadyRunning(RunState),
    #[error("missing source parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid source parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("running average window must be in 1..={max}, got {window_size}")]
    InvalidWindow { window_size: usize, max: usize },
    #[error("invalid excitation: {0}")]
    InvalidExcitation(String),
    #[error(transparent)]
    Open(#[from] OpenError),
}

/// Failure while pulling a frame. Ends the run; cleanup still runs.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("acquisition failed: {0}")]
    Device(String),
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record in {} line {line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("source reported: {0}")]
    Source(String),
    #[error("feed closed by all publishers")]
    FeedClosed,
}

/// Per-frame analysis failure. The accumulator is left as it was.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("frame has no samples")]
    EmptyFrame,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("sample rate must be greater than zero, got {0}")]
    InvalidSampleRate(f64),
    #[error("reference channel {0} is not in the frame")]
    MissingReference(ChannelId),
    #[error("reference channel {0} has zero amplitude")]
    ZeroReference(ChannelId),
    #[error("transfer-function mode requires an excitation")]
    MissingExcitation,
    #[error("excitation frequency {frequency_hz} Hz outside (0, {nyquist_hz}) Hz")]
    ExcitationOutOfBand { frequency_hz: f64, nyquist_hz: f64 },
    #[error("frame rejected as pile-up and no earlier state to show")]
    PileupRejected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("no source configured")]
    NotConfigured,
    #[error("run requested in state {0:?}")]
    InvalidState(RunState),
}
