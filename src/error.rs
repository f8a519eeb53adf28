use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SleepError>;

#[derive(Debug, Error)]
pub enum SleepError {
    #[error("cannot read recording {path} at byte {offset}: {reason}")]
    RecordingRead {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
    #[error("unsupported recording format: {path}")]
    UnsupportedFormat { path: PathBuf },
    #[error("invalid hypnogram file {path}: {reason}")]
    HypnogramFormat { path: PathBuf, reason: String },
    #[error("invalid stage dictionary:\n  {}", .0.join("\n  "))]
    StateDictInvalid(Vec<String>),
    #[error("detector {method} failed on channel {channel}: {reason}")]
    Detector {
        channel: String,
        method: String,
        reason: String,
    },
    #[error("unknown config key {0}")]
    ConfigKeyUnknown(String),
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },
    #[error("stage value {0} is not in the stage dictionary")]
    UnknownStage(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("xlsx: {0}")]
    Xlsx(String),
    #[error("failed to render figure: {0}")]
    Plot(String),
}

impl SleepError {
    pub fn read(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::RecordingRead {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    pub fn hypno(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::HypnogramFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the session may warn and carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HypnogramFormat { .. }
                | Self::Detector { .. }
                | Self::ConfigKeyUnknown(_)
                | Self::OutOfRange { .. }
        )
    }
}

impl From<calamine::XlsxError> for SleepError {
    fn from(value: calamine::XlsxError) -> Self {
        Self::Xlsx(value.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for SleepError {
    fn from(value: rust_xlsxwriter::XlsxError) -> Self {
        Self::Xlsx(value.to_string())
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for SleepError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        Self::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for SleepError {
    fn from(value: image::ImageError) -> Self {
        Self::Plot(value.to_string())
    }
}
