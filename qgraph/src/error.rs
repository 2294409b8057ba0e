//! Module containing the [`DispatchError`] type returned by the formatting and dispatching
//! pipeline.

use thiserror::Error;

use crate::platform::{NetworkFramework, TargetPlatform};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No quantizer is registered for the requested platform.
    #[error("target platform {0} is not supported right now")]
    UnsupportedPlatform(TargetPlatform),
    /// Quantization was requested for a platform that can not be quantized.
    #[error("target platform {0} is a non-quantable platform")]
    NonQuantizedPlatform(TargetPlatform),
    #[error("can not find dispatcher type \"{0}\", check your input again")]
    UnknownDispatcher(String),
    /// An override for a live operation carries a code that decodes to no platform.
    #[error("dispatching table contains an invalid platform code {code} for operation {operation}")]
    InvalidPlatformCode { operation: String, code: i64 },
    #[error("requiring framework {0} does not support parsing now")]
    UnsupportedFramework(NetworkFramework),
    #[error("requiring platform {0} does not support export now")]
    UnsupportedExport(TargetPlatform),
    /// Malformed or incomplete settings document.
    #[error("invalid quantization setting: {0}")]
    Settings(String),
    #[error("quantization needs a valid calibration source and step count: {0}")]
    CalibrationPrecondition(String),
    /// An operation of the graph has no entry in the dispatching table.
    #[error("internal error, can not find operation {0} in dispatching table")]
    MissingDispatch(String),
    /// Structural error raised while editing the graph.
    #[error("graph error: {0:#}")]
    Graph(#[from] anyhow::Error),
    #[error("file {0} already exists and is a directory, can not create file here")]
    PathIsDirectory(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// True for errors caused by user supplied configuration rather than by the graph itself.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            DispatchError::UnsupportedPlatform(_)
                | DispatchError::NonQuantizedPlatform(_)
                | DispatchError::UnknownDispatcher(_)
                | DispatchError::InvalidPlatformCode { .. }
                | DispatchError::UnsupportedFramework(_)
                | DispatchError::UnsupportedExport(_)
                | DispatchError::Settings(_)
        )
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
