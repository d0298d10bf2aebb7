use std::{io, path::PathBuf, process::ExitStatus};
use thiserror::Error;

use crate::format::PixelFormat;

/// Placeholder used when a failed process left nothing readable on stderr.
pub const NO_DIAGNOSTICS: &str = "<no diagnostic output>";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Probe returned no format block for {path}")]
    MissingFormat { path: PathBuf },

    #[error("No video stream found in {path}")]
    NoVideoStream { path: PathBuf },

    #[error("No {field} found in video stream")]
    MissingField { field: &'static str },

    #[error("Invalid frame rate {value:?}")]
    InvalidFrameRate { value: String },

    #[error("No frame count or duration found in video stream, unable to determine video length")]
    MissingFrameCount,

    #[error("Failed to probe {path}: {diagnostics}")]
    Probe { path: PathBuf, diagnostics: String },

    #[error("Malformed probe output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("The capture device {path:?} cannot be read")]
    DeviceUnreadable { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Decode process exited immediately ({status}): {diagnostics}")]
    ExitedImmediately {
        status: ExitStatus,
        diagnostics: String,
    },

    #[error("Decode process has no stdout pipe")]
    MissingStdout,
}

impl ProcessError {
    /// Diagnostic text captured from the failed process, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            ProcessError::ExitedImmediately { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Packed YUYV frames need an even width, got {width}")]
    OddWidth { width: u32 },

    #[error("{format} frames are compressed and must be decoded in the pipeline")]
    Compressed { format: PixelFormat },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unknown pixel format {0:?}, expected one of mjpeg, bgr24, rgb24, yuyv422, gray")]
    UnknownPixelFormat(String),

    #[error("Invalid resolution {0:?}, expected WIDTHxHEIGHT")]
    InvalidResolution(String),
}

/// Errors surfaced by the session API.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_error_names_missing_field() {
        let err = MetadataError::MissingField { field: "width" };
        assert_eq!(err.to_string(), "No width found in video stream");

        let err = MetadataError::DeviceUnreadable {
            path: PathBuf::from("/dev/video7"),
        };
        assert_eq!(
            err.to_string(),
            "The capture device \"/dev/video7\" cannot be read"
        );
    }

    #[test]
    fn test_conversion_error_display() {
        let err = ConversionError::SizeMismatch {
            expected: 12,
            actual: 10,
        };
        assert_eq!(
            err.to_string(),
            "Frame buffer size mismatch: expected 12 bytes, got 10"
        );

        let err = ConversionError::Compressed {
            format: PixelFormat::Mjpeg,
        };
        assert_eq!(
            err.to_string(),
            "mjpeg frames are compressed and must be decoded in the pipeline"
        );
    }

    #[test]
    fn test_capture_error_is_transparent() {
        let err: CaptureError = MetadataError::MissingFrameCount.into();
        assert_eq!(
            err.to_string(),
            MetadataError::MissingFrameCount.to_string()
        );

        let err: CaptureError = ProcessError::MissingStdout.into();
        assert!(matches!(err, CaptureError::Process(_)));
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = ProcessError::Spawn {
            program: "ffmpeg".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "Failed to start ffmpeg: not found");
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.diagnostics().is_none());
    }
}
