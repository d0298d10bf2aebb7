//! Stream geometry probing through `ffprobe`.

use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::error::{MetadataError, NO_DIAGNOSTICS};

/// Advisory frame count reported for live devices, which have no length.
pub const LIVE_FRAME_COUNT: u64 = 1_000_000;

/// Frame rate assumed for a device that refuses to be probed.
pub const FALLBACK_DEVICE_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

impl StreamMetadata {
    /// Conservative geometry used when a device cannot be probed.
    pub fn device_fallback() -> Self {
        Self {
            width: 160,
            height: 120,
            fps: FALLBACK_DEVICE_FPS,
            frame_count: LIVE_FRAME_COUNT,
        }
    }

    /// Builds file metadata from `ffprobe -print_format json -show_format -show_streams`.
    pub fn from_file_probe(json: &str, path: &Path) -> Result<Self, MetadataError> {
        let probe: ProbeOutput = serde_json::from_str(json)?;
        let format = probe.format.as_ref().ok_or_else(|| MetadataError::MissingFormat {
            path: path.to_path_buf(),
        })?;
        let stream = probe.video_stream(path)?;
        let (width, height, fps) = stream.geometry()?;

        let frame_count = match stream.nb_frames.as_ref().and_then(Number::as_f64) {
            Some(explicit) => explicit as u64,
            None => {
                let duration = stream
                    .duration
                    .as_ref()
                    .and_then(Number::as_f64)
                    .or_else(|| format.duration.as_ref().and_then(Number::as_f64))
                    .ok_or(MetadataError::MissingFrameCount)?;
                (duration * fps) as u64
            }
        };

        Ok(Self {
            width,
            height,
            fps,
            frame_count,
        })
    }

    /// Builds device metadata; the frame count is always [`LIVE_FRAME_COUNT`].
    pub fn from_device_probe(json: &str, path: &Path) -> Result<Self, MetadataError> {
        let probe: ProbeOutput = serde_json::from_str(json)?;
        if probe.format.is_none() {
            return Err(MetadataError::MissingFormat {
                path: path.to_path_buf(),
            });
        }
        let (width, height, fps) = probe.video_stream(path)?.geometry()?;

        Ok(Self {
            width,
            height,
            fps,
            frame_count: LIVE_FRAME_COUNT,
        })
    }
}

/// Parses an ffprobe rational such as `"30000/1001"`.
///
/// A bare number is read as `n/1`.
pub fn parse_frame_rate(value: &str) -> Result<f64, MetadataError> {
    let invalid = || MetadataError::InvalidFrameRate {
        value: value.to_string(),
    };
    let (num, den) = value.trim().split_once('/').unwrap_or((value.trim(), "1"));
    let num: i64 = num.trim().parse().map_err(|_| invalid())?;
    let den: i64 = den.trim().parse().map_err(|_| invalid())?;
    if den == 0 {
        return Err(invalid());
    }
    Ok(num as f64 / den as f64)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

impl ProbeOutput {
    fn video_stream(&self, path: &Path) -> Result<&ProbeStream, MetadataError> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| MetadataError::NoVideoStream {
                path: path.to_path_buf(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<Number>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<Number>,
    duration: Option<Number>,
}

impl ProbeStream {
    fn geometry(&self) -> Result<(u32, u32, f64), MetadataError> {
        let width = self
            .width
            .ok_or(MetadataError::MissingField { field: "width" })?;
        let height = self
            .height
            .ok_or(MetadataError::MissingField { field: "height" })?;
        let fps = self
            .r_frame_rate
            .as_deref()
            .ok_or(MetadataError::MissingField { field: "fps" })
            .and_then(parse_frame_rate)?;
        Ok((width, height, fps))
    }
}

/// ffprobe prints most numeric fields as strings, and `"N/A"` when unknown.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Float(f64),
    Text(String),
}

impl Number {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Number::Float(v) => Some(*v),
            Number::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Best-effort stream probing call.
pub trait MediaProbe: Send + Sync {
    /// Returns the probe's JSON report for `path`. `format_hint` selects an
    /// input protocol such as `v4l2`.
    fn probe(&self, path: &Path, format_hint: Option<&str>) -> Result<String, MetadataError>;
}

/// Runs the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MediaProbe for FfprobeProbe {
    fn probe(&self, path: &Path, format_hint: Option<&str>) -> Result<String, MetadataError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"]);
        if let Some(hint) = format_hint {
            cmd.arg("-f").arg(hint);
        }
        cmd.arg(path);

        let output = cmd.output().map_err(|e| MetadataError::Probe {
            path: path.to_path_buf(),
            diagnostics: format!("failed to run {}: {}", self.program.display(), e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostics = match stderr.trim() {
                "" => NO_DIAGNOSTICS.to_string(),
                text => text.to_string(),
            };
            return Err(MetadataError::Probe {
                path: path.to_path_buf(),
                diagnostics,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub fn probe_file(prober: &dyn MediaProbe, path: &Path) -> Result<StreamMetadata, MetadataError> {
    let json = prober.probe(path, None)?;
    let metadata = StreamMetadata::from_file_probe(&json, path)?;
    tracing::debug!(path = %path.display(), ?metadata, "Probed video file");
    Ok(metadata)
}

/// Probes a capture device, degrading to [`StreamMetadata::device_fallback`]
/// when the device refuses (many do while already open elsewhere).
///
/// Only a device node that does not exist at all is an error.
pub fn probe_device(
    prober: &dyn MediaProbe,
    path: &Path,
) -> Result<StreamMetadata, MetadataError> {
    if !path.exists() {
        return Err(MetadataError::DeviceUnreadable {
            path: path.to_path_buf(),
        });
    }

    let probed = prober
        .probe(path, Some("v4l2"))
        .and_then(|json| StreamMetadata::from_device_probe(&json, path));

    match probed {
        Ok(metadata) => {
            tracing::debug!(path = %path.display(), ?metadata, "Probed capture device");
            Ok(metadata)
        }
        Err(e) => {
            let fallback = StreamMetadata::device_fallback();
            tracing::warn!(
                path = %path.display(),
                "Device probe failed ({}), assuming {}x{} @ {} fps",
                e,
                fallback.width,
                fallback.height,
                fallback.fps
            );
            Ok(fallback)
        }
    }
}

pub fn probe(
    prober: &dyn MediaProbe,
    path: &Path,
    is_device: bool,
) -> Result<StreamMetadata, MetadataError> {
    if is_device {
        probe_device(prober, path)
    } else {
        probe_file(prober, path)
    }
}
