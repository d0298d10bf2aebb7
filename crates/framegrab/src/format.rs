//! Pixel formats, resolutions and the source descriptions a session is keyed on.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::FormatError;

/// Resolutions a device is likely to fall back to when it ignores the
/// requested size. Used to recover from a short first read.
pub const KNOWN_RESOLUTIONS: [Resolution; 5] = [
    Resolution::new(160, 120),
    Resolution::new(320, 240),
    Resolution::new(640, 480),
    Resolution::new(1280, 720),
    Resolution::new(1920, 1080),
];

/// Byte encoding of one pixel, as requested from a device or emitted by the
/// decode pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Mjpeg,
    Bgr24,
    Rgb24,
    Yuyv422,
    Gray8,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Mjpeg,
        PixelFormat::Bgr24,
        PixelFormat::Rgb24,
        PixelFormat::Yuyv422,
        PixelFormat::Gray8,
    ];

    /// ffmpeg name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Yuyv422 => "yuyv422",
            PixelFormat::Gray8 => "gray",
        }
    }

    /// Fixed bytes per pixel, `None` for compressed formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => Some(3),
            PixelFormat::Yuyv422 => Some(2),
            PixelFormat::Gray8 => Some(1),
        }
    }

    /// Format requested from the capture device when this format is configured.
    ///
    /// Webcams rarely offer packed RGB or gray natively, so those are
    /// captured as YUYV and converted by the pipeline.
    pub fn device_input_format(&self) -> PixelFormat {
        match self {
            PixelFormat::Mjpeg => PixelFormat::Mjpeg,
            _ => PixelFormat::Yuyv422,
        }
    }

    /// Raw format the decode pipeline writes to its output for this format.
    ///
    /// MJPEG is decoded in the pipeline; everything else passes through and
    /// is normalized on our side.
    pub fn pipeline_output_format(&self) -> PixelFormat {
        match self {
            PixelFormat::Mjpeg => PixelFormat::Bgr24,
            other => *other,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mjpeg" | "mjpg" => Ok(PixelFormat::Mjpeg),
            "bgr24" => Ok(PixelFormat::Bgr24),
            "rgb24" => Ok(PixelFormat::Rgb24),
            "yuyv422" | "yuyv" => Ok(PixelFormat::Yuyv422),
            "gray" | "gray8" => Ok(PixelFormat::Gray8),
            _ => Err(FormatError::UnknownPixelFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Looks up the known resolution with exactly `pixels` pixels.
    pub fn from_pixel_count(pixels: usize) -> Option<Resolution> {
        let mut matches = KNOWN_RESOLUTIONS.iter().filter(|r| r.pixels() == pixels);
        let found = matches.next().copied();
        // An ambiguous count is as good as no match.
        if matches.next().is_some() {
            return None;
        }
        found
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FormatError::InvalidResolution(s.to_string());
        let lowered = s.trim().to_lowercase();
        let (w, h) = lowered.split_once('x').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

/// Desired operating parameters of one capture session.
///
/// Two configs are equivalent iff all three fields match; any change
/// invalidates the running decode process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub pixel_format: PixelFormat,
    pub resolution: Resolution,
}

impl CaptureConfig {
    pub fn new(
        device_path: impl Into<PathBuf>,
        pixel_format: PixelFormat,
        resolution: Resolution,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            pixel_format,
            resolution,
        }
    }

    /// Conservative settings almost every UVC device accepts.
    pub fn device_fallback(device_path: impl Into<PathBuf>) -> Self {
        Self::new(
            device_path,
            PixelFormat::Yuyv422,
            Resolution::new(160, 120),
        )
    }
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    File { path: PathBuf },
    Device { config: CaptureConfig },
}

impl VideoSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        VideoSource::File { path: path.into() }
    }

    pub fn device(config: CaptureConfig) -> Self {
        VideoSource::Device { config }
    }

    pub fn path(&self) -> &Path {
        match self {
            VideoSource::File { path } => path,
            VideoSource::Device { config } => &config.device_path,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, VideoSource::Device { .. })
    }

    /// Format of the bytes the pipeline will emit for this source.
    pub fn output_format(&self) -> PixelFormat {
        match self {
            VideoSource::File { .. } => PixelFormat::Bgr24,
            VideoSource::Device { config } => config.pixel_format.pipeline_output_format(),
        }
    }
}

/// Accepts either a device node (`/dev/video2`) or a bare index (`2`).
pub fn device_path_from_str(s: &str) -> PathBuf {
    match s.trim().parse::<u32>() {
        Ok(index) => PathBuf::from(format!("/dev/video{index}")),
        Err(_) => PathBuf::from(s.trim()),
    }
}

/// Whether `path` follows the host's capture device node convention.
pub fn is_device_path(path: &Path) -> bool {
    path.to_str().is_some_and(|p| {
        p.strip_prefix("/dev/video")
            .is_some_and(|idx| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
    })
}
