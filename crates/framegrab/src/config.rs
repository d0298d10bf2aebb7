use std::{env, path::PathBuf, time::Duration};

pub use common::{Environment, LogLevel};

use crate::format::{
    CaptureConfig, PixelFormat, Resolution, VideoSource, device_path_from_str, is_device_path,
};

/// Limit applied by the binary when `FRAME_LIMIT` is unset.
pub const DEFAULT_FRAME_LIMIT: u64 = 200;

/// Locations of the external decode/probe tools and process timing knobs.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// How long a graceful terminate may take before the process is killed.
    pub terminate_timeout: Duration,
    /// Window after spawn in which an exiting process counts as a failed start.
    pub startup_grace: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            terminate_timeout: Duration::from_secs(1),
            startup_grace: Duration::from_millis(100),
        }
    }
}

impl ToolConfig {
    /// Load tool locations from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ffmpeg = env::var("FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg);

        let ffprobe = env::var("FFPROBE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffprobe);

        let terminate_timeout = env::var("TERMINATE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.terminate_timeout);

        let startup_grace = env::var("STARTUP_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_grace);

        Self {
            ffmpeg,
            ffprobe,
            terminate_timeout,
            startup_grace,
        }
    }
}

/// Configuration of the `framegrab` binary.
#[derive(Debug, Clone)]
pub struct GrabConfig {
    pub environment: Environment,
    pub log_level: LogLevel,
    pub source: VideoSource,
    pub frame_limit: Option<u64>,
    pub tools: ToolConfig,
}

impl GrabConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();
        let log_level = LogLevel::from_env();

        let source_path = env::var("SOURCE_PATH").unwrap_or_else(|_| "/dev/video0".to_string());

        let pixel_format: PixelFormat = env::var("PIXEL_FORMAT")
            .unwrap_or_else(|_| "bgr24".to_string())
            .parse()?;

        let resolution: Resolution = env::var("RESOLUTION")
            .unwrap_or_else(|_| "640x480".to_string())
            .parse()?;

        let frame_limit = match env::var("FRAME_LIMIT") {
            Ok(s) => match s.parse::<u64>()? {
                0 => None,
                n => Some(n),
            },
            Err(_) => Some(DEFAULT_FRAME_LIMIT),
        };

        let device_path = device_path_from_str(&source_path);
        let source = if is_device_path(&device_path) {
            VideoSource::device(CaptureConfig::new(device_path, pixel_format, resolution))
        } else {
            VideoSource::file(source_path)
        };

        Ok(Self {
            environment,
            log_level,
            source,
            frame_limit,
            tools: ToolConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "SOURCE_PATH",
        "PIXEL_FORMAT",
        "RESOLUTION",
        "FRAME_LIMIT",
        "FFMPEG_PATH",
        "FFPROBE_PATH",
        "TERMINATE_TIMEOUT_MS",
        "STARTUP_GRACE_MS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: every test touching the environment is #[serial].
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = GrabConfig::from_env().unwrap();
        assert_eq!(config.frame_limit, Some(DEFAULT_FRAME_LIMIT));
        assert_eq!(
            config.source,
            VideoSource::device(CaptureConfig::new(
                "/dev/video0",
                PixelFormat::Bgr24,
                Resolution::new(640, 480)
            ))
        );
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(config.tools.terminate_timeout, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_device_index_and_overrides() {
        clear_env();
        unsafe {
            env::set_var("SOURCE_PATH", "2");
            env::set_var("PIXEL_FORMAT", "yuyv422");
            env::set_var("RESOLUTION", "320x240");
            env::set_var("FRAME_LIMIT", "0");
            env::set_var("TERMINATE_TIMEOUT_MS", "250");
        }
        let config = GrabConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.frame_limit, None);
        assert_eq!(config.tools.terminate_timeout, Duration::from_millis(250));
        match config.source {
            VideoSource::Device { config } => {
                assert_eq!(config.device_path, PathBuf::from("/dev/video2"));
                assert_eq!(config.pixel_format, PixelFormat::Yuyv422);
                assert_eq!(config.resolution, Resolution::new(320, 240));
            }
            other => panic!("expected device source, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_file_source() {
        clear_env();
        unsafe { env::set_var("SOURCE_PATH", "/tmp/clip.mp4") };
        let config = GrabConfig::from_env().unwrap();
        clear_env();
        assert_eq!(config.source, VideoSource::file("/tmp/clip.mp4"));
    }

    #[test]
    #[serial]
    fn test_invalid_pixel_format_is_an_error() {
        clear_env();
        unsafe { env::set_var("PIXEL_FORMAT", "nv12") };
        let result = GrabConfig::from_env();
        clear_env();
        assert!(result.is_err());
    }
}
