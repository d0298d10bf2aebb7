//! Scripted stand-ins for the decode process and the stream probe.

use std::{
    collections::VecDeque,
    io,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    error::{MetadataError, ProcessError},
    format::{Resolution, VideoSource},
    metadata::MediaProbe,
    process::{ChunkSource, Pipeline, PipelineLauncher},
};

/// Geometry reported for every file by [`MockProbe`].
pub const MOCK_FILE_RESOLUTION: Resolution = Resolution::new(4, 2);

/// What the next launched pipeline does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Emits this many frames, then ends the stream.
    Frames(usize),
    /// Emits this many frames, then fails the next read.
    FailAfter(usize),
    /// Refuses to start, like a process that exits straight away.
    ExitImmediately,
}

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    terminations: AtomicUsize,
}

/// Launcher producing [`MockPipeline`]s and counting their lifecycles.
///
/// Frame `i` of every pipeline is filled with the byte `i as u8`.
pub struct MockLauncher {
    script: Mutex<Script>,
    counters: Arc<Counters>,
    sources: Mutex<Vec<VideoSource>>,
}

impl MockLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            counters: Arc::new(Counters::default()),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    /// Pipelines started successfully.
    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Pipelines torn down.
    pub fn terminations(&self) -> usize {
        self.counters.terminations.load(Ordering::SeqCst)
    }

    pub fn launched_sources(&self) -> Vec<VideoSource> {
        self.sources.lock().unwrap().clone()
    }

    fn frame_size(source: &VideoSource) -> usize {
        let bytes_per_pixel = source.output_format().bytes_per_pixel().unwrap_or(3);
        let pixels = match source {
            VideoSource::File { .. } => MOCK_FILE_RESOLUTION.pixels(),
            VideoSource::Device { config } => config.resolution.pixels(),
        };
        pixels * bytes_per_pixel
    }
}

impl PipelineLauncher for MockLauncher {
    fn launch(&self, source: &VideoSource) -> Result<Box<dyn Pipeline>, ProcessError> {
        let script = *self.script.lock().unwrap();
        let size = Self::frame_size(source);

        let (frames, fail) = match script {
            Script::Frames(n) => (n, false),
            Script::FailAfter(n) => (n, true),
            Script::ExitImmediately => {
                return Err(ProcessError::Spawn {
                    program: "mock".to_string(),
                    source: io::Error::other("exited immediately"),
                });
            }
        };

        let mut reads: VecDeque<io::Result<Vec<u8>>> =
            (0..frames).map(|i| Ok(vec![i as u8; size])).collect();
        if fail {
            reads.push_back(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")));
        }

        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(source.clone());
        Ok(Box::new(MockPipeline {
            reads,
            counters: Arc::clone(&self.counters),
            terminated: false,
        }))
    }
}

pub struct MockPipeline {
    reads: VecDeque<io::Result<Vec<u8>>>,
    counters: Arc<Counters>,
    terminated: bool,
}

impl ChunkSource for MockPipeline {
    fn read_chunk(&mut self, _n: usize) -> io::Result<Vec<u8>> {
        self.reads.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

impl Pipeline for MockPipeline {
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.reads.clear();
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockPipeline {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Probe answering file queries with [`MOCK_FILE_RESOLUTION`] at 30 fps.
///
/// Device queries always fail, so devices fall back to default geometry.
pub struct MockProbe {
    frame_count: Option<u64>,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn with_frames(frame_count: u64) -> Self {
        Self {
            frame_count: Some(frame_count),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every probe fails.
    pub fn failing() -> Self {
        Self {
            frame_count: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaProbe for MockProbe {
    fn probe(&self, path: &Path, format_hint: Option<&str>) -> Result<String, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.frame_count, format_hint) {
            (Some(frames), None) => Ok(format!(
                r#"{{
                    "format": {{"duration": "1.0"}},
                    "streams": [{{
                        "codec_type": "video",
                        "width": {},
                        "height": {},
                        "r_frame_rate": "30/1",
                        "nb_frames": "{}"
                    }}]
                }}"#,
                MOCK_FILE_RESOLUTION.width, MOCK_FILE_RESOLUTION.height, frames
            )),
            _ => Err(MetadataError::Probe {
                path: path.to_path_buf(),
                diagnostics: "No such file or directory".to_string(),
            }),
        }
    }
}
