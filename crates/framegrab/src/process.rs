//! The external decode process: argument construction, spawn, output stream
//! and guaranteed teardown.

use std::{
    collections::VecDeque,
    ffi::OsString,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    config::ToolConfig,
    error::{NO_DIAGNOSTICS, ProcessError},
    format::{PixelFormat, VideoSource},
};

/// Scaler flags for file decoding; favours accuracy over speed.
const FILE_SWS_FLAGS: &str = "lanczos+accurate_rnd+full_chroma_int+full_chroma_inp+bitexact";

/// Number of stderr lines kept for error reports.
const DIAGNOSTIC_LINES: usize = 32;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the stderr reader to drain after the child exited.
const DIAGNOSTIC_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Byte source that hands out chunks of a requested size.
pub trait ChunkSource {
    /// Reads up to `n` bytes, blocking until `n` are available or the stream
    /// ends. Fewer than `n` bytes means end of stream (or a truncated
    /// frame); an empty buffer means the stream is exhausted.
    fn read_chunk(&mut self, n: usize) -> io::Result<Vec<u8>>;
}

/// Fills a buffer of `n` bytes from `reader`, stopping early only at end of stream.
pub fn read_up_to<R: Read>(reader: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// A running decode process as seen by a capture session.
pub trait Pipeline: ChunkSource + Send {
    /// Stops the process. Infallible and idempotent.
    fn terminate(&mut self);
}

/// Starts decode processes for sources.
pub trait PipelineLauncher: Send + Sync {
    fn launch(&self, source: &VideoSource) -> Result<Box<dyn Pipeline>, ProcessError>;
}

/// Program and arguments for one decode process.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl PipelineCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Maps a source onto ffmpeg arguments that write raw frames to stdout.
    pub fn for_source(ffmpeg: &Path, source: &VideoSource) -> Self {
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
        ];

        match source {
            VideoSource::File { path } => {
                args.push("-i".into());
                args.push(path.as_os_str().to_owned());
                push_output(&mut args, PixelFormat::Bgr24);
                args.push("-sws_flags".into());
                args.push(FILE_SWS_FLAGS.into());
            }
            VideoSource::Device { config } => {
                let input = config.pixel_format.device_input_format();
                args.push("-f".into());
                args.push("v4l2".into());
                args.push("-input_format".into());
                args.push(input.as_str().into());
                args.push("-video_size".into());
                args.push(config.resolution.to_string().into());
                args.push("-i".into());
                args.push(config.device_path.as_os_str().to_owned());
                push_output(&mut args, config.pixel_format.pipeline_output_format());
            }
        }

        args.push("pipe:".into());
        Self::new(ffmpeg, args)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

fn push_output(args: &mut Vec<OsString>, format: PixelFormat) {
    args.push("-f".into());
    args.push("rawvideo".into());
    args.push("-pix_fmt".into());
    args.push(format.as_str().into());
}

/// Timing knobs for spawn and teardown.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub terminate_timeout: Duration,
    pub startup_grace: Duration,
}

impl From<&ToolConfig> for ProcessOptions {
    fn from(config: &ToolConfig) -> Self {
        Self {
            terminate_timeout: config.terminate_timeout,
            startup_grace: config.startup_grace,
        }
    }
}

/// Last lines the child wrote to stderr.
#[derive(Clone, Default)]
struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl DiagnosticTail {
    fn spawn_reader(&self, stderr: ChildStderr, program: String) -> io::Result<JoinHandle<()>> {
        let lines = Arc::clone(&self.lines);
        thread::Builder::new()
            .name("pipeline-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    tracing::debug!(program = %program, "{}", line);
                    if let Ok(mut lines) = lines.lock() {
                        if lines.len() == DIAGNOSTIC_LINES {
                            lines.pop_front();
                        }
                        lines.push_back(line);
                    }
                }
            })
    }

    fn text(&self) -> String {
        let text = self
            .lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        match text.trim() {
            "" => NO_DIAGNOSTICS.to_string(),
            t => t.to_string(),
        }
    }
}

/// One spawned decode process.
///
/// The process is terminated on drop if it was not terminated explicitly.
pub struct PipelineProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    program: String,
    diagnostics: DiagnosticTail,
    stderr_reader: Option<JoinHandle<()>>,
    terminate_timeout: Duration,
    terminated: bool,
}

impl PipelineProcess {
    #[tracing::instrument(skip_all, fields(program = %command.program.display()))]
    pub fn start(command: &PipelineCommand, options: ProcessOptions) -> Result<Self, ProcessError> {
        let program = command.program.display().to_string();
        tracing::debug!(args = ?command.args, "Spawning decode process");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let diagnostics = DiagnosticTail::default();
        let stderr_reader = match child.stderr.take() {
            Some(stderr) => match diagnostics.spawn_reader(stderr, program.clone()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!("Failed to start stderr reader: {}", e);
                    None
                }
            },
            None => None,
        };

        let stdout = child.stdout.take();

        let mut process = Self {
            child,
            stdout,
            program,
            diagnostics,
            stderr_reader,
            terminate_timeout: options.terminate_timeout,
            terminated: false,
        };

        if process.stdout.is_none() {
            process.terminate();
            return Err(ProcessError::MissingStdout);
        }

        process.check_startup(options.startup_grace)?;

        tracing::info!(pid = process.id(), "Decode process started");
        Ok(process)
    }

    /// Fails if the child exits unsuccessfully within `grace`.
    fn check_startup(&mut self, grace: Duration) -> Result<(), ProcessError> {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    self.terminated = true;
                    let diagnostics = self.collect_diagnostics();
                    tracing::error!(%status, "Decode process exited immediately: {}", diagnostics);
                    return Err(ProcessError::ExitedImmediately {
                        status,
                        diagnostics,
                    });
                }
                // Exited cleanly: whatever it produced is still in the pipe.
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() >= deadline => return Ok(()),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    tracing::warn!("Failed to poll decode process: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn collect_diagnostics(&mut self) -> String {
        if let Some(handle) = self.stderr_reader.take() {
            let deadline = Instant::now() + DIAGNOSTIC_DRAIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            if handle.is_finished() && handle.join().is_err() {
                tracing::warn!("stderr reader panicked");
            }
        }
        self.diagnostics.text()
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn read_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        match self.stdout.as_mut() {
            Some(stdout) => read_up_to(stdout, n),
            None => Ok(Vec::new()),
        }
    }

    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Stops the process: nothing if it already exited, otherwise a graceful
    /// terminate followed by a kill once `terminate_timeout` has passed.
    ///
    /// Errors are logged, never returned. Calling this more than once is a no-op.
    #[tracing::instrument(skip_all, fields(program = %self.program, pid = self.child.id()))]
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Decode process already exited");
            }
            Ok(None) => self.stop_running(),
            Err(e) => {
                tracing::warn!("Failed to poll decode process, killing it: {}", e);
                self.kill();
            }
        }

        // Closing our end unblocks anything still writing.
        self.stdout = None;
        // Reader ends on its own once the pipe closes.
        self.stderr_reader = None;
    }

    fn stop_running(&mut self) {
        if let Err(e) = self.signal_terminate() {
            tracing::warn!("Failed to send terminate signal: {}", e);
        } else if self.wait_timeout(self.terminate_timeout) {
            tracing::info!("Decode process stopped");
            return;
        }

        tracing::warn!(
            "Decode process did not exit within {:?}, killing it",
            self.terminate_timeout
        );
        self.kill();
    }

    #[cfg(unix)]
    fn signal_terminate(&self) -> io::Result<()> {
        use nix::{
            sys::signal::{Signal, kill},
            unistd::Pid,
        };

        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "graceful terminate is not available on this platform",
        ))
    }

    /// Returns true once the child has exited, false if `timeout` elapsed first.
    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() >= deadline => return false,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    tracing::warn!("Failed to poll decode process: {}", e);
                    return false;
                }
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::warn!("Failed to kill decode process: {}", e);
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!("Failed to reap decode process: {}", e);
        }
    }
}

impl Drop for PipelineProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl<T: ChunkSource + ?Sized> ChunkSource for Box<T> {
    fn read_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        (**self).read_chunk(n)
    }
}

impl ChunkSource for PipelineProcess {
    fn read_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        PipelineProcess::read_chunk(self, n)
    }
}

impl Pipeline for PipelineProcess {
    fn terminate(&mut self) {
        PipelineProcess::terminate(self);
    }
}

/// Launches `ffmpeg` decode processes.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    tools: ToolConfig,
}

impl FfmpegLauncher {
    pub fn new(tools: ToolConfig) -> Self {
        Self { tools }
    }
}

impl PipelineLauncher for FfmpegLauncher {
    fn launch(&self, source: &VideoSource) -> Result<Box<dyn Pipeline>, ProcessError> {
        let command = PipelineCommand::for_source(&self.tools.ffmpeg, source);
        let process = PipelineProcess::start(&command, ProcessOptions::from(&self.tools))?;
        Ok(Box::new(process))
    }
}
