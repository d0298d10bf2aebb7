//! Capture sessions: one decode process per source path, reused across
//! iterations and torn down on every exit path.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    config::ToolConfig,
    demux::FrameDemuxer,
    error::{CaptureError, MetadataError},
    format::VideoSource,
    frame::Frame,
    metadata::{self, FfprobeProbe, MediaProbe, StreamMetadata},
    normalize::normalize,
    process::{FfmpegLauncher, Pipeline, PipelineLauncher},
};

/// Frames between progress messages.
const PROGRESS_INTERVAL: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Reconfiguring,
    Retired,
}

type SessionRef = Arc<Mutex<CaptureSession>>;

struct CaptureSession {
    state: SessionState,
    source: VideoSource,
    metadata: Option<StreamMetadata>,
    pipeline: Option<FrameDemuxer<Box<dyn Pipeline>>>,
    frame_index: u64,
}

impl CaptureSession {
    fn uninitialized(source: VideoSource) -> Self {
        Self {
            state: SessionState::Uninitialized,
            source,
            metadata: None,
            pipeline: None,
            frame_index: 0,
        }
    }

    /// Replaces any running pipeline with a fresh one for the current source.
    fn start_pipeline(&mut self, launcher: &dyn PipelineLauncher) -> Result<(), CaptureError> {
        self.teardown();

        let (width, height) = match &self.source {
            VideoSource::Device { config } => (config.resolution.width, config.resolution.height),
            VideoSource::File { .. } => match &self.metadata {
                Some(m) => (m.width, m.height),
                None => {
                    return Err(MetadataError::MissingField { field: "width" }.into());
                }
            },
        };

        let pipeline = launcher.launch(&self.source)?;
        let demuxer = FrameDemuxer::new(pipeline, width, height, self.source.output_format())?;

        tracing::info!(
            path = %self.source.path().display(),
            "Decode pipeline started at {}x{} ({})",
            width,
            height,
            self.source.output_format()
        );
        self.pipeline = Some(demuxer);
        self.frame_index = 0;
        self.state = SessionState::Active;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut demuxer) = self.pipeline.take() {
            if demuxer.dropped() > 0 {
                tracing::debug!(
                    path = %self.source.path().display(),
                    "{} partial frames were dropped",
                    demuxer.dropped()
                );
            }
            demuxer.source_mut().terminate();
        }
    }

    fn retire(&mut self) {
        self.teardown();
        self.state = SessionState::Retired;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn lock_session(session: &SessionRef) -> MutexGuard<'_, CaptureSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a caller gets back from [`SessionRegistry::open_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    source: VideoSource,
    metadata: StreamMetadata,
}

impl SessionHandle {
    pub fn source(&self) -> &VideoSource {
        &self.source
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Directory containing the source.
    pub fn directory(&self) -> &Path {
        self.path().parent().unwrap_or(Path::new(""))
    }

    /// Source file name without its extension.
    pub fn name(&self) -> String {
        self.path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Number of frames a sequence is expected to yield.
    pub fn expected_length(&self, limit: Option<u64>) -> u64 {
        limit.unwrap_or(self.metadata.frame_count)
    }
}

/// Owns every capture session, keyed by source path.
///
/// The map lock is only held for lookups, inserts and removals. Creating,
/// reconfiguring and retiring a session happen under that session's own
/// lock, taken before the map lock whenever both are needed.
pub struct SessionRegistry {
    launcher: Arc<dyn PipelineLauncher>,
    prober: Arc<dyn MediaProbe>,
    sessions: Mutex<HashMap<PathBuf, SessionRef>>,
}

impl SessionRegistry {
    /// Registry driving the real `ffmpeg` and `ffprobe` binaries.
    pub fn new(tools: ToolConfig) -> Self {
        let prober = Arc::new(FfprobeProbe::new(tools.ffprobe.clone()));
        let launcher = Arc::new(FfmpegLauncher::new(tools));
        Self::with_backends(launcher, prober)
    }

    pub fn with_backends(launcher: Arc<dyn PipelineLauncher>, prober: Arc<dyn MediaProbe>) -> Self {
        Self {
            launcher,
            prober,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn probe(&self, path: &Path, is_device: bool) -> Result<StreamMetadata, MetadataError> {
        metadata::probe(self.prober.as_ref(), path, is_device)
    }

    /// Opens or reuses the session for `source`.
    ///
    /// A session whose configuration is unchanged keeps its running process.
    /// A changed configuration tears the old process down and starts a new one.
    #[tracing::instrument(skip(self, source), fields(path = %source.path().display()))]
    pub fn open_session(&self, source: VideoSource) -> Result<SessionHandle, CaptureError> {
        let (_, metadata) = self.acquire(&source, false)?;
        Ok(SessionHandle { source, metadata })
    }

    /// Lazily yields normalized frames with their index in the current pipeline.
    pub fn iterate(
        &self,
        handle: &SessionHandle,
        limit: Option<u64>,
        abort: Arc<AtomicBool>,
    ) -> Result<FrameSequence<'_>, CaptureError> {
        let (session, _) = self.acquire(&handle.source, true)?;
        Ok(FrameSequence {
            registry: self,
            session,
            limit,
            abort,
            finished: false,
        })
    }

    /// Tears down and forgets the session behind `handle`. Idempotent.
    pub fn close_session(&self, handle: &SessionHandle) {
        let existing = self.lock_sessions().get(handle.path()).cloned();
        if let Some(session) = existing {
            let mut guard = lock_session(&session);
            self.retire(&session, &mut guard);
            tracing::info!(path = %handle.path().display(), "Capture session closed");
        }
    }

    /// State of the session at `path`; absent sessions are uninitialized.
    pub fn state(&self, path: &Path) -> SessionState {
        let existing = self.lock_sessions().get(path).cloned();
        let Some(session) = existing else {
            return SessionState::Uninitialized;
        };
        let state = lock_session(&session).state;
        state
    }

    /// Frames delivered by the current pipeline of the session at `path`.
    pub fn frame_index(&self, path: &Path) -> Option<u64> {
        let existing = self.lock_sessions().get(path).cloned();
        let session = existing?;
        let index = lock_session(&session).frame_index;
        Some(index)
    }

    pub fn active_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<PathBuf, SessionRef>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds or creates the live session for `source`, bringing its
    /// configuration and (optionally) its pipeline up to date.
    fn acquire(
        &self,
        source: &VideoSource,
        ensure_pipeline: bool,
    ) -> Result<(SessionRef, StreamMetadata), CaptureError> {
        loop {
            let existing = self.lock_sessions().get(source.path()).cloned();
            let session = match existing {
                Some(session) => session,
                None => match self.insert_new(source) {
                    Some(session) => session,
                    None => continue,
                },
            };

            let mut guard = lock_session(&session);
            if guard.state == SessionState::Retired {
                // Retired while we were waiting; it is no longer in the map.
                continue;
            }

            if let Err(e) = self.prepare(&mut guard, source, ensure_pipeline) {
                self.retire(&session, &mut guard);
                return Err(e);
            }

            let metadata = guard
                .metadata
                .ok_or(MetadataError::MissingField { field: "width" })?;
            drop(guard);
            return Ok((session, metadata));
        }
    }

    /// Inserts an uninitialized session for `source`, or returns `None` if
    /// another caller inserted one first.
    fn insert_new(&self, source: &VideoSource) -> Option<SessionRef> {
        let mut sessions = self.lock_sessions();
        if sessions.contains_key(source.path()) {
            return None;
        }
        let session = Arc::new(Mutex::new(CaptureSession::uninitialized(source.clone())));
        sessions.insert(source.path().to_path_buf(), Arc::clone(&session));
        Some(session)
    }

    fn prepare(
        &self,
        session: &mut CaptureSession,
        source: &VideoSource,
        ensure_pipeline: bool,
    ) -> Result<(), CaptureError> {
        match session.state {
            SessionState::Uninitialized => {
                session.source = source.clone();
                session.metadata = Some(self.probe(source.path(), source.is_device())?);
                session.start_pipeline(self.launcher.as_ref())?;
                tracing::info!(path = %source.path().display(), "Capture session opened");
            }
            _ if session.source != *source => {
                tracing::info!(
                    path = %source.path().display(),
                    "Capture settings changed, restarting decode pipeline"
                );
                session.state = SessionState::Reconfiguring;
                // Free the device before probing it again.
                session.teardown();
                session.source = source.clone();
                session.metadata = Some(self.probe(source.path(), source.is_device())?);
                session.start_pipeline(self.launcher.as_ref())?;
            }
            _ if ensure_pipeline && session.pipeline.is_none() => {
                tracing::debug!(path = %source.path().display(), "Restarting decode pipeline");
                session.start_pipeline(self.launcher.as_ref())?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Tears `session` down and drops it from the map if it is still the
    /// registered session for its path.
    fn retire(&self, session: &SessionRef, guard: &mut CaptureSession) {
        guard.retire();
        let mut sessions = self.lock_sessions();
        let path = guard.source.path();
        if sessions
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(path);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let sessions: Vec<_> = self.lock_sessions().drain().collect();
        for (path, session) in sessions {
            lock_session(&session).retire();
            tracing::debug!(path = %path.display(), "Capture session released");
        }
    }
}

/// Frames of one session, read on demand.
///
/// Once it has returned `None` it stays exhausted; ask the registry for a new
/// sequence to read again.
pub struct FrameSequence<'a> {
    registry: &'a SessionRegistry,
    session: SessionRef,
    limit: Option<u64>,
    abort: Arc<AtomicBool>,
    finished: bool,
}

impl FrameSequence<'_> {
    fn limit_reached(&self, frame_index: u64) -> bool {
        self.limit.is_some_and(|limit| frame_index >= limit)
    }
}

impl Iterator for FrameSequence<'_> {
    type Item = (Frame, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.abort.load(Ordering::SeqCst) {
            tracing::info!("Capture aborted");
            self.finished = true;
            return None;
        }

        let session = Arc::clone(&self.session);
        let mut guard = lock_session(&session);

        if guard.state == SessionState::Retired {
            self.finished = true;
            return None;
        }
        if self.limit_reached(guard.frame_index) {
            self.registry.retire(&session, &mut guard);
            self.finished = true;
            return None;
        }

        loop {
            let Some(demuxer) = guard.pipeline.as_mut() else {
                self.finished = true;
                return None;
            };

            match demuxer.next_frame() {
                Ok(Some(raw)) => {
                    let frame = match normalize(raw.data, raw.width, raw.height, raw.format) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("Dropping frame: {}", e);
                            continue;
                        }
                    };

                    let index = guard.frame_index;
                    guard.frame_index += 1;
                    if guard.frame_index % PROGRESS_INTERVAL == 0 {
                        tracing::debug!(
                            path = %guard.source.path().display(),
                            "Read {} frames",
                            guard.frame_index
                        );
                    }
                    if self.limit_reached(guard.frame_index) {
                        tracing::info!(
                            path = %guard.source.path().display(),
                            "Frame limit of {} reached",
                            guard.frame_index
                        );
                        self.registry.retire(&session, &mut guard);
                        self.finished = true;
                    }
                    return Some((frame, index));
                }
                Ok(None) => {
                    if guard.source.is_device() {
                        tracing::info!(
                            path = %guard.source.path().display(),
                            "Capture device stream ended"
                        );
                        self.registry.retire(&session, &mut guard);
                    } else {
                        tracing::info!(
                            path = %guard.source.path().display(),
                            "End of video after {} frames",
                            guard.frame_index
                        );
                        guard.teardown();
                    }
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    tracing::error!(
                        path = %guard.source.path().display(),
                        "Failed to read from decode pipeline: {}",
                        e
                    );
                    self.registry.retire(&session, &mut guard);
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
