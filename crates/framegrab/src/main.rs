use anyhow::Context;
use common::setup_logging;
use framegrab::{GrabConfig, SessionRegistry};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Frames between status lines.
const STATUS_INTERVAL: u64 = 30;

fn main() -> anyhow::Result<()> {
    let config = GrabConfig::from_env()?;
    setup_logging(config.log_level, config.environment);
    let abort = Arc::new(AtomicBool::new(false));

    flag::register(SIGTERM, Arc::clone(&abort))?;
    flag::register(SIGINT, Arc::clone(&abort))?;

    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let registry = SessionRegistry::new(config.tools.clone());
    let handle = registry
        .open_session(config.source.clone())
        .with_context(|| format!("Failed to open {}", config.source.path().display()))?;

    let metadata = handle.metadata();
    tracing::info!(
        "Streaming {} ({}x{} @ {:.2} fps, expecting {} frames)",
        handle.path().display(),
        metadata.width,
        metadata.height,
        metadata.fps,
        handle.expected_length(config.frame_limit)
    );

    let _s = common::span!("stream");
    let started = Instant::now();
    let mut count = 0u64;
    for (frame, index) in registry.iterate(&handle, config.frame_limit, Arc::clone(&abort))? {
        count += 1;
        if (index + 1) % STATUS_INTERVAL == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            tracing::info!(
                "Frame {} ({}x{}), {:.1} fps",
                index,
                frame.width(),
                frame.height(),
                count as f64 / elapsed.max(f64::EPSILON)
            );
        }
    }

    registry.close_session(&handle);
    tracing::info!(
        "Read {} frames from {} in {:.2?}",
        count,
        handle.name(),
        started.elapsed()
    );
    Ok(())
}
