//! Runtime pause/resume.
//!
//! A [`PauseSignal`] is polled by the [`PauseMonitor`]; a rising edge releases
//! every engine's accelerator resources, a falling edge reacquires them. The
//! render loop never sees the signal directly, only the controller state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::InferenceEngine;
use crate::pipeline::{PipelineState, StateCell};

pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_secs(1);

pub trait PauseSignal: Send + Sync {
    /// `true` while a pause is requested.
    fn read(&self) -> bool;
}

/// In-memory flag, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct SharedPauseSignal {
    flag: Arc<AtomicBool>,
}

impl SharedPauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, paused: bool) {
        self.flag.store(paused, Ordering::SeqCst);
    }
}

impl PauseSignal for SharedPauseSignal {
    fn read(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Text file holding `True` or `False`, created at start and removed on drop.
#[derive(Debug)]
pub struct FilePauseSignal {
    path: PathBuf,
}

impl FilePauseSignal {
    /// `<input dir>/<input file name>_paused_state.txt`
    pub fn path_for_input(input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "reframe".to_string());
        input.with_file_name(format!("{name}_paused_state.txt"))
    }

    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::write(&path, "False")
            .with_context(|| format!("failed to create pause file {}", path.display()))?;
        info!(path = %path.display(), "Pause file created; write True to pause, False to resume");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PauseSignal for FilePauseSignal {
    fn read(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text.trim().eq_ignore_ascii_case("true"),
            Err(error) => {
                debug!(path = %self.path.display(), error = %error, "Pause file unreadable");
                false
            }
        }
    }
}

impl Drop for FilePauseSignal {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %error, "Failed to remove pause file");
            }
        }
    }
}

/// Polls a [`PauseSignal`] and drives engine hot-unload/hot-reload on edges.
pub struct PauseMonitor {
    signal: Arc<dyn PauseSignal>,
    engines: Vec<Arc<InferenceEngine>>,
    state: StateCell,
    poll: Duration,
}

impl PauseMonitor {
    pub fn new(signal: Arc<dyn PauseSignal>, state: StateCell, poll: Duration) -> Self {
        Self {
            signal,
            engines: Vec::new(),
            state,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Engines are unloaded in the order added and reloaded in reverse.
    pub fn with_engine(mut self, engine: Arc<InferenceEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// Runs until the controller reaches `Terminated`. Returns the number of
    /// pauses observed.
    pub async fn run(self) -> Result<u64> {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_rx = self.state.subscribe();

        let mut paused = false;
        let mut pauses = 0_u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == PipelineState::Terminated {
                        break;
                    }
                    continue;
                }
            }

            if self.state.get() == PipelineState::Terminated {
                break;
            }

            let requested = self.signal.read();
            if requested == paused {
                continue;
            }

            if requested {
                info!("Pause requested; releasing engines");
                let engines = self.engines.clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    for engine in &engines {
                        engine.hot_unload()?;
                    }
                    Ok(())
                })
                .await
                .context("engine unload task panicked")??;

                self.state
                    .transition(&[PipelineState::Running], PipelineState::Paused);
                pauses += 1;
                info!(pauses, "Pipeline paused");
            } else {
                info!("Resume requested; reloading engines");
                self.state
                    .transition(&[PipelineState::Paused], PipelineState::Resuming);

                let engines = self.engines.clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    for engine in engines.iter().rev() {
                        engine.hot_reload()?;
                    }
                    Ok(())
                })
                .await
                .context("engine reload task panicked")??;

                self.state
                    .transition(&[PipelineState::Resuming], PipelineState::Running);
                info!("Pipeline resumed");
            }

            paused = requested;
        }

        debug!(pauses, "Pause monitor stopped");
        Ok(pauses)
    }
}
