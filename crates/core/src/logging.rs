//! Log filter selection, rolling file sink and panic crash artifacts.
//!
//! Filter precedence is `--log-filter` > `-v` count > `RUST_LOG` > default.
//! When the user did not choose a filter explicitly, a noise filter silences
//! ort and ffmpeg stderr on the console; the file sink keeps ffmpeg stderr at
//! debug so failed encodes can be diagnosed afterwards.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "reframe";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

const FFMPEG_TARGETS: [&str; 2] = ["ffmpeg_stderr", "ffmpeg_encode_stderr"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingInitOptions {
    /// Options for a CLI run, reading `RUST_LOG` from the environment.
    pub fn for_cli(data_dir: Option<PathBuf>, verbose: u8, cli_log_filter: Option<String>) -> Self {
        Self {
            data_dir,
            verbose,
            cli_log_filter,
            rust_log_env: std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()),
            ..Self::default()
        }
    }

    fn is_implicit(&self) -> bool {
        self.cli_log_filter.is_none() && self.verbose == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    /// Console-only logging, with the reason the file sink was not set up.
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    if !options.is_implicit() || options.noise_filter.trim().is_empty() {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    LoggingFilterPlan {
        console_filter: format!("{},{user_filter}", options.noise_filter),
        file_filter: format!("{},{user_filter}", file_noise_filter(&options.noise_filter)),
        user_filter,
    }
}

/// The console noise filter with every ffmpeg target raised to `debug`.
fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(t, _)| t.trim());
            !FFMPEG_TARGETS.contains(&target)
        })
        .map(str::to_string)
        .collect();
    directives.extend(FFMPEG_TARGETS.iter().map(|target| format!("{target}=debug")));
    directives.join(",")
}

/// Daily rolling file under `<data_dir>/logs`, or the reason there is none.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Chain a hook that writes one artifact per panic to
/// `<data_dir>/logs/crash`. Installing twice keeps the first directory.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        write_crash_artifact_guarded(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: String,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let captured = Backtrace::capture();
        let (backtrace_policy, backtrace) = match captured.status() {
            BacktraceStatus::Captured => ("captured".to_string(), captured.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
                "<disabled by backtrace policy>".to_string(),
            ),
            _ => (
                "unsupported".to_string(),
                "<backtrace unavailable>".to_string(),
            ),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;

        let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:04}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread_name)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;
        Ok(path)
    }
}

/// A panic inside the hook must not recurse into the hook.
fn write_crash_artifact_guarded(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
