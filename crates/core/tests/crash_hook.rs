use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use reframe_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use tempfile::tempdir;

const MODE_ENV: &str = "REFRAME_PANIC_CHILD_MODE";
const DATA_DIR_ENV: &str = "REFRAME_PANIC_CHILD_DATA_DIR";

/// Re-run this test binary, executing only the child entrypoint.
fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["panic_hook_child_entrypoint", "--exact", "--nocapture"])
        .env(MODE_ENV, mode)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

fn crash_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(DATA_DIR_ENV).expect("data dir env must be set"));

    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookInstallPlan::Installed { .. } | PanicHookInstallPlan::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "render_worker" => {
            let worker = std::thread::Builder::new()
                .name("render".to_string())
                .spawn(|| panic!("render worker lost its engine"))
                .expect("spawn worker");
            let _ = worker.join();
            panic!("pipeline aborted after worker panic");
        }
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("remove crash directory");
            }
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("panic with an unwritable crash directory");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_records_each_panicking_thread() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("render_worker", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let artifacts = crash_artifacts(&crash_dir(data_dir.path()));
    assert_eq!(artifacts.len(), 2, "one artifact per panic: {artifacts:?}");

    let contents: Vec<String> = artifacts
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .collect();
    assert!(contents
        .iter()
        .any(|c| c.contains("thread=render") && c.contains("payload=render worker lost its engine")));
    assert!(contents
        .iter()
        .any(|c| c.contains("payload=pipeline aborted after worker panic")));
    for c in &contents {
        assert!(c.contains("timestamp_utc="));
        assert!(c.contains("location="));
        assert!(c.contains("backtrace_policy="));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with an unwritable crash directory"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
