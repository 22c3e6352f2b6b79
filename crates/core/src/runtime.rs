//! Locating external binaries (ffmpeg, ffprobe, nvidia-smi) and GPU runtime
//! libraries shipped next to the executable.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

#[cfg(unix)]
const TENSORRT_LIB_PREFIX: &str = "libnvinfer.so.";
#[cfg(windows)]
const TENSORRT_LIB_PREFIX: &str = "nvinfer_";

/// Load order for GPU runtime libraries; earlier tiers are dependencies of
/// later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LibTier {
    CudaRuntime,
    Cudnn,
    TensorRt,
}

impl LibTier {
    /// ORT's own provider libraries are not tiered: they need symbols from
    /// `libonnxruntime` and are loaded by ort itself.
    fn classify(file_name: &str) -> Option<Self> {
        let name = file_name.to_ascii_lowercase();
        let cuda = ["libcudart", "libcublas", "libcufft", "libcurand", "cudart64_", "cublas64_", "cublaslt64_"];
        if cuda.iter().any(|prefix| name.starts_with(prefix)) {
            Some(Self::CudaRuntime)
        } else if name.starts_with("libcudnn") || name.starts_with("cudnn64_") {
            Some(Self::Cudnn)
        } else if ["libnvinfer", "libnvonnxparser", "nvinfer", "nvonnxparser"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            Some(Self::TensorRt)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLib {
    pub name: String,
    pub path: PathBuf,
    pub tier: LibTier,
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then system dirs and
/// `LD_LIBRARY_PATH` on unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push(exe_dir.clone());
        push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
        push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
        if let Some(paths) = env::var_os("LD_LIBRARY_PATH") {
            for dir in env::split_paths(&paths) {
                if !dir.as_os_str().is_empty() {
                    push(dir);
                }
            }
        }
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        dirs.push(exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("bin"));
        }
        dirs.push(exe_dir);
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }
    dirs
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn candidate_binary_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// A `Command` for `binary`, preferring a bundled copy over `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Tiered GPU runtime libraries in `dirs`, sorted into load order. The first
/// directory providing a file name wins.
pub fn discover_runtime_libs(dirs: &[PathBuf]) -> Vec<RuntimeLib> {
    use std::collections::HashSet;

    let mut seen: HashSet<String> = HashSet::new();
    let mut libs = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_candidate_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(tier) = LibTier::classify(&name) {
                libs.push(RuntimeLib { name, path, tier });
            }
        }
    }

    libs.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
    libs
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ort at a bundled `libonnxruntime` and preload CUDA → cuDNN → TensorRT
/// with global symbol visibility.
///
/// The dynamic loader caches `LD_LIBRARY_PATH` at process start, so libraries
/// next to the executable are opened by absolute path instead. Call at the
/// very start of `main()`, before ort or tracing are initialized.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|candidate| candidate.is_file())
        {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }

    for lib in discover_runtime_libs(&dirs) {
        unsafe {
            load_library(&lib.path);
        }
    }
}

/// Parse `1.2.3` out of `libnvinfer.so.10.3.0` style names.
fn version_from_lib_name(name: &str) -> Option<Vec<u32>> {
    let rest = name.strip_prefix(TENSORRT_LIB_PREFIX)?;
    let rest = rest.strip_suffix(".dll").unwrap_or(rest);
    let parts: Option<Vec<u32>> = rest.split(['.', '_']).map(|p| p.parse().ok()).collect();
    parts.filter(|parts| !parts.is_empty())
}

/// Highest TensorRT version found next to the executable or on the library
/// path, e.g. `"10.3.0"`.
pub fn tensorrt_version() -> Option<String> {
    static VERSION: OnceLock<Option<String>> = OnceLock::new();
    VERSION
        .get_or_init(|| {
            let version = candidate_lib_dirs()
                .iter()
                .filter_map(|dir| std::fs::read_dir(dir).ok())
                .flat_map(|entries| entries.flatten())
                .filter_map(|entry| version_from_lib_name(&entry.file_name().to_string_lossy()))
                .max()?;
            Some(
                version
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join("."),
            )
        })
        .clone()
}

/// GPU model name for a CUDA ordinal, via `nvidia-smi`. `None` without a
/// driver or GPU.
pub fn device_name(device_id: i32) -> Option<String> {
    static NAMES: OnceLock<Vec<String>> = OnceLock::new();
    let names = NAMES.get_or_init(|| {
        let output = command_for("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                debug!(status = %output.status, "nvidia-smi failed");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                Vec::new()
            }
        }
    });
    usize::try_from(device_id.max(0))
        .ok()
        .and_then(|index| names.get(index))
        .cloned()
}

/// Log which runtime libraries were resolved. Call after tracing is
/// initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }

    let libs = discover_runtime_libs(&candidate_lib_dirs());
    let count = |tier: LibTier| libs.iter().filter(|lib| lib.tier == tier).count();
    debug!(
        cuda = count(LibTier::CudaRuntime),
        cudnn = count(LibTier::Cudnn),
        tensorrt = count(LibTier::TensorRt),
        tensorrt_version = ?tensorrt_version(),
        "GPU runtime libraries discovered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_binary_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");

        let binary_name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
        std::fs::write(first.join(binary_name), b"first").expect("first binary should exist");
        std::fs::write(second.join(binary_name), b"second").expect("second binary should exist");

        let resolved = find_binary_in_dirs("ffmpeg", &[first.clone(), second])
            .expect("binary should be resolved");
        assert_eq!(resolved, first.join(binary_name));
    }

    #[test]
    fn lib_tiers_order_cuda_before_cudnn_before_tensorrt() {
        assert_eq!(LibTier::classify("libcudart.so.12"), Some(LibTier::CudaRuntime));
        assert_eq!(LibTier::classify("libcudnn_ops.so.9"), Some(LibTier::Cudnn));
        assert_eq!(LibTier::classify("libnvinfer.so.10"), Some(LibTier::TensorRt));
        assert!(LibTier::CudaRuntime < LibTier::Cudnn && LibTier::Cudnn < LibTier::TensorRt);
        assert_eq!(LibTier::classify("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(LibTier::classify("libsomething_else.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn discover_sorts_by_tier_and_dedups_names() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        for name in ["libnvinfer.so.10.3.0", "libcudnn.so.9", "libz.so.1"] {
            std::fs::write(first.join(name), b"").expect("lib");
        }
        std::fs::write(second.join("libcudnn.so.9"), b"").expect("dup");
        std::fs::write(second.join("libcudart.so.12"), b"").expect("lib");

        let libs = discover_runtime_libs(&[first.clone(), second.clone()]);
        let names: Vec<&str> = libs.iter().map(|lib| lib.name.as_str()).collect();
        assert_eq!(names, vec!["libcudart.so.12", "libcudnn.so.9", "libnvinfer.so.10.3.0"]);
        assert_eq!(libs[1].path, first.join("libcudnn.so.9"));
    }

    #[cfg(unix)]
    #[test]
    fn tensorrt_version_parsed_from_lib_name() {
        assert_eq!(version_from_lib_name("libnvinfer.so.10.3.0"), Some(vec![10, 3, 0]));
        assert_eq!(version_from_lib_name("libnvinfer.so.8"), Some(vec![8]));
        assert_eq!(version_from_lib_name("libnvinfer_plugin.so.10"), None);
        assert!(version_from_lib_name("libnvinfer.so.10.3.0") > version_from_lib_name("libnvinfer.so.8.6.1"));
    }

    #[test]
    fn device_name_without_gpu_does_not_panic() {
        let _ = device_name(0);
        let _ = device_name(-1);
    }
}
