use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Search directories relative to the current executable for the ONNX
/// Runtime library.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(ORT_LIB_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Auto-detect the ONNX Runtime library path before ort initialization.
///
/// The `load-dynamic` ort build resolves the library through
/// `ORT_DYLIB_PATH`; an explicit environment value always wins.
/// Call this at the very start of `main()`, before any ort or tracing init.
pub fn setup_runtime_libs() {
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }
}

/// Log which runtime library was resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    if let Ok(ort) = env::var("ORT_DYLIB_PATH") {
        let exists = Path::new(&ort).is_file();
        if exists {
            info!("ORT library: {ort}");
        } else {
            warn!("ORT_DYLIB_PATH set to {ort} but file not found");
        }
    } else {
        warn!("ORT_DYLIB_PATH not set — ORT will try default search paths");
    }
}
