use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where the ORT library came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibrary {
    /// `ORT_DYLIB_PATH` was already set by the user.
    Preset(PathBuf),
    /// Found in one of the candidate directories and exported.
    Discovered(PathBuf),
    NotFound,
}

/// Search directories, searched in order:
///   1. `<home>/lib/` when a home directory is given
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs(home_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(home) = home_dir {
        push(home.join("lib"));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Export `ORT_DYLIB_PATH` when it is unset and a library can be found.
///
/// Call at the start of `main()`, before any ORT call and before worker
/// threads exist.
pub fn setup_runtime_libs(home_dir: Option<&Path>) -> OrtLibrary {
    if let Some(preset) = env::var_os(ORT_DYLIB_ENV) {
        return OrtLibrary::Preset(PathBuf::from(preset));
    }

    match find_ort_dylib_in_dirs(&candidate_lib_dirs(home_dir)) {
        Some(path) => {
            env::set_var(ORT_DYLIB_ENV, &path);
            OrtLibrary::Discovered(path)
        }
        None => OrtLibrary::NotFound,
    }
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status(library: &OrtLibrary) {
    match library {
        OrtLibrary::Preset(path) if path.is_file() => {
            info!(path = %path.display(), "ORT library (from {ORT_DYLIB_ENV})");
        }
        OrtLibrary::Preset(path) => {
            warn!(path = %path.display(), "{ORT_DYLIB_ENV} is set but the file does not exist");
        }
        OrtLibrary::Discovered(path) => info!(path = %path.display(), "ORT library discovered"),
        OrtLibrary::NotFound => {
            warn!("No ORT library found, ORT will try the default search paths");
        }
    }
}
