use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries
/// (`libnvinfer.so.10` or `nvinfer.dll`); without them ORT uses the CUDA EP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    /// Adapter name used in errors and log fields.
    pub adapter: &'static str,
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

fn load_failure(config: &SessionConfig<'_>, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::adapter(
        config.adapter,
        format!("failed to load {}: {e}", config.model_path.display()),
    )
}

/// Build an `ort::Session` for one adapter graph.
///
/// - `Cpu`: no execution providers registered.
/// - `Cuda`: CUDA EP only, with a warning when it is unavailable.
/// - `Tensorrt`: TRT EP with engine caching, then CUDA EP as fallback.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let adapter = config.adapter;
    let builder = Session::builder()
        .map_err(|e| PipelineError::adapter(adapter, e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| PipelineError::adapter(adapter, e))?;

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(
                adapter,
                backend = "cpu",
                "Building session without execution providers"
            );
            builder
                .commit_from_file(config.model_path)
                .map_err(|e| load_failure(config, e))
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!(
                    adapter,
                    "CUDA EP is not available, inference will fall back to CPU"
                );
            }

            debug!(adapter, backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| PipelineError::adapter(adapter, e))?
                .commit_from_file(config.model_path)
                .map_err(|e| load_failure(config, e))
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_stats(cache_dir);
            let started = Instant::now();
            info!(
                adapter,
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(tick) {
                    info!(
                        adapter,
                        elapsed_secs = elapsed,
                        "TensorRT session initialization still in progress"
                    );
                    elapsed += 15;
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])
                .map_err(|e| PipelineError::adapter(adapter, e))
                .and_then(|b| {
                    b.commit_from_file(config.model_path)
                        .map_err(|e| load_failure(config, e))
                });

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            let after = cache_stats(cache_dir);
            match &session_result {
                Ok(_) => info!(
                    adapter,
                    elapsed_secs = elapsed,
                    cache_updated = after.total_bytes != before.total_bytes,
                    cache_bytes = after.total_bytes,
                    "TensorRT session ready"
                ),
                Err(e) => error!(
                    adapter,
                    elapsed_secs = elapsed,
                    error = %e,
                    "TensorRT session initialization failed"
                ),
            }
            session_result
        }
    }
}
