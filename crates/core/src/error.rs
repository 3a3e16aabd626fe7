use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("manifest line {line}: expected 3 fields, found {found} in {content:?}")]
    ManifestFormat {
        line: usize,
        found: usize,
        content: String,
    },

    #[error("failed to read manifest line {line}: {source}")]
    ManifestRead {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest ended at line {line} before the configured step count was reached")]
    ManifestExhausted { line: usize },

    #[error("no checkpoint found under {}", dir.display())]
    MissingCheckpoint { dir: PathBuf },

    #[error("{adapter} adapter failed: {message}")]
    AdapterCompute {
        adapter: &'static str,
        message: String,
    },

    #[error("failed to decode image {}: {source}", path.display())]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write {}: {source}", path.display())]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn adapter(adapter: &'static str, err: impl std::fmt::Display) -> Self {
        Self::AdapterCompute {
            adapter,
            message: err.to_string(),
        }
    }

    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoWrite {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
