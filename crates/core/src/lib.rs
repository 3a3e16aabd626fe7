//! Tiled warp-and-cache inference: segments key frames, warps the scores
//! onto current frames with optical flow, and persists per-tile features
//! and label maps as training data.

pub mod adapters;
pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod image_io;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod runtime;
pub mod sampling;
pub mod tiling;
pub mod warp;

pub use error::{PipelineError, Result};
