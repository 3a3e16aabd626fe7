use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use ndarray::{Array3, ArrayD, ArrayViewD, Axis};
use ndarray_npy::WriteNpyExt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::image_io::label_image;

pub const FRAME_SUFFIX: &str = "leftImg8bit.png";

/// Everything one pipeline pass produces for a frame pair.
#[derive(Debug, Clone)]
pub struct FrameArtifacts {
    /// Flow features, tile index on axis 0.
    pub flow_features: ArrayD<f32>,
    /// Segmentation features, tile index on axis 0.
    pub seg_features: ArrayD<f32>,
    /// `[tiles, out_h, out_w]` class labels.
    pub labels: Array3<u8>,
}

impl FrameArtifacts {
    pub fn tile_count(&self) -> usize {
        self.labels.dim().0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    FlowFeature,
    SegFeature,
    Prediction,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::FlowFeature, Self::SegFeature, Self::Prediction];

    pub fn tag(self) -> &'static str {
        match self {
            Self::FlowFeature => "flowfeature_",
            Self::SegFeature => "segfeature_",
            Self::Prediction => "pred_",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::FlowFeature | Self::SegFeature => "npy",
            Self::Prediction => "png",
        }
    }
}

/// Key-frame basename with the frame-naming suffix removed.
///
/// A path without a file name (`""`, `/`, `a/..`) has no stem; accepting
/// it would make every such pair write to the same artifact names.
pub fn artifact_stem(key_frame: &Path) -> Result<String> {
    let name = key_frame.file_name().ok_or_else(|| {
        PipelineError::Config(format!(
            "key frame {} has no file name to derive artifact names from",
            key_frame.display()
        ))
    })?;
    Ok(name.to_string_lossy().replace(FRAME_SUFFIX, ""))
}

/// `<stem><tag><tile>.<ext>`, e.g. `aachen_000000_000019_pred_2.png`.
pub fn artifact_file_name(stem: &str, kind: ArtifactKind, tile: usize) -> String {
    format!("{stem}{}{tile}.{}", kind.tag(), kind.extension())
}

/// Persists per-tile artifacts under one save directory. Existing files
/// are overwritten, so a retried pair replaces a partial earlier attempt.
pub struct ArtifactWriter {
    save_dir: PathBuf,
}

impl ArtifactWriter {
    /// Creates `save_dir` if it does not exist yet.
    pub fn new(save_dir: impl Into<PathBuf>) -> Result<Self> {
        let save_dir = save_dir.into();
        fs::create_dir_all(&save_dir).map_err(|e| PipelineError::io_write(&save_dir, e))?;
        Ok(Self { save_dir })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn path_for(&self, stem: &str, kind: ArtifactKind, tile: usize) -> PathBuf {
        self.save_dir.join(artifact_file_name(stem, kind, tile))
    }

    /// Write all artifacts of one pair and return their paths, tile by tile
    /// in flow feature, segmentation feature, prediction order.
    pub fn write_frame(
        &self,
        key_frame: &Path,
        artifacts: &FrameArtifacts,
    ) -> Result<Vec<PathBuf>> {
        let stem = artifact_stem(key_frame)?;
        let tiles = artifacts.tile_count();
        for (what, features) in [
            ("flow features", &artifacts.flow_features),
            ("segmentation features", &artifacts.seg_features),
        ] {
            if features.shape().first() != Some(&tiles) {
                return Err(PipelineError::Shape(format!(
                    "{what} {:?} do not carry {tiles} tiles on axis 0",
                    features.shape()
                )));
            }
        }

        let mut written = Vec::with_capacity(tiles * ArtifactKind::ALL.len());
        for tile in 0..tiles {
            let path = self.path_for(&stem, ArtifactKind::FlowFeature, tile);
            write_npy(&path, artifacts.flow_features.index_axis(Axis(0), tile))?;
            written.push(path);

            let path = self.path_for(&stem, ArtifactKind::SegFeature, tile);
            write_npy(&path, artifacts.seg_features.index_axis(Axis(0), tile))?;
            written.push(path);

            let path = self.path_for(&stem, ArtifactKind::Prediction, tile);
            label_image(artifacts.labels.index_axis(Axis(0), tile))
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|e| PipelineError::io_write(&path, std::io::Error::other(e)))?;
            written.push(path);
        }

        debug!(stem = %stem, files = written.len(), "Artifacts written");
        Ok(written)
    }
}

fn write_npy(path: &Path, array: ArrayViewD<'_, f32>) -> Result<()> {
    let file = File::create(path).map_err(|e| PipelineError::io_write(path, e))?;
    array
        .as_standard_layout()
        .write_npy(BufWriter::new(file))
        .map_err(|e| PipelineError::io_write(path, std::io::Error::other(e)))
}
