use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{expect_nchw, expect_tile_axis, extract_output, to_nchw, Graph, GraphSource, TileBatch};
use crate::error::{PipelineError, Result};

const ADAPTER: &str = "segmentation";

#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Coarse class evidence, `[tiles, classes, h, w]`.
    pub scores: Array4<f32>,
    /// Opaque feature tensor with the tile index on axis 0.
    pub features: ArrayD<f32>,
}

pub trait SegmentationModel {
    /// Run the network once over a batch of mean-subtracted key-frame tiles.
    fn segment(&mut self, tiles: &TileBatch) -> Result<SegmentationOutput>;
}

/// Graph tensor names for the segmentation network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationTensors {
    pub image: String,
    pub scores: String,
    pub features: String,
}

impl Default for SegmentationTensors {
    fn default() -> Self {
        Self {
            image: "image".to_string(),
            scores: "fc_out".to_string(),
            features: "fc1_voc12".to_string(),
        }
    }
}

pub struct OrtSegmentation {
    graph: Graph,
    tensors: SegmentationTensors,
    num_classes: usize,
}

impl OrtSegmentation {
    pub fn load(
        source: &GraphSource<'_>,
        tensors: SegmentationTensors,
        num_classes: usize,
    ) -> Result<Self> {
        let graph = Graph::load(
            ADAPTER,
            source,
            &[tensors.image.as_str()],
            &[tensors.scores.as_str(), tensors.features.as_str()],
        )?;
        Ok(Self {
            graph,
            tensors,
            num_classes,
        })
    }
}

impl SegmentationModel for OrtSegmentation {
    fn segment(&mut self, tiles: &TileBatch) -> Result<SegmentationOutput> {
        let count = tiles.dim().0;
        let adapter = self.graph.adapter();
        let precision = self.graph.precision();
        let input = self.graph.encode(to_nchw(tiles))?;

        let session = self.graph.session_mut();
        let outputs = session
            .run(ort::inputs![self.tensors.image.as_str() => &input])
            .map_err(|e| PipelineError::adapter(adapter, e))?;
        let scores = extract_output(adapter, precision, &outputs, &self.tensors.scores)?;
        let features = extract_output(adapter, precision, &outputs, &self.tensors.features)?;
        drop(outputs);

        let scores = expect_nchw(ADAPTER, "scores", scores, count, &[self.num_classes])?;
        expect_tile_axis(ADAPTER, "features", &features, count)?;
        debug!(
            scores = ?scores.shape(),
            features = ?features.shape(),
            "Segmentation forward pass finished"
        );

        Ok(SegmentationOutput { scores, features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tensor_names_match_exported_graph() {
        let tensors = SegmentationTensors::default();
        assert_eq!(tensors.image, "image");
        assert_eq!(tensors.scores, "fc_out");
        assert_eq!(tensors.features, "fc1_voc12");
    }

    #[test]
    fn partial_tensor_table_keeps_defaults() {
        let tensors: SegmentationTensors = toml::from_str("scores = \"logits\"").expect("parse");
        assert_eq!(tensors.scores, "logits");
        assert_eq!(tensors.image, "image");
    }
}
