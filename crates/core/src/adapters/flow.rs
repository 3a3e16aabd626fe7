use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{expect_nchw, expect_tile_axis, extract_output, to_nchw, Graph, GraphSource, TileBatch};
use crate::error::{PipelineError, Result};
use crate::warp::FLOW_CHANNELS;

const ADAPTER: &str = "flow";

#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// `[tiles, 2, h, w]`: horizontal then vertical displacement in pixels.
    pub flow: Array4<f32>,
    /// `[tiles, 1 | classes, h, w]` confidence at flow resolution.
    pub scale: Array4<f32>,
    /// Opaque feature tensor with the tile index on axis 0.
    pub features: ArrayD<f32>,
}

pub trait FlowModel {
    /// Estimate flow from `key` to `current` for every tile pair.
    /// Both batches are in `[0, 1]` and share tile order.
    fn estimate(&mut self, current: &TileBatch, key: &TileBatch) -> Result<FlowOutput>;
}

/// Graph tensor names for the flow network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTensors {
    pub current: String,
    pub key: String,
    pub flow: String,
    pub scale: String,
    pub feature: String,
}

impl Default for FlowTensors {
    fn default() -> Self {
        Self {
            current: "current".to_string(),
            key: "key".to_string(),
            flow: "flow".to_string(),
            scale: "scale".to_string(),
            feature: "feature".to_string(),
        }
    }
}

pub struct OrtFlow {
    graph: Graph,
    tensors: FlowTensors,
    num_classes: usize,
}

impl OrtFlow {
    pub fn load(
        source: &GraphSource<'_>,
        tensors: FlowTensors,
        num_classes: usize,
    ) -> Result<Self> {
        let graph = Graph::load(
            ADAPTER,
            source,
            &[tensors.current.as_str(), tensors.key.as_str()],
            &[
                tensors.flow.as_str(),
                tensors.scale.as_str(),
                tensors.feature.as_str(),
            ],
        )?;
        Ok(Self {
            graph,
            tensors,
            num_classes,
        })
    }
}

impl FlowModel for OrtFlow {
    fn estimate(&mut self, current: &TileBatch, key: &TileBatch) -> Result<FlowOutput> {
        if current.dim() != key.dim() {
            return Err(PipelineError::Shape(format!(
                "current tiles are {:?}, key tiles are {:?}",
                current.shape(),
                key.shape()
            )));
        }

        let count = current.dim().0;
        let adapter = self.graph.adapter();
        let precision = self.graph.precision();
        let current_value = self.graph.encode(to_nchw(current))?;
        let key_value = self.graph.encode(to_nchw(key))?;

        let session = self.graph.session_mut();
        let outputs = session
            .run(ort::inputs![
                self.tensors.current.as_str() => &current_value,
                self.tensors.key.as_str() => &key_value,
            ])
            .map_err(|e| PipelineError::adapter(adapter, e))?;
        let flow = extract_output(adapter, precision, &outputs, &self.tensors.flow)?;
        let scale = extract_output(adapter, precision, &outputs, &self.tensors.scale)?;
        let features = extract_output(adapter, precision, &outputs, &self.tensors.feature)?;
        drop(outputs);

        let flow = expect_nchw(ADAPTER, "flow", flow, count, &[FLOW_CHANNELS])?;
        let scale = expect_nchw(ADAPTER, "scale", scale, count, &[1, self.num_classes])?;
        expect_tile_axis(ADAPTER, "features", &features, count)?;
        if flow.shape()[2..] != scale.shape()[2..] {
            return Err(PipelineError::adapter(
                ADAPTER,
                format!(
                    "scale map {:?} is not co-located with flow {:?}",
                    scale.shape(),
                    flow.shape()
                ),
            ));
        }
        debug!(
            flow = ?flow.shape(),
            scale = ?scale.shape(),
            features = ?features.shape(),
            "Flow forward pass finished"
        );

        Ok(FlowOutput {
            flow,
            scale,
            features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tensor_names() {
        let tensors = FlowTensors::default();
        assert_eq!(tensors.current, "current");
        assert_eq!(tensors.key, "key");
        assert_eq!(tensors.flow, "flow");
        assert_eq!(tensors.scale, "scale");
        assert_eq!(tensors.feature, "feature");
    }

    #[test]
    fn tensor_table_round_trips_through_toml() {
        let tensors = FlowTensors {
            feature: "flow_feature".to_string(),
            ..FlowTensors::default()
        };
        let text = toml::to_string(&tensors).expect("serialize");
        let parsed: FlowTensors = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, tensors);
    }
}
