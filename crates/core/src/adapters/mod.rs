pub mod backend;
pub mod flow;
pub mod segmentation;

use std::path::Path;

use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, Ix4};
use ort::session::{Session, SessionOutputs};
use ort::value::{DynValue, Tensor};
use tracing::debug;

use crate::error::{PipelineError, Result};
use backend::{build_session, InferenceBackend, SessionConfig};

pub use flow::{FlowModel, FlowOutput, OrtFlow};
pub use segmentation::{OrtSegmentation, SegmentationModel, SegmentationOutput};

/// NHWC batch of image tiles, tile index on axis 0.
pub type TileBatch = Array4<f32>;

pub fn to_nchw(batch: &TileBatch) -> Array4<f32> {
    batch
        .view()
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
}

/// Where and how a graph is loaded.
#[derive(Debug, Clone, Copy)]
pub struct GraphSource<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphPrecision {
    F32,
    F16,
}

/// A loaded ORT session with tensor names checked against the graph.
pub(crate) struct Graph {
    adapter: &'static str,
    session: Session,
    precision: GraphPrecision,
}

impl Graph {
    pub(crate) fn load(
        adapter: &'static str,
        source: &GraphSource<'_>,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<Self> {
        let session = build_session(&SessionConfig {
            adapter,
            model_path: source.model_path,
            backend: source.backend,
            trt_cache_dir: source.trt_cache_dir,
        })?;

        let input_names: Vec<&str> = session.inputs().iter().map(|i| i.name()).collect();
        let output_names: Vec<&str> = session.outputs().iter().map(|o| o.name()).collect();
        for name in inputs {
            if !input_names.contains(name) {
                return Err(PipelineError::adapter(
                    adapter,
                    format!("graph has no input named {name:?} (inputs: {input_names:?})"),
                ));
            }
        }
        for name in outputs {
            if !output_names.contains(name) {
                return Err(PipelineError::adapter(
                    adapter,
                    format!("graph has no output named {name:?} (outputs: {output_names:?})"),
                ));
            }
        }

        let precision = match session.inputs().first().map(|i| i.dtype()) {
            Some(ort::value::ValueType::Tensor { ty, .. })
                if *ty == ort::tensor::TensorElementType::Float16 =>
            {
                GraphPrecision::F16
            }
            _ => GraphPrecision::F32,
        };

        debug!(
            adapter,
            model = %source.model_path.display(),
            ?input_names,
            ?output_names,
            ?precision,
            "Detected graph IO"
        );

        Ok(Self {
            adapter,
            session,
            precision,
        })
    }

    pub(crate) fn precision(&self) -> GraphPrecision {
        self.precision
    }

    pub(crate) fn adapter(&self) -> &'static str {
        self.adapter
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub(crate) fn encode(&self, array: Array4<f32>) -> Result<DynValue> {
        encode_tensor(self.adapter, self.precision, array)
    }
}

fn encode_tensor(
    adapter: &'static str,
    precision: GraphPrecision,
    array: Array4<f32>,
) -> Result<DynValue> {
    match precision {
        GraphPrecision::F32 => Tensor::from_array(array)
            .map(|t| t.into_dyn())
            .map_err(|e| PipelineError::adapter(adapter, e)),
        GraphPrecision::F16 => {
            let shape = array.shape().to_vec();
            let standard = array.as_standard_layout();
            let f32_slice = standard
                .as_slice()
                .ok_or_else(|| PipelineError::adapter(adapter, "input is not contiguous"))?;
            let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
            fp16_data.convert_from_f32_slice(f32_slice);

            let fp16_array = ArrayD::from_shape_vec(shape, fp16_data)
                .map_err(|e| PipelineError::adapter(adapter, e))?;
            Tensor::from_array(fp16_array)
                .map(|t| t.into_dyn())
                .map_err(|e| PipelineError::adapter(adapter, e))
        }
    }
}

/// Copy a named output to an owned f32 array, widening FP16 graphs.
pub(crate) fn extract_output(
    adapter: &'static str,
    precision: GraphPrecision,
    outputs: &SessionOutputs,
    name: &str,
) -> Result<ArrayD<f32>> {
    let value = &outputs[name];
    match precision {
        GraphPrecision::F32 => value
            .try_extract_array::<f32>()
            .map(|view| view.to_owned())
            .map_err(|e| PipelineError::adapter(adapter, e)),
        GraphPrecision::F16 => {
            let view = value
                .try_extract_array::<f16>()
                .map_err(|e| PipelineError::adapter(adapter, e))?;
            let standard = view.as_standard_layout();
            let fp16_slice = standard
                .as_slice()
                .ok_or_else(|| PipelineError::adapter(adapter, "output is not contiguous"))?;
            let mut f32_data = vec![0.0f32; fp16_slice.len()];
            fp16_slice.convert_to_f32_slice(&mut f32_data);
            ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)
                .map_err(|e| PipelineError::adapter(adapter, e))
        }
    }
}

/// Check an NCHW output's batch and channel axes and narrow it to 4-D.
pub fn expect_nchw(
    adapter: &'static str,
    what: &str,
    array: ArrayD<f32>,
    tiles: usize,
    channels: &[usize],
) -> Result<Array4<f32>> {
    let shape = array.shape().to_vec();
    let array = array.into_dimensionality::<Ix4>().map_err(|_| {
        let message = format!("{what} must be 4-D NCHW, got shape {shape:?}");
        PipelineError::adapter(adapter, message)
    })?;
    let (n, c, _, _) = array.dim();
    if n != tiles {
        return Err(PipelineError::adapter(
            adapter,
            format!("{what} has batch {n}, expected {tiles} tiles"),
        ));
    }
    if !channels.contains(&c) {
        return Err(PipelineError::adapter(
            adapter,
            format!("{what} has {c} channels, expected one of {channels:?}"),
        ));
    }
    Ok(array)
}

/// Check that an opaque feature output keeps the tile index on axis 0.
pub fn expect_tile_axis(
    adapter: &'static str,
    what: &str,
    array: &ArrayD<f32>,
    tiles: usize,
) -> Result<()> {
    match array.shape().first() {
        Some(&n) if n == tiles => Ok(()),
        _ => Err(PipelineError::adapter(
            adapter,
            format!(
                "{what} has shape {:?}, expected {tiles} tiles on axis 0",
                array.shape()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_nchw_moves_channels_forward() {
        let batch = Array4::from_shape_fn((2, 3, 4, 3), |(n, y, x, c)| {
            (n * 1000 + y * 100 + x * 10 + c) as f32
        });
        let nchw = to_nchw(&batch);
        assert_eq!(nchw.dim(), (2, 3, 3, 4));
        assert_eq!(nchw[[1, 2, 0, 3]], batch[[1, 0, 3, 2]]);
        assert!(nchw.is_standard_layout());
    }

    #[test]
    fn expect_nchw_accepts_matching_shape() {
        let array = ArrayD::<f32>::zeros(vec![4, 19, 2, 3]);
        let checked = expect_nchw("segmentation", "scores", array, 4, &[19]).expect("valid");
        assert_eq!(checked.dim(), (4, 19, 2, 3));
    }

    #[test]
    fn expect_nchw_rejects_batch_rank_and_channels() {
        let check = |what, shape: Vec<usize>, channels: &[usize]| {
            expect_nchw("flow", what, ArrayD::zeros(shape), 4, channels).unwrap_err()
        };

        let err = check("flow", vec![3, 2, 1, 1], &[2]);
        assert!(err.to_string().contains("batch 3"));

        let err = check("flow", vec![4, 2, 1], &[2]);
        assert!(err.to_string().contains("4-D"));

        let err = check("scale", vec![4, 5, 1, 1], &[1, 19]);
        assert!(err.to_string().contains("5 channels"));
        assert!(matches!(
            err,
            PipelineError::AdapterCompute {
                adapter: "flow",
                ..
            }
        ));
    }

    #[test]
    fn expect_tile_axis_checks_leading_dimension() {
        assert!(expect_tile_axis("flow", "feature", &ArrayD::zeros(vec![4, 8]), 4).is_ok());
        assert!(expect_tile_axis("flow", "feature", &ArrayD::zeros(vec![2, 8]), 4).is_err());
        assert!(expect_tile_axis("flow", "feature", &ArrayD::zeros(vec![]), 4).is_err());
    }
}
