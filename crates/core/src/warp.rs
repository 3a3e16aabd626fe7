//! Flow-guided propagation of key-frame class scores onto the current frame.
//!
//! All tensors here are NCHW batches whose leading axis is the tile index:
//!
//! - scores: `[tiles, classes, h, w]`
//! - flow: `[tiles, 2, fh, fw]`, channel 0 is the horizontal displacement
//!   and channel 1 the vertical one, both in flow-resolution pixels
//! - scale: `[tiles, 1 | classes, fh, fw]`

use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};

use crate::error::{PipelineError, Result};
use crate::sampling::{resize_nchw, sample_bilinear, BoundaryPolicy};

pub const FLOW_CHANNELS: usize = 2;

/// Remaps key-frame aligned scores into current-frame alignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarpEngine {
    policy: BoundaryPolicy,
}

impl WarpEngine {
    pub fn new(policy: BoundaryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
    }

    /// Resize `scores` to the flow resolution, then sample every output
    /// pixel `p` at `p + flow(p)`.
    pub fn warp(
        &self,
        scores: ArrayView4<'_, f32>,
        flow: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        let (tiles, classes, _, _) = scores.dim();
        let (flow_tiles, flow_channels, fh, fw) = flow.dim();
        if flow_tiles != tiles {
            return Err(PipelineError::Shape(format!(
                "flow batch has {flow_tiles} tiles, scores have {tiles}"
            )));
        }
        if flow_channels != FLOW_CHANNELS {
            return Err(PipelineError::Shape(format!(
                "flow must have {FLOW_CHANNELS} channels, got {flow_channels}"
            )));
        }

        let aligned = resize_nchw(scores, fh, fw);
        let mut warped = Array4::zeros((tiles, classes, fh, fw));

        for t in 0..tiles {
            let dx = flow.index_axis(Axis(0), t).index_axis_move(Axis(0), 0);
            let dy = flow.index_axis(Axis(0), t).index_axis_move(Axis(0), 1);
            let source = aligned.index_axis(Axis(0), t);
            let mut target = warped.index_axis_mut(Axis(0), t);

            for y in 0..fh {
                for x in 0..fw {
                    let sy = y as f32 + dy[[y, x]];
                    let sx = x as f32 + dx[[y, x]];
                    for c in 0..classes {
                        target[[c, y, x]] =
                            sample_bilinear(source.index_axis(Axis(0), c), sy, sx, self.policy);
                    }
                }
            }
        }

        Ok(warped)
    }
}

/// Attenuates warped evidence by the flow confidence map.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleCombiner;

impl ScaleCombiner {
    pub fn combine(
        &self,
        warped: ArrayView4<'_, f32>,
        scale: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        let (tiles, classes, h, w) = warped.dim();
        let (scale_tiles, scale_channels, sh, sw) = scale.dim();
        if scale_tiles != tiles || (sh, sw) != (h, w) {
            return Err(PipelineError::Shape(format!(
                "scale map is {scale_tiles}x{sh}x{sw}, warped scores are {tiles}x{h}x{w}"
            )));
        }
        if scale_channels != 1 && scale_channels != classes {
            return Err(PipelineError::Shape(format!(
                "scale map has {scale_channels} channels, expected 1 or {classes}"
            )));
        }

        let scale = scale
            .broadcast(warped.raw_dim())
            .ok_or_else(|| PipelineError::Shape("scale map does not broadcast".to_string()))?;

        let mut combined = warped.to_owned();
        Zip::from(&mut combined)
            .and(&scale)
            .for_each(|value, &gate| *value *= gate);
        Ok(combined)
    }
}

/// Upsamples combined scores and reduces them to per-pixel class labels.
#[derive(Debug, Clone, Copy)]
pub struct OutputResolver {
    out_h: usize,
    out_w: usize,
}

impl OutputResolver {
    pub fn new(out_h: usize, out_w: usize) -> Self {
        Self { out_h, out_w }
    }

    /// Returns `[tiles, out_h, out_w]` labels. Ties go to the lowest class index.
    pub fn resolve(&self, combined: ArrayView4<'_, f32>) -> Result<Array3<u8>> {
        let (tiles, classes, _, _) = combined.dim();
        if classes == 0 || classes > usize::from(u8::MAX) + 1 {
            return Err(PipelineError::Shape(format!(
                "cannot store {classes} classes in an 8-bit label map"
            )));
        }

        let upsampled = resize_nchw(combined, self.out_h, self.out_w);
        let labels = Array3::from_shape_fn((tiles, self.out_h, self.out_w), |(t, y, x)| {
            let mut best_class = 0usize;
            let mut best_score = upsampled[[t, 0, y, x]];
            for c in 1..classes {
                let score = upsampled[[t, c, y, x]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            best_class as u8
        });
        Ok(labels)
    }
}
