use tracing::{info, warn};

use crate::adapters::{FlowModel, GraphSource, OrtFlow, OrtSegmentation, SegmentationModel};
use crate::checkpoint::{latest_checkpoint, Restoration};
use crate::config::RunSettings;
use crate::error::{PipelineError, Result};

/// Both loaded adapters, built once and passed by `&mut` into every
/// pipeline pass.
pub struct InferenceContext {
    segmentation: Box<dyn SegmentationModel>,
    flow: Box<dyn FlowModel>,
    restoration: Restoration,
}

impl InferenceContext {
    /// Resolve the latest checkpoint and load both graphs from it.
    ///
    /// Without a checkpoint this is an error when `require_checkpoint` is
    /// set. Otherwise a warning is logged and the fallback graphs from the
    /// configuration are loaded instead.
    pub fn restore(settings: &RunSettings) -> Result<Self> {
        let restoration = latest_checkpoint(&settings.restore_from);

        let (segmentation_path, flow_path) = match &restoration {
            Restoration::Loaded(paths) => {
                info!(checkpoint = %paths.dir.display(), "Restored model parameters");
                (paths.segmentation.clone(), paths.flow.clone())
            }
            Restoration::Absent { searched } => {
                if settings.require_checkpoint {
                    return Err(PipelineError::MissingCheckpoint {
                        dir: searched.clone(),
                    });
                }
                warn!(
                    searched = %searched.display(),
                    segmentation_graph = %settings.segmentation_graph.display(),
                    flow_graph = %settings.flow_graph.display(),
                    "No checkpoint file found, continuing with fallback graphs"
                );
                (
                    settings.segmentation_graph.clone(),
                    settings.flow_graph.clone(),
                )
            }
        };

        let trt_cache_dir = Some(settings.trt_cache_dir.as_path());
        let segmentation = OrtSegmentation::load(
            &GraphSource {
                model_path: &segmentation_path,
                backend: settings.backend,
                trt_cache_dir,
            },
            settings.segmentation_tensors.clone(),
            settings.num_classes,
        )?;
        let flow = OrtFlow::load(
            &GraphSource {
                model_path: &flow_path,
                backend: settings.backend,
                trt_cache_dir,
            },
            settings.flow_tensors.clone(),
            settings.num_classes,
        )?;
        info!(backend = %settings.backend, "Adapters loaded");

        Ok(Self {
            segmentation: Box::new(segmentation),
            flow: Box::new(flow),
            restoration,
        })
    }

    pub fn with_models(
        segmentation: Box<dyn SegmentationModel>,
        flow: Box<dyn FlowModel>,
        restoration: Restoration,
    ) -> Self {
        Self {
            segmentation,
            flow,
            restoration,
        }
    }

    pub fn restoration(&self) -> &Restoration {
        &self.restoration
    }

    pub fn segmentation(&mut self) -> &mut dyn SegmentationModel {
        self.segmentation.as_mut()
    }

    pub fn flow(&mut self) -> &mut dyn FlowModel {
        self.flow.as_mut()
    }
}
