use std::io::BufRead;
use std::path::Path;

use ndarray::ArrayView3;
use tracing::{debug, info, info_span};

use crate::adapters::{expect_tile_axis, FlowOutput, SegmentationOutput};
use crate::artifacts::ArtifactWriter;
use crate::config::RunSettings;
use crate::context::InferenceContext;
use crate::error::{PipelineError, Result};
use crate::image_io::{decode_bgr, flow_input, segmentation_input};
use crate::manifest::{FramePair, ManifestWalker};
use crate::tiling::TileLayout;
use crate::warp::{OutputResolver, ScaleCombiner, WarpEngine};

pub use crate::artifacts::FrameArtifacts;

#[derive(Debug, Clone)]
pub struct WarpPipeline {
    input_size: (usize, usize),
    flow_size: (usize, usize),
    image_mean: [f32; 3],
    num_classes: usize,
    seg_layout: TileLayout,
    flow_layout: TileLayout,
    warp: WarpEngine,
    combiner: ScaleCombiner,
    resolver: OutputResolver,
}

impl WarpPipeline {
    pub fn new(settings: &RunSettings) -> Result<Self> {
        settings.validate()?;

        let input_size = settings.input_size;
        let flow_size = settings.flow_size();
        let seg_layout = TileLayout::quadrants(input_size.0, input_size.1)?;
        let flow_layout = TileLayout::quadrants(flow_size.0, flow_size.1)?;
        let (out_h, out_w) = settings.output_size;

        Ok(Self {
            input_size,
            flow_size,
            image_mean: settings.image_mean,
            num_classes: settings.num_classes,
            seg_layout,
            flow_layout,
            warp: WarpEngine::new(settings.boundary),
            combiner: ScaleCombiner,
            resolver: OutputResolver::new(out_h, out_w),
        })
    }

    pub fn tile_count(&self) -> usize {
        self.seg_layout.len()
    }

    pub fn process(&self, ctx: &mut InferenceContext, pair: &FramePair) -> Result<FrameArtifacts> {
        let key = decode_bgr(&pair.key_frame)?;
        let current = decode_bgr(&pair.current_frame)?;
        self.process_frames(ctx, key.view(), current.view())
    }

    /// Run a pass over already decoded BGR frames in `[0, 255]`.
    pub fn process_frames(
        &self,
        ctx: &mut InferenceContext,
        key: ArrayView3<'_, f32>,
        current: ArrayView3<'_, f32>,
    ) -> Result<FrameArtifacts> {
        let seg_tiles = self
            .seg_layout
            .split(segmentation_input(key, self.image_mean, self.input_size).view())?;
        let key_tiles = self
            .flow_layout
            .split(flow_input(key, self.flow_size).view())?;
        let current_tiles = self
            .flow_layout
            .split(flow_input(current, self.flow_size).view())?;

        let segmentation = ctx.segmentation().segment(&seg_tiles)?;
        self.check_segmentation(&segmentation)?;
        let flow = ctx.flow().estimate(&current_tiles, &key_tiles)?;
        self.check_flow(&flow)?;

        let warped = self
            .warp
            .warp(segmentation.scores.view(), flow.flow.view())?;
        let combined = self.combiner.combine(warped.view(), flow.scale.view())?;
        let labels = self.resolver.resolve(combined.view())?;

        Ok(FrameArtifacts {
            flow_features: flow.features,
            seg_features: segmentation.features,
            labels,
        })
    }

    fn check_segmentation(&self, output: &SegmentationOutput) -> Result<()> {
        let (tiles, classes, _, _) = output.scores.dim();
        if tiles != self.tile_count() || classes != self.num_classes {
            return Err(PipelineError::adapter(
                "segmentation",
                format!(
                    "scores are {tiles} tiles x {classes} classes, expected {} x {}",
                    self.tile_count(),
                    self.num_classes
                ),
            ));
        }
        expect_tile_axis("segmentation", "features", &output.features, tiles)
    }

    fn check_flow(&self, output: &FlowOutput) -> Result<()> {
        let tiles = output.flow.dim().0;
        if tiles != self.tile_count() {
            return Err(PipelineError::adapter(
                "flow",
                format!("flow has {tiles} tiles, expected {}", self.tile_count()),
            ));
        }
        expect_tile_axis("flow", "features", &output.features, tiles)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pairs: usize,
    pub files_written: usize,
}

/// Walk `num_steps` manifest entries, processing and persisting each pair
/// before reading the next line. `on_progress(done, total)` runs after
/// every pair.
pub fn run_manifest<R: BufRead>(
    ctx: &mut InferenceContext,
    settings: &RunSettings,
    manifest: R,
    writer: &ArtifactWriter,
    mut on_progress: impl FnMut(usize, usize),
) -> Result<RunSummary> {
    let pipeline = WarpPipeline::new(settings)?;
    let walker = ManifestWalker::new(manifest, settings.data_root.clone(), settings.num_steps);
    let total = walker.steps();
    let mut summary = RunSummary::default();

    info!(
        total,
        data_root = %settings.data_root.display(),
        save_dir = %writer.save_dir().display(),
        boundary = %settings.boundary,
        "Starting manifest walk"
    );

    for (index, pair) in walker.enumerate() {
        let pair = pair?;
        let span = info_span!("pair", index, key = %pair.identifier());
        let _guard = span.enter();

        let artifacts = pipeline.process(ctx, &pair)?;
        let written = writer.write_frame(&pair.key_frame, &artifacts)?;
        debug!(files = written.len(), "Pair finished");

        summary.pairs += 1;
        summary.files_written += written.len();
        on_progress(summary.pairs, total);
    }

    Ok(summary)
}

/// Open the manifest file and run over it.
pub fn run_manifest_file(
    ctx: &mut InferenceContext,
    settings: &RunSettings,
    writer: &ArtifactWriter,
    on_progress: impl FnMut(usize, usize),
) -> Result<RunSummary> {
    let manifest = open_manifest(&settings.data_list)?;
    run_manifest(ctx, settings, manifest, writer, on_progress)
}

fn open_manifest(path: &Path) -> Result<std::io::BufReader<std::fs::File>> {
    let file = std::fs::File::open(path).map_err(|e| {
        PipelineError::Config(format!("cannot open manifest {}: {e}", path.display()))
    })?;
    Ok(std::io::BufReader::new(file))
}
