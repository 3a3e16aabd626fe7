use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use flowseg_core::adapters::{
    FlowModel, FlowOutput, SegmentationModel, SegmentationOutput, TileBatch,
};
use flowseg_core::artifacts::{artifact_file_name, ArtifactKind, ArtifactWriter};
use flowseg_core::checkpoint::Restoration;
use flowseg_core::config::{AppConfig, RunOverrides, RunSettings};
use flowseg_core::context::InferenceContext;
use flowseg_core::pipeline::run_manifest_file;
use flowseg_core::{PipelineError, Result};
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayD, Axis, IxDyn};
use tempfile::TempDir;

const CLASSES: usize = 5;
const DOMINANT: usize = 3;
const KEY_FRAME: &str = "aachen_000000_000019_leftImg8bit.png";
const CURRENT_FRAME: &str = "aachen_000000_000020_leftImg8bit.png";

struct DominantClass {
    calls: Rc<Cell<usize>>,
}

impl SegmentationModel for DominantClass {
    fn segment(&mut self, tiles: &TileBatch) -> Result<SegmentationOutput> {
        self.calls.set(self.calls.get() + 1);
        let n = tiles.dim().0;
        let mut scores = Array4::zeros((n, CLASSES, 1, 2));
        scores.index_axis_mut(Axis(1), DOMINANT).fill(2.0);
        let mut features = ArrayD::zeros(IxDyn(&[n, 3]));
        for (tile, mut row) in features.axis_iter_mut(Axis(0)).enumerate() {
            row.fill(tile as f32);
        }
        Ok(SegmentationOutput { scores, features })
    }
}

struct NoMotion {
    calls: Rc<Cell<usize>>,
}

impl FlowModel for NoMotion {
    fn estimate(&mut self, current: &TileBatch, _key: &TileBatch) -> Result<FlowOutput> {
        self.calls.set(self.calls.get() + 1);
        let (n, h, w, _) = current.dim();
        let mut features = ArrayD::zeros(IxDyn(&[n, 2, h, w]));
        for (tile, mut plane) in features.axis_iter_mut(Axis(0)).enumerate() {
            plane.fill(10.0 + tile as f32);
        }
        Ok(FlowOutput {
            flow: Array4::zeros((n, 2, h, w)),
            scale: Array4::ones((n, 1, h, w)),
            features,
        })
    }
}

struct Workspace {
    _dir: TempDir,
    settings: RunSettings,
    calls: Rc<Cell<usize>>,
}

impl Workspace {
    fn new(manifest: &str, steps: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_root = dir.path().join("data");
        let frames = data_root.join("leftImg8bit");
        fs::create_dir_all(&frames).expect("frame dir");
        for (name, shade) in [(KEY_FRAME, 90u8), (CURRENT_FRAME, 140)] {
            RgbImage::from_pixel(16, 8, Rgb([shade, shade / 2, 255 - shade]))
                .save(frames.join(name))
                .expect("write frame");
        }
        let data_list = dir.path().join("list.txt");
        fs::write(&data_list, manifest).expect("write manifest");

        let mut settings = RunSettings::from_config(
            &AppConfig::default(),
            dir.path(),
            &RunOverrides {
                data_dir: Some(data_root),
                data_list: Some(data_list),
                restore_from: Some(dir.path().join("checkpoint")),
                save_dir: Some(dir.path().join("pred")),
                num_classes: Some(CLASSES),
                num_steps: Some(steps),
                ..Default::default()
            },
        );
        settings.input_size = (4, 8);
        settings.output_size = (2, 4);

        Self {
            _dir: dir,
            settings,
            calls: Rc::new(Cell::new(0)),
        }
    }

    fn context(&self) -> InferenceContext {
        InferenceContext::with_models(
            Box::new(DominantClass {
                calls: self.calls.clone(),
            }),
            Box::new(NoMotion {
                calls: self.calls.clone(),
            }),
            Restoration::Absent {
                searched: self.settings.restore_from.clone(),
            },
        )
    }

    fn run(&self) -> Result<(usize, usize)> {
        let writer = ArtifactWriter::new(&self.settings.save_dir)?;
        let mut ctx = self.context();
        let summary = run_manifest_file(&mut ctx, &self.settings, &writer, |_, _| {})?;
        Ok((summary.pairs, summary.files_written))
    }

    fn artifact(&self, kind: ArtifactKind, tile: usize) -> PathBuf {
        self.settings
            .save_dir
            .join(artifact_file_name("aachen_000000_000019_", kind, tile))
    }
}

fn valid_line() -> String {
    format!("leftImg8bit/{KEY_FRAME} leftImg8bit/{CURRENT_FRAME} gtFine/unused.png\n")
}

fn saved_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read save dir")
        .map(|entry| entry.expect("save dir entry").path())
        .collect();
    files.sort();
    files
}

#[test]
fn one_pair_writes_twelve_artifacts() {
    let ws = Workspace::new(&valid_line(), 1);
    let (pairs, files) = ws.run().expect("run");

    assert_eq!((pairs, files), (1, 12));
    assert_eq!(ws.calls.get(), 2);
    assert_eq!(saved_files(&ws.settings.save_dir).len(), 12);

    for tile in 0..4 {
        let pred = image::open(ws.artifact(ArtifactKind::Prediction, tile))
            .expect("open prediction")
            .into_luma8();
        assert_eq!(pred.dimensions(), (4, 2));
        assert!(pred.pixels().all(|p| p.0[0] == DOMINANT as u8));

        let seg: ArrayD<f32> =
            ndarray_npy::read_npy(ws.artifact(ArtifactKind::SegFeature, tile)).expect("seg npy");
        assert_eq!(seg.shape(), &[3]);
        assert!(seg.iter().all(|&v| v == tile as f32));

        let flow: ArrayD<f32> =
            ndarray_npy::read_npy(ws.artifact(ArtifactKind::FlowFeature, tile)).expect("flow npy");
        assert_eq!(flow.shape(), &[2, 1, 2]);
        assert!(flow.iter().all(|&v| v == 10.0 + tile as f32));
    }
}

#[test]
fn rerun_overwrites_with_identical_bytes() {
    let ws = Workspace::new(&valid_line(), 1);
    ws.run().expect("first run");
    let first: Vec<Vec<u8>> = saved_files(&ws.settings.save_dir)
        .iter()
        .map(|path| fs::read(path).expect("read artifact"))
        .collect();

    ws.run().expect("second run");
    let second: Vec<Vec<u8>> = saved_files(&ws.settings.save_dir)
        .iter()
        .map(|path| fs::read(path).expect("read artifact"))
        .collect();

    assert_eq!(first, second);
}

#[test]
fn short_manifest_is_exhausted_after_processing_what_it_has() {
    let ws = Workspace::new(&valid_line(), 2);
    let err = ws.run().unwrap_err();

    assert!(
        matches!(err, PipelineError::ManifestExhausted { line: 2 }),
        "{err}"
    );
    assert_eq!(saved_files(&ws.settings.save_dir).len(), 12);
}

#[test]
fn malformed_line_fails_before_any_inference() {
    let ws = Workspace::new("leftImg8bit/only_two.png leftImg8bit/fields.png\n", 1);
    let err = ws.run().unwrap_err();

    assert!(
        matches!(
            err,
            PipelineError::ManifestFormat {
                line: 1,
                found: 2,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(ws.calls.get(), 0);
    assert!(saved_files(&ws.settings.save_dir).is_empty());
}

#[test]
fn missing_frame_is_a_decode_error() {
    let line = "leftImg8bit/missing_leftImg8bit.png leftImg8bit/missing2.png gtFine/x.png\n";
    let ws = Workspace::new(line, 1);
    let err = ws.run().unwrap_err();

    assert!(matches!(err, PipelineError::ImageDecode { .. }), "{err}");
    assert_eq!(ws.calls.get(), 0);
}

#[test]
fn required_checkpoint_absent_is_fatal() {
    let mut ws = Workspace::new(&valid_line(), 1);
    ws.settings.require_checkpoint = true;

    let err = InferenceContext::restore(&ws.settings)
        .err()
        .expect("restore should fail");
    match err {
        PipelineError::MissingCheckpoint { dir } => assert_eq!(dir, ws.settings.restore_from),
        other => panic!("unexpected error: {other}"),
    }
}
