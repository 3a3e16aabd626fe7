use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const CHECKPOINT_INDEX_FILE: &str = "checkpoint";
pub const CHECKPOINT_PREFIX: &str = "model.ckpt-";
pub const SEGMENTATION_GRAPH_FILE: &str = "segmentation.onnx";
pub const FLOW_GRAPH_FILE: &str = "flow.onnx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub dir: PathBuf,
    pub segmentation: PathBuf,
    pub flow: PathBuf,
}

impl CheckpointPaths {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            segmentation: dir.join(SEGMENTATION_GRAPH_FILE),
            flow: dir.join(FLOW_GRAPH_FILE),
            dir,
        }
    }

    fn is_complete(&self) -> bool {
        self.segmentation.is_file() && self.flow.is_file()
    }
}

/// Outcome of the restore step. `Absent` means the adapters run on
/// whatever graphs the caller falls back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restoration {
    Loaded(CheckpointPaths),
    Absent { searched: PathBuf },
}

impl Restoration {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn checkpoint(&self) -> Option<&CheckpointPaths> {
        match self {
            Self::Loaded(paths) => Some(paths),
            Self::Absent { .. } => None,
        }
    }
}

/// Resolve the checkpoint to restore from. An index file named `checkpoint`
/// with a `model_checkpoint_path: "<name>"` line wins; otherwise the
/// `model.ckpt-<step>` subdirectory with the highest step is used.
pub fn latest_checkpoint(restore_from: &Path) -> Restoration {
    let candidate =
        indexed_checkpoint(restore_from).or_else(|| highest_step_checkpoint(restore_from));

    match candidate {
        Some(dir) => {
            let paths = CheckpointPaths::in_dir(dir);
            if paths.is_complete() {
                debug!(dir = %paths.dir.display(), "Checkpoint resolved");
                Restoration::Loaded(paths)
            } else {
                debug!(
                    dir = %paths.dir.display(),
                    "Checkpoint directory is missing exported graphs"
                );
                Restoration::Absent {
                    searched: restore_from.to_path_buf(),
                }
            }
        }
        None => Restoration::Absent {
            searched: restore_from.to_path_buf(),
        },
    }
}

fn indexed_checkpoint(restore_from: &Path) -> Option<PathBuf> {
    let index_path = restore_from.join(CHECKPOINT_INDEX_FILE);
    let index = fs::read_to_string(index_path).ok()?;
    let name = parse_index(&index)?;
    let path = PathBuf::from(name);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(restore_from.join(path))
    }
}

fn parse_index(contents: &str) -> Option<&str> {
    contents.lines().find_map(|line| {
        let value = line.trim().strip_prefix("model_checkpoint_path:")?;
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then_some(value)
    })
}

fn highest_step_checkpoint(restore_from: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(restore_from).ok()?;
    entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let step = name
                .to_str()?
                .strip_prefix(CHECKPOINT_PREFIX)?
                .parse::<u64>()
                .ok()?;
            Some((step, entry.path()))
        })
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path)
}
