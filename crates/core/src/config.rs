use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::backend::InferenceBackend;
use crate::adapters::flow::FlowTensors;
use crate::adapters::segmentation::SegmentationTensors;
use crate::error::PipelineError;
use crate::image_io::DEFAULT_IMAGE_MEAN;
use crate::sampling::BoundaryPolicy;
use crate::tiling::{QUADRANT_COLS, QUADRANT_ROWS};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_HOME_DIR: &str = "FLOWSEG_HOME";
const DEFAULT_HOME_DIR: &str = ".flowseg";

/// Labels are stored as u8.
pub const MAX_CLASSES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_root: PathBuf,
    pub data_list: PathBuf,
    pub restore_from: PathBuf,
    pub save_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    /// Used when no checkpoint is found under `restore_from`.
    pub segmentation_graph: PathBuf,
    pub flow_graph: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub num_classes: usize,
    /// BGR order.
    pub image_mean: [f32; 3],
    pub segmentation: SegmentationTensors,
    pub flow: FlowTensors,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub num_steps: usize,
    /// `[height, width]` of the segmentation input frame.
    pub input_size: [usize; 2],
    /// `[height, width]` of each label tile.
    pub output_size: [usize; 2],
    pub boundary: BoundaryPolicy,
    pub require_checkpoint: bool,
    pub backend: InferenceBackend,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/cityscapes"),
            data_list: PathBuf::from("list/imagestrain_13_list.txt"),
            restore_from: PathBuf::from("checkpoint"),
            save_dir: PathBuf::from("pred/train"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            segmentation_graph: PathBuf::from("models/segmentation.onnx"),
            flow_graph: PathBuf::from("models/flow.onnx"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 19,
            image_mean: DEFAULT_IMAGE_MEAN,
            segmentation: SegmentationTensors::default(),
            flow: FlowTensors::default(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_steps: 38675,
            input_size: [1024, 2048],
            output_size: [512, 1024],
            boundary: BoundaryPolicy::Clamp,
            require_checkpoint: false,
            backend: InferenceBackend::Cuda,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the home directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FLOWSEG_HOME environment variable
/// 3. Default: ./.flowseg
pub fn home_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_HOME_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from(DEFAULT_HOME_DIR)
}

pub fn config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(CONFIG_FILE_NAME)
}

/// Create the home directory and a default config.toml on first run.
/// An existing config file is never overwritten.
pub fn initialize_home_dir(home_dir: &Path) -> Result<()> {
    if !home_dir.exists() {
        fs::create_dir_all(home_dir)
            .with_context(|| format!("failed to create home directory: {}", home_dir.display()))?;
    }

    let cfg_path = config_path(home_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Command-line values that take precedence over config.toml.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub data_dir: Option<PathBuf>,
    pub data_list: Option<PathBuf>,
    pub restore_from: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub num_classes: Option<usize>,
    pub num_steps: Option<usize>,
    pub backend: Option<InferenceBackend>,
    pub boundary: Option<BoundaryPolicy>,
    pub require_checkpoint: bool,
}

/// Fully resolved settings for one run.
///
/// Dataset paths (`data_root`, `data_list`, `restore_from`, `save_dir`)
/// stay relative to the working directory. Graph and cache paths resolve
/// against the home directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub data_root: PathBuf,
    pub data_list: PathBuf,
    pub restore_from: PathBuf,
    pub save_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub segmentation_graph: PathBuf,
    pub flow_graph: PathBuf,
    pub num_classes: usize,
    pub image_mean: [f32; 3],
    pub segmentation_tensors: SegmentationTensors,
    pub flow_tensors: FlowTensors,
    pub num_steps: usize,
    pub input_size: (usize, usize),
    pub output_size: (usize, usize),
    pub boundary: BoundaryPolicy,
    pub require_checkpoint: bool,
    pub backend: InferenceBackend,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig, home_dir: &Path, overrides: &RunOverrides) -> Self {
        let paths = &config.paths;
        Self {
            data_root: overrides
                .data_dir
                .clone()
                .unwrap_or_else(|| paths.data_root.clone()),
            data_list: overrides
                .data_list
                .clone()
                .unwrap_or_else(|| paths.data_list.clone()),
            restore_from: overrides
                .restore_from
                .clone()
                .unwrap_or_else(|| paths.restore_from.clone()),
            save_dir: overrides
                .save_dir
                .clone()
                .unwrap_or_else(|| paths.save_dir.clone()),
            trt_cache_dir: resolve_relative_to(home_dir, &paths.trt_cache_dir),
            segmentation_graph: resolve_relative_to(home_dir, &paths.segmentation_graph),
            flow_graph: resolve_relative_to(home_dir, &paths.flow_graph),
            num_classes: overrides.num_classes.unwrap_or(config.model.num_classes),
            image_mean: config.model.image_mean,
            segmentation_tensors: config.model.segmentation.clone(),
            flow_tensors: config.model.flow.clone(),
            num_steps: overrides.num_steps.unwrap_or(config.run.num_steps),
            input_size: (config.run.input_size[0], config.run.input_size[1]),
            output_size: (config.run.output_size[0], config.run.output_size[1]),
            boundary: overrides.boundary.unwrap_or(config.run.boundary),
            require_checkpoint: overrides.require_checkpoint || config.run.require_checkpoint,
            backend: overrides.backend.unwrap_or(config.run.backend),
        }
    }

    /// Flow input is half the segmentation input on both axes.
    pub fn flow_size(&self) -> (usize, usize) {
        (self.input_size.0 / 2, self.input_size.1 / 2)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.num_classes == 0 || self.num_classes > MAX_CLASSES {
            return Err(PipelineError::Config(format!(
                "num_classes must be in 1..={MAX_CLASSES}, got {}",
                self.num_classes
            )));
        }

        let (h, w) = self.input_size;
        let (flow_h, flow_w) = self.flow_size();
        if h == 0 || w == 0 || h % 2 != 0 || w % 2 != 0 {
            return Err(PipelineError::Config(format!(
                "input size {h}x{w} has no exact half-resolution flow input"
            )));
        }
        if h % QUADRANT_ROWS != 0
            || w % QUADRANT_COLS != 0
            || flow_h % QUADRANT_ROWS != 0
            || flow_w % QUADRANT_COLS != 0
        {
            return Err(PipelineError::Config(format!(
                "input size {h}x{w} and flow size {flow_h}x{flow_w} must both split into \
                 {QUADRANT_ROWS}x{QUADRANT_COLS} tiles"
            )));
        }

        let (out_h, out_w) = self.output_size;
        if out_h == 0 || out_w == 0 {
            return Err(PipelineError::Config(format!(
                "output size must be non-empty, got {out_h}x{out_w}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RunSettings {
        RunSettings::from_config(
            &AppConfig::default(),
            Path::new("/home/flowseg"),
            &RunOverrides::default(),
        )
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(
            cfg.paths.data_list,
            PathBuf::from("list/imagestrain_13_list.txt")
        );
        assert_eq!(cfg.paths.restore_from, PathBuf::from("checkpoint"));
        assert_eq!(cfg.model.num_classes, 19);
        assert_eq!(cfg.model.image_mean, DEFAULT_IMAGE_MEAN);
        assert_eq!(cfg.run.num_steps, 38675);
        assert_eq!(cfg.run.input_size, [1024, 2048]);
        assert_eq!(cfg.run.output_size, [512, 1024]);
        assert_eq!(cfg.run.boundary, BoundaryPolicy::Clamp);
        assert!(!cfg.run.require_checkpoint);
        assert_eq!(cfg.run.backend, InferenceBackend::Cuda);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = concat!(
            "[run]\nboundary = \"zero\"\nbackend = \"tensorrt\"\n",
            "\n[model.flow]\nscale = \"confidence\"\n",
        );
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");
        assert_eq!(cfg.run.boundary, BoundaryPolicy::Zero);
        assert_eq!(cfg.run.backend, InferenceBackend::Tensorrt);
        assert_eq!(cfg.run.num_steps, 38675);
        assert_eq!(cfg.model.flow.scale, "confidence");
        assert_eq!(cfg.model.flow.flow, "flow");
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load defaults");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write empty config");
        let loaded = AppConfig::load_from_path(&path).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_invalid_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[run\nnum_steps = ").expect("write broken config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn home_dir_uses_cli_override() {
        assert_eq!(
            home_dir(Some(Path::new("/custom"))),
            PathBuf::from("/custom")
        );
    }

    #[test]
    fn home_dir_env_then_default() {
        let old = env::var_os(ENV_HOME_DIR);

        env::set_var(ENV_HOME_DIR, "/env/path");
        let from_env = home_dir(None);
        env::remove_var(ENV_HOME_DIR);
        let fallback = home_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_HOME_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from(".flowseg"));
    }

    #[test]
    fn initialize_creates_home_dir_and_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home");
        initialize_home_dir(&home).expect("initialize home dir");

        assert!(home.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&home)).expect("load written config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg_path = config_path(temp.path());
        let custom_content = "[run]\nnum_steps = 3\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_home_dir(temp.path()).expect("initialize home dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_kinds() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = RunOverrides {
            data_dir: Some(PathBuf::from("/datasets/city")),
            save_dir: Some(PathBuf::from("out")),
            num_classes: Some(21),
            num_steps: Some(4),
            backend: Some(InferenceBackend::Cpu),
            boundary: Some(BoundaryPolicy::Zero),
            require_checkpoint: true,
            ..RunOverrides::default()
        };
        let home = Path::new("/home/flowseg");
        let s = RunSettings::from_config(&AppConfig::default(), home, &overrides);
        assert_eq!(s.data_root, PathBuf::from("/datasets/city"));
        assert_eq!(s.save_dir, PathBuf::from("out"));
        assert_eq!(s.data_list, PathBuf::from("list/imagestrain_13_list.txt"));
        assert_eq!(s.num_classes, 21);
        assert_eq!(s.num_steps, 4);
        assert_eq!(s.backend, InferenceBackend::Cpu);
        assert_eq!(s.boundary, BoundaryPolicy::Zero);
        assert!(s.require_checkpoint);
    }

    #[test]
    fn graph_paths_resolve_against_home() {
        let s = settings();
        assert_eq!(
            s.segmentation_graph,
            PathBuf::from("/home/flowseg/models/segmentation.onnx")
        );
        assert_eq!(s.trt_cache_dir, PathBuf::from("/home/flowseg/trt_cache"));
        assert_eq!(s.flow_size(), (512, 1024));
    }

    #[test]
    fn validate_accepts_defaults() {
        settings().validate().expect("defaults are valid");
    }

    #[test]
    fn validate_rejects_class_counts_outside_u8() {
        let mut s = settings();
        s.num_classes = 0;
        assert!(s.validate().is_err());
        s.num_classes = 257;
        assert!(matches!(s.validate(), Err(PipelineError::Config(_))));
        s.num_classes = 256;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_sizes_without_even_flow_tiles() {
        let mut s = settings();
        s.input_size = (1022, 2048);
        assert!(s.validate().is_err());
        s.input_size = (1023, 2048);
        assert!(s.validate().is_err());
        s.input_size = (4, 8);
        assert!(s.validate().is_ok());
        s.output_size = (0, 8);
        assert!(s.validate().is_err());
    }
}
