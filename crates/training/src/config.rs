//! Training configuration: YAML loading, merging and validation.

use models::ModelConfig;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0} must contain a YAML mapping")]
    NotAMapping(String),
    #[error("invalid config: {0}")]
    Deserialize(#[source] serde_yaml::Error),
    #[error("invalid value for `{key}`: {msg}")]
    Validation { key: &'static str, msg: String },
}

fn invalid(key: &'static str, msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        key,
        msg: msg.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatmulPrecision {
    Highest,
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipAlgorithm {
    Norm,
    Value,
}

/// `devices:` accepts `auto` or a device count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    Count(usize),
    Named(String),
}

impl Default for Devices {
    fn default() -> Self {
        Devices::Named("auto".into())
    }
}

/// Feature extraction settings written by the binarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelSpecConfig {
    pub n_mels: usize,
    pub sample_rate: u32,
    pub hop_length: u32,
    #[serde(default)]
    pub win_length: u32,
    #[serde(default)]
    pub n_fft: u32,
    #[serde(default)]
    pub fmin: f32,
    #[serde(default)]
    pub fmax: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub backbone: f64,
    pub head: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub total_steps: usize,
    #[serde(default)]
    pub weight_decay: f32,
    pub lr: LearningRates,
    #[serde(default)]
    pub freeze_backbone: bool,
}

pub const NUM_LOSSES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    /// Frame, edge, edge-diff, CTC and consistency weights, in that order.
    pub weights: Vec<f32>,
    #[serde(rename = "enable_RampUpScheduler", default)]
    pub enable_ramp_up: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossFunctionConfig {
    #[serde(default)]
    pub label_smoothing: f32,
}

impl Default for LossFunctionConfig {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub losses: LossWeights,
    #[serde(default)]
    pub function: LossFunctionConfig,
}

fn default_seed() -> u64 {
    114514
}

fn default_precision() -> String {
    "32-true".into()
}

/// `precision:` may be written as `32` or `bf16-mixed`.
fn precision_string<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "precision must be a string or number, got {other:?}"
        ))),
    }
}

fn default_weights() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn default_matmul() -> MatmulPrecision {
    MatmulPrecision::High
}

fn default_accelerator() -> Accelerator {
    Accelerator::Auto
}

fn default_clip_algorithm() -> ClipAlgorithm {
    ClipAlgorithm::Norm
}

fn default_keep() -> i64 {
    -1
}

/// Merged run + global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model_name: String,
    #[serde(default = "default_matmul")]
    pub float32_matmul_precision: MatmulPrecision,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    #[serde(default)]
    pub dataloader_workers: usize,
    #[serde(default)]
    pub data_augmentation_size: usize,
    #[serde(default = "default_weights")]
    pub oversampling_weights: [f32; 3],
    pub batch_max_length: f32,
    pub binning_length: f32,
    #[serde(default)]
    pub drop_last: bool,
    pub model: ModelConfig,
    pub melspec_config: MelSpecConfig,
    pub optimizer_config: OptimizerConfig,
    pub loss_config: LossConfig,
    #[serde(default = "default_accelerator")]
    pub accelerator: Accelerator,
    #[serde(default)]
    pub devices: Devices,
    #[serde(default = "default_precision", deserialize_with = "precision_string")]
    pub precision: String,
    #[serde(default)]
    pub gradient_clip_val: f32,
    #[serde(default = "default_clip_algorithm")]
    pub gradient_clip_algorithm: ClipAlgorithm,
    pub val_check_interval: usize,
    #[serde(default = "default_keep")]
    pub num_ckpt_keep: i64,
}

/// Shallow merge: every top-level key of `global` replaces the one in `run`.
pub fn merge_config(run: Value, global: Value) -> Result<Value, ConfigError> {
    let Value::Mapping(mut merged) = run else {
        return Err(ConfigError::NotAMapping("training config".into()));
    };
    let Value::Mapping(global) = global else {
        return Err(ConfigError::NotAMapping("global config".into()));
    };
    for (key, value) in global {
        merged.insert(key, value);
    }
    Ok(Value::Mapping(merged))
}

pub fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Yaml {
        path: path.to_path_buf(),
        source: e,
    })
}

impl TrainConfig {
    /// Load `config_path`, merge `<data_folder>/binary/global_config.yaml`
    /// over it and validate the result.
    pub fn load(config_path: &Path, data_folder: &Path) -> Result<Self, ConfigError> {
        let run = read_yaml(config_path)?;
        let global = read_yaml(&data_folder.join("binary").join("global_config.yaml"))?;
        Self::from_value(merge_config(run, global)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_value(value).map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(invalid("model_name", "must not be empty"));
        }
        if self.oversampling_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("oversampling_weights", "weights must be non-negative"));
        }
        if self.oversampling_weights.iter().all(|w| *w == 0.0) {
            return Err(invalid("oversampling_weights", "at least one weight must be positive"));
        }
        if !(self.batch_max_length > 0.0) {
            return Err(invalid("batch_max_length", "must be positive"));
        }
        if !(self.binning_length > 0.0) {
            return Err(invalid("binning_length", "must be positive"));
        }
        self.model
            .validate()
            .map_err(|msg| invalid("model", msg))?;
        if self.melspec_config.n_mels == 0 {
            return Err(invalid("melspec_config.n_mels", "must be positive"));
        }
        if self.melspec_config.hop_length == 0 || self.melspec_config.sample_rate == 0 {
            return Err(invalid(
                "melspec_config",
                "sample_rate and hop_length must be positive",
            ));
        }
        if self.optimizer_config.total_steps == 0 {
            return Err(invalid("optimizer_config.total_steps", "must be positive"));
        }
        let lr = &self.optimizer_config.lr;
        if !(lr.backbone >= 0.0 && lr.head > 0.0) {
            return Err(invalid(
                "optimizer_config.lr",
                "head rate must be positive and backbone rate non-negative",
            ));
        }
        if self.optimizer_config.weight_decay < 0.0 {
            return Err(invalid("optimizer_config.weight_decay", "must be non-negative"));
        }
        let losses = &self.loss_config.losses;
        if losses.weights.len() != NUM_LOSSES {
            return Err(invalid(
                "loss_config.losses.weights",
                format!("expected {NUM_LOSSES} weights, got {}", losses.weights.len()),
            ));
        }
        if !losses.enable_ramp_up.is_empty() && losses.enable_ramp_up.len() != NUM_LOSSES {
            return Err(invalid(
                "loss_config.losses.enable_RampUpScheduler",
                format!(
                    "expected {NUM_LOSSES} flags, got {}",
                    losses.enable_ramp_up.len()
                ),
            ));
        }
        let smoothing = self.loss_config.function.label_smoothing;
        if !(0.0..1.0).contains(&smoothing) {
            return Err(invalid(
                "loss_config.function.label_smoothing",
                "must be in [0, 1)",
            ));
        }
        match &self.devices {
            Devices::Count(1) => {}
            Devices::Named(name) if name == "auto" => {}
            other => {
                return Err(invalid(
                    "devices",
                    format!("only single-device training is supported (got {other:?})"),
                ))
            }
        }
        if self.val_check_interval == 0 {
            return Err(invalid("val_check_interval", "must be positive"));
        }
        if !self.gradient_clip_val.is_finite() {
            return Err(invalid("gradient_clip_val", "must be finite"));
        }
        Ok(())
    }

    /// Batch budget in seconds. Augmented copies share the batch with their
    /// originals, so the budget halves when augmentation is on.
    pub fn effective_batch_max_length(&self) -> f32 {
        if self.data_augmentation_size > 0 {
            self.batch_max_length / 2.0
        } else {
            self.batch_max_length
        }
    }

    pub fn ramp_up_flags(&self) -> [bool; NUM_LOSSES] {
        let mut flags = [false; NUM_LOSSES];
        for (flag, enabled) in flags.iter_mut().zip(&self.loss_config.losses.enable_ramp_up) {
            *flag = *enabled;
        }
        flags
    }

    pub fn loss_weights(&self) -> [f32; NUM_LOSSES] {
        let mut weights = [0.0; NUM_LOSSES];
        for (w, v) in weights.iter_mut().zip(&self.loss_config.losses.weights) {
            *w = *v;
        }
        weights
    }

    /// Whether `precision` asks for full f32 training.
    pub fn is_full_precision(&self) -> bool {
        matches!(self.precision.as_str(), "32" | "32-true" | "full")
    }
}
