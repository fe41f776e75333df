//! Checkpoint layout, discovery and the periodic top-k checkpoint callback.
//!
//! A checkpoint is a directory `step=<N>.ckpt` holding `model.bin`,
//! `optim_backbone.bin`, `optim_head.bin` (omitted for weights-only
//! checkpoints) and `state.json`.

use crate::config::MelSpecConfig;
use crate::task::{ForcedAlignmentTask, TaskConfig};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use data_contracts::Vocab;
use models::{ForcedAlignmentModel, ModelConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.bin";
pub const OPTIM_BACKBONE_FILE: &str = "optim_backbone.bin";
pub const OPTIM_HEAD_FILE: &str = "optim_head.bin";
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad checkpoint state {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read or write record {path}: {msg}")]
    Record { path: PathBuf, msg: String },
    #[error("bad checkpoint search pattern: {0}")]
    Pattern(String),
    #[error("{path} is weights-only and cannot resume optimizer state")]
    WeightsOnly { path: PathBuf },
}

/// Hyper-parameters and progress stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub step: usize,
    pub epoch: usize,
    pub weights_only: bool,
    pub vocab: Vocab,
    pub model: ModelConfig,
    pub melspec: MelSpecConfig,
}

pub fn checkpoint_name(step: usize) -> String {
    format!("step={step}.ckpt")
}

/// Step encoded in a checkpoint name (`step=<N>` anywhere in the file stem).
pub fn parse_step(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let (_, rest) = stem.split_once("step=")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Newest `*.ckpt` under `dir` (searched recursively) by encoded step.
/// Entries without a parseable step are skipped.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let pattern = format!("{}/**/*.ckpt", glob::Pattern::escape(&dir.to_string_lossy()));
    let entries = glob::glob(&pattern).map_err(|e| CheckpointError::Pattern(e.to_string()))?;
    let latest = entries
        .filter_map(Result::ok)
        .filter_map(|path| parse_step(&path).map(|step| (step, path)))
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path);
    Ok(latest)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn record_err(path: &Path) -> impl FnOnce(burn::record::RecorderError) -> CheckpointError + '_ {
    move |e| CheckpointError::Record {
        path: path.to_path_buf(),
        msg: e.to_string(),
    }
}

pub fn read_state(dir: &Path) -> Result<CheckpointState, CheckpointError> {
    let path = dir.join(STATE_FILE);
    let raw = fs::read(&path).map_err(io_err(&path))?;
    serde_json::from_slice(&raw).map_err(|source| CheckpointError::Json { path, source })
}

fn write_state(dir: &Path, state: &CheckpointState) -> Result<(), CheckpointError> {
    let path = dir.join(STATE_FILE);
    let data = serde_json::to_vec_pretty(state).map_err(|source| CheckpointError::Json {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, data).map_err(io_err(&path))
}

/// Write `task` to the checkpoint directory `dir`.
pub fn save_checkpoint<B, O>(
    task: &ForcedAlignmentTask<B, O>,
    dir: &Path,
    epoch: usize,
    weights_only: bool,
) -> Result<(), CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<ForcedAlignmentModel<B>, B>,
{
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model_path = dir.join(MODEL_FILE);
    task.model
        .clone()
        .save_file(model_path.clone(), &recorder)
        .map_err(record_err(&model_path))?;
    if !weights_only {
        for (name, optim) in [
            (OPTIM_BACKBONE_FILE, &task.optim_backbone),
            (OPTIM_HEAD_FILE, &task.optim_head),
        ] {
            let path = dir.join(name);
            Recorder::<B>::record(&recorder, optim.to_record(), path.clone())
                .map_err(record_err(&path))?;
        }
    }
    write_state(
        dir,
        &CheckpointState {
            step: task.global_step,
            epoch,
            weights_only,
            vocab: task.cfg.vocab.clone(),
            model: task.cfg.model.clone(),
            melspec: task.cfg.melspec.clone(),
        },
    )
}

/// Restore model, optimizers and step from a full checkpoint.
pub fn restore_checkpoint<B, O>(
    mut task: ForcedAlignmentTask<B, O>,
    dir: &Path,
    device: &B::Device,
) -> Result<(ForcedAlignmentTask<B, O>, CheckpointState), CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<ForcedAlignmentModel<B>, B>,
{
    let state = read_state(dir)?;
    if state.weights_only {
        return Err(CheckpointError::WeightsOnly {
            path: dir.to_path_buf(),
        });
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model_path = dir.join(MODEL_FILE);
    task.model = task
        .model
        .load_file(model_path.clone(), &recorder, device)
        .map_err(record_err(&model_path))?;
    let path = dir.join(OPTIM_BACKBONE_FILE);
    let record = Recorder::<B>::load(&recorder, path.clone(), device).map_err(record_err(&path))?;
    task.optim_backbone = task.optim_backbone.load_record(record);
    let path = dir.join(OPTIM_HEAD_FILE);
    let record = Recorder::<B>::load(&recorder, path.clone(), device).map_err(record_err(&path))?;
    task.optim_head = task.optim_head.load_record(record);
    task.global_step = state.step;
    Ok((task, state))
}

/// Rebuild a model from a checkpoint's stored hyper-parameters and weights.
pub fn load_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(ForcedAlignmentModel<B>, CheckpointState), CheckpointError> {
    let state = read_state(dir)?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model_path = dir.join(MODEL_FILE);
    let model = ForcedAlignmentModel::new(
        &state.model,
        state.melspec.n_mels,
        state.vocab.vocab_size,
        device,
    )
    .load_file(model_path.clone(), &recorder, device)
    .map_err(record_err(&model_path))?;
    Ok((model, state))
}

/// Task configuration equivalent to the one a checkpoint was trained with.
pub fn task_config_from_state(base: &TaskConfig, state: &CheckpointState) -> TaskConfig {
    TaskConfig {
        vocab: state.vocab.clone(),
        model: state.model.clone(),
        melspec: state.melspec.clone(),
        ..base.clone()
    }
}

/// Saves `step=<N>.ckpt` every `every_n_train_steps` steps and keeps the
/// `save_top_k` checkpoints with the highest step among those this callback
/// saved or resumed from. `save_top_k < 0` keeps everything; `0` disables
/// saving. Other files in `dirpath` are never touched.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    pub dirpath: PathBuf,
    pub every_n_train_steps: usize,
    pub save_top_k: i64,
    pub verbose: bool,
    tracked: Vec<(usize, PathBuf)>,
}

impl CheckpointCallback {
    pub fn new(dirpath: impl Into<PathBuf>, every_n_train_steps: usize, save_top_k: i64) -> Self {
        Self {
            dirpath: dirpath.into(),
            every_n_train_steps: every_n_train_steps.max(1),
            save_top_k,
            verbose: true,
            tracked: Vec::new(),
        }
    }

    pub fn should_save(&self, step: usize) -> bool {
        self.save_top_k != 0 && step > 0 && step % self.every_n_train_steps == 0
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dirpath.join(checkpoint_name(step))
    }

    /// Checkpoints eligible for pruning, newest first.
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.tracked.iter().map(|(_, path)| path.as_path())
    }

    fn track(&mut self, step: usize, path: PathBuf) {
        self.tracked.retain(|(_, p)| *p != path);
        self.tracked.push((step, path));
        self.tracked.sort_by(|a, b| b.0.cmp(&a.0));
    }

    /// Adopt the run being resumed from `ckpt`: the checkpoint itself and the
    /// `step=<N>.ckpt` entries of `dirpath` up to its step. Later-step
    /// entries belong to another run and are left alone.
    pub fn resume_from(&mut self, ckpt: &Path) -> Result<(), CheckpointError> {
        let Some(resumed) = parse_step(ckpt) else {
            return Ok(());
        };
        self.track(resumed, ckpt.to_path_buf());
        let entries = match fs::read_dir(&self.dirpath) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&self.dirpath)(e)),
        };
        let earlier: Vec<(usize, PathBuf)> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "ckpt"))
            .filter_map(|path| parse_step(&path).map(|step| (step, path)))
            .filter(|(step, _)| *step <= resumed)
            .collect();
        for (step, path) in earlier {
            self.track(step, path);
        }
        Ok(())
    }

    /// Save `task` if due, then prune. Returns the saved path.
    pub fn on_validation_end<B, O>(
        &mut self,
        task: &ForcedAlignmentTask<B, O>,
        epoch: usize,
    ) -> Result<Option<PathBuf>, CheckpointError>
    where
        B: AutodiffBackend,
        O: Optimizer<ForcedAlignmentModel<B>, B>,
    {
        let step = task.global_step;
        if !self.should_save(step) {
            return Ok(None);
        }
        let path = self.path_for(step);
        save_checkpoint(task, &path, epoch, false)?;
        if self.verbose {
            tracing::info!(step, path = %path.display(), "saved checkpoint");
        }
        self.track(step, path.clone());
        self.prune(&path)?;
        Ok(Some(path))
    }

    /// Remove tracked checkpoints beyond the `save_top_k` newest. `keep` is
    /// never removed.
    pub fn prune(&mut self, keep: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
        if self.save_top_k < 0 {
            return Ok(Vec::new());
        }
        let limit = (self.save_top_k as usize).max(1);
        let mut kept = Vec::with_capacity(limit);
        let mut stale = Vec::new();
        for (step, path) in std::mem::take(&mut self.tracked) {
            if path == keep || kept.len() < limit {
                kept.push((step, path));
            } else {
                stale.push(path);
            }
        }
        self.tracked = kept;
        let mut removed = Vec::new();
        for path in stale {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&path)(e)),
            }
            if self.verbose {
                tracing::info!(path = %path.display(), "removed old checkpoint");
            }
            removed.push(path);
        }
        Ok(removed)
    }
}
