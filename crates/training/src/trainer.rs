//! Step-driven training loop with periodic validation and checkpointing.

use crate::checkpoint::{restore_checkpoint, save_checkpoint, CheckpointCallback, CheckpointError};
use crate::task::{validate_batch, ForcedAlignmentTask, ValidationSummary};
use anyhow::Context;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use burn_dataset::{collate, AlignDataLoader};
use models::ForcedAlignmentModel;
use std::path::Path;

/// Consecutive epochs without a batch tolerated before `fit` gives up.
/// Fractional oversampling weights can draw an empty epoch by chance.
pub const MAX_EMPTY_EPOCHS: usize = 1000;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub max_steps: usize,
    /// `None` trains until `max_steps`.
    pub max_epochs: Option<usize>,
    pub val_check_interval: usize,
}

pub struct Trainer<B: AutodiffBackend> {
    pub cfg: TrainerConfig,
    device: B::Device,
    checkpoint: Option<CheckpointCallback>,
    progress: crate::progress::ProgressReporter,
    pub epoch: usize,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(cfg: TrainerConfig, device: B::Device) -> Self {
        Self {
            cfg,
            device,
            checkpoint: None,
            progress: crate::progress::ProgressReporter::new(1, true),
            epoch: 0,
        }
    }

    pub fn with_checkpoint(mut self, callback: CheckpointCallback) -> Self {
        self.checkpoint = Some(callback);
        self
    }

    pub fn with_progress(mut self, progress: crate::progress::ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Train until `max_steps` (or `max_epochs`). With `ckpt_path`, model,
    /// optimizer state, step and epoch are restored first.
    pub fn fit<O>(
        &mut self,
        task: ForcedAlignmentTask<B, O>,
        train: &mut AlignDataLoader,
        valid: &mut AlignDataLoader,
        ckpt_path: Option<&Path>,
    ) -> anyhow::Result<ForcedAlignmentTask<B, O>>
    where
        O: Optimizer<ForcedAlignmentModel<B>, B>,
    {
        let mut task = task;
        if let Some(path) = ckpt_path {
            let (restored, state) = restore_checkpoint(task, path, &self.device)
                .with_context(|| format!("failed to resume from {}", path.display()))?;
            task = restored;
            self.epoch = state.epoch;
            if let Some(callback) = &mut self.checkpoint {
                callback.resume_from(path)?;
            }
            tracing::info!(
                step = state.step,
                epoch = state.epoch,
                path = %path.display(),
                "resumed from checkpoint"
            );
        }

        let vocab_size = task.cfg.vocab_size();
        let max_steps = self.cfg.max_steps;
        let interval = self.cfg.val_check_interval.max(1);
        if task.global_step < max_steps && train.expected_items() <= 0.0 {
            anyhow::bail!(
                "training sampler draws no items: every label type present has oversampling weight 0"
            );
        }
        let mut empty_epochs = 0usize;
        'epochs: while task.global_step < max_steps
            && self.cfg.max_epochs.map_or(true, |m| self.epoch < m)
        {
            let mut batches = 0usize;
            for items in train.epoch() {
                let items = items.context("failed to load training batch")?;
                let batch = collate::<B>(&items, vocab_size, &self.device)
                    .context("failed to collate training batch")?;
                let out = task.training_step(&batch);
                batches += 1;
                if !out.total.is_finite() {
                    tracing::warn!(step = task.global_step, "non-finite training loss");
                }

                let mut metrics = out.named_metrics();
                metrics.push(("lr_backbone", out.lr_backbone as f32));
                metrics.push(("lr_head", out.lr_head as f32));
                self.progress
                    .on_train_batch_end(self.epoch, task.global_step, max_steps, &metrics);

                if task.global_step % interval == 0 {
                    self.progress.finish_line();
                    let summary = self.run_validation(&task, valid)?;
                    log_validation(task.global_step, &summary);
                    if let Some(callback) = &mut self.checkpoint {
                        callback.on_validation_end(&task, self.epoch)?;
                    }
                }
                if task.global_step >= max_steps {
                    break 'epochs;
                }
            }
            if batches == 0 {
                empty_epochs += 1;
                tracing::debug!(epoch = self.epoch, empty_epochs, "training epoch drew no batches");
                if empty_epochs >= MAX_EMPTY_EPOCHS {
                    anyhow::bail!("training loader produced no batches for {empty_epochs} epochs in a row");
                }
            } else {
                empty_epochs = 0;
            }
            self.epoch += 1;
        }
        self.progress.finish_line();
        tracing::info!(
            step = task.global_step,
            epoch = self.epoch,
            "training finished"
        );
        Ok(task)
    }

    pub fn run_validation<O>(
        &self,
        task: &ForcedAlignmentTask<B, O>,
        valid: &mut AlignDataLoader,
    ) -> anyhow::Result<ValidationSummary>
    where
        O: Optimizer<ForcedAlignmentModel<B>, B>,
    {
        let model = task.valid_model();
        let weights = task.cfg.weights_at(task.global_step);
        let mut summary = ValidationSummary::default();
        for items in valid.epoch() {
            let items = items.context("failed to load validation batch")?;
            let batch = collate::<B::InnerBackend>(&items, task.cfg.vocab_size(), &self.device)
                .context("failed to collate validation batch")?;
            validate_batch(&model, &batch, &task.cfg, &weights, &mut summary);
        }
        Ok(summary)
    }

    pub fn save_checkpoint<O>(
        &self,
        task: &ForcedAlignmentTask<B, O>,
        path: &Path,
        weights_only: bool,
    ) -> Result<(), CheckpointError>
    where
        O: Optimizer<ForcedAlignmentModel<B>, B>,
    {
        save_checkpoint(task, path, self.epoch, weights_only)
    }
}

pub fn log_validation(step: usize, summary: &ValidationSummary) {
    tracing::info!(
        step,
        valid_loss = summary.total,
        ph_frame_loss = summary.terms[0],
        ph_edge_loss = summary.terms[1],
        ph_edge_diff_loss = summary.terms[2],
        ctc_loss = summary.terms[3],
        consistency_loss = summary.terms[4],
        boundary_edit_ratio = summary.metrics.boundary_edit_ratio(),
        phone_iou = summary.metrics.phone_iou(),
        "validation"
    );
}
