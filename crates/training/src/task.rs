//! Forced-alignment training task: model, optimizers, schedules and steps.

use crate::config::{ClipAlgorithm, MelSpecConfig, OptimizerConfig, TrainConfig, NUM_LOSSES};
use crate::decode::{viterbi_align, AlignmentMetrics};
use crate::losses::{compute_losses, scalar, LOSS_NAMES};
use crate::scheduler::{ramp_up_factor, OneCycleSchedule};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::activation::{log_softmax, sigmoid};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_dataset::AlignBatch;
use data_contracts::{LabelType, Vocab};
use models::{ForcedAlignmentModel, ModelConfig};

/// Everything the task needs besides the model weights.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub vocab: Vocab,
    pub model: ModelConfig,
    pub melspec: MelSpecConfig,
    pub optimizer: OptimizerConfig,
    pub loss_weights: [f32; NUM_LOSSES],
    pub ramp_up: [bool; NUM_LOSSES],
    pub label_smoothing: f32,
    /// Clipping algorithm and threshold; `None` disables clipping.
    pub grad_clip: Option<(ClipAlgorithm, f32)>,
    /// Allow silence phones to receive no frames when decoding.
    pub skip_silence: bool,
}

impl TaskConfig {
    pub fn from_train_config(cfg: &TrainConfig, vocab: Vocab) -> Self {
        let grad_clip = (cfg.gradient_clip_val > 0.0)
            .then_some((cfg.gradient_clip_algorithm, cfg.gradient_clip_val));
        Self {
            vocab,
            model: cfg.model.clone(),
            melspec: cfg.melspec_config.clone(),
            optimizer: cfg.optimizer_config.clone(),
            loss_weights: cfg.loss_weights(),
            ramp_up: cfg.ramp_up_flags(),
            label_smoothing: cfg.loss_config.function.label_smoothing,
            grad_clip,
            skip_silence: true,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.vocab_size
    }

    /// Loss weights at `step` with ramp-up applied where enabled.
    pub fn weights_at(&self, step: usize) -> [f32; NUM_LOSSES] {
        let ramp = ramp_up_factor(step, self.optimizer.total_steps);
        let mut weights = self.loss_weights;
        for (w, enabled) in weights.iter_mut().zip(self.ramp_up) {
            if enabled {
                *w *= ramp;
            }
        }
        weights
    }
}

/// Host-side result of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub total: f32,
    pub terms: [f32; NUM_LOSSES],
    pub lr_backbone: f64,
    pub lr_head: f64,
}

impl StepOutput {
    pub fn named_metrics(&self) -> Vec<(&'static str, f32)> {
        let mut out = vec![("loss", self.total)];
        out.extend(LOSS_NAMES.iter().copied().zip(self.terms));
        out
    }
}

/// Mean validation losses and alignment metrics.
#[derive(Debug, Clone, Default)]
pub struct ValidationSummary {
    pub total: f32,
    pub terms: [f32; NUM_LOSSES],
    pub metrics: AlignmentMetrics,
    pub batches: usize,
}

impl ValidationSummary {
    pub fn add_batch(&mut self, total: f32, terms: [f32; NUM_LOSSES]) {
        let n = self.batches as f32;
        self.total = (self.total * n + total) / (n + 1.0);
        for (acc, v) in self.terms.iter_mut().zip(terms) {
            *acc = (*acc * n + v) / (n + 1.0);
        }
        self.batches += 1;
    }
}

fn adamw<B: AutodiffBackend>(
    cfg: &TaskConfig,
) -> impl Optimizer<ForcedAlignmentModel<B>, B> {
    AdamWConfig::new()
        .with_weight_decay(cfg.optimizer.weight_decay)
        .with_grad_clipping(cfg.grad_clip.map(|(algorithm, threshold)| match algorithm {
            ClipAlgorithm::Norm => GradientClippingConfig::Norm(threshold),
            ClipAlgorithm::Value => GradientClippingConfig::Value(threshold),
        }))
        .init::<B, ForcedAlignmentModel<B>>()
}

/// Build a fresh task with AdamW optimizers for the backbone and the head.
pub fn build_task<B: AutodiffBackend>(
    cfg: TaskConfig,
    device: &B::Device,
) -> ForcedAlignmentTask<B, impl Optimizer<ForcedAlignmentModel<B>, B>> {
    let model = ForcedAlignmentModel::new(
        &cfg.model,
        cfg.melspec.n_mels,
        cfg.vocab_size(),
        device,
    );
    let optim_backbone = adamw::<B>(&cfg);
    let optim_head = adamw::<B>(&cfg);
    ForcedAlignmentTask::from_parts(cfg, model, optim_backbone, optim_head)
}

pub struct ForcedAlignmentTask<B: AutodiffBackend, O: Optimizer<ForcedAlignmentModel<B>, B>> {
    pub cfg: TaskConfig,
    pub model: ForcedAlignmentModel<B>,
    pub optim_backbone: O,
    pub optim_head: O,
    pub global_step: usize,
    schedule_backbone: OneCycleSchedule,
    schedule_head: OneCycleSchedule,
}

impl<B, O> ForcedAlignmentTask<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ForcedAlignmentModel<B>, B>,
{
    pub fn from_parts(
        cfg: TaskConfig,
        model: ForcedAlignmentModel<B>,
        optim_backbone: O,
        optim_head: O,
    ) -> Self {
        let total = cfg.optimizer.total_steps;
        let schedule_backbone = OneCycleSchedule::new(cfg.optimizer.lr.backbone, total);
        let schedule_head = OneCycleSchedule::new(cfg.optimizer.lr.head, total);
        Self {
            cfg,
            model,
            optim_backbone,
            optim_head,
            global_step: 0,
            schedule_backbone,
            schedule_head,
        }
    }

    /// Current learning rates (backbone, head).
    pub fn learning_rates(&self) -> (f64, f64) {
        (
            self.schedule_backbone.lr_at(self.global_step),
            self.schedule_head.lr_at(self.global_step),
        )
    }

    /// Copy weights from a pretrained model. Returns whether the head was
    /// copied too.
    pub fn load_pretrained(&mut self, pretrained: ForcedAlignmentModel<B>) -> bool {
        let (model, head_copied) = self.model.clone().load_pretrained(pretrained);
        self.model = model;
        head_copied
    }

    pub fn training_step(&mut self, batch: &AlignBatch<B>) -> StepOutput {
        let logits = self.model.forward(batch.melspec.clone());
        let terms = compute_losses(&logits, batch, self.cfg.label_smoothing);
        let weights = self.cfg.weights_at(self.global_step);
        let loss = terms.weighted_total(&weights);
        let values = terms.values();
        let total = scalar(loss.clone().detach());

        let mut grads = loss.backward();
        let head_grads = GradientsParams::from_module(&mut grads, &self.model.head);
        let backbone_grads = GradientsParams::from_module(&mut grads, &self.model.backbone);

        let (lr_backbone, lr_head) = self.learning_rates();
        let mut model = self
            .optim_head
            .step(lr_head, self.model.clone(), head_grads);
        if !self.cfg.optimizer.freeze_backbone {
            model = self.optim_backbone.step(lr_backbone, model, backbone_grads);
        }
        self.model = model;
        self.global_step += 1;

        StepOutput {
            total,
            terms: values,
            lr_backbone,
            lr_head,
        }
    }

    /// Inference copy of the model.
    pub fn valid_model(&self) -> ForcedAlignmentModel<B::InnerBackend> {
        self.model.valid()
    }
}

/// Losses and alignment metrics for one batch, on any backend.
/// Logit offset for phones absent from an item's sequence.
const ABSENT_PHONE_LOGIT: f32 = -1e9;

/// Frame logits `[N, T, V]` with classes outside each row's phone set
/// (`ph_mask [N, V]`) pushed to `ABSENT_PHONE_LOGIT`.
pub fn restrict_to_sequence<B: Backend>(
    frame_logits: Tensor<B, 3>,
    ph_mask: Tensor<B, 2>,
) -> Tensor<B, 3> {
    let penalty = ph_mask
        .neg()
        .add_scalar(1.0)
        .mul_scalar(ABSENT_PHONE_LOGIT)
        .unsqueeze_dim::<3>(1);
    frame_logits + penalty
}

pub fn validate_batch<B: Backend>(
    model: &ForcedAlignmentModel<B>,
    batch: &AlignBatch<B>,
    cfg: &TaskConfig,
    weights: &[f32; NUM_LOSSES],
    summary: &mut ValidationSummary,
) {
    let logits = model.forward(batch.melspec.clone());
    let terms = compute_losses(&logits, batch, cfg.label_smoothing);
    let total = scalar(terms.weighted_total(weights));
    summary.add_batch(total, terms.values());

    let [n, t, v] = logits.ph_frame_logits.dims();
    let frame_logp = log_softmax(
        restrict_to_sequence(logits.ph_frame_logits, batch.ph_mask.clone()),
        2,
    )
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let edge_prob = sigmoid(logits.ph_edge_logits)
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    if frame_logp.len() != n * t * v || edge_prob.len() != n * t {
        return;
    }
    for row in 0..batch.num_originals.min(n) {
        if batch.label_types[row] != LabelType::FullLabel {
            continue;
        }
        let frames = batch.lengths[row];
        let row_logp = &frame_logp[row * t * v..(row * t + frames) * v];
        let row_edge = &edge_prob[row * t..row * t + frames];
        if let Some(alignment) = viterbi_align(
            row_logp,
            v,
            row_edge,
            &batch.ph_seqs[row],
            frames,
            cfg.skip_silence,
        ) {
            summary
                .metrics
                .update(&alignment, &batch.ph_intervals[row], frames);
        }
    }
}
