//! The five alignment losses.

use crate::config::NUM_LOSSES;
use crate::ctc::ctc_loss;
use burn::tensor::activation::{log_sigmoid, log_softmax, sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_dataset::AlignBatch;
use data_contracts::LabelType;
use models::AlignmentLogits;

pub const LOSS_NAMES: [&str; NUM_LOSSES] = [
    "ph_frame_loss",
    "ph_edge_loss",
    "ph_edge_diff_loss",
    "ctc_loss",
    "consistency_loss",
];

/// Unweighted loss terms, each a one-element tensor.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub terms: [Tensor<B, 1>; NUM_LOSSES],
}

impl<B: Backend> LossTerms<B> {
    pub fn weighted_total(&self, weights: &[f32; NUM_LOSSES]) -> Tensor<B, 1> {
        let mut total = self.terms[0].clone() * weights[0];
        for (term, w) in self.terms.iter().zip(weights).skip(1) {
            total = total + term.clone() * *w;
        }
        total
    }

    /// Host copies of the terms, for logging.
    pub fn values(&self) -> [f32; NUM_LOSSES] {
        let mut out = [0.0; NUM_LOSSES];
        for (slot, term) in out.iter_mut().zip(&self.terms) {
            *slot = scalar(term.clone());
        }
        out
    }
}

pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_data()
        .to_vec::<f32>()
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(f32::NAN)
}

fn masked_mean<B: Backend>(values: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    (values * mask.clone()).sum() / mask.sum().clamp_min(1.0)
}

fn row_mask<B: Backend>(
    label_types: &[LabelType],
    keep: impl Fn(LabelType) -> bool,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = label_types
        .iter()
        .map(|l| if keep(*l) { 1.0 } else { 0.0 })
        .collect();
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n, 1]), device)
}

/// Label-smoothed cross entropy over masked frames.
pub fn frame_loss<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    mask: Tensor<B, 2>,
    label_smoothing: f32,
) -> Tensor<B, 1> {
    let [n, t, _] = logits.dims();
    let logp = log_softmax(logits, 2);
    let nll = logp
        .clone()
        .gather(2, targets.unsqueeze_dim::<3>(2))
        .reshape([n, t])
        .neg();
    let smooth = logp.mean_dim(2).reshape([n, t]).neg();
    let per_frame = nll * (1.0 - label_smoothing) + smooth * label_smoothing;
    masked_mean(per_frame, mask)
}

/// Binary cross entropy on boundary logits.
pub fn edge_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    mask: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let pos = log_sigmoid(logits.clone()) * targets.clone();
    let neg = log_sigmoid(logits.neg()) * (targets.neg() + 1.0);
    masked_mean((pos + neg).neg(), mask)
}

/// MSE between the boundary probability and half the L1 change of the frame
/// distribution from the previous frame.
pub fn edge_diff_loss<B: Backend>(
    frame_logits: Tensor<B, 3>,
    edge_logits: Tensor<B, 2>,
    mask: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [n, t, v] = frame_logits.dims();
    if t < 2 {
        return Tensor::zeros([1], &edge_logits.device());
    }
    let probs = softmax(frame_logits, 2);
    let change = (probs.clone().slice([0..n, 1..t, 0..v]) - probs.slice([0..n, 0..t - 1, 0..v]))
        .abs()
        .sum_dim(2)
        .reshape([n, t - 1])
        * 0.5;
    let edge_prob = sigmoid(edge_logits).slice([0..n, 1..t]);
    let mask = mask.slice([0..n, 1..t]);
    masked_mean((edge_prob - change).powf_scalar(2.0), mask)
}

/// MSE between frame log-probabilities of originals and their augmented copies.
pub fn consistency_loss<B: Backend>(
    frame_logits: Tensor<B, 3>,
    frame_mask: Tensor<B, 2>,
    num_originals: usize,
) -> Tensor<B, 1> {
    let [n, t, v] = frame_logits.dims();
    if n < 2 * num_originals || num_originals == 0 {
        return Tensor::zeros([1], &frame_logits.device());
    }
    let logp = log_softmax(frame_logits, 2);
    let original = logp.clone().slice([0..num_originals, 0..t, 0..v]);
    let augmented = logp.slice([num_originals..2 * num_originals, 0..t, 0..v]);
    let per_frame = (original - augmented)
        .powf_scalar(2.0)
        .mean_dim(2)
        .reshape([num_originals, t]);
    masked_mean(per_frame, frame_mask.slice([0..num_originals, 0..t]))
}

/// All five loss terms for one batch.
pub fn compute_losses<B: Backend>(
    logits: &AlignmentLogits<B>,
    batch: &AlignBatch<B>,
    label_smoothing: f32,
) -> LossTerms<B> {
    let device = batch.frame_mask.device();
    let full = row_mask::<B>(&batch.label_types, LabelType::has_durations, &device);
    let full_frames = batch.frame_mask.clone() * full;

    let frame = frame_loss(
        logits.ph_frame_logits.clone(),
        batch.ph_frame.clone(),
        full_frames.clone(),
        label_smoothing,
    );
    let edge = edge_loss(
        logits.ph_edge_logits.clone(),
        batch.ph_edge.clone(),
        full_frames.clone(),
    );
    let edge_diff = edge_diff_loss(
        logits.ph_frame_logits.clone(),
        logits.ph_edge_logits.clone(),
        full_frames,
    );

    let ctc_targets: Vec<Vec<u32>> = batch
        .ph_seqs
        .iter()
        .zip(&batch.label_types)
        .map(|(seq, label)| {
            if label.has_phones() {
                data_contracts::ctc_target(seq)
            } else {
                Vec::new()
            }
        })
        .collect();
    let ctc = ctc_loss(
        log_softmax(logits.ctc_logits.clone(), 2),
        &ctc_targets,
        &batch.lengths,
        0,
    );

    let consistency = if batch.has_augmented() {
        consistency_loss(
            logits.ph_frame_logits.clone(),
            batch.frame_mask.clone(),
            batch.num_originals,
        )
    } else {
        Tensor::zeros([1], &device)
    };

    LossTerms {
        terms: [frame, edge, edge_diff, ctc, consistency],
    }
}
