//! Connectionist temporal classification loss on Burn tensors.
//!
//! Batched forward algorithm in log space over the blank-extended target.
//! Rows whose target cannot fit in their input length are skipped.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

const LOG_ZERO: f32 = -1e9;

fn logsumexp3<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, c: Tensor<B, 2>) -> Tensor<B, 2> {
    let m = a.clone().max_pair(b.clone()).max_pair(c.clone()).detach();
    let sum = (a - m.clone()).exp() + (b - m.clone()).exp() + (c - m.clone()).exp();
    sum.log() + m
}

/// Minimum number of frames needed to emit `target` (repeats need a blank).
pub fn min_frames(target: &[u32]) -> usize {
    let repeats = target.windows(2).filter(|w| w[0] == w[1]).count();
    target.len() + repeats
}

/// Mean over usable rows of `-log p(target | x) / target_len`.
///
/// `log_probs` is `[N, T, C]` log-softmax output with class `blank` as the
/// blank symbol. Returns a zero loss when no row has a usable target.
pub fn ctc_loss<B: Backend>(
    log_probs: Tensor<B, 3>,
    targets: &[Vec<u32>],
    input_lengths: &[usize],
    blank: u32,
) -> Tensor<B, 1> {
    let device = log_probs.device();
    let [n, t_max, _] = log_probs.dims();
    let rows: Vec<usize> = (0..n.min(targets.len()).min(input_lengths.len()))
        .filter(|&i| {
            let target = &targets[i];
            !target.is_empty() && min_frames(target) <= input_lengths[i].min(t_max)
        })
        .collect();
    if rows.is_empty() {
        return Tensor::zeros([1], &device);
    }

    let k = rows.len();
    let s_max = rows
        .iter()
        .map(|&i| 2 * targets[i].len() + 1)
        .max()
        .unwrap_or(1);
    let mut ext = vec![blank as i64; k * s_max];
    let mut valid = vec![LOG_ZERO; k * s_max];
    let mut skip = vec![LOG_ZERO; k * s_max];
    let mut init = vec![LOG_ZERO; k * s_max];
    let mut time_mask = vec![0.0f32; k * t_max];
    let mut final_idx = vec![0i64; k * 2];
    let mut norm = vec![0.0f32; k];
    for (r, &i) in rows.iter().enumerate() {
        let target = &targets[i];
        let s_n = 2 * target.len() + 1;
        let base = r * s_max;
        for (j, ph) in target.iter().enumerate() {
            ext[base + 2 * j + 1] = *ph as i64;
        }
        for s in 0..s_n {
            valid[base + s] = 0.0;
            if s >= 2 && ext[base + s] != blank as i64 && ext[base + s] != ext[base + s - 2] {
                skip[base + s] = 0.0;
            }
        }
        init[base] = 0.0;
        init[base + 1] = 0.0;
        let len = input_lengths[i].min(t_max);
        time_mask[r * t_max..r * t_max + len].fill(1.0);
        final_idx[r * 2] = (s_n - 1) as i64;
        final_idx[r * 2 + 1] = (s_n - 2) as i64;
        norm[r] = 1.0 / target.len() as f32;
    }

    let row_idx = Tensor::<B, 1, Int>::from_data(
        TensorData::new(rows.iter().map(|&i| i as i64).collect::<Vec<_>>(), [k]),
        &device,
    );
    let ext_idx = Tensor::<B, 2, Int>::from_data(TensorData::new(ext, [k, s_max]), &device)
        .unsqueeze_dim::<3>(1)
        .repeat_dim(1, t_max);
    // [k, T, S]: log-prob of each extended label at each frame.
    let lp_ext = log_probs.select(0, row_idx).gather(2, ext_idx);
    let valid = Tensor::<B, 2>::from_data(TensorData::new(valid, [k, s_max]), &device);
    let skip = Tensor::<B, 2>::from_data(TensorData::new(skip, [k, s_max]), &device);
    let init = Tensor::<B, 2>::from_data(TensorData::new(init, [k, s_max]), &device);
    let time_mask = Tensor::<B, 2>::from_data(TensorData::new(time_mask, [k, t_max]), &device);
    let pad1 = Tensor::<B, 2>::full([k, 1], LOG_ZERO, &device);
    let pad2 = Tensor::<B, 2>::full([k, 2], LOG_ZERO, &device);

    let frame = |t: usize| {
        lp_ext
            .clone()
            .slice([0..k, t..t + 1, 0..s_max])
            .reshape([k, s_max])
    };

    let mut alpha = (frame(0) + init + valid.clone()).clamp_min(LOG_ZERO);
    for t in 1..t_max {
        let shift1 = Tensor::cat(
            vec![pad1.clone(), alpha.clone().slice([0..k, 0..s_max - 1])],
            1,
        );
        let shift2 = Tensor::cat(
            vec![pad2.clone(), alpha.clone().slice([0..k, 0..s_max - 2])],
            1,
        ) + skip.clone();
        let next = (logsumexp3(alpha.clone(), shift1, shift2) + frame(t) + valid.clone())
            .clamp_min(LOG_ZERO);
        let m = time_mask.clone().slice([0..k, t..t + 1]);
        alpha = next * m.clone() + alpha * (m.neg() + 1.0);
    }

    let final_idx = Tensor::<B, 2, Int>::from_data(TensorData::new(final_idx, [k, 2]), &device);
    let ends = alpha.gather(1, final_idx);
    let m = ends.clone().max_dim(1).detach();
    let log_likelihood = ((ends - m.clone()).exp().sum_dim(1).log() + m).reshape([k]);
    let norm = Tensor::<B, 1>::from_data(TensorData::new(norm, [k]), &device);
    (log_likelihood * norm).neg().mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn uniform(n: usize, t: usize, c: usize) -> Tensor<B, 3> {
        Tensor::full([n, t, c], -(c as f32).ln(), &Default::default())
    }

    fn scalar(x: Tensor<B, 1>) -> f32 {
        x.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn single_phone_two_frames() {
        // Paths 11, 01, 10 each have probability 1/4.
        let loss = scalar(ctc_loss(uniform(1, 2, 2), &[vec![1]], &[2], 0));
        assert!((loss - (-(0.75f32).ln())).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn repeated_phone_needs_a_blank() {
        // Only 1-0-1 emits [1, 1] in three frames.
        let loss = scalar(ctc_loss(uniform(1, 3, 2), &[vec![1, 1]], &[3], 0));
        assert!((loss - (-(0.125f32).ln() / 2.0)).abs() < 1e-5, "{loss}");
        assert_eq!(min_frames(&[1, 1]), 3);
    }

    #[test]
    fn padding_frames_are_ignored_and_infeasible_rows_skipped() {
        let loss = scalar(ctc_loss(
            uniform(3, 4, 2),
            &[vec![1], vec![1, 1], vec![]],
            &[2, 2, 4],
            0,
        ));
        // Row 0 uses only its first two frames; rows 1 and 2 are skipped.
        assert!((loss - (-(0.75f32).ln())).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn no_usable_rows_gives_zero() {
        let loss = scalar(ctc_loss(uniform(1, 1, 3), &[vec![1, 2]], &[1], 0));
        assert_eq!(loss, 0.0);
    }
}
