//! Length-binned batch sampler with per-label-type oversampling.

use crate::types::{BurnDatasetError, DatasetResult};
use data_contracts::LabelType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct WeightedBinningAudioBatchSampler {
    label_types: Vec<LabelType>,
    wav_lengths: Vec<f32>,
    oversampling_weights: [f32; 3],
    max_length: f32,
    binning_length: f32,
    drop_last: bool,
    rng: StdRng,
}

impl WeightedBinningAudioBatchSampler {
    pub fn new(
        label_types: Vec<LabelType>,
        wav_lengths: Vec<f32>,
        oversampling_weights: [f32; 3],
        max_length: f32,
        binning_length: f32,
        drop_last: bool,
    ) -> DatasetResult<Self> {
        if label_types.len() != wav_lengths.len() {
            return Err(BurnDatasetError::Sampler(format!(
                "{} label types for {} wav lengths",
                label_types.len(),
                wav_lengths.len()
            )));
        }
        if !(max_length.is_finite() && max_length > 0.0) {
            return Err(BurnDatasetError::Sampler(format!(
                "max_length must be positive (got {max_length})"
            )));
        }
        if !(binning_length.is_finite() && binning_length > 0.0) {
            return Err(BurnDatasetError::Sampler(format!(
                "binning_length must be positive (got {binning_length})"
            )));
        }
        if let Some(w) = oversampling_weights
            .iter()
            .find(|w| !w.is_finite() || **w < 0.0)
        {
            return Err(BurnDatasetError::Sampler(format!(
                "oversampling weights must be non-negative (got {w})"
            )));
        }
        Ok(Self {
            label_types,
            wav_lengths,
            oversampling_weights,
            max_length,
            binning_length,
            drop_last,
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn max_length(&self) -> f32 {
        self.max_length
    }

    fn expand_indices(&mut self) -> Vec<usize> {
        let mut indices = Vec::new();
        for (idx, label) in self.label_types.iter().enumerate() {
            let weight = self.oversampling_weights[label.index()];
            let whole = weight.floor();
            let frac = weight - whole;
            let mut copies = whole as usize;
            if frac > 0.0 && self.rng.random::<f32>() < frac {
                copies += 1;
            }
            indices.extend(std::iter::repeat(idx).take(copies));
        }
        indices
    }

    fn cut_bins(&self, sorted: &[usize]) -> Vec<Vec<usize>> {
        let mut bins = Vec::new();
        let mut current = Vec::new();
        let mut total = 0.0f32;
        for &idx in sorted {
            let len = self.wav_lengths[idx];
            if !current.is_empty() && total + len > self.binning_length {
                bins.push(std::mem::take(&mut current));
                total = 0.0;
            }
            current.push(idx);
            total += len;
        }
        if !current.is_empty() {
            bins.push(current);
        }
        bins
    }

    fn pack_bin(&self, bin: &[usize]) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut current_max = 0.0f32;
        for &idx in bin {
            let len = self.wav_lengths[idx];
            let max_len = current_max.max(len);
            if !current.is_empty() && (current.len() + 1) as f32 * max_len > self.max_length {
                batches.push(std::mem::take(&mut current));
                current_max = 0.0;
            }
            current.push(idx);
            current_max = current_max.max(len);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        if self.drop_last && batches.len() > 1 {
            batches.pop();
        }
        batches
    }

    fn sort_by_length(&self, indices: &mut [usize]) {
        indices.sort_by(|a, b| self.wav_lengths[*a].total_cmp(&self.wav_lengths[*b]));
    }

    /// Draw the batches for one epoch.
    pub fn epoch(&mut self) -> Vec<Vec<usize>> {
        let mut indices = self.expand_indices();
        indices.shuffle(&mut self.rng);
        self.sort_by_length(&mut indices);

        let mut batches = Vec::new();
        for mut bin in self.cut_bins(&indices) {
            bin.shuffle(&mut self.rng);
            self.sort_by_length(&mut bin);
            batches.extend(self.pack_bin(&bin));
        }
        batches.shuffle(&mut self.rng);
        batches
    }

    /// Expected number of items drawn per epoch (sum of the weights).
    pub fn expected_items(&self) -> f32 {
        self.label_types
            .iter()
            .map(|label| self.oversampling_weights[label.index()])
            .sum()
    }

    /// Expected number of batches per epoch, from the mean item length.
    pub fn len_hint(&self) -> usize {
        if self.expected_items() <= 0.0 {
            return 0;
        }
        let expected_len: f32 = self
            .label_types
            .iter()
            .zip(&self.wav_lengths)
            .map(|(label, len)| self.oversampling_weights[label.index()] * len)
            .sum();
        (expected_len / self.max_length).ceil().max(1.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths() -> (Vec<LabelType>, Vec<f32>) {
        let labels = (0..60)
            .map(|i| LabelType::from_index(i % 3).unwrap())
            .collect();
        let lens = (0..60).map(|i| 0.5 + (i % 17) as f32 * 0.4).collect();
        (labels, lens)
    }

    #[test]
    fn batches_respect_budget() {
        let (labels, lens) = lengths();
        let mut sampler =
            WeightedBinningAudioBatchSampler::new(labels, lens.clone(), [1.0, 1.0, 1.0], 8.0, 20.0, false)
                .unwrap()
                .with_seed(7);
        let batches = sampler.epoch();
        assert!(!batches.is_empty());
        let mut seen = 0;
        for batch in &batches {
            let max = batch.iter().map(|i| lens[*i]).fold(0.0f32, f32::max);
            assert!(batch.len() == 1 || batch.len() as f32 * max <= 8.0);
            assert!(batch.iter().all(|i| *i < lens.len()));
            seen += batch.len();
        }
        assert_eq!(seen, 60);
    }

    #[test]
    fn zero_weight_excludes_label_type() {
        let (labels, lens) = lengths();
        let mut sampler = WeightedBinningAudioBatchSampler::new(
            labels.clone(),
            lens,
            [0.0, 2.0, 1.0],
            8.0,
            20.0,
            false,
        )
        .unwrap()
        .with_seed(3);
        let all: Vec<usize> = sampler.epoch().into_iter().flatten().collect();
        assert!(all.iter().all(|i| labels[*i] != LabelType::NoLabel));
        // Weak labels are drawn twice, full labels once.
        assert_eq!(all.len(), 20 * 2 + 20);
    }

    #[test]
    fn same_seed_same_epoch() {
        let (labels, lens) = lengths();
        let make = || {
            WeightedBinningAudioBatchSampler::new(
                labels.clone(),
                lens.clone(),
                [1.0, 0.5, 1.5],
                6.0,
                15.0,
                true,
            )
            .unwrap()
            .with_seed(11)
        };
        assert_eq!(make().epoch(), make().epoch());
    }

    #[test]
    fn drop_last_trims_only_multi_batch_bins() {
        // Five short items share one bin (three batches); the long item is
        // alone in the second bin.
        let lens = vec![1.0, 1.0, 1.0, 1.0, 1.0, 4.5];
        let make = |drop_last| {
            WeightedBinningAudioBatchSampler::new(
                vec![LabelType::FullLabel; 6],
                lens.clone(),
                [1.0; 3],
                2.0,
                5.0,
                drop_last,
            )
            .unwrap()
            .with_seed(4)
        };
        let sizes = |batches: &[Vec<usize>]| {
            let mut sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
            sizes.sort_unstable();
            sizes
        };

        let kept = make(false).epoch();
        assert_eq!(sizes(&kept), vec![1, 1, 2, 2]);

        let dropped = make(true).epoch();
        assert_eq!(sizes(&dropped), vec![1, 2, 2]);
        assert!(dropped.iter().any(|b| b == &vec![5]));
        assert_eq!(dropped.iter().flatten().filter(|i| **i < 5).count(), 4);
    }

    #[test]
    fn fractional_weight_adds_a_random_extra_copy() {
        let n = 200;
        let mut sampler = WeightedBinningAudioBatchSampler::new(
            vec![LabelType::FullLabel; n],
            vec![1.0; n],
            [1.5; 3],
            1000.0,
            1e6,
            false,
        )
        .unwrap()
        .with_seed(21);
        assert_eq!(sampler.expected_items(), 300.0);

        let mut draws = Vec::new();
        for _ in 0..3 {
            let mut copies = vec![0usize; n];
            for idx in sampler.epoch().into_iter().flatten() {
                copies[idx] += 1;
            }
            assert!(copies.iter().all(|c| *c == 1 || *c == 2), "{copies:?}");
            let total: usize = copies.iter().sum();
            assert!((250..=350).contains(&total), "{total}");
            draws.push(copies);
        }
        assert_ne!(draws[0], draws[1]);
        assert_ne!(draws[1], draws[2]);
    }

    #[test]
    fn oversize_item_forms_its_own_batch() {
        let mut sampler = WeightedBinningAudioBatchSampler::new(
            vec![LabelType::FullLabel; 3],
            vec![1.0, 1.0, 30.0],
            [1.0; 3],
            4.0,
            100.0,
            false,
        )
        .unwrap()
        .with_seed(1);
        let batches = sampler.epoch();
        assert!(batches.iter().any(|b| b == &vec![2]));
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        assert!(WeightedBinningAudioBatchSampler::new(
            vec![LabelType::NoLabel],
            vec![],
            [1.0; 3],
            4.0,
            10.0,
            false
        )
        .is_err());
    }
}
