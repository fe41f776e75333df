//! Collation of loaded items into padded burn tensors.

use crate::types::{AlignSample, BurnDatasetError, DatasetResult, MixedItem};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use data_contracts::LabelType;

/// Padded batch. Rows `0..num_originals` are original items; when
/// augmentation is on, rows `num_originals..2*num_originals` hold the
/// augmented copies in the same order.
#[derive(Debug, Clone)]
pub struct AlignBatch<B: Backend> {
    /// `[N, T, n_mels]`
    pub melspec: Tensor<B, 3>,
    /// `[N, T]`, 1.0 on real frames.
    pub frame_mask: Tensor<B, 2>,
    /// `[N, T]`
    pub ph_frame: Tensor<B, 2, Int>,
    /// `[N, T]`
    pub ph_edge: Tensor<B, 2>,
    /// `[N, vocab_size]`, 1.0 for ids present in the item's phone sequence.
    pub ph_mask: Tensor<B, 2>,
    pub label_types: Vec<LabelType>,
    pub ph_seqs: Vec<Vec<u32>>,
    pub ph_intervals: Vec<Vec<(usize, usize)>>,
    pub lengths: Vec<usize>,
    pub names: Vec<String>,
    pub num_originals: usize,
}

impl<B: Backend> AlignBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_frames(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    pub fn has_augmented(&self) -> bool {
        self.batch_size() > self.num_originals
    }
}

pub fn collate<B: Backend>(
    items: &[MixedItem],
    vocab_size: usize,
    device: &B::Device,
) -> DatasetResult<AlignBatch<B>> {
    if items.is_empty() {
        return Err(BurnDatasetError::Other("cannot collate an empty batch".into()));
    }
    let with_aug = items.iter().all(|item| item.augmented.is_some());
    let mut rows: Vec<&AlignSample> = items.iter().map(|item| &item.original).collect();
    if with_aug {
        rows.extend(items.iter().filter_map(|item| item.augmented.as_ref()));
    }

    let n_mels = rows[0].n_mels;
    if let Some(bad) = rows.iter().find(|s| s.n_mels != n_mels) {
        return Err(BurnDatasetError::Other(format!(
            "item {:?} has {} mel bins, expected {n_mels}",
            bad.name, bad.n_mels
        )));
    }
    let n = rows.len();
    let t = rows.iter().map(|s| s.num_frames).max().unwrap_or(0);

    let mut mel_buf = vec![0.0f32; n * t * n_mels];
    let mut mask_buf = vec![0.0f32; n * t];
    let mut frame_buf = vec![0i64; n * t];
    let mut edge_buf = vec![0.0f32; n * t];
    let mut ph_mask_buf = vec![0.0f32; n * vocab_size];

    for (row, sample) in rows.iter().enumerate() {
        let frames = sample.num_frames;
        let base = row * t * n_mels;
        mel_buf[base..base + frames * n_mels].copy_from_slice(&sample.melspec[..frames * n_mels]);
        mask_buf[row * t..row * t + frames].fill(1.0);
        for (i, ph) in sample.ph_frame.iter().take(frames).enumerate() {
            frame_buf[row * t + i] = *ph as i64;
        }
        for (i, e) in sample.ph_edge.iter().take(frames).enumerate() {
            edge_buf[row * t + i] = *e;
        }
        for ph in &sample.ph_seq {
            let ph = *ph as usize;
            if ph >= vocab_size {
                return Err(BurnDatasetError::Other(format!(
                    "item {:?} has phone id {ph} outside vocabulary of size {vocab_size}",
                    sample.name
                )));
            }
            ph_mask_buf[row * vocab_size + ph] = 1.0;
        }
    }

    Ok(AlignBatch {
        melspec: Tensor::from_data(TensorData::new(mel_buf, [n, t, n_mels]), device),
        frame_mask: Tensor::from_data(TensorData::new(mask_buf, [n, t]), device),
        ph_frame: Tensor::from_data(TensorData::new(frame_buf, [n, t]), device),
        ph_edge: Tensor::from_data(TensorData::new(edge_buf, [n, t]), device),
        ph_mask: Tensor::from_data(TensorData::new(ph_mask_buf, [n, vocab_size]), device),
        label_types: rows.iter().map(|s| s.label_type).collect(),
        ph_seqs: rows.iter().map(|s| s.ph_seq.clone()).collect(),
        ph_intervals: rows.iter().map(|s| s.ph_intervals.clone()).collect(),
        lengths: rows.iter().map(|s| s.num_frames).collect(),
        names: rows.iter().map(|s| s.name.clone()).collect(),
        num_originals: items.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn sample(name: &str, frames: usize, fill: f32, label_type: LabelType) -> AlignSample {
        let full = label_type == LabelType::FullLabel;
        AlignSample {
            name: name.into(),
            label_type,
            wav_length: frames as f32 * 0.01,
            num_frames: frames,
            n_mels: 2,
            melspec: vec![fill; frames * 2],
            ph_seq: vec![0, 2],
            ph_frame: if full { vec![0; frames / 2].into_iter().chain(vec![2; frames - frames / 2]).collect() } else { vec![] },
            ph_edge: vec![0.0; frames],
            ph_intervals: if full { vec![(0, frames / 2), (frames / 2, frames)] } else { vec![] },
        }
    }

    #[test]
    fn pads_to_longest_and_orders_originals_first() {
        let device = Default::default();
        let items = vec![
            MixedItem {
                original: sample("a", 4, 1.0, LabelType::FullLabel),
                augmented: Some(sample("a", 4, -1.0, LabelType::FullLabel)),
            },
            MixedItem {
                original: sample("b", 6, 2.0, LabelType::WeakLabel),
                augmented: Some(sample("b", 6, -2.0, LabelType::WeakLabel)),
            },
        ];
        let batch = collate::<B>(&items, 3, &device).unwrap();
        assert_eq!(batch.melspec.dims(), [4, 6, 2]);
        assert_eq!(batch.num_originals, 2);
        assert!(batch.has_augmented());
        assert_eq!(batch.names, vec!["a", "b", "a", "b"]);
        assert_eq!(batch.lengths, vec![4, 6, 4, 6]);

        let mask = batch.frame_mask.to_data().to_vec::<f32>().unwrap();
        assert_eq!(&mask[0..6], &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        let mel = batch.melspec.to_data().to_vec::<f32>().unwrap();
        assert_eq!(mel[2 * 12], -1.0);
        let ph_mask = batch.ph_mask.to_data().to_vec::<f32>().unwrap();
        assert_eq!(&ph_mask[0..3], &[1.0, 0.0, 1.0]);
        let frames = batch.ph_frame.to_data().to_vec::<i64>().unwrap();
        assert_eq!(&frames[0..4], &[0, 0, 2, 2]);
    }

    #[test]
    fn empty_batch_is_an_error() {
        let device = Default::default();
        assert!(collate::<B>(&[], 3, &device).is_err());
    }
}
