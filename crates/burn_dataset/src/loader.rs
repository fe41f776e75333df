//! Epoch iteration over a `MixedDataset` with optional background prefetch.

use crate::mixed::MixedDataset;
use crate::sampler::WeightedBinningAudioBatchSampler;
use crate::types::{BurnDatasetError, DatasetResult, MixedItem};
use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use std::sync::Arc;
use std::thread;

enum BatchOrder {
    Sampler(WeightedBinningAudioBatchSampler),
    Sequential { batch_size: usize },
}

pub struct AlignDataLoader {
    dataset: Arc<MixedDataset>,
    order: BatchOrder,
    pool: Option<Arc<rayon::ThreadPool>>,
    prefetch: usize,
    epochs: u64,
}

impl AlignDataLoader {
    /// Batches drawn from `sampler` each epoch. `workers == 0` loads on the
    /// calling thread.
    pub fn with_sampler(
        dataset: Arc<MixedDataset>,
        sampler: WeightedBinningAudioBatchSampler,
        workers: usize,
    ) -> DatasetResult<Self> {
        Self::build(dataset, BatchOrder::Sampler(sampler), workers)
    }

    /// Fixed-size batches in dataset order; used for validation.
    pub fn sequential(
        dataset: Arc<MixedDataset>,
        batch_size: usize,
        workers: usize,
    ) -> DatasetResult<Self> {
        if batch_size == 0 {
            return Err(BurnDatasetError::Other("batch_size must be positive".into()));
        }
        Self::build(dataset, BatchOrder::Sequential { batch_size }, workers)
    }

    fn build(dataset: Arc<MixedDataset>, order: BatchOrder, workers: usize) -> DatasetResult<Self> {
        let pool = if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("align-loader-{i}"))
                .build()
                .map_err(|e| BurnDatasetError::Other(format!("loader pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };
        Ok(Self {
            dataset,
            order,
            pool,
            prefetch: (workers * 2).max(1),
            epochs: 0,
        })
    }

    pub fn dataset(&self) -> &Arc<MixedDataset> {
        &self.dataset
    }

    /// Expected batches per epoch.
    pub fn len_hint(&self) -> usize {
        match &self.order {
            BatchOrder::Sampler(sampler) => sampler.len_hint(),
            BatchOrder::Sequential { batch_size } => self.dataset.manifest().items.len().div_ceil(*batch_size),
        }
    }

    /// Expected items per epoch; zero means no epoch can yield a batch.
    pub fn expected_items(&self) -> f32 {
        match &self.order {
            BatchOrder::Sampler(sampler) => sampler.expected_items(),
            BatchOrder::Sequential { .. } => self.dataset.manifest().items.len() as f32,
        }
    }

    fn next_order(&mut self) -> Vec<Vec<usize>> {
        let len = self.dataset.manifest().items.len();
        match &mut self.order {
            BatchOrder::Sampler(sampler) => sampler.epoch(),
            BatchOrder::Sequential { batch_size } => (0..len)
                .collect::<Vec<_>>()
                .chunks(*batch_size)
                .map(|c| c.to_vec())
                .collect(),
        }
    }

    /// Start one epoch. Each element is the list of items of one batch.
    pub fn epoch(&mut self) -> EpochIter {
        let batches = self.next_order();
        let epoch = self.epochs;
        self.epochs += 1;
        let remaining = batches.len();
        match &self.pool {
            None => EpochIter {
                inner: EpochIterKind::Direct {
                    dataset: self.dataset.clone(),
                    batches: batches.into_iter(),
                    epoch,
                },
                remaining,
            },
            Some(pool) => {
                let (tx, rx) = bounded(self.prefetch);
                let dataset = self.dataset.clone();
                let pool = pool.clone();
                thread::spawn(move || {
                    for batch in batches {
                        let loaded = pool.install(|| load_parallel(&dataset, &batch, epoch));
                        let failed = loaded.is_err();
                        if tx.send(loaded).is_err() || failed {
                            break;
                        }
                    }
                });
                EpochIter {
                    inner: EpochIterKind::Stream { rx },
                    remaining,
                }
            }
        }
    }
}

fn load_parallel(dataset: &MixedDataset, batch: &[usize], epoch: u64) -> DatasetResult<Vec<MixedItem>> {
    batch
        .par_iter()
        .map(|i| dataset.try_get_in_epoch(*i, epoch))
        .collect()
}

fn load_serial(dataset: &MixedDataset, batch: &[usize], epoch: u64) -> DatasetResult<Vec<MixedItem>> {
    batch
        .iter()
        .map(|i| dataset.try_get_in_epoch(*i, epoch))
        .collect()
}

enum EpochIterKind {
    Direct {
        dataset: Arc<MixedDataset>,
        batches: std::vec::IntoIter<Vec<usize>>,
        epoch: u64,
    },
    Stream {
        rx: Receiver<DatasetResult<Vec<MixedItem>>>,
    },
}

pub struct EpochIter {
    inner: EpochIterKind,
    remaining: usize,
}

impl EpochIter {
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for EpochIter {
    type Item = DatasetResult<Vec<MixedItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.inner {
            EpochIterKind::Direct {
                dataset,
                batches,
                epoch,
            } => batches.next().map(|batch| load_serial(dataset, &batch, *epoch)),
            // The producer drops its sender when the epoch is exhausted.
            EpochIterKind::Stream { rx } => rx.recv().ok(),
        };
        if next.is_some() {
            self.remaining = self.remaining.saturating_sub(1);
        }
        next
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
