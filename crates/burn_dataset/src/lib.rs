//! Binarized forced-alignment data for Burn training.
//!
//! This crate provides:
//! - Feature shard storage (`FAS1` shards, owned or memory-mapped)
//! - `MixedDataset` over no-label, weak-label and full-label items
//! - Weighted, length-binned batch sampling
//! - Collation into padded Burn tensors and a prefetching loader

pub mod batch;
pub mod loader;
pub mod mixed;
pub mod sampler;
pub mod store;
pub mod types;

pub use batch::{collate, AlignBatch};
pub use loader::{AlignDataLoader, EpochIter};
pub use mixed::MixedDataset;
pub use sampler::WeightedBinningAudioBatchSampler;
pub use store::{load_manifest, manifest_path, save_manifest, FeatureShard, ShardWriter};
pub use types::*;
