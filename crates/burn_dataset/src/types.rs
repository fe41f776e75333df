//! Core types and error definitions for burn_dataset.

use data_contracts::{ItemMetadata, LabelType};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BurnDatasetError>;

#[derive(Debug, Error)]
pub enum BurnDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("bad shard {path}: {msg}")]
    Shard { path: PathBuf, msg: String },
    #[error("index {index} out of range for dataset of {len} items")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("sampler configuration: {0}")]
    Sampler(String),
    #[error("{0}")]
    Other(String),
}

/// One utterance with its features and frame-level targets.
#[derive(Debug, Clone)]
pub struct AlignSample {
    pub name: String,
    pub label_type: LabelType,
    pub wav_length: f32,
    pub num_frames: usize,
    pub n_mels: usize,
    /// Log-mel features, row-major `[num_frames, n_mels]`.
    pub melspec: Vec<f32>,
    pub ph_seq: Vec<u32>,
    /// Phone id per frame (full labels only, otherwise empty).
    pub ph_frame: Vec<u32>,
    /// Boundary indicator per frame.
    pub ph_edge: Vec<f32>,
    /// `[start, end)` frames per phone (full labels only).
    pub ph_intervals: Vec<(usize, usize)>,
}

impl AlignSample {
    pub fn from_metadata(meta: &ItemMetadata, n_mels: usize, melspec: Vec<f32>) -> Self {
        Self {
            name: meta.name.clone(),
            label_type: meta.label_type,
            wav_length: meta.wav_length,
            num_frames: meta.num_frames,
            n_mels,
            melspec,
            ph_seq: meta.ph_seq.clone(),
            ph_frame: meta.ph_frame(),
            ph_edge: meta.ph_edge(),
            ph_intervals: if meta.label_type.has_durations() {
                meta.ph_intervals()
            } else {
                Vec::new()
            },
        }
    }
}

/// Dataset item: the original sample plus, when augmentation is enabled, one
/// augmented copy of identical length.
#[derive(Debug, Clone)]
pub struct MixedItem {
    pub original: AlignSample,
    pub augmented: Option<AlignSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStoreMode {
    /// Whole shard read into memory.
    InMemory,
    /// Memory-mapped shard.
    Mmap,
}

impl ShardStoreMode {
    pub fn from_env() -> Self {
        match std::env::var("BURN_DATASET_STORE_MODE").as_deref() {
            Ok("inmemory") => ShardStoreMode::InMemory,
            _ => ShardStoreMode::Mmap,
        }
    }
}
