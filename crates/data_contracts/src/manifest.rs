use crate::item::{ItemMetadata, LabelType, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BinaryManifestSchemaVersion {
    V1,
}

/// Index of one binarized split (`binary/<prefix>.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinaryManifest {
    pub schema_version: BinaryManifestSchemaVersion,
    /// Feature shard path relative to the manifest's directory.
    pub shard: String,
    pub n_mels: usize,
    pub sample_rate: u32,
    pub hop_length: u32,
    pub items: Vec<ItemMetadata>,
}

impl BinaryManifest {
    pub fn validate(&self, vocab_size: Option<usize>) -> Result<(), String> {
        if self.n_mels == 0 {
            return Err("n_mels cannot be zero".into());
        }
        if self.hop_length == 0 || self.sample_rate == 0 {
            return Err("sample_rate and hop_length must be positive".into());
        }
        if self.shard.trim().is_empty() {
            return Err("shard path is empty".into());
        }
        let mut names = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            item.validate(vocab_size)
                .map_err(|e: ValidationError| e.to_string())?;
            if !names.insert(item.name.as_str()) {
                return Err(format!("duplicate item name {:?}", item.name));
            }
        }
        Ok(())
    }

    pub fn count_by_label(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for item in &self.items {
            counts[item.label_type.index()] += 1;
        }
        counts
    }

    pub fn total_hours(&self, label: Option<LabelType>) -> f32 {
        self.items
            .iter()
            .filter(|item| label.map_or(true, |l| item.label_type == l))
            .map(|item| item.wav_length)
            .sum::<f32>()
            / 3600.0
    }
}
