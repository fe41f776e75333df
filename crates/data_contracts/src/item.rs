use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How much supervision an item carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    /// Audio only.
    NoLabel,
    /// Phoneme sequence without timing.
    WeakLabel,
    /// Phoneme sequence with per-phone durations.
    FullLabel,
}

impl LabelType {
    pub const ALL: [LabelType; 3] = [
        LabelType::NoLabel,
        LabelType::WeakLabel,
        LabelType::FullLabel,
    ];

    /// Position in `oversampling_weights` and other per-type tables.
    pub fn index(self) -> usize {
        match self {
            LabelType::NoLabel => 0,
            LabelType::WeakLabel => 1,
            LabelType::FullLabel => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn has_phones(self) -> bool {
        !matches!(self, LabelType::NoLabel)
    }

    pub fn has_durations(self) -> bool {
        matches!(self, LabelType::FullLabel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::NoLabel => "no_label",
            LabelType::WeakLabel => "weak_label",
            LabelType::FullLabel => "full_label",
        }
    }
}

/// One binarized utterance as listed in `binary/<prefix>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemMetadata {
    pub name: String,
    pub label_type: LabelType,
    /// Audio length in seconds.
    pub wav_length: f32,
    pub num_frames: usize,
    #[serde(default)]
    pub ph_seq: Vec<u32>,
    /// Frames per phone; only present for full labels.
    #[serde(default)]
    pub ph_dur: Vec<u32>,
    /// Frame offset of the log-mel features inside the shard.
    pub feature_offset: u64,
    /// Frame offsets of augmented copies (same length as the original).
    #[serde(default)]
    pub augmented_offsets: Vec<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("item {0:?} has no frames")]
    EmptyItem(String),
    #[error("item {name:?} has invalid wav_length {wav_length}")]
    InvalidWavLength { name: String, wav_length: f32 },
    #[error("item {0:?} is labelled but has an empty ph_seq")]
    MissingPhones(String),
    #[error("item {name:?}: ph_dur has {dur} entries for {seq} phones")]
    DurationCountMismatch { name: String, dur: usize, seq: usize },
    #[error("item {name:?}: durations sum to {sum} frames, expected {expected}")]
    DurationSumMismatch {
        name: String,
        sum: u64,
        expected: usize,
    },
    #[error("item {name:?}: phone id {id} is outside the vocabulary of size {vocab_size}")]
    PhoneOutOfRange {
        name: String,
        id: u32,
        vocab_size: usize,
    },
}

impl ItemMetadata {
    /// Check internal consistency; `vocab_size` additionally bounds phone ids.
    pub fn validate(&self, vocab_size: Option<usize>) -> Result<(), ValidationError> {
        if self.num_frames == 0 {
            return Err(ValidationError::EmptyItem(self.name.clone()));
        }
        if !self.wav_length.is_finite() || self.wav_length <= 0.0 {
            return Err(ValidationError::InvalidWavLength {
                name: self.name.clone(),
                wav_length: self.wav_length,
            });
        }
        if self.label_type.has_phones() && self.ph_seq.is_empty() {
            return Err(ValidationError::MissingPhones(self.name.clone()));
        }
        if self.label_type.has_durations() {
            if self.ph_dur.len() != self.ph_seq.len() {
                return Err(ValidationError::DurationCountMismatch {
                    name: self.name.clone(),
                    dur: self.ph_dur.len(),
                    seq: self.ph_seq.len(),
                });
            }
            let sum: u64 = self.ph_dur.iter().map(|d| *d as u64).sum();
            if sum != self.num_frames as u64 {
                return Err(ValidationError::DurationSumMismatch {
                    name: self.name.clone(),
                    sum,
                    expected: self.num_frames,
                });
            }
        }
        if let Some(vocab_size) = vocab_size {
            if let Some(id) = self.ph_seq.iter().find(|id| **id as usize >= vocab_size) {
                return Err(ValidationError::PhoneOutOfRange {
                    name: self.name.clone(),
                    id: *id,
                    vocab_size,
                });
            }
        }
        Ok(())
    }

    /// Half-open frame interval `[start, end)` of every phone (full labels only).
    pub fn ph_intervals(&self) -> Vec<(usize, usize)> {
        let mut start = 0usize;
        self.ph_dur
            .iter()
            .map(|d| {
                let end = start + *d as usize;
                let interval = (start, end);
                start = end;
                interval
            })
            .collect()
    }

    /// Phone id active at every frame; empty unless the item is fully labelled.
    pub fn ph_frame(&self) -> Vec<u32> {
        if !self.label_type.has_durations() {
            return Vec::new();
        }
        let mut frames = Vec::with_capacity(self.num_frames);
        for (ph, dur) in self.ph_seq.iter().zip(&self.ph_dur) {
            frames.extend(std::iter::repeat(*ph).take(*dur as usize));
        }
        frames.resize(self.num_frames, 0);
        frames
    }

    /// 1.0 on the first frame of every phone boundary inside the item.
    pub fn ph_edge(&self) -> Vec<f32> {
        let mut edges = vec![0.0f32; self.num_frames];
        if !self.label_type.has_durations() {
            return edges;
        }
        for (start, _) in self.ph_intervals().into_iter().skip(1) {
            if start > 0 && start < self.num_frames {
                edges[start] = 1.0;
            }
        }
        edges
    }
}

/// Phones used as a CTC target: silence (id 0) removed.
pub fn ctc_target(ph_seq: &[u32]) -> Vec<u32> {
    ph_seq
        .iter()
        .copied()
        .filter(|id| *id != crate::vocab::SILENCE_ID)
        .collect()
}
