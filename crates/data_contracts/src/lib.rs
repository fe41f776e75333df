//! Shared data contracts for binarized alignment datasets and phoneme vocabularies.

pub mod item;
pub mod manifest;
pub mod vocab;

pub use item::{ctc_target, ItemMetadata, LabelType, ValidationError};
pub use manifest::{BinaryManifest, BinaryManifestSchemaVersion};
pub use vocab::{Vocab, VocabError, SILENCE_ID, VOCAB_SIZE_KEY};
