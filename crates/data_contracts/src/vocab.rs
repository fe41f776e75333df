//! Phoneme vocabulary as written by the binarizer to `binary/vocab.yaml`.
//!
//! The file maps phoneme names to class ids and carries the class count under
//! [`VOCAB_SIZE_KEY`]. Reverse entries (`id: name`) are tolerated and ignored.
//! Several names may share an id; ignored phonemes all map to [`SILENCE_ID`].

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const VOCAB_SIZE_KEY: &str = "<vocab_size>";
pub const SILENCE_ID: u32 = 0;

#[derive(Debug, Error)]
pub enum VocabError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("vocabulary must be a mapping")]
    NotAMapping,
    #[error("missing <vocab_size> entry")]
    MissingSize,
    #[error("vocabulary size {0} is too small (need at least 2 classes)")]
    TooSmall(usize),
    #[error("phoneme {name:?} has invalid id {value:?}")]
    InvalidId { name: String, value: String },
    #[error("phoneme {name:?} id {id} is outside vocabulary of size {vocab_size}")]
    OutOfRange {
        name: String,
        id: u32,
        vocab_size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocab {
    pub vocab_size: usize,
    pub phonemes: BTreeMap<String, u32>,
}

impl Vocab {
    pub fn load(path: &Path) -> Result<Self, VocabError> {
        let raw = fs::read_to_string(path).map_err(|e| VocabError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, VocabError> {
        let value: Value = serde_yaml::from_str(raw)?;
        let Value::Mapping(map) = value else {
            return Err(VocabError::NotAMapping);
        };

        let mut vocab_size = None;
        let mut phonemes = BTreeMap::new();
        for (key, value) in map {
            let Value::String(name) = key else {
                // Reverse entries (`3: a`) repeat information already present.
                continue;
            };
            let id = value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| VocabError::InvalidId {
                    name: name.clone(),
                    value: format!("{value:?}"),
                })?;
            if name == VOCAB_SIZE_KEY {
                vocab_size = Some(id as usize);
            } else {
                phonemes.insert(name, id);
            }
        }

        let vocab_size = vocab_size.ok_or(VocabError::MissingSize)?;
        let vocab = Self {
            vocab_size,
            phonemes,
        };
        vocab.validate()?;
        Ok(vocab)
    }

    pub fn validate(&self) -> Result<(), VocabError> {
        if self.vocab_size < 2 {
            return Err(VocabError::TooSmall(self.vocab_size));
        }
        for (name, id) in &self.phonemes {
            if *id as usize >= self.vocab_size {
                return Err(VocabError::OutOfRange {
                    name: name.clone(),
                    id: *id,
                    vocab_size: self.vocab_size,
                });
            }
        }
        Ok(())
    }

    pub fn id(&self, phoneme: &str) -> Option<u32> {
        self.phonemes.get(phoneme).copied()
    }

    /// Display name for a class id. Silence reports `SP` when that name exists.
    pub fn name(&self, id: u32) -> Option<&str> {
        if id == SILENCE_ID && self.phonemes.get("SP") == Some(&SILENCE_ID) {
            return Some("SP");
        }
        self.phonemes
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// Re-serialize in the binarizer's layout (forward and reverse entries).
    pub fn to_yaml_string(&self) -> Result<String, VocabError> {
        let mut map = serde_yaml::Mapping::new();
        map.insert(
            Value::String(VOCAB_SIZE_KEY.to_string()),
            Value::Number((self.vocab_size as u64).into()),
        );
        for (name, id) in &self.phonemes {
            map.insert(
                Value::String(name.clone()),
                Value::Number((*id as u64).into()),
            );
        }
        for id in 0..self.vocab_size as u32 {
            if let Some(name) = self.name(id) {
                map.insert(
                    Value::Number((id as u64).into()),
                    Value::String(name.to_string()),
                );
            }
        }
        Ok(serde_yaml::to_string(&Value::Mapping(map))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<vocab_size>: 4
SP: 0
AP: 0
a: 1
i: 2
k: 3
0: SP
1: a
2: i
3: k
"#;

    #[test]
    fn parses_forward_entries_and_skips_reverse_ones() {
        let vocab = Vocab::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(vocab.vocab_size, 4);
        assert_eq!(vocab.phonemes.len(), 5);
        assert_eq!(vocab.id("k"), Some(3));
        assert_eq!(vocab.id("AP"), Some(SILENCE_ID));
        assert_eq!(vocab.name(0), Some("SP"));
        assert_eq!(vocab.name(2), Some("i"));
    }

    #[test]
    fn missing_size_is_rejected() {
        let err = Vocab::from_yaml_str("SP: 0\na: 1\n").unwrap_err();
        assert!(matches!(err, VocabError::MissingSize));
    }

    #[test]
    fn id_beyond_size_is_rejected() {
        let err = Vocab::from_yaml_str("<vocab_size>: 2\nSP: 0\na: 2\n").unwrap_err();
        assert!(matches!(err, VocabError::OutOfRange { id: 2, .. }));
    }

    #[test]
    fn yaml_output_parses_back() {
        let vocab = Vocab::from_yaml_str(SAMPLE).unwrap();
        let text = vocab.to_yaml_string().unwrap();
        assert_eq!(Vocab::from_yaml_str(&text).unwrap(), vocab);
    }
}
