//! Dataset over one binarized split mixing all three label types.

use crate::store::{load_manifest, manifest_path, FeatureShard};
use crate::types::{AlignSample, BurnDatasetError, DatasetResult, MixedItem, ShardStoreMode};
use burn::data::dataset::Dataset;
use data_contracts::{BinaryManifest, ItemMetadata, LabelType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

pub struct MixedDataset {
    root: PathBuf,
    prefix: String,
    manifest: BinaryManifest,
    shard: FeatureShard,
    augmentation_size: usize,
    seed: u64,
}

impl std::fmt::Debug for MixedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixedDataset")
            .field("root", &self.root)
            .field("prefix", &self.prefix)
            .field("items", &self.manifest.items.len())
            .field("augmentation_size", &self.augmentation_size)
            .finish()
    }
}

impl MixedDataset {
    /// Open `binary_dir/<prefix>.json` and its shard.
    pub fn open(binary_dir: &Path, prefix: &str, augmentation_size: usize) -> DatasetResult<Self> {
        Self::open_with_mode(
            binary_dir,
            prefix,
            augmentation_size,
            ShardStoreMode::from_env(),
        )
    }

    pub fn open_with_mode(
        binary_dir: &Path,
        prefix: &str,
        augmentation_size: usize,
        mode: ShardStoreMode,
    ) -> DatasetResult<Self> {
        let path = manifest_path(binary_dir, prefix);
        let manifest = load_manifest(&path)?;
        manifest
            .validate(None)
            .map_err(|msg| BurnDatasetError::Validation {
                path: path.clone(),
                msg,
            })?;
        let shard_path = binary_dir.join(&manifest.shard);
        let shard = FeatureShard::open(&shard_path, mode)?;
        if shard.n_mels() != manifest.n_mels {
            return Err(BurnDatasetError::Validation {
                path,
                msg: format!(
                    "manifest declares {} mel bins but shard has {}",
                    manifest.n_mels,
                    shard.n_mels()
                ),
            });
        }
        for item in &manifest.items {
            let offsets = std::iter::once(item.feature_offset).chain(
                item.augmented_offsets
                    .iter()
                    .copied(),
            );
            for offset in offsets {
                if offset as usize + item.num_frames > shard.total_frames() {
                    return Err(BurnDatasetError::Validation {
                        path,
                        msg: format!(
                            "item {:?} reads past the end of {}",
                            item.name,
                            shard_path.display()
                        ),
                    });
                }
            }
        }
        let without_aug = manifest
            .items
            .iter()
            .filter(|item| item.augmented_offsets.is_empty())
            .count();
        if augmentation_size > 0 && without_aug > 0 {
            eprintln!(
                "warning: {without_aug} item(s) in {} have no augmented copies; originals will be reused",
                path.display()
            );
        }
        Ok(Self {
            root: binary_dir.to_path_buf(),
            prefix: prefix.to_string(),
            manifest,
            shard,
            augmentation_size,
            seed: 0,
        })
    }

    /// Seed for choosing augmented copies.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manifest(&self) -> &BinaryManifest {
        &self.manifest
    }

    pub fn n_mels(&self) -> usize {
        self.manifest.n_mels
    }

    pub fn augmentation_size(&self) -> usize {
        self.augmentation_size
    }

    pub fn get_label_types(&self) -> Vec<LabelType> {
        self.manifest.items.iter().map(|i| i.label_type).collect()
    }

    pub fn get_wav_lengths(&self) -> Vec<f32> {
        self.manifest.items.iter().map(|i| i.wav_length).collect()
    }

    pub fn metadata(&self, index: usize) -> Option<&ItemMetadata> {
        self.manifest.items.get(index)
    }

    fn read_sample(&self, meta: &ItemMetadata, offset: u64) -> DatasetResult<AlignSample> {
        let mut melspec = Vec::with_capacity(meta.num_frames * self.manifest.n_mels);
        self.shard
            .copy_frames(offset as usize, meta.num_frames, &mut melspec)?;
        Ok(AlignSample::from_metadata(
            meta,
            self.manifest.n_mels,
            melspec,
        ))
    }

    /// Load item `index`, drawing the augmented copy (if any) from `rng`.
    pub fn load_item<R: Rng>(&self, index: usize, rng: &mut R) -> DatasetResult<MixedItem> {
        let meta = self
            .manifest
            .items
            .get(index)
            .ok_or(BurnDatasetError::IndexOutOfRange {
                index,
                len: self.manifest.items.len(),
            })?;
        let original = self.read_sample(meta, meta.feature_offset)?;
        let augmented = if self.augmentation_size == 0 {
            None
        } else if meta.augmented_offsets.is_empty() {
            Some(original.clone())
        } else {
            let pick = rng.random_range(0..meta.augmented_offsets.len());
            Some(self.read_sample(meta, meta.augmented_offsets[pick])?)
        };
        Ok(MixedItem {
            original,
            augmented,
        })
    }

    /// Load item `index` as drawn in `epoch`. The augmented copy depends only
    /// on the dataset seed, `epoch` and `index`, never on load order.
    pub fn try_get_in_epoch(&self, index: usize, epoch: u64) -> DatasetResult<MixedItem> {
        let mut rng = StdRng::seed_from_u64(
            self.seed
                ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)
                ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9),
        );
        self.load_item(index, &mut rng)
    }

    pub fn try_get(&self, index: usize) -> DatasetResult<MixedItem> {
        self.try_get_in_epoch(index, 0)
    }
}

impl Dataset<MixedItem> for MixedDataset {
    fn get(&self, index: usize) -> Option<MixedItem> {
        match self.try_get(index) {
            Ok(item) => Some(item),
            Err(BurnDatasetError::IndexOutOfRange { .. }) => None,
            Err(e) => {
                eprintln!("warning: failed to load item {index}: {e}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.manifest.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{save_manifest, ShardWriter};
    use data_contracts::BinaryManifestSchemaVersion;

    fn build(dir: &Path, aug_copies: usize) {
        let n_mels = 2;
        let mut writer = ShardWriter::create(&dir.join("train.bin"), n_mels).unwrap();
        let orig = writer.append(&[1.0; 8]).unwrap();
        let augs: Vec<u64> = (0..aug_copies)
            .map(|k| writer.append(&[2.0 + k as f32; 8]).unwrap())
            .collect();
        writer.finish().unwrap();
        let manifest = BinaryManifest {
            schema_version: BinaryManifestSchemaVersion::V1,
            shard: "train.bin".into(),
            n_mels,
            sample_rate: 44100,
            hop_length: 512,
            items: vec![ItemMetadata {
                name: "a".into(),
                label_type: LabelType::FullLabel,
                wav_length: 0.05,
                num_frames: 4,
                ph_seq: vec![0, 1],
                ph_dur: vec![1, 3],
                feature_offset: orig,
                augmented_offsets: augs,
            }],
        };
        save_manifest(&dir.join("train.json"), &manifest).unwrap();
    }

    #[test]
    fn augmented_copy_comes_from_its_offset() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), 1);
        let ds = MixedDataset::open(tmp.path(), "train", 1).unwrap();
        let item = ds.get(0).unwrap();
        assert!(item.original.melspec.iter().all(|v| *v == 1.0));
        let aug = item.augmented.unwrap();
        assert!(aug.melspec.iter().all(|v| *v == 2.0));
        assert_eq!(aug.ph_frame, item.original.ph_frame);
    }

    #[test]
    fn no_augmentation_yields_originals_only() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), 1);
        let ds = MixedDataset::open(tmp.path(), "train", 0).unwrap();
        assert!(ds.get(0).unwrap().augmented.is_none());
        assert!(ds.get(1).is_none());
        assert_eq!(ds.get_label_types(), vec![LabelType::FullLabel]);
    }

    #[test]
    fn missing_augmented_copy_falls_back_to_original() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), 0);
        let ds = MixedDataset::open(tmp.path(), "train", 2).unwrap();
        let item = ds.get(0).unwrap();
        assert_eq!(item.augmented.unwrap().melspec, item.original.melspec);
    }

    #[test]
    fn augmented_pick_depends_on_seed_epoch_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), 4);
        let open = || MixedDataset::open(tmp.path(), "train", 1).unwrap().with_seed(5);
        let (a, b) = (open(), open());
        let pick = |ds: &MixedDataset, epoch: u64| {
            ds.try_get_in_epoch(0, epoch).unwrap().augmented.unwrap().melspec[0]
        };
        let picks: Vec<f32> = (0..16).map(|epoch| pick(&a, epoch)).collect();
        // Reloading in any order, from any instance, repeats the draw.
        for epoch in (0..16).rev() {
            assert_eq!(pick(&b, epoch), picks[epoch as usize]);
            assert_eq!(pick(&a, epoch), picks[epoch as usize]);
        }
        let mut distinct = picks.clone();
        distinct.sort_by(f32::total_cmp);
        distinct.dedup();
        assert!(distinct.len() > 1, "{picks:?}");
        assert!(picks.iter().all(|v| (2.0..6.0).contains(v)));
    }
}
