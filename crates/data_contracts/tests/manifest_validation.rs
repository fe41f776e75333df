use data_contracts::{BinaryManifest, BinaryManifestSchemaVersion, ItemMetadata, LabelType, Vocab};
use std::fs;

fn item(name: &str, label_type: LabelType, frames: usize) -> ItemMetadata {
    let (ph_seq, ph_dur) = match label_type {
        LabelType::NoLabel => (vec![], vec![]),
        LabelType::WeakLabel => (vec![0, 1, 2, 0], vec![]),
        LabelType::FullLabel => (vec![0, 1, 0], vec![1, frames as u32 - 2, 1]),
    };
    ItemMetadata {
        name: name.into(),
        label_type,
        wav_length: frames as f32 * 512.0 / 44100.0,
        num_frames: frames,
        ph_seq,
        ph_dur,
        feature_offset: 0,
        augmented_offsets: vec![],
    }
}

fn manifest(items: Vec<ItemMetadata>) -> BinaryManifest {
    BinaryManifest {
        schema_version: BinaryManifestSchemaVersion::V1,
        shard: "train.bin".into(),
        n_mels: 16,
        sample_rate: 44100,
        hop_length: 512,
        items,
    }
}

#[test]
fn mixed_label_manifest_passes() {
    let m = manifest(vec![
        item("a", LabelType::NoLabel, 10),
        item("b", LabelType::WeakLabel, 12),
        item("c", LabelType::FullLabel, 14),
    ]);
    assert!(m.validate(Some(3)).is_ok());
    assert_eq!(m.count_by_label(), [1, 1, 1]);
    assert!(m.total_hours(Some(LabelType::FullLabel)) > 0.0);
}

#[test]
fn duplicate_names_rejected() {
    let m = manifest(vec![
        item("a", LabelType::NoLabel, 10),
        item("a", LabelType::NoLabel, 11),
    ]);
    let err = m.validate(None).unwrap_err();
    assert!(err.contains("duplicate"), "unexpected error: {err}");
}

#[test]
fn weak_item_without_phones_rejected() {
    let mut bad = item("b", LabelType::WeakLabel, 12);
    bad.ph_seq.clear();
    assert!(manifest(vec![bad]).validate(None).is_err());
}

#[test]
fn manifest_json_and_vocab_yaml_load_from_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let m = manifest(vec![item("c", LabelType::FullLabel, 14)]);
    let path = tmp.path().join("train.json");
    fs::write(&path, serde_json::to_vec_pretty(&m)?)?;
    let loaded: BinaryManifest = serde_json::from_slice(&fs::read(&path)?)?;
    assert_eq!(loaded, m);

    let vocab_path = tmp.path().join("vocab.yaml");
    fs::write(&vocab_path, "<vocab_size>: 3\nSP: 0\na: 1\nb: 2\n")?;
    let vocab = Vocab::load(&vocab_path)?;
    assert!(loaded.validate(Some(vocab.vocab_size)).is_ok());
    Ok(())
}
