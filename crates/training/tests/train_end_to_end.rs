use burn_dataset::{save_manifest, ShardWriter};
use data_contracts::{BinaryManifest, BinaryManifestSchemaVersion, ItemMetadata, LabelType};
use std::fs;
use std::path::{Path, PathBuf};
use training::checkpoint::{checkpoint_name, latest_checkpoint, read_state};
use training::util::{run_train_in, TrainArgs};

const N_MELS: usize = 4;

const GLOBAL_YAML: &str = r#"
melspec_config:
  n_mels: 4
  sample_rate: 100
  hop_length: 10
  win_length: 20
  n_fft: 32
  fmin: 0
  fmax: 50
"#;

fn run_yaml(total_steps: usize) -> String {
    format!(
        r#"
model_name: tiny
random_seed: 7
dataloader_workers: 0
oversampling_weights: [1.0, 1.0, 1.0]
batch_max_length: 2.5
binning_length: 5.0
drop_last: false
data_augmentation_size: 1
model:
  hidden_dims: 8
  down_sampling_factor: 2
  down_sampling_times: 1
  channels_scaleup_factor: 1.5
optimizer_config:
  total_steps: {total_steps}
  weight_decay: 0.01
  lr:
    backbone: 0.001
    head: 0.001
  freeze_backbone: false
loss_config:
  losses:
    weights: [10.0, 0.1, 0.01, 1.0, 0.1]
    enable_RampUpScheduler: [false, false, false, true, true]
  function:
    label_smoothing: 0.08
accelerator: cpu
devices: 1
precision: 32-true
gradient_clip_val: 0.5
val_check_interval: 2
num_ckpt_keep: 2
"#
    )
}

fn write_split(dir: &Path, prefix: &str, count: usize) -> anyhow::Result<()> {
    let mut writer = ShardWriter::create(&dir.join(format!("{prefix}.bin")), N_MELS)?;
    let mut items = Vec::new();
    for i in 0..count {
        let frames = 6 + i % 4;
        let melspec: Vec<f32> = (0..frames * N_MELS).map(|j| ((i + j) % 7) as f32 * 0.1).collect();
        let offset = writer.append(&melspec)?;
        let aug: Vec<f32> = melspec.iter().map(|v| v * 0.9).collect();
        let aug = writer.append(&aug)?;
        let label_type = LabelType::from_index(i % 3).unwrap();
        let (ph_seq, ph_dur) = match label_type {
            LabelType::NoLabel => (vec![], vec![]),
            LabelType::WeakLabel => (vec![0, 1, 2], vec![]),
            LabelType::FullLabel => (vec![0, 1, 2, 0], vec![1, 2, frames as u32 - 4, 1]),
        };
        items.push(ItemMetadata {
            name: format!("{prefix}_{i:03}"),
            label_type,
            wav_length: frames as f32 * 0.1,
            num_frames: frames,
            ph_seq,
            ph_dur,
            feature_offset: offset,
            augmented_offsets: vec![aug],
        });
    }
    writer.finish()?;
    save_manifest(
        &dir.join(format!("{prefix}.json")),
        &BinaryManifest {
            schema_version: BinaryManifestSchemaVersion::V1,
            shard: format!("{prefix}.bin"),
            n_mels: N_MELS,
            sample_rate: 100,
            hop_length: 10,
            items,
        },
    )?;
    Ok(())
}

struct Workspace {
    _tmp: tempfile::TempDir,
    data: PathBuf,
    ckpt: PathBuf,
    config: PathBuf,
}

impl Workspace {
    fn new() -> anyhow::Result<Self> {
        Self::with_train_items(12)
    }

    fn with_train_items(train_items: usize) -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let data = tmp.path().join("data");
        let binary = data.join("binary");
        fs::create_dir_all(&binary)?;
        fs::write(binary.join("vocab.yaml"), "<vocab_size>: 3\nSP: 0\na: 1\nb: 2\n")?;
        fs::write(binary.join("global_config.yaml"), GLOBAL_YAML)?;
        write_split(&binary, "train", train_items)?;
        write_split(&binary, "valid", 3)?;
        let ckpt = tmp.path().join("ckpt");
        let config = tmp.path().join("train_config.yaml");
        Ok(Self {
            _tmp: tmp,
            data,
            ckpt,
            config,
        })
    }

    fn run(&self, total_steps: usize, extra: &[&str]) -> anyhow::Result<()> {
        self.run_config(&run_yaml(total_steps), extra)
    }

    fn run_config(&self, yaml: &str, extra: &[&str]) -> anyhow::Result<()> {
        fs::write(&self.config, yaml)?;
        let mut argv = vec![
            "train".to_string(),
            "-c".into(),
            self.config.display().to_string(),
            "-d".into(),
            self.data.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        run_train_in(TrainArgs::parse_normalized(argv), &self.ckpt)
    }

    fn saved_steps(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.ckpt.join("tiny"))
            .map(|rd| {
                rd.filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[test]
fn train_resume_and_finetune() -> anyhow::Result<()> {
    let ws = Workspace::new()?;

    ws.run(6, &[])?;
    assert_eq!(ws.saved_steps(), vec![checkpoint_name(4), checkpoint_name(6)]);
    let latest = latest_checkpoint(&ws.ckpt.join("tiny"))?.unwrap();
    assert!(latest.ends_with(checkpoint_name(6)));
    let state = read_state(&latest)?;
    assert_eq!(state.step, 6);
    assert!(!state.weights_only);

    ws.run(8, &["-r"])?;
    assert_eq!(ws.saved_steps(), vec![checkpoint_name(6), checkpoint_name(8)]);
    assert_eq!(read_state(&ws.ckpt.join("tiny").join(checkpoint_name(8)))?.step, 8);

    let pretrained = ws.ckpt.join("tiny").join(checkpoint_name(8));
    let pretrained = pretrained.display().to_string();
    ws.run(2, &["-p", &pretrained, "-r", "-ft"])?;
    let finetuned = ws.ckpt.join("tiny.ckpt");
    let state = read_state(&finetuned)?;
    assert!(state.weights_only);
    assert_eq!(state.step, 2);
    assert_eq!(ws.saved_steps(), vec![checkpoint_name(6), checkpoint_name(8)]);
    Ok(())
}

#[test]
fn checkpoints_left_by_another_run_are_kept() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let stale = ws.ckpt.join("tiny").join(checkpoint_name(100));
    fs::create_dir_all(&stale)?;
    ws.run(6, &[])?;
    assert_eq!(
        ws.saved_steps(),
        vec![checkpoint_name(100), checkpoint_name(4), checkpoint_name(6)]
    );
    assert_eq!(read_state(&ws.ckpt.join("tiny").join(checkpoint_name(6)))?.step, 6);
    Ok(())
}

#[test]
fn sparse_oversampling_survives_empty_epochs() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let yaml = run_yaml(2).replace("[1.0, 1.0, 1.0]", "[0.02, 0.02, 0.02]");
    ws.run_config(&yaml, &[])?;
    assert_eq!(ws.saved_steps(), vec![checkpoint_name(2)]);
    Ok(())
}

#[test]
fn sampler_without_items_is_rejected() -> anyhow::Result<()> {
    // Two items: one unlabeled, one weakly labeled; only full labels are drawn.
    let ws = Workspace::with_train_items(2)?;
    let yaml = run_yaml(2).replace("[1.0, 1.0, 1.0]", "[0.0, 0.0, 1.0]");
    let err = ws.run_config(&yaml, &[]).unwrap_err();
    assert!(format!("{err:#}").contains("draws no items"));
    Ok(())
}

#[test]
fn missing_global_config_is_reported() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    fs::remove_file(ws.data.join("binary").join("global_config.yaml"))?;
    let err = ws.run(2, &[]).unwrap_err();
    assert!(format!("{err:#}").contains("global_config.yaml"));
    Ok(())
}
