use crate::checkpoint::{latest_checkpoint, load_model, CheckpointCallback};
use crate::config::{Accelerator, TrainConfig};
use crate::progress::ProgressReporter;
use crate::task::{build_task, TaskConfig};
use crate::trainer::{Trainer, TrainerConfig};
use crate::TrainBackend;
use anyhow::Context;
use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use burn_dataset::{AlignDataLoader, MixedDataset, WeightedBinningAudioBatchSampler};
use clap::Parser;
use data_contracts::Vocab;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory that holds `<model_name>/step=<N>.ckpt` and finetuned weights.
pub const CKPT_ROOT: &str = "ckpt";

pub type TrainAutodiff = Autodiff<TrainBackend>;

#[derive(Parser, Debug, Clone)]
#[command(name = "train", about = "Train a forced-alignment model on binarized data")]
pub struct TrainArgs {
    /// Training configuration YAML.
    #[arg(short = 'c', long = "config_path", default_value = "configs/train_config.yaml")]
    pub config_path: PathBuf,
    /// Folder containing `binary/` produced by the binarizer.
    #[arg(short = 'd', long = "data_folder", default_value = "data")]
    pub data_folder: PathBuf,
    /// Checkpoint whose weights initialise the model.
    #[arg(short = 'p', long = "pretrained_model_path")]
    pub pretrained_model_path: Option<PathBuf>,
    /// Resume from the newest checkpoint under `ckpt/<model_name>`.
    #[arg(short = 'r', long = "resume")]
    pub resume: bool,
    /// Finetune: no periodic checkpoints, weights-only `ckpt/<model_name>.ckpt` at the end.
    #[arg(long = "ft")]
    pub ft: bool,
}

impl TrainArgs {
    /// Parse from `args`, accepting the two-letter `-ft` spelling.
    pub fn parse_normalized<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::parse_from(normalize_args(args))
    }
}

/// Rewrite `-ft` to `--ft`; clap short flags are single characters.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| if arg == "-ft" { OsString::from("--ft") } else { arg })
        .collect()
}

pub fn validate_accelerator(accelerator: Accelerator) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (accelerator, built_wgpu) {
        (Accelerator::Gpu, false) => {
            anyhow::bail!("accelerator `gpu` needs the backend-wgpu feature; rebuild with --features backend-wgpu or set accelerator: cpu")
        }
        (Accelerator::Cpu, true) => {
            tracing::warn!("built with backend-wgpu; training will still use the WGPU backend despite accelerator: cpu");
        }
        _ => {}
    }
    Ok(())
}

/// How a run starts, decided from the CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    Scratch,
    Pretrained(PathBuf),
    Resume(PathBuf),
}

/// `--pretrained_model_path` wins over `--resume`. A resume with no
/// checkpoint on disk starts from scratch.
pub fn start_mode(args: &TrainArgs, ckpt_dir: &Path) -> anyhow::Result<StartMode> {
    if let Some(path) = &args.pretrained_model_path {
        return Ok(StartMode::Pretrained(path.clone()));
    }
    if args.resume {
        return match latest_checkpoint(ckpt_dir)? {
            Some(path) => Ok(StartMode::Resume(path)),
            None => {
                tracing::warn!(
                    dir = %ckpt_dir.display(),
                    "no checkpoint found to resume from; training from scratch"
                );
                Ok(StartMode::Scratch)
            }
        };
    }
    Ok(StartMode::Scratch)
}

fn open_split(
    binary_dir: &Path,
    prefix: &str,
    augmentation: usize,
    cfg: &TrainConfig,
    vocab: &Vocab,
) -> anyhow::Result<MixedDataset> {
    let ds = MixedDataset::open(binary_dir, prefix, augmentation)
        .with_context(|| format!("failed to open {prefix} split in {}", binary_dir.display()))?;
    ds.manifest()
        .validate(Some(vocab.vocab_size))
        .map_err(|msg| anyhow::anyhow!("invalid {prefix} manifest: {msg}"))?;
    if ds.n_mels() != cfg.melspec_config.n_mels {
        anyhow::bail!(
            "{prefix} split has {} mel bins but melspec_config.n_mels is {}",
            ds.n_mels(),
            cfg.melspec_config.n_mels
        );
    }
    Ok(ds)
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    run_train_in(args, Path::new(CKPT_ROOT))
}

/// Full training run with checkpoints rooted at `ckpt_root`.
pub fn run_train_in(args: TrainArgs, ckpt_root: &Path) -> anyhow::Result<()> {
    let cfg = TrainConfig::load(&args.config_path, &args.data_folder)
        .with_context(|| format!("failed to load config {}", args.config_path.display()))?;
    validate_accelerator(cfg.accelerator)?;
    let binary_dir = args.data_folder.join("binary");
    let vocab_path = binary_dir.join("vocab.yaml");
    let vocab = Vocab::load(&vocab_path)
        .with_context(|| format!("failed to load vocabulary {}", vocab_path.display()))?;

    tracing::info!(
        matmul_precision = ?cfg.float32_matmul_precision,
        "float32 matmul precision has no effect on burn backends"
    );
    if !cfg.is_full_precision() {
        tracing::warn!(
            precision = %cfg.precision,
            "mixed precision is not supported; training in f32"
        );
    }
    TrainAutodiff::seed(cfg.random_seed);
    let device = <TrainAutodiff as Backend>::Device::default();

    let train_ds = open_split(&binary_dir, "train", cfg.data_augmentation_size, &cfg, &vocab)?
        .with_seed(cfg.random_seed);
    let sampler = WeightedBinningAudioBatchSampler::new(
        train_ds.get_label_types(),
        train_ds.get_wav_lengths(),
        cfg.oversampling_weights,
        cfg.effective_batch_max_length(),
        cfg.binning_length,
        cfg.drop_last,
    )
    .context("failed to build batch sampler")?
    .with_seed(cfg.random_seed);
    let train_ds = Arc::new(train_ds);
    let mut train_loader =
        AlignDataLoader::with_sampler(train_ds.clone(), sampler, cfg.dataloader_workers)?;
    let valid_ds = Arc::new(open_split(&binary_dir, "valid", 0, &cfg, &vocab)?);
    let mut valid_loader =
        AlignDataLoader::sequential(valid_ds.clone(), 1, cfg.dataloader_workers)?;
    let [no_label, weak_label, full_label] = train_ds.manifest().count_by_label();
    tracing::info!(
        train_items = train_ds.manifest().items.len(),
        no_label,
        weak_label,
        full_label,
        train_hours = train_ds.manifest().total_hours(None),
        valid_items = valid_ds.manifest().items.len(),
        train_batches = train_loader.len_hint(),
        "datasets ready"
    );

    let task_cfg = TaskConfig::from_train_config(&cfg, vocab);
    let mut task = build_task::<TrainAutodiff>(task_cfg, &device);

    let ckpt_dir = ckpt_root.join(&cfg.model_name);
    fs::create_dir_all(&ckpt_dir)
        .with_context(|| format!("failed to create {}", ckpt_dir.display()))?;

    let mut trainer = Trainer::<TrainAutodiff>::new(
        TrainerConfig {
            max_steps: cfg.optimizer_config.total_steps,
            max_epochs: None,
            val_check_interval: cfg.val_check_interval,
        },
        device.clone(),
    )
    .with_progress(ProgressReporter::new(1, true));
    if !args.ft {
        trainer = trainer.with_checkpoint(CheckpointCallback::new(
            &ckpt_dir,
            cfg.val_check_interval,
            cfg.num_ckpt_keep,
        ));
    }

    let resume_from = match start_mode(&args, &ckpt_dir)? {
        StartMode::Pretrained(path) => {
            let (pretrained, state) = load_model::<TrainAutodiff>(&path, &device)
                .with_context(|| format!("failed to load pretrained model {}", path.display()))?;
            if state.model != task.cfg.model || state.melspec.n_mels != task.cfg.melspec.n_mels {
                anyhow::bail!(
                    "pretrained model {} was trained with a different model or melspec config",
                    path.display()
                );
            }
            let head_copied = task.load_pretrained(pretrained);
            if !head_copied {
                tracing::warn!(
                    pretrained_vocab = state.vocab.vocab_size,
                    vocab = task.cfg.vocab_size(),
                    "vocabulary size differs; head left freshly initialised"
                );
            }
            tracing::info!(path = %path.display(), step = state.step, "loaded pretrained weights");
            None
        }
        StartMode::Resume(path) => Some(path),
        StartMode::Scratch => None,
    };

    let task = trainer.fit(
        task,
        &mut train_loader,
        &mut valid_loader,
        resume_from.as_deref(),
    )?;

    if args.ft {
        let path = PathBuf::from(format!("{}.ckpt", ckpt_dir.display()));
        trainer
            .save_checkpoint(&task, &path, true)
            .with_context(|| format!("failed to save {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved finetuned weights");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TrainArgs {
        TrainArgs::parse_normalized(std::iter::once("train").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_cli_contract() {
        let args = parse(&[]);
        assert_eq!(args.config_path, PathBuf::from("configs/train_config.yaml"));
        assert_eq!(args.data_folder, PathBuf::from("data"));
        assert!(args.pretrained_model_path.is_none());
        assert!(!args.resume && !args.ft);
    }

    #[test]
    fn short_flags_and_two_letter_ft() {
        let args = parse(&["-c", "a.yaml", "-d", "corpus", "-p", "m.ckpt", "-r", "-ft"]);
        assert_eq!(args.config_path, PathBuf::from("a.yaml"));
        assert_eq!(args.data_folder, PathBuf::from("corpus"));
        assert_eq!(args.pretrained_model_path, Some(PathBuf::from("m.ckpt")));
        assert!(args.resume);
        assert!(args.ft);
        assert!(parse(&["--ft"]).ft);
    }

    #[test]
    fn pretrained_wins_over_resume() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("step=5.ckpt")).unwrap();
        let args = parse(&["-p", "pre.ckpt", "-r"]);
        assert_eq!(
            start_mode(&args, tmp.path()).unwrap(),
            StartMode::Pretrained(PathBuf::from("pre.ckpt"))
        );
        let args = parse(&["-r"]);
        assert_eq!(
            start_mode(&args, tmp.path()).unwrap(),
            StartMode::Resume(tmp.path().join("step=5.ckpt"))
        );
    }

    #[test]
    fn resume_without_checkpoints_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(start_mode(&parse(&["-r"]), tmp.path()).unwrap(), StartMode::Scratch);
        assert_eq!(start_mode(&parse(&[]), tmp.path()).unwrap(), StartMode::Scratch);
    }

    #[test]
    fn gpu_without_wgpu_feature_is_rejected() {
        assert!(validate_accelerator(Accelerator::Auto).is_ok());
        if !cfg!(feature = "backend-wgpu") {
            assert!(validate_accelerator(Accelerator::Gpu).is_err());
        }
    }
}
