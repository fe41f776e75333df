use anyhow::Context;
use burn::tensor::backend::Backend;
use burn_dataset::{collate, AlignDataLoader, MixedDataset};
use clap::Parser;
use data_contracts::Vocab;
use std::path::PathBuf;
use std::sync::Arc;
use training::checkpoint::{load_model, task_config_from_state};
use training::task::{validate_batch, TaskConfig, ValidationSummary};
use training::trainer::log_validation;
use training::{TrainBackend, TrainConfig};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a forced-alignment checkpoint on the validation split (losses, boundary error, phone IoU)"
)]
struct Args {
    /// Checkpoint directory (`step=<N>.ckpt` or a finetuned `<model_name>.ckpt`).
    #[arg(long)]
    checkpoint: PathBuf,
    /// Training configuration YAML (loss weights and label smoothing).
    #[arg(short = 'c', long = "config_path", default_value = "configs/train_config.yaml")]
    config_path: PathBuf,
    /// Folder containing `binary/`.
    #[arg(short = 'd', long = "data_folder", default_value = "data")]
    data_folder: PathBuf,
    /// Items per validation batch.
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
    /// Loader threads; 0 loads on the main thread.
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let cfg = TrainConfig::load(&args.config_path, &args.data_folder)
        .with_context(|| format!("failed to load config {}", args.config_path.display()))?;
    training::util::validate_accelerator(cfg.accelerator)?;
    let binary_dir = args.data_folder.join("binary");
    let vocab = Vocab::load(&binary_dir.join("vocab.yaml")).context("failed to load vocabulary")?;

    let device = <TrainBackend as Backend>::Device::default();
    let (model, state) = load_model::<TrainBackend>(&args.checkpoint, &device)
        .with_context(|| format!("failed to load checkpoint {}", args.checkpoint.display()))?;
    if state.vocab.vocab_size != vocab.vocab_size {
        anyhow::bail!(
            "checkpoint vocabulary has {} classes but {} has {}",
            state.vocab.vocab_size,
            binary_dir.display(),
            vocab.vocab_size
        );
    }
    let task_cfg = task_config_from_state(&TaskConfig::from_train_config(&cfg, vocab), &state);

    let valid = Arc::new(
        MixedDataset::open(&binary_dir, "valid", 0)
            .with_context(|| format!("failed to open valid split in {}", binary_dir.display()))?,
    );
    if valid.n_mels() != task_cfg.melspec.n_mels {
        anyhow::bail!(
            "valid split has {} mel bins but the checkpoint expects {}",
            valid.n_mels(),
            task_cfg.melspec.n_mels
        );
    }
    let mut loader = AlignDataLoader::sequential(valid, args.batch_size, args.workers)?;

    let weights = task_cfg.weights_at(state.step);
    let mut summary = ValidationSummary::default();
    for items in loader.epoch() {
        let items = items.context("failed to load validation batch")?;
        let batch = collate::<TrainBackend>(&items, task_cfg.vocab_size(), &device)?;
        validate_batch(&model, &batch, &task_cfg, &weights, &mut summary);
    }
    if summary.batches == 0 {
        tracing::warn!("validation split is empty");
        return Ok(());
    }
    log_validation(state.step, &summary);
    Ok(())
}
