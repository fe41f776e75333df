#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod ctc;
pub mod decode;
pub mod losses;
pub mod progress;
pub mod scheduler;
pub mod task;
pub mod trainer;
pub mod util;

pub use checkpoint::{
    latest_checkpoint, load_model, CheckpointCallback, CheckpointError, CheckpointState,
};
pub use config::{merge_config, ConfigError, TrainConfig};
pub use models::{ForcedAlignmentModel, ModelConfig};
pub use task::{build_task, ForcedAlignmentTask, TaskConfig};
pub use trainer::{Trainer, TrainerConfig};
pub use util::{run_train, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
