//! Burn model for phoneme forced alignment.
//!
//! `ForcedAlignmentModel` maps log-mel frames `[batch, frames, n_mels]` to
//! per-frame logits for three targets:
//! - phone boundary (edge) logits,
//! - frame-level phoneme classification logits,
//! - CTC logits with the blank class at index 0.
//!
//! The model is a pure Burn `Module`. Losses, optimizers and decoding live in
//! the `training` crate.

use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig};
use burn::nn::pool::{AvgPool1d, AvgPool1dConfig};
use burn::nn::PaddingConfig1d;
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Backbone hyper-parameters (`model:` in the training config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_dims: usize,
    pub down_sampling_factor: usize,
    pub down_sampling_times: usize,
    pub channels_scaleup_factor: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: 64,
            down_sampling_factor: 2,
            down_sampling_times: 3,
            channels_scaleup_factor: 1.5,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.hidden_dims == 0 {
            return Err("model.hidden_dims must be positive".into());
        }
        if self.down_sampling_factor < 2 && self.down_sampling_times > 0 {
            return Err("model.down_sampling_factor must be at least 2".into());
        }
        if !(self.channels_scaleup_factor.is_finite() && self.channels_scaleup_factor > 0.0) {
            return Err("model.channels_scaleup_factor must be positive".into());
        }
        Ok(())
    }

    /// Channel width at U-Net level `level`.
    pub fn channels_at(&self, level: usize) -> usize {
        let scaled = self.hidden_dims as f32 * self.channels_scaleup_factor.powi(level as i32);
        (scaled.round() as usize).max(1)
    }

    /// Input lengths are padded to a multiple of this.
    pub fn length_multiple(&self) -> usize {
        self.down_sampling_factor
            .max(1)
            .pow(self.down_sampling_times as u32)
    }
}

#[derive(Debug, Module)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv1d<B>,
    conv2: Conv1d<B>,
    skip: Option<Conv1d<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv1 = Conv1dConfig::new(in_channels, out_channels, 3)
            .with_padding(PaddingConfig1d::Explicit(1))
            .init(device);
        let conv2 = Conv1dConfig::new(out_channels, out_channels, 3)
            .with_padding(PaddingConfig1d::Explicit(1))
            .init(device);
        let skip = (in_channels != out_channels)
            .then(|| Conv1dConfig::new(in_channels, out_channels, 1).init(device));
        Self { conv1, conv2, skip }
    }

    /// `[N, C_in, T] -> [N, C_out, T]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let residual = match &self.skip {
            Some(skip) => skip.forward(x.clone()),
            None => x.clone(),
        };
        let h = gelu(self.conv1.forward(x));
        let h = self.conv2.forward(h);
        gelu(h + residual)
    }
}

/// 1-D U-Net over the time axis.
#[derive(Debug, Module)]
pub struct UNetBackbone<B: Backend> {
    input_proj: Conv1d<B>,
    encoders: Vec<ResidualBlock<B>>,
    expanders: Vec<ResidualBlock<B>>,
    pool: AvgPool1d,
    middle: ResidualBlock<B>,
    upsamplers: Vec<ConvTranspose1d<B>>,
    decoders: Vec<ResidualBlock<B>>,
    length_multiple: usize,
}

impl<B: Backend> UNetBackbone<B> {
    pub fn new(cfg: &ModelConfig, n_mels: usize, device: &B::Device) -> Self {
        let factor = cfg.down_sampling_factor.max(1);
        let levels = cfg.down_sampling_times;
        let input_proj = Conv1dConfig::new(n_mels, cfg.channels_at(0), 1).init(device);
        let mut encoders = Vec::with_capacity(levels);
        let mut expanders = Vec::with_capacity(levels);
        let mut upsamplers = Vec::with_capacity(levels);
        let mut decoders = Vec::with_capacity(levels);
        for level in 0..levels {
            let c = cfg.channels_at(level);
            let c_next = cfg.channels_at(level + 1);
            encoders.push(ResidualBlock::new(c, c, device));
            expanders.push(ResidualBlock::new(c, c_next, device));
            upsamplers.push(
                ConvTranspose1dConfig::new([c_next, c], factor)
                    .with_stride(factor)
                    .init(device),
            );
            decoders.push(ResidualBlock::new(2 * c, c, device));
        }
        let bottom = cfg.channels_at(levels);
        Self {
            input_proj,
            encoders,
            expanders,
            pool: AvgPool1dConfig::new(factor).with_stride(factor).init(),
            middle: ResidualBlock::new(bottom, bottom, device),
            upsamplers,
            decoders,
            length_multiple: cfg.length_multiple(),
        }
    }

    /// `[N, T, n_mels] -> [N, T, hidden_dims]`
    pub fn forward(&self, melspec: Tensor<B, 3>) -> Tensor<B, 3> {
        let [n, t, m] = melspec.dims();
        let padded = t.div_ceil(self.length_multiple) * self.length_multiple;
        let mut x = melspec;
        if padded > t {
            let pad = Tensor::zeros([n, padded - t, m], &x.device());
            x = Tensor::cat(vec![x, pad], 1);
        }
        let mut x = self.input_proj.forward(x.swap_dims(1, 2));

        let mut skips = Vec::with_capacity(self.encoders.len());
        for (encoder, expander) in self.encoders.iter().zip(&self.expanders) {
            x = encoder.forward(x);
            skips.push(x.clone());
            x = expander.forward(self.pool.forward(x));
        }
        x = self.middle.forward(x);
        for ((up, decoder), skip) in self
            .upsamplers
            .iter()
            .zip(&self.decoders)
            .zip(skips)
            .rev()
        {
            x = up.forward(x);
            x = decoder.forward(Tensor::cat(vec![x, skip], 1));
        }

        let [_, c, _] = x.dims();
        x.slice([0..n, 0..c, 0..t]).swap_dims(1, 2)
    }
}

/// Per-frame outputs of [`ForcedAlignmentModel::forward`].
#[derive(Debug, Clone)]
pub struct AlignmentLogits<B: Backend> {
    /// `[N, T, vocab_size]`
    pub ph_frame_logits: Tensor<B, 3>,
    /// `[N, T]`
    pub ph_edge_logits: Tensor<B, 2>,
    /// `[N, T, vocab_size]`, blank at index 0 and phone `k` at index `k`.
    pub ctc_logits: Tensor<B, 3>,
}

#[derive(Debug, Module)]
pub struct ForcedAlignmentModel<B: Backend> {
    pub backbone: UNetBackbone<B>,
    pub head: nn::Linear<B>,
    vocab_size: usize,
}

impl<B: Backend> ForcedAlignmentModel<B> {
    pub fn new(cfg: &ModelConfig, n_mels: usize, vocab_size: usize, device: &B::Device) -> Self {
        let backbone = UNetBackbone::new(cfg, n_mels, device);
        let head = nn::LinearConfig::new(cfg.channels_at(0), vocab_size + 2).init(device);
        Self {
            backbone,
            head,
            vocab_size,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Raw head output `[N, T, vocab_size + 2]`.
    pub fn forward_raw(&self, melspec: Tensor<B, 3>) -> Tensor<B, 3> {
        self.head.forward(self.backbone.forward(melspec))
    }

    pub fn forward(&self, melspec: Tensor<B, 3>) -> AlignmentLogits<B> {
        let h = self.forward_raw(melspec);
        let [n, t, d] = h.dims();
        let ph_edge_logits = h.clone().slice([0..n, 0..t, 0..1]).reshape([n, t]);
        let ctc_logits = Tensor::cat(
            vec![
                h.clone().slice([0..n, 0..t, 1..2]),
                h.clone().slice([0..n, 0..t, 3..d]),
            ],
            2,
        );
        let ph_frame_logits = h.slice([0..n, 0..t, 2..d]);
        AlignmentLogits {
            ph_frame_logits,
            ph_edge_logits,
            ctc_logits,
        }
    }

    /// Take weights from a pretrained model. The backbone is always copied;
    /// the head only when its shape matches (same vocabulary size).
    /// Returns whether the head was copied.
    pub fn load_pretrained(self, pretrained: ForcedAlignmentModel<B>) -> (Self, bool) {
        let head_matches = self.head.weight.val().dims() == pretrained.head.weight.val().dims();
        let head = if head_matches {
            pretrained.head
        } else {
            self.head
        };
        (
            Self {
                backbone: pretrained.backbone,
                head,
                vocab_size: self.vocab_size,
            },
            head_matches,
        )
    }
}

pub mod prelude {
    pub use super::{AlignmentLogits, ForcedAlignmentModel, ModelConfig, UNetBackbone};
}
