//! Text-conditioned segmentation: BiomedCLIP encoder + CLIPSeg decoder.
//!
//! The vision tower runs as a fixed feature extractor whose intermediate
//! activations are fused with a pooled prompt embedding by the decoder,
//! yielding one logit map per image/prompt pair.
//!
//! ```no_run
//! use biomedclipseg::models::biomedclipseg::{BiomedClipSeg, BiomedClipSegConfig};
//! use candle::{DType, Device, Tensor};
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let config = BiomedClipSegConfig::biomedclip_vit_base_rd64();
//! let model = BiomedClipSeg::new(&config, DType::F32, &device)?;
//! let pixel_values = Tensor::zeros((1, 3, 224, 224), DType::F32, &device)?;
//! let input_ids = Tensor::zeros((1, 16), DType::U32, &device)?;
//! let logits = model.forward(&pixel_values, &input_ids, None)?;
//! assert_eq!(logits.dims(), &[1, 1, 224, 224]);
//! # Ok(())
//! # }
//! ```
use std::path::Path;

use candle::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::Deserialize;

use super::biomedclip::{BiomedClip, BiomedClipConfig};
use super::clipseg::{Decoder, DecoderConfig};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BiomedClipSegConfig {
    pub clip: BiomedClipConfig,
    pub decoder: DecoderConfig,
    /// Keep the encoder parameters out of `trainable_vars`.
    #[serde(default = "default_true")]
    pub freeze_encoder: bool,
    /// Keep the decoder parameters out of `trainable_vars`.
    #[serde(default)]
    pub freeze_decoder: bool,
    /// Start from a freshly initialized decoder instead of pretrained
    /// weights.
    #[serde(default = "default_true")]
    pub rand_init_decoder: bool,
}

impl BiomedClipSegConfig {
    pub fn biomedclip_vit_base_rd64() -> Self {
        Self {
            clip: BiomedClipConfig::vit_base_patch16_224(),
            decoder: DecoderConfig::rd64_refined(),
            freeze_encoder: true,
            freeze_decoder: false,
            rand_init_decoder: true,
        }
    }
}

/// Maps configured extract-layer indices to entries of the captured
/// block-output list.
///
/// Configured indices count the embedding output preceding the first
/// block as layer 0, while the stored list starts at the first block's
/// output, so entry `i + 1` is read for index `i`.
pub fn select_activations(
    hidden_states: &[Tensor],
    extract_layers: &[usize],
) -> Result<Vec<Tensor>> {
    extract_layers
        .iter()
        .map(|&i| match hidden_states.get(i + 1) {
            Some(activation) => Ok(activation.clone()),
            None => candle::bail!(
                "extract layer {i} is out of range for {} captured activations",
                hidden_states.len()
            ),
        })
        .collect()
}

/// The composite segmentation model. Owns the parameters of both
/// subsystems; an external optimizer mutates them through
/// [`BiomedClipSeg::trainable_vars`].
pub struct BiomedClipSeg {
    clip: BiomedClip,
    decoder: Decoder,
    extract_layers: Vec<usize>,
    encoder_vars: VarMap,
    decoder_vars: VarMap,
    encoder_trainable: bool,
    decoder_trainable: bool,
    span: tracing::Span,
}

impl BiomedClipSeg {
    /// Builds the model with freshly initialized parameters for both
    /// subsystems.
    pub fn new(cfg: &BiomedClipSegConfig, dtype: DType, device: &Device) -> Result<Self> {
        let encoder_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&encoder_vars, dtype, device);
        let clip = BiomedClip::new(&cfg.clip, vb)?;
        let decoder_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&decoder_vars, dtype, device);
        let decoder = Decoder::new(&cfg.decoder, vb.pp("decoder"))?;
        Ok(Self {
            clip,
            decoder,
            extract_layers: cfg.decoder.extract_layers.clone(),
            encoder_vars,
            decoder_vars,
            encoder_trainable: !cfg.freeze_encoder,
            decoder_trainable: !cfg.freeze_decoder,
            span: tracing::span!(tracing::Level::TRACE, "biomedclipseg"),
        })
    }

    /// Builds the model and loads pretrained encoder weights; decoder
    /// weights are loaded only when `rand_init_decoder` is off, in which
    /// case they are required.
    pub fn load<P: AsRef<Path>>(
        cfg: &BiomedClipSegConfig,
        encoder_weights: P,
        decoder_weights: Option<P>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut model = Self::new(cfg, dtype, device)?;
        model.encoder_vars.load(encoder_weights)?;
        if !cfg.rand_init_decoder {
            match decoder_weights {
                Some(weights) => model.decoder_vars.load(weights)?,
                None => {
                    candle::bail!("decoder weights are required when rand_init_decoder is off")
                }
            }
        }
        Ok(model)
    }

    pub fn clip(&self) -> &BiomedClip {
        &self.clip
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Pooled prompt embeddings for decoding, `(batch, projection_dim)`,
    /// usable on its own to cache prompt conditioning across many images.
    pub fn get_conditional_embeddings(
        &self,
        batch_size: usize,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let num_prompts = input_ids.dim(0)?;
        if num_prompts != batch_size {
            candle::bail!(
                "make sure to pass as many prompt texts as there are query images, got {num_prompts} prompts for {batch_size} images"
            )
        }
        self.clip.text.forward(input_ids, attention_mask)
    }

    /// Segmentation logits `(batch, 1, height, width)` for a batch of
    /// images paired 1:1 with tokenized prompts.
    pub fn forward(
        &self,
        pixel_values: &Tensor,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        // Step 1: image activations from the vision tower. The tower acts
        // as a fixed feature extractor: its outputs are detached and never
        // carry gradient history, whatever the trainability flags say.
        let (_pooled, hidden_states) = self.clip.visual.forward_with_hidden_states(pixel_values)?;
        let activations = select_activations(&hidden_states, &self.extract_layers)?;
        let activations = activations
            .iter()
            .map(|activation| activation.detach())
            .collect::<Vec<_>>();
        // Step 2: conditioning embeddings from the prompts, one per image.
        // This path stays attached so the text tower and decoder can train.
        let conditional_embeddings =
            self.get_conditional_embeddings(pixel_values.dim(0)?, input_ids, attention_mask)?;
        // Step 3: decode to spatial logits.
        let logits = self
            .decoder
            .forward(&activations, &conditional_embeddings)?;
        logits.unsqueeze(1)
    }

    pub fn encoder_trainable(&self) -> bool {
        self.encoder_trainable
    }

    pub fn decoder_trainable(&self) -> bool {
        self.decoder_trainable
    }

    pub fn set_encoder_trainable(&mut self, trainable: bool) {
        self.encoder_trainable = trainable;
    }

    pub fn set_decoder_trainable(&mut self, trainable: bool) {
        self.decoder_trainable = trainable;
    }

    pub fn encoder_vars(&self) -> Vec<Var> {
        self.encoder_vars.all_vars()
    }

    pub fn decoder_vars(&self) -> Vec<Var> {
        self.decoder_vars.all_vars()
    }

    /// Parameters of the unfrozen subsystems, for an external optimizer.
    ///
    /// Encoder vars listed here still receive no gradient through
    /// `forward`: the vision path is always detached.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if self.encoder_trainable {
            vars.extend(self.encoder_vars.all_vars());
        }
        if self.decoder_trainable {
            vars.extend(self.decoder_vars.all_vars());
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::IndexOp;

    fn block_outputs(device: &Device) -> Result<Vec<Tensor>> {
        (0..4)
            .map(|i| Tensor::full(i as f32, (1, 2, 3), device))
            .collect()
    }

    #[test]
    fn selects_with_unit_offset() -> Result<()> {
        let device = Device::Cpu;
        let hidden_states = block_outputs(&device)?;
        let selected = select_activations(&hidden_states, &[0, 2])?;
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].i((0, 0, 0))?.to_scalar::<f32>()?, 1.0);
        assert_eq!(selected[1].i((0, 0, 0))?.to_scalar::<f32>()?, 3.0);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_layers() -> Result<()> {
        let device = Device::Cpu;
        let hidden_states = block_outputs(&device)?;
        assert!(select_activations(&hidden_states, &[2]).is_ok());
        assert!(select_activations(&hidden_states, &[3]).is_err());
        Ok(())
    }
}
