//! BiomedCLIP dual encoder.
//!
//! A contrastively pretrained image/text model for the biomedical domain:
//! a timm ViT-B/16 vision tower and a PubMedBERT text tower, both
//! projected into one shared embedding space.
//!
//! - [Model Card](https://huggingface.co/microsoft/BiomedCLIP-PubMedBERT_256-vit_base_patch16_224)
//! - [open_clip](https://github.com/mlfoundations/open_clip)
pub mod text_model;
pub mod vision_model;

use candle::{Result, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BiomedClipConfig {
    pub vision: vision_model::Config,
    pub text: text_model::Config,
}

impl BiomedClipConfig {
    pub fn vit_base_patch16_224() -> Self {
        Self {
            vision: vision_model::Config::vit_base_patch16_224(),
            text: text_model::Config::pubmed_bert_base(),
        }
    }
}

/// The dual-tower encoder. Tensor names follow the open_clip checkpoint
/// layout (`visual.*`, `text.*`).
pub struct BiomedClip {
    pub visual: vision_model::VisionTransformer,
    pub text: text_model::TextTransformer,
}

impl BiomedClip {
    pub fn new(cfg: &BiomedClipConfig, vb: VarBuilder) -> Result<Self> {
        let visual = vision_model::VisionTransformer::new(&cfg.vision, vb.pp("visual"))?;
        let text = text_model::TextTransformer::new(&cfg.text, vb.pp("text"))?;
        Ok(Self { visual, text })
    }

    /// Pooled, projected image embedding, `(batch, projection_dim)`.
    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (pooled, _hidden_states) = self.visual.forward_with_hidden_states(pixel_values)?;
        Ok(pooled)
    }

    /// Pooled, projected prompt embedding, `(batch, projection_dim)`.
    pub fn encode_text(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.text.forward(input_ids, attention_mask)
    }
}
