//! CLIPSeg lightweight segmentation decoder.
//!
//! Fuses a set of intermediate vision-transformer activations with one
//! conditioning embedding per image (FiLM modulation) and upsamples the
//! result back to pixel space through transposed convolutions.
//!
//! - [Paper](https://arxiv.org/abs/2112.10003). Image Segmentation Using Text and Image Prompts
//! - [Model Card](https://huggingface.co/CIDAS/clipseg-rd64-refined)
use candle::{IndexOp, Result, Tensor};
use candle_nn::{Module, VarBuilder};
use serde::Deserialize;

use super::with_tracing::{
    conv2d, conv_transpose2d, layer_norm, linear, Conv2d, ConvTranspose2d, LayerNorm, Linear,
};

fn default_hidden_size() -> usize {
    768
}

fn default_patch_size() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecoderConfig {
    /// Width of the incoming vision-tower activations.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Width of the conditioning embedding.
    pub projection_dim: usize,
    pub reduce_dim: usize,
    /// Vision-tower block indices whose activations feed the decoder, one
    /// decoder stage per entry.
    pub extract_layers: Vec<usize>,
    pub decoder_num_attention_heads: usize,
    pub decoder_intermediate_size: usize,
    pub conditional_layer: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default)]
    pub use_complex_transposed_convolution: bool,
}

impl DecoderConfig {
    /// https://huggingface.co/CIDAS/clipseg-rd64-refined/blob/main/config.json
    pub fn rd64_refined() -> Self {
        Self {
            hidden_size: 768,
            projection_dim: 512,
            reduce_dim: 64,
            extract_layers: vec![3, 6, 9],
            decoder_num_attention_heads: 4,
            decoder_intermediate_size: 2048,
            conditional_layer: 0,
            patch_size: 16,
            use_complex_transposed_convolution: true,
        }
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let q_proj = linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = linear(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;
        let scale = ((embed_dim / num_heads) as f64).powf(-0.5);
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            scale,
        })
    }

    fn shape_multihead(&self, xs: &Tensor, b: usize, seq_len: usize) -> Result<Tensor> {
        let head_dim = xs.dim(candle::D::Minus1)? / self.num_heads;
        xs.reshape((b, seq_len, self.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq_len, embed_dim) = xs.dims3()?;
        let q = self.shape_multihead(&self.q_proj.forward(xs)?, b, seq_len)?;
        let k = self.shape_multihead(&self.k_proj.forward(xs)?, b, seq_len)?;
        let v = self.shape_multihead(&self.v_proj.forward(xs)?, b, seq_len)?;
        let q = (q * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let attn = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, embed_dim))?;
        self.out_proj.forward(&attn)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(embed_dim: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(embed_dim, intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(intermediate_size, embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // The pretrained decoder uses relu, not the towers' gelu.
        self.fc2.forward(&self.fc1.forward(xs)?.relu()?)
    }
}

// Post-layer-norm transformer layer.
#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = Attention::new(
            cfg.reduce_dim,
            cfg.decoder_num_attention_heads,
            vb.pp("self_attn"),
        )?;
        let layer_norm1 = layer_norm(cfg.reduce_dim, 1e-5, vb.pp("layer_norm1"))?;
        let mlp = Mlp::new(cfg.reduce_dim, cfg.decoder_intermediate_size, vb.pp("mlp"))?;
        let layer_norm2 = layer_norm(cfg.reduce_dim, 1e-5, vb.pp("layer_norm2"))?;
        Ok(Self {
            self_attn,
            layer_norm1,
            mlp,
            layer_norm2,
        })
    }
}

impl Module for DecoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.layer_norm1.forward(&(xs + self.self_attn.forward(xs)?)?)?;
        self.layer_norm2.forward(&(&xs + self.mlp.forward(&xs)?)?)
    }
}

#[derive(Debug)]
enum UpsampleHead {
    Simple(ConvTranspose2d),
    Refined {
        conv: Conv2d,
        up1: ConvTranspose2d,
        up2: ConvTranspose2d,
    },
}

impl UpsampleHead {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("transposed_convolution");
        if cfg.use_complex_transposed_convolution {
            let kernel_size = cfg.patch_size / 4;
            let conv_cfg = candle_nn::Conv2dConfig {
                padding: 1,
                ..Default::default()
            };
            let up_cfg = candle_nn::ConvTranspose2dConfig {
                stride: kernel_size,
                ..Default::default()
            };
            let conv = conv2d(cfg.reduce_dim, cfg.reduce_dim, 3, conv_cfg, vb.pp("0"))?;
            let up1 = conv_transpose2d(
                cfg.reduce_dim,
                cfg.reduce_dim / 2,
                kernel_size,
                up_cfg,
                vb.pp("2"),
            )?;
            let up2 = conv_transpose2d(cfg.reduce_dim / 2, 1, kernel_size, up_cfg, vb.pp("4"))?;
            Ok(Self::Refined { conv, up1, up2 })
        } else {
            let up_cfg = candle_nn::ConvTranspose2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            };
            let up = conv_transpose2d(cfg.reduce_dim, 1, cfg.patch_size, up_cfg, vb)?;
            Ok(Self::Simple(up))
        }
    }
}

impl Module for UpsampleHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Simple(up) => up.forward(xs),
            Self::Refined { conv, up1, up2 } => {
                let xs = conv.forward(xs)?.relu()?;
                let xs = up1.forward(&xs)?.relu()?;
                up2.forward(&xs)
            }
        }
    }
}

/// The decoder proper. Consumes one activation tensor per configured
/// extract layer plus a batch of conditioning embeddings and returns
/// spatial logits `(batch, height, width)`.
pub struct Decoder {
    film_mul: Linear,
    film_add: Linear,
    reduces: Vec<Linear>,
    layers: Vec<DecoderLayer>,
    head: UpsampleHead,
    conditional_layer: usize,
    span: tracing::Span,
}

impl Decoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let film_mul = linear(cfg.projection_dim, cfg.reduce_dim, vb.pp("film_mul"))?;
        let film_add = linear(cfg.projection_dim, cfg.reduce_dim, vb.pp("film_add"))?;
        let vb_r = vb.pp("reduces");
        let reduces = (0..cfg.extract_layers.len())
            .map(|i| linear(cfg.hidden_size, cfg.reduce_dim, vb_r.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.extract_layers.len())
            .map(|i| DecoderLayer::new(cfg, vb_l.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let head = UpsampleHead::new(cfg, vb)?;
        Ok(Self {
            film_mul,
            film_add,
            reduces,
            layers,
            head,
            conditional_layer: cfg.conditional_layer,
            span: tracing::span!(tracing::Level::TRACE, "clipseg-decoder"),
        })
    }

    /// Number of activation tensors the decoder expects.
    pub fn num_stages(&self) -> usize {
        self.reduces.len()
    }

    /// `activations` are consumed deepest-first (reverse of the configured
    /// extract-layer order); FiLM conditioning is applied at the
    /// configured stage.
    pub fn forward(
        &self,
        activations: &[Tensor],
        conditional_embeddings: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        if activations.len() != self.reduces.len() {
            candle::bail!(
                "the number of activations {} does not match the number of decoder stages {}",
                activations.len(),
                self.reduces.len()
            )
        }
        let mut output: Option<Tensor> = None;
        for (i, ((activation, reduce), layer)) in activations
            .iter()
            .rev()
            .zip(self.reduces.iter())
            .zip(self.layers.iter())
            .enumerate()
        {
            let reduced = reduce.forward(activation)?;
            let mut xs = match output {
                Some(prev) => (reduced + prev)?,
                None => reduced,
            };
            if i == self.conditional_layer {
                let mul = self.film_mul.forward(conditional_embeddings)?.unsqueeze(1)?;
                let add = self.film_add.forward(conditional_embeddings)?.unsqueeze(1)?;
                xs = xs.broadcast_mul(&mul)?.broadcast_add(&add)?;
            }
            output = Some(layer.forward(&xs)?);
        }
        let output = match output {
            Some(output) => output,
            None => candle::bail!("the decoder needs at least one activation"),
        };
        // Drop the class token and fold the patch tokens back into a grid.
        let output = output.i((.., 1..))?;
        let (b, seq_len, channels) = output.dims3()?;
        let size = (seq_len as f64).sqrt() as usize;
        if size * size != seq_len {
            candle::bail!("activation length {seq_len} is not a square number of patches")
        }
        let output = output.transpose(1, 2)?.reshape((b, channels, size, size))?;
        let logits = self.head.forward(&output)?;
        logits.squeeze(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_load() {
        let raw_json = r#"{
            "conditional_layer": 0,
            "decoder_attention_dropout": 0.0,
            "decoder_hidden_act": "quick_gelu",
            "decoder_intermediate_size": 2048,
            "decoder_num_attention_heads": 4,
            "extract_layers": [3, 6, 9],
            "model_type": "clipseg",
            "projection_dim": 512,
            "reduce_dim": 64,
            "use_complex_transposed_convolution": true
          }"#;
        let config: DecoderConfig = serde_json::from_str(raw_json).unwrap();
        assert_eq!(vec![3, 6, 9], config.extract_layers);
        assert_eq!(64, config.reduce_dim);
        assert_eq!(768, config.hidden_size);
        assert!(config.use_complex_transposed_convolution);
    }
}
