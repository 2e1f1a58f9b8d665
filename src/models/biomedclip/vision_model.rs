//! Vision tower of BiomedCLIP: a timm-style ViT-B/16 trunk followed by a
//! linear projection into the shared image/text embedding space.
//!
//! The trunk keeps the output of every transformer block around so that a
//! downstream decoder can tap intermediate activations, see
//! [`VisionTransformer::forward_with_hidden_states`].
use candle::{IndexOp, Result, Tensor};
use candle_nn::{Module, VarBuilder};
use serde::Deserialize;

use super::super::with_tracing::{conv2d, layer_norm, linear_b, Conv2d, LayerNorm, Linear};

/// Strategy for collapsing the token sequence into one image embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GlobalPool {
    /// Use the class token.
    #[default]
    Token,
    /// Mean over all non-prefix tokens.
    Avg,
}

fn default_num_prefix_tokens() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: candle_nn::Activation,
    pub layer_norm_eps: f64,
    pub qkv_bias: bool,
    pub projection_dim: usize,
    #[serde(default)]
    pub global_pool: GlobalPool,
    #[serde(default = "default_num_prefix_tokens")]
    pub num_prefix_tokens: usize,
    #[serde(default)]
    pub pre_norm: bool,
    #[serde(default)]
    pub use_fc_norm: bool,
}

impl Config {
    /// The visual tower of BiomedCLIP-PubMedBERT_256-vit_base_patch16_224.
    pub fn vit_base_patch16_224() -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            num_channels: 3,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: candle_nn::Activation::Gelu,
            layer_norm_eps: 1e-6,
            qkv_bias: true,
            projection_dim: 512,
            global_pool: GlobalPool::Token,
            num_prefix_tokens: 1,
            pre_norm: false,
            use_fc_norm: false,
        }
    }
}

#[derive(Debug)]
struct PatchEmbed {
    proj: Conv2d,
    patch_size: usize,
    num_patches: usize,
}

impl PatchEmbed {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = candle_nn::Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        let num_patches = (cfg.image_size / cfg.patch_size).pow(2);
        Ok(Self {
            proj,
            patch_size: cfg.patch_size,
            num_patches,
        })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        if h % self.patch_size != 0 {
            candle::bail!(
                "image height {h} is not a multiple of patch size {}",
                self.patch_size
            )
        }
        if w % self.patch_size != 0 {
            candle::bail!(
                "image width {w} is not a multiple of patch size {}",
                self.patch_size
            )
        }
        let xs = self.proj.forward(xs)?;
        let (b, c, h, w) = xs.dims4()?;
        xs.reshape((b, c, h * w))?.transpose(1, 2)
    }
}

#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        let qkv = linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let proj = linear_b(dim, dim, true, vb.pp("proj"))?;
        let scale = 1. / ((dim / num_heads) as f64).sqrt();
        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale,
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .transpose(1, 2)? // 02134
            .transpose(0, 1)? // 20134
            .transpose(2, 3)?; // 20314
        let q = (qkv.i(0)? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let attn = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&attn)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
    act: candle_nn::Activation,
}

impl Mlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear_b(cfg.hidden_size, cfg.intermediate_size, true, vb.pp("fc1"))?;
        let fc2 = linear_b(cfg.intermediate_size, cfg.hidden_size, true, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            act: cfg.hidden_act,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc1
            .forward(xs)?
            .apply(&self.act)?
            .apply(&self.fc2)
    }
}

#[derive(Debug)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let norm1 = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm1"))?;
        let attn = Attention::new(
            cfg.hidden_size,
            cfg.num_attention_heads,
            cfg.qkv_bias,
            vb.pp("attn"),
        )?;
        let norm2 = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm2"))?;
        let mlp = Mlp::new(cfg, vb.pp("mlp"))?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// The timm ViT trunk plus the open_clip projection head.
#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    norm_pre: Option<LayerNorm>,
    blocks: Vec<Block>,
    norm: LayerNorm,
    fc_norm: Option<LayerNorm>,
    proj: Linear,
    global_pool: GlobalPool,
    num_prefix_tokens: usize,
    span: tracing::Span,
}

impl VisionTransformer {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("trunk");
        let patch_embed = PatchEmbed::new(cfg, vb_t.pp("patch_embed"))?;
        let cls_token = vb_t.get((1, 1, cfg.hidden_size), "cls_token")?;
        let pos_embed = vb_t.get(
            (
                1,
                patch_embed.num_patches + cfg.num_prefix_tokens,
                cfg.hidden_size,
            ),
            "pos_embed",
        )?;
        let norm_pre = if cfg.pre_norm {
            Some(layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb_t.pp("norm_pre"),
            )?)
        } else {
            None
        };
        let vb_b = vb_t.pp("blocks");
        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| Block::new(cfg, vb_b.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb_t.pp("norm"))?;
        let fc_norm = if cfg.use_fc_norm {
            Some(layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb_t.pp("fc_norm"),
            )?)
        } else {
            None
        };
        let proj = linear_b(
            cfg.hidden_size,
            cfg.projection_dim,
            false,
            vb.pp("head").pp("proj"),
        )?;
        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            norm_pre,
            blocks,
            norm,
            fc_norm,
            proj,
            global_pool: cfg.global_pool,
            num_prefix_tokens: cfg.num_prefix_tokens,
            span: tracing::span!(tracing::Level::TRACE, "vit"),
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn prepare_tokens(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.patch_embed.forward(xs)?;
        let (b, _n, c) = xs.dims3()?;
        let cls_token = self.cls_token.expand((b, 1, c))?;
        let xs = Tensor::cat(&[&cls_token, &xs], 1)?;
        let xs = xs.broadcast_add(&self.pos_embed)?;
        match &self.norm_pre {
            Some(norm) => norm.forward(&xs),
            None => Ok(xs),
        }
    }

    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        match self.global_pool {
            GlobalPool::Token => xs.i((.., 0)),
            GlobalPool::Avg => xs.i((.., self.num_prefix_tokens..))?.mean(1),
        }
    }

    /// Runs the trunk, returning the pooled and projected image embedding
    /// together with the output of every transformer block in order.
    pub fn forward_with_hidden_states(&self, xs: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let mut xs = self.prepare_tokens(xs)?;
        let mut hidden_states = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            xs = block.forward(&xs)?;
            hidden_states.push(xs.clone());
        }
        let xs = self.norm.forward(&xs)?;
        let pooled = self.pool(&xs)?;
        let pooled = match &self.fc_norm {
            Some(norm) => norm.forward(&pooled)?,
            None => pooled,
        };
        let pooled = self.proj.forward(&pooled)?;
        Ok((pooled, hidden_states))
    }
}

impl Module for VisionTransformer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (pooled, _hidden_states) = self.forward_with_hidden_states(xs)?;
        Ok(pooled)
    }
}
