//! Text tower of BiomedCLIP: a BERT encoder (PubMedBERT) pooled into a
//! single prompt embedding and projected into the shared embedding space.
use candle::{DType, IndexOp, Result, Tensor};
use candle_nn::{Module, VarBuilder};
use serde::Deserialize;

use super::super::with_tracing::{layer_norm, linear, Embedding, LayerNorm, Linear};

/// Strategy for collapsing the final hidden states into one prompt
/// embedding, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooler {
    /// Use the hidden state at a designated token position.
    Cls { cls_token_position: usize },
    /// Mask-weighted mean over the whole sequence.
    Mean,
}

impl Default for Pooler {
    fn default() -> Self {
        Self::Cls {
            cls_token_position: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: candle_nn::Activation,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    pub pad_token_id: usize,
    pub projection_dim: usize,
    #[serde(default)]
    pub pooler: Pooler,
}

impl Config {
    /// The text tower of BiomedCLIP-PubMedBERT_256-vit_base_patch16_224.
    pub fn pubmed_bert_base() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: candle_nn::Activation::Gelu,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
            projection_dim: 512,
            pooler: Pooler::Cls {
                cls_token_position: 0,
            },
        }
    }
}

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    span: tracing::Span,
}

impl BertEmbeddings {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let word_embeddings =
            Embedding::new(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?;
        let position_embeddings = Embedding::new(
            cfg.max_position_embeddings,
            cfg.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = Embedding::new(
            cfg.type_vocab_size,
            cfg.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let layer_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layer_norm,
            span: tracing::span!(tracing::Level::TRACE, "embeddings"),
        })
    }
}

impl Module for BertEmbeddings {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b, seq_len) = input_ids.dims2()?;
        let words = self.word_embeddings.forward(input_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        // All tokens belong to segment 0.
        let token_type_ids = Tensor::zeros(seq_len, DType::U32, input_ids.device())?;
        let token_types = self.token_type_embeddings.forward(&token_type_ids)?;
        let embeddings = words
            .broadcast_add(&positions)?
            .broadcast_add(&token_types)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_attention_heads: usize,
    attention_head_size: usize,
    span: tracing::Span,
}

impl BertSelfAttention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let attention_head_size = cfg.hidden_size / cfg.num_attention_heads;
        let all_head_size = cfg.num_attention_heads * attention_head_size;
        let query = linear(cfg.hidden_size, all_head_size, vb.pp("query"))?;
        let key = linear(cfg.hidden_size, all_head_size, vb.pp("key"))?;
        let value = linear(cfg.hidden_size, all_head_size, vb.pp("value"))?;
        Ok(Self {
            query,
            key,
            value,
            num_attention_heads: cfg.num_attention_heads,
            attention_head_size,
            span: tracing::span!(tracing::Level::TRACE, "self-attn"),
        })
    }

    fn transpose_for_scores(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;
        xs.reshape((
            b,
            seq_len,
            self.num_attention_heads,
            self.attention_head_size,
        ))?
        .transpose(1, 2)?
        .contiguous()
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let query = self.transpose_for_scores(&self.query.forward(hidden_states)?)?;
        let key = self.transpose_for_scores(&self.key.forward(hidden_states)?)?;
        let value = self.transpose_for_scores(&self.value.forward(hidden_states)?)?;

        let scores = query.matmul(&key.t()?)?;
        let scores = (scores / (self.attention_head_size as f64).sqrt())?;
        let scores = scores.broadcast_add(attention_mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = probs.matmul(&value)?;
        let context = context.transpose(1, 2)?.contiguous()?;
        context.flatten_from(candle::D::Minus2)
    }
}

struct BertSelfOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertSelfOutput {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let dense = linear(cfg.hidden_size, cfg.hidden_size, vb.pp("dense"))?;
        let layer_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self { dense, layer_norm })
    }

    fn forward(&self, hidden_states: &Tensor, input_tensor: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

struct BertAttention {
    self_attention: BertSelfAttention,
    self_output: BertSelfOutput,
}

impl BertAttention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let self_attention = BertSelfAttention::new(cfg, vb.pp("self"))?;
        let self_output = BertSelfOutput::new(cfg, vb.pp("output"))?;
        Ok(Self {
            self_attention,
            self_output,
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let attn_output = self.self_attention.forward(hidden_states, attention_mask)?;
        self.self_output.forward(&attn_output, hidden_states)
    }
}

struct BertIntermediate {
    dense: Linear,
    act: candle_nn::Activation,
}

impl BertIntermediate {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let dense = linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("dense"))?;
        Ok(Self {
            dense,
            act: cfg.hidden_act,
        })
    }
}

impl Module for BertIntermediate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.dense.forward(xs)?.apply(&self.act)
    }
}

struct BertOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertOutput {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let dense = linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("dense"))?;
        let layer_norm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self { dense, layer_norm })
    }

    fn forward(&self, hidden_states: &Tensor, input_tensor: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

struct BertLayer {
    attention: BertAttention,
    intermediate: BertIntermediate,
    output: BertOutput,
    span: tracing::Span,
}

impl BertLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let attention = BertAttention::new(cfg, vb.pp("attention"))?;
        let intermediate = BertIntermediate::new(cfg, vb.pp("intermediate"))?;
        let output = BertOutput::new(cfg, vb.pp("output"))?;
        Ok(Self {
            attention,
            intermediate,
            output,
            span: tracing::span!(tracing::Level::TRACE, "layer"),
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let attn_output = self.attention.forward(hidden_states, attention_mask)?;
        let intermediate = self.intermediate.forward(&attn_output)?;
        self.output.forward(&intermediate, &attn_output)
    }
}

fn get_extended_attention_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let extended = match attention_mask.rank() {
        3 => attention_mask.unsqueeze(1)?,
        2 => attention_mask.unsqueeze(1)?.unsqueeze(1)?,
        _ => candle::bail!("wrong shape for attention_mask"),
    };
    let extended = extended.to_dtype(dtype)?;
    let min_value = Tensor::new(f32::MIN, extended.device())?.to_dtype(dtype)?;
    (extended.ones_like()? - &extended)?.broadcast_mul(&min_value)
}

// Token-level output with one position removed, keeping batch and width.
fn mask_out_token(hidden_states: &Tensor, position: usize) -> Result<Tensor> {
    let seq_len = hidden_states.dim(1)?;
    if position == 0 {
        hidden_states.i((.., 1..))
    } else if position + 1 == seq_len {
        hidden_states.i((.., ..position))
    } else {
        let before = hidden_states.i((.., ..position))?;
        let after = hidden_states.i((.., position + 1..))?;
        Tensor::cat(&[&before, &after], 1)
    }
}

/// BERT encoder with pooling and projection into the shared embedding
/// space.
pub struct TextTransformer {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    proj: Linear,
    pooler: Pooler,
    pad_token_id: usize,
    span: tracing::Span,
}

impl TextTransformer {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("transformer");
        let embeddings = BertEmbeddings::new(cfg, vb_t.pp("embeddings"))?;
        let vb_l = vb_t.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| BertLayer::new(cfg, vb_l.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let proj = linear(cfg.hidden_size, cfg.projection_dim, vb.pp("proj"))?;
        Ok(Self {
            embeddings,
            layers,
            proj,
            pooler: cfg.pooler,
            pad_token_id: cfg.pad_token_id,
            span: tracing::span!(tracing::Level::TRACE, "text"),
        })
    }

    fn attention_mask(&self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        match mask {
            Some(mask) => Ok(mask.clone()),
            // Attend to real tokens only.
            None => input_ids.ne(self.pad_token_id as u32),
        }
    }

    fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut hidden_states = self.embeddings.forward(input_ids)?;
        let extended_mask = get_extended_attention_mask(attention_mask, hidden_states.dtype())?;
        let mut all_hidden_states = vec![hidden_states.clone()];
        for layer in self.layers.iter() {
            hidden_states = layer.forward(&hidden_states, &extended_mask)?;
            all_hidden_states.push(hidden_states.clone());
        }
        Ok((hidden_states, all_hidden_states))
    }

    fn pool(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        match self.pooler {
            Pooler::Cls { cls_token_position } => hidden_states.i((.., cls_token_position)),
            Pooler::Mean => {
                let mask = attention_mask
                    .to_dtype(hidden_states.dtype())?
                    .unsqueeze(2)?;
                let summed = hidden_states.broadcast_mul(&mask)?.sum(1)?;
                let counts = mask.sum(1)?;
                summed.broadcast_div(&counts)
            }
        }
    }

    /// The projected pooled prompt embedding, `(batch, projection_dim)`.
    ///
    /// When no attention mask is given, one is derived from the pad token
    /// id.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let attention_mask = self.attention_mask(input_ids, attention_mask)?;
        let (last_hidden, _) = self.encode(input_ids, &attention_mask)?;
        let pooled = self.pool(&last_hidden, &attention_mask)?;
        self.proj.forward(&pooled)
    }

    /// The projected pooled embedding together with the token-level hidden
    /// states. For a [`Pooler::Cls`] pooler the pooled position is masked
    /// out of the token-level output.
    pub fn forward_with_tokens(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let attention_mask = self.attention_mask(input_ids, attention_mask)?;
        let (last_hidden, _) = self.encode(input_ids, &attention_mask)?;
        let pooled = self.pool(&last_hidden, &attention_mask)?;
        let projected = self.proj.forward(&pooled)?;
        let tokens = match self.pooler {
            Pooler::Cls { cls_token_position } => {
                mask_out_token(&last_hidden, cls_token_position)?
            }
            Pooler::Mean => last_hidden,
        };
        Ok((projected, tokens))
    }

    /// The projected pooled embedding together with the full hidden-state
    /// list (embedding output first, then one entry per layer).
    pub fn forward_with_hidden_states(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let attention_mask = self.attention_mask(input_ids, attention_mask)?;
        let (last_hidden, all_hidden_states) = self.encode(input_ids, &attention_mask)?;
        let pooled = self.pool(&last_hidden, &attention_mask)?;
        let projected = self.proj.forward(&pooled)?;
        Ok((projected, all_hidden_states))
    }
}
