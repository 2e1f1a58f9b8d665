use candle::{DType, Device, Result, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap, SGD};

use biomedclipseg::models::biomedclip::{text_model, vision_model, BiomedClipConfig};
use biomedclipseg::models::biomedclipseg::{BiomedClipSeg, BiomedClipSegConfig};
use biomedclipseg::models::clipseg::{Decoder, DecoderConfig};

fn tiny_vision_config() -> vision_model::Config {
    vision_model::Config {
        image_size: 32,
        patch_size: 8,
        num_channels: 3,
        hidden_size: 16,
        num_hidden_layers: 4,
        num_attention_heads: 2,
        intermediate_size: 32,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-6,
        qkv_bias: true,
        projection_dim: 8,
        global_pool: vision_model::GlobalPool::Token,
        num_prefix_tokens: 1,
        pre_norm: false,
        use_fc_norm: false,
    }
}

fn tiny_text_config() -> text_model::Config {
    text_model::Config {
        vocab_size: 64,
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        hidden_act: candle_nn::Activation::Gelu,
        max_position_embeddings: 16,
        type_vocab_size: 2,
        layer_norm_eps: 1e-12,
        pad_token_id: 0,
        projection_dim: 8,
        pooler: text_model::Pooler::Cls {
            cls_token_position: 0,
        },
    }
}

fn tiny_decoder_config() -> DecoderConfig {
    DecoderConfig {
        hidden_size: 16,
        projection_dim: 8,
        reduce_dim: 8,
        extract_layers: vec![0, 1, 2],
        decoder_num_attention_heads: 2,
        decoder_intermediate_size: 16,
        conditional_layer: 0,
        patch_size: 8,
        use_complex_transposed_convolution: true,
    }
}

fn tiny_config() -> BiomedClipSegConfig {
    BiomedClipSegConfig {
        clip: BiomedClipConfig {
            vision: tiny_vision_config(),
            text: tiny_text_config(),
        },
        decoder: tiny_decoder_config(),
        freeze_encoder: true,
        freeze_decoder: false,
        rand_init_decoder: true,
    }
}

fn images(batch_size: usize, device: &Device) -> Result<Tensor> {
    Tensor::randn(0f32, 1f32, (batch_size, 3, 32, 32), device)
}

fn prompts(batch_size: usize, device: &Device) -> Result<Tensor> {
    let row: Vec<u32> = vec![2, 7, 13, 5, 9, 1, 3];
    let rows: Vec<Vec<u32>> = (0..batch_size).map(|_| row.clone()).collect();
    Tensor::new(rows, device)
}

#[test]
fn forward_returns_one_logit_map_per_image() -> Result<()> {
    let device = Device::Cpu;
    let model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    for batch_size in [1, 2] {
        let logits = model.forward(&images(batch_size, &device)?, &prompts(batch_size, &device)?, None)?;
        // 32px input, 8px patches, 2 + 2 transposed-conv upsampling.
        assert_eq!(logits.dims(), &[batch_size, 1, 16, 16]);
    }
    Ok(())
}

#[test]
fn forward_rejects_prompt_image_count_mismatch() -> Result<()> {
    let device = Device::Cpu;
    let model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    let err = model
        .forward(&images(2, &device)?, &prompts(1, &device)?, None)
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("as many prompt texts as there are query images"));
    Ok(())
}

#[test]
fn conditional_embeddings_are_separable() -> Result<()> {
    let device = Device::Cpu;
    let model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    let input_ids = prompts(2, &device)?;
    let mask = Tensor::ones((2, 7), DType::U32, &device)?;
    let cond = model.get_conditional_embeddings(2, &input_ids, Some(&mask))?;
    assert_eq!(cond.dims(), &[2, 8]);
    assert!(model.get_conditional_embeddings(3, &input_ids, Some(&mask)).is_err());
    Ok(())
}

#[test]
fn vision_tower_captures_every_block_output() -> Result<()> {
    let device = Device::Cpu;
    let model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    let (pooled, hidden_states) = model
        .clip()
        .visual
        .forward_with_hidden_states(&images(2, &device)?)?;
    assert_eq!(pooled.dims(), &[2, 8]);
    assert_eq!(hidden_states.len(), model.clip().visual.num_blocks());
    for hidden_state in hidden_states.iter() {
        // 16 patches + 1 class token.
        assert_eq!(hidden_state.dims(), &[2, 17, 16]);
    }
    Ok(())
}

#[test]
fn vision_pooling_mode_changes_values_not_shapes() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let token_cfg = tiny_vision_config();
    let avg_cfg = vision_model::Config {
        global_pool: vision_model::GlobalPool::Avg,
        ..tiny_vision_config()
    };
    // Same VarMap, so both towers share identical weights.
    let token_tower = vision_model::VisionTransformer::new(&token_cfg, vb.pp("visual"))?;
    let avg_tower = vision_model::VisionTransformer::new(&avg_cfg, vb.pp("visual"))?;
    let xs = images(2, &device)?;
    let (token_pooled, _) = token_tower.forward_with_hidden_states(&xs)?;
    let (avg_pooled, _) = avg_tower.forward_with_hidden_states(&xs)?;
    assert_eq!(token_pooled.dims(), avg_pooled.dims());
    let token_values = token_pooled.flatten_all()?.to_vec1::<f32>()?;
    let avg_values = avg_pooled.flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(token_values, avg_values);
    Ok(())
}

#[test]
fn text_pooler_changes_values_not_shapes() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let cls_cfg = tiny_text_config();
    let mean_cfg = text_model::Config {
        pooler: text_model::Pooler::Mean,
        ..tiny_text_config()
    };
    let cls_tower = text_model::TextTransformer::new(&cls_cfg, vb.pp("text"))?;
    let mean_tower = text_model::TextTransformer::new(&mean_cfg, vb.pp("text"))?;
    let input_ids = prompts(2, &device)?;
    let cls_pooled = cls_tower.forward(&input_ids, None)?;
    let mean_pooled = mean_tower.forward(&input_ids, None)?;
    assert_eq!(cls_pooled.dims(), mean_pooled.dims());
    let cls_values = cls_pooled.flatten_all()?.to_vec1::<f32>()?;
    let mean_values = mean_pooled.flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(cls_values, mean_values);
    Ok(())
}

#[test]
fn cls_pooler_masks_its_token_out_of_the_token_output() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let cls_tower = text_model::TextTransformer::new(&tiny_text_config(), vb.pp("text"))?;
    let mean_cfg = text_model::Config {
        pooler: text_model::Pooler::Mean,
        ..tiny_text_config()
    };
    let mean_tower = text_model::TextTransformer::new(&mean_cfg, vb.pp("text"))?;
    let input_ids = prompts(2, &device)?;
    let (_, cls_tokens) = cls_tower.forward_with_tokens(&input_ids, None)?;
    let (_, mean_tokens) = mean_tower.forward_with_tokens(&input_ids, None)?;
    assert_eq!(cls_tokens.dims(), &[2, 6, 16]);
    assert_eq!(mean_tokens.dims(), &[2, 7, 16]);
    Ok(())
}

#[test]
fn decoder_rejects_wrong_stage_count() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let decoder = Decoder::new(&tiny_decoder_config(), vb.pp("decoder"))?;
    assert_eq!(decoder.num_stages(), 3);
    let activation = Tensor::randn(0f32, 1f32, (1, 17, 16), &device)?;
    let cond = Tensor::randn(0f32, 1f32, (1, 8), &device)?;
    let err = decoder
        .forward(&[activation.clone(), activation], &cond)
        .unwrap_err();
    assert!(err.to_string().contains("decoder stages"));
    Ok(())
}

#[test]
fn forward_is_idempotent() -> Result<()> {
    let device = Device::Cpu;
    let model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    let xs = images(2, &device)?;
    let input_ids = prompts(2, &device)?;
    let first = model
        .forward(&xs, &input_ids, None)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let second = model
        .forward(&xs, &input_ids, None)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn trainability_flags_cover_whole_subsystems() -> Result<()> {
    let device = Device::Cpu;
    let mut model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    let num_encoder = model.encoder_vars().len();
    let num_decoder = model.decoder_vars().len();
    assert!(num_encoder > 0);
    assert!(num_decoder > 0);
    // Defaults: frozen encoder, trainable decoder.
    assert!(!model.encoder_trainable());
    assert!(model.decoder_trainable());
    assert_eq!(model.trainable_vars().len(), num_decoder);
    model.set_encoder_trainable(true);
    assert_eq!(model.trainable_vars().len(), num_encoder + num_decoder);
    model.set_encoder_trainable(false);
    model.set_decoder_trainable(false);
    assert!(model.trainable_vars().is_empty());
    Ok(())
}

fn snapshot(vars: &[candle::Var]) -> Result<Vec<Vec<f32>>> {
    vars.iter()
        .map(|var| var.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect()
}

#[test]
fn sgd_step_updates_decoder_but_not_detached_encoder() -> Result<()> {
    let device = Device::Cpu;
    let mut model = BiomedClipSeg::new(&tiny_config(), DType::F32, &device)?;
    // Hand the encoder vars to the optimizer too: the always-detached
    // vision path must still leave them untouched.
    model.set_encoder_trainable(true);
    let encoder_vars = model.encoder_vars();
    let decoder_vars = model.decoder_vars();
    let encoder_before = snapshot(&encoder_vars)?;
    let decoder_before = snapshot(&decoder_vars)?;

    let logits = model.forward(&images(2, &device)?, &prompts(2, &device)?, None)?;
    let loss = logits.sqr()?.mean_all()?;
    let mut sgd = SGD::new(model.trainable_vars(), 0.1)?;
    sgd.backward_step(&loss)?;

    assert_eq!(snapshot(&encoder_vars)?, encoder_before);
    assert_ne!(snapshot(&decoder_vars)?, decoder_before);
    Ok(())
}
