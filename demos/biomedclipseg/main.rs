use anyhow::{anyhow, Error as E, Result};
use clap::Parser;

use candle::{DType, Device, Tensor};
use candle_nn::ops::sigmoid;

use biomedclipseg::models::biomedclipseg::{BiomedClipSeg, BiomedClipSegConfig};
use tokenizers::Tokenizer;

#[derive(Parser)]
struct Args {
    /// Safetensors conversion of the open_clip BiomedCLIP checkpoint.
    #[arg(long)]
    encoder_weights: String,

    /// Safetensors file with the pretrained CLIPSeg decoder weights,
    /// fetched from the hub when not set.
    #[arg(long)]
    decoder_weights: Option<String>,

    #[arg(long)]
    tokenizer: Option<String>,

    #[arg(long)]
    image: String,

    /// Free-text description of the structure to segment.
    #[arg(long, default_value = "tumor")]
    prompt: String,

    #[arg(long, default_value = "mask.png")]
    output: String,

    #[arg(long)]
    cpu: bool,

    /// Use a randomly initialized decoder instead of pretrained weights.
    #[arg(long)]
    rand_init_decoder: bool,

    #[arg(long)]
    tracing: bool,
}

fn load_image<P: AsRef<std::path::Path>>(path: P, image_size: usize, device: &Device) -> Result<Tensor> {
    let img = image::ImageReader::open(path)?.decode()?;
    let img = img
        .resize_to_fill(
            image_size as u32,
            image_size as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data = Tensor::from_vec(img.into_raw(), (image_size, image_size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&[0.48145466f32, 0.4578275, 0.40821073], &Device::Cpu)?
        .reshape((3, 1, 1))?;
    let std = Tensor::new(&[0.26862954f32, 0.26130258, 0.27577711], &Device::Cpu)?
        .reshape((3, 1, 1))?;
    let data = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(data.unsqueeze(0)?.to_device(device)?)
}

pub fn main() -> Result<()> {
    let args = Args::parse();
    if args.tracing {
        tracing_subscriber::fmt::init();
    }
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    let mut config = BiomedClipSegConfig::biomedclip_vit_base_rd64();
    config.rand_init_decoder = args.rand_init_decoder;

    let decoder_weights = match (args.decoder_weights, args.rand_init_decoder) {
        (_, true) => None,
        (Some(weights), false) => Some(std::path::PathBuf::from(weights)),
        (None, false) => {
            let api = hf_hub::api::sync::Api::new()?;
            Some(
                api.model("CIDAS/clipseg-rd64-refined".to_string())
                    .get("model.safetensors")?,
            )
        }
    };
    let model = BiomedClipSeg::load(
        &config,
        std::path::PathBuf::from(&args.encoder_weights),
        decoder_weights,
        DType::F32,
        &device,
    )?;

    let tokenizer_file = match args.tokenizer {
        Some(file) => file.into(),
        None => {
            let api = hf_hub::api::sync::Api::new()?;
            api.model("microsoft/BiomedCLIP-PubMedBERT_256-vit_base_patch16_224".to_string())
                .get("tokenizer.json")?
        }
    };
    let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(E::msg)?;
    let encoding = tokenizer.encode(args.prompt.as_str(), true).map_err(E::msg)?;
    let input_ids = Tensor::new(encoding.get_ids().to_vec(), &device)?.unsqueeze(0)?;
    let attention_mask = Tensor::new(encoding.get_attention_mask().to_vec(), &device)?.unsqueeze(0)?;

    let pixel_values = load_image(&args.image, 224, &device)?;
    let logits = model.forward(&pixel_values, &input_ids, Some(&attention_mask))?;
    let probs = sigmoid(&logits.squeeze(0)?.squeeze(0)?)?;
    let (height, width) = probs.dims2()?;
    let pixels = (probs * 255.)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let mask = image::GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("mask buffer has the wrong size"))?;
    mask.save(&args.output)?;
    println!(
        "wrote a {width}x{height} mask for \"{}\" to {}",
        args.prompt, args.output
    );
    Ok(())
}
