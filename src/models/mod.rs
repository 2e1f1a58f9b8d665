//! Model implementations.
//!
//! - [`biomedclip`]: the BiomedCLIP dual encoder (timm ViT vision tower,
//!   PubMedBERT text tower) with pooled-embedding surfaces.
//! - [`clipseg`]: the CLIPSeg lightweight segmentation decoder.
//! - [`biomedclipseg`]: the composite pipeline fusing both into a
//!   text-conditioned segmentation model.
pub mod biomedclip;
pub mod biomedclipseg;
pub mod clipseg;
pub mod with_tracing;
