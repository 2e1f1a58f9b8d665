//! Text-conditioned biomedical image segmentation on top of candle.
//!
//! The crate composes a BiomedCLIP dual encoder with a CLIPSeg decoder,
//! see [`models::biomedclipseg::BiomedClipSeg`] for the main entry point.
pub mod models;
