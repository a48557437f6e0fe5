//! DA-CLIP image encoder.
//!
//! A frozen CLIP vision tower plus a trainable copy of it (the controller).
//! The controller predicts a degradation embedding and, through zero
//! initialised projections, steers the frozen tower towards a content
//! embedding of the clean image.

mod vit;

use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use tracing::instrument;

use crate::loading::load_var_builder;

pub use vit::{VisionConfig, VisionTransformer};

/// Tensor present in every DA-CLIP checkpoint.
const PROBE_TENSOR: &str = "clip.visual.conv1.weight";

/// Embeddings produced for one batch of images.
#[derive(Debug, Clone)]
pub struct ImageEmbeddings {
    /// Content embedding of the (restored) image, `[B, output_dim]`.
    pub image: Tensor,
    /// Degradation embedding, `[B, output_dim]`.
    pub degradation: Tensor,
}

pub struct DaClip {
    visual: VisionTransformer,
    visual_control: VisionTransformer,
    config: VisionConfig,
}

impl DaClip {
    pub fn new(config: VisionConfig, vb: VarBuilder) -> Result<Self> {
        let visual = VisionTransformer::new(&config, vb.pp("clip").pp("visual"), false)?;
        let visual_control = VisionTransformer::new(&config, vb.pp("visual_control"), true)?;
        Ok(Self {
            visual,
            visual_control,
            config,
        })
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let vb = load_var_builder(path, device, PROBE_TENSOR)?;
        Self::new(VisionConfig::vit_b_32(), vb)
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// Encode normalized `[B, 3, S, S]` pixels into content and degradation
    /// embeddings.
    #[instrument(level = "debug", skip_all)]
    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<ImageEmbeddings> {
        let (degradation, hiddens) = self.visual_control.forward_with_hiddens(pixel_values)?;
        let image = self.visual.forward(pixel_values, Some(hiddens))?;
        Ok(ImageEmbeddings { image, degradation })
    }

    /// Plain CLIP embedding without the controller.
    pub fn encode_image_uncontrolled(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.visual.forward(pixel_values, None)
    }
}
