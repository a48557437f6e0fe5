use std::time::Instant;

use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use daclip_core::Options;
use daclip_core::options::SamplerMode;
use image::{DynamicImage, RgbImage, imageops::FilterType};
use tracing::instrument;

use crate::daclip::DaClip;
use crate::sde::{Conditioning, IrSde};
use crate::unet::ConditionalUNet;

pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Blind image restoration: DA-CLIP reads the degradation off the input,
/// then the IR-SDE walks the degraded image back to a clean one.
pub struct Restorer {
    unet: ConditionalUNet,
    daclip: DaClip,
    sde: IrSde,
    sampler: SamplerMode,
    device: Device,
}

impl Restorer {
    pub async fn load(options: &Options, device: Device) -> Result<Self> {
        let (unet_path, daclip_path) = prefetch(options).await?;

        let unet = ConditionalUNet::load(&options.network_g.setting, &unet_path, &device)?;
        let daclip = DaClip::load(&daclip_path, &device)?;
        let sde = IrSde::from_options(&options.sde)?;

        if let Some(seed) = options.sde.seed {
            if let Err(err) = device.set_seed(seed) {
                tracing::warn!(%err, seed, "device does not support seeding, sampling stays random");
            }
        }

        Ok(Self::from_parts(unet, daclip, sde, options.sde.sampler, device))
    }

    pub fn from_parts(
        unet: ConditionalUNet,
        daclip: DaClip,
        sde: IrSde,
        sampler: SamplerMode,
        device: Device,
    ) -> Self {
        Self {
            unet,
            daclip,
            sde,
            sampler,
            device,
        }
    }

    #[instrument(level = "info", skip_all, fields(width = image.width(), height = image.height()))]
    pub fn restore(&self, image: &DynamicImage) -> Result<RgbImage> {
        let started = Instant::now();
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        ensure!(width > 0 && height > 0, "cannot restore an empty image");

        let lq = self.preprocess(&rgb)?;
        let pixels = clip_transform(&rgb, self.daclip.config().image_size, &self.device)?;
        let embeddings = self.daclip.encode_image(&pixels)?;
        let context = Conditioning {
            degradation: Some(embeddings.degradation),
            image: Some(embeddings.image),
        };

        let noisy = self.sde.noise_state(&lq)?;
        let output = self
            .sde
            .reverse(self.sampler, &self.unet, &noisy, &lq, &context)?;
        let restored = self.postprocess(&output)?;

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            sampler = %self.sampler,
            "restored image"
        );
        Ok(restored)
    }

    fn preprocess(&self, image: &RgbImage) -> Result<Tensor> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let tensor = (Tensor::from_vec(image.as_raw().clone(), (1, h, w, 3), &self.device)?
            .permute((0, 3, 1, 2))?
            .to_dtype(DType::F32)?
            * (1. / 255.))?;
        Ok(tensor)
    }

    fn postprocess(&self, output: &Tensor) -> Result<RgbImage> {
        let output = output.to_device(&Device::Cpu)?.squeeze(0)?;
        let (channels, height, width) = output.dims3()?;
        if channels != 3 {
            bail!("expected 3 channels in output, got {channels}");
        }
        let output = (output.clamp(0f32, 1f32)? * 255.)?
            .round()?
            .to_dtype(DType::U8)?;
        let hwc = output.permute((1, 2, 0))?; // HWC for ImageBuffer
        let raw: Vec<u8> = hwc.flatten_all()?.to_vec1()?;
        RgbImage::from_raw(width as u32, height as u32, raw)
            .ok_or_else(|| anyhow::anyhow!("failed to create image buffer from model output"))
    }
}

/// Resolve both weight files, downloading them if needed.
pub async fn prefetch(options: &Options) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    let unet = options.path.pretrain_model_g.resolve().await?;
    let daclip = options.path.daclip.resolve().await?;
    Ok((unet, daclip))
}

/// CLIP preprocessing: bicubic resize of the short side to `resolution`,
/// center crop, scale to [0, 1] and normalize. Returns `[1, 3, r, r]`.
pub fn clip_transform(image: &RgbImage, resolution: usize, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    ensure!(w > 0 && h > 0, "cannot preprocess an empty image");
    let size = resolution as u32;
    let (new_w, new_h) = if w <= h {
        (size, ((size as u64 * h as u64) / w as u64) as u32)
    } else {
        (((size as u64 * w as u64) / h as u64) as u32, size)
    };
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::CatmullRom);

    let left = ((new_w - size) as f64 / 2.0).round() as u32;
    let top = ((new_h - size) as f64 / 2.0).round() as u32;
    let cropped = image::imageops::crop_imm(&resized, left, top, size, size).to_image();

    let tensor = (Tensor::from_vec(cropped.into_raw(), (1, resolution, resolution, 3), device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?
        * (1. / 255.))?;
    let mean = Tensor::from_slice(&CLIP_MEAN, (1, 3, 1, 1), device)?;
    let std = Tensor::from_slice(&CLIP_STD, (1, 3, 1, 1), device)?;
    Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn clip_transform_shape_and_normalization() -> Result<()> {
        let image = RgbImage::from_pixel(300, 120, Rgb([255, 255, 255]));
        let tensor = clip_transform(&image, 224, &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 224, 224]);

        let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        let red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((values[0] - red).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn clip_transform_center_crops_long_side() -> Result<()> {
        // left third black, rest white: the crop must drop the black band
        let mut image = RgbImage::from_pixel(96, 32, Rgb([255, 255, 255]));
        for y in 0..32 {
            for x in 0..28 {
                image.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let tensor = clip_transform(&image, 32, &Device::Cpu)?;
        let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        let white = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        // last pixel of the first row is white
        assert!((values[31] - white).abs() < 1e-3);
        Ok(())
    }
}
