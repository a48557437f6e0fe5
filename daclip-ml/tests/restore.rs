use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use daclip_core::Options;
use daclip_core::options::{SamplerMode, Schedule, UNetSetting};
use daclip_ml::Restorer;
use daclip_ml::daclip::{DaClip, VisionConfig};
use daclip_ml::sde::IrSde;
use daclip_ml::unet::ConditionalUNet;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

fn tiny_restorer(sampler: SamplerMode) -> Result<Restorer> {
    let device = Device::Cpu;
    let setting = UNetSetting {
        in_nc: 3,
        out_nc: 3,
        nf: 32,
        ch_mult: vec![1, 2],
        context_dim: 16,
        use_degra_context: true,
        use_image_context: true,
    };
    let config = VisionConfig {
        image_size: 64,
        patch_size: 32,
        width: 32,
        layers: 2,
        heads: 4,
        mlp_ratio: 4.0,
        output_dim: 16,
        layer_norm_eps: 1e-5,
    };

    let unet = ConditionalUNet::new(&setting, VarBuilder::zeros(DType::F32, &device))?;
    let daclip = DaClip::new(config, VarBuilder::zeros(DType::F32, &device))?;
    let sde = IrSde::new(0.05, 4, Schedule::Cosine, 0.005)?;
    Ok(Restorer::from_parts(unet, daclip, sde, sampler, device))
}

#[test]
fn restored_image_keeps_dimensions() -> Result<()> {
    let restorer = tiny_restorer(SamplerMode::Posterior)?;
    let image = DynamicImage::ImageRgb8(RgbImage::from_fn(37, 21, |x, y| {
        Rgb([(x * 6) as u8, (y * 12) as u8, 128])
    }));

    let output = restorer.restore(&image)?;
    assert_eq!(output.dimensions(), image.dimensions());
    Ok(())
}

#[test]
fn sde_sampler_handles_grayscale_input() -> Result<()> {
    let restorer = tiny_restorer(SamplerMode::Sde)?;
    let image = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(16, 16, image::Luma([90])));

    let output = restorer.restore(&image)?;
    assert_eq!(output.dimensions(), (16, 16));
    Ok(())
}

#[test]
fn image_smaller_than_padding_is_an_error() -> Result<()> {
    let restorer = tiny_restorer(SamplerMode::Posterior)?;
    let image = DynamicImage::ImageRgb8(RgbImage::new(1, 1));
    assert!(restorer.restore(&image).is_err());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn restores_fixture_with_released_weights() -> Result<()> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");
    let options = Options::load(&root.join("options/test.toml"))?;
    let restorer = Restorer::load(&options, daclip_ml::device(false)?).await?;

    let image = image::open(root.join("da-clip-examples/da-clip-example-1.png"))?;
    let output = restorer.restore(&image)?;
    assert_eq!(output.dimensions(), image.dimensions());
    Ok(())
}
