use std::{io::Cursor, net::SocketAddr, path::Path};

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use daclip::{app::AppResources, server};
use daclip_core::options::{SamplerMode, Schedule, UNetSetting};
use daclip_ml::{
    DeviceName, Restorer,
    daclip::{DaClip, VisionConfig},
    sde::IrSde,
    unet::ConditionalUNet,
};
use image::{GenericImageView, ImageFormat, Rgb, RgbImage};
use reqwest::{StatusCode, header::CONTENT_TYPE};
use tokio::net::TcpListener;

const BOUNDARY: &str = "daclip-test-boundary";

fn tiny_restorer() -> Result<Restorer> {
    let device = Device::Cpu;
    let setting = UNetSetting {
        nf: 32,
        ch_mult: vec![1, 2],
        context_dim: 16,
        ..UNetSetting::default()
    };
    let config = VisionConfig {
        image_size: 64,
        patch_size: 32,
        width: 32,
        layers: 1,
        heads: 4,
        mlp_ratio: 4.0,
        output_dim: 16,
        layer_norm_eps: 1e-5,
    };
    let unet = ConditionalUNet::new(&setting, VarBuilder::zeros(DType::F32, &device))?;
    let daclip = DaClip::new(config, VarBuilder::zeros(DType::F32, &device))?;
    let sde = IrSde::new(0.05, 3, Schedule::Cosine, 0.005)?;
    Ok(Restorer::from_parts(unet, daclip, sde, SamplerMode::Posterior, device))
}

fn png_bytes(width: u32, height: u32) -> Result<Vec<u8>> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 64]));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

fn multipart_body(field: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.png\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn spawn_server(examples: &Path) -> Result<SocketAddr> {
    let resources = AppResources::new(tiny_restorer()?, DeviceName::Cpu, examples.to_path_buf());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(server::serve(listener, resources));
    Ok(addr)
}

async fn post_restore(addr: SocketAddr, body: Vec<u8>) -> Result<reqwest::Response> {
    Ok(reqwest::Client::new()
        .post(format!("http://{addr}/api/restore"))
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(body)
        .send()
        .await?)
}

#[tokio::test]
async fn serves_page_and_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path()).await?;

    let page = reqwest::get(format!("http://{addr}/")).await?.text().await?;
    assert!(page.contains("Image Restoration with DA-CLIP"));

    let version: String = reqwest::get(format!("http://{addr}/api/app_version"))
        .await?
        .json()
        .await?;
    assert_eq!(version, daclip::version::current());

    let device: String = reqwest::get(format!("http://{addr}/api/device"))
        .await?
        .json()
        .await?;
    assert_eq!(device, "CPU");
    Ok(())
}

#[tokio::test]
async fn examples_are_listed_and_confined() -> Result<()> {
    let root = tempfile::tempdir()?;
    let examples = root.path().join("examples");
    std::fs::create_dir(&examples)?;
    std::fs::write(examples.join("da-clip-example-1.png"), png_bytes(4, 4)?)?;
    std::fs::write(root.path().join("secret.png"), b"do not serve")?;
    let addr = spawn_server(&examples).await?;

    let names: Vec<String> = reqwest::get(format!("http://{addr}/api/examples"))
        .await?
        .json()
        .await?;
    assert_eq!(names, vec!["da-clip-example-1.png"]);

    let res = reqwest::get(format!("http://{addr}/api/examples/da-clip-example-1.png")).await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[CONTENT_TYPE], "image/png");

    let res = reqwest::get(format!("http://{addr}/api/examples/..%2Fsecret.png")).await?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn restores_uploaded_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path()).await?;

    let res = post_restore(addr, multipart_body("image", &png_bytes(20, 12)?)).await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[CONTENT_TYPE], "image/png");

    let restored = image::load_from_memory(&res.bytes().await?)?;
    assert_eq!(restored.dimensions(), (20, 12));
    Ok(())
}

#[tokio::test]
async fn rejects_bad_uploads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path()).await?;

    let res = post_restore(addr, multipart_body("picture", &png_bytes(8, 8)?)).await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = post_restore(addr, multipart_body("image", b"not an image")).await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await?;
    assert!(body["error"].as_str().is_some());
    Ok(())
}
