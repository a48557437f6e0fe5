use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use daclip_core::Options;
use daclip_ml::{DeviceName, Restorer, device, device_name, log_filter, restoration};
use once_cell::sync::Lazy;
use tokio::{net::TcpListener, sync::Semaphore};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::server;

fn resolve_app_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|path| path.join("DA-CLIP"))
        .unwrap_or(PathBuf::from("."))
}

static APP_ROOT: Lazy<PathBuf> = Lazy::new(resolve_app_root);
static MODEL_ROOT: Lazy<PathBuf> = Lazy::new(|| APP_ROOT.join("models"));

#[derive(Clone)]
pub struct AppResources {
    pub restorer: Arc<Restorer>,
    pub ml_device: DeviceName,
    pub examples: PathBuf,
    /// One restoration runs at a time, later requests wait their turn.
    pub queue: Arc<Semaphore>,
}

impl AppResources {
    pub fn new(restorer: Restorer, ml_device: DeviceName, examples: PathBuf) -> Self {
        Self {
            restorer: Arc::new(restorer),
            ml_device,
            examples,
            queue: Arc::new(Semaphore::new(1)),
        }
    }
}

#[derive(Parser)]
#[command(version = crate::version::APP_VERSION, about)]
struct Cli {
    #[arg(
        long = "opt",
        value_name = "FILE",
        help = "Path to the option file",
        default_value = "options/test.toml"
    )]
    options: PathBuf,
    #[arg(
        long,
        help = "Force using CPU even if GPU is available",
        default_value_t = false
    )]
    cpu: bool,
    #[arg(long, help = "Address to bind the HTTP server to", default_value = "127.0.0.1")]
    host: String,
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "Port to bind the HTTP server to",
        default_value_t = 7860
    )]
    port: u16,
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory with example images offered by the web page",
        default_value = "da-clip-examples"
    )]
    examples: PathBuf,
    #[arg(
        short,
        long,
        help = "Download model weights and exit",
        default_value_t = false
    )]
    download: bool,
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Restore this image and exit instead of serving",
        requires = "output"
    )]
    input: Option<PathBuf>,
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Where to write the restored image",
        requires = "input"
    )]
    output: Option<PathBuf>,
}

fn initialize() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(log_filter())
        .init();

    // hook model cache dir
    daclip_ml::set_cache_dir(MODEL_ROOT.to_path_buf())?;

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {info}");
    }));

    Ok(())
}

async fn prefetch(options: &Options) -> Result<()> {
    let (unet, daclip) = restoration::prefetch(options).await?;
    tracing::info!(unet = %unet.display(), daclip = %daclip.display(), "model weights are ready");
    Ok(())
}

fn restore_file(restorer: &Restorer, input: &Path, output: &Path) -> Result<()> {
    let image = image::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let restored = restorer.restore(&image)?;
    restored
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(output = %output.display(), "saved restored image");
    Ok(())
}

pub async fn run() -> Result<()> {
    let Cli {
        options,
        cpu,
        host,
        port,
        examples,
        download,
        input,
        output,
    } = Cli::parse();

    initialize()?;

    let options = Options::load(&options)?;
    tracing::info!(name = %options.name, sampler = %options.sde.sampler, "loaded options");

    if download {
        prefetch(&options).await?;
        return Ok(());
    }

    let ml_device = device_name(cpu);
    let restorer = Restorer::load(&options, device(cpu)?)
        .await
        .context("Failed to initialize restoration models")?;
    tracing::info!(device = %ml_device, "models loaded");

    if let (Some(input), Some(output)) = (input, output) {
        return restore_file(&restorer, &input, &output);
    }

    let resources = AppResources::new(restorer, ml_device, examples);
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;

    tokio::select! {
        result = server::serve(listener, resources) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}
