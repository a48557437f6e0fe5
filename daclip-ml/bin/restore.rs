use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use daclip_core::{Options, options::SamplerMode};
use daclip_ml::{Restorer, device, log_filter};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(author, version, about = "Restore a single degraded image with DA-CLIP + IR-SDE")]
struct Args {
    /// Path to the option file.
    #[arg(long = "opt", value_name = "FILE", default_value = "options/test.toml")]
    options: PathBuf,
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
    /// Override the sampler from the option file.
    #[arg(long)]
    sampler: Option<SamplerMode>,
    /// Force CPU even if GPU is available.
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(log_filter())
        .init();

    let args = Args::parse();
    let mut options = Options::load(&args.options)?;
    if let Some(sampler) = args.sampler {
        options.sde.sampler = sampler;
    }

    let device = device(args.cpu)?;
    let restorer = Restorer::load(&options, device).await?;
    let image = image::open(&args.input)?;

    let start = std::time::Instant::now();
    let output = restorer.restore(&image)?;
    println!("Restoration took: {:.2?}", start.elapsed());

    output.save(&args.output)?;

    Ok(())
}
