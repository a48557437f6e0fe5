pub mod daclip;
pub mod loading;
pub mod restoration;
pub mod sde;
pub mod unet;

use anyhow::Result;
use candle_core::{Device, utils::metal_is_available};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

pub use daclip_core::set_cache_dir;
pub use restoration::Restorer;

/// Name of the compute device being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceName {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceName::Cpu => write!(f, "CPU"),
            DeviceName::Cuda => write!(f, "CUDA"),
            DeviceName::Metal => write!(f, "Metal"),
        }
    }
}

/// Returns the name of the device that would be selected.
pub fn device_name(cpu: bool) -> DeviceName {
    if cpu {
        DeviceName::Cpu
    } else if cuda_is_available() {
        DeviceName::Cuda
    } else if metal_is_available() {
        DeviceName::Metal
    } else {
        DeviceName::Cpu
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    match device_name(cpu) {
        DeviceName::Cuda => Ok(Device::new_cuda(0)?),
        DeviceName::Metal => Ok(Device::new_metal(0)?),
        DeviceName::Cpu => {
            if !cpu {
                tracing::info!("CUDA and Metal are not available, using CPU device");
            }
            Ok(Device::Cpu)
        }
    }
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && (unsafe {
            libloading::Library::new(if cfg!(target_os = "windows") {
                "nvcuda.dll"
            } else {
                "libcuda.so"
            })
            .is_ok()
        })
}

/// `RUST_LOG` directives on top of an `info` default.
pub fn log_filter() -> EnvFilter {
    log_filter_from(&std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default())
}

fn log_filter_from(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}
