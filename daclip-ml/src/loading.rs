use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, pickle::PthTensors};
use candle_nn::VarBuilder;

/// Prefix `torch.nn.DataParallel` puts in front of every parameter name.
const DATA_PARALLEL_PREFIX: &str = "module";

/// Open a weight file as a [`VarBuilder`].
///
/// `.safetensors` files are memory mapped. PyTorch pickles (`.pt`, `.pth`,
/// `.bin`) are read in place, looking inside a `state_dict` entry first.
/// `probe` names a tensor the network is known to have; when it is only
/// found under a `module.` prefix, the returned builder is rooted there.
pub fn load_var_builder(path: &Path, device: &Device, probe: &str) -> Result<VarBuilder<'static>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let vb = match extension.as_str() {
        "safetensors" => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)
                .with_context(|| format!("failed to map {}", path.display()))?
        },
        "pt" | "pth" | "bin" | "ckpt" => {
            let tensors = PthTensors::new(path, Some("state_dict"))
                .or_else(|_| PthTensors::new(path, None))
                .with_context(|| format!("failed to read {}", path.display()))?;
            VarBuilder::from_backend(Box::new(tensors), DType::F32, device.clone())
        }
        other => bail!(
            "unsupported weight format {other:?} for {}, expected safetensors or a PyTorch checkpoint",
            path.display()
        ),
    };

    Ok(strip_data_parallel(vb, probe))
}

pub(crate) fn strip_data_parallel(vb: VarBuilder<'static>, probe: &str) -> VarBuilder<'static> {
    if !vb.contains_tensor(probe)
        && vb.contains_tensor(&format!("{DATA_PARALLEL_PREFIX}.{probe}"))
    {
        tracing::debug!("weights carry a {DATA_PARALLEL_PREFIX}. prefix, stripping it");
        vb.pp(DATA_PARALLEL_PREFIX)
    } else {
        vb
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Tensor;

    use super::*;

    #[test]
    fn strips_data_parallel_prefix() -> Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "module.init_conv.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &device)?,
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let vb = strip_data_parallel(vb, "init_conv.weight");
        assert!(vb.contains_tensor("init_conv.weight"));
        Ok(())
    }

    #[test]
    fn keeps_unprefixed_weights() -> Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "init_conv.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &device)?,
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let vb = strip_data_parallel(vb, "init_conv.weight");
        assert_eq!(vb.prefix(), "");
        Ok(())
    }

    #[test]
    fn rejects_unknown_formats() -> Result<()> {
        let file = tempfile::Builder::new().suffix(".onnx").tempfile()?;
        assert!(load_var_builder(file.path(), &Device::Cpu, "x").is_err());
        Ok(())
    }
}
