//! Conditional U-Net that predicts the noise of an IR-SDE state.

mod layers;

use std::path::Path;

use anyhow::{Result, ensure};
use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Linear, VarBuilder, linear, ops};
use daclip_core::options::UNetSetting;
use tracing::instrument;

use crate::loading::load_var_builder;
use crate::sde::NoisePredictor;
use layers::{PreNormAttention, ResBlock, Resample, conv2d, default_conv, reflect_pad_bottom_right, sinusoidal_embedding};

/// Tensor present in every checkpoint of this network.
const PROBE_TENSOR: &str = "init_conv.weight";

/// Encoder levels from this depth on attend to the image context.
const CROSS_ATTENTION_FROM_LEVEL: usize = 3;

struct Level {
    block1: ResBlock,
    block2: ResBlock,
    attn: PreNormAttention,
    resample: Resample,
}

/// Degradation-aware prompt: a softmax over a learned prompt vector,
/// weighted by the degradation embedding.
struct Prompt {
    prompt: Tensor,
    text_mlp_in: Linear,
    text_mlp_out: Linear,
    prompt_mlp: Linear,
}

impl Prompt {
    fn new(vb: VarBuilder, context_dim: usize, time_dim: usize) -> Result<Self> {
        Ok(Self {
            prompt: vb.get((1, time_dim), "prompt")?,
            text_mlp_in: linear(context_dim, time_dim, vb.pp("text_mlp.0"))?,
            text_mlp_out: linear(time_dim, time_dim, vb.pp("text_mlp.2"))?,
            prompt_mlp: linear(time_dim, time_dim, vb.pp("prompt_mlp"))?,
        })
    }

    fn forward(&self, degradation: &Tensor) -> candle_core::Result<Tensor> {
        let weights = self.text_mlp_in.forward(degradation)?.silu()?;
        let weights = self.text_mlp_out.forward(&weights)?;
        let weights = ops::softmax(&weights, 1)?;
        let embedding = weights.broadcast_mul(&self.prompt)?;
        self.prompt_mlp.forward(&embedding)
    }
}

pub struct ConditionalUNet {
    init_conv: Conv2d,
    time_mlp_in: Linear,
    time_mlp_out: Linear,
    prompt: Option<Prompt>,
    downs: Vec<Level>,
    ups: Vec<Level>,
    mid_block1: ResBlock,
    mid_attn: PreNormAttention,
    mid_block2: ResBlock,
    final_res_block: ResBlock,
    final_conv: Conv2d,
    nf: usize,
    depth: usize,
    in_nc: usize,
    use_image_context: bool,
}

impl ConditionalUNet {
    pub fn new(setting: &UNetSetting, vb: VarBuilder) -> Result<Self> {
        let UNetSetting {
            in_nc,
            out_nc,
            nf,
            ref ch_mult,
            context_dim,
            use_degra_context,
            use_image_context,
        } = *setting;
        ensure!(!ch_mult.is_empty(), "ch_mult must not be empty");

        let depth = ch_mult.len();
        let time_dim = nf * 4;
        let image_context = (use_image_context && context_dim > 0).then_some(context_dim);

        let prompt = if context_dim > 0 && use_degra_context {
            Some(Prompt::new(vb.clone(), context_dim, time_dim)?)
        } else {
            None
        };

        let mults: Vec<usize> = std::iter::once(1).chain(ch_mult.iter().copied()).collect();
        let mut downs = Vec::with_capacity(depth);
        let mut ups = Vec::with_capacity(depth);
        for i in 0..depth {
            let dim_in = nf * mults[i];
            let dim_out = nf * mults[i + 1];
            let attn_context = image_context.filter(|_| i >= CROSS_ATTENTION_FROM_LEVEL);
            let last = i + 1 == depth;

            let down = vb.pp(format!("downs.{i}"));
            downs.push(Level {
                block1: ResBlock::new(down.pp("0"), dim_in, dim_in, time_dim)?,
                block2: ResBlock::new(down.pp("1"), dim_in, dim_in, time_dim)?,
                attn: PreNormAttention::new(down.pp("2"), dim_in, attn_context)?,
                resample: if last {
                    Resample::same(down.pp("3"), dim_in, dim_out)?
                } else {
                    Resample::down(down.pp("3"), dim_in, dim_out)?
                },
            });

            // decoder levels are stored deepest first
            let up = vb.pp(format!("ups.{}", depth - 1 - i));
            ups.push(Level {
                block1: ResBlock::new(up.pp("0"), dim_out + dim_in, dim_out, time_dim)?,
                block2: ResBlock::new(up.pp("1"), dim_out + dim_in, dim_out, time_dim)?,
                attn: PreNormAttention::new(up.pp("2"), dim_out, attn_context)?,
                resample: if i == 0 {
                    Resample::same(up.pp("3"), dim_out, dim_in)?
                } else {
                    Resample::up(up.pp("3"), dim_out, dim_in)?
                },
            });
        }
        ups.reverse();

        let mid_dim = nf * mults[depth];
        Ok(Self {
            init_conv: default_conv(vb.pp("init_conv"), in_nc * 2, nf, 7)?,
            time_mlp_in: linear(nf, time_dim, vb.pp("time_mlp.1"))?,
            time_mlp_out: linear(time_dim, time_dim, vb.pp("time_mlp.3"))?,
            prompt,
            downs,
            ups,
            mid_block1: ResBlock::new(vb.pp("mid_block1"), mid_dim, mid_dim, time_dim)?,
            mid_attn: PreNormAttention::new(vb.pp("mid_attn"), mid_dim, image_context)?,
            mid_block2: ResBlock::new(vb.pp("mid_block2"), mid_dim, mid_dim, time_dim)?,
            final_res_block: ResBlock::new(vb.pp("final_res_block"), nf * 2, nf, time_dim)?,
            final_conv: conv2d(vb.pp("final_conv"), nf, out_nc, 3, 1, 1)?,
            nf,
            depth,
            in_nc,
            use_image_context: image_context.is_some(),
        })
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(setting: &UNetSetting, path: &Path, device: &Device) -> Result<Self> {
        let vb = load_var_builder(path, device, PROBE_TENSOR)?;
        Self::new(setting, vb)
    }

    /// Spatial multiple the input is padded to.
    pub fn size_multiple(&self) -> usize {
        1 << self.depth
    }

    /// Predict the noise in `xt` given the low-quality condition `cond` at
    /// timestep `time`.
    pub fn forward(
        &self,
        xt: &Tensor,
        cond: &Tensor,
        time: f64,
        degradation: Option<&Tensor>,
        image_context: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_b, c, h, w) = xt.dims4()?;
        ensure!(
            c == self.in_nc,
            "expected {} input channels, got {c}",
            self.in_nc
        );
        ensure!(
            cond.dims() == xt.dims(),
            "state {:?} and condition {:?} differ in shape",
            xt.dims(),
            cond.dims()
        );

        let xs = Tensor::cat(&[&(xt - cond)?, cond], 1)?;
        let multiple = self.size_multiple();
        let pad_h = (multiple - h % multiple) % multiple;
        let pad_w = (multiple - w % multiple) % multiple;
        let xs = reflect_pad_bottom_right(&xs, pad_h, pad_w)?;

        let mut xs = self.init_conv.forward(&xs)?;
        let init = xs.clone();

        let time = Tensor::new(&[time as f32], xt.device())?;
        let t = sinusoidal_embedding(&time, self.nf)?;
        let t = self.time_mlp_in.forward(&t)?.gelu_erf()?;
        let mut t = self.time_mlp_out.forward(&t)?;
        if let (Some(prompt), Some(degradation)) = (&self.prompt, degradation) {
            t = t.broadcast_add(&prompt.forward(degradation)?)?;
        }

        let context = match image_context {
            Some(context) if self.use_image_context => Some(context.unsqueeze(1)?),
            _ => None,
        };
        let context = context.as_ref();

        let mut skips = Vec::with_capacity(self.depth * 2);
        for level in &self.downs {
            xs = level.block1.forward(&xs, &t)?;
            skips.push(xs.clone());
            xs = level.block2.forward(&xs, &t)?;
            xs = level.attn.forward(&xs, context)?;
            skips.push(xs.clone());
            xs = level.resample.forward(&xs)?;
        }

        xs = self.mid_block1.forward(&xs, &t)?;
        xs = self.mid_attn.forward(&xs, context)?;
        xs = self.mid_block2.forward(&xs, &t)?;

        for level in &self.ups {
            let skip = skips.pop().ok_or_else(|| anyhow::anyhow!("missing skip connection"))?;
            xs = level.block1.forward(&Tensor::cat(&[&xs, &skip], 1)?, &t)?;
            let skip = skips.pop().ok_or_else(|| anyhow::anyhow!("missing skip connection"))?;
            xs = level.block2.forward(&Tensor::cat(&[&xs, &skip], 1)?, &t)?;
            xs = level.attn.forward(&xs, context)?;
            xs = level.resample.forward(&xs)?;
        }

        let xs = self
            .final_res_block
            .forward(&Tensor::cat(&[&xs, &init], 1)?, &t)?;
        let xs = self.final_conv.forward(&xs)?;
        Ok(xs.narrow(2, 0, h)?.narrow(3, 0, w)?.contiguous()?)
    }
}

impl NoisePredictor for ConditionalUNet {
    fn predict_noise(
        &self,
        xt: &Tensor,
        mu: &Tensor,
        t: usize,
        context: &crate::sde::Conditioning,
    ) -> Result<Tensor> {
        self.forward(
            xt,
            mu,
            t as f64,
            context.degradation.as_ref(),
            context.image.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use candle_nn::VarMap;

    use super::*;

    fn tiny_setting(use_image_context: bool) -> UNetSetting {
        UNetSetting {
            in_nc: 3,
            out_nc: 3,
            nf: 32,
            ch_mult: vec![1, 2],
            context_dim: 16,
            use_degra_context: true,
            use_image_context,
        }
    }

    #[test]
    fn output_matches_unpadded_input() -> Result<()> {
        let device = Device::Cpu;
        let model = ConditionalUNet::new(&tiny_setting(true), VarBuilder::zeros(DType::F32, &device))?;
        assert_eq!(model.size_multiple(), 4);

        let xt = Tensor::randn(0f32, 1f32, (1, 3, 18, 22), &device)?;
        let cond = Tensor::randn(0f32, 1f32, (1, 3, 18, 22), &device)?;
        let degradation = Tensor::randn(0f32, 1f32, (1, 16), &device)?;
        let image = Tensor::randn(0f32, 1f32, (1, 16), &device)?;

        let noise = model.forward(&xt, &cond, 7.0, Some(&degradation), Some(&image))?;
        assert_eq!(noise.dims(), &[1, 3, 18, 22]);
        Ok(())
    }

    #[test]
    fn runs_without_contexts() -> Result<()> {
        let device = Device::Cpu;
        let model = ConditionalUNet::new(&tiny_setting(false), VarBuilder::zeros(DType::F32, &device))?;
        let xt = Tensor::zeros((1, 3, 16, 16), DType::F32, &device)?;
        let noise = model.forward(&xt, &xt, 1.0, None, None)?;
        assert_eq!(noise.dims(), &[1, 3, 16, 16]);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_condition() -> Result<()> {
        let device = Device::Cpu;
        let model = ConditionalUNet::new(&tiny_setting(false), VarBuilder::zeros(DType::F32, &device))?;
        let xt = Tensor::zeros((1, 3, 16, 16), DType::F32, &device)?;
        let cond = Tensor::zeros((1, 3, 8, 16), DType::F32, &device)?;
        assert!(model.forward(&xt, &cond, 1.0, None, None).is_err());
        Ok(())
    }

    #[test]
    fn parameters_follow_checkpoint_names() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ConditionalUNet::new(&tiny_setting(true), vb)?;

        let data = varmap.data().lock().unwrap();
        for key in [
            "init_conv.weight",
            "time_mlp.1.weight",
            "time_mlp.3.weight",
            "prompt",
            "text_mlp.0.weight",
            "text_mlp.2.weight",
            "prompt_mlp.weight",
            "downs.0.0.mlp.1.weight",
            "downs.0.0.block1.proj.weight",
            "downs.0.2.fn.norm.g",
            "downs.0.2.fn.fn.to_qkv.weight",
            "downs.0.2.fn.fn.to_out.0.weight",
            "downs.0.2.fn.fn.to_out.1.g",
            "downs.0.3.weight",
            "downs.1.3.weight",
            "ups.0.0.res_conv.weight",
            "ups.0.3.1.weight",
            "ups.1.3.weight",
            "mid_attn.fn.norm.g",
            "mid_attn.fn.fn.norm.weight",
            "mid_attn.fn.fn.proj_in.weight",
            "mid_attn.fn.fn.transformer_blocks.0.attn2.to_k.weight",
            "mid_attn.fn.fn.proj_out.weight",
            "final_res_block.res_conv.weight",
            "final_conv.weight",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert!(!data.contains_key("ups.1.3.1.weight"));
        Ok(())
    }
}
