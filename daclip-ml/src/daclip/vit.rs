use anyhow::{Result, ensure};
use candle_core::{D, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder, conv2d_no_bias, layer_norm, linear};

/// Shape of a CLIP vision tower.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
    pub mlp_ratio: f64,
    pub output_dim: usize,
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    /// ViT-B/32, the tower DA-CLIP is released with.
    pub fn vit_b_32() -> Self {
        Self {
            image_size: 224,
            patch_size: 32,
            width: 768,
            layers: 12,
            heads: 12,
            mlp_ratio: 4.0,
            output_dim: 512,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    fn mlp_width(&self) -> usize {
        (self.width as f64 * self.mlp_ratio) as usize
    }
}

/// `nn.MultiheadAttention` with packed input projection.
struct Attention {
    in_proj: Linear,
    out_proj: Linear,
    heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let width = cfg.width;
        ensure!(
            width % cfg.heads == 0,
            "width {width} is not divisible by {} heads",
            cfg.heads
        );
        let in_proj = Linear::new(
            vb.get((3 * width, width), "in_proj_weight")?,
            Some(vb.get(3 * width, "in_proj_bias")?),
        );
        let out_proj = linear(width, width, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj,
            out_proj,
            heads: cfg.heads,
            head_dim: width / cfg.heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, n, width) = xs.dims3()?;
        let qkv = self.in_proj.forward(xs)?;
        let qkv = qkv.chunk(3, D::Minus1)?;
        let split = |t: &Tensor| {
            t.reshape((b, n, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(&qkv[0])?;
        let k = split(&qkv[1])?;
        let v = split(&qkv[2])?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, width))?;
        self.out_proj.forward(&out)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: linear(cfg.width, cfg.mlp_width(), vb.pp("c_fc"))?,
            c_proj: linear(cfg.mlp_width(), cfg.width, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu_erf()?)
    }
}

struct ResidualAttentionBlock {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl ResidualAttentionBlock {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for ResidualAttentionBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.ln_2.forward(&xs)?)?
    }
}

/// Stack of residual blocks. The controller copy additionally owns one
/// zero-initialised projection per block that turns its activations into
/// control signals for the base tower.
struct Transformer {
    resblocks: Vec<ResidualAttentionBlock>,
    zero_modules: Option<Vec<Linear>>,
}

impl Transformer {
    fn new(cfg: &VisionConfig, vb: VarBuilder, control: bool) -> Result<Self> {
        // the controller wraps the copied stack, so its blocks sit one level deeper
        // than its zero projections
        let blocks_vb = if control {
            vb.pp("transformer")
        } else {
            vb.clone()
        };
        let resblocks = (0..cfg.layers)
            .map(|i| ResidualAttentionBlock::new(cfg, blocks_vb.pp(format!("resblocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let zero_modules = if control {
            Some(
                (0..cfg.layers)
                    .map(|i| linear(cfg.width, cfg.width, vb.pp(format!("zero_modules.{i}"))))
                    .collect::<candle_core::Result<Vec<_>>>()?,
            )
        } else {
            None
        };
        Ok(Self {
            resblocks,
            zero_modules,
        })
    }

    /// Runs the blocks, adding one control hidden after each block. Hiddens
    /// are consumed from the back, so the deepest controller block feeds the
    /// first base block.
    fn forward(&self, xs: &Tensor, mut control: Option<Vec<Tensor>>) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.resblocks {
            xs = block.forward(&xs)?;
            if let Some(hidden) = control.as_mut().and_then(Vec::pop) {
                xs = (xs + hidden)?;
            }
        }
        Ok(xs)
    }

    fn forward_with_hiddens(&self, xs: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let zero_modules = self
            .zero_modules
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("transformer was built without control projections"))?;
        let mut xs = xs.clone();
        let mut hiddens = Vec::with_capacity(zero_modules.len());
        for (block, zero) in self.resblocks.iter().zip(zero_modules) {
            xs = block.forward(&xs)?;
            hiddens.push(zero.forward(&xs)?);
        }
        Ok((xs, hiddens))
    }
}

pub struct VisionTransformer {
    conv1: Conv2d,
    class_embedding: Tensor,
    positional_embedding: Tensor,
    ln_pre: LayerNorm,
    transformer: Transformer,
    ln_post: LayerNorm,
    proj: Tensor,
    config: VisionConfig,
}

impl VisionTransformer {
    pub fn new(cfg: &VisionConfig, vb: VarBuilder, control: bool) -> Result<Self> {
        ensure!(
            cfg.image_size % cfg.patch_size == 0,
            "image size {} is not a multiple of patch size {}",
            cfg.image_size,
            cfg.patch_size
        );
        let tokens = cfg.grid_size() * cfg.grid_size() + 1;
        let conv1 = conv2d_no_bias(
            3,
            cfg.width,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        Ok(Self {
            conv1,
            class_embedding: vb.get(cfg.width, "class_embedding")?,
            positional_embedding: vb.get((tokens, cfg.width), "positional_embedding")?,
            ln_pre: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_pre"))?,
            transformer: Transformer::new(cfg, vb.pp("transformer"), control)?,
            ln_post: layer_norm(cfg.width, cfg.layer_norm_eps, vb.pp("ln_post"))?,
            proj: vb.get((cfg.width, cfg.output_dim), "proj")?,
            config: cfg.clone(),
        })
    }

    fn embed(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = pixel_values.dims4()?;
        let size = self.config.image_size;
        ensure!(
            c == 3 && h == size && w == size,
            "expected pixel values of shape (B, 3, {size}, {size}), got {:?}",
            pixel_values.dims()
        );
        let width = self.config.width;
        let patches = self
            .conv1
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let class = self
            .class_embedding
            .reshape((1, 1, width))?
            .broadcast_as((b, 1, width))?
            .to_dtype(patches.dtype())?;
        let xs = Tensor::cat(&[&class, &patches], 1)?;
        let xs = xs.broadcast_add(&self.positional_embedding)?;
        Ok(self.ln_pre.forward(&xs)?)
    }

    fn pool(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let cls = xs.i((.., 0, ..))?;
        self.ln_post.forward(&cls)?.matmul(&self.proj)
    }

    /// Projected image embedding, optionally steered by controller hiddens.
    pub fn forward(&self, pixel_values: &Tensor, control: Option<Vec<Tensor>>) -> Result<Tensor> {
        if let Some(control) = &control {
            ensure!(
                control.len() == self.config.layers,
                "expected {} control hiddens, got {}",
                self.config.layers,
                control.len()
            );
        }
        let xs = self.embed(pixel_values)?;
        let xs = self.transformer.forward(&xs, control)?;
        Ok(self.pool(&xs)?)
    }

    /// Projected embedding of a controller tower plus its per-block hiddens.
    pub fn forward_with_hiddens(&self, pixel_values: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let xs = self.embed(pixel_values)?;
        let (xs, hiddens) = self.transformer.forward_with_hiddens(&xs)?;
        Ok((self.pool(&xs)?, hiddens))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    fn small_config() -> VisionConfig {
        VisionConfig {
            image_size: 32,
            patch_size: 16,
            width: 8,
            layers: 2,
            heads: 2,
            mlp_ratio: 2.0,
            output_dim: 4,
            layer_norm_eps: 1e-5,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        (a - b)?.abs()?.max_all()?.to_scalar::<f32>()
    }

    #[test]
    fn control_hiddens_feed_blocks_last_first() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let transformer = Transformer::new(&small_config(), vb, false)?;

        let xs = Tensor::randn(0f32, 1f32, (1, 5, 8), &device)?;
        let shallow = Tensor::randn(0f32, 1f32, (1, 5, 8), &device)?;
        let deep = Tensor::randn(0f32, 1f32, (1, 5, 8), &device)?;

        let run = |after_first: &Tensor, after_second: &Tensor| -> candle_core::Result<Tensor> {
            let xs = (transformer.resblocks[0].forward(&xs)? + after_first)?;
            transformer.resblocks[1].forward(&xs)? + after_second
        };
        let expected = run(&deep, &shallow)?;
        let swapped = run(&shallow, &deep)?;

        let actual = transformer.forward(&xs, Some(vec![shallow.clone(), deep.clone()]))?;
        assert!(max_abs_diff(&actual, &expected)? < 1e-5);
        assert!(max_abs_diff(&actual, &swapped)? > 1e-4);
        Ok(())
    }

    #[test]
    fn controller_blocks_nest_under_inner_transformer() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        VisionTransformer::new(&small_config(), vb.pp("visual_control"), true)?;

        let data = varmap.data().lock().unwrap();
        for key in [
            "visual_control.transformer.transformer.resblocks.0.attn.in_proj_weight",
            "visual_control.transformer.transformer.resblocks.1.mlp.c_proj.weight",
            "visual_control.transformer.zero_modules.0.weight",
            "visual_control.transformer.zero_modules.1.bias",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert!(
            !data
                .keys()
                .any(|key| key.starts_with("visual_control.transformer.resblocks."))
        );
        Ok(())
    }
}
