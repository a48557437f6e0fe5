use anyhow::{Result, ensure};
use candle_core::{D, Module, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, GroupNorm, LayerNorm, Linear, VarBuilder, group_norm, layer_norm, linear,
    linear_no_bias, ops,
};

use daclip_core::options::HEAD_CHANNELS;

/// Convolution whose bias is loaded only when the checkpoint has one.
pub(super) fn conv2d(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> Result<Conv2d> {
    let weight = vb.get(
        (out_channels, in_channels, kernel_size, kernel_size),
        "weight",
    )?;
    let bias = if vb.contains_tensor("bias") {
        Some(vb.get(out_channels, "bias")?)
    } else {
        None
    };
    Ok(Conv2d::new(
        weight,
        bias,
        Conv2dConfig {
            stride,
            padding,
            ..Default::default()
        },
    ))
}

/// Same-size convolution with `kernel_size / 2` padding.
pub(super) fn default_conv(
    vb: VarBuilder,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
) -> Result<Conv2d> {
    conv2d(vb, in_channels, out_channels, kernel_size, 1, kernel_size / 2)
}

/// Layer norm across the channel axis of an NCHW tensor, gain only.
#[derive(Clone)]
pub(super) struct ChannelLayerNorm {
    g: Tensor,
}

impl ChannelLayerNorm {
    pub(super) fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            g: vb.get((1, channels, 1, 1), "g")?,
        })
    }
}

impl Module for ChannelLayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let eps = 1e-5;
        let mean = xs.mean_keepdim(1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let inv_std = (var + eps)?.sqrt()?.recip()?;
        centered.broadcast_mul(&inv_std)?.broadcast_mul(&self.g)
    }
}

struct Block {
    proj: Conv2d,
}

impl Block {
    fn new(vb: VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        Ok(Self {
            proj: default_conv(vb.pp("proj"), dim_in, dim_out, 3)?,
        })
    }

    fn forward(&self, xs: &Tensor, scale_shift: Option<(&Tensor, &Tensor)>) -> candle_core::Result<Tensor> {
        let mut xs = self.proj.forward(xs)?;
        if let Some((scale, shift)) = scale_shift {
            xs = xs.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)?;
        }
        xs.silu()
    }
}

/// Two conv blocks with a time-conditioned scale and shift in between.
pub(super) struct ResBlock {
    mlp: Linear,
    block1: Block,
    block2: Block,
    res_conv: Option<Conv2d>,
    dim_out: usize,
}

impl ResBlock {
    pub(super) fn new(vb: VarBuilder, dim_in: usize, dim_out: usize, time_dim: usize) -> Result<Self> {
        let res_conv = if dim_in != dim_out {
            Some(default_conv(vb.pp("res_conv"), dim_in, dim_out, 1)?)
        } else {
            None
        };
        Ok(Self {
            mlp: linear(time_dim, dim_out * 2, vb.pp("mlp.1"))?,
            block1: Block::new(vb.pp("block1"), dim_in, dim_out)?,
            block2: Block::new(vb.pp("block2"), dim_out, dim_out)?,
            res_conv,
            dim_out,
        })
    }

    pub(super) fn forward(&self, xs: &Tensor, time_emb: &Tensor) -> candle_core::Result<Tensor> {
        let batch = time_emb.dim(0)?;
        let emb = self
            .mlp
            .forward(&time_emb.silu()?)?
            .reshape((batch, self.dim_out * 2, 1, 1))?;
        let scale_shift = emb.chunk(2, 1)?;
        let h = self
            .block1
            .forward(xs, Some((&scale_shift[0], &scale_shift[1])))?;
        let h = self.block2.forward(&h, None)?;
        match &self.res_conv {
            Some(conv) => h + conv.forward(xs)?,
            None => h + xs,
        }
    }
}

/// Attention with cost linear in the number of pixels.
pub(super) struct LinearAttention {
    to_qkv: Conv2d,
    to_out: Conv2d,
    out_norm: ChannelLayerNorm,
    heads: usize,
    dim_head: usize,
}

impl LinearAttention {
    const HEADS: usize = 4;

    pub(super) fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        let dim_head = HEAD_CHANNELS;
        let hidden = dim_head * Self::HEADS;
        Ok(Self {
            to_qkv: conv2d(vb.pp("to_qkv"), dim, hidden * 3, 1, 1, 0)?,
            to_out: conv2d(vb.pp("to_out.0"), hidden, dim, 1, 1, 0)?,
            out_norm: ChannelLayerNorm::new(vb.pp("to_out.1"), dim)?,
            heads: Self::HEADS,
            dim_head,
        })
    }
}

impl Module for LinearAttention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, _c, h, w) = xs.dims4()?;
        let n = h * w;
        let qkv = self.to_qkv.forward(xs)?.chunk(3, 1)?;
        let split = |t: &Tensor| t.reshape((b, self.heads, self.dim_head, n));
        let q = ops::softmax(&split(&qkv[0])?, D::Minus2)?;
        let k = ops::softmax_last_dim(&split(&qkv[1])?)?;
        let v = split(&qkv[2])?;

        let q = (q * (self.dim_head as f64).powf(-0.5))?;
        let v = (v / n as f64)?;

        // context[d, e] = sum_n k[d, n] v[e, n]
        let context = k.matmul(&v.t()?)?;
        // out[e, n] = sum_d context[d, e] q[d, n]
        let out = context.t()?.matmul(&q)?;
        let out = out.reshape((b, self.heads * self.dim_head, h, w))?;
        self.out_norm.forward(&self.to_out.forward(&out)?)
    }
}

struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl CrossAttention {
    fn new(vb: VarBuilder, query_dim: usize, context_dim: usize, heads: usize, dim_head: usize) -> Result<Self> {
        let inner = heads * dim_head;
        Ok(Self {
            to_q: linear_no_bias(query_dim, inner, vb.pp("to_q"))?,
            to_k: linear_no_bias(context_dim, inner, vb.pp("to_k"))?,
            to_v: linear_no_bias(context_dim, inner, vb.pp("to_v"))?,
            to_out: linear(inner, query_dim, vb.pp("to_out.0"))?,
            heads,
            dim_head,
        })
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let context = context.unwrap_or(xs);
        let (b, n, _) = xs.dims3()?;
        let split = |t: Tensor| {
            let len = t.dim(1)?;
            t.reshape((b, len, self.heads, self.dim_head))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.to_q.forward(xs)?)?;
        let k = split(self.to_k.forward(context)?)?;
        let v = split(self.to_v.forward(context)?)?;

        let sim = (q.matmul(&k.t()?)? * (self.dim_head as f64).powf(-0.5))?;
        let attn = ops::softmax_last_dim(&sim)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, self.heads * self.dim_head))?;
        self.to_out.forward(&out)
    }
}

/// Gated-GELU feed forward.
struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    fn new(vb: VarBuilder, dim: usize) -> Result<Self> {
        let inner = dim * 4;
        Ok(Self {
            proj_in: linear(dim, inner * 2, vb.pp("net.0.proj"))?,
            proj_out: linear(inner, dim, vb.pp("net.2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let projected = self.proj_in.forward(xs)?.chunk(2, D::Minus1)?;
        let gated = (&projected[0] * projected[1].gelu_erf()?)?;
        self.proj_out.forward(&gated)
    }
}

struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl BasicTransformerBlock {
    fn new(vb: VarBuilder, dim: usize, heads: usize, dim_head: usize, context_dim: usize) -> Result<Self> {
        Ok(Self {
            attn1: CrossAttention::new(vb.pp("attn1"), dim, dim, heads, dim_head)?,
            ff: FeedForward::new(vb.pp("ff"), dim)?,
            attn2: CrossAttention::new(vb.pp("attn2"), dim, context_dim, heads, dim_head)?,
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            norm3: layer_norm(dim, 1e-5, vb.pp("norm3"))?,
        })
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, context)? + &xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + &xs
    }
}

/// Transformer over pixels that cross-attends to an embedding sequence.
pub(super) struct SpatialTransformer {
    norm: GroupNorm,
    proj_in: Conv2d,
    block: BasicTransformerBlock,
    proj_out: Conv2d,
}

impl SpatialTransformer {
    pub(super) fn new(vb: VarBuilder, channels: usize, context_dim: usize) -> Result<Self> {
        ensure!(
            channels % HEAD_CHANNELS == 0,
            "{channels} channels cannot be split into {HEAD_CHANNELS}-wide heads"
        );
        let heads = channels / HEAD_CHANNELS;
        let inner = heads * HEAD_CHANNELS;
        Ok(Self {
            norm: group_norm(32, channels, 1e-6, vb.pp("norm"))?,
            proj_in: conv2d(vb.pp("proj_in"), channels, inner, 1, 1, 0)?,
            block: BasicTransformerBlock::new(
                vb.pp("transformer_blocks.0"),
                inner,
                heads,
                HEAD_CHANNELS,
                context_dim,
            )?,
            proj_out: conv2d(vb.pp("proj_out"), inner, channels, 1, 1, 0)?,
        })
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let (b, _c, h, w) = xs.dims4()?;
        let hidden = self.proj_in.forward(&self.norm.forward(xs)?)?;
        let inner = hidden.dim(1)?;
        let hidden = hidden.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let hidden = self.block.forward(&hidden, context)?;
        let hidden = hidden
            .transpose(1, 2)?
            .reshape((b, inner, h, w))?;
        self.proj_out.forward(&hidden)? + xs
    }
}

pub(super) enum Attention {
    Linear(LinearAttention),
    Spatial(SpatialTransformer),
}

/// `x + attn(norm(x))`.
pub(super) struct PreNormAttention {
    norm: ChannelLayerNorm,
    attn: Attention,
}

impl PreNormAttention {
    /// Loads from `<prefix>.fn.norm` and `<prefix>.fn.fn`.
    pub(super) fn new(vb: VarBuilder, dim: usize, context_dim: Option<usize>) -> Result<Self> {
        let inner = vb.pp("fn");
        let attn = match context_dim {
            Some(context_dim) => {
                Attention::Spatial(SpatialTransformer::new(inner.pp("fn"), dim, context_dim)?)
            }
            None => Attention::Linear(LinearAttention::new(inner.pp("fn"), dim)?),
        };
        Ok(Self {
            norm: ChannelLayerNorm::new(inner.pp("norm"), dim)?,
            attn,
        })
    }

    pub(super) fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let normed = self.norm.forward(xs)?;
        let out = match &self.attn {
            Attention::Linear(attn) => attn.forward(&normed)?,
            Attention::Spatial(attn) => attn.forward(&normed, context)?,
        };
        out + xs
    }
}

pub(super) enum Resample {
    Conv(Conv2d),
    Down(Conv2d),
    Up(Conv2d),
}

impl Resample {
    pub(super) fn down(vb: VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        Ok(Self::Down(conv2d(vb, dim_in, dim_out, 4, 2, 1)?))
    }

    pub(super) fn up(vb: VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        Ok(Self::Up(conv2d(vb.pp("1"), dim_in, dim_out, 3, 1, 1)?))
    }

    pub(super) fn same(vb: VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        Ok(Self::Conv(default_conv(vb, dim_in, dim_out, 3)?))
    }
}

impl Module for Resample {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Resample::Conv(conv) | Resample::Down(conv) => conv.forward(xs),
            Resample::Up(conv) => {
                let (_b, _c, h, w) = xs.dims4()?;
                conv.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)
            }
        }
    }
}

/// Sinusoidal embedding of (possibly fractional) timesteps, `[B] -> [B, dim]`.
pub(super) fn sinusoidal_embedding(time: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let half = dim / 2;
    let scale = (10000f64).ln() / (half as f64 - 1.0);
    let freqs: Vec<f32> = (0..half).map(|i| (-(i as f64) * scale).exp() as f32).collect();
    let freqs = Tensor::from_vec(freqs, (1, half), time.device())?;
    let args = time
        .to_dtype(freqs.dtype())?
        .unsqueeze(1)?
        .broadcast_mul(&freqs)?;
    Tensor::cat(&[&args.sin()?, &args.cos()?], 1)
}

/// Reflect-pad the bottom and right edges of an NCHW tensor.
pub(super) fn reflect_pad_bottom_right(xs: &Tensor, pad_h: usize, pad_w: usize) -> Result<Tensor> {
    let (_b, _c, h, w) = xs.dims4()?;
    ensure!(
        pad_h < h && pad_w < w,
        "a {w}x{h} input is too small to reflect-pad by {pad_w}x{pad_h}"
    );
    let mut xs = xs.contiguous()?;
    if pad_w > 0 {
        let right = reverse(&xs.narrow(3, w - pad_w - 1, pad_w)?, 3)?;
        xs = Tensor::cat(&[&xs, &right], 3)?;
    }
    if pad_h > 0 {
        let bottom = reverse(&xs.narrow(2, h - pad_h - 1, pad_h)?, 2)?;
        xs = Tensor::cat(&[&xs, &bottom], 2)?;
    }
    Ok(xs)
}

fn reverse(xs: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let len = xs.dim(dim)?;
    let indices: Vec<u32> = (0..len as u32).rev().collect();
    let indices = Tensor::from_vec(indices, len, xs.device())?;
    xs.contiguous()?.index_select(&indices, dim)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn reflect_pad_mirrors_without_edge() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::arange(0f32, 4., &device)?.reshape((1, 1, 1, 4))?;
        let xs = xs.repeat((1, 1, 3, 1))?;
        let padded = reflect_pad_bottom_right(&xs, 1, 2)?;
        assert_eq!(padded.dims(), &[1, 1, 4, 6]);
        let row: Vec<f32> = padded.flatten_all()?.narrow(0, 0, 6)?.to_vec1()?;
        assert_eq!(row, vec![0., 1., 2., 3., 2., 1.]);
        Ok(())
    }

    #[test]
    fn reflect_pad_rejects_tiny_inputs() -> Result<()> {
        let xs = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(reflect_pad_bottom_right(&xs, 2, 0).is_err());
        Ok(())
    }

    #[test]
    fn sinusoidal_embedding_layout() -> Result<()> {
        let time = Tensor::new(&[0f32, 5.], &Device::Cpu)?;
        let emb = sinusoidal_embedding(&time, 8)?;
        assert_eq!(emb.dims(), &[2, 8]);
        let first: Vec<f32> = emb.get(0)?.to_vec1()?;
        assert_eq!(&first[..4], &[0., 0., 0., 0.]);
        assert_eq!(&first[4..], &[1., 1., 1., 1.]);
        Ok(())
    }

    #[test]
    fn channel_layer_norm_normalizes_channels() -> Result<()> {
        let device = Device::Cpu;
        let norm = ChannelLayerNorm {
            g: Tensor::ones((1, 2, 1, 1), DType::F32, &device)?,
        };
        let xs = Tensor::new(&[1f32, 3.], &device)?.reshape((1, 2, 1, 1))?;
        let out: Vec<f32> = norm.forward(&xs)?.flatten_all()?.to_vec1()?;
        assert!((out[0] + 1.0).abs() < 1e-4);
        assert!((out[1] - 1.0).abs() < 1e-4);
        Ok(())
    }
}
