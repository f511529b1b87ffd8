//! Building blocks shared by the ChatGLM transformer variants.

use candle_core::{DType, Device, Tensor, D};

use crate::error::Result;

/// Precomputed rotary tables for `dim` rotated channels.
pub(crate) struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    dim: usize,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, theta: f64, max_positions: usize, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, dim / 2), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
            dim,
        })
    }

    fn tables(&self, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((
            self.cos.index_select(positions, 0)?,
            self.sin.index_select(positions, 0)?,
        ))
    }

    /// Rotates adjacent channel pairs of the first `dim` channels of
    /// `xs: (b, heads, seq, head_dim)`; the remaining channels pass through.
    pub fn apply_interleaved(&self, xs: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (cos, sin) = self.tables(positions)?;
        self.apply_partial(xs, |rot| Ok(candle_nn::rotary_emb::rope_i(rot, &cos, &sin)?))
    }

    /// Rotates the two halves of the first `dim` channels against each other.
    pub fn apply_half(&self, xs: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (cos, sin) = self.tables(positions)?;
        self.apply_partial(xs, |rot| Ok(candle_nn::rotary_emb::rope(rot, &cos, &sin)?))
    }

    fn apply_partial(&self, xs: &Tensor, rotate: impl Fn(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
        let head_dim = xs.dim(D::Minus1)?;
        let rot = rotate(&xs.narrow(D::Minus1, 0, self.dim)?.contiguous()?)?;
        if self.dim == head_dim {
            return Ok(rot);
        }
        let pass = xs.narrow(D::Minus1, self.dim, head_dim - self.dim)?;
        Ok(Tensor::cat(&[&rot, &pass], D::Minus1)?)
    }
}

/// Additive mask for `seq_len` queries after `n_past` cached positions:
/// query `i` sees keys `0..=n_past + i`.
pub(crate) fn causal_mask(seq_len: usize, n_past: usize, device: &Device) -> Result<Tensor> {
    let total = n_past + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > n_past + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, total), device)?)
}

/// Scaled dot-product attention over `(b, heads, seq, head_dim)` tensors.
pub(crate) fn attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
    let scores = (q.matmul(&k.t()?)? * scale)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(probs.matmul(v)?)
}

/// Splits a fused `(b, seq, (q_heads + 2 * kv_heads) * head_dim)` projection
/// into `(b, heads, seq, head_dim)` queries, keys and values.
pub(crate) fn split_qkv(
    qkv: &Tensor,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Result<(Tensor, Tensor, Tensor)> {
    let (b, seq, _) = qkv.dims3()?;
    let q_size = num_heads * head_dim;
    let kv_size = num_kv_heads * head_dim;
    let heads = |offset: usize, size: usize, n: usize| -> Result<Tensor> {
        Ok(qkv
            .narrow(D::Minus1, offset, size)?
            .reshape((b, seq, n, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    Ok((
        heads(0, q_size, num_heads)?,
        heads(q_size, kv_size, num_kv_heads)?,
        heads(q_size + kv_size, kv_size, num_kv_heads)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask() -> anyhow::Result<()> {
        let mask = causal_mask(2, 1, &Device::Cpu)?;
        let rows: Vec<Vec<f32>> = mask.to_vec2()?;
        assert_eq!(rows[0][..2], [0.0, 0.0]);
        assert!(rows[0][2].is_infinite());
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_rotary_position_zero_is_identity() -> anyhow::Result<()> {
        let rotary = RotaryEmbedding::new(4, 10000.0, 16, &Device::Cpu)?;
        let xs = Tensor::arange(0f32, 8.0, &Device::Cpu)?.reshape((1, 1, 1, 8))?;
        let positions = Tensor::new(&[0u32], &Device::Cpu)?;
        for out in [
            rotary.apply_interleaved(&xs, &positions)?,
            rotary.apply_half(&xs, &positions)?,
        ] {
            let diff = (out - &xs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_rotary_preserves_norm() -> anyhow::Result<()> {
        let rotary = RotaryEmbedding::new(4, 10000.0, 16, &Device::Cpu)?;
        let xs = Tensor::arange(1f32, 9.0, &Device::Cpu)?.reshape((1, 1, 1, 8))?;
        let positions = Tensor::new(&[7u32], &Device::Cpu)?;
        let out = rotary.apply_interleaved(&xs, &positions)?;
        let norm_in = xs.sqr()?.sum_all()?.to_scalar::<f32>()?;
        let norm_out = out.sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!((norm_in - norm_out).abs() < 1e-3);
        // channels beyond the rotary dim are untouched
        let tail: Vec<f32> = out.flatten_all()?.narrow(0, 4, 4)?.to_vec1()?;
        assert_eq!(tail, vec![5.0, 6.0, 7.0, 8.0]);
        Ok(())
    }

    #[test]
    fn test_attention_single_key() -> anyhow::Result<()> {
        let q = Tensor::ones((1, 1, 1, 4), DType::F32, &Device::Cpu)?;
        let k = Tensor::ones((1, 1, 1, 4), DType::F32, &Device::Cpu)?;
        let v = Tensor::full(3f32, (1, 1, 1, 4), &Device::Cpu)?;
        let out = attention(&q, &k, &v, None)?;
        let values: Vec<f32> = out.flatten_all()?.to_vec1()?;
        assert_eq!(values, vec![3.0; 4]);
        Ok(())
    }

    #[test]
    fn test_split_qkv_shapes() -> anyhow::Result<()> {
        let qkv = Tensor::zeros((1, 3, (4 + 2 * 2) * 8), DType::F32, &Device::Cpu)?;
        let (q, k, v) = split_qkv(&qkv, 4, 2, 8)?;
        assert_eq!(q.dims(), &[1, 4, 3, 8]);
        assert_eq!(k.dims(), &[1, 2, 3, 8]);
        assert_eq!(v.dims(), &[1, 2, 3, 8]);
        Ok(())
    }
}
