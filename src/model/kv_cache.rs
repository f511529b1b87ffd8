// Location: src/model/kv_cache.rs

use candle_core::{DType, Device, Tensor};

use crate::error::{EngineError, Result};

/// Preallocated key/value store for every attention layer.
///
/// Each layer owns a `(1, kv_heads, capacity, head_dim)` arena. Entries
/// `[0, len)` hold the keys and values of every position already processed;
/// a forward call writes its new entries at `n_past` and attends over
/// `[0, n_past + seq_len)`.
pub struct KvCache {
    layers: Vec<(Tensor, Tensor)>,
    capacity: usize,
    len: usize,
}

impl KvCache {
    pub fn new(
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        capacity: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (1, num_kv_heads, capacity, head_dim);
        let layers = (0..num_layers)
            .map(|_| Ok((Tensor::zeros(shape, dtype, device)?, Tensor::zeros(shape, dtype, device)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            capacity,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of positions holding valid entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Checks that `seq_len` positions can be written at `n_past`.
    pub fn check_window(&self, n_past: usize, seq_len: usize) -> Result<()> {
        if n_past > self.len {
            return Err(EngineError::model(format!(
                "cache holds {} positions, cannot continue from position {n_past}",
                self.len
            )));
        }
        let required = n_past + seq_len;
        if required > self.capacity {
            return Err(EngineError::ContextOverflow {
                required,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Writes `k`/`v` of shape `(1, kv_heads, seq_len, head_dim)` at `n_past`
    /// and returns the keys and values for positions `[0, n_past + seq_len)`.
    pub fn append(&self, layer: usize, k: &Tensor, v: &Tensor, n_past: usize) -> Result<(Tensor, Tensor)> {
        let (cache_k, cache_v) = self
            .layers
            .get(layer)
            .ok_or_else(|| EngineError::model(format!("no cache for layer {layer}")))?;
        let seq_len = k.dim(2)?;
        let required = n_past + seq_len;
        if required > self.capacity {
            return Err(EngineError::ContextOverflow {
                required,
                capacity: self.capacity,
            });
        }
        cache_k.slice_set(&k.contiguous()?, 2, n_past)?;
        cache_v.slice_set(&v.contiguous()?, 2, n_past)?;
        let k = cache_k.narrow(2, 0, required)?.contiguous()?;
        let v = cache_v.narrow(2, 0, required)?.contiguous()?;
        Ok((k, v))
    }

    /// Marks positions `[0, end)` as valid once every layer has been written.
    pub fn commit(&mut self, end: usize) {
        self.len = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> KvCache {
        KvCache::new(2, 2, 4, 8, DType::F32, &Device::Cpu).unwrap()
    }

    fn entries(seq_len: usize, value: f32) -> Tensor {
        Tensor::full(value, (1, 2, seq_len, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_append_returns_prefix() -> anyhow::Result<()> {
        let mut cache = cache();
        let (k, v) = cache.append(0, &entries(3, 1.0), &entries(3, 2.0), 0)?;
        assert_eq!(k.dims(), &[1, 2, 3, 4]);
        assert_eq!(v.sum_all()?.to_scalar::<f32>()?, 2.0 * 24.0);
        cache.commit(3);

        let (k, _) = cache.append(0, &entries(1, 5.0), &entries(1, 5.0), 3)?;
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        let last: Vec<f32> = k.narrow(2, 3, 1)?.flatten_all()?.to_vec1()?;
        assert!(last.iter().all(|&x| x == 5.0));
        let first: Vec<f32> = k.narrow(2, 0, 3)?.flatten_all()?.to_vec1()?;
        assert!(first.iter().all(|&x| x == 1.0));
        Ok(())
    }

    #[test]
    fn test_overflow_is_reported() {
        let cache = cache();
        assert!(matches!(
            cache.check_window(0, 9),
            Err(EngineError::ContextOverflow {
                required: 9,
                capacity: 8
            })
        ));
        assert!(cache.append(0, &entries(9, 0.0), &entries(9, 0.0), 0).is_err());
    }

    #[test]
    fn test_gaps_are_rejected() {
        let mut cache = cache();
        assert!(cache.check_window(0, 4).is_ok());
        assert!(cache.check_window(2, 1).is_err());
        cache.commit(4);
        assert!(cache.check_window(2, 1).is_ok());
        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.check_window(2, 1).is_err());
    }
}
