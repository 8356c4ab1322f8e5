//! Layer normalization over the channel axis of `[B, C, T]` tensors.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

/// LayerNorm applied across `C` for every time step of a channel-first sequence.
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    inner: candle_nn::LayerNorm,
}

impl ChannelLayerNorm {
    pub fn new(channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: candle_nn::layer_norm(channels, eps, vb)?,
        })
    }
}

impl Module for ChannelLayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // [B, C, T] → [B, T, C] → norm → [B, C, T]
        let xs = xs.transpose(1, 2)?.contiguous()?;
        self.inner.forward(&xs)?.transpose(1, 2)?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn normalizes_each_time_step() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let norm = ChannelLayerNorm::new(8, 1e-5, vb).unwrap();

        let x = (Tensor::randn(0f32, 3.0, (2, 8, 5), &dev).unwrap() + 7.0).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 8, 5]);

        for t in 0..5 {
            let col: Vec<f32> = y.i((0, .., t)).unwrap().to_vec1().unwrap();
            let mean = col.iter().sum::<f32>() / 8.0;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-2);
        }
    }
}
