use candle_core::{DType, Device, Error, Result};

/// Configuration for assembling the spatial-transformer denoiser.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Latent channels consumed and produced by the model.
    pub in_channels: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    /// Width of the text conditioning tokens fed to cross-attention.
    pub context_dim: usize,
    /// Number of resolution levels; level `i` runs at `1 / 2^i` of the latent.
    pub levels: usize,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.head_dim == 0 {
            return Err(Error::Msg("head_dim must be greater than zero".into()));
        }
        if self.n_heads * self.head_dim != self.hidden_dim {
            return Err(Error::Msg(format!(
                "hidden_dim ({}) must equal n_heads ({}) * head_dim ({})",
                self.hidden_dim, self.n_heads, self.head_dim
            )));
        }
        if self.context_dim == 0 {
            return Err(Error::Msg("context_dim must be greater than zero".into()));
        }
        if self.levels == 0 {
            return Err(Error::Msg("levels must be at least one".into()));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(Error::Msg(format!(
                "dtype must be f32, f16 or bf16, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }

    /// Spatial divisor of the coarsest level.
    pub fn max_downsample(&self) -> usize {
        1 << (self.levels - 1)
    }
}
