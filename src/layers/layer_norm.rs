//! Layer Normalization
//!
//! ```text
//! 1. mean = E[x]
//! 2. var = E[(x - mean)²]
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! Statistics are taken over the last (feature) dimension of every position
//! independently, so batch size and padding never leak between positions.

use crate::error::{expect_shape, Result};
use crate::tensor::Tensor;

/// Epsilon used by every normalisation in the decoder
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization with learnable scale and shift
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Tensor, // Scale parameter [d_model]
    pub beta: Tensor,  // Shift parameter [d_model]
    pub eps: f32,
}

impl LayerNorm {
    /// gamma = 1, beta = 0, eps = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: LAYER_NORM_EPS,
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.gamma.numel() + self.beta.numel()
    }

    /// Normalise `x` (`[.., d_model]`) along its last dimension
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.shape.len().saturating_sub(1);
        expect_shape("layer norm input", &x.shape[last..], &self.gamma.shape)?;

        let mean = x.mean(-1, true);
        let std = x.var(-1, true).add_scalar(self.eps).sqrt();

        Ok(x.sub(&mean).div(&std).mul(&self.gamma).add(&self.beta))
    }
}
