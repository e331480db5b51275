//! Activation Functions
//!
//! ## GELU (Gaussian Error Linear Unit)
//!
//! ```text
//! GELU(x) = x × Φ(x)
//! ```
//!
//! where Φ is the standard normal CDF. We use the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! Unlike ReLU, GELU has a non-zero gradient for negative inputs, which is
//! why the feed-forward network of every decoder layer uses it.

use crate::tensor::Tensor;

const GELU_COEFF: f32 = 0.044715;

/// GELU of a single value
#[inline]
pub fn gelu_scalar(x: f32) -> f32 {
    let sqrt_2_over_pi = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (sqrt_2_over_pi * (x + GELU_COEFF * x * x * x)).tanh())
}

/// GELU applied element-wise (parallel over elements)
pub fn gelu(x: &Tensor) -> Tensor {
    x.map(gelu_scalar)
}
