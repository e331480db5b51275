//! Position-Wise Feed-Forward Network
//!
//! ```text
//! x → Linear(d_model → d_ff) → GELU → Linear(d_ff → d_model) → y
//! ```
//!
//! Applied identically and independently at every position; mixing across
//! positions is attention's job. Weights are drawn from N(0, 0.02²); biases
//! keep the default U(-1/√in, 1/√in) initialisation.

use super::activation::gelu;
use super::linear::Linear;
use crate::error::Result;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Standard deviation of the feed-forward weight initialisation
pub const FF_INIT_STD: f32 = 0.02;

/// Two-layer GELU network
#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize, rng: &mut StdRng) -> Self {
        Self {
            fc1: Linear::normal(d_model, d_ff, FF_INIT_STD, rng),
            fc2: Linear::normal(d_ff, d_model, FF_INIT_STD, rng),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.fc1.num_parameters() + self.fc2.num_parameters()
    }

    /// `[B, S, d_model]` → `[B, S, d_model]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        self.fc2.forward(&gelu(&h))
    }
}
