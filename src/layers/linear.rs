//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b`.
//!
//! ```text
//! Input:  x [*, in_features]        (rank 2 or rank 3)
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y [*, out_features]
//! ```
//!
//! ## Initialisation
//!
//! Two schemes are used across the decoder:
//!
//! - [`Linear::uniform`]: weights and bias from U(-1/√in, 1/√in), the default
//!   scheme. Attention projections use it unchanged.
//! - [`Linear::normal`]: weights re-drawn from N(0, std²), bias left on the
//!   default uniform scheme. The feed-forward network uses std = 0.02.
//!
//! Both draw from the caller's seeded RNG so a model is reproducible from its
//! config seed alone.

use crate::error::{expect_shape, Error, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// `size` samples from N(0, std²)
pub fn normal_init(size: usize, std: f32, rng: &mut StdRng) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
        .collect()
}

/// `size` samples from U(-bound, bound)
pub fn uniform_init(size: usize, bound: f32, rng: &mut StdRng) -> Vec<f32> {
    (0..size)
        .map(|_| (rng.random::<f32>() * 2.0 - 1.0) * bound)
        .collect()
}

/// Linear layer (fully connected)
#[derive(Clone, Debug)]
pub struct Linear {
    /// Weight matrix: [in_features, out_features]
    pub weight: Tensor,
    /// Bias vector: [out_features]
    pub bias: Tensor,
}

impl Linear {
    /// Weights from N(0, std²), bias from U(-1/√in, 1/√in)
    pub fn normal(in_features: usize, out_features: usize, std: f32, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, std, rng),
                vec![in_features, out_features],
            ),
            bias: Tensor::new(uniform_init(out_features, bound, rng), vec![out_features]),
        }
    }

    /// Weights and bias from U(-1/√in, 1/√in)
    pub fn uniform(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Self {
            weight: Tensor::new(
                uniform_init(in_features * out_features, bound, rng),
                vec![in_features, out_features],
            ),
            bias: Tensor::new(uniform_init(out_features, bound, rng), vec![out_features]),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Number of learnable values
    pub fn num_parameters(&self) -> usize {
        self.weight.numel() + self.bias.numel()
    }

    /// Forward pass: y = x @ W + b
    ///
    /// Rank-3 input `[batch, seq, in]` is flattened to `[batch * seq, in]`
    /// for the product and reshaped back afterwards.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_features = self.in_features();
        match x.rank() {
            2 => {
                expect_shape("linear input", &x.shape[1..], &[in_features])?;
                Ok(x.matmul(&self.weight).add(&self.bias))
            }
            3 => {
                expect_shape("linear input", &x.shape[2..], &[in_features])?;
                let (batch, seq) = (x.shape[0], x.shape[1]);
                let y = x
                    .reshape(&[batch * seq, in_features])
                    .matmul(&self.weight)
                    .add(&self.bias);
                Ok(y.reshape(&[batch, seq, self.out_features()]))
            }
            _ => Err(Error::RankMismatch {
                what: "linear input",
                expected: vec![2, 3],
                got: x.shape.clone(),
            }),
        }
    }
}
