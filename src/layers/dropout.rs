//! Dropout Layer
//!
//! Inverted dropout: during training each element is zeroed with probability
//! `rate` and survivors are scaled by `1 / (1 - rate)`, so expected
//! activations match inference. In eval mode (or at rate 0) the input passes
//! through untouched and no randomness is consumed.
//!
//! Randomness always comes from the RNG handed to [`Dropout::forward`];
//! there is no hidden global generator.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Dropout regularisation
#[derive(Clone, Debug)]
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
}

impl Dropout {
    /// Create a dropout layer in training mode
    ///
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1)`; configs are validated before
    /// any layer is built, so this only fires on direct misuse.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0), got {}",
            rate
        );
        Self {
            rate,
            training: true,
        }
    }

    /// Is this layer currently an identity?
    pub fn is_identity(&self) -> bool {
        !self.training || self.rate == 0.0
    }

    pub fn forward(&self, x: &Tensor, rng: &mut StdRng) -> Tensor {
        if self.is_identity() {
            return x.clone();
        }

        let scale = 1.0 / (1.0 - self.rate);
        let data = x
            .data
            .iter()
            .map(|&v| {
                if rng.random::<f32>() < self.rate {
                    0.0
                } else {
                    v * scale
                }
            })
            .collect();
        Tensor::new(data, x.shape.clone())
    }
}
