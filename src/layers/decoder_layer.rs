//! Decoder Layer
//!
//! Self-attention followed by a feed-forward network, each wrapped in a
//! residual connection and normalised *after* the addition (post-norm):
//!
//! ```text
//! x ──► MHA(x, x, x, mask) ─► Dropout ─► (+) ─► LayerNorm ─► h1
//! │                                       ↑
//! └───────────────────────────────────────┘
//!
//! h1 ─► FeedForward ─► Dropout ─► (+) ─► LayerNorm ─► h2
//! │                               ↑
//! └───────────────────────────────┘
//! ```
//!
//! Queries, keys and values are all the layer input; there is no encoder
//! memory to attend to.

use super::attention::{build_attention, MultiHeadAttention};
use super::dropout::Dropout;
use super::feed_forward::FeedForward;
use super::layer_norm::LayerNorm;
use crate::config::Config;
use crate::error::Result;
use crate::mask::Mask;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// One post-norm decoder layer
#[derive(Debug)]
pub struct DecoderLayer {
    pub attention: Box<dyn MultiHeadAttention>,
    pub attn_dropout: Dropout,
    pub ln1: LayerNorm,
    pub feed_forward: FeedForward,
    pub ff_dropout: Dropout,
    pub ln2: LayerNorm,
}

impl DecoderLayer {
    pub fn new(config: &Config, rng: &mut StdRng) -> Self {
        Self {
            attention: build_attention(config, rng),
            attn_dropout: Dropout::new(config.resid_pdrop),
            ln1: LayerNorm::new(config.d_model),
            feed_forward: FeedForward::new(config.d_model, config.d_ff, rng),
            ff_dropout: Dropout::new(config.resid_pdrop),
            ln2: LayerNorm::new(config.d_model),
        }
    }

    /// # Arguments
    ///
    /// * `x` - Hidden state `[B, S, d_model]`
    /// * `mask` - Combined padding/causal mask `[B, S, S]`
    ///
    /// # Returns
    ///
    /// `(hidden [B, S, d_model], attention weights [B, H, S, S])`
    pub fn forward(&self, x: &Tensor, mask: &Mask, rng: &mut StdRng) -> Result<(Tensor, Tensor)> {
        let attn = self.attention.forward(x, x, x, mask, rng)?;
        let h1 = self
            .ln1
            .forward(&x.add(&self.attn_dropout.forward(&attn.output, rng)))?;

        let ff = self.feed_forward.forward(&h1)?;
        let h2 = self.ln2.forward(&h1.add(&self.ff_dropout.forward(&ff, rng)))?;

        Ok((h2, attn.weights))
    }

    pub fn set_training(&mut self, training: bool) {
        self.attention.set_training(training);
        self.attn_dropout.training = training;
        self.ff_dropout.training = training;
    }

    pub fn num_parameters(&self) -> usize {
        self.attention.num_parameters()
            + self.ln1.num_parameters()
            + self.feed_forward.num_parameters()
            + self.ln2.num_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionKind;
    use rand::SeedableRng;

    fn input(b: usize, s: usize, d: usize) -> Tensor {
        let data = (0..b * s * d).map(|i| ((i * 7 % 13) as f32 - 6.0) / 6.0).collect();
        Tensor::new(data, vec![b, s, d])
    }

    #[test]
    fn test_output_is_layer_normalised() {
        let config = Config::tiny(50).with_dropout(0.0);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let layer = DecoderLayer::new(&config, &mut rng);
        let mask = Mask::attention(&[vec![1, 2, 3]], 0).unwrap();

        let (y, w) = layer.forward(&input(1, 3, 32), &mask, &mut rng).unwrap();
        assert_eq!(y.shape, vec![1, 3, 32]);
        assert_eq!(w.shape, vec![1, 4, 3, 3]);
        for r in 0..3 {
            let mean = y.row(r).iter().sum::<f32>() / 32.0;
            assert!(mean.abs() < 1e-4);
        }
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let config = Config::tiny(50);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layer = DecoderLayer::new(&config, &mut rng);
        layer.set_training(false);
        let mask = Mask::attention(&[vec![1, 2, 3, 4]], 0).unwrap();
        let x = input(1, 4, 32);

        let (a, _) = layer.forward(&x, &mask, &mut StdRng::seed_from_u64(1)).unwrap();
        let (b, _) = layer.forward(&x, &mask, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_performer_layer_parameter_count_matches_standard() {
        let config = Config::tiny(50);
        let mut rng = StdRng::seed_from_u64(0);
        let standard = DecoderLayer::new(&config, &mut rng);
        let performer = DecoderLayer::new(
            &config.with_attention(AttentionKind::Performer { features: None }),
            &mut rng,
        );
        assert_eq!(standard.num_parameters(), performer.num_parameters());
    }
}
