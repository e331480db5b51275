//! Verso: GPT-Style Autoregressive Transformer
//!
//! A decoder-only transformer language model written from scratch on a small
//! dense tensor type: sinusoidal positions, masked multi-head self-attention
//! (exact or random-feature approximated), post-norm decoder layers and a
//! vocabulary head tied to the token embedding.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f32` tensors with the handful of operations the model needs
//! - [`mask`] - Padding and causal attention masks, 1-based position ids
//! - [`layers`] - Linear, dropout, layer norm, embeddings, attention, feed-forward
//! - [`model`] - Decoder stack, tied head and the language model
//! - [`loss`] - Shifted cross-entropy, perplexity and epoch averaging
//! - [`config`] - Hyper-parameters, presets and JSON persistence
//! - [`error`] - Configuration and shape errors
//!
//! # Example
//!
//! ```rust
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use verso::{Config, LanguageModel, LmBatch};
//!
//! let config = Config::tiny(64).with_attention("performer".parse().unwrap());
//! let mut model = LanguageModel::new(&config).unwrap();
//! model.eval();
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let batch = LmBatch::from_inputs(vec![vec![3, 9, 12, 7], vec![5, 2, 0, 0]]);
//! let metrics = model.step(&batch, &mut rng).unwrap();
//! assert!(metrics.perplexity > 1.0);
//! ```

pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod model;
pub mod tensor;

// Re-export main types for convenience
pub use config::{AttentionKind, Config, DEFAULT_MAX_LEN};
pub use error::{Error, Result};
pub use layers::{MultiHeadAttention, PerformerAttention, StandardAttention, MASKED_SCORE};
pub use loss::{cross_entropy, perplexity, shifted_cross_entropy, EpochLoss, LmBatch, StepMetrics};
pub use mask::{positions, Mask};
pub use model::{DecoderOutput, Gpt, LanguageModel, TiedLmHead, TransformerDecoder};
pub use tensor::Tensor;
