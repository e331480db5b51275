//! Neural Network Layers
//!
//! Building blocks of the decoder, from the bottom up:
//!
//! - **activation**: GELU
//! - **linear**: Fully connected layer with normal and uniform initialisers
//! - **dropout**: Inverted dropout driven by an explicit RNG
//! - **layer_norm**: Layer normalisation (ε = 1e-5)
//! - **embedding**: Token embedding owning the weight shared with the output head
//! - **positional**: Fixed sinusoidal position table
//! - **attention**: Scaled dot-product kernel, the multi-head trait and the
//!   standard implementation
//! - **performer**: Random-feature approximation of multi-head attention
//! - **feed_forward**: Position-wise GELU network
//! - **decoder_layer**: Post-norm attention + feed-forward layer
//!
//! ## Design Pattern
//!
//! Every layer follows the same shape:
//!
//! ```rust,ignore
//! pub struct Layer {
//!     // Parameters, plus a `training` flag on anything with dropout
//! }
//!
//! impl Layer {
//!     pub fn new(..., rng: &mut StdRng) -> Self { }
//!     pub fn forward(&self, x: &Tensor, ...) -> Result<Tensor> { }
//!     pub fn num_parameters(&self) -> usize { }
//! }
//! ```
//!
//! Initialisation and dropout both draw from the caller's RNG, so a model
//! built from a seed is fully reproducible.

pub mod activation;
pub mod attention;
pub mod decoder_layer;
pub mod dropout;
pub mod embedding;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod performer;
pub mod positional;

// Re-export main types for convenience
pub use activation::{gelu, gelu_scalar};
pub use attention::{
    build_attention, AttentionOutput, HeadProjections, MultiHeadAttention,
    ScaledDotProductAttention, StandardAttention, MASKED_SCORE,
};
pub use decoder_layer::DecoderLayer;
pub use dropout::Dropout;
pub use embedding::{SharedWeight, TokenEmbedding};
pub use feed_forward::FeedForward;
pub use layer_norm::{LayerNorm, LAYER_NORM_EPS};
pub use linear::{normal_init, uniform_init, Linear};
pub use performer::PerformerAttention;
pub use positional::PositionalEncoding;
