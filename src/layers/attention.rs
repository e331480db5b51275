//! Attention
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! scores       = (Q @ K^T) / √d_k
//! scores[mask] = MASKED_SCORE
//! weights      = dropout(softmax(scores))
//! output       = weights @ V
//! ```
//!
//! Dividing by √d_k keeps the dot products from pushing softmax into its
//! saturated region as the head width grows.
//!
//! ## Multi-Head Attention
//!
//! Q, K and V are projected independently to `d_model`, split into `n_heads`
//! heads of width `d_k = d_model / n_heads`, attended per head in parallel,
//! merged back to `d_model` and mixed by a final projection:
//!
//! ```text
//! [B, S, d_model] → W_q/W_k/W_v → [B, H, S, d_k] → kernel → [B, H, S, d_k]
//!                 → merge → [B, S, d_model] → W_o → [B, S, d_model]
//! ```
//!
//! The [`MultiHeadAttention`] trait is the seam for alternative kernels. Every
//! implementation returns an output shaped like Q and weights shaped
//! `[B, H, S_q, S_k]`, so attention maps can be inspected the same way
//! whichever kernel a model was built with.

use crate::config::{AttentionKind, Config};
use crate::error::{expect_rank, expect_shape, Result};
use crate::layers::dropout::Dropout;
use crate::layers::linear::Linear;
use crate::layers::performer::PerformerAttention;
use crate::mask::Mask;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use std::fmt::Debug;

/// Score written into masked (query, key) pairs before softmax
///
/// `-sqrt(f32::MAX)`: `exp` of it underflows to exactly zero, yet subtracting
/// any finite row maximum from it cannot overflow.
pub const MASKED_SCORE: f32 = -1.844_674_4e19;

/// Result of an attention call
#[derive(Clone, Debug)]
pub struct AttentionOutput {
    /// Same shape as the query input
    pub output: Tensor,
    /// `[batch, n_heads, q_len, k_len]`
    pub weights: Tensor,
}

/// Polymorphic multi-head attention
///
/// Implementations project, attend and reassemble; they differ only in how
/// the per-head attention is computed.
pub trait MultiHeadAttention: Debug {
    /// Attend `q` (`[B, S_q, d_model]`) over `k`/`v` (`[B, S_k, d_model]`)
    ///
    /// `mask` is `[B, S_q, S_k]`, `true` meaning "do not attend".
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Mask,
        rng: &mut StdRng,
    ) -> Result<AttentionOutput>;

    /// Switch dropout between training and inference behaviour
    fn set_training(&mut self, training: bool);

    /// Which implementation this is
    fn kind(&self) -> AttentionKind;

    /// Learnable values held by this layer
    fn num_parameters(&self) -> usize;
}

/// Build the attention implementation a config selects
pub fn build_attention(config: &Config, rng: &mut StdRng) -> Box<dyn MultiHeadAttention> {
    match config.attention {
        AttentionKind::Standard => Box::new(StandardAttention::new(
            config.d_model,
            config.n_heads,
            config.attn_pdrop,
            rng,
        )),
        AttentionKind::Performer { features } => Box::new(PerformerAttention::new(
            config.d_model,
            config.n_heads,
            features,
            config.attn_pdrop,
            rng,
        )),
    }
}

//
// ============================================================================
// SCALED DOT-PRODUCT KERNEL
// ============================================================================
//

/// Softmax attention over already-split heads
#[derive(Clone, Debug)]
pub struct ScaledDotProductAttention {
    pub d_k: usize,
    pub dropout: Dropout,
}

impl ScaledDotProductAttention {
    pub fn new(d_k: usize, attn_pdrop: f32) -> Self {
        Self {
            d_k,
            dropout: Dropout::new(attn_pdrop),
        }
    }

    /// # Arguments
    ///
    /// * `q` - `[B, H, S_q, d_k]`
    /// * `k` - `[B, H, S_k, d_k]`
    /// * `v` - `[B, H, S_k, d_v]`
    /// * `mask` - `[B, H, S_q, S_k]`
    ///
    /// # Returns
    ///
    /// `(output [B, H, S_q, d_v], weights [B, H, S_q, S_k])`, the weights
    /// taken after dropout.
    ///
    /// A fully masked row (a pad query preceded only by padding) has no
    /// defined softmax; its weights and output are set to zero so that no
    /// masked key ever receives weight.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Mask,
        rng: &mut StdRng,
    ) -> Result<(Tensor, Tensor)> {
        expect_rank("attention query heads", &q.shape, 4)?;
        expect_rank("attention key heads", &k.shape, 4)?;
        expect_rank("attention value heads", &v.shape, 4)?;
        expect_shape("attention key heads", &k.shape[..2], &q.shape[..2])?;
        expect_shape("attention key width", &k.shape[3..], &[self.d_k])?;
        expect_shape("attention query width", &q.shape[3..], &[self.d_k])?;
        expect_shape("attention value heads", &v.shape[..3], &k.shape[..3])?;
        expect_shape(
            "attention mask",
            &mask.shape,
            &[q.shape[0], q.shape[1], q.shape[2], k.shape[2]],
        )?;

        let scale = 1.0 / (self.d_k as f32).sqrt();
        let scores = q.matmul_transposed(k).mul_scalar(scale);
        let scores = scores.masked_fill(mask, MASKED_SCORE);

        let mut weights = scores.softmax(-1);
        let k_len = k.shape[2];
        for (row, flags) in weights
            .data
            .chunks_mut(k_len.max(1))
            .zip(mask.data.chunks(k_len.max(1)))
        {
            if flags.iter().all(|&m| m) {
                row.iter_mut().for_each(|w| *w = 0.0);
            }
        }
        let weights = self.dropout.forward(&weights, rng);

        Ok((weights.matmul(v), weights))
    }
}

//
// ============================================================================
// PROJECTIONS SHARED BY ALL IMPLEMENTATIONS
// ============================================================================
//

/// Q/K/V input projections, head split/merge and the output mixing projection
#[derive(Clone, Debug)]
pub struct HeadProjections {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    pub n_heads: usize,
    pub d_k: usize,
}

/// Per-head views of the projected inputs
pub struct ProjectedHeads {
    /// `[B, H, S_q, d_k]`
    pub q: Tensor,
    /// `[B, H, S_k, d_k]`
    pub k: Tensor,
    /// `[B, H, S_k, d_k]`
    pub v: Tensor,
    /// Mask repeated across heads, `[B, H, S_q, S_k]`
    pub mask: Mask,
}

impl HeadProjections {
    /// # Panics
    ///
    /// Panics if `n_heads` does not divide `d_model`; [`Config::validate`]
    /// rejects such configs before layers are built.
    pub fn new(d_model: usize, n_heads: usize, rng: &mut StdRng) -> Self {
        assert!(
            n_heads > 0 && d_model % n_heads == 0,
            "d_model ({}) must be divisible by n_heads ({})",
            d_model,
            n_heads
        );
        Self {
            w_q: Linear::uniform(d_model, d_model, rng),
            w_k: Linear::uniform(d_model, d_model, rng),
            w_v: Linear::uniform(d_model, d_model, rng),
            w_o: Linear::uniform(d_model, d_model, rng),
            n_heads,
            d_k: d_model / n_heads,
        }
    }

    pub fn d_model(&self) -> usize {
        self.n_heads * self.d_k
    }

    pub fn num_parameters(&self) -> usize {
        self.w_q.num_parameters()
            + self.w_k.num_parameters()
            + self.w_v.num_parameters()
            + self.w_o.num_parameters()
    }

    /// Validate shapes, project Q/K/V and split them into heads
    pub fn project(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: &Mask) -> Result<ProjectedHeads> {
        let d_model = self.d_model();
        expect_rank("query", &q.shape, 3)?;
        expect_rank("key", &k.shape, 3)?;
        expect_rank("value", &v.shape, 3)?;
        expect_shape("query width", &q.shape[2..], &[d_model])?;
        expect_shape("key", &k.shape, &[q.shape[0], k.shape[1], d_model])?;
        expect_shape("value", &v.shape, &k.shape)?;
        expect_rank("attention mask", &mask.shape, 3)?;
        expect_shape("attention mask", &mask.shape, &[q.shape[0], q.shape[1], k.shape[1]])?;

        Ok(ProjectedHeads {
            q: self.split_heads(&self.w_q.forward(q)?),
            k: self.split_heads(&self.w_k.forward(k)?),
            v: self.split_heads(&self.w_v.forward(v)?),
            mask: mask.expand_heads(self.n_heads),
        })
    }

    /// Merge `[B, H, S, d_k]` back to `[B, S, d_model]` and apply `W_o`
    pub fn merge(&self, heads: &Tensor) -> Result<Tensor> {
        self.w_o.forward(&self.merge_heads(heads))
    }

    /// [batch, seq, d_model] -> [batch, n_heads, seq, d_k]
    fn split_heads(&self, x: &Tensor) -> Tensor {
        let (batch_size, seq_len) = (x.shape[0], x.shape[1]);
        let mut result = vec![0.0; x.numel()];

        for b in 0..batch_size {
            for s in 0..seq_len {
                for h in 0..self.n_heads {
                    let src = (b * seq_len + s) * self.d_model() + h * self.d_k;
                    let dst = ((b * self.n_heads + h) * seq_len + s) * self.d_k;
                    result[dst..dst + self.d_k].copy_from_slice(&x.data[src..src + self.d_k]);
                }
            }
        }

        Tensor::new(result, vec![batch_size, self.n_heads, seq_len, self.d_k])
    }

    /// [batch, n_heads, seq, d_k] -> [batch, seq, d_model]
    fn merge_heads(&self, x: &Tensor) -> Tensor {
        let (batch_size, seq_len) = (x.shape[0], x.shape[2]);
        let d_model = self.d_model();
        let mut result = vec![0.0; x.numel()];

        for b in 0..batch_size {
            for h in 0..self.n_heads {
                for s in 0..seq_len {
                    let src = ((b * self.n_heads + h) * seq_len + s) * self.d_k;
                    let dst = (b * seq_len + s) * d_model + h * self.d_k;
                    result[dst..dst + self.d_k].copy_from_slice(&x.data[src..src + self.d_k]);
                }
            }
        }

        Tensor::new(result, vec![batch_size, seq_len, d_model])
    }
}

//
// ============================================================================
// STANDARD MULTI-HEAD ATTENTION
// ============================================================================
//

/// Exact multi-head attention backed by [`ScaledDotProductAttention`]
#[derive(Clone, Debug)]
pub struct StandardAttention {
    pub projections: HeadProjections,
    pub kernel: ScaledDotProductAttention,
}

impl StandardAttention {
    pub fn new(d_model: usize, n_heads: usize, attn_pdrop: f32, rng: &mut StdRng) -> Self {
        let projections = HeadProjections::new(d_model, n_heads, rng);
        let kernel = ScaledDotProductAttention::new(projections.d_k, attn_pdrop);
        Self {
            projections,
            kernel,
        }
    }
}

impl MultiHeadAttention for StandardAttention {
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Mask,
        rng: &mut StdRng,
    ) -> Result<AttentionOutput> {
        let heads = self.projections.project(q, k, v, mask)?;
        let (attn, weights) = self
            .kernel
            .forward(&heads.q, &heads.k, &heads.v, &heads.mask, rng)?;
        let output = self.projections.merge(&attn)?;
        Ok(AttentionOutput { output, weights })
    }

    fn set_training(&mut self, training: bool) {
        self.kernel.dropout.training = training;
    }

    fn kind(&self) -> AttentionKind {
        AttentionKind::Standard
    }

    fn num_parameters(&self) -> usize {
        self.projections.num_parameters()
    }
}
