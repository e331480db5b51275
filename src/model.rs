//! GPT-Style Decoder and Language Model
//!
//! ## Architecture Overview
//!
//! ```text
//! Input ids [batch, seq]
//!     ↓
//! Token Embedding × √d_model      positions: t+1, pads → 0
//!     + Sinusoidal table[positions]
//!     ↓ embedding dropout
//! Decoder Layer 1 ──► attention weights [batch, heads, seq, seq]
//!     ↓
//!     ...                (one shared padding/causal mask)
//!     ↓
//! Decoder Layer N ──► attention weights
//!     ↓
//! hidden @ Eᵀ → logits [batch, seq, vocab]    (E is the embedding table)
//! ```
//!
//! The output projection has no weight of its own: [`TiedLmHead`] holds a
//! second handle to the embedding table, so any update made through
//! [`LanguageModel::embedding_weight_mut`] is seen by both ends.
//!
//! ## Example
//!
//! ```rust
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use verso::{Config, LanguageModel};
//!
//! let config = Config::tiny(100);
//! let mut model = LanguageModel::new(&config).unwrap();
//! model.eval();
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let (logits, weights) = model.forward(&[vec![5, 6, 7, 0]], &mut rng).unwrap();
//! assert_eq!(logits.shape, vec![1, 4, 100]);
//! assert_eq!(weights.len(), config.n_layers);
//! ```

use crate::config::Config;
use crate::error::{expect_rank, expect_shape, Error, Result};
use crate::layers::{DecoderLayer, PositionalEncoding, SharedWeight, TokenEmbedding};
use crate::loss::{shifted_cross_entropy, EpochLoss, LmBatch, StepMetrics};
use crate::mask::{batch_dims, positions, Mask};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefMut;

/// Final hidden state plus one attention-weight tensor per layer
#[derive(Clone, Debug)]
pub struct DecoderOutput {
    /// `[batch, seq, d_model]`
    pub hidden: Tensor,
    /// `n_layers` tensors of shape `[batch, n_heads, seq, seq]`, in layer order
    pub attention_weights: Vec<Tensor>,
}

//
// ============================================================================
// DECODER STACK
// ============================================================================
//

/// Embedding, positional encoding and the stack of decoder layers
#[derive(Debug)]
pub struct TransformerDecoder {
    pub config: Config,
    pub embedding: TokenEmbedding,
    pub positional: PositionalEncoding,
    pub layers: Vec<DecoderLayer>,
}

impl TransformerDecoder {
    /// Validate `config` and build every weight from `rng`
    pub fn new(config: &Config, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;

        let embedding = TokenEmbedding::new(config.vocab_size, config.d_model, rng);
        let positional = PositionalEncoding::new(config.d_model, config.max_len, config.embd_pdrop);
        let layers = (0..config.n_layers)
            .map(|_| DecoderLayer::new(config, rng))
            .collect();

        Ok(Self {
            config: config.clone(),
            embedding,
            positional,
            layers,
        })
    }

    /// # Arguments
    ///
    /// * `ids` - `[batch][seq]` token ids; every row the same length
    pub fn forward(&self, ids: &[Vec<usize>], rng: &mut StdRng) -> Result<DecoderOutput> {
        let (batch, seq_len) = batch_dims(ids)?;
        if seq_len > self.config.max_seq_len {
            return Err(Error::SequenceTooLong {
                seq_len,
                max_seq_len: self.config.max_seq_len,
            });
        }

        // One mask for the whole stack
        let mask = Mask::attention(ids, self.config.pad_id)?;
        let positions = positions(ids, self.config.pad_id)?;
        log::trace!("decoder forward: batch={} seq={}", batch, seq_len);

        let scale = (self.config.d_model as f32).sqrt();
        let tokens = self.embedding.forward(ids)?.mul_scalar(scale);
        let mut x = self.positional.apply(&tokens, &positions, rng)?;

        let mut attention_weights = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (h, weights) = layer.forward(&x, &mask, rng)?;
            x = h;
            attention_weights.push(weights);
        }

        Ok(DecoderOutput {
            hidden: x,
            attention_weights,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.positional.dropout.training = training;
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    /// Learnable values: embedding table plus every layer (the positional
    /// table is fixed and not counted)
    pub fn num_parameters(&self) -> usize {
        let embedding = self.config.vocab_size * self.config.d_model;
        embedding + self.layers.iter().map(DecoderLayer::num_parameters).sum::<usize>()
    }
}

/// Thin wrapper exposing the decoder as a hidden-state model
#[derive(Debug)]
pub struct Gpt {
    pub decoder: TransformerDecoder,
}

impl Gpt {
    pub fn new(config: &Config, rng: &mut StdRng) -> Result<Self> {
        Ok(Self {
            decoder: TransformerDecoder::new(config, rng)?,
        })
    }

    pub fn forward(&self, ids: &[Vec<usize>], rng: &mut StdRng) -> Result<DecoderOutput> {
        self.decoder.forward(ids, rng)
    }
}

//
// ============================================================================
// TIED OUTPUT HEAD
// ============================================================================
//

/// Vocabulary projection reading the embedding table in place
#[derive(Debug)]
pub struct TiedLmHead {
    weight: SharedWeight,
}

impl TiedLmHead {
    pub fn new(weight: SharedWeight) -> Self {
        Self { weight }
    }

    /// The table this head projects onto
    pub fn weight(&self) -> &SharedWeight {
        &self.weight
    }

    /// `[batch, seq, d_model]` → `[batch, seq, vocab]` via `hidden @ Eᵀ`
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        expect_rank("lm head input", &hidden.shape, 3)?;
        let (batch, seq_len, d_model) = (hidden.shape[0], hidden.shape[1], hidden.shape[2]);

        let weight = self.weight.borrow();
        expect_shape("lm head input width", &[d_model], &weight.shape[1..])?;
        let vocab_size = weight.shape[0];

        let flat = hidden.reshape(&[batch * seq_len, d_model]);
        Ok(flat
            .matmul_transposed(&weight)
            .reshape(&[batch, seq_len, vocab_size]))
    }
}

//
// ============================================================================
// LANGUAGE MODEL
// ============================================================================
//

/// Decoder plus tied vocabulary head
///
/// Starts in training mode. Call [`eval`](Self::eval) to disable dropout.
#[derive(Debug)]
pub struct LanguageModel {
    pub gpt: Gpt,
    pub head: TiedLmHead,
    training: bool,
}

impl LanguageModel {
    /// Build a model whose weights are drawn from `config.seed`
    pub fn new(config: &Config) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(config, &mut rng)
    }

    /// Build a model drawing its weights from `rng`
    pub fn with_rng(config: &Config, rng: &mut StdRng) -> Result<Self> {
        let gpt = Gpt::new(config, rng)?;
        let head = TiedLmHead::new(gpt.decoder.embedding.share());
        let model = Self {
            gpt,
            head,
            training: true,
        };

        log::debug!(
            "built language model: {} layers, d_model={}, heads={}, attention={:?}, {} parameters",
            config.n_layers,
            config.d_model,
            config.n_heads,
            config.attention,
            model.count_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &Config {
        &self.gpt.decoder.config
    }

    /// `(logits [batch, seq, vocab], per-layer attention weights)`
    pub fn forward(&self, ids: &[Vec<usize>], rng: &mut StdRng) -> Result<(Tensor, Vec<Tensor>)> {
        let out = self.gpt.forward(ids, rng)?;
        let logits = self.head.forward(&out.hidden)?;
        Ok((logits, out.attention_weights))
    }

    /// Enable dropout
    pub fn train(&mut self) {
        self.set_training(true);
    }

    /// Disable dropout; forward calls become deterministic
    pub fn eval(&mut self) {
        self.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.gpt.decoder.set_training(training);
    }

    /// Handle to the table shared by the embedding and the output head
    pub fn tied_weight(&self) -> SharedWeight {
        self.head.weight().clone()
    }

    /// The one place the tied table may be written
    ///
    /// # Panics
    ///
    /// Panics if a handle from [`tied_weight`](Self::tied_weight) is
    /// currently borrowed.
    pub fn embedding_weight_mut(&self) -> RefMut<'_, Tensor> {
        self.gpt.decoder.embedding.weight_mut()
    }

    /// Learnable values, counting the tied table once
    pub fn count_parameters(&self) -> usize {
        self.gpt.decoder.num_parameters()
    }

    /// Forward a batch and score it with the shifted objective
    ///
    /// Runs in whatever mode the model is in; no position is ignored.
    pub fn step(&self, batch: &LmBatch, rng: &mut StdRng) -> Result<StepMetrics> {
        self.step_ignoring(batch, None, rng)
    }

    /// Like [`step`](Self::step), skipping targets equal to `ignore_index`
    pub fn step_ignoring(
        &self,
        batch: &LmBatch,
        ignore_index: Option<usize>,
        rng: &mut StdRng,
    ) -> Result<StepMetrics> {
        let (logits, _) = self.forward(&batch.inputs_ids, rng)?;
        let loss = shifted_cross_entropy(&logits, &batch.labels, ignore_index)?;
        log::trace!("step loss={:.4}", loss);
        Ok(StepMetrics::from_loss(loss))
    }

    /// Score every batch in eval mode and average the losses before
    /// exponentiating; the previous mode is restored afterwards
    pub fn validate(&mut self, batches: &[LmBatch], rng: &mut StdRng) -> Result<StepMetrics> {
        let was_training = self.training;
        self.eval();
        let scored = self.score_batches(batches, rng);
        self.set_training(was_training);

        let epoch = scored?;
        let metrics = epoch.metrics().ok_or(Error::EmptyBatch)?;
        log::debug!(
            "validation over {} batches: loss={:.4} perplexity={:.2}",
            epoch.batches(),
            metrics.loss,
            metrics.perplexity
        );
        Ok(metrics)
    }

    fn score_batches(&self, batches: &[LmBatch], rng: &mut StdRng) -> Result<EpochLoss> {
        let mut epoch = EpochLoss::new();
        for batch in batches {
            epoch.push(self.step(batch, rng)?.loss);
        }
        Ok(epoch)
    }

    /// Extend `prompt` by up to `max_new_tokens` ids
    ///
    /// Each step feeds the most recent `max_seq_len` ids back through the
    /// model. `temperature == 0` picks the most likely token; otherwise the
    /// next id is sampled from `softmax(logits / temperature)`.
    pub fn generate(
        &self,
        prompt: &[usize],
        max_new_tokens: usize,
        temperature: f32,
        rng: &mut StdRng,
    ) -> Result<Vec<usize>> {
        if prompt.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let max_seq_len = self.config().max_seq_len;
        let mut tokens = prompt.to_vec();

        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(max_seq_len);
            let context = vec![tokens[start..].to_vec()];
            let (logits, _) = self.forward(&context, rng)?;

            let last = context[0].len() - 1;
            let next = if temperature <= 0.0 {
                logits.argmax_last()[last]
            } else {
                sample_from_logits(logits.row(last), temperature, rng)
            };
            tokens.push(next);
        }

        Ok(tokens)
    }
}

fn sample_from_logits(logits: &[f32], temperature: f32, rng: &mut StdRng) -> usize {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_vals: Vec<f32> = logits
        .iter()
        .map(|&x| ((x - max_logit) / temperature).exp())
        .collect();
    let sum: f32 = exp_vals.iter().sum();

    let rand_val = rng.random::<f32>() * sum;
    let mut cumsum = 0.0;
    for (i, &p) in exp_vals.iter().enumerate() {
        cumsum += p;
        if rand_val < cumsum {
            return i;
        }
    }
    exp_vals.len() - 1
}
