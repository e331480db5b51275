//! Language-Model Objective
//!
//! Next-token cross-entropy over a tied output head.
//!
//! ## Shifting
//!
//! Position `t` predicts the token at `t + 1`, so the last logit position and
//! the first label position are dropped before the loss:
//!
//! ```text
//! logits  [l0, l1, l2, l3]  →  [l0, l1, l2]
//! labels  [y0, y1, y2, y3]  →  [y1, y2, y3]
//! ```
//!
//! Batch and sequence dimensions are then flattened and every remaining
//! position contributes equally.
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! - **Perfect model**: perplexity = 1.0 (loss = 0)
//! - **Uniform guessing** over V tokens: perplexity = V (loss = ln V)
//!
//! Over an epoch the *losses* are averaged and only then exponentiated
//! ([`EpochLoss`]). Averaging per-batch perplexities would overweight bad
//! batches because `exp` is convex.
//!
//! ## Ignored positions
//!
//! No position is ignored by default. Callers that want padded targets
//! excluded pass `Some(pad_id)` (or any sentinel label) as `ignore_index`.

use crate::error::{expect_rank, expect_shape, Error, Result};
use crate::tensor::Tensor;

/// One language-modelling batch: `[batch][seq]` ids and labels
///
/// `labels` is usually `inputs_ids` itself; the shift happens in the loss.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LmBatch {
    pub inputs_ids: Vec<Vec<usize>>,
    pub labels: Vec<Vec<usize>>,
}

impl LmBatch {
    /// Batch whose labels are its own inputs
    pub fn from_inputs(inputs_ids: Vec<Vec<usize>>) -> Self {
        let labels = inputs_ids.clone();
        Self { inputs_ids, labels }
    }
}

/// Loss and perplexity of one step (or one averaged epoch)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub perplexity: f32,
}

impl StepMetrics {
    pub fn from_loss(loss: f32) -> Self {
        Self {
            loss,
            perplexity: perplexity(loss),
        }
    }
}

/// `exp(loss)`
pub fn perplexity(loss: f32) -> f32 {
    loss.exp()
}

/// Mean cross-entropy of `logits` (`[N, V]`) against `targets` (`N` ids)
///
/// Positions whose target equals `ignore_index` are skipped. Errors if a
/// target is outside the vocabulary or nothing is left to score.
pub fn cross_entropy(logits: &Tensor, targets: &[usize], ignore_index: Option<usize>) -> Result<f32> {
    expect_rank("cross-entropy logits", &logits.shape, 2)?;
    let (n, vocab_size) = (logits.shape[0], logits.shape[1]);
    expect_shape("cross-entropy targets", &[targets.len()], &[n])?;

    let mut total_loss = 0.0;
    let mut counted = 0usize;

    for (i, &target) in targets.iter().enumerate() {
        if Some(target) == ignore_index {
            continue;
        }
        if target >= vocab_size {
            return Err(Error::TokenOutOfRange {
                id: target,
                vocab_size,
            });
        }

        let logits_slice = logits.row(i);
        let max_logit = logits_slice
            .iter()
            .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_sum: f32 = logits_slice.iter().map(|&x| (x - max_logit).exp()).sum();

        let log_prob = (logits_slice[target] - max_logit) - exp_sum.ln();
        total_loss -= log_prob;
        counted += 1;
    }

    if counted == 0 {
        return Err(Error::NoTargets { seq_len: n });
    }
    Ok(total_loss / counted as f32)
}

/// Next-token cross-entropy of `logits` (`[B, S, V]`) against `[B][S]` labels
pub fn shifted_cross_entropy(
    logits: &Tensor,
    labels: &[Vec<usize>],
    ignore_index: Option<usize>,
) -> Result<f32> {
    expect_rank("logits", &logits.shape, 3)?;
    let (batch, seq_len, vocab_size) = (logits.shape[0], logits.shape[1], logits.shape[2]);
    let label_dims = crate::mask::batch_dims(labels)?;
    expect_shape("labels", &[label_dims.0, label_dims.1], &[batch, seq_len])?;
    if seq_len < 2 {
        return Err(Error::NoTargets { seq_len });
    }

    let kept = seq_len - 1;
    let mut shifted = Vec::with_capacity(batch * kept * vocab_size);
    let mut targets = Vec::with_capacity(batch * kept);
    for (b, row) in labels.iter().enumerate() {
        let start = b * seq_len * vocab_size;
        shifted.extend_from_slice(&logits.data[start..start + kept * vocab_size]);
        targets.extend_from_slice(&row[1..]);
    }

    cross_entropy(
        &Tensor::new(shifted, vec![batch * kept, vocab_size]),
        &targets,
        ignore_index,
    )
}

/// Running mean of per-batch losses
#[derive(Clone, Copy, Debug, Default)]
pub struct EpochLoss {
    total: f64,
    batches: usize,
}

impl EpochLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: f32) {
        self.total += loss as f64;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean loss so far, `None` before the first batch
    pub fn mean(&self) -> Option<f32> {
        (self.batches > 0).then(|| (self.total / self.batches as f64) as f32)
    }

    /// Average the losses, then exponentiate
    pub fn metrics(&self) -> Option<StepMetrics> {
        self.mean().map(StepMetrics::from_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(vec![3, 10]);
        let loss = cross_entropy(&logits, &[0, 4, 9], None).unwrap();
        assert!((loss - 10f32.ln()).abs() < 1e-5);
        assert!((perplexity(loss) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_confident_correct_logits_give_near_zero_loss() {
        let mut data = vec![0.0; 2 * 5];
        data[3] = 50.0;
        data[5 + 1] = 50.0;
        let loss = cross_entropy(&Tensor::new(data, vec![2, 5]), &[3, 1], None).unwrap();
        assert!(loss < 1e-4);
    }

    #[test]
    fn test_shift_drops_last_logit_and_first_label() {
        // Position 0 strongly predicts token 2, position 1 predicts token 3,
        // the last position predicts garbage that must be ignored
        let vocab = 4;
        let mut data = vec![0.0; 3 * vocab];
        data[2] = 40.0;
        data[vocab + 3] = 40.0;
        data[2 * vocab] = 40.0;
        let logits = Tensor::new(data, vec![1, 3, vocab]);

        let loss = shifted_cross_entropy(&logits, &[vec![1, 2, 3]], None).unwrap();
        assert!(loss < 1e-4);
    }

    #[test]
    fn test_ignore_index_skips_positions() {
        let vocab = 3;
        let mut data = vec![0.0; 3 * vocab];
        data[2] = 30.0; // position 0 predicts 2
        data[vocab + 1] = 30.0; // position 1 predicts 1, but its target is padding
        let logits = Tensor::new(data, vec![1, 3, vocab]);
        let labels = vec![vec![1, 2, 0]];

        let ignored = shifted_cross_entropy(&logits, &labels, Some(0)).unwrap();
        let counted = shifted_cross_entropy(&logits, &labels, None).unwrap();
        assert!(ignored < 1e-4);
        assert!(counted > 10.0);
    }

    #[test]
    fn test_all_targets_ignored_is_an_error() {
        let logits = Tensor::zeros(vec![1, 3, 4]);
        let err = shifted_cross_entropy(&logits, &[vec![0, 0, 0]], Some(0)).unwrap_err();
        assert!(matches!(err, Error::NoTargets { .. }));
    }

    #[test]
    fn test_single_token_sequences_have_no_targets() {
        let logits = Tensor::zeros(vec![2, 1, 4]);
        assert!(shifted_cross_entropy(&logits, &[vec![1], vec![2]], None).is_err());
    }

    #[test]
    fn test_label_shape_mismatch() {
        let logits = Tensor::zeros(vec![2, 3, 4]);
        let err = shifted_cross_entropy(&logits, &[vec![1, 2, 3]], None).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn test_epoch_averages_loss_before_exponentiating() {
        let mut epoch = EpochLoss::new();
        assert!(epoch.metrics().is_none());
        epoch.push(1.0);
        epoch.push(3.0);

        let metrics = epoch.metrics().unwrap();
        assert!((metrics.loss - 2.0).abs() < 1e-6);
        assert!((metrics.perplexity - 2f32.exp()).abs() < 1e-4);
        // Not the mean of the perplexities
        let mean_ppl = (1f32.exp() + 3f32.exp()) / 2.0;
        assert!((metrics.perplexity - mean_ppl).abs() > 1.0);
    }
}
