//! Performer Attention
//!
//! Approximates softmax attention with positive random features (FAVOR+).
//! The exponential kernel is factorised as
//!
//! ```text
//! exp(q·k / √d_k) ≈ φ(q) · φ(k)
//!
//! φ(x) = exp(Ω x' - |x'|² / 2) / √m,    x' = x / d_k^¼
//! ```
//!
//! where `Ω` is an `[m, d_k]` matrix of Gaussian features drawn once at
//! construction. Because attention becomes a product of feature maps, the
//! causal sum over keys can be carried as a running prefix:
//!
//! ```text
//! S_i = Σ_{j ≤ i} φ(k_j) ⊗ v_j      z_i = Σ_{j ≤ i} φ(k_j)
//! out_i = φ(q_i) S_i / (φ(q_i) · z_i)
//! ```
//!
//! which costs `O(S · m · d_k)` per head instead of `O(S² · d_k)`.
//!
//! The prefix form applies whenever the mask is "causal OR key padding", which
//! is what the decoder builds. Any other mask falls back to summing the
//! visible pairs explicitly. Both paths produce the same numbers.
//!
//! The implied normalised weights `φ(q_i)·φ(k_j) / (φ(q_i)·z_i)` are still
//! materialised as `[B, H, S, S]` so attention maps can be inspected exactly
//! as with the standard kernel. In training mode with `attn_pdrop > 0`,
//! dropout is applied to those weights and the output is recomputed from the
//! dropped weights, so the probability means the same for both kernels.
//!
//! ## Numerical range
//!
//! Each feature's logit is shifted by `c_f = |ω_f|² / 2`, subtracted on the
//! key side and added back on the query side:
//!
//! ```text
//! key:    ω_f·k' - |k'|²/2 - c_f  =  -|ω_f - k'|² / 2   ≤ 0
//! query:  ω_f·q' - |q'|²/2 + c_f  - max_f(...)           ≤ 0
//! ```
//!
//! The product of the two is unchanged, keys never depend on other keys, and
//! neither side can overflow. Key features still shrink like `exp(-d_k / 2)`,
//! so features and prefix sums are held in `f64`.

use crate::config::AttentionKind;
use crate::error::Result;
use crate::layers::attention::{AttentionOutput, HeadProjections, MultiHeadAttention};
use crate::layers::dropout::Dropout;
use crate::layers::linear::normal_init;
use crate::mask::Mask;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Random feature count used when none is configured: `d_k · ln(d_k)`, at least `d_k`
pub fn default_features(d_k: usize) -> usize {
    let d = d_k as f32;
    ((d * d.ln()).round() as usize).max(d_k).max(1)
}

/// Multi-head attention with a positive-random-feature kernel
#[derive(Clone, Debug)]
pub struct PerformerAttention {
    pub projections: HeadProjections,
    /// Gaussian projection `Ω`: [n_features, d_k]
    pub omega: Tensor,
    pub dropout: Dropout,
    /// `|ω_f|² / 2` for every feature
    half_sq_norms: Vec<f64>,
    configured_features: Option<usize>,
}

/// Per-head result: output `[S_q, d_k]`, weights `[S_q, S_k]`, degenerate rows
type HeadResult = (Vec<f32>, Vec<f32>, usize);

impl PerformerAttention {
    pub fn new(
        d_model: usize,
        n_heads: usize,
        features: Option<usize>,
        attn_pdrop: f32,
        rng: &mut StdRng,
    ) -> Self {
        let projections = HeadProjections::new(d_model, n_heads, rng);
        let d_k = projections.d_k;
        let m = features.unwrap_or_else(|| default_features(d_k));
        let omega = Tensor::new(normal_init(m * d_k, 1.0, rng), vec![m, d_k]);
        let half_sq_norms = omega
            .data
            .chunks(d_k.max(1))
            .map(|w| 0.5 * w.iter().map(|&x| x as f64 * x as f64).sum::<f64>())
            .collect();
        Self {
            projections,
            omega,
            dropout: Dropout::new(attn_pdrop),
            half_sq_norms,
            configured_features: features,
        }
    }

    pub fn n_features(&self) -> usize {
        self.omega.shape[0]
    }

    /// φ applied to every row of a `[rows, d_k]` slice, giving `[rows, m]`
    ///
    /// Keys subtract `c_f` per feature, queries add it back and then subtract
    /// their own row maximum. Neither shift looks at any other row, so a
    /// key's features never depend on later keys.
    fn feature_map(&self, x: &[f32], rows: usize, is_query: bool) -> Vec<f64> {
        let d_k = self.projections.d_k;
        let m = self.n_features();
        let scale = (d_k as f64).powf(-0.25);
        let sign = if is_query { 1.0 } else { -1.0 };

        let mut logits = vec![0.0; rows * m];
        for r in 0..rows {
            let xr: Vec<f64> = x[r * d_k..(r + 1) * d_k]
                .iter()
                .map(|&v| v as f64 * scale)
                .collect();
            let half_norm = 0.5 * dot(&xr, &xr);
            for f in 0..m {
                let w = &self.omega.data[f * d_k..(f + 1) * d_k];
                let projected: f64 = w.iter().zip(&xr).map(|(&a, b)| a as f64 * b).sum();
                logits[r * m + f] = projected - half_norm + sign * self.half_sq_norms[f];
            }
        }

        let norm = 1.0 / (m as f64).sqrt();
        for row in logits.chunks_mut(m.max(1)) {
            let offset = if is_query {
                row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b))
            } else {
                0.0
            };
            for v in row.iter_mut() {
                *v = (*v - offset).exp() * norm;
            }
        }
        logits
    }

    /// Attend one (batch, head) pair
    ///
    /// Rows without any visible key are zero, as with the exact kernel; rows
    /// whose normaliser underflowed despite visible keys are zero and counted.
    fn attend_head(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        mask: &[bool],
        (q_len, k_len): (usize, usize),
    ) -> HeadResult {
        let d_k = self.projections.d_k;
        let m = self.n_features();

        let phi_q = self.feature_map(q, q_len, true);
        let mut phi_k = self.feature_map(k, k_len, false);

        let key_padding = causal_key_padding(mask, q_len, k_len);
        if let Some(pad) = &key_padding {
            for j in (0..k_len).filter(|&j| pad[j]) {
                phi_k[j * m..(j + 1) * m].iter_mut().for_each(|x| *x = 0.0);
            }
        }

        let mut output = vec![0.0; q_len * d_k];
        let mut weights = vec![0.0; q_len * k_len];
        let mut degenerate = 0;

        let mut kv = vec![0.0f64; m * d_k];
        let mut z = vec![0.0f64; m];
        let mut out = vec![0.0f64; d_k];

        for i in 0..q_len {
            let fq = &phi_q[i * m..(i + 1) * m];
            out.iter_mut().for_each(|o| *o = 0.0);

            let denom = match key_padding {
                Some(_) => {
                    // Fold key i into the running prefix before reading it
                    let fk = &phi_k[i * m..(i + 1) * m];
                    let vi = &v[i * d_k..(i + 1) * d_k];
                    for f in 0..m {
                        z[f] += fk[f];
                        for (acc, &vv) in kv[f * d_k..(f + 1) * d_k].iter_mut().zip(vi) {
                            *acc += fk[f] * vv as f64;
                        }
                    }
                    for f in 0..m {
                        for (o, &s) in out.iter_mut().zip(&kv[f * d_k..(f + 1) * d_k]) {
                            *o += fq[f] * s;
                        }
                    }
                    dot(fq, &z)
                }
                None => {
                    let mut denom = 0.0;
                    for j in (0..k_len).filter(|&j| !mask[i * k_len + j]) {
                        let s = dot(fq, &phi_k[j * m..(j + 1) * m]);
                        denom += s;
                        for (o, &vv) in out.iter_mut().zip(&v[j * d_k..(j + 1) * d_k]) {
                            *o += s * vv as f64;
                        }
                    }
                    denom
                }
            };

            let visible = mask[i * k_len..(i + 1) * k_len].iter().any(|&m| !m);
            if !(visible && denom > 0.0 && denom.is_finite()) {
                if visible {
                    degenerate += 1;
                }
                continue;
            }

            for (dst, &o) in output[i * d_k..(i + 1) * d_k].iter_mut().zip(&out) {
                *dst = (o / denom) as f32;
            }
            for j in (0..k_len).filter(|&j| !mask[i * k_len + j]) {
                weights[i * k_len + j] = (dot(fq, &phi_k[j * m..(j + 1) * m]) / denom) as f32;
            }
        }

        (output, weights, degenerate)
    }
}

impl MultiHeadAttention for PerformerAttention {
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Mask,
        rng: &mut StdRng,
    ) -> Result<AttentionOutput> {
        let heads = self.projections.project(q, k, v, mask)?;
        let (batch, n_heads, q_len, d_k) = (
            heads.q.shape[0],
            heads.q.shape[1],
            heads.q.shape[2],
            heads.q.shape[3],
        );
        let k_len = heads.k.shape[2];

        let per_head: Vec<HeadResult> = (0..batch * n_heads)
            .into_par_iter()
            .map(|bh| {
                self.attend_head(
                    &heads.q.data[bh * q_len * d_k..(bh + 1) * q_len * d_k],
                    &heads.k.data[bh * k_len * d_k..(bh + 1) * k_len * d_k],
                    &heads.v.data[bh * k_len * d_k..(bh + 1) * k_len * d_k],
                    &heads.mask.data[bh * q_len * k_len..(bh + 1) * q_len * k_len],
                    (q_len, k_len),
                )
            })
            .collect();

        let mut out = Vec::with_capacity(batch * n_heads * q_len * d_k);
        let mut weights = Vec::with_capacity(batch * n_heads * q_len * k_len);
        let mut degenerate = 0;
        for (o, w, d) in per_head {
            out.extend(o);
            weights.extend(w);
            degenerate += d;
        }
        if degenerate > 0 {
            log::warn!(
                "performer attention: normaliser vanished for {} query rows; their output is zero",
                degenerate
            );
        }

        let weights = Tensor::new(weights, vec![batch, n_heads, q_len, k_len]);
        let (attn, weights) = if self.dropout.is_identity() {
            (Tensor::new(out, vec![batch, n_heads, q_len, d_k]), weights)
        } else {
            let dropped = self.dropout.forward(&weights, rng);
            (dropped.matmul(&heads.v), dropped)
        };

        let output = self.projections.merge(&attn)?;
        Ok(AttentionOutput { output, weights })
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }

    fn kind(&self) -> AttentionKind {
        AttentionKind::Performer {
            features: self.configured_features,
        }
    }

    fn num_parameters(&self) -> usize {
        self.projections.num_parameters()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// If `mask` (`[q_len, k_len]`) is exactly "causal OR key padding", return the
/// padded keys
fn causal_key_padding(mask: &[bool], q_len: usize, k_len: usize) -> Option<Vec<bool>> {
    if q_len != k_len || q_len == 0 {
        return None;
    }
    // The last query sees every key the causal mask allows
    let pad = mask[(q_len - 1) * k_len..].to_vec();
    for i in 0..q_len {
        for j in 0..k_len {
            if mask[i * k_len + j] != (j > i || pad[j]) {
                return None;
            }
        }
    }
    Some(pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::attention::StandardAttention;
    use rand::SeedableRng;

    fn sample(shape: Vec<usize>, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = shape.iter().product();
        Tensor::new(normal_init(n, 1.0, &mut rng), shape)
    }

    #[test]
    fn test_default_feature_count() {
        assert_eq!(default_features(8), 17);
        assert_eq!(default_features(1), 1);
        assert_eq!(default_features(2), 2);
    }

    #[test]
    fn test_shapes_match_standard_contract() {
        let mut rng = StdRng::seed_from_u64(0);
        let attn = PerformerAttention::new(16, 4, None, 0.0, &mut rng);
        let x = sample(vec![2, 6, 16], 1);
        let mask = Mask::attention(&[vec![1, 2, 3, 4, 0, 0], vec![5, 6, 7, 8, 9, 1]], 0).unwrap();

        let out = attn.forward(&x, &x, &x, &mask, &mut rng).unwrap();
        assert_eq!(out.output.shape, vec![2, 6, 16]);
        assert_eq!(out.weights.shape, vec![2, 4, 6, 6]);
    }

    #[test]
    fn test_weights_are_causal_and_normalised() {
        let mut rng = StdRng::seed_from_u64(0);
        let attn = PerformerAttention::new(8, 2, Some(32), 0.0, &mut rng);
        let x = sample(vec![1, 5, 8], 2);
        let ids = vec![vec![3, 4, 5, 0, 0]];
        let mask = Mask::attention(&ids, 0).unwrap();

        let out = attn.forward(&x, &x, &x, &mask, &mut rng).unwrap();
        for h in 0..2 {
            for i in 0..5 {
                let row = out.weights.row(h * 5 + i);
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-4, "row {} sums to {}", i, sum);
                for j in 0..5 {
                    if j > i || ids[0][j] == 0 {
                        assert_eq!(row[j], 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_prefix_path_matches_direct_sum() {
        let mut rng = StdRng::seed_from_u64(0);
        let attn = PerformerAttention::new(8, 2, Some(16), 0.0, &mut rng);
        let mask = Mask::attention(&[vec![1, 2, 3, 0]], 0).unwrap();
        let q = sample(vec![4, 4], 3);
        let k = sample(vec![4, 4], 4);
        let v = sample(vec![4, 4], 5);

        assert!(causal_key_padding(&mask.data, 4, 4).is_some());
        let (out, weights, degenerate) =
            attn.attend_head(&q.data, &k.data, &v.data, &mask.data, (4, 4));
        assert_eq!(degenerate, 0);

        let phi_q = attn.feature_map(&q.data, 4, true);
        let phi_k = attn.feature_map(&k.data, 4, false);
        for i in 0..4 {
            let fq = &phi_q[i * 16..(i + 1) * 16];
            let scores: Vec<f64> = (0..4)
                .map(|j| {
                    if mask.data[i * 4 + j] {
                        0.0
                    } else {
                        dot(fq, &phi_k[j * 16..(j + 1) * 16])
                    }
                })
                .collect();
            let denom: f64 = scores.iter().sum();
            for c in 0..4 {
                let expected: f64 = (0..4)
                    .map(|j| scores[j] * v.data[j * 4 + c] as f64)
                    .sum::<f64>()
                    / denom;
                assert!((out[i * 4 + c] as f64 - expected).abs() < 1e-4);
            }
            for j in 0..4 {
                assert!((weights[i * 4 + j] as f64 - scores[j] / denom).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_wide_heads_keep_normalised_weights() {
        // Key features shrink like exp(-d_k / 2) and vanish in f32 from d_k = 128
        for (d_model, n_heads) in [(256, 2), (256, 1)] {
            let mut rng = StdRng::seed_from_u64(12);
            let attn = PerformerAttention::new(d_model, n_heads, None, 0.0, &mut rng);
            let x = sample(vec![1, 8, d_model], 13);
            let mask = Mask::attention(&[vec![11, 42, 7, 19, 3, 5, 6, 8]], 0).unwrap();

            let out = attn.forward(&x, &x, &x, &mask, &mut rng).unwrap();
            assert!(out.output.data.iter().any(|&v| v != 0.0));
            for r in 0..n_heads * 8 {
                let row = out.weights.row(r);
                let sum: f32 = row.iter().sum();
                assert!(
                    (sum - 1.0).abs() < 1e-4,
                    "d_k={} row {} sums to {}",
                    d_model / n_heads,
                    r,
                    sum
                );
                assert!(row[..=r % 8].iter().all(|&w| w > 0.0));
            }
        }
    }

    #[test]
    fn test_key_features_are_bounded_by_one() {
        let mut rng = StdRng::seed_from_u64(14);
        let attn = PerformerAttention::new(256, 1, Some(64), 0.0, &mut rng);
        let k = sample(vec![5, 256], 15).mul_scalar(4.0);
        let phi_k = attn.feature_map(&k.data, 5, false);
        let bound = 1.0 / 8.0;
        assert!(phi_k.iter().all(|&f| f > 0.0 && f <= bound));
    }

    #[test]
    fn test_attention_dropout_applies_in_training_only() {
        let mut rng = StdRng::seed_from_u64(16);
        let mut attn = PerformerAttention::new(8, 2, Some(16), 0.5, &mut rng);
        let x = sample(vec![1, 6, 8], 17);
        let mask = Mask::attention(&[vec![1, 2, 3, 4, 5, 6]], 0).unwrap();

        let a = attn.forward(&x, &x, &x, &mask, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = attn.forward(&x, &x, &x, &mask, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_ne!(a.weights, b.weights);
        assert_ne!(a.output, b.output);
        // Survivors are rescaled by 1 / (1 - p); future keys stay at zero
        for r in 0..12 {
            let row = a.weights.row(r);
            assert!(row[r % 6 + 1..].iter().all(|&w| w == 0.0));
        }

        attn.set_training(false);
        let c = attn.forward(&x, &x, &x, &mask, &mut StdRng::seed_from_u64(1)).unwrap();
        let d = attn.forward(&x, &x, &x, &mask, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(c.weights, d.weights);
        for r in 0..12 {
            assert!((c.weights.row(r).iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_non_causal_mask_uses_explicit_path() {
        let mut rng = StdRng::seed_from_u64(0);
        let attn = PerformerAttention::new(8, 2, Some(16), 0.0, &mut rng);
        let x = sample(vec![1, 3, 8], 6);
        let mask = Mask::padding(&[vec![4, 0, 5]], 0).unwrap();
        assert!(causal_key_padding(&mask.data, 3, 3).is_none());

        let out = attn.forward(&x, &x, &x, &mask, &mut rng).unwrap();
        for r in 0..6 {
            let row = out.weights.row(r);
            assert_eq!(row[1], 0.0);
            assert!(row[2] > 0.0);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_fully_masked_row_yields_zero_output() {
        let mut rng = StdRng::seed_from_u64(0);
        let attn = PerformerAttention::new(8, 2, Some(16), 0.0, &mut rng);
        let x = sample(vec![1, 3, 8], 7);
        let mask = Mask::attention(&[vec![0, 5, 6]], 0).unwrap();

        let out = attn.forward(&x, &x, &x, &mask, &mut rng).unwrap();
        for h in 0..2 {
            assert!(out.weights.row(h * 3).iter().all(|&w| w == 0.0));
        }
        assert!(out.output.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_approximates_softmax_attention() {
        // With many features the kernel estimate tracks exact attention closely
        let mut rng = StdRng::seed_from_u64(11);
        let performer = PerformerAttention::new(4, 1, Some(4096), 0.0, &mut rng);
        let mut standard = StandardAttention::new(4, 1, 0.0, &mut rng);
        standard.projections = performer.projections.clone();

        let x = sample(vec![1, 4, 4], 8).mul_scalar(0.3);
        let mask = Mask::attention(&[vec![1, 2, 3, 4]], 0).unwrap();
        let approx = performer.forward(&x, &x, &x, &mask, &mut rng).unwrap();
        let exact = standard.forward(&x, &x, &x, &mask, &mut rng).unwrap();

        for (a, e) in approx.weights.data.iter().zip(&exact.weights.data) {
            assert!((a - e).abs() < 0.05, "{} vs {}", a, e);
        }
    }
}
