//! Sinusoidal Positional Encoding
//!
//! A fixed table, computed once and never trained:
//!
//! ```text
//! pe[pos, 2i]   = sin(pos / 10000^(2i / d_model))
//! pe[pos, 2i+1] = cos(pos / 10000^(2i / d_model))
//! ```
//!
//! Rows are addressed by 1-based position; row 0 is what pad tokens receive
//! (see [`crate::mask::positions`]). The table is not part of the trainable
//! parameter set.

use crate::error::{expect_rank, Error, Result};
use crate::layers::dropout::Dropout;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Precomputed additive position signal followed by embedding dropout
#[derive(Clone, Debug)]
pub struct PositionalEncoding {
    table: Tensor,
    pub dropout: Dropout,
}

impl PositionalEncoding {
    /// Build a `[max_len, d_model]` table
    pub fn new(d_model: usize, max_len: usize, dropout_rate: f32) -> Self {
        let mut data = vec![0.0; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                // 10000^(-2i/d) computed in log space, as exp(2i * -ln(10000) / d)
                let div_term = (i as f32 * -(10000.0_f32.ln()) / d_model as f32).exp();
                let angle = pos as f32 * div_term;
                data[pos * d_model + i] = angle.sin();
                if i + 1 < d_model {
                    data[pos * d_model + i + 1] = angle.cos();
                }
            }
        }

        Self {
            table: Tensor::new(data, vec![max_len, d_model]),
            dropout: Dropout::new(dropout_rate),
        }
    }

    /// Number of addressable positions
    pub fn max_len(&self) -> usize {
        self.table.shape[0]
    }

    /// The precomputed table (read-only)
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Add `pe[positions[b][t]]` to every hidden vector, then apply dropout
    ///
    /// # Arguments
    ///
    /// * `hidden` - `[batch, seq, d_model]`
    /// * `positions` - `[batch][seq]` row indices into the table
    pub fn apply(
        &self,
        hidden: &Tensor,
        positions: &[Vec<usize>],
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        expect_rank("positional input", &hidden.shape, 3)?;
        let (batch, seq_len, d_model) = (hidden.shape[0], hidden.shape[1], hidden.shape[2]);
        let got = vec![positions.len(), positions.first().map_or(0, Vec::len), self.table.shape[1]];
        if got != vec![batch, seq_len, d_model] {
            return Err(Error::ShapeMismatch {
                what: "positions vs hidden state",
                expected: vec![batch, seq_len, d_model],
                got,
            });
        }

        let mut out = hidden.data.clone();
        for (b, row) in positions.iter().enumerate() {
            for (t, &pos) in row.iter().enumerate() {
                if pos >= self.max_len() {
                    return Err(Error::SequenceTooLong {
                        seq_len: pos,
                        max_seq_len: self.max_len() - 1,
                    });
                }
                let dst = (b * seq_len + t) * d_model;
                let src = &self.table.data[pos * d_model..(pos + 1) * d_model];
                for (o, &p) in out[dst..dst + d_model].iter_mut().zip(src) {
                    *o += p;
                }
            }
        }

        Ok(self.dropout.forward(&Tensor::new(out, hidden.shape.clone()), rng))
    }
}
