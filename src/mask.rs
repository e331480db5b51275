//! Attention Masks
//!
//! Masks are boolean tensors where `true` marks a (query, key) pair that must
//! be excluded from attention. The decoder combines two of them:
//!
//! - **Padding mask**: a key is excluded when it is a pad token, for every query
//! - **Causal mask**: key `j` is excluded from query `i` when `j > i`
//!
//! For `[[5, 7, 0]]` with `pad_id = 0`:
//!
//! ```text
//! padding      causal       combined
//! [0 0 1]      [0 1 1]      [0 1 1]
//! [0 0 1]  OR  [0 0 1]  =   [0 0 1]
//! [0 0 1]      [0 0 0]      [0 0 1]
//! ```
//!
//! A pad position is excluded as a key but still computes a query row; that
//! row is discarded downstream by the loss, not here.
//!
//! The combined mask is built once per forward call and shared by every
//! decoder layer.

use crate::error::{Error, Result};

/// Boolean exclusion mask (`true` = do not attend)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    /// Flat row-major flags
    pub data: Vec<bool>,
    /// Shape, `[batch, q_len, k_len]` or `[batch, heads, q_len, k_len]`
    pub shape: Vec<usize>,
}

impl Mask {
    /// Wrap flags with a shape
    ///
    /// # Panics
    ///
    /// Panics if the flag count does not match the shape
    pub fn new(data: Vec<bool>, shape: Vec<usize>) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Mask data length doesn't match shape {:?}",
            shape
        );
        Self { data, shape }
    }

    /// Padding mask: `[batch, seq, seq]`, true wherever the key is `pad_id`
    pub fn padding(ids: &[Vec<usize>], pad_id: usize) -> Result<Self> {
        let (batch, seq_len) = batch_dims(ids)?;
        let mut data = Vec::with_capacity(batch * seq_len * seq_len);
        for row in ids {
            for _query in 0..seq_len {
                data.extend(row.iter().map(|&id| id == pad_id));
            }
        }
        Ok(Self::new(data, vec![batch, seq_len, seq_len]))
    }

    /// Causal mask: `[batch, seq, seq]`, strictly upper triangular
    ///
    /// Independent of token content; the diagonal stays unmasked so every
    /// query can at least attend to itself.
    pub fn causal(batch: usize, seq_len: usize) -> Self {
        let mut plane = vec![false; seq_len * seq_len];
        for i in 0..seq_len {
            for j in i + 1..seq_len {
                plane[i * seq_len + j] = true;
            }
        }
        let data = plane.repeat(batch);
        Self::new(data, vec![batch, seq_len, seq_len])
    }

    /// Padding OR causal, the mask every decoder layer uses
    pub fn attention(ids: &[Vec<usize>], pad_id: usize) -> Result<Self> {
        let padding = Self::padding(ids, pad_id)?;
        let causal = Self::causal(padding.shape[0], padding.shape[1]);
        padding.or(&causal)
    }

    /// Element-wise logical OR
    pub fn or(&self, other: &Mask) -> Result<Self> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                what: "mask OR operand",
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a || b)
            .collect();
        Ok(Self::new(data, self.shape.clone()))
    }

    /// Repeat a `[batch, q, k]` mask across heads: `[batch, heads, q, k]`
    pub fn expand_heads(&self, n_heads: usize) -> Self {
        assert_eq!(self.shape.len(), 3, "expand_heads expects [batch, q, k]");
        let (batch, q_len, k_len) = (self.shape[0], self.shape[1], self.shape[2]);
        let plane = q_len * k_len;

        let mut data = Vec::with_capacity(batch * n_heads * plane);
        for b in 0..batch {
            let src = &self.data[b * plane..(b + 1) * plane];
            for _ in 0..n_heads {
                data.extend_from_slice(src);
            }
        }
        Self::new(data, vec![batch, n_heads, q_len, k_len])
    }

    /// Is (query `i`, key `j`) of batch element `b` excluded? (`[batch, q, k]` masks)
    pub fn is_masked(&self, b: usize, i: usize, j: usize) -> bool {
        let (q_len, k_len) = (self.shape[1], self.shape[2]);
        self.data[(b * q_len + i) * k_len + j]
    }

    /// Rows (flattened over leading dims) where every key is excluded
    ///
    /// Softmax over such a row is ill-defined; the causal mask only produces
    /// them for pad queries preceded exclusively by padding.
    pub fn fully_masked_rows(&self) -> usize {
        let k_len = *self.shape.last().unwrap_or(&1);
        self.data
            .chunks(k_len.max(1))
            .filter(|row| row.iter().all(|&m| m))
            .count()
    }
}

/// 1-based positions with pad tokens reset to 0
///
/// ```text
/// ids       [9, 4, 0, 0]   (pad_id = 0)
/// positions [1, 2, 0, 0]
/// ```
///
/// Position 0 is reserved for "no real position", so padding never picks up
/// the signal of a real slot.
pub fn positions(ids: &[Vec<usize>], pad_id: usize) -> Result<Vec<Vec<usize>>> {
    batch_dims(ids)?;
    Ok(ids
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(t, &id)| if id == pad_id { 0 } else { t + 1 })
                .collect()
        })
        .collect())
}

/// `(batch, seq_len)` of a rectangular, non-empty id batch
pub fn batch_dims(ids: &[Vec<usize>]) -> Result<(usize, usize)> {
    let first = ids.first().ok_or(Error::EmptyBatch)?;
    let seq_len = first.len();
    if seq_len == 0 {
        return Err(Error::EmptyBatch);
    }
    for (row, seq) in ids.iter().enumerate() {
        if seq.len() != seq_len {
            return Err(Error::RaggedBatch {
                row,
                len: seq.len(),
                expected: seq_len,
            });
        }
    }
    Ok((ids.len(), seq_len))
}
