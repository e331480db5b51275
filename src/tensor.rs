//! Tensor Operations for the Decoder
//!
//! A minimal dense tensor tailored to what a decoder-only transformer needs:
//! projections, batched attention products, row-wise softmax and the
//! normalisation statistics used by layer norm.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, d_model]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use verso::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! ```
//!
//! ## Contract
//!
//! Primitives here assert their preconditions and panic on misuse. Components
//! in [`crate::layers`] and [`crate::model`] validate shapes at their public
//! boundaries and report [`crate::Error`] before calling into this module.
//!
//! ## Parallelism
//!
//! Element-wise maps, softmax rows and per-(batch, head) products run on the
//! Rayon thread pool. Results do not depend on the number of threads.

use crate::mask::Mask;
use rayon::prelude::*;

/// A multi-dimensional array of `f32` in row-major layout
///
/// For shape `[2, 3]`, data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use verso::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with `value`
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    fn resolve_axis(&self, axis: isize) -> usize {
        if axis < 0 {
            (self.shape.len() as isize + axis) as usize
        } else {
            axis as usize
        }
    }

    /// Computes: result[j] += a_val * b[j] for all j
    ///
    /// Kept as a plain zipped loop so LLVM can auto-vectorize it.
    #[inline(always)]
    fn axpy(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    #[inline(always)]
    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: `[batch, heads, s1, k] @ [batch, heads, k, s2] -> [batch, heads, s1, s2]`
    ///
    /// The 4D form processes each (batch, head) pair independently in parallel.
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or the ranks are unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.rank() == 2 && other.rank() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: {:?} @ {:?}",
                self.shape, other.shape
            );

            let m = self.shape[0];
            let k = self.shape[1];
            let n = other.shape[1];

            // Each output row is an independent accumulation of scaled rows of `other`
            let mut result = vec![0.0; m * n];
            result
                .par_chunks_mut(n.max(1))
                .enumerate()
                .for_each(|(i, row)| {
                    for l in 0..k {
                        let a_val = self.data[i * k + l];
                        Self::axpy(a_val, &other.data[l * n..(l + 1) * n], row);
                    }
                });

            return Tensor::new(result, vec![m, n]);
        }

        if self.rank() == 4 && other.rank() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner = self.shape[3];
            let seq2 = other.shape[3];

            assert_eq!(
                &self.shape[..2],
                &other.shape[..2],
                "Batch/head dimensions must match for batched matmul"
            );
            assert_eq!(
                other.shape[2], inner,
                "Inner dimensions must match for batched matmul"
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];
            result
                .par_chunks_mut((seq1 * seq2).max(1))
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let a = &self.data[bh * seq1 * inner..(bh + 1) * seq1 * inner];
                    let b = &other.data[bh * inner * seq2..(bh + 1) * inner * seq2];
                    for i in 0..seq1 {
                        let row = &mut chunk[i * seq2..(i + 1) * seq2];
                        for l in 0..inner {
                            Self::axpy(a[i * inner + l], &b[l * seq2..(l + 1) * seq2], row);
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Matrix multiplication against the transpose of `other`
    ///
    /// Computes `self @ other^T` without materialising the transpose:
    /// - 2D: `[m, k] @ [n, k]^T -> [m, n]`
    /// - 4D: `[batch, heads, s1, k] @ [batch, heads, s2, k]^T -> [batch, heads, s1, s2]`
    ///
    /// Attention scores (`Q @ K^T`) and the tied output projection
    /// (`hidden @ E^T`) both go through here, so the embedding matrix is
    /// read in place rather than copied.
    pub fn matmul_transposed(&self, other: &Tensor) -> Tensor {
        if self.rank() == 2 && other.rank() == 2 {
            assert_eq!(
                self.shape[1], other.shape[1],
                "Matrix dimensions incompatible: {:?} @ {:?}^T",
                self.shape, other.shape
            );

            let m = self.shape[0];
            let k = self.shape[1];
            let n = other.shape[0];

            let mut result = vec![0.0; m * n];
            result
                .par_chunks_mut(n.max(1))
                .enumerate()
                .for_each(|(i, row)| {
                    let a = &self.data[i * k..(i + 1) * k];
                    for (j, out) in row.iter_mut().enumerate() {
                        *out = Self::dot(a, &other.data[j * k..(j + 1) * k]);
                    }
                });

            return Tensor::new(result, vec![m, n]);
        }

        if self.rank() == 4 && other.rank() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner = self.shape[3];
            let seq2 = other.shape[2];

            assert_eq!(
                &self.shape[..2],
                &other.shape[..2],
                "Batch/head dimensions must match for batched matmul"
            );
            assert_eq!(
                other.shape[3], inner,
                "Inner dimensions must match for batched matmul"
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];
            result
                .par_chunks_mut((seq1 * seq2).max(1))
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let a = &self.data[bh * seq1 * inner..(bh + 1) * seq1 * inner];
                    let b = &other.data[bh * seq2 * inner..(bh + 1) * seq2 * inner];
                    for i in 0..seq1 {
                        let q = &a[i * inner..(i + 1) * inner];
                        for j in 0..seq2 {
                            chunk[i * seq2 + j] = Self::dot(q, &b[j * inner..(j + 1) * inner]);
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul_transposed shapes: {:?} @ {:?}^T",
            self.shape, other.shape
        );
    }

    /// Softmax along the last axis
    ///
    /// Uses the numerically stable form:
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// Works for any rank; every contiguous run of `shape[-1]` elements is one
    /// row, and rows are processed in parallel.
    pub fn softmax(&self, axis: isize) -> Tensor {
        let axis = self.resolve_axis(axis);
        assert_eq!(
            axis,
            self.rank() - 1,
            "softmax is only supported along the last axis"
        );

        let cols = self.shape[axis];
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// Supported patterns:
    ///
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast batch**: `[batch, seq, dim] + [seq, dim]`
    /// 3. **Broadcast trailing**: `[*, n] + [n]` or `[b, s, d] + [b, s, 1]`
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication with broadcasting
    ///
    /// See [`Tensor::add`] for broadcasting patterns.
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    /// Element-wise subtraction with broadcasting
    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    /// Element-wise division with broadcasting
    pub fn div(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "div", |a, b| a / b)
    }

    fn zip_broadcast<F>(&self, other: &Tensor, op: &str, f: F) -> Tensor
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        // === EXACT MATCH ===
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        // === BROADCAST BATCH: [batch, seq, dim] op [seq, dim] ===
        if self.rank() == 3 && other.rank() == 2 && self.shape[1..] == other.shape[..] {
            let inner = other.numel();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % inner]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        // === BROADCAST KEEPDIM: [b, s, d] op [b, s, 1] (per-row statistics) ===
        if self.rank() == other.rank()
            && other.shape.last() == Some(&1)
            && self.shape[..self.rank() - 1] == other.shape[..other.rank() - 1]
        {
            let last = *self.shape.last().unwrap_or(&1);
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i / last.max(1)]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        // === BROADCAST LAST DIM: [*, n] op [n] (e.g. bias) ===
        if self.rank() > other.rank() && other.numel() == *self.shape.last().unwrap_or(&0) {
            let last = other.numel();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % last]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {}: {:?} vs {:?}",
            op, self.shape, other.shape
        );
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Add scalar to all elements
    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Element-wise square root
    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    ///
    /// ```rust
    /// # use verso::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// assert_eq!(tensor.reshape(&[3, 2]).shape, vec![3, 2]);
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Replace values where `mask` is true with `value`
    ///
    /// # Panics
    ///
    /// Panics if the mask shape differs from the tensor shape
    pub fn masked_fill(&self, mask: &Mask, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Mean along the last axis
    ///
    /// With `keepdim` the reduced axis is kept with size 1.
    pub fn mean(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            row.iter().sum::<f32>() / row.len() as f32
        })
    }

    /// Biased variance along the last axis (divides by N, as layer norm does)
    pub fn var(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            row.iter()
                .map(|&x| {
                    let diff = x - mean;
                    diff * diff
                })
                .sum::<f32>()
                / n
        })
    }

    fn reduce_last<F>(&self, axis: isize, keepdim: bool, f: F) -> Tensor
    where
        F: Fn(&[f32]) -> f32 + Sync + Send,
    {
        let axis = self.resolve_axis(axis);
        assert_eq!(
            axis,
            self.rank() - 1,
            "Reductions are only supported along the last axis, got shape {:?}",
            self.shape
        );

        let cols = self.shape[axis];
        let result: Vec<f32> = self.data.par_chunks(cols.max(1)).map(f).collect();

        let mut new_shape = self.shape[..axis].to_vec();
        if keepdim {
            new_shape.push(1);
        }
        Tensor::new(result, new_shape)
    }

    /// Index of the largest element of every last-axis row
    pub fn argmax_last(&self) -> Vec<usize> {
        let cols = *self.shape.last().unwrap_or(&1);
        self.data
            .par_chunks(cols.max(1))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
                        if v > best_val {
                            (i, v)
                        } else {
                            (best, best_val)
                        }
                    })
                    .0
            })
            .collect()
    }

    /// Borrow the contiguous row at flat row index `row` of the last axis
    pub fn row(&self, row: usize) -> &[f32] {
        let cols = *self.shape.last().unwrap_or(&1);
        &self.data[row * cols..(row + 1) * cols]
    }
}
