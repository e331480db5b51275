//! Error Types
//!
//! Construction problems are configuration errors and are reported before any
//! weight is allocated. Mismatched inputs at a component boundary are shape
//! errors and are reported at forward time. Nothing is retried: the decoder
//! is a pure computation and every error goes straight back to the caller.

use thiserror::Error;

/// Errors produced while building or running the model
#[derive(Error, Debug)]
pub enum Error {
    /// `d_model` must split evenly into attention heads
    #[error("d_model ({d_model}) must be divisible by n_heads ({n_heads})")]
    HeadsDoNotDivide { d_model: usize, n_heads: usize },

    /// A size hyper-parameter was zero
    #[error("{name} must be greater than zero")]
    ZeroDimension { name: &'static str },

    /// A dropout probability fell outside `[0, 1)`
    #[error("{name} must be a probability in [0, 1), got {value}")]
    InvalidProbability { name: &'static str, value: f32 },

    /// The padding id is not a valid token id
    #[error("pad_id ({pad_id}) must be smaller than vocab_size ({vocab_size})")]
    PadIdOutOfRange { pad_id: usize, vocab_size: usize },

    /// The positional table cannot address every supported position
    #[error(
        "max_seq_len ({max_seq_len}) needs {} positional rows but the table holds {max_len}",
        .max_seq_len + 1
    )]
    PositionalCapacity { max_seq_len: usize, max_len: usize },

    /// The attention selector did not name a known implementation
    #[error("unknown attention kernel '{0}' (expected 'default', 'standard' or 'performer')")]
    UnknownAttention(String),

    /// A tensor had the wrong number of dimensions
    #[error("{what}: expected rank {}, got shape {got:?}", join_ranks(.expected))]
    RankMismatch {
        what: &'static str,
        /// Every rank the caller accepts
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A tensor had the right rank but incompatible dimensions
    #[error("{what}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Token batches must be non-empty
    #[error("token batch is empty")]
    EmptyBatch,

    /// Every row of a token batch must have the same length
    #[error("token batch is ragged: row {row} has length {len}, expected {expected}")]
    RaggedBatch {
        row: usize,
        len: usize,
        expected: usize,
    },

    /// A token id was outside the vocabulary
    #[error("token id {id} out of range for vocab_size {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    /// The sequence is longer than the model accepts
    #[error("sequence length {seq_len} exceeds max_seq_len {max_seq_len}")]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },

    /// The shifted loss had no position left to score
    #[error("no target positions left to score (sequence length {seq_len})")]
    NoTargets { seq_len: usize },

    /// Reading or writing a config file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A config file could not be (de)serialised
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors raised while validating a configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::HeadsDoNotDivide { .. }
                | Error::ZeroDimension { .. }
                | Error::InvalidProbability { .. }
                | Error::PadIdOutOfRange { .. }
                | Error::PositionalCapacity { .. }
                | Error::UnknownAttention(_)
        )
    }

    /// True for errors raised by a forward call on mismatched inputs
    pub fn is_shape(&self) -> bool {
        matches!(
            self,
            Error::RankMismatch { .. }
                | Error::ShapeMismatch { .. }
                | Error::EmptyBatch
                | Error::RaggedBatch { .. }
                | Error::TokenOutOfRange { .. }
                | Error::SequenceTooLong { .. }
                | Error::NoTargets { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check that `shape` has exactly `expected` dimensions
pub(crate) fn expect_rank(what: &'static str, shape: &[usize], expected: usize) -> Result<()> {
    if shape.len() != expected {
        return Err(Error::RankMismatch {
            what,
            expected: vec![expected],
            got: shape.to_vec(),
        });
    }
    Ok(())
}

fn join_ranks(ranks: &[usize]) -> String {
    ranks
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Check that `shape` equals `expected`
pub(crate) fn expect_shape(what: &'static str, shape: &[usize], expected: &[usize]) -> Result<()> {
    if shape != expected {
        return Err(Error::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: shape.to_vec(),
        });
    }
    Ok(())
}
