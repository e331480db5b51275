//! Model Configuration
//!
//! All hyper-parameters are fixed at construction. A [`Config`] is validated
//! once by [`Config::validate`] (called by every model constructor), so
//! configuration errors surface before any weight is allocated.
//!
//! ## Example
//!
//! ```rust
//! use verso::{AttentionKind, Config};
//!
//! let config = Config::tiny(100).with_attention("performer".parse().unwrap());
//! assert!(config.validate().is_ok());
//! assert!(matches!(config.attention, AttentionKind::Performer { .. }));
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Default capacity of the sinusoidal position table
pub const DEFAULT_MAX_LEN: usize = 5000;

/// Which multi-head attention implementation each decoder layer builds
///
/// The choice is resolved once at construction and stored in the layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttentionKind {
    /// Exact softmax attention, quadratic in sequence length
    #[default]
    Standard,
    /// Positive-random-feature approximation, linear in sequence length
    ///
    /// `features` is the number of random features per head; `None` picks
    /// `d_k * ln(d_k)` (at least `d_k`).
    Performer { features: Option<usize> },
}

impl FromStr for AttentionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "standard" => Ok(AttentionKind::Standard),
            "performer" => Ok(AttentionKind::Performer { features: None }),
            other => Err(Error::UnknownAttention(other.to_string())),
        }
    }
}

/// Model configuration
///
/// # Fields
///
/// - `vocab_size`: Number of token ids, `pad_id` included
/// - `d_model`: Width of the hidden state
/// - `n_layers`: Number of decoder layers
/// - `n_heads`: Attention heads per layer (must divide `d_model`)
/// - `d_ff`: Hidden width of the position-wise feed-forward network
/// - `embd_pdrop` / `attn_pdrop` / `resid_pdrop`: Dropout probabilities
/// - `pad_id`: Token id reserved for padding
/// - `max_seq_len`: Longest sequence a forward call accepts
/// - `max_len`: Rows in the positional table (row 0 is the pad slot)
/// - `attention`: Multi-head attention implementation
/// - `seed`: Seed for weight initialisation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
    pub pad_id: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub attention: AttentionKind,
    #[serde(default)]
    pub seed: u64,
}

fn default_max_len() -> usize {
    DEFAULT_MAX_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self::gpt_base(50257)
    }
}

impl Config {
    /// Tiny model for tests and quick experiments (d_model 32, 2 layers, 4 heads)
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            d_model: 32,
            n_layers: 2,
            n_heads: 4,
            d_ff: 64,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            pad_id: 0,
            max_seq_len: 64,
            max_len: DEFAULT_MAX_LEN,
            attention: AttentionKind::Standard,
            seed: 58,
        }
    }

    /// Small model: d_model 384, 2 layers, 4 heads, d_ff 512, 64-token context
    pub fn small(vocab_size: usize) -> Self {
        Self {
            d_model: 384,
            n_layers: 2,
            n_heads: 4,
            d_ff: 512,
            ..Self::tiny(vocab_size)
        }
    }

    /// GPT base shape: d_model 768, 12 layers, 12 heads, d_ff 3072
    pub fn gpt_base(vocab_size: usize) -> Self {
        Self {
            d_model: 768,
            n_layers: 12,
            n_heads: 12,
            d_ff: 3072,
            max_seq_len: 1024,
            ..Self::tiny(vocab_size)
        }
    }

    /// Replace the attention implementation
    pub fn with_attention(mut self, attention: AttentionKind) -> Self {
        self.attention = attention;
        self
    }

    /// Replace the initialisation seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set all three dropout probabilities at once
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.embd_pdrop = p;
        self.attn_pdrop = p;
        self.resid_pdrop = p;
        self
    }

    /// Per-head width
    pub fn d_k(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Check every construction-time invariant
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("d_ff", self.d_ff),
            ("max_seq_len", self.max_seq_len),
        ] {
            if value == 0 {
                return Err(Error::ZeroDimension { name });
            }
        }

        if self.d_model % self.n_heads != 0 {
            return Err(Error::HeadsDoNotDivide {
                d_model: self.d_model,
                n_heads: self.n_heads,
            });
        }

        for (name, value) in [
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
            ("resid_pdrop", self.resid_pdrop),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::InvalidProbability { name, value });
            }
        }

        if self.pad_id >= self.vocab_size {
            return Err(Error::PadIdOutOfRange {
                pad_id: self.pad_id,
                vocab_size: self.vocab_size,
            });
        }

        if self.max_seq_len + 1 > self.max_len {
            return Err(Error::PositionalCapacity {
                max_seq_len: self.max_seq_len,
                max_len: self.max_len,
            });
        }

        if let AttentionKind::Performer { features: Some(0) } = self.attention {
            return Err(Error::ZeroDimension {
                name: "performer features",
            });
        }

        Ok(())
    }

    /// Serialise to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read and validate a JSON config
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
