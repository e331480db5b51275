//! Token Embedding
//!
//! A learnable lookup table `[vocab_size, d_model]`: token id `t` maps to
//! row `t`. The table is also the output projection of the language model
//! (weight tying), so it lives behind a shared handle:
//!
//! ```text
//! TokenEmbedding ──owns──▶ Rc<RefCell<Tensor>> ◀──reads── TiedLmHead
//! ```
//!
//! There is one tensor and two readers. Writes go through
//! [`TokenEmbedding::weight_mut`], so an update is visible to the head
//! immediately.

use crate::error::{Error, Result};
use crate::layers::linear::normal_init;
use crate::mask::batch_dims;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Shared handle to a weight read by more than one layer
pub type SharedWeight = Rc<RefCell<Tensor>>;

/// Token embedding table
#[derive(Debug)]
pub struct TokenEmbedding {
    weight: SharedWeight,
}

impl TokenEmbedding {
    /// Table initialised from N(0, 0.02²)
    pub fn new(vocab_size: usize, d_model: usize, rng: &mut StdRng) -> Self {
        let weight = Tensor::new(
            normal_init(vocab_size * d_model, 0.02, rng),
            vec![vocab_size, d_model],
        );
        Self {
            weight: Rc::new(RefCell::new(weight)),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    pub fn d_model(&self) -> usize {
        self.weight.borrow().shape[1]
    }

    /// Read access to the table
    pub fn weight(&self) -> Ref<'_, Tensor> {
        self.weight.borrow()
    }

    /// The single mutation point for the tied table
    ///
    /// # Panics
    ///
    /// Panics if the table is currently borrowed (e.g. during a forward call).
    pub fn weight_mut(&self) -> RefMut<'_, Tensor> {
        self.weight.borrow_mut()
    }

    /// Another handle to the same table (for the tied output projection)
    pub fn share(&self) -> SharedWeight {
        Rc::clone(&self.weight)
    }

    /// Look up `[batch, seq]` ids, producing `[batch, seq, d_model]`
    pub fn forward(&self, ids: &[Vec<usize>]) -> Result<Tensor> {
        let (batch, seq_len) = batch_dims(ids)?;
        let weight = self.weight.borrow();
        let (vocab_size, d_model) = (weight.shape[0], weight.shape[1]);

        let mut output = Vec::with_capacity(batch * seq_len * d_model);
        for &id in ids.iter().flatten() {
            if id >= vocab_size {
                return Err(Error::TokenOutOfRange { id, vocab_size });
            }
            output.extend_from_slice(&weight.data[id * d_model..(id + 1) * d_model]);
        }

        Ok(Tensor::new(output, vec![batch, seq_len, d_model]))
    }
}
