// The causal LM capability the harness trains and samples from.

use anyhow::Result;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which parameters an optimizer sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainScope {
    /// Base network plus adapter and value head.
    Full,
    /// Adapter and value head only; the base network stays frozen.
    HeadsOnly,
}

pub trait CausalLm {
    /// (batch, seq) u32 ids -> (batch, seq, vocab) logits. `use_adapter` toggles
    /// the trainable adapter on the LM head; off gives the base policy.
    fn logits(&self, input_ids: &Tensor, use_adapter: bool) -> Result<Tensor>;

    /// Critic estimates, (batch, seq).
    fn values(&self, input_ids: &Tensor) -> Result<Tensor>;

    fn max_positions(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn trainable_vars(&self, scope: TrainScope) -> Vec<Var>;
    fn save(&self, dir: &Path) -> Result<()>;
    fn load(&self, dir: &Path) -> Result<()>;
}
