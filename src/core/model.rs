//! Contract required of the language model under evaluation.

use anyhow::Result;
use candle_core::Tensor;

/// Per-layer `(key, value)` cache, each `(batch, head, position, head_dim)`.
pub type PastKeyValues = Vec<(Tensor, Tensor)>;

/// Shape parameters used to turn bit-widths into bytes per token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelGeometry {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl ModelGeometry {
    /// Cache elements stored per token for one of key or value.
    pub fn elements_per_token(&self) -> usize {
        self.num_layers * self.num_heads * self.head_dim
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOptions {
    pub output_attentions: bool,
    pub use_cache: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            output_attentions: true,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `(batch, position, vocab)`
    pub logits: Tensor,
    /// One `(batch, head, query, key)` tensor per layer, keys include the prior cache.
    pub attentions: Option<Vec<Tensor>>,
    /// Cache covering the prior positions followed by this call's positions.
    pub past_key_values: Option<PastKeyValues>,
}

pub trait LanguageModel {
    /// Run the model over `input_ids` (`(batch, position)`, u32), continuing
    /// from `prior` when given.
    fn forward(
        &self,
        input_ids: &Tensor,
        prior: Option<&PastKeyValues>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput>;

    /// Stable identity used when fingerprinting evaluation runs.
    fn name(&self) -> &str;

    fn geometry(&self) -> ModelGeometry;
}
