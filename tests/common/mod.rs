//! Deterministic toy attention model for integration tests.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{Device, Tensor};
use kv_quant_eval::{
    CacheInsightRenderer, ForwardOptions, ForwardOutput, LanguageModel, ModelGeometry,
    PastKeyValues, Question,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Route library logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const VOCAB: usize = 6;
pub const LAYERS: usize = 2;
pub const HEADS: usize = 2;
pub const HEAD_DIM: usize = 4;

/// Single-block causal attention per layer with fixed weights derived from a
/// sinusoidal embedding table. Layers read the embeddings directly and their
/// outputs are summed before projecting back onto the embedding table.
pub struct ToyModel {
    embed: Tensor,
    calls: Arc<AtomicUsize>,
    return_attentions: bool,
}

impl ToyModel {
    pub fn new() -> Self {
        let width = HEADS * HEAD_DIM;
        let data: Vec<f32> = (0..VOCAB * width)
            .map(|i| {
                let (v, j) = (i / width, i % width);
                (0.7 * v as f32 + 1.3 * j as f32).sin() * 0.8
            })
            .collect();
        Self {
            embed: Tensor::from_vec(data, (VOCAB, width), &Device::Cpu).unwrap(),
            calls: Arc::new(AtomicUsize::new(0)),
            return_attentions: true,
        }
    }

    pub fn without_attentions(mut self) -> Self {
        self.return_attentions = false;
        self
    }

    /// Shared counter of forward calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn causal_mask(len: usize, prior_len: usize) -> Result<Tensor> {
        let total = prior_len + len;
        let mask: Vec<f32> = (0..len * total)
            .map(|idx| {
                let (i, j) = (idx / total, idx % total);
                if j <= prior_len + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
            .collect();
        Ok(Tensor::from_vec(mask, (len, total), &Device::Cpu)?)
    }
}

impl LanguageModel for ToyModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        prior: Option<&PastKeyValues>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (batch, len) = input_ids.dims2()?;
        let emb = self
            .embed
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, len, HEADS, HEAD_DIM))?
            .transpose(1, 2)?
            .contiguous()?;
        let prior_len = match prior {
            Some(p) => p[0].0.dim(2)?,
            None => 0,
        };
        let mask = Self::causal_mask(len, prior_len)?;
        let scale = 1.0 / (HEAD_DIM as f64).sqrt();

        let mut hidden = emb.zeros_like()?;
        let mut attentions = Vec::with_capacity(LAYERS);
        let mut cache = Vec::with_capacity(LAYERS);
        for layer in 0..LAYERS {
            let q = emb.affine(0.9, 0.0)?;
            let k = emb.affine(1.0 + 0.5 * layer as f64, 0.1)?;
            let v = emb.affine(-0.7 * (layer + 1) as f64, 0.05)?;
            let (k, v) = match prior {
                Some(p) => (
                    Tensor::cat(&[&p[layer].0, &k], 2)?,
                    Tensor::cat(&[&p[layer].1, &v], 2)?,
                ),
                None => (k, v),
            };
            let scores = q
                .matmul(&k.t()?.contiguous()?)?
                .affine(scale, 0.0)?
                .broadcast_add(&mask)?;
            let attn = candle_nn::ops::softmax_last_dim(&scores)?;
            hidden = (hidden + attn.matmul(&v.contiguous()?)?)?;
            attentions.push(attn);
            cache.push((k, v));
        }
        let logits = hidden
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, HEADS * HEAD_DIM))?
            .broadcast_matmul(&self.embed.t()?.contiguous()?)?;

        Ok(ForwardOutput {
            logits,
            attentions: (options.output_attentions && self.return_attentions).then_some(attentions),
            past_key_values: options.use_cache.then_some(cache),
        })
    }

    fn name(&self) -> &str {
        "toy-attention"
    }

    fn geometry(&self) -> ModelGeometry {
        ModelGeometry {
            num_layers: LAYERS,
            num_heads: HEADS,
            head_dim: HEAD_DIM,
        }
    }
}

/// Toy model whose continuation passes report attention over the first key
/// column only.
pub struct TruncatedAttentionModel(pub ToyModel);

impl LanguageModel for TruncatedAttentionModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        prior: Option<&PastKeyValues>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput> {
        let mut output = self.0.forward(input_ids, prior, options)?;
        if prior.is_some() {
            if let Some(attentions) = output.attentions.take() {
                let truncated = attentions
                    .iter()
                    .map(|attn| attn.narrow(3, 0, 1))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                output.attentions = Some(truncated);
            }
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "toy-attention-truncated"
    }

    fn geometry(&self) -> ModelGeometry {
        self.0.geometry()
    }
}

/// Renderer that records the labels it was asked to draw.
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub calls: Rc<RefCell<Vec<Vec<String>>>>,
}

impl CacheInsightRenderer for RecordingRenderer {
    fn render(&self, caches: &[(&str, &Tensor)]) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(caches.iter().map(|(label, _)| label.to_string()).collect());
        Ok(())
    }
}

/// Questions with distinct prompts and three distinct choices each.
pub fn questions() -> Vec<Question> {
    vec![
        Question::from_rows(
            &[vec![0, 3, 1, 4, 2], vec![0, 3, 1, 4, 5, 1], vec![0, 3, 1, 4, 1, 5, 2]],
            4,
            1,
            0,
        )
        .unwrap(),
        Question::from_rows(&[vec![0, 2, 5, 3], vec![0, 2, 4, 4]], 2, 0, 0).unwrap(),
        Question::from_rows(
            &[vec![0, 5, 5, 1, 2, 3, 4], vec![0, 5, 5, 1, 2, 1], vec![0, 5, 5, 1, 2, 5]],
            5,
            2,
            0,
        )
        .unwrap(),
    ]
}

/// A question whose choices are token-for-token identical, so every choice
/// scores the same.
pub fn tied_question(answer_idx: usize) -> Question {
    let row = vec![0, 4, 2, 3, 1];
    Question::from_rows(&[row.clone(), row.clone(), row], 3, answer_idx, 0).unwrap()
}
