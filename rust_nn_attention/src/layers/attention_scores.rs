//! Attention-weight snapshots and a holder that keeps the most recent one.

use super::blocks::multihead_attention::{AttentionOutput, MultiHeadAttention};
use super::inputs::AttentionInputs;
use crate::cpu_utils::max_row_deviation;
use crate::error::{LayerError, LayerResult};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

const NORMALIZE_EPS: f32 = 1e-8;

/// Softmax output of one forward pass, `[batch, heads, seq_q, seq_k]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AttentionWeights(Array4<f32>);

impl AttentionWeights {
    pub fn new(weights: Array4<f32>) -> Self {
        AttentionWeights(weights)
    }

    pub fn raw(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.0
    }

    pub fn max_row_deviation(&self) -> f32 {
        max_row_deviation(self.0.view())
    }

    /// Min-max scales each batch element to [0, 1], jointly over all heads and positions.
    pub fn normalized(&self) -> Array4<f32> {
        let mut out = self.0.clone();
        for mut batch in out.outer_iter_mut() {
            let min = batch.iter().copied().fold(f32::INFINITY, f32::min);
            let max = batch.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let denom = max - min + NORMALIZE_EPS;
            batch.mapv_inplace(|w| (w - min) / denom);
        }
        out
    }
}

/// Wraps a layer and remembers the weights of its last forward pass.
pub struct AttentionRecorder {
    layer: MultiHeadAttention,
    last: Option<AttentionWeights>,
}

impl AttentionRecorder {
    pub fn new(layer: MultiHeadAttention) -> Self {
        AttentionRecorder { layer, last: None }
    }

    pub fn layer(&self) -> &MultiHeadAttention {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut MultiHeadAttention {
        &mut self.layer
    }

    pub fn keep_attention_weights(&self) -> bool {
        self.layer.keep_attention_weights()
    }

    pub fn set_keep_attention_weights(&mut self, keep: bool) {
        self.layer.set_keep_attention_weights(keep);
    }

    /// Runs the layer. The snapshot is replaced on every call and cleared when the
    /// layer is not keeping weights.
    pub fn call(&mut self, inputs: AttentionInputs<ArrayView3<'_, f32>>) -> LayerResult<Array3<f32>> {
        let AttentionOutput {
            output,
            attention_weights,
        } = self.layer.forward(inputs)?;
        self.last = attention_weights;
        Ok(output)
    }

    pub fn last_weights(&self) -> Option<&AttentionWeights> {
        self.last.as_ref()
    }

    /// Normalised copy of the last snapshot.
    pub fn attention_scores(&self) -> LayerResult<Array4<f32>> {
        self.last
            .as_ref()
            .map(AttentionWeights::normalized)
            .ok_or(LayerError::Uninitialized(
                "no attention weights retained; enable keepAttentionWeights and run forward",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_utils::Shape;
    use crate::layers::config::AttentionConfig;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalization_is_joint_per_batch_element() {
        let mut raw = Array4::<f32>::zeros((2, 2, 1, 2));
        raw[[0, 0, 0, 0]] = 0.2;
        raw[[0, 0, 0, 1]] = 0.8;
        raw[[0, 1, 0, 0]] = 0.5;
        raw[[0, 1, 0, 1]] = 0.5;
        raw.slice_mut(ndarray::s![1, .., .., ..]).fill(0.5);
        let normalized = AttentionWeights::new(raw).normalized();

        assert_abs_diff_eq!(normalized[[0, 0, 0, 0]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(normalized[[0, 0, 0, 1]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(normalized[[0, 1, 0, 0]], 0.5, epsilon = 1e-6);
        // constant batch element maps to zero instead of dividing by zero
        assert!(normalized.slice(ndarray::s![1, .., .., ..]).iter().all(|w| *w == 0.0));
    }

    #[test]
    fn recorder_errors_until_weights_are_kept() -> LayerResult<()> {
        let config = AttentionConfig::new(2, 3).with_seed(3);
        let mut layer = MultiHeadAttention::new(config)?;
        layer.initialize(AttentionInputs::SelfAttention(&Shape::batched(&[4, 6])))?;
        let mut recorder = AttentionRecorder::new(layer);
        let x = Array3::from_shape_fn((2, 4, 6), |(b, s, d)| ((b + s * d) as f32).sin());

        recorder.call(AttentionInputs::SelfAttention(x.view()))?;
        assert!(matches!(
            recorder.attention_scores(),
            Err(LayerError::Uninitialized(_))
        ));

        recorder.set_keep_attention_weights(true);
        assert!(recorder.keep_attention_weights());
        recorder.call(AttentionInputs::SelfAttention(x.view()))?;
        let scores = recorder.attention_scores()?;
        assert_eq!(scores.dim(), (2, 2, 4, 4));
        assert!(scores.iter().all(|w| (0.0..=1.0).contains(w)));
        assert!(recorder.last_weights().is_some());

        recorder.set_keep_attention_weights(false);
        recorder.call(AttentionInputs::SelfAttention(x.view()))?;
        assert!(recorder.last_weights().is_none());
        Ok(())
    }
}
