use super::linear::Linear;
use crate::cpu_utils::{Shape, max_row_deviation, softmax_rows};
use crate::error::{LayerError, LayerResult};
use crate::layer_weights::{AttentionCheckpoint, NamedTensor};
use crate::layers::attention_scores::AttentionWeights;
use crate::layers::config::AttentionConfig;
use crate::layers::inputs::{AttentionInputs, Qkv};
use crate::layers::{Layer, LayerSpec};
use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView3, ArrayViewD, ArrayViewMutD, Ix3, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, trace, warn};

const ROW_SUM_TOLERANCE: f32 = 1e-5;

type HeadResult = (Array2<f32>, Array2<f32>);

/// Input and output widths fixed by the first build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionDims {
    pub input_dim: usize,
    pub key_input_dim: usize,
    pub value_input_dim: usize,
    pub output_dim: usize,
}

impl AttentionDims {
    fn resolve(config: &AttentionConfig, shapes: &Qkv<&Shape>) -> LayerResult<Self> {
        let input_dim = trailing_dim("query", shapes.query)?;
        Ok(AttentionDims {
            input_dim,
            key_input_dim: trailing_dim("key", shapes.key)?,
            value_input_dim: trailing_dim("value", shapes.value)?,
            output_dim: config.output_dim.unwrap_or(input_dim),
        })
    }

    /// Checks dimensions read back from a checkpoint.
    fn validate(&self, config: &AttentionConfig) -> LayerResult<()> {
        for (field, dim) in [
            ("inputDim", self.input_dim),
            ("keyInputDim", self.key_input_dim),
            ("valueInputDim", self.value_input_dim),
            ("outputDim", self.output_dim),
        ] {
            if dim == 0 {
                return Err(LayerError::config(field, "must be positive"));
            }
        }
        match config.output_dim {
            Some(output_dim) if output_dim != self.output_dim => Err(LayerError::config(
                "outputDim",
                format!(
                    "checkpoint dims give {} but the config asks for {}",
                    self.output_dim, output_dim
                ),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for AttentionDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "query {}, key {}, value {}, output {}",
            self.input_dim, self.key_input_dim, self.value_input_dim, self.output_dim
        )
    }
}

fn trailing_dim(context: &'static str, shape: &Shape) -> LayerResult<usize> {
    match shape.last() {
        Some(dim) if shape.rank() == 3 && dim > 0 => Ok(dim),
        _ => Err(LayerError::shape(
            context,
            "[batch, seq, dim] with a known dim",
            shape,
        )),
    }
}

/// The four projections, owned by one attention layer for its whole lifetime.
#[derive(Clone, Debug)]
struct AttentionParams {
    dims: AttentionDims,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
}

impl AttentionParams {
    fn new(config: &AttentionConfig, dims: AttentionDims, rng: &mut StdRng) -> Self {
        let heads = config.num_heads;
        let bias = config.use_bias;
        AttentionParams {
            dims,
            w_q: Linear::new(dims.input_dim, heads * config.key_dim, bias, rng),
            w_k: Linear::new(dims.key_input_dim, heads * config.key_dim, bias, rng),
            w_v: Linear::new(dims.value_input_dim, heads * config.value_dim(), bias, rng),
            w_o: Linear::new(heads * config.value_dim(), dims.output_dim, bias, rng),
        }
    }

    fn parts(&self) -> [(&'static str, &'static str, &Linear); 4] {
        [
            ("kernel_q", "bias_q", &self.w_q),
            ("kernel_k", "bias_k", &self.w_k),
            ("kernel_v", "bias_v", &self.w_v),
            ("kernel_o", "bias_o", &self.w_o),
        ]
    }

    fn parts_mut(&mut self) -> [(&'static str, &'static str, &mut Linear); 4] {
        [
            ("kernel_q", "bias_q", &mut self.w_q),
            ("kernel_k", "bias_k", &mut self.w_k),
            ("kernel_v", "bias_v", &mut self.w_v),
            ("kernel_o", "bias_o", &mut self.w_o),
        ]
    }

    fn named(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        let mut named = Vec::with_capacity(8);
        for (kernel_name, bias_name, linear) in self.parts() {
            named.push((kernel_name, linear.kernel.view().into_dyn()));
            if let Some(bias) = &linear.bias {
                named.push((bias_name, bias.view().into_dyn()));
            }
        }
        named
    }

    fn get_mut(&mut self, name: &str) -> LayerResult<ArrayViewMutD<'_, f32>> {
        for (kernel_name, bias_name, linear) in self.parts_mut() {
            if name == kernel_name {
                return Ok(linear.kernel.view_mut().into_dyn());
            }
            if name == bias_name {
                if let Some(bias) = linear.bias.as_mut() {
                    return Ok(bias.view_mut().into_dyn());
                }
            }
        }
        Err(LayerError::UnknownParameter(name.to_string()))
    }

    fn check_inputs<'a>(
        &self,
        query: &ArrayView3<'a, f32>,
        key: &ArrayView3<'a, f32>,
        value: &ArrayView3<'a, f32>,
    ) -> LayerResult<()> {
        for (context, view, expected) in [
            ("query", query, self.dims.input_dim),
            ("key", key, self.dims.key_input_dim),
            ("value", value, self.dims.value_input_dim),
        ] {
            let (batch, seq, dim) = view.dim();
            if dim != expected || batch == 0 || seq == 0 {
                return Err(LayerError::shape(
                    context,
                    format!("non-empty [batch, seq, {}]", expected),
                    Shape::of_view(view),
                ));
            }
            if batch != query.dim().0 {
                return Err(LayerError::shape(
                    "batch size",
                    query.dim().0,
                    format!("{} for {}", batch, context),
                ));
            }
        }
        if key.dim().1 != value.dim().1 {
            return Err(LayerError::shape(
                "value sequence length",
                key.dim().1,
                value.dim().1,
            ));
        }
        Ok(())
    }
}

/// Result of a forward pass. Weights are present only when the layer keeps them.
#[derive(Clone, Debug)]
pub struct AttentionOutput {
    pub output: Array3<f32>,
    pub attention_weights: Option<AttentionWeights>,
}

/// Multi-head scaled dot-product attention, `softmax(QK^T / sqrt(key_dim))V`.
///
/// Parameters are created by [`MultiHeadAttention::initialize`] once input shapes are
/// known. Masking is not applied: every query position attends to every key position.
/// No residual connection is added; compose one with [`crate::cpu_utils::add_residual`].
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    keep_attention_weights: bool,
    params: Option<AttentionParams>,
}

impl MultiHeadAttention {
    pub fn new(config: AttentionConfig) -> LayerResult<Self> {
        config.validate()?;
        Ok(MultiHeadAttention {
            keep_attention_weights: config.keep_attention_weights,
            config,
            params: None,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn dims(&self) -> Option<AttentionDims> {
        self.params.as_ref().map(|p| p.dims)
    }

    pub fn is_built(&self) -> bool {
        self.params.is_some()
    }

    pub fn keep_attention_weights(&self) -> bool {
        self.keep_attention_weights
    }

    pub fn set_keep_attention_weights(&mut self, keep: bool) {
        self.keep_attention_weights = keep;
    }

    /// Allocates and initialises parameters for the given input shapes.
    ///
    /// Repeating the call with the same trailing dimensions is a no-op; different
    /// dimensions fail with [`LayerError::ShapeMismatch`].
    pub fn initialize(&mut self, inputs: AttentionInputs<&Shape>) -> LayerResult<()> {
        let dims = AttentionDims::resolve(&self.config, &inputs.resolve())?;
        self.initialize_with_dims(dims)
    }

    fn initialize_with_dims(&mut self, dims: AttentionDims) -> LayerResult<()> {
        if let Some(params) = &self.params {
            if params.dims != dims {
                return Err(LayerError::shape("attention rebuild", params.dims, dims));
            }
            return Ok(());
        }
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        debug!(
            num_heads = self.config.num_heads,
            key_dim = self.config.key_dim,
            value_dim = self.config.value_dim(),
            %dims,
            "building multi-head attention"
        );
        self.params = Some(AttentionParams::new(&self.config, dims, &mut rng));
        Ok(())
    }

    /// Output shape for the given input shapes, without running the layer.
    pub fn infer_output_shape(&self, inputs: AttentionInputs<&Shape>) -> LayerResult<Shape> {
        let shapes = inputs.resolve();
        for (context, shape) in [("query", shapes.query), ("key", shapes.key), ("value", shapes.value)] {
            if shape.rank() != 3 {
                return Err(LayerError::shape(context, "rank 3", shape));
            }
        }
        let output_dim = match (&self.params, self.config.output_dim) {
            (Some(params), _) => {
                let dims = params.dims;
                for (context, shape, expected) in [
                    ("query", shapes.query, dims.input_dim),
                    ("key", shapes.key, dims.key_input_dim),
                    ("value", shapes.value, dims.value_input_dim),
                ] {
                    if shape.last().is_some_and(|dim| dim != expected) {
                        return Err(LayerError::shape(
                            context,
                            format!("[batch, seq, {}]", expected),
                            shape,
                        ));
                    }
                }
                Some(dims.output_dim)
            }
            (None, Some(output_dim)) => Some(output_dim),
            // An unbound query width carries through until build.
            (None, None) => match shapes.query.last() {
                Some(_) => Some(trailing_dim("query", shapes.query)?),
                None => None,
            },
        };
        let query = shapes.query.dims();
        Ok(Shape::new(vec![query[0], query[1], output_dim]))
    }

    pub fn forward(&self, inputs: AttentionInputs<ArrayView3<'_, f32>>) -> LayerResult<AttentionOutput> {
        let params = self
            .params
            .as_ref()
            .ok_or(LayerError::Uninitialized("call initialize before forward"))?;
        let Qkv { query, key, value } = inputs.resolve();
        params.check_inputs(&query, &key, &value)?;

        let heads = self.config.num_heads;
        let key_dim = self.config.key_dim;
        let value_dim = self.config.value_dim();
        let (batch, seq_q, _) = query.dim();
        let seq_k = key.dim().1;
        trace!(batch, seq_q, seq_k, "attention forward");

        let q = split_heads(params.w_q.forward(query.into_dyn())?, heads, key_dim)?;
        let k = split_heads(params.w_k.forward(key.into_dyn())?, heads, key_dim)?;
        let v = split_heads(params.w_v.forward(value.into_dyn())?, heads, value_dim)?;

        let scale = 1.0 / (key_dim as f32).sqrt();
        let head_results: Vec<HeadResult> = (0..batch * heads)
            .into_par_iter()
            .map(|idx| {
                let (b, h) = (idx / heads, idx % heads);
                let q_h = q.slice(s![b, h, .., ..]);
                let k_h = k.slice(s![b, h, .., ..]);
                let v_h = v.slice(s![b, h, .., ..]);
                let mut weights = q_h.dot(&k_h.t()) * scale;
                softmax_rows(weights.view_mut());
                let context = weights.dot(&v_h);
                (weights, context)
            })
            .collect();

        let mut weights = Array4::<f32>::zeros((batch, heads, seq_q, seq_k));
        let mut context = Array4::<f32>::zeros((batch, heads, seq_q, value_dim));
        for (idx, (weights_head, context_head)) in head_results.into_iter().enumerate() {
            let (b, h) = (idx / heads, idx % heads);
            weights.slice_mut(s![b, h, .., ..]).assign(&weights_head);
            context.slice_mut(s![b, h, .., ..]).assign(&context_head);
        }
        check_row_sums(&weights);

        let combined = combine_heads(context)?;
        let output = params
            .w_o
            .forward(combined.view().into_dyn())?
            .into_dimensionality::<Ix3>()
            .map_err(|e| LayerError::shape("attention output", "rank 3", e))?;

        Ok(AttentionOutput {
            output,
            attention_weights: self
                .keep_attention_weights
                .then(|| AttentionWeights::new(weights)),
        })
    }

    /// Parameters in persistence order: `kernel_q, bias_q, kernel_k, bias_k, kernel_v,
    /// bias_v, kernel_o, bias_o`. Biases are absent when the layer has none.
    pub fn get_weights(&self) -> LayerResult<Vec<NamedTensor>> {
        let params = self.built()?;
        Ok(params
            .named()
            .into_iter()
            .map(|(name, view)| NamedTensor::from_array(name, view))
            .collect())
    }

    /// Restores parameters by name. Every entry is checked before any is written.
    pub fn set_weights(&mut self, weights: &[NamedTensor]) -> LayerResult<()> {
        let params = self.built()?;
        let arrays = weights
            .iter()
            .map(|tensor| -> LayerResult<(&str, ArrayD<f32>)> {
                let expected = params
                    .named()
                    .into_iter()
                    .find(|(name, _)| *name == tensor.name)
                    .map(|(_, view)| view.shape().to_vec())
                    .ok_or_else(|| LayerError::UnknownParameter(tensor.name.clone()))?;
                if expected != tensor.shape {
                    return Err(LayerError::shape(
                        "restored parameter",
                        Shape::from(expected.as_slice()),
                        Shape::from(tensor.shape.as_slice()),
                    ));
                }
                Ok((tensor.name.as_str(), tensor.to_array()?))
            })
            .collect::<LayerResult<Vec<_>>>()?;
        for (name, array) in arrays {
            self.parameter_mut(name)?.assign(&array);
        }
        Ok(())
    }

    /// Mutable view of one parameter, for an external optimizer. Shape is fixed.
    pub fn parameter_mut(&mut self, name: &str) -> LayerResult<ArrayViewMutD<'_, f32>> {
        self.params
            .as_mut()
            .ok_or(LayerError::Uninitialized("layer has no parameters before initialize"))?
            .get_mut(name)
    }

    pub fn checkpoint(&self) -> LayerResult<AttentionCheckpoint> {
        Ok(AttentionCheckpoint {
            config: self.config.clone(),
            dims: self.built()?.dims,
            weights: self.get_weights()?,
        })
    }

    pub fn from_checkpoint(checkpoint: &AttentionCheckpoint) -> LayerResult<Self> {
        let mut layer = MultiHeadAttention::new(checkpoint.config.clone())?;
        checkpoint.dims.validate(&checkpoint.config)?;
        layer.initialize_with_dims(checkpoint.dims)?;
        if let Some((missing, _)) = layer
            .built()?
            .named()
            .into_iter()
            .find(|(name, _)| !checkpoint.weights.iter().any(|t| t.name == *name))
        {
            return Err(LayerError::MissingParameter(missing.to_string()));
        }
        layer.set_weights(&checkpoint.weights)?;
        Ok(layer)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> LayerResult<()> {
        self.checkpoint()?.save_json(path)
    }

    pub fn load_json(path: impl AsRef<Path>) -> LayerResult<Self> {
        Self::from_checkpoint(&AttentionCheckpoint::load_json(path)?)
    }

    fn built(&self) -> LayerResult<&AttentionParams> {
        self.params
            .as_ref()
            .ok_or(LayerError::Uninitialized("layer has no parameters before initialize"))
    }
}

impl Layer for MultiHeadAttention {
    fn class_name(&self) -> &'static str {
        "MultiHeadAttention"
    }

    /// Carries the live `keepAttentionWeights` flag, which may differ from construction.
    fn spec(&self) -> LayerSpec {
        let mut config = self.config.clone();
        config.keep_attention_weights = self.keep_attention_weights;
        LayerSpec::MultiHeadAttention(config)
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> LayerResult<Shape> {
        let shapes: Vec<&Shape> = input_shapes.iter().collect();
        self.infer_output_shape(AttentionInputs::from_list(&shapes)?)
    }

    fn build(&mut self, input_shapes: &[Shape]) -> LayerResult<()> {
        let shapes: Vec<&Shape> = input_shapes.iter().collect();
        self.initialize(AttentionInputs::from_list(&shapes)?)
    }

    fn call(&self, inputs: &[ArrayView3<'_, f32>]) -> LayerResult<Array3<f32>> {
        Ok(self.forward(AttentionInputs::from_list(inputs)?)?.output)
    }
}

/// `[batch, seq, heads * dim]` to `[batch, heads, seq, dim]`.
fn split_heads(x: ArrayD<f32>, heads: usize, dim: usize) -> LayerResult<Array4<f32>> {
    let x = x
        .into_dimensionality::<Ix3>()
        .map_err(|e| LayerError::shape("split heads", "rank 3", e))?;
    let (batch, seq, _) = x.dim();
    let x = x
        .into_shape_with_order((batch, seq, heads, dim))
        .map_err(|e| LayerError::shape("split heads", heads * dim, e))?;
    Ok(x.permuted_axes([0, 2, 1, 3]))
}

/// `[batch, heads, seq, dim]` to `[batch, seq, heads * dim]`.
fn combine_heads(x: Array4<f32>) -> LayerResult<Array3<f32>> {
    let (batch, heads, seq, dim) = x.dim();
    x.permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, seq, heads * dim))
        .map_err(|e| LayerError::shape("combine heads", heads * dim, e))
}

/// Warns when some row is not a distribution within tolerance. Returns whether it warned.
fn check_row_sums(weights: &Array4<f32>) -> bool {
    let deviation = max_row_deviation(weights.view());
    let unstable = !deviation.is_finite() || deviation > ROW_SUM_TOLERANCE;
    if unstable {
        warn!(
            deviation,
            tolerance = ROW_SUM_TOLERANCE,
            "attention weights are not row-stochastic"
        );
    }
    unstable
}
