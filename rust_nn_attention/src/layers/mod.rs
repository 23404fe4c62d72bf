pub mod attention_scores;
pub mod blocks;
pub mod config;
pub mod inputs;

use crate::cpu_utils::Shape;
use crate::error::{LayerError, LayerResult};
use blocks::{MultiHeadAttention, SliceLayer};
use config::{AttentionConfig, SliceConfig};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Contract shared by every layer a model can hold as `Box<dyn Layer>`.
pub trait Layer: Send + Sync {
    fn class_name(&self) -> &'static str;

    /// Config that rebuilds an equivalent (unbuilt) layer.
    fn spec(&self) -> LayerSpec;

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> LayerResult<Shape>;

    fn build(&mut self, input_shapes: &[Shape]) -> LayerResult<()>;

    fn call(&self, inputs: &[ArrayView3<'_, f32>]) -> LayerResult<Array3<f32>>;
}

/// Serialisable layer config, tagged by class name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum LayerSpec {
    MultiHeadAttention(AttentionConfig),
    SliceLayer(SliceConfig),
}

impl LayerSpec {
    pub const CLASS_NAMES: [&'static str; 2] = ["MultiHeadAttention", "SliceLayer"];

    pub fn from_json(json: &str) -> LayerResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let class_name = value
            .get("className")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !Self::CLASS_NAMES.contains(&class_name) {
            return Err(LayerError::UnknownLayer(class_name.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> LayerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_layer(self) -> LayerResult<Box<dyn Layer>> {
        let layer: Box<dyn Layer> = match self {
            LayerSpec::MultiHeadAttention(config) => Box::new(MultiHeadAttention::new(config)?),
            LayerSpec::SliceLayer(config) => Box::new(SliceLayer::new(config)?),
        };
        Ok(layer)
    }
}
