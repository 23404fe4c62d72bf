//! Name-addressed parameter snapshots and JSON checkpoints.

use crate::error::{LayerError, LayerResult};
use crate::layers::blocks::multihead_attention::AttentionDims;
use crate::layers::config::AttentionConfig;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// One parameter tensor, flattened row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn from_array(name: &str, array: ArrayViewD<'_, f32>) -> Self {
        NamedTensor {
            name: name.to_string(),
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> LayerResult<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|e| {
            LayerError::shape("named tensor", format!("{} values", self.data.len()), e)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionCheckpoint {
    pub config: AttentionConfig,
    pub dims: AttentionDims,
    pub weights: Vec<NamedTensor>,
}

impl AttentionCheckpoint {
    pub fn save_json(&self, path: impl AsRef<Path>) -> LayerResult<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> LayerResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}
