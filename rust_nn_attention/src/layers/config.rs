//! Construction-time configuration for the attention and slice layers.
use crate::error::{LayerError, LayerResult};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_slice_size() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionConfig {
    pub num_heads: usize,
    /// Per-head size of queries and keys.
    pub key_dim: usize,
    /// Per-head size of values; `key_dim` when unset.
    #[serde(default)]
    pub value_dim: Option<usize>,
    /// Output width; resolved to the query's trailing dimension at build when unset.
    #[serde(default)]
    pub output_dim: Option<usize>,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    #[serde(default)]
    pub keep_attention_weights: bool,
    /// Seed for Glorot initialisation; entropy-seeded when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl AttentionConfig {
    pub fn new(num_heads: usize, key_dim: usize) -> Self {
        AttentionConfig {
            num_heads,
            key_dim,
            value_dim: None,
            output_dim: None,
            use_bias: true,
            keep_attention_weights: false,
            seed: None,
        }
    }

    pub fn with_value_dim(mut self, value_dim: usize) -> Self {
        self.value_dim = Some(value_dim);
        self
    }

    pub fn with_output_dim(mut self, output_dim: usize) -> Self {
        self.output_dim = Some(output_dim);
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_keep_attention_weights(mut self, keep: bool) -> Self {
        self.keep_attention_weights = keep;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim.unwrap_or(self.key_dim)
    }

    pub fn validate(&self) -> LayerResult<()> {
        positive("numHeads", self.num_heads)?;
        positive("keyDim", self.key_dim)?;
        positive("valueDim", self.value_dim())?;
        if let Some(output_dim) = self.output_dim {
            positive("outputDim", output_dim)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceConfig {
    #[serde(default)]
    pub start_index: usize,
    #[serde(default = "default_slice_size")]
    pub size: usize,
    /// Sequence length the layer is expected to receive, checked at construction.
    #[serde(default)]
    pub max_seq_len: Option<usize>,
}

impl Default for SliceConfig {
    fn default() -> Self {
        SliceConfig {
            start_index: 0,
            size: 1,
            max_seq_len: None,
        }
    }
}

impl SliceConfig {
    pub fn new(start_index: usize, size: usize) -> Self {
        SliceConfig {
            start_index,
            size,
            max_seq_len: None,
        }
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    /// Exclusive end of the window along the sequence axis, `None` on overflow.
    pub fn end_index(&self) -> Option<usize> {
        self.start_index.checked_add(self.size)
    }

    pub fn validate(&self) -> LayerResult<()> {
        positive("size", self.size)?;
        let end_index = self.end_index().ok_or_else(|| {
            LayerError::config(
                "startIndex",
                format!("window {} + {} overflows", self.start_index, self.size),
            )
        })?;
        if let Some(max_seq_len) = self.max_seq_len {
            if end_index > max_seq_len {
                return Err(LayerError::config(
                    "startIndex",
                    format!(
                        "window {}..{} does not fit a sequence of length {}",
                        self.start_index, end_index, max_seq_len
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: usize) -> LayerResult<()> {
    if value == 0 {
        return Err(LayerError::config(field, "must be positive"));
    }
    Ok(())
}
