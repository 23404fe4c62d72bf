pub mod cpu_utils;
pub mod error;
pub mod layer_weights;
pub mod layers;

pub use cpu_utils::{Shape, add_residual};
pub use error::{LayerError, LayerResult};
pub use layer_weights::{AttentionCheckpoint, NamedTensor};
pub use layers::attention_scores::{AttentionRecorder, AttentionWeights};
pub use layers::blocks::{AttentionDims, AttentionOutput, MultiHeadAttention, SliceLayer};
pub use layers::config::{AttentionConfig, SliceConfig};
pub use layers::inputs::AttentionInputs;
pub use layers::{Layer, LayerSpec};
