pub mod linear;
pub mod multihead_attention;
pub mod slice;

pub use linear::Linear;
pub use multihead_attention::{AttentionDims, AttentionOutput, MultiHeadAttention};
pub use slice::SliceLayer;
