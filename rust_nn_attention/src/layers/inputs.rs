use crate::error::{LayerError, LayerResult};

/// Inputs to an attention layer, resolved once into concrete query/key/value.
///
/// Works over tensors and over shapes alike, so shape inference and forward share
/// the same defaulting rules.
#[derive(Clone, Debug)]
pub enum AttentionInputs<T> {
    /// Query, key and value are all the same source.
    SelfAttention(T),
    /// Query from one source, value (and key) from another. Key defaults to value.
    CrossAttention { query: T, value: T, key: Option<T> },
}

/// Query, key and value after defaulting.
#[derive(Clone, Debug)]
pub struct Qkv<T> {
    pub query: T,
    pub key: T,
    pub value: T,
}

impl<T: Clone> AttentionInputs<T> {
    /// Accepts `[query]`, `[query, value]` or `[query, value, key]`.
    pub fn from_list(items: &[T]) -> LayerResult<Self> {
        match items {
            [query] => Ok(AttentionInputs::SelfAttention(query.clone())),
            [query, value] => Ok(AttentionInputs::CrossAttention {
                query: query.clone(),
                value: value.clone(),
                key: None,
            }),
            [query, value, key] => Ok(AttentionInputs::CrossAttention {
                query: query.clone(),
                value: value.clone(),
                key: Some(key.clone()),
            }),
            _ => Err(LayerError::InputCount(items.len())),
        }
    }

    pub fn resolve(self) -> Qkv<T> {
        match self {
            AttentionInputs::SelfAttention(x) => Qkv {
                query: x.clone(),
                key: x.clone(),
                value: x,
            },
            AttentionInputs::CrossAttention { query, value, key } => Qkv {
                query,
                key: key.unwrap_or_else(|| value.clone()),
                value,
            },
        }
    }
}
