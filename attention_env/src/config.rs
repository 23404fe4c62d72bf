use rust_nn_attention::{AttentionConfig, SliceConfig};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    pub attention: AttentionConfig,
    pub slice: SliceConfig,
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_dim: usize,
    pub seed: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            attention: AttentionConfig::new(4, 8)
                .with_keep_attention_weights(true)
                .with_seed(7),
            slice: SliceConfig::new(15, 1).with_max_seq_len(16),
            batch_size: 4,
            seq_len: 16,
            input_dim: 32,
            seed: Some(42),
        }
    }
}

impl DriverConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
