mod config;

use config::DriverConfig;
use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rust_nn_attention::{
    AttentionInputs, AttentionRecorder, Layer, MultiHeadAttention, Shape, SliceLayer,
    add_residual,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading driver config");
            DriverConfig::load(path)?
        }
        None => DriverConfig::default(),
    };

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let dist = Uniform::new(-1.0f32, 1.0);
    let x = Array3::from_shape_simple_fn(
        (config.batch_size, config.seq_len, config.input_dim),
        || dist.sample(&mut rng),
    );

    let mut attention = MultiHeadAttention::new(config.attention.clone())?;
    let input_shape = Shape::batched(&[config.seq_len, config.input_dim]);
    attention.initialize(AttentionInputs::SelfAttention(&input_shape))?;
    let mut slice = SliceLayer::new(config.slice.clone())?;
    let attended_shape = attention.compute_output_shape(std::slice::from_ref(&input_shape))?;
    slice.build(std::slice::from_ref(&attended_shape))?;
    let sliced_shape = slice.compute_output_shape(std::slice::from_ref(&attended_shape))?;
    info!(input = %input_shape, attended = %attended_shape, sliced = %sliced_shape, "layers built");

    let mut recorder = AttentionRecorder::new(attention);
    let attended = recorder.call(AttentionInputs::SelfAttention(x.view()))?;
    let residual = add_residual(&attended, x.view())?;
    let window = slice.forward(residual.view())?;
    info!(output = ?window.dim(), "forward complete");

    match recorder.attention_scores() {
        Ok(scores) => {
            // Mean over heads of the first batch element.
            if let Some(mean) = scores.index_axis(Axis(0), 0).mean_axis(Axis(0)) {
                for (query_pos, row) in mean.outer_iter().enumerate() {
                    let row: Vec<String> = row.iter().map(|w| format!("{:.3}", w)).collect();
                    info!(query_pos, scores = %row.join(" "), "normalised attention");
                }
            }
        }
        Err(err) => warn!(%err, "attention scores unavailable"),
    }

    let path = std::env::temp_dir().join(format!("attention_env_{}.json", std::process::id()));
    recorder.layer().save_json(&path)?;
    let restored = MultiHeadAttention::load_json(&path)?;
    std::fs::remove_file(&path)?;
    let replayed = restored.forward(AttentionInputs::SelfAttention(x.view()))?;
    let max_diff = (&replayed.output - &attended)
        .iter()
        .fold(0.0f32, |acc, d| acc.max(d.abs()));
    info!(path = %path.display(), max_diff, "checkpoint round trip");

    Ok(())
}
