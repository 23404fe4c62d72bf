use crate::cpu_utils::Shape;
use crate::error::{LayerError, LayerResult};
use crate::layers::config::SliceConfig;
use crate::layers::{Layer, LayerSpec};
use ndarray::{Array3, ArrayView3, s};

/// Takes a fixed window `[start_index, start_index + size)` along the sequence axis of
/// a `[batch, seq, dim]` tensor.
#[derive(Clone, Debug)]
pub struct SliceLayer {
    config: SliceConfig,
}

impl SliceLayer {
    pub fn new(config: SliceConfig) -> LayerResult<Self> {
        config.validate()?;
        Ok(SliceLayer { config })
    }

    pub fn config(&self) -> &SliceConfig {
        &self.config
    }

    pub fn infer_output_shape(&self, input: &Shape) -> LayerResult<Shape> {
        if input.rank() != 3 {
            return Err(LayerError::shape("slice input", "rank 3", input));
        }
        if let Some(seq_len) = input.dim(1) {
            self.check_window(seq_len)?;
        }
        let dims = input.dims();
        Ok(Shape::new(vec![dims[0], Some(self.config.size), dims[2]]))
    }

    pub fn forward(&self, x: ArrayView3<'_, f32>) -> LayerResult<Array3<f32>> {
        let end_index = self.check_window(x.dim().1)?;
        Ok(x.slice(s![.., self.config.start_index..end_index, ..]).to_owned())
    }

    /// Returns the exclusive end of the window once it is known to fit `seq_len`.
    fn check_window(&self, seq_len: usize) -> LayerResult<usize> {
        match self.config.end_index() {
            Some(end_index) if end_index <= seq_len => Ok(end_index),
            end_index => Err(LayerError::shape(
                "slice window",
                format!(
                    "window starting at {} of size {}",
                    self.config.start_index, self.config.size
                ),
                format!(
                    "sequence length {} (window end {})",
                    seq_len,
                    end_index.map_or_else(|| "overflows".to_string(), |end| end.to_string())
                ),
            )),
        }
    }
}

impl Layer for SliceLayer {
    fn class_name(&self) -> &'static str {
        "SliceLayer"
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::SliceLayer(self.config.clone())
    }

    fn compute_output_shape(&self, input_shapes: &[Shape]) -> LayerResult<Shape> {
        let input = input_shapes.first().ok_or(LayerError::InputCount(0))?;
        self.infer_output_shape(input)
    }

    fn build(&mut self, input_shapes: &[Shape]) -> LayerResult<()> {
        self.compute_output_shape(input_shapes).map(|_| ())
    }

    fn call(&self, inputs: &[ArrayView3<'_, f32>]) -> LayerResult<Array3<f32>> {
        let x = inputs.first().ok_or(LayerError::InputCount(0))?;
        self.forward(x.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn sequence(batch: usize, seq: usize, dim: usize) -> Array3<f32> {
        Array::from_shape_fn((batch, seq, dim), |(b, s, d)| (b * 100 + s * 10 + d) as f32)
    }

    #[test]
    fn window_selects_positions_for_every_batch_element() -> LayerResult<()> {
        let layer = SliceLayer::new(SliceConfig::new(2, 3))?;
        let x = sequence(2, 6, 4);
        let out = layer.forward(x.view())?;
        assert_eq!(out.dim(), (2, 3, 4));
        for b in 0..2 {
            for (i, pos) in (2..5).enumerate() {
                assert_eq!(out.slice(s![b, i, ..]), x.slice(s![b, pos, ..]));
            }
        }
        Ok(())
    }

    #[test]
    fn window_past_the_end_fails() -> LayerResult<()> {
        let layer = SliceLayer::new(SliceConfig::new(4, 3))?;
        let x = sequence(1, 6, 2);
        assert!(matches!(
            layer.forward(x.view()),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.infer_output_shape(&Shape::batched(&[6, 2])),
            Err(LayerError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn overflowing_window_from_json_is_an_error() -> LayerResult<()> {
        let spec = LayerSpec::from_json(
            r#"{"className": "SliceLayer", "startIndex": 18446744073709551615, "size": 1}"#,
        )?;
        assert!(matches!(
            spec.into_layer(),
            Err(LayerError::Configuration { field: "startIndex", .. })
        ));

        // Bypasses construction-time validation to reach the forward check.
        let layer = SliceLayer {
            config: SliceConfig::new(usize::MAX, 1),
        };
        let x = sequence(1, 4, 2);
        assert!(matches!(
            layer.forward(x.view()),
            Err(LayerError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn output_shape_keeps_batch_placeholder() -> LayerResult<()> {
        let layer = SliceLayer::new(SliceConfig::default())?;
        assert_eq!(
            layer.infer_output_shape(&Shape::batched(&[9, 5]))?,
            Shape::new(vec![None, Some(1), Some(5)])
        );
        assert_eq!(
            layer.compute_output_shape(&[Shape::new(vec![None, None, Some(5)])])?,
            Shape::new(vec![None, Some(1), Some(5)])
        );
        Ok(())
    }

    #[test]
    fn zero_size_is_a_configuration_error() {
        assert!(matches!(
            SliceLayer::new(SliceConfig::new(0, 0)),
            Err(LayerError::Configuration { .. })
        ));
    }
}
