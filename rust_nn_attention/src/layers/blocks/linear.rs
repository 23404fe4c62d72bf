use crate::cpu_utils::Shape;
use crate::error::{LayerError, LayerResult};
use ndarray::{Array1, Array2, ArrayD, ArrayViewD};
use rand::Rng;
use rand::distributions::{Distribution, Uniform};

/// Dense projection over the trailing axis.
#[derive(Clone, Debug)]
pub struct Linear {
    pub kernel: Array2<f32>,       // shape: [in_dim][out_dim]
    pub bias: Option<Array1<f32>>, // shape: [out_dim]
}

impl Linear {
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, use_bias: bool, rng: &mut R) -> Self {
        // Xavier/Glorot uniform initialization
        let limit = (6.0f32 / (in_dim as f32 + out_dim as f32)).sqrt();
        let dist = Uniform::new(-limit, limit);
        let kernel = Array2::from_shape_simple_fn((in_dim, out_dim), || dist.sample(&mut *rng));
        let bias = use_bias.then(|| Array1::zeros(out_dim));
        Linear { kernel, bias }
    }

    pub fn in_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.ncols()
    }

    /// Projects `[.., in_dim]` to `[.., out_dim]`. Leading axes are flattened for the
    /// matrix product and restored afterwards, so 2D and 3D inputs behave identically.
    pub fn forward(&self, input: ArrayViewD<'_, f32>) -> LayerResult<ArrayD<f32>> {
        let shape = input.shape();
        let rank = shape.len();
        if rank < 2 || shape[rank - 1] != self.in_dim() {
            return Err(LayerError::shape(
                "projection input",
                format!("rank >= 2 with trailing dimension {}", self.in_dim()),
                Shape::from(shape),
            ));
        }
        let rows: usize = shape[..rank - 1].iter().product();
        let flat = input
            .to_shape((rows, self.in_dim()))
            .map_err(|e| LayerError::shape("projection flatten", rows, e))?;
        let mut out = flat.dot(&self.kernel);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        let mut out_shape = shape[..rank - 1].to_vec();
        out_shape.push(self.out_dim());
        out.into_shape_with_order(out_shape)
            .map_err(|e| LayerError::shape("projection restore", "leading axes", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn glorot_init_stays_within_limit_and_bias_starts_at_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        let linear = Linear::new(6, 10, true, &mut rng);
        let limit = (6.0f32 / 16.0).sqrt();
        assert_eq!(linear.kernel.dim(), (6, 10));
        assert!(linear.kernel.iter().all(|w| w.abs() <= limit));
        assert_eq!(linear.bias, Some(Array1::zeros(10)));
        assert!(Linear::new(6, 10, false, &mut rng).bias.is_none());
    }

    #[test]
    fn flattened_and_batched_inputs_project_identically() -> LayerResult<()> {
        let linear = Linear {
            kernel: array![[1.0, 2.0], [0.0, -1.0], [0.5, 0.5]],
            bias: Some(array![0.1, -0.1]),
        };
        let x3 = Array3::from_shape_fn((2, 3, 3), |(b, s, d)| (b * 9 + s * 3 + d) as f32 * 0.1);
        let out3 = linear.forward(x3.view().into_dyn())?;
        let x2 = x3.to_shape((6, 3)).map_err(|e| LayerError::shape("test", "", e))?;
        let out2 = linear.forward(x2.view().into_dyn())?;
        assert_eq!(out3.shape(), &[2, 3, 2]);
        assert_eq!(out2.shape(), &[6, 2]);
        let out3_flat = out3.to_shape((6, 2)).map_err(|e| LayerError::shape("test", "", e))?;
        assert_abs_diff_eq!(out3_flat.into_dyn(), out2.view(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn wrong_trailing_dimension_fails() {
        let mut rng = StdRng::seed_from_u64(1);
        let linear = Linear::new(4, 2, true, &mut rng);
        let x = Array3::<f32>::zeros((1, 2, 5));
        assert!(matches!(
            linear.forward(x.view().into_dyn()),
            Err(LayerError::ShapeMismatch { .. })
        ));
    }
}
