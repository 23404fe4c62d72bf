//! Shared CPU tensor helpers: symbolic shapes, row softmax and residual composition.

use crate::error::{LayerError, LayerResult};
use ndarray::{Array3, ArrayView, ArrayView3, ArrayViewMut2, Axis, Dimension};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tensor shape whose entries may be unbound (`None`), typically the batch axis
/// before a concrete batch is seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<Option<usize>>);

impl Shape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }

    /// Shape with an unbound leading batch axis followed by `dims`.
    pub fn batched(dims: &[usize]) -> Self {
        Self(std::iter::once(None).chain(dims.iter().map(|d| Some(*d))).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Size of `axis`, `None` when unbound or out of range.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied().flatten()
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied().flatten()
    }

    pub fn of_view<D: Dimension>(view: &ArrayView<'_, f32, D>) -> Self {
        Self::from(view.shape())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Some(d) => write!(f, "{}", d)?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.iter().map(|d| Some(*d)).collect())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::from(&dims[..])
    }
}

/// Numerically stable softmax over every row, in place.
pub fn softmax_rows(mut scores: ArrayViewMut2<'_, f32>) {
    for mut row in scores.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|e| e / sum);
    }
}

/// Largest absolute distance from 1 of any sum along the last axis. NaN propagates.
pub fn max_row_deviation<D: Dimension>(weights: ArrayView<'_, f32, D>) -> f32 {
    if weights.ndim() == 0 {
        return 0.0;
    }
    weights
        .lanes(Axis(weights.ndim() - 1))
        .into_iter()
        .map(|row| (row.sum() - 1.0).abs())
        .fold(0.0f32, |acc, d| if d.is_nan() || d > acc { d } else { acc })
}

/// Elementwise `output + query`, the skip connection callers compose around attention.
pub fn add_residual(output: &Array3<f32>, query: ArrayView3<'_, f32>) -> LayerResult<Array3<f32>> {
    if output.shape() != query.shape() {
        return Err(LayerError::shape(
            "residual add",
            Shape::from(output.shape()),
            Shape::from(query.shape()),
        ));
    }
    Ok(output + &query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn shape_display_marks_unbound_axes() {
        assert_eq!(Shape::batched(&[4, 8]).to_string(), "[?, 4, 8]");
        assert_eq!(Shape::from([2, 3]).to_string(), "[2, 3]");
    }

    #[test]
    fn shape_dim_is_none_for_placeholder_and_out_of_range() {
        let shape = Shape::batched(&[5, 7]);
        assert_eq!(shape.dim(0), None);
        assert_eq!(shape.dim(1), Some(5));
        assert_eq!(shape.dim(3), None);
        assert_eq!(shape.last(), Some(7));
        assert_eq!(shape.rank(), 3);
    }

    #[test]
    fn softmax_rows_is_stable_for_large_scores() {
        let mut scores: Array2<f32> = array![[1000.0, 1000.0], [0.0, -1000.0]];
        softmax_rows(scores.view_mut());
        assert!(scores.iter().all(|x| x.is_finite()));
        assert_abs_diff_eq!(scores[[0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(scores[[1, 0]], 1.0, epsilon = 1e-6);
        assert!(max_row_deviation(scores.view()) < 1e-6);
    }

    #[test]
    fn row_deviation_reports_nan_rows() {
        let weights: Array2<f32> = array![[0.5, 0.5], [f32::NAN, 1.0], [0.25, 0.25]];
        assert!(max_row_deviation(weights.view()).is_nan());
    }

    #[test]
    fn add_residual_rejects_mismatched_shapes() {
        let output = Array3::<f32>::zeros((1, 2, 3));
        let query = Array3::<f32>::ones((1, 2, 4));
        assert!(matches!(
            add_residual(&output, query.view()),
            Err(LayerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn add_residual_sums_elementwise() -> LayerResult<()> {
        let output = Array3::<f32>::from_elem((1, 2, 2), 0.5);
        let query = Array3::<f32>::ones((1, 2, 2));
        let sum = add_residual(&output, query.view())?;
        assert_abs_diff_eq!(sum, Array3::from_elem((1, 2, 2), 1.5), epsilon = 1e-6);
        Ok(())
    }
}
