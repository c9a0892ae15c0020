use ndarray::{Array2, ArrayView2};

use crate::Result;

/// A differentiable measure of how far a batch of predictions is from its targets.
pub trait LossFn: Send {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32>;
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Array2<f32>>;
}
