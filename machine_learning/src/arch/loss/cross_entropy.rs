use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;
use crate::{MlErr, Result};

/// Categorical cross entropy over raw class scores, averaged over the batch.
///
/// The softmax is applied internally, so `y_pred` are logits and `y` are one-hot
/// (or any probability) rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// Row-wise softmax, shifted by each row's max for stability.
    pub fn softmax(scores: ArrayView2<f32>) -> Array2<f32> {
        let mut p = scores.to_owned();

        for mut row in p.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }

        p
    }
}

fn check(y_pred: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<()> {
    if y_pred.dim() != y.dim() {
        return Err(MlErr::SizeMismatch {
            what: "loss targets",
            got: y.len(),
            expected: y_pred.len(),
        });
    }

    Ok(())
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32> {
        check(&y_pred, &y)?;

        let rows = y_pred.nrows();
        if rows == 0 {
            return Ok(0.0);
        }

        let mut total = 0.0;
        for (scores, target) in y_pred.rows().into_iter().zip(y.rows()) {
            let max = scores.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum = scores.mapv(|v| (v - max).exp()).sum().ln();

            total -= Zip::from(&scores)
                .and(&target)
                .fold(0.0, |acc, &s, &t| acc + t * (s - max - log_sum));
        }

        Ok(total / rows as f32)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Array2<f32>> {
        check(&y_pred, &y)?;

        let rows = y_pred.nrows().max(1) as f32;
        let mut d = Self::softmax(y_pred);
        d.zip_mut_with(&y, |p, &t| *p = (*p - t) / rows);
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_scores_cost_log_of_the_class_count() {
        let loss = CrossEntropy
            .loss(array![[0.0, 0.0, 0.0, 0.0]].view(), array![[0.0, 1.0, 0.0, 0.0]].view())
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn confident_correct_scores_cost_almost_nothing() {
        let loss = CrossEntropy
            .loss(array![[20.0, 0.0], [0.0, 20.0]].view(), array![[1.0, 0.0], [0.0, 1.0]].view())
            .unwrap();
        assert!(loss < 1e-6);
    }

    #[test]
    fn gradient_is_softmax_minus_target_over_rows() {
        let d = CrossEntropy
            .loss_prime(array![[0.0, 0.0], [0.0, 0.0]].view(), array![[1.0, 0.0], [0.0, 1.0]].view())
            .unwrap();
        assert_eq!(d, array![[-0.25, 0.25], [0.25, -0.25]]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let p = CrossEntropy::softmax(array![[1000.0, 1000.0], [1.0, 3.0]].view());
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert_eq!(p[[0, 0]], 0.5);
    }

    #[test]
    fn mismatched_targets_are_an_error() {
        assert!(CrossEntropy.loss(array![[0.0, 0.0]].view(), array![[1.0]].view()).is_err());
    }
}
