use super::Optimizer;
use crate::{MlErr, Result, StateDict, Tensor};

const M: &str = "adam.m";
const V: &str = "adam.v";
const BETA1_T: &str = "adam.beta1_t";
const BETA2_T: &str = "adam.beta2_t";

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Creates an `Adam` optimizer with the usual `(0.9, 0.999, 1e-8)` hyperparameters.
    pub fn with_defaults(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        if grad.len() != params.len() || params.len() != self.m.len() {
            return Err(MlErr::SizeMismatch {
                what: "adam parameters",
                got: params.len().max(grad.len()),
                expected: self.m.len(),
            });
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
            .for_each(|(((p, g), m), v)| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g.powi(2);
                *p -= step_size * *m / (v.sqrt() + eps);
            });

        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let len = self.m.len();
        let mut state = StateDict::new();

        if let (Ok(m), Ok(v)) = (
            Tensor::new(vec![len], self.m.to_vec()),
            Tensor::new(vec![len], self.v.to_vec()),
        ) {
            state.insert(M, m);
            state.insert(V, v);
        }
        state.insert(BETA1_T, Tensor::scalar(self.beta1_t));
        state.insert(BETA2_T, Tensor::scalar(self.beta2_t));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let len = self.m.len();
        let m = state.expect(M, &[len])?;
        let v = state.expect(V, &[len])?;
        let beta1_t = state.expect(BETA1_T, &[1])?;
        let beta2_t = state.expect(BETA2_T, &[1])?;

        self.m.copy_from_slice(m.data());
        self.v.copy_from_slice(v.data());
        self.beta1_t = beta1_t.data()[0];
        self.beta2_t = beta2_t.data()[0];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_each_param_by_the_learning_rate() {
        let mut adam = Adam::with_defaults(2, 0.1);
        let mut params = [1.0, 1.0];
        adam.step(&mut params, &[3.0, -0.5]).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-5);
        assert!((params[1] - 1.1).abs() < 1e-5);
    }

    #[test]
    fn restored_state_continues_the_same_trajectory() {
        let grad = [0.3, -0.2, 0.1];
        let mut a = Adam::with_defaults(3, 0.01);
        let mut pa = [0.0; 3];
        a.step(&mut pa, &grad).unwrap();

        let mut b = Adam::with_defaults(3, 0.01);
        b.load_state_dict(&a.state_dict()).unwrap();
        let mut pb = pa;

        a.step(&mut pa, &grad).unwrap();
        b.step(&mut pb, &grad).unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn state_of_another_size_is_rejected() {
        let mut adam = Adam::with_defaults(3, 0.01);
        let other = Adam::with_defaults(2, 0.01);
        assert!(adam.load_state_dict(&other.state_dict()).is_err());
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let mut adam = Adam::with_defaults(2, 0.01);
        assert!(adam.step(&mut [0.0; 2], &[0.0; 3]).is_err());
    }
}
