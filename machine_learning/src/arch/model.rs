use ndarray::{Array2, ArrayView2};

use crate::{Result, StateDict};

/// A trainable function from a batch of inputs to a batch of class scores.
///
/// Parameters and their gradients are kept as two flat buffers of equal length, so
/// any `Optimizer` can update them without knowing the architecture.
pub trait Model: Send {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// Computes the output for a batch, one row per sample.
    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Back-propagates `d`, the loss gradient with respect to the last `forward`
    /// output, accumulating into the model's gradient buffer.
    fn backward(&mut self, d: ArrayView2<f32>) -> Result<()>;

    /// Clears the accumulated gradient.
    fn zero_grad(&mut self);

    /// Returns the flat parameters together with their gradient, which may be
    /// rewritten before an optimizer step, e.g. averaged across workers.
    fn parameters(&mut self) -> (&mut [f32], &mut [f32]);

    /// Takes an independent copy of the full model state.
    fn state_dict(&self) -> StateDict;

    /// Restores a state taken with `state_dict`.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

impl<T: Model + ?Sized> Model for Box<T> {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        (**self).forward(x)
    }

    fn backward(&mut self, d: ArrayView2<f32>) -> Result<()> {
        (**self).backward(d)
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad()
    }

    fn parameters(&mut self) -> (&mut [f32], &mut [f32]) {
        (**self).parameters()
    }

    fn state_dict(&self) -> StateDict {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        (**self).load_state_dict(state)
    }
}
