use crate::{Result, StateDict};

/// An update rule for a flat buffer of parameters.
pub trait Optimizer: Send {
    /// Takes a step on `params` given their `grad`.
    ///
    /// # Returns
    /// An error if the buffers differ in length from each other or from the optimizer's state.
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    /// Takes an independent copy of the optimizer's running state.
    fn state_dict(&self) -> StateDict;

    /// Restores a state taken with `state_dict`.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}
