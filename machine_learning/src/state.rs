//! Named snapshots of model and optimizer state.
//!
//! A `StateDict` is an owned copy: taking one never aliases the live buffers of the
//! model or optimizer it came from, so later in-place updates can't leak into it.

use std::collections::BTreeMap;

use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{MlErr, Result};

/// A dense `f32` tensor, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values, must hold exactly `shape.iter().product()` items.
    ///
    /// # Returns
    /// A new `Tensor` or an error if the data doesn't fit the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().product();

        if data.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "tensor data",
                got: data.len(),
                expected,
            });
        }

        Ok(Self { shape, data })
    }

    /// Creates a one dimensional tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// An ordered mapping from parameter names to tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Returns the tensor under `name` checking it has the `expected` shape.
    ///
    /// # Returns
    /// The tensor, or an error if it is missing or has another shape.
    pub fn expect(&self, name: &str, expected: &[usize]) -> Result<&Tensor> {
        let tensor = self
            .get(name)
            .ok_or_else(|| MlErr::MissingEntry(name.to_string()))?;

        if tensor.shape() != expected {
            return Err(MlErr::ShapeMismatch {
                name: name.to_string(),
                got: tensor.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        Ok(tensor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, t)| (name.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Serializes this state dict into the safetensors format (little endian `F32`).
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let raw: Vec<(&str, &[usize], &[u8])> = self
            .iter()
            .map(|(name, t)| (name, t.shape(), bytemuck::cast_slice(t.data())))
            .collect();

        let views = raw
            .into_iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.to_vec(), bytes).map(|view| (name, view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(safetensors::serialize(views, &None)?)
    }

    /// Parses a state dict out of safetensors bytes.
    pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<Self> {
        let st = SafeTensors::deserialize(bytes)?;
        let mut state = Self::new();

        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(MlErr::UnsupportedDtype {
                    dtype: format!("{:?}", view.dtype()),
                    name,
                });
            }

            let data = bytemuck::pod_collect_to_vec::<u8, f32>(view.data());
            let tensor = Tensor::new(view.shape().to_vec(), data)?;
            state.insert(name, tensor);
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_rejects_data_that_does_not_fit_its_shape() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn safetensors_bytes_reproduce_the_exact_bits() {
        let mut state = StateDict::new();
        let weird = [f32::MIN_POSITIVE, -0.0, 1.0e-42, f32::MAX, 0.1];
        state.insert("head.weight", Tensor::new(vec![5, 1], weird.to_vec()).unwrap());
        state.insert("head.bias", Tensor::scalar(3.5));

        let bytes = state.to_safetensors_bytes().unwrap();
        let back = StateDict::from_safetensors_bytes(&bytes).unwrap();

        assert_eq!(back.len(), 2);
        let got = back.get("head.weight").unwrap();
        assert_eq!(got.shape(), &[5, 1]);

        let bits = |xs: &[f32]| xs.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(got.data()), bits(&weird));
        assert_eq!(back.get("head.bias").unwrap().data(), &[3.5]);
    }

    #[test]
    fn expect_checks_presence_and_shape() {
        let mut state = StateDict::new();
        state.insert("w", Tensor::new(vec![2, 2], vec![0.0; 4]).unwrap());

        assert!(state.expect("w", &[2, 2]).is_ok());
        assert!(matches!(
            state.expect("w", &[4]),
            Err(MlErr::ShapeMismatch { .. })
        ));
        assert!(matches!(state.expect("b", &[2]), Err(MlErr::MissingEntry(_))));
    }
}
