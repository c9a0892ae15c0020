use std::iter;

use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::{Model, activations::ActFn, layers::Dense};
use crate::{MlErr, Result, StateDict, Tensor};

/// The shape of a `Classifier`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSpec {
    /// Width of a flattened input sample.
    pub input: usize,
    /// Widths of the hidden backbone layers.
    pub hidden: Vec<usize>,
    /// Amount of output classes.
    pub classes: usize,
}

/// Where the backbone weights of a new `Classifier` come from.
#[derive(Debug, Clone)]
pub enum Backbone {
    /// Xavier uniform initialization.
    Fresh,
    /// Pre-trained `backbone.*` entries; the head is still freshly initialized.
    Pretrained(StateDict),
}

/// A feed forward classifier: a ReLU backbone followed by a linear head sized to
/// the amount of classes.
///
/// State entries are named `backbone.{i}.weight`, `backbone.{i}.bias`,
/// `head.weight` and `head.bias`, weights shaped `[in, out]`.
#[derive(Debug, Clone)]
pub struct Classifier {
    backbone: Vec<Dense>,
    head: Dense,
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl Classifier {
    /// Creates a new `Classifier`.
    ///
    /// # Arguments
    /// * `spec` - The layer widths.
    /// * `backbone` - Whether to start from fresh or pre-trained backbone weights.
    /// * `rng` - The source of randomness for weight initialization.
    ///
    /// # Returns
    /// A new classifier or an error if `spec` is degenerate or the pre-trained
    /// weights don't fit it.
    pub fn new<R: Rng + ?Sized>(spec: &ClassifierSpec, backbone: Backbone, rng: &mut R) -> Result<Self> {
        if spec.input == 0 || spec.classes == 0 || spec.hidden.contains(&0) {
            return Err(MlErr::InvalidConfig(format!(
                "every layer width must be positive, got {spec:?}"
            )));
        }

        let mut dims = Vec::with_capacity(spec.hidden.len() + 1);
        let mut prev = spec.input;
        for &width in &spec.hidden {
            dims.push((prev, width));
            prev = width;
        }

        let layers: Vec<_> = dims
            .into_iter()
            .map(|dim| Dense::new(dim, Some(ActFn::relu())))
            .collect();
        let head = Dense::new((prev, spec.classes), None);

        let size = layers.iter().map(Dense::size).sum::<usize>() + head.size();
        let mut params = Vec::with_capacity(size);
        for layer in layers.iter().chain(iter::once(&head)) {
            xavier_uniform(layer.dim(), rng, &mut params)?;
        }

        let mut classifier = Self {
            backbone: layers,
            head,
            grad: vec![0.0; params.len()],
            params,
        };

        if let Backbone::Pretrained(state) = backbone {
            classifier.load_backbone(&state)?;
        }

        Ok(classifier)
    }

    /// Overwrites the backbone weights with the `backbone.*` entries of `state`,
    /// leaving the head untouched.
    pub fn load_backbone(&mut self, state: &StateDict) -> Result<()> {
        self.load_entries(state, false)
    }

    /// Yields the state name, parameter offset and dimensions of every layer in order.
    fn layout(&self) -> Vec<(String, usize, (usize, usize))> {
        let mut offset = 0;
        self.backbone
            .iter()
            .enumerate()
            .map(|(i, layer)| (format!("backbone.{i}"), layer))
            .chain(iter::once(("head".to_string(), &self.head)))
            .map(|(name, layer)| {
                let entry = (name, offset, layer.dim());
                offset += layer.size();
                entry
            })
            .collect()
    }

    fn load_entries(&mut self, state: &StateDict, include_head: bool) -> Result<()> {
        let layout = self.layout();
        let mut updates = Vec::with_capacity(layout.len() * 2);

        // Validate everything before writing so a bad state leaves the model intact.
        for (name, offset, (n, m)) in layout {
            if !include_head && name == "head" {
                continue;
            }

            let weight = state.expect(&format!("{name}.weight"), &[n, m])?;
            let bias = state.expect(&format!("{name}.bias"), &[m])?;
            updates.push((offset, weight));
            updates.push((offset + n * m, bias));
        }

        for (offset, tensor) in updates {
            let len = tensor.data().len();
            self.params[offset..offset + len].copy_from_slice(tensor.data());
        }

        Ok(())
    }
}

fn xavier_uniform<R: Rng + ?Sized>(
    (n, m): (usize, usize),
    rng: &mut R,
    params: &mut Vec<f32>,
) -> Result<()> {
    let limit = (6.0 / (n + m) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit)
        .map_err(|e| MlErr::InvalidConfig(format!("xavier bounds for ({n}, {m}): {e}")))?;

    params.extend(dist.sample_iter(&mut *rng).take(n * m));
    params.extend(iter::repeat_n(0.0, m));
    Ok(())
}

impl Model for Classifier {
    fn size(&self) -> usize {
        self.params.len()
    }

    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let Self {
            backbone,
            head,
            params,
            ..
        } = self;

        let mut offset = 0;
        let mut a = x.to_owned();
        for layer in backbone.iter_mut().chain(iter::once(head)) {
            let size = layer.size();
            a = layer.forward(&params[offset..offset + size], a.view())?;
            offset += size;
        }

        Ok(a)
    }

    fn backward(&mut self, d: ArrayView2<f32>) -> Result<()> {
        let Self {
            backbone,
            head,
            params,
            grad,
        } = self;

        let mut end = params.len();
        let mut d = d.to_owned();
        for layer in backbone.iter_mut().chain(iter::once(head)).rev() {
            let start = end - layer.size();
            d = layer.backward(&params[start..end], &mut grad[start..end], d)?;
            end = start;
        }

        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    fn parameters(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.params, &mut self.grad)
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();

        for (name, offset, (n, m)) in self.layout() {
            let w = self.params[offset..offset + n * m].to_vec();
            let b = self.params[offset + n * m..offset + (n + 1) * m].to_vec();

            // Slices are taken at exactly the shape's size.
            if let (Ok(w), Ok(b)) = (Tensor::new(vec![n, m], w), Tensor::new(vec![m], b)) {
                state.insert(format!("{name}.weight"), w);
                state.insert(format!("{name}.bias"), b);
            }
        }

        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.load_entries(state, true)
    }
}
