pub mod activations;
mod classifier;
pub mod layers;
pub mod loss;
mod model;

pub use classifier::{Backbone, Classifier, ClassifierSpec};
pub use model::Model;
