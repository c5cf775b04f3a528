pub mod augmentation;
pub mod callbacks;
pub mod charts;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod history;
pub mod inference;
pub mod metric;
pub mod model;
pub mod training;

pub use error::{Error, Result};
pub use evaluation::{evaluate, EvaluationReport};
pub use inference::{load_model, predict};
pub use model::{PlantClassifier, PlantClassifierConfig};
pub use training::{train, TrainingConfig};
