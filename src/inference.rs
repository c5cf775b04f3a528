use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    prelude::*,
    record::{CompactRecorder, Recorder},
};

use crate::{
    dataset::{image_to_chw, load_image},
    error::Result,
    model::PlantClassifier,
    training::{load_classes, TrainingConfig, CONFIG_FILE},
};

/// A trained classifier together with the class names it was trained on.
pub struct TrainedClassifier<B: Backend> {
    pub model: PlantClassifier<B>,
    pub classes: Vec<String>,
    pub input_size: usize,
}

/// Rebuilds a classifier from `config.json`, `classes.json` and the named record.
pub fn load_model<B: Backend>(
    artifact_dir: &str,
    record_name: &str,
    device: &B::Device,
) -> Result<TrainedClassifier<B>> {
    let config = TrainingConfig::load(format!("{artifact_dir}/{CONFIG_FILE}"))?;
    let classes = load_classes(artifact_dir)?;
    let record =
        CompactRecorder::new().load(format!("{artifact_dir}/{record_name}").into(), device)?;

    Ok(TrainedClassifier {
        model: config.model.init::<B>(device).load_record(record),
        classes,
        input_size: config.model.input_size,
    })
}

/// Class probabilities for a batch of `[N, 3, H, W]` images scaled to `[0, 1]`.
pub fn predict<B: Backend>(model: &PlantClassifier<B>, images: Tensor<B, 4>) -> Tensor<B, 2> {
    model.forward_softmax(images)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub class_name: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

impl<B: Backend> TrainedClassifier<B> {
    pub fn classify_image(&self, path: &Path, device: &B::Device) -> Result<Prediction> {
        let size = self.input_size;
        let image = load_image(path, size as u32)?;
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(image_to_chw(&image), [1, 3, size, size]).convert::<B::FloatElem>(),
            device,
        );

        let probabilities = predict(&self.model, images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .expect("probabilities should read back as f32");

        let (label, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, p)| if p > best.1 { (index, p) } else { best });

        Ok(Prediction {
            label,
            class_name: self.classes.get(label).cloned().unwrap_or_default(),
            confidence,
            probabilities,
        })
    }
}
