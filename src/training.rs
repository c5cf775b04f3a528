use std::path::Path;

use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, Optimizer, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{TrainStep, ValidStep},
};
use log::{debug, info};

use crate::{
    augmentation::AugmentationConfig,
    callbacks::{CheckpointConfig, EarlyStoppingConfig, ReduceLrOnPlateauConfig, Signal},
    dataset::{ClassificationBatch, DataPipeline},
    error::{self, Error},
    history::{History, ACCURACY, LEARNING_RATE, LOSS, VAL_ACCURACY, VAL_LOSS},
    metric::PassMetrics,
    model::{ClassificationOutput, PlantClassifier, PlantClassifierConfig},
};

pub const CONFIG_FILE: &str = "config.json";
pub const CLASSES_FILE: &str = "classes.json";
pub const HISTORY_FILE: &str = "training_history.json";
pub const FINAL_MODEL: &str = "plant_disease_model";

#[derive(Config)]
pub struct TrainingConfig {
    /// `num_classes` is replaced by the number of class folders found.
    pub model: PlantClassifierConfig,
    pub optimizer: SgdConfig,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,
    #[config(default = "EarlyStoppingConfig::new()")]
    pub early_stopping: EarlyStoppingConfig,
    #[config(default = "ReduceLrOnPlateauConfig::new()")]
    pub reduce_lr: ReduceLrOnPlateauConfig,
    #[config(default = "CheckpointConfig::new()")]
    pub checkpoint: CheckpointConfig,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.2)]
    pub validation_split: f64,
}

/// SGD with momentum 0.9 and no dampening.
pub fn sgd_with_momentum() -> SgdConfig {
    SgdConfig::new().with_momentum(Some(
        MomentumConfig::new().with_momentum(0.9).with_dampening(0.0),
    ))
}

impl TrainingConfig {
    /// Default recipe; the class count is filled in from the dataset.
    pub fn plant_disease() -> Self {
        Self::new(PlantClassifierConfig::new(0), sgd_with_momentum())
    }
}

pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: PlantClassifier<B>,
    pub history: History,
    pub pipeline: DataPipeline<B>,
    /// Epoch (zero based) at which early stopping ended the run.
    pub stopped_epoch: Option<usize>,
    /// Epoch whose weights were last written to the checkpoint file.
    pub checkpoint_epoch: Option<usize>,
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    dataset_dir: &Path,
    mut config: TrainingConfig,
    device: B::Device,
) -> error::Result<TrainingOutcome<B>> {
    B::seed(config.seed);

    let pipeline = DataPipeline::<B>::new(dataset_dir, &config, &device)?;
    if pipeline.num_train == 0 || pipeline.num_valid == 0 {
        return Err(Error::Dataset(format!(
            "need training and validation images, found {} and {}",
            pipeline.num_train, pipeline.num_valid
        )));
    }

    create_artifact_dir(artifact_dir)?;
    config.model.num_classes = pipeline.classes.len();
    config.save(format!("{artifact_dir}/{CONFIG_FILE}"))?;
    save_classes(artifact_dir, &pipeline.classes)?;

    let mut model = config.model.init_pretrained::<B>(&device)?;
    let mut optim = config.optimizer.init::<B, PlantClassifier<B>>();

    let mut early_stopping = config.early_stopping.init::<PlantClassifier<B>>();
    let mut reduce_lr = config.reduce_lr.init();
    let mut checkpoint = config.checkpoint.init();
    let recorder = CompactRecorder::new();

    let mut history = History::new();
    let mut learning_rate = config.learning_rate;

    info!(
        "Training on {} images, validating on {} images, {} classes",
        pipeline.num_train,
        pipeline.num_valid,
        pipeline.classes.len()
    );

    for epoch in 0..config.num_epochs {
        let (trained, train_metrics) =
            train_epoch(model, &mut optim, pipeline.train.as_ref(), learning_rate);
        model = trained;

        let valid_metrics = valid_epoch(&model.valid(), pipeline.valid.as_ref());

        history.record(LOSS, train_metrics.loss.value());
        history.record(ACCURACY, train_metrics.accuracy.value());
        history.record(VAL_LOSS, valid_metrics.loss.value());
        history.record(VAL_ACCURACY, valid_metrics.accuracy.value());
        history.record(LEARNING_RATE, learning_rate);

        info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - \
             val_accuracy: {:.4} - learning_rate: {:e}",
            epoch + 1,
            config.num_epochs,
            train_metrics.loss.value(),
            train_metrics.accuracy.value(),
            valid_metrics.loss.value(),
            valid_metrics.accuracy.value(),
            learning_rate
        );

        let signal = early_stopping.on_epoch_end(epoch, &history, &model);
        learning_rate = reduce_lr.on_epoch_end(epoch, &history, learning_rate);
        if checkpoint.on_epoch_end(epoch, &history) {
            model
                .clone()
                .save_file(format!("{artifact_dir}/{}", config.checkpoint.filename), &recorder)?;
        }

        if signal == Signal::Stop {
            break;
        }
    }

    let model = early_stopping.finish(model);

    model
        .clone()
        .save_file(format!("{artifact_dir}/{FINAL_MODEL}"), &recorder)?;
    history.save(format!("{artifact_dir}/{HISTORY_FILE}"))?;
    info!("Saved final model and training history to {artifact_dir}");

    Ok(TrainingOutcome {
        model,
        history,
        pipeline,
        stopped_epoch: early_stopping.stopped_epoch(),
        checkpoint_epoch: checkpoint.best_epoch(),
    })
}

fn train_epoch<B, O>(
    mut model: PlantClassifier<B>,
    optim: &mut O,
    loader: &dyn DataLoader<ClassificationBatch<B>>,
    learning_rate: f64,
) -> (PlantClassifier<B>, PassMetrics)
where
    B: AutodiffBackend,
    O: Optimizer<PlantClassifier<B>, B>,
{
    let mut metrics = PassMetrics::new();

    for (iteration, batch) in loader.iter().enumerate() {
        let step =
            <PlantClassifier<B> as TrainStep<_, ClassificationOutput<B>>>::step(&model, batch);

        let loss: f64 = step.item.loss.clone().into_scalar().elem();
        let (loss_entry, accuracy_entry) =
            metrics.update(loss, step.item.num_correct(), step.item.batch_size());
        debug!(
            "Iteration {} - {} - {}",
            iteration + 1,
            loss_entry.formatted,
            accuracy_entry.formatted
        );

        model = optim.step(learning_rate, model, step.grads);
    }

    (model, metrics)
}

fn valid_epoch<B: Backend>(
    model: &PlantClassifier<B>,
    loader: &dyn DataLoader<ClassificationBatch<B>>,
) -> PassMetrics {
    let mut metrics = PassMetrics::new();

    for batch in loader.iter() {
        let output =
            <PlantClassifier<B> as ValidStep<_, ClassificationOutput<B>>>::step(model, batch);
        let loss: f64 = output.loss.clone().into_scalar().elem();
        metrics.update(loss, output.num_correct(), output.batch_size());
    }

    metrics
}

fn save_classes(artifact_dir: &str, classes: &[String]) -> error::Result<()> {
    std::fs::write(
        format!("{artifact_dir}/{CLASSES_FILE}"),
        serde_json::to_string(classes)?,
    )?;
    Ok(())
}

pub fn load_classes(artifact_dir: &str) -> error::Result<Vec<String>> {
    let contents = std::fs::read_to_string(format!("{artifact_dir}/{CLASSES_FILE}"))?;
    Ok(serde_json::from_str(&contents)?)
}

fn create_artifact_dir(artifact_dir: &str) -> error::Result<()> {
    // Start every run from an empty artifact directory
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)?;
    Ok(())
}
