use std::path::PathBuf;

use anyhow::Context;
use burn::{
    backend::{wgpu::WgpuDevice, Wgpu},
    config::Config,
    data::dataloader::DataLoaderBuilder,
};
use plant_disease_attention::{
    charts,
    dataset::{ClassificationBatcher, ImageFolder},
    evaluate,
    history::History,
    load_model,
    training::{CONFIG_FILE, FINAL_MODEL, HISTORY_FILE},
    TrainingConfig,
};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    type MyBackend = Wgpu<f32, i32>;

    let device = WgpuDevice::default();

    let dataset_dir = PathBuf::from(
        dotenvy::var("PLANT_DATASET_DIR")
            .context("PLANT_DATASET_DIR must point at the image folder")?,
    );
    let artifact_dir =
        dotenvy::var("PLANT_ARTIFACT_DIR").unwrap_or_else(|_| "artifacts".to_string());
    let record = dotenvy::var("PLANT_MODEL_RECORD").unwrap_or_else(|_| FINAL_MODEL.to_string());

    let config = TrainingConfig::load(format!("{artifact_dir}/{CONFIG_FILE}"))
        .map_err(|err| {
            anyhow::anyhow!("failed to load {CONFIG_FILE} from {artifact_dir}: {err:?}")
        })?;
    let trained = load_model::<MyBackend>(&artifact_dir, &record, &device)?;

    let history_path = format!("{artifact_dir}/{HISTORY_FILE}");
    if let Ok(history) = History::load(&history_path) {
        charts::render_training_curves(&history, format!("{artifact_dir}/training_curves.svg"))?;
    } else {
        log::warn!("No readable history at {history_path}, skipping training curves");
    }

    let folder = ImageFolder::new(&dataset_dir)?;
    anyhow::ensure!(
        folder.classes() == trained.classes.as_slice(),
        "dataset classes {:?} differ from the trained classes {:?}",
        folder.classes(),
        trained.classes
    );
    let (_, valid_set) = folder.split(config.validation_split)?;

    let batcher =
        ClassificationBatcher::<MyBackend>::new(device, trained.classes.len(), trained.input_size);
    let loader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_set);

    let report = evaluate(&trained.model, loader.as_ref(), &trained.classes);
    println!("Classification Report:");
    println!("{report}");

    charts::render_confusion_matrix(
        &report.matrix,
        &report.class_names,
        format!("{artifact_dir}/confusion_matrix.svg"),
    )?;

    Ok(())
}
