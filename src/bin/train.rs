use std::path::PathBuf;

use anyhow::Context;
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff},
    config::Config,
    module::AutodiffModule,
};
use plant_disease_attention::{charts, evaluate, train, TrainingConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    type MyBackend = burn::backend::Wgpu<f32, i32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    let device = WgpuDevice::default();

    let dataset_dir = PathBuf::from(
        dotenvy::var("PLANT_DATASET_DIR")
            .context("PLANT_DATASET_DIR must point at the image folder")?,
    );
    let artifact_dir =
        dotenvy::var("PLANT_ARTIFACT_DIR").unwrap_or_else(|_| "artifacts".to_string());

    let config = match dotenvy::var("PLANT_TRAINING_CONFIG") {
        Ok(path) => TrainingConfig::load(&path)
            .map_err(|err| anyhow::anyhow!("failed to load training config {path}: {err:?}"))?,
        Err(_) => TrainingConfig::plant_disease(),
    };

    let outcome = train::<MyAutodiffBackend>(&artifact_dir, &dataset_dir, config, device)?;
    if let Some(epoch) = outcome.stopped_epoch {
        log::info!("Early stopping after epoch {}", epoch + 1);
    }

    charts::render_training_curves(
        &outcome.history,
        format!("{artifact_dir}/training_curves.svg"),
    )?;

    let model = outcome.model.valid();
    let report = evaluate(&model, outcome.pipeline.valid.as_ref(), &outcome.pipeline.classes);
    println!("Classification Report:");
    println!("{report}");

    charts::render_confusion_matrix(
        &report.matrix,
        &report.class_names,
        format!("{artifact_dir}/confusion_matrix.svg"),
    )?;

    Ok(())
}
