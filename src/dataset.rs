use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::Backend,
    tensor::{backend::AutodiffBackend, Int, Tensor, TensorData},
};
use image::{imageops::FilterType, RgbImage};
use log::{info, warn};
use walkdir::WalkDir;

use crate::augmentation::Augmenter;
use crate::error::{Error, Result};
use crate::training::TrainingConfig;

pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// A `root/<class_name>/<images>` tree. Classes are the sorted folder names.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    classes: Vec<String>,
    items: Vec<ImageItem>,
}

impl ImageFolder {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset directory does not exist: {}",
                root.display()
            )));
        }

        let mut classes = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();

        if classes.is_empty() {
            return Err(Error::Dataset(format!(
                "no class folders found in {}",
                root.display()
            )));
        }

        let mut items = Vec::new();
        for (label, class_name) in classes.iter().enumerate() {
            let before = items.len();
            for entry in WalkDir::new(root.join(class_name))
                .min_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|err| Error::Dataset(err.to_string()))?;
                if entry.file_type().is_file() && is_image(entry.path()) {
                    items.push(ImageItem {
                        path: entry.into_path(),
                        label,
                    });
                }
            }
            if items.len() == before {
                warn!("Class '{class_name}' has no images");
            }
        }

        info!(
            "Found {} images belonging to {} classes in {}",
            items.len(),
            classes.len(),
            root.display()
        );

        Ok(Self { classes, items })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// Splits every class independently: the first `floor(n * validation_split)`
    /// files (by name) go to validation, the remainder to training.
    pub fn split(
        &self,
        validation_split: f64,
    ) -> Result<(ImageClassificationDataset, ImageClassificationDataset)> {
        if !(0.0..1.0).contains(&validation_split) {
            return Err(Error::Config(format!(
                "validation_split must be in [0, 1), got {validation_split}"
            )));
        }

        let mut train = Vec::new();
        let mut valid = Vec::new();
        for label in 0..self.num_classes() {
            let class_items: Vec<&ImageItem> =
                self.items.iter().filter(|item| item.label == label).collect();
            let cut = (class_items.len() as f64 * validation_split) as usize;
            valid.extend(class_items[..cut].iter().map(|item| (*item).clone()));
            train.extend(class_items[cut..].iter().map(|item| (*item).clone()));
        }

        info!(
            "Split into {} training and {} validation images",
            train.len(),
            valid.len()
        );

        Ok((
            ImageClassificationDataset::new(train),
            ImageClassificationDataset::new(valid),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ImageClassificationDataset {
    items: Vec<ImageItem>,
}

impl ImageClassificationDataset {
    pub fn new(items: Vec<ImageItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }
}

impl Dataset<ImageItem> for ImageClassificationDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Decodes an image and resizes it to `size x size` with nearest sampling.
pub fn load_image(path: &Path, size: u32) -> Result<RgbImage> {
    let image = image::open(path)?;
    Ok(image.resize_exact(size, size, FilterType::Nearest).to_rgb8())
}

/// Channel-first pixels rescaled to `[0, 1]`.
pub fn image_to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            data[channel * plane + offset] = pixel[channel] as f32 / 255.0;
        }
    }
    data
}

pub fn one_hot(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        data[row * num_classes + label] = 1.0;
    }
    data
}

#[derive(Clone, Debug)]
pub struct ClassificationBatcher<B: Backend> {
    device: B::Device,
    num_classes: usize,
    image_size: usize,
    augmenter: Option<Augmenter>,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// `[batch, 3, height, width]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// One-hot `[batch, num_classes]`.
    pub targets: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new(device: B::Device, num_classes: usize, image_size: usize) -> Self {
        Self {
            device,
            num_classes,
            image_size,
            augmenter: None,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    fn prepare(&self, item: &ImageItem) -> Vec<f32> {
        let image = load_image(&item.path, self.image_size as u32)
            .unwrap_or_else(|err| panic!("failed to load {}: {err}", item.path.display()));
        let image = match &self.augmenter {
            Some(augmenter) => augmenter.augment(&image, &mut rand::thread_rng()),
            None => image,
        };
        image_to_chw(&image)
    }
}

impl<B: Backend> Batcher<ImageItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ClassificationBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let pixels: Vec<f32> = items.iter().flat_map(|item| self.prepare(item)).collect();
        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, 3, size, size]).convert::<B::FloatElem>(),
            &self.device,
        );
        let targets = Tensor::<B, 2>::from_data(
            TensorData::new(one_hot(&labels, self.num_classes), [batch_size, self.num_classes])
                .convert::<B::FloatElem>(),
            &self.device,
        );
        let labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                labels.iter().map(|&label| label as i64).collect::<Vec<_>>(),
                [batch_size],
            )
            .convert::<B::IntElem>(),
            &self.device,
        );

        ClassificationBatch {
            images,
            targets,
            labels,
        }
    }
}

/// Training and validation loaders over one image folder.
///
/// Each call to `iter()` on a loader starts a fresh pass, so both sequences
/// can be replayed once per epoch. Only the training loader augments.
pub struct DataPipeline<B: AutodiffBackend> {
    pub classes: Vec<String>,
    pub train: Arc<dyn DataLoader<ClassificationBatch<B>>>,
    pub valid: Arc<dyn DataLoader<ClassificationBatch<B::InnerBackend>>>,
    pub num_train: usize,
    pub num_valid: usize,
}

impl<B: AutodiffBackend> DataPipeline<B> {
    pub fn new(dataset_dir: &Path, config: &TrainingConfig, device: &B::Device) -> Result<Self> {
        let folder = ImageFolder::new(dataset_dir)?;
        let (train_set, valid_set) = folder.split(config.validation_split)?;
        let num_classes = folder.num_classes();
        let image_size = config.model.input_size;

        let batcher_train = ClassificationBatcher::<B>::new(device.clone(), num_classes, image_size)
            .with_augmenter(Augmenter::new(config.augmentation.clone()));
        let batcher_valid =
            ClassificationBatcher::<B::InnerBackend>::new(device.clone(), num_classes, image_size);

        let num_train = train_set.len();
        let num_valid = valid_set.len();

        let train = DataLoaderBuilder::new(batcher_train)
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(config.num_workers)
            .build(train_set);

        let valid = DataLoaderBuilder::new(batcher_valid)
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(valid_set);

        Ok(Self {
            classes: folder.classes().to_vec(),
            train,
            valid,
            num_train,
            num_valid,
        })
    }
}
