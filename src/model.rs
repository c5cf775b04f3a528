use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::{
        activation::{sigmoid, softmax},
        backend::AutodiffBackend,
        ElementConversion,
    },
    train::{TrainOutput, TrainStep, ValidStep},
};
use log::{info, warn};
use nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
};

use crate::dataset::ClassificationBatch;
use crate::error;

/// 3x3 convolution + ReLU, optionally closing a stage with a 2x2 max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    activation: Relu,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            activation: Relu::new(),
            pool: with_pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.conv.forward(x));
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Output channels of each stage.
    #[config(default = "vec![16, 32, 64, 128, 256]")]
    pub channels: Vec<usize>,
    /// Number of conv layers in each stage.
    #[config(default = "vec![2, 4, 8, 10, 12]")]
    pub stage_depths: Vec<usize>,
    /// Record file (without extension) holding pretrained backbone weights.
    pub weights: Option<String>,
}

impl BackboneConfig {
    pub fn out_channels(&self) -> usize {
        self.channels.last().copied().unwrap_or(3)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut layers = Vec::new();
        let mut in_channels = 3;
        for (&out_channels, &depth) in self.channels.iter().zip(&self.stage_depths) {
            for index in 0..depth {
                let closes_stage = index + 1 == depth;
                layers.push(ConvBlock::new(in_channels, out_channels, closes_stage, device));
                in_channels = out_channels;
            }
        }
        Backbone { layers }
    }
}

/// Convolutional feature extractor. Each stage halves the spatial size.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub layers: Vec<ConvBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(images, |x, layer| layer.forward(x))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Stops gradients for every layer except the last `trainable`.
    pub fn freeze_leading(self, trainable: usize) -> Self {
        let frozen = self.layers.len().saturating_sub(trainable);
        let layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(index, layer)| if index < frozen { layer.no_grad() } else { layer })
            .collect();
        Self { layers }
    }
}

/// Single-channel spatial attention: a 1x1 conv squeezes the feature map to
/// one sigmoid weight per pixel, which then scales every channel.
#[derive(Module, Debug)]
pub struct AttentionGate<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> AttentionGate<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([channels, 1], [1, 1]).init(device),
        }
    }

    /// Weight map `[batch, 1, height, width]`.
    pub fn weights(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        sigmoid(self.conv.forward(features))
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let attention = self.weights(features.clone());
        features * attention
    }
}

#[derive(Module, Debug)]
pub struct PlantClassifier<B: Backend> {
    backbone: Backbone<B>,
    attention: AttentionGate<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    hidden: Linear<B>,
    output: Linear<B>,
    activation: Relu,
    num_classes: usize,
}

#[derive(Config, Debug)]
pub struct PlantClassifierConfig {
    pub num_classes: usize,
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    #[config(default = "1024")]
    pub hidden_size: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
    /// Backbone layers, counted from the end, that keep receiving gradients.
    #[config(default = "30")]
    pub trainable_layers: usize,
    #[config(default = "224")]
    pub input_size: usize,
}

impl PlantClassifierConfig {
    /// Builds the classifier with a randomly initialised backbone.
    pub fn init<B: Backend>(&self, device: &B::Device) -> PlantClassifier<B> {
        self.assemble(self.backbone.init(device), device)
    }

    /// Builds the classifier, loading backbone weights when a record is configured.
    pub fn init_pretrained<B: Backend>(
        &self,
        device: &B::Device,
    ) -> error::Result<PlantClassifier<B>> {
        let backbone = self.backbone.init(device);
        let backbone = match &self.backbone.weights {
            Some(path) => {
                info!("Loading backbone weights from {path}");
                let record = CompactRecorder::new().load(path.into(), device)?;
                backbone.load_record(record)
            }
            None => {
                warn!("No backbone weights configured, starting from random initialisation");
                backbone
            }
        };
        Ok(self.assemble(backbone, device))
    }

    fn assemble<B: Backend>(
        &self,
        backbone: Backbone<B>,
        device: &B::Device,
    ) -> PlantClassifier<B> {
        let total = backbone.num_layers();
        let backbone = backbone.freeze_leading(self.trainable_layers);
        info!(
            "Backbone has {total} conv layers, last {} trainable",
            self.trainable_layers.min(total)
        );

        let features = self.backbone.out_channels();
        PlantClassifier {
            backbone,
            attention: AttentionGate::new(features, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            hidden: LinearConfig::new(features, self.hidden_size).init(device),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> PlantClassifier<B> {
    /// # Shapes
    ///   - Images `[batch_size, 3, height, width]`
    ///   - Output logits `[batch_size, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let x = self.attention.forward(features);

        let x = self.pool.forward(x); // [batch_size, channels, 1, 1]
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.dropout.forward(x);
        let x = self.activation.forward(self.hidden.forward(x));
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }

    /// Class probabilities, each row summing to one.
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), targets);

        ClassificationOutput {
            loss,
            output,
            labels,
        }
    }
}

/// Mean of `-sum(targets * log_softmax(logits))` over the batch.
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = burn::tensor::activation::log_softmax(logits, 1);
    (log_probs * targets).sum_dim(1).mean().neg()
}

pub struct ClassificationOutput<B: Backend> {
    /// Scalar loss `[1]`.
    pub loss: Tensor<B, 1>,
    /// Logits `[batch_size, num_classes]`.
    pub output: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationOutput<B> {
    pub fn batch_size(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn num_correct(&self) -> usize {
        let predictions = self.output.clone().argmax(1).squeeze::<1>(1);
        let correct: i64 = predictions
            .equal(self.labels.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();
        correct as usize
    }
}

impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>>
    for PlantClassifier<B>
{
    fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets, batch.labels);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for PlantClassifier<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets, batch.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn tiny_config(num_classes: usize) -> PlantClassifierConfig {
        PlantClassifierConfig::new(num_classes)
            .with_backbone(
                BackboneConfig::new()
                    .with_channels(vec![4, 8])
                    .with_stage_depths(vec![1, 2]),
            )
            .with_hidden_size(8)
            .with_input_size(32)
    }

    #[test]
    fn output_shape_and_probabilities() {
        let device = Default::default();
        let model = tiny_config(3).init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let probs = model.forward_softmax(images);
        assert_eq!(probs.dims(), [2, 3]);

        let sums = probs.sum_dim(1).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn default_backbone_reduces_224_to_7() {
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .with_channels(vec![2, 2, 2, 2, 2])
            .with_stage_depths(vec![1, 1, 1, 1, 1])
            .init::<TestBackend>(&device);
        let features = backbone.forward(Tensor::zeros([1, 3, 224, 224], &device));
        assert_eq!(features.dims(), [1, 2, 7, 7]);

        let defaults = BackboneConfig::new();
        assert_eq!(defaults.stage_depths.iter().sum::<usize>(), 36);
        assert_eq!(defaults.out_channels(), 256);
    }

    #[test]
    fn attention_broadcasts_single_channel() {
        let device = Default::default();
        let gate = AttentionGate::<TestBackend>::new(5, &device);
        let features = Tensor::<TestBackend, 4>::random(
            [2, 5, 4, 4],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let weights = gate.weights(features.clone());
        assert_eq!(weights.dims(), [2, 1, 4, 4]);

        let gated = gate.forward(features.clone());
        assert_eq!(gated.dims(), [2, 5, 4, 4]);

        // Every channel is scaled by the same per-pixel weight.
        let ratio = (gated / features.clone())
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        let weights = weights.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        for batch in 0..2 {
            for channel in 0..5 {
                for pixel in 0..16 {
                    let r = ratio[((batch * 5 + channel) * 16) + pixel];
                    let w = weights[batch * 16 + pixel];
                    assert!((r - w).abs() < 1e-4, "channel {channel} pixel {pixel}");
                }
            }
        }
    }

    #[test]
    fn freezes_all_but_trailing_layers() {
        type Ad = Autodiff<NdArray>;
        let device = Default::default();
        let config = tiny_config(2)
            .with_backbone(
                BackboneConfig::new()
                    .with_channels(vec![4, 4])
                    .with_stage_depths(vec![3, 2]),
            )
            .with_trainable_layers(2);
        let model = config.init::<Ad>(&device);

        let trainable: Vec<bool> = model
            .backbone()
            .layers
            .iter()
            .map(|layer| layer.conv.weight.val().is_require_grad())
            .collect();
        assert_eq!(trainable, vec![false, false, false, true, true]);
    }

    #[test]
    fn frozen_layers_keep_weights_after_an_update() {
        use burn::optim::{GradientsParams, Optimizer, SgdConfig};
        type Ad = Autodiff<NdArray>;

        let device = Default::default();
        let model = tiny_config(2)
            .with_backbone(
                BackboneConfig::new()
                    .with_channels(vec![4, 4])
                    .with_stage_depths(vec![2, 1]),
            )
            .with_trainable_layers(1)
            .init::<Ad>(&device);

        let conv_weights = |model: &PlantClassifier<Ad>| -> Vec<Vec<f32>> {
            model
                .backbone()
                .layers
                .iter()
                .map(|layer| {
                    let data = layer.conv.weight.val().into_data();
                    data.convert::<f32>().to_vec::<f32>().unwrap()
                })
                .collect()
        };
        let before = conv_weights(&model);

        let images = Tensor::<Ad, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let targets = Tensor::<Ad, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);
        let labels = Tensor::<Ad, 1, Int>::from_ints([0, 1], &device);
        let loss = model.forward_classification(images, targets, labels).loss;
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        let mut optim = SgdConfig::new().init::<Ad, PlantClassifier<Ad>>();
        let model = optim.step(0.1, model, grads);

        let changed: Vec<bool> = before
            .iter()
            .zip(conv_weights(&model))
            .map(|(old, new)| *old != new)
            .collect();
        assert_eq!(changed, vec![false, false, true]);
    }

    #[test]
    fn cross_entropy_matches_manual_value() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [2.0, 0.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);

        let loss: f32 = categorical_cross_entropy(logits, targets).into_scalar().elem();
        let expected = (2f32.ln() + (1.0 + 2f32.exp()).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn missing_pretrained_weights_fail_fast() {
        let device = Default::default();
        let config = tiny_config(2).with_backbone(
            BackboneConfig::new()
                .with_channels(vec![4])
                .with_stage_depths(vec![1])
                .with_weights(Some("/nonexistent/backbone".to_string())),
        );
        assert!(config.init_pretrained::<TestBackend>(&device).is_err());
    }
}
