use crate::{
    data::SegmentationBatch,
    loss::{pixel_softmax, LossKind},
    metric::SegmentationInput,
    palette::NUM_CLASSES,
    vgg::{Vgg16, BLOCKS, POOL3_CHANNELS, POOL4_CHANNELS, POOL5_CHANNELS},
};
use anyhow::Result;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Initializer, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::relu,
        backend::AutodiffBackend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
    train::{
        metric::{Adaptor, LossInput},
        TrainOutput, TrainStep, ValidStep,
    },
};
use clap::{builder::OsStr, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum FcnVariant {
    /// Single 32x upsampling of the pool5 scores
    #[value(name = "fcn32s")]
    Fcn32s = 32,
    /// pool5 and pool4 scores fused at stride 16
    #[value(name = "fcn16s")]
    Fcn16s = 16,
    /// pool5, pool4 and pool3 scores fused at stride 8
    #[default]
    #[value(name = "fcn8s")]
    Fcn8s = 8,
}

impl FcnVariant {
    pub fn stride(self) -> usize {
        self as usize
    }

    /// Trailing layers left trainable unless configured otherwise.
    pub fn trainable_tail(self) -> usize {
        match self {
            FcnVariant::Fcn32s => 6,
            FcnVariant::Fcn16s => 9,
            FcnVariant::Fcn8s => 11,
        }
    }

    fn default_l2(self) -> f64 {
        match self {
            FcnVariant::Fcn8s => 0.01,
            _ => 0.0,
        }
    }

    /// Every layer of the network, input to output, parameter-free ones included.
    pub fn layers(self) -> Vec<Layer> {
        let mut layers = Vec::new();
        let mut conv = 0;
        for (pool, &n) in BLOCKS.iter().enumerate() {
            for _ in 0..n {
                layers.push(Layer::Conv(conv));
                conv += 1;
            }
            layers.push(Layer::Pool(pool));
        }
        layers.extend([
            Layer::Fc6,
            Layer::Drop6,
            Layer::Fc7,
            Layer::Drop7,
            Layer::ScoreFr,
        ]);
        match self {
            FcnVariant::Fcn32s => layers.extend([Layer::Upsample(Head::Fr), Layer::UpsampleConv(Head::Fr)]),
            FcnVariant::Fcn16s => layers.extend([
                Layer::ScorePool4,
                Layer::Upsample(Head::Fr),
                Layer::UpsampleConv(Head::Fr),
                Layer::Fuse,
                Layer::Upsample(Head::Final),
                Layer::UpsampleConv(Head::Final),
            ]),
            FcnVariant::Fcn8s => layers.extend([
                Layer::ScorePool4,
                Layer::Upsample(Head::Pool4),
                Layer::UpsampleConv(Head::Pool4),
                Layer::ScorePool3,
                Layer::Upsample(Head::Fr),
                Layer::UpsampleConv(Head::Fr),
                Layer::Fuse,
                Layer::Upsample(Head::Final),
                Layer::UpsampleConv(Head::Final),
            ]),
        }
        layers.push(Layer::Softmax);
        layers
    }
}

impl fmt::Display for FcnVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fcn{}s", self.stride())
    }
}

impl From<FcnVariant> for OsStr {
    fn from(value: FcnVariant) -> Self {
        value.to_string().into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    Fr,
    Pool4,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Conv(usize),
    Pool(usize),
    Fc6,
    Drop6,
    Fc7,
    Drop7,
    ScoreFr,
    ScorePool4,
    ScorePool3,
    Upsample(Head),
    UpsampleConv(Head),
    Fuse,
    Softmax,
}

/// He-normal initialization of the head convolutions.
fn he_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: 2f64.sqrt(),
        fan_out_only: false,
    }
}

/// Scaling followed by a learnable 1x1 convolution.
#[derive(Module, Debug)]
pub struct Upscore<B: Backend> {
    conv: Conv2d<B>,
    factor: usize,
    bilinear: bool,
}

impl<B: Backend> Upscore<B> {
    fn new(num_classes: usize, factor: usize, bilinear: bool, zeros: bool, device: &B::Device) -> Self {
        let initializer = if zeros { Initializer::Zeros } else { he_normal() };
        Self {
            conv: Conv2dConfig::new([num_classes, num_classes], [1, 1])
                .with_initializer(initializer)
                .init(device),
            factor,
            bilinear,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let mode = if self.bilinear {
            InterpolateMode::Bilinear
        } else {
            InterpolateMode::Nearest
        };
        let x = interpolate(
            x,
            [height * self.factor, width * self.factor],
            InterpolateOptions::new(mode),
        );
        self.conv.forward(x)
    }
}

/// Fully convolutional VGG16. Skip branches are present according to the variant.
#[derive(Module, Debug)]
pub struct Fcn<B: Backend> {
    backbone: Vgg16<B>,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
    dropout: Dropout,
    score_fr: Conv2d<B>,
    score_pool4: Option<Conv2d<B>>,
    upscore_pool4: Option<Upscore<B>>,
    score_pool3: Option<Conv2d<B>>,
    upscore_fr: Upscore<B>,
    upscore_final: Option<Upscore<B>>,
    l2: f64,
    background_loss: bool,
}

impl<B: Backend> Fcn<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width], height and width divisible by 32
    ///   - Output [batch_size, num_classes, height, width], per-pixel probabilities
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self.backbone.forward(images);

        let x = self.dropout.forward(relu(self.fc6.forward(features.pool5)));
        let x = self.dropout.forward(relu(self.fc7.forward(x)));
        let mut scores = self.upscore_fr.forward(self.score_fr.forward(x));

        if let Some(score_pool4) = &self.score_pool4 {
            let pool4 = score_pool4.forward(features.pool4);
            scores = scores
                + match &self.upscore_pool4 {
                    Some(upscore) => upscore.forward(pool4),
                    None => pool4,
                };
        }
        if let Some(score_pool3) = &self.score_pool3 {
            scores = scores + score_pool3.forward(features.pool3);
        }
        if let Some(upscore) = &self.upscore_final {
            scores = upscore.forward(scores);
        }

        pixel_softmax(scores)
    }

    pub fn loss_kind(&self) -> LossKind {
        if self.background_loss {
            LossKind::AllClasses
        } else {
            LossKind::NoBackground
        }
    }

    /// Skip and upscore convolutions; `score_fr` is shared with FCN-32s and stays unpenalized.
    fn penalized_convs(&self) -> Vec<&Conv2d<B>> {
        let upscores = [Some(&self.upscore_fr), self.upscore_pool4.as_ref(), self.upscore_final.as_ref()];
        [self.score_pool4.as_ref(), self.score_pool3.as_ref()]
            .into_iter()
            .chain(upscores.into_iter().map(|u| u.map(|u| &u.conv)))
            .flatten()
            .collect()
    }

    /// Sum of squared skip and upscore kernels scaled by the configured factor.
    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        if self.l2 == 0.0 {
            return None;
        }
        self.penalized_convs()
            .into_iter()
            .map(|conv| conv.weight.val().powf_scalar(2.0).sum())
            .reduce(|a, b| a + b)
            .map(|sum| sum.mul_scalar(self.l2))
    }

    pub fn forward_segmentation(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        let output = self.forward(batch.images);
        let mut loss = self.loss_kind().forward(output.clone(), batch.one_hot);
        if let Some(penalty) = self.l2_penalty() {
            loss = loss + penalty;
        }
        SegmentationOutput {
            loss,
            output,
            targets: batch.targets,
        }
    }

    /// Stops gradient tracking for every given layer, parameter-free layers are no-ops.
    pub fn freeze(mut self, layers: &[Layer]) -> Self {
        for layer in layers {
            self = match *layer {
                Layer::Conv(i) => {
                    self.backbone.convs = self
                        .backbone
                        .convs
                        .into_iter()
                        .enumerate()
                        .map(|(j, conv)| if i == j { conv.no_grad() } else { conv })
                        .collect();
                    self
                }
                Layer::Fc6 => Self { fc6: self.fc6.no_grad(), ..self },
                Layer::Fc7 => Self { fc7: self.fc7.no_grad(), ..self },
                Layer::ScoreFr => Self { score_fr: self.score_fr.no_grad(), ..self },
                Layer::ScorePool4 => Self { score_pool4: self.score_pool4.map(|m| m.no_grad()), ..self },
                Layer::ScorePool3 => Self { score_pool3: self.score_pool3.map(|m| m.no_grad()), ..self },
                Layer::UpsampleConv(Head::Fr) => Self { upscore_fr: self.upscore_fr.no_grad(), ..self },
                Layer::UpsampleConv(Head::Pool4) => Self {
                    upscore_pool4: self.upscore_pool4.map(|m| m.no_grad()),
                    ..self
                },
                Layer::UpsampleConv(Head::Final) => Self {
                    upscore_final: self.upscore_final.map(|m| m.no_grad()),
                    ..self
                },
                Layer::Pool(_)
                | Layer::Drop6
                | Layer::Drop7
                | Layer::Upsample(_)
                | Layer::Fuse
                | Layer::Softmax => self,
            };
        }
        self
    }
}

#[derive(Debug)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// [batch_size, num_classes, height, width]
    pub output: Tensor<B, 4>,
    /// [batch_size, height, width]
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<SegmentationInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> SegmentationInput<B> {
        SegmentationInput::new(self.output.clone(), self.targets.clone())
    }
}

impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for Fcn<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for Fcn<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}

#[derive(Config, Debug)]
pub struct FcnConfig {
    #[config(default = "FcnVariant::Fcn8s")]
    pub variant: FcnVariant,
    #[config(default = "NUM_CLASSES")]
    pub num_classes: usize,
    /// Width of the fc6/fc7 convolutions
    #[config(default = 4096)]
    pub fc_channels: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Nearest-neighbour upsampling when false
    #[config(default = false)]
    pub bilinear: bool,
    #[config(default = "LossKind::NoBackground")]
    pub loss: LossKind,
    /// Trailing layers left trainable, the variant's default when unset
    pub trainable_tail: Option<usize>,
    /// Head kernel penalty, the variant's default when unset
    pub l2: Option<f64>,
}

impl FcnConfig {
    pub fn trainable_tail(&self) -> usize {
        self.trainable_tail
            .unwrap_or_else(|| self.variant.trainable_tail())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Fcn<B> {
        let (c, fc) = (self.num_classes, self.fc_channels);
        let score = |channels: usize| {
            Conv2dConfig::new([channels, c], [1, 1])
                .with_initializer(he_normal())
                .init(device)
        };
        let upscore = |factor: usize, zeros: bool| Upscore::new(c, factor, self.bilinear, zeros, device);

        let (score_pool4, upscore_pool4, score_pool3, upscore_fr, upscore_final) = match self.variant {
            FcnVariant::Fcn32s => (None, None, None, upscore(32, true), None),
            FcnVariant::Fcn16s => (
                Some(score(POOL4_CHANNELS)),
                None,
                None,
                upscore(2, false),
                Some(upscore(16, false)),
            ),
            FcnVariant::Fcn8s => (
                Some(score(POOL4_CHANNELS)),
                Some(upscore(2, false)),
                Some(score(POOL3_CHANNELS)),
                upscore(4, false),
                Some(upscore(8, false)),
            ),
        };

        Fcn {
            backbone: Vgg16::new(device),
            fc6: Conv2dConfig::new([POOL5_CHANNELS, fc], [7, 7])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            fc7: Conv2dConfig::new([fc, fc], [1, 1]).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            score_fr: Conv2dConfig::new([fc, c], [1, 1])
                .with_initializer(he_normal())
                .init(device),
            score_pool4,
            upscore_pool4,
            score_pool3,
            upscore_fr,
            upscore_final,
            l2: self.l2.unwrap_or_else(|| self.variant.default_l2()),
            background_loss: self.loss == LossKind::AllClasses,
        }
    }

    /// Builds the network, loads ImageNet backbone weights when given and
    /// freezes everything but the trainable tail.
    ///
    /// Nothing is logged here: the returned [`InitReport`] is logged once a
    /// logger is in place.
    pub fn init_for_training<B: Backend>(
        &self,
        backbone_weights: Option<&Path>,
        device: &B::Device,
    ) -> Result<(Fcn<B>, InitReport)> {
        let mut fcn = self.init::<B>(device);
        if let Some(path) = backbone_weights {
            fcn.backbone = fcn.backbone.load_torchvision(path, device)?;
        }
        let layers = self.variant.layers();
        let frozen = layers.len().saturating_sub(self.trainable_tail());
        let report = InitReport {
            variant: self.variant,
            layers: layers.len(),
            frozen,
            backbone_weights: backbone_weights.map(Path::to_path_buf),
        };
        Ok((fcn.freeze(&layers[..frozen]), report))
    }
}

/// How a network was prepared for training.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub variant: FcnVariant,
    pub layers: usize,
    pub frozen: usize,
    pub backbone_weights: Option<PathBuf>,
}

impl InitReport {
    pub fn log(&self) {
        match &self.backbone_weights {
            Some(path) => log::info!("loaded VGG16 weights from {}", path.display()),
            None => log::warn!("no backbone weights given, training {} from scratch", self.variant),
        }
        log::info!(
            "{}: {} layers, {} frozen",
            self.variant,
            self.layers,
            self.frozen
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = NdArray<f32>;
    type AB = Autodiff<NdArray<f32>>;

    fn small(variant: FcnVariant) -> FcnConfig {
        FcnConfig::new().with_variant(variant).with_fc_channels(8)
    }

    #[test]
    fn layer_lists_end_with_the_heads() {
        assert_eq!(FcnVariant::Fcn32s.layers().len(), 26);
        assert_eq!(FcnVariant::Fcn16s.layers().len(), 30);
        assert_eq!(FcnVariant::Fcn8s.layers().len(), 33);

        let layers = FcnVariant::Fcn8s.layers();
        let tail = &layers[layers.len() - FcnVariant::Fcn8s.trainable_tail()..];
        assert_eq!(tail[0], Layer::ScoreFr);
        assert_eq!(tail.last(), Some(&Layer::Softmax));
        assert!(!tail.contains(&Layer::Fc7));

        let layers = FcnVariant::Fcn32s.layers();
        let tail = &layers[layers.len() - FcnVariant::Fcn32s.trainable_tail()..];
        assert_eq!(tail[0], Layer::Fc7);
    }

    #[test]
    fn variant_names_match_cli_values() {
        for variant in FcnVariant::value_variants() {
            let name = variant.to_string();
            assert_eq!(FcnVariant::from_str(&name, false).ok(), Some(*variant));
        }
        assert_eq!(FcnVariant::default().stride(), 8);
    }

    #[test]
    fn freezing_keeps_only_the_tail_trainable() {
        let device = Default::default();
        let (fcn, report) = small(FcnVariant::Fcn8s)
            .init_for_training::<AB>(None, &device)
            .unwrap();
        assert_eq!(
            report,
            InitReport {
                variant: FcnVariant::Fcn8s,
                layers: 33,
                frozen: 22,
                backbone_weights: None,
            }
        );
        assert!(!fcn.backbone.convs[0].weight.is_require_grad());
        assert!(!fcn.backbone.convs[12].weight.is_require_grad());
        assert!(!fcn.fc6.weight.is_require_grad());
        assert!(!fcn.fc7.weight.is_require_grad());
        assert!(fcn.score_fr.weight.is_require_grad());
        assert!(fcn.score_pool3.as_ref().unwrap().weight.is_require_grad());
        assert!(fcn.upscore_final.as_ref().unwrap().conv.weight.is_require_grad());
    }

    #[test]
    fn larger_tail_unfreezes_the_trunk() {
        let device = Default::default();
        let (fcn, report) = small(FcnVariant::Fcn32s)
            .with_trainable_tail(Some(8))
            .init_for_training::<AB>(None, &device)
            .unwrap();
        assert_eq!(report.frozen, 18);
        assert!(fcn.fc6.weight.is_require_grad());
        assert!(!fcn.backbone.convs[12].weight.is_require_grad());
    }

    #[test]
    fn l2_penalty_only_on_fcn8s_by_default() {
        let device = Default::default();
        assert!(small(FcnVariant::Fcn32s).init::<B>(&device).l2_penalty().is_none());
        assert!(small(FcnVariant::Fcn16s).init::<B>(&device).l2_penalty().is_none());

        let fcn = small(FcnVariant::Fcn8s).init::<B>(&device);
        assert_eq!(fcn.penalized_convs().len(), 5);
        let penalty = fcn.l2_penalty().unwrap().into_scalar();
        assert!(penalty > 0.0);

        let mut rescored = fcn.clone();
        rescored.score_fr.weight = rescored.score_fr.weight.map(|w| w.mul_scalar(10.0));
        assert_eq!(rescored.l2_penalty().unwrap().into_scalar(), penalty);
    }

    fn std_dev(weight: Tensor<B, 4>) -> f32 {
        let values = weight.into_data().to_vec::<f32>().unwrap();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        var.sqrt()
    }

    #[test]
    fn skip_and_upscore_convs_are_he_normal() {
        let device = Default::default();
        let fcn = small(FcnVariant::Fcn8s).init::<B>(&device);

        // He-normal std is sqrt(2 / fan_in); the uniform default is about sqrt(1 / (3 fan_in))
        let score_pool4 = fcn.score_pool4.as_ref().unwrap();
        let he = (2.0 / POOL4_CHANNELS as f32).sqrt();
        assert!((std_dev(score_pool4.weight.val()) - he).abs() < 0.15 * he);

        let he = (2.0 / NUM_CLASSES as f32).sqrt();
        for upscore in [Some(&fcn.upscore_fr), fcn.upscore_pool4.as_ref(), fcn.upscore_final.as_ref()] {
            assert!(std_dev(upscore.unwrap().conv.weight.val()) > 0.6 * he);
        }

        let fcn32 = small(FcnVariant::Fcn32s).init::<B>(&device);
        assert_eq!(std_dev(fcn32.upscore_fr.conv.weight.val()), 0.0);
    }

    #[test]
    fn fcn32s_starts_from_a_uniform_prediction() {
        let device = Default::default();
        let fcn = small(FcnVariant::Fcn32s).init::<B>(&device);
        let probs = fcn.forward(Tensor::ones([1, 3, 32, 32], &device));
        let values = probs.into_data().to_vec::<f32>().unwrap();
        let uniform = 1.0 / NUM_CLASSES as f32;
        assert!(values.iter().all(|p| (p - uniform).abs() < 1e-5));
    }
}
