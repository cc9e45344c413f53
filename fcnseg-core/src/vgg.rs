use anyhow::{Context, Result};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, Recorder},
    tensor::activation::relu,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::path::Path;

/// Number of 3x3 convolutions in each of the five VGG16 blocks.
pub(crate) const BLOCKS: [usize; 5] = [2, 2, 3, 3, 3];
const WIDTHS: [usize; 5] = [64, 128, 256, 512, 512];

/// Indices of the convolutions inside torchvision's `features` sequential.
const TORCHVISION_CONVS: [usize; 13] = [0, 2, 5, 7, 10, 12, 14, 17, 19, 21, 24, 26, 28];

pub(crate) const POOL3_CHANNELS: usize = 256;
pub(crate) const POOL4_CHANNELS: usize = 512;
pub(crate) const POOL5_CHANNELS: usize = 512;

/// VGG16 feature extractor, without the classifier.
#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    pub(crate) convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

/// Outputs of the last three pooling stages, at 1/8, 1/16 and 1/32 of the input.
#[derive(Debug, Clone)]
pub struct VggFeatures<B: Backend> {
    pub pool3: Tensor<B, 4>,
    pub pool4: Tensor<B, 4>,
    pub pool5: Tensor<B, 4>,
}

impl<B: Backend> Vgg16<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(BLOCKS.iter().sum());
        let mut channels = 3;
        for (&n, &width) in BLOCKS.iter().zip(WIDTHS.iter()) {
            for _ in 0..n {
                convs.push(
                    Conv2dConfig::new([channels, width], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                );
                channels = width;
            }
        }
        Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Load ImageNet weights from a torchvision `vgg16-*.pth` state dict.
    pub fn load_torchvision(self, path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        let args = TORCHVISION_CONVS.iter().enumerate().fold(
            LoadArgs::new(path.to_path_buf()),
            |args, (i, feature)| {
                args.with_key_remap(
                    &format!(r"^features\.{feature}\.(.+)$"),
                    &format!("convs.{i}.$1"),
                )
            },
        );
        let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();
        let record: Vgg16Record<B> = Recorder::<B>::load(&recorder, args, device)
            .with_context(|| format!("failed to load VGG16 weights from {}", path.display()))?;
        Ok(self.load_record(record))
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width], height and width divisible by 32
    pub fn forward(&self, x: Tensor<B, 4>) -> VggFeatures<B> {
        let x = self.block(x, 0);
        let x = self.block(x, 1);
        let pool3 = self.block(x, 2);
        let pool4 = self.block(pool3.clone(), 3);
        let pool5 = self.block(pool4.clone(), 4);
        VggFeatures {
            pool3,
            pool4,
            pool5,
        }
    }

    fn block(&self, x: Tensor<B, 4>, block: usize) -> Tensor<B, 4> {
        let start: usize = BLOCKS[..block].iter().sum();
        let x = self.convs[start..start + BLOCKS[block]]
            .iter()
            .fold(x, |x, conv| relu(conv.forward(x)));
        self.pool.forward(x)
    }
}
