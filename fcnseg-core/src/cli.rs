use crate::{
    evaluate, predict, prepare, train, DatasetConfig, EvaluateConfig, FcnConfig, FcnVariant,
    LossKind, Normalization, Output, PredictConfig, TrainingConfig,
};
use anyhow::Result;
use burn::backend::Autodiff;
use clap::{Args, CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Args, Debug)]
struct DatasetArgs {
    /// Root of the VOC style dataset (JPEGImages, SegmentationClass, train.txt, val.txt)
    #[arg(short, long, default_value = "VOC2012")]
    dataset: PathBuf,
    /// Cache directory, relative to the dataset root
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,
    /// Side length every image and mask is resized to
    #[arg(long, default_value = "224")]
    image_size: u32,
    /// Seed of the validation/test split
    #[arg(long, default_value = "123")]
    split_seed: u64,
}

impl From<DatasetArgs> for DatasetConfig {
    fn from(args: DatasetArgs) -> Self {
        DatasetConfig::new(args.dataset)
            .with_cache_dir(args.cache_dir)
            .with_image_size(args.image_size)
            .with_split_seed(args.split_seed)
    }
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Preprocess the dataset and cache every split
    Prepare {
        #[command(flatten)]
        dataset: DatasetArgs,
    },
    /// Train an FCN on top of a VGG16 backbone
    Train {
        /// Model variant
        #[arg(short, long, default_value = FcnVariant::default())]
        model: FcnVariant,
        #[command(flatten)]
        dataset: DatasetArgs,
        /// Path to torchvision's vgg16 state dict (vgg16-397923af.pth)
        #[arg(short = 'W', long)]
        backbone_weights: Option<PathBuf>,
        /// Directory to save artifacts (The directory will be recreated if it exists)
        #[arg(short, long, default_value = "fcnseg_artifact")]
        artifact_dir: PathBuf,
        #[arg(short, long, default_value = "10")]
        num_epochs: usize,
        #[arg(short, long, default_value = "1")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// Initial learning rate of the SGD optimizer
        #[arg(short, long, default_value = "1.0e-4")]
        learning_rate: f64,
        /// Inverse-time decay of the learning rate per iteration
        #[arg(long, default_value = "2.0e-5")]
        lr_decay: f64,
        /// Number of trailing layers left trainable [default: 6, 9 or 11 by variant]
        #[arg(short, long)]
        trainable_tail: Option<usize>,
        /// Training loss
        #[arg(long, default_value = "no-background")]
        loss: LossKind,
        /// Input normalization matching the backbone weights
        #[arg(long, default_value = "imagenet")]
        normalization: Normalization,
        /// Bilinear instead of nearest-neighbour upsampling
        #[arg(long)]
        bilinear: bool,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Score a trained model on the test split
    Evaluate {
        /// Artifact directory of the training run
        #[arg(short, long, default_value = "fcnseg_artifact")]
        artifact_dir: PathBuf,
        /// Path to a model checkpoint [default: the run's final model]
        #[arg(short, long)]
        checkpoint: Option<PathBuf>,
        #[arg(short, long, default_value = "1")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
    },
    /// Segment every image in a directory
    Predict {
        /// Artifact directory of the training run
        #[arg(short, long, default_value = "fcnseg_artifact")]
        artifact_dir: PathBuf,
        /// Path to a model checkpoint [default: the run's final model]
        #[arg(short, long)]
        checkpoint: Option<PathBuf>,
        /// Method to output the class coverage
        #[arg(short, long, default_value = "tty")]
        output: Output,
        /// Directory to write colour-coded masks to
        #[arg(short, long)]
        masks: Option<PathBuf>,
        #[arg(short, long, default_value = "8")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// Root of images directory
        input: PathBuf,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(all(feature = "tch", not(feature = "f16")))]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "tch", feature = "f16"))]
type MyBackend = burn::backend::LibTorch<burn::tensor::f16, i8>;
#[cfg(all(feature = "candle", not(feature = "tch"), not(feature = "f16")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "candle", not(feature = "tch"), feature = "f16"))]
type MyBackend = burn::backend::Candle<burn::tensor::f16, u8>;
#[cfg(all(feature = "ndarray", not(feature = "tch"), not(feature = "candle")))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

pub fn run() -> Result<()> {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::Metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(all(feature = "ndarray", not(feature = "tch"), not(feature = "candle")))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    let args = Cli::parse();
    // training logs go to the learner's experiment log instead
    if !matches!(args.subcmd, SubCmd::Train { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match args.subcmd {
        SubCmd::Prepare { dataset } => prepare(&dataset.into()),
        SubCmd::Train {
            model,
            dataset,
            backbone_weights,
            artifact_dir,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            lr_decay,
            trainable_tail,
            loss,
            normalization,
            bilinear,
            seed,
        } => train::<MyAutodiffBackend>(
            artifact_dir,
            TrainingConfig::new(
                FcnConfig::new()
                    .with_variant(model)
                    .with_trainable_tail(trainable_tail)
                    .with_loss(loss)
                    .with_bilinear(bilinear),
                dataset.into(),
            )
            .with_backbone_weights(backbone_weights)
            .with_normalization(normalization)
            .with_num_epochs(num_epochs)
            .with_batch_size(batch_size)
            .with_num_workers(num_workers)
            .with_learning_rate(learning_rate)
            .with_lr_decay(lr_decay)
            .with_seed(seed),
            device,
        ),
        SubCmd::Evaluate {
            artifact_dir,
            checkpoint,
            batch_size,
            num_workers,
        } => {
            let evaluation = evaluate::<MyBackend>(
                EvaluateConfig::new(artifact_dir)
                    .with_checkpoint(checkpoint)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers),
                device,
            )?;
            println!("{evaluation}");
            Ok(())
        }
        SubCmd::Predict {
            artifact_dir,
            checkpoint,
            output,
            masks,
            batch_size,
            num_workers,
            input,
        } => predict::<MyBackend>(
            PredictConfig::new(artifact_dir, input, output)
                .with_checkpoint(checkpoint)
                .with_masks(masks)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers),
            device,
        ),
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "fcnseg", &mut std::io::stdout());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_defaults() {
        let cli = Cli::parse_from(["fcnseg", "train"]);
        let SubCmd::Train {
            model,
            dataset,
            num_epochs,
            learning_rate,
            loss,
            trainable_tail,
            ..
        } = cli.subcmd
        else {
            panic!("expected the train subcommand");
        };
        assert_eq!(model, FcnVariant::Fcn8s);
        assert_eq!(dataset.image_size, 224);
        assert_eq!(dataset.split_seed, 123);
        assert_eq!(num_epochs, 10);
        assert_eq!(learning_rate, 1e-4);
        assert_eq!(loss, LossKind::NoBackground);
        assert_eq!(trainable_tail, None);
    }

    #[test]
    fn variant_is_selectable() {
        let cli = Cli::parse_from(["fcnseg", "train", "--model", "fcn16s", "-t", "12"]);
        assert!(matches!(
            cli.subcmd,
            SubCmd::Train {
                model: FcnVariant::Fcn16s,
                trainable_tail: Some(12),
                ..
            }
        ));
    }
}
