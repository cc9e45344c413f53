use crate::{
    data::{DatasetConfig, Normalization, SegmentationBatcher, Split},
    metric::{MeanAccuracyMetric, MeanIouMetric, PixelAccuracyMetric},
    model::FcnConfig,
    schedule::InverseTimeDecayConfig,
};
use anyhow::{anyhow, Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    optim::{momentum::MomentumConfig, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        checkpoint::MetricCheckpointingStrategy,
        metric::{
            store::{Aggregate, Direction, Split as MetricSplit},
            LearningRateMetric, LossMetric,
        },
        LearnerBuilder,
    },
};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "train_config.json";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: FcnConfig,
    pub dataset: DatasetConfig,
    #[config(
        default = "SgdConfig::new().with_momentum(Some(MomentumConfig::new().with_momentum(0.9).with_dampening(0.).with_nesterov(true)))"
    )]
    pub optimizer: SgdConfig,
    #[config(default = "Normalization::Imagenet")]
    pub normalization: Normalization,
    /// torchvision `vgg16` state dict used for the backbone
    pub backbone_weights: Option<PathBuf>,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
    /// Inverse-time decay applied per iteration
    #[config(default = 2.0e-5)]
    pub lr_decay: f64,
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))
}

/// Materializes and caches every split without training.
pub fn prepare(dataset: &DatasetConfig) -> Result<()> {
    for split in [Split::Train, Split::Valid, Split::Test] {
        let items = dataset.load(split)?;
        log::info!("{split}: {} samples ready", items.len());
    }
    Ok(())
}

pub fn train<B: AutodiffBackend>(artifact_dir: PathBuf, config: TrainingConfig, device: B::Device) -> Result<()> {
    config.dataset.check()?;
    create_artifact_dir(&artifact_dir)?;

    B::seed(config.seed);

    config
        .save(artifact_dir.join(CONFIG_FILE))
        .context("failed to save the training config")?;

    let variant = config.model.variant;
    let (model, report) = config
        .model
        .init_for_training::<B>(config.backbone_weights.as_deref(), &device)?;

    // building the learner installs the experiment logger, so everything
    // logged from here on lands in the artifact directory
    let learner = LearnerBuilder::new(&artifact_dir)
        .metric_train_numeric(MeanIouMetric::new())
        .metric_valid_numeric(MeanIouMetric::new())
        .metric_train_numeric(MeanAccuracyMetric::new())
        .metric_valid_numeric(MeanAccuracyMetric::new())
        .metric_train_numeric(PixelAccuracyMetric::new())
        .metric_valid_numeric(PixelAccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train(LearningRateMetric::new())
        .with_checkpointing_strategy(MetricCheckpointingStrategy::new::<MeanIouMetric<B>>(
            Aggregate::Mean,
            Direction::Highest,
            MetricSplit::Valid,
        ))
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(
            model,
            config.optimizer.init(),
            InverseTimeDecayConfig::new(config.learning_rate)
                .with_decay(config.lr_decay)
                .init(),
        );
    report.log();

    let image_size = config.dataset.image_size();
    let num_classes = config.model.num_classes;
    let batcher_train =
        SegmentationBatcher::<B>::new(device.clone(), config.normalization, image_size, num_classes);
    let batcher_valid = SegmentationBatcher::<B::InnerBackend>::new(
        device.clone(),
        config.normalization,
        image_size,
        num_classes,
    );

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(config.dataset.load(Split::Train)?);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(config.dataset.load(Split::Valid)?);

    log::info!("training {variant} for {} epochs", config.num_epochs);
    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    for name in [format!("model_{variant}_final"), format!("model_{variant}")] {
        model_trained
            .clone()
            .save_file(artifact_dir.join(&name), &CompactRecorder::new())
            .map_err(|e| anyhow!("failed to save {name}: {e}"))?;
    }
    log::info!("saved model_{variant} to {}", artifact_dir.display());

    Ok(())
}
