use crate::{
    data::{SegmentationBatcher, Split},
    metric::ClassCounts,
    model::Fcn,
    train::{TrainingConfig, CONFIG_FILE},
};
use anyhow::{anyhow, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    prelude::*,
    record::CompactRecorder,
    tensor::ElementConversion,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    path::{Path, PathBuf},
};

#[derive(Config, Debug)]
pub struct EvaluateConfig {
    /// Artifact directory of a finished training run
    artifact_dir: PathBuf,
    /// Model record to evaluate instead of the final one
    checkpoint: Option<PathBuf>,
    #[config(default = 1)]
    batch_size: usize,
    #[config(default = 1)]
    num_workers: usize,
}

/// Restores the training config and model weights of a run.
pub(crate) fn load_trained<B: Backend>(
    artifact_dir: &Path,
    checkpoint: Option<&Path>,
    device: &B::Device,
) -> Result<(TrainingConfig, Fcn<B>)> {
    let config_path = artifact_dir.join(CONFIG_FILE);
    let config = TrainingConfig::load(&config_path)
        .map_err(|e| anyhow!("failed to load {}: {e}", config_path.display()))?;
    let checkpoint = match checkpoint {
        Some(path) => path.to_path_buf(),
        None => artifact_dir.join(format!("model_{}", config.model.variant)),
    };
    let model = config
        .model
        .init::<B>(device)
        .load_file(&checkpoint, &CompactRecorder::new(), device)
        .map_err(|e| anyhow!("failed to load {}: {e}", checkpoint.display()))?;
    log::info!("loaded {} from {}", config.model.variant, checkpoint.display());
    Ok((config, model))
}

/// Test split scores, each batch weighted by its size.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub samples: usize,
    pub loss: f64,
    pub mean_iou: f64,
    pub mean_accuracy: f64,
    pub pixel_accuracy: f64,
}

impl Evaluation {
    fn add(&mut self, batch_size: usize, loss: f64, counts: &ClassCounts) {
        let n = batch_size as f64;
        self.samples += batch_size;
        self.loss += loss * n;
        self.mean_iou += counts.mean_iou() * n;
        self.mean_accuracy += counts.mean_accuracy() * n;
        self.pixel_accuracy += counts.pixel_accuracy() * n;
    }

    fn finish(mut self) -> Self {
        if self.samples > 0 {
            let n = self.samples as f64;
            self.loss /= n;
            self.mean_iou /= n;
            self.mean_accuracy /= n;
            self.pixel_accuracy /= n;
        }
        self
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "samples\t{}", self.samples)?;
        writeln!(f, "loss\t{:.4}", self.loss)?;
        writeln!(f, "mean IoU\t{:.2}%", 100. * self.mean_iou)?;
        writeln!(f, "mean accuracy\t{:.2}%", 100. * self.mean_accuracy)?;
        write!(f, "pixel accuracy\t{:.2}%", 100. * self.pixel_accuracy)
    }
}

/// Scores a trained model on the held-out test split.
pub fn evaluate<B: Backend>(config: EvaluateConfig, device: B::Device) -> Result<Evaluation> {
    let (training, model) =
        load_trained::<B>(&config.artifact_dir, config.checkpoint.as_deref(), &device)?;

    let batcher = SegmentationBatcher::<B>::new(
        device.clone(),
        training.normalization,
        training.dataset.image_size(),
        training.model.num_classes,
    );
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(training.dataset.load(Split::Test)?);

    let evaluation = run(&model, dataloader.iter());

    let path = config.artifact_dir.join("evaluation.json");
    serde_json::to_writer_pretty(File::create(&path)?, &evaluation)?;
    log::info!("wrote {}", path.display());
    Ok(evaluation)
}

fn run<B: Backend>(
    model: &Fcn<B>,
    batches: impl Iterator<Item = crate::data::SegmentationBatch<B>>,
) -> Evaluation {
    let mut evaluation = Evaluation::default();
    for batch in batches {
        let batch_size = batch.images.dims()[0];
        let item = model.forward_segmentation(batch);
        let loss = item.loss.into_scalar().elem::<f64>();
        let counts = ClassCounts::from_tensors(item.output, item.targets);
        evaluation.add(batch_size, loss, &counts);
    }
    evaluation.finish()
}
