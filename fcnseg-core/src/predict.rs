use crate::{
    data::{ImageBatcher, ImageFolder},
    evaluate::load_trained,
    palette::{self, ClassMask},
};
use anyhow::{Context, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*};
use clap::ValueEnum;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, ValueEnum, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Artifact directory of a finished training run
    artifact_dir: PathBuf,
    /// Root of images directory
    input: PathBuf,
    output: Output,
    /// Model record to use instead of the final one
    checkpoint: Option<PathBuf>,
    /// Directory receiving one colour mask PNG per image
    masks: Option<PathBuf>,
    #[config(default = 8)]
    batch_size: usize,
    #[config(default = 1)]
    num_workers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Coverage {
    class: String,
    fraction: f32,
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{:.2}%", self.class, 100. * self.fraction)
    }
}

type JsonOutput = BTreeMap<PathBuf, Vec<Coverage>>;

fn coverage(mask: &ClassMask) -> Vec<Coverage> {
    let mut coverage = mask
        .coverage()
        .into_iter()
        .map(|(index, fraction)| Coverage {
            class: palette::class_name(index)
                .map(String::from)
                .unwrap_or_else(|| format!("class {index}")),
            fraction,
        })
        .collect::<Vec<_>>();
    coverage.sort_by(|a, b| b.fraction.total_cmp(&a.fraction));
    coverage
}

/// Writes the mask as a palette coloured PNG at the source image's resolution,
/// mirroring the source's path below the input root.
fn save_mask(
    dir: &Path,
    input: &Path,
    source: &Path,
    mask: &ClassMask,
    size: (u32, u32),
) -> Result<PathBuf> {
    let relative = match source.strip_prefix(input) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative,
        // a single file given as input
        _ => Path::new(
            source
                .file_name()
                .with_context(|| format!("{} has no file name", source.display()))?,
        ),
    };
    let stem = relative
        .file_stem()
        .with_context(|| format!("{} has no file name", source.display()))?;
    let path = dir
        .join(relative)
        .with_file_name(format!("{}.png", stem.to_string_lossy()));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rgb = imageops::resize(&palette::decode_mask(mask), size.0, size.1, FilterType::Nearest);
    rgb.save(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn predict<B: Backend>(config: PredictConfig, device: B::Device) -> Result<()> {
    let (training, model) =
        load_trained::<B>(&config.artifact_dir, config.checkpoint.as_deref(), &device)?;
    let size = training.dataset.image_size();

    if let Some(dir) = &config.masks {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let batcher_predict = ImageBatcher::<B>::new(device.clone(), training.normalization, size);
    let dataloader_predict = DataLoaderBuilder::new(batcher_predict)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(ImageFolder::new(&config.input, size));

    let mut output: JsonOutput = BTreeMap::new();
    for batch in dataloader_predict.iter() {
        let predicted = model
            .forward(batch.images)
            .argmax(1)
            .into_data()
            .iter::<i64>()
            .map(|i| i as u8)
            .collect::<Vec<_>>();
        let masks = predicted
            .chunks(size * size)
            .map(|indices| ClassMask::new(size as u32, size as u32, indices.to_vec()));

        for ((path, mask), source_size) in batch.paths.into_iter().zip(masks).zip(batch.sizes) {
            if let Some(dir) = &config.masks {
                let saved = save_mask(dir, &config.input, &path, &mask, source_size)?;
                log::debug!("{} -> {}", path.display(), saved.display());
            }
            let coverage = coverage(&mask);
            match config.output {
                Output::Tty => {
                    println!("{}", path.display());
                    for c in coverage {
                        println!("\t{c}");
                    }
                }
                Output::Json => {
                    output.insert(path, coverage);
                }
            }
        }
    }

    if let Output::Json = config.output {
        serde_json::to_writer_pretty(std::io::stdout(), &output)?;
    }
    Ok(())
}
