use crate::data::SegmentationItem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::Path,
};

#[derive(Deserialize)]
struct CachedSplit {
    image_size: u32,
    items: Vec<SegmentationItem>,
}

/// Same layout as [`CachedSplit`], written without cloning the items.
#[derive(Serialize)]
struct CachedSplitRef<'a> {
    image_size: u32,
    items: &'a [SegmentationItem],
}

/// Reads a cached split, `None` when absent or built for another image size.
pub(crate) fn load(path: &Path, image_size: u32) -> Result<Option<Vec<SegmentationItem>>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    let cached: CachedSplit = bincode::deserialize_from(reader)
        .with_context(|| format!("corrupt dataset cache {}", path.display()))?;
    if cached.image_size != image_size {
        log::warn!(
            "{} holds {}px samples, rebuilding for {image_size}px",
            path.display(),
            cached.image_size
        );
        return Ok(None);
    }
    Ok(Some(cached.items))
}

pub(crate) fn save(path: &Path, image_size: u32, items: &[SegmentationItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &CachedSplitRef { image_size, items })
        .with_context(|| format!("failed to write dataset cache {}", path.display()))?;
    log::info!("cached {} samples at {}", items.len(), path.display());
    Ok(())
}
