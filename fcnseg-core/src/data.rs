use crate::{cache, palette};
use anyhow::{bail, Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
};
use clap::ValueEnum;
use image::{imageops::FilterType, DynamicImage};
use mime_guess::MimeGuess;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Per-channel means in BGR order, on the 0..255 scale.
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// How RGB pixels are turned into backbone inputs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Normalization {
    /// Scale to [0, 1] and standardize with the ImageNet mean and std (torchvision weights)
    #[default]
    Imagenet,
    /// Reorder to BGR and subtract the ImageNet mean on the 0..255 scale (caffe weights)
    Caffe,
}

impl Normalization {
    /// Converts interleaved RGB bytes into planar channels, appending to `out`.
    pub fn extend_planar(self, rgb: &[u8], out: &mut Vec<f32>) {
        let channel = |c: usize| rgb.iter().skip(c).step_by(3).map(|&v| v as f32);
        match self {
            Normalization::Imagenet => {
                for c in 0..3 {
                    out.extend(channel(c).map(|v| (v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]));
                }
            }
            Normalization::Caffe => {
                for c in 0..3 {
                    out.extend(channel(2 - c).map(|v| v - CAFFE_MEAN_BGR[c]));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub(crate) fn file_name(self) -> &'static str {
        match self {
            Split::Train => "train.bin",
            Split::Valid => "valid.bin",
            Split::Test => "test.bin",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// A Pascal VOC style dataset on disk and where its preprocessed splits are cached.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    /// Root containing the image and mask directories and the manifests
    root: PathBuf,
    #[config(default = "PathBuf::from(\"JPEGImages\")")]
    images_dir: PathBuf,
    #[config(default = "PathBuf::from(\"SegmentationClass\")")]
    masks_dir: PathBuf,
    #[config(default = "PathBuf::from(\"train.txt\")")]
    train_manifest: PathBuf,
    /// Split in half into the validation and the final test set
    #[config(default = "PathBuf::from(\"val.txt\")")]
    val_manifest: PathBuf,
    #[config(default = "PathBuf::from(\"cache\")")]
    cache_dir: PathBuf,
    #[config(default = 224)]
    image_size: u32,
    #[config(default = 123)]
    split_seed: u64,
}

impl DatasetConfig {
    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    /// The network downsamples by 32, so the side length must divide evenly.
    pub fn check(&self) -> Result<()> {
        if self.image_size == 0 || self.image_size % 32 != 0 {
            bail!("image size {} must be a positive multiple of 32", self.image_size);
        }
        Ok(())
    }

    fn cache_path(&self, split: Split) -> PathBuf {
        self.root.join(&self.cache_dir).join(split.file_name())
    }

    /// Returns the cached split, materializing and caching it first if needed.
    pub fn load(&self, split: Split) -> Result<SegmentationDataset> {
        self.check()?;
        if let Some(items) = cache::load(&self.cache_path(split), self.image_size)? {
            log::info!("loaded {} {split} samples from cache", items.len());
            return Ok(SegmentationDataset::new(items));
        }
        let items = match split {
            Split::Train => {
                let items = self.materialize(&self.root.join(&self.train_manifest))?;
                cache::save(&self.cache_path(Split::Train), self.image_size, &items)?;
                items
            }
            Split::Valid | Split::Test => {
                let (valid, test) = self.split_val()?;
                cache::save(&self.cache_path(Split::Valid), self.image_size, &valid)?;
                cache::save(&self.cache_path(Split::Test), self.image_size, &test)?;
                if split == Split::Valid {
                    valid
                } else {
                    test
                }
            }
        };
        log::info!("materialized {} {split} samples", items.len());
        Ok(SegmentationDataset::new(items))
    }

    /// Shuffles the validation manifest with a fixed seed and cuts it in half,
    /// the test set taking the extra sample of an odd count.
    fn split_val(&self) -> Result<(Vec<SegmentationItem>, Vec<SegmentationItem>)> {
        let mut items = self.materialize(&self.root.join(&self.val_manifest))?;
        items.shuffle(&mut StdRng::seed_from_u64(self.split_seed));
        let test = items.split_off(items.len() / 2);
        Ok((items, test))
    }

    /// Loads every image/mask pair listed in a manifest, skipping unusable masks.
    pub fn materialize(&self, manifest: &Path) -> Result<Vec<SegmentationItem>> {
        let names = read_manifest(manifest)?;
        let mut items = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if let Some(item) = self.load_item(name)? {
                items.push(item);
            }
            if (i + 1) % 100 == 0 {
                log::info!("{}: {}/{} processed", manifest.display(), i + 1, names.len());
            }
        }
        let skipped = names.len() - items.len();
        if skipped > 0 {
            log::warn!("{}: skipped {skipped} samples", manifest.display());
        }
        Ok(items)
    }

    fn load_item(&self, name: &str) -> Result<Option<SegmentationItem>> {
        let size = self.image_size;
        let image_path = self.root.join(&self.images_dir).join(format!("{name}.jpg"));
        let image = image::open(&image_path)
            .with_context(|| format!("failed to open image {}", image_path.display()))?
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let mask_path = self.root.join(&self.masks_dir).join(format!("{name}.png"));
        let mask = match image::open(&mask_path) {
            Ok(mask) if mask.color().channel_count() >= 3 => mask,
            Ok(mask) => {
                log::warn!(
                    "skipping {name}: mask {} has {} channel(s)",
                    mask_path.display(),
                    mask.color().channel_count()
                );
                return Ok(None);
            }
            Err(err) => {
                log::warn!("skipping {name}: {}: {err}", mask_path.display());
                return Ok(None);
            }
        };
        // nearest keeps every mask pixel a palette colour
        let mask = mask.resize_exact(size, size, FilterType::Nearest).to_rgb8();
        let encoded = palette::encode_mask(&mask);
        if encoded.unmatched > 0 {
            log::debug!(
                "{name}: {} pixels outside the palette mapped to background",
                encoded.unmatched
            );
        }

        Ok(Some(SegmentationItem {
            name: name.to_string(),
            image: image.into_raw(),
            mask: encoded.mask.indices,
        }))
    }
}

fn read_manifest(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// One resized image with its class-index mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationItem {
    pub name: String,
    /// Interleaved RGB, row-major.
    pub image: Vec<u8>,
    /// Class index per pixel, row-major.
    pub mask: Vec<u8>,
}

#[derive(Debug)]
pub struct SegmentationDataset {
    items: Vec<SegmentationItem>,
}

impl SegmentationDataset {
    pub fn new(items: Vec<SegmentationItem>) -> Self {
        Self { items }
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Expands class indices of `batch_size` equally sized masks into planar
/// one-hot vectors laid out as `[batch_size, num_classes, pixels]`.
/// Indices outside `0..num_classes` leave their pixel all zeros.
pub fn one_hot(indices: &[u8], batch_size: usize, num_classes: usize) -> Vec<f32> {
    if batch_size == 0 {
        return vec![];
    }
    assert_eq!(
        indices.len() % batch_size,
        0,
        "expected masks of equal size"
    );
    let pixels = indices.len() / batch_size;
    let mut out = vec![0.0; batch_size * num_classes * pixels];
    for (b, mask) in indices.chunks(pixels.max(1)).enumerate() {
        for (p, &c) in mask.iter().enumerate() {
            let c = c as usize;
            if c < num_classes {
                out[(b * num_classes + c) * pixels + p] = 1.0;
            }
        }
    }
    out
}

#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
    normalization: Normalization,
    image_size: usize,
    num_classes: usize,
}

#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// [batch_size, height, width]
    pub targets: Tensor<B, 3, Int>,
    /// [batch_size, num_classes, height, width]
    pub one_hot: Tensor<B, 4>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(
        device: B::Device,
        normalization: Normalization,
        image_size: usize,
        num_classes: usize,
    ) -> Self {
        Self {
            device,
            normalization,
            image_size,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>) -> SegmentationBatch<B> {
        let (n, size) = (items.len(), self.image_size);

        let mut images = Vec::with_capacity(n * 3 * size * size);
        for item in &items {
            self.normalization.extend_planar(&item.image, &mut images);
        }
        let masks = items
            .iter()
            .flat_map(|item| item.mask.iter().copied())
            .collect::<Vec<_>>();

        let images = Tensor::from_data(
            TensorData::new(images, [n, 3, size, size]).convert::<B::FloatElem>(),
            &self.device,
        );
        let one_hot = Tensor::from_data(
            TensorData::new(
                one_hot(&masks, n, self.num_classes),
                [n, self.num_classes, size, size],
            )
            .convert::<B::FloatElem>(),
            &self.device,
        );
        let targets = Tensor::from_data(
            TensorData::new(
                masks.into_iter().map(i64::from).collect::<Vec<_>>(),
                [n, size, size],
            )
            .convert::<B::IntElem>(),
            &self.device,
        );

        SegmentationBatch {
            images,
            targets,
            one_hot,
        }
    }
}

/// An image to segment, resized for the network, with its source resolution.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub path: PathBuf,
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Every image below a directory, for prediction.
pub struct ImageFolder {
    paths: Vec<PathBuf>,
    image_size: u32,
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>, image_size: usize) -> Self {
        let mut paths = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|res| res.ok())
            .filter_map(|e| match MimeGuess::from_path(e.path()).first() {
                Some(mime) if mime.type_() == "image" => Some(e.into_path()),
                _ => None,
            })
            // the data loader stops at the first missing item
            .filter(|path| match image::open(path) {
                Ok(_) => true,
                Err(err) => {
                    log::warn!("skipping {}: {err}", path.display());
                    false
                }
            })
            .collect::<Vec<_>>();
        paths.sort();
        Self {
            paths,
            image_size: image_size as u32,
        }
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let path = self.paths.get(index)?;
        let image = match image::open(path) {
            Ok(image) => image,
            Err(err) => {
                log::error!("failed to decode {}: {err}", path.display());
                return None;
            }
        };
        Some(resize_for_network(path.clone(), image, self.image_size))
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

fn resize_for_network(path: PathBuf, image: DynamicImage, size: u32) -> ImageItem {
    ImageItem {
        path,
        width: image.width(),
        height: image.height(),
        image: image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8()
            .into_raw(),
    }
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    normalization: Normalization,
    image_size: usize,
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub paths: Vec<PathBuf>,
    /// Source (width, height) of every image.
    pub sizes: Vec<(u32, u32)>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, normalization: Normalization, image_size: usize) -> Self {
        Self {
            device,
            normalization,
            image_size,
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let (n, size) = (items.len(), self.image_size);
        let mut images = Vec::with_capacity(n * 3 * size * size);
        for item in &items {
            self.normalization.extend_planar(&item.image, &mut images);
        }
        let images = Tensor::from_data(
            TensorData::new(images, [n, 3, size, size]).convert::<B::FloatElem>(),
            &self.device,
        );
        let (paths, sizes) = items
            .into_iter()
            .map(|item| (item.path, (item.width, item.height)))
            .unzip();

        ImageBatch {
            images,
            paths,
            sizes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::{NUM_CLASSES, PALETTE};
    use burn::backend::NdArray;
    use image::{Luma, Rgb, RgbImage};

    type B = NdArray<f32>;

    #[test]
    fn one_hot_has_exactly_one_hot_entry_per_pixel() {
        let device = Default::default();
        let indices: Vec<u8> = (0..2 * 3 * 4).map(|i| (i * 7 % NUM_CLASSES) as u8).collect();
        let data = one_hot(&indices, 2, NUM_CLASSES);
        let tensor = Tensor::<B, 4>::from_data(TensorData::new(data, [2, NUM_CLASSES, 3, 4]), &device);

        let sums = tensor.clone().sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|&s| s == 1.0));
        let max = tensor.clone().max_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(max.iter().all(|&m| m == 1.0));

        let argmax = tensor.argmax(1).into_data().iter::<i64>().collect::<Vec<_>>();
        let expected = indices.iter().map(|&i| i as i64).collect::<Vec<_>>();
        assert_eq!(argmax, expected);
    }

    #[test]
    fn one_hot_leaves_unknown_indices_empty() {
        assert_eq!(one_hot(&[1, 9], 1, 2), vec![0.0, 0.0, 1.0, 0.0]);
        assert!(one_hot(&[], 0, 21).is_empty());
    }

    #[test]
    fn imagenet_normalization_is_planar() {
        let mut out = vec![];
        Normalization::Imagenet.extend_planar(&[255, 0, 0, 0, 255, 0], &mut out);
        assert_eq!(out.len(), 6);
        assert!((out[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((out[1] - (0.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((out[3] - (1.0 - 0.456) / 0.224).abs() < 1e-5);
    }

    #[test]
    fn caffe_normalization_reorders_to_bgr() {
        let mut out = vec![];
        Normalization::Caffe.extend_planar(&[10, 20, 30], &mut out);
        assert_eq!(out, vec![30.0 - 103.939, 20.0 - 116.779, 10.0 - 123.68]);
    }

    #[test]
    fn batcher_builds_matching_shapes() {
        let device = Default::default();
        let size = 4;
        let item = |class: u8| SegmentationItem {
            name: format!("{class}"),
            image: vec![128; size * size * 3],
            mask: vec![class; size * size],
        };
        let batcher = SegmentationBatcher::<B>::new(device, Normalization::Imagenet, size, NUM_CLASSES);
        let batch = batcher.batch(vec![item(3), item(15)]);
        assert_eq!(batch.images.dims(), [2, 3, size, size]);
        assert_eq!(batch.targets.dims(), [2, size, size]);
        assert_eq!(batch.one_hot.dims(), [2, NUM_CLASSES, size, size]);
        let targets = batch.targets.into_data().iter::<i64>().collect::<Vec<_>>();
        assert_eq!(targets[0], 3);
        assert_eq!(targets[size * size], 15);
    }

    fn write_pair(root: &Path, name: &str, class: u8) {
        RgbImage::from_pixel(40, 30, Rgb([90, 120, 200]))
            .save(root.join("JPEGImages").join(format!("{name}.jpg")))
            .unwrap();
        let mut mask = RgbImage::from_pixel(40, 30, Rgb(PALETTE[0]));
        for x in 10..30 {
            for y in 5..25 {
                mask.put_pixel(x, y, Rgb(PALETTE[class as usize]));
            }
        }
        mask.save(root.join("SegmentationClass").join(format!("{name}.png")))
            .unwrap();
    }

    fn voc_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("JPEGImages")).unwrap();
        fs::create_dir_all(root.join("SegmentationClass")).unwrap();
        write_pair(root, "a", 8);
        write_pair(root, "b", 12);
        write_pair(root, "c", 15);
        write_pair(root, "d", 1);
        write_pair(root, "e", 2);
        // a single channel mask is skipped
        RgbImage::new(40, 30)
            .save(root.join("JPEGImages").join("gray.jpg"))
            .unwrap();
        image::GrayImage::from_pixel(40, 30, Luma([0]))
            .save(root.join("SegmentationClass").join("gray.png"))
            .unwrap();
        fs::write(root.join("train.txt"), "a\nb\n\ngray\nmissing_mask\n").unwrap();
        fs::write(root.join("val.txt"), "c\nd\ne\n").unwrap();
        // an input image without a mask is skipped as well
        RgbImage::new(40, 30)
            .save(root.join("JPEGImages").join("missing_mask.jpg"))
            .unwrap();
        dir
    }

    #[test]
    fn materialize_encodes_masks_and_skips_bad_pairs() {
        let dir = voc_fixture();
        let config = DatasetConfig::new(dir.path().to_path_buf()).with_image_size(16);
        let items = config.materialize(&dir.path().join("train.txt")).unwrap();
        assert_eq!(
            items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let a = &items[0];
        assert_eq!(a.image.len(), 16 * 16 * 3);
        assert_eq!(a.mask.len(), 16 * 16);
        assert!(a.mask.iter().all(|&c| c == 0 || c == 8));
        assert!(a.mask.contains(&8) && a.mask.contains(&0));
    }

    #[test]
    fn missing_input_image_is_an_error() {
        let dir = voc_fixture();
        fs::write(dir.path().join("broken.txt"), "nope\n").unwrap();
        let config = DatasetConfig::new(dir.path().to_path_buf()).with_image_size(16);
        assert!(config.materialize(&dir.path().join("broken.txt")).is_err());
    }

    #[test]
    fn validation_manifest_is_split_and_cached() {
        let dir = voc_fixture();
        let config = DatasetConfig::new(dir.path().to_path_buf()).with_image_size(32);

        let valid = config.load(Split::Valid).unwrap();
        let test = config.load(Split::Test).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(test.len(), 2);
        assert!(dir.path().join("cache").join("valid.bin").exists());
        assert!(dir.path().join("cache").join("test.bin").exists());

        let mut names = valid
            .iter()
            .chain(test.iter())
            .map(|item| item.name)
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["c", "d", "e"]);

        // the cache alone now serves the split
        fs::remove_file(dir.path().join("val.txt")).unwrap();
        let again = config.load(Split::Test).unwrap();
        assert_eq!(
            again.iter().map(|i| i.name).collect::<Vec<_>>(),
            test.iter().map(|i| i.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn image_folder_finds_images_only() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(50, 20).save(dir.path().join("x.png")).unwrap();
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        let folder = ImageFolder::new(dir.path(), 8);
        assert_eq!(folder.len(), 1);
        let item = folder.get(0).unwrap();
        assert_eq!((item.width, item.height), (50, 20));
        assert_eq!(item.image.len(), 8 * 8 * 3);
    }

    #[test]
    fn image_folder_drops_undecodable_images() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(4, 4).save(dir.path().join("a.png")).unwrap();
        RgbImage::new(4, 4).save(dir.path().join("c.png")).unwrap();
        // signature and header intact, pixel data cut off
        let header = fs::read(dir.path().join("a.png")).unwrap()[..33].to_vec();
        fs::write(dir.path().join("b.png"), header).unwrap();
        assert!(image::image_dimensions(dir.path().join("b.png")).is_ok());

        let folder = ImageFolder::new(dir.path(), 8);
        assert_eq!(folder.len(), 2);
        let names = (0..folder.len())
            .map(|i| folder.get(i).unwrap().path.file_name().unwrap().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.png", "c.png"]);
    }

    #[test]
    fn image_size_must_divide_by_32() {
        let dir = voc_fixture();
        let err = DatasetConfig::new(dir.path().to_path_buf())
            .with_image_size(40)
            .load(Split::Train)
            .unwrap_err();
        assert!(err.to_string().contains("multiple of 32"));
        assert!(!dir.path().join("cache").exists());

        let config = DatasetConfig::new(dir.path().to_path_buf());
        assert!(config.clone().with_image_size(0).check().is_err());
        assert!(config.with_image_size(64).check().is_ok());
    }
}
