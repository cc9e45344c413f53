use image::{Rgb, RgbImage};

pub const NUM_CLASSES: usize = 21;

pub const BACKGROUND: u8 = 0;

pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "potted-plant",
    "sheep",
    "sofa",
    "train",
    "tv/monitor",
];

/// Pascal VOC colour map, indexed by class.
pub const PALETTE: [[u8; 3]; NUM_CLASSES] = [
    [0, 0, 0],
    [128, 0, 0],
    [0, 128, 0],
    [128, 128, 0],
    [0, 0, 128],
    [128, 0, 128],
    [0, 128, 128],
    [128, 128, 128],
    [64, 0, 0],
    [192, 0, 0],
    [64, 128, 0],
    [192, 128, 0],
    [64, 0, 128],
    [192, 0, 128],
    [64, 128, 128],
    [192, 128, 128],
    [0, 64, 0],
    [128, 64, 0],
    [0, 192, 0],
    [128, 192, 0],
    [0, 64, 128],
];

pub fn class_of(rgb: [u8; 3]) -> Option<u8> {
    PALETTE.iter().position(|c| *c == rgb).map(|i| i as u8)
}

pub fn color_of(index: u8) -> Option<[u8; 3]> {
    PALETTE.get(index as usize).copied()
}

pub fn class_name(index: u8) -> Option<&'static str> {
    CLASS_NAMES.get(index as usize).copied()
}

/// Per-pixel class indices in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMask {
    pub width: u32,
    pub height: u32,
    pub indices: Vec<u8>,
}

impl ClassMask {
    pub fn new(width: u32, height: u32, indices: Vec<u8>) -> Self {
        assert_eq!(
            indices.len(),
            (width * height) as usize,
            "expected one class index per pixel"
        );
        Self {
            width,
            height,
            indices,
        }
    }

    /// Fraction of pixels per class, classes absent from the mask omitted.
    pub fn coverage(&self) -> Vec<(u8, f32)> {
        let mut counts = [0usize; 256];
        for &i in &self.indices {
            counts[i as usize] += 1;
        }
        let total = self.indices.len().max(1) as f32;
        counts
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(i, &n)| (i as u8, n as f32 / total))
            .collect()
    }
}

/// A colour mask converted to class indices.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub mask: ClassMask,
    /// Pixels whose colour is not in the palette; they were mapped to background.
    pub unmatched: usize,
}

/// Exact colour match against [`PALETTE`]; any other colour (including the VOC
/// "void" border colour) becomes background.
pub fn encode_mask(rgb: &RgbImage) -> Encoded {
    let mut unmatched = 0;
    let indices = rgb
        .pixels()
        .map(|Rgb(p)| {
            class_of(*p).unwrap_or_else(|| {
                unmatched += 1;
                BACKGROUND
            })
        })
        .collect();
    Encoded {
        mask: ClassMask::new(rgb.width(), rgb.height(), indices),
        unmatched,
    }
}

/// Indices outside the palette are left black.
pub fn decode_mask(mask: &ClassMask) -> RgbImage {
    let mut rgb = RgbImage::new(mask.width, mask.height);
    for (pixel, &index) in rgb.pixels_mut().zip(mask.indices.iter()) {
        if let Some(color) = color_of(index) {
            *pixel = Rgb(color);
        }
    }
    rgb
}
