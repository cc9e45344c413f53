mod cache;
#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
mod cli;
mod data;
mod evaluate;
mod loss;
mod metric;
mod model;
pub mod palette;
mod predict;
mod schedule;
mod train;
mod vgg;

#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
pub use cli::run;
pub use data::{
    one_hot, DatasetConfig, Normalization, SegmentationBatch, SegmentationBatcher,
    SegmentationDataset, SegmentationItem, Split,
};
pub use evaluate::{evaluate, EvaluateConfig, Evaluation};
pub use loss::{binary_cross_entropy, pixel_softmax, LossKind};
pub use metric::{
    ClassCounts, MeanAccuracyMetric, MeanIouMetric, PixelAccuracyMetric, SegmentationInput,
};
pub use model::{Fcn, FcnConfig, FcnVariant, Head, InitReport, Layer, SegmentationOutput};
pub use predict::{predict, Output, PredictConfig};
pub use schedule::{InverseTimeDecay, InverseTimeDecayConfig};
pub use train::{prepare, train, TrainingConfig};
pub use vgg::{Vgg16, VggFeatures};
