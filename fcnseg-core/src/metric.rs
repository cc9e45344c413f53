use burn::{
    prelude::*,
    train::metric::{
        state::{FormatOptions, NumericMetricState},
        Metric, MetricEntry, MetricMetadata, Numeric,
    },
};
use std::marker::PhantomData;

/// Per-class pixel counts of one batch, from argmax predictions against ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCounts {
    /// Pixels predicted as the class that truly are the class.
    pub intersection: Vec<u64>,
    /// Pixels truly of the class.
    pub truth: Vec<u64>,
    /// Pixels predicted as the class.
    pub predicted: Vec<u64>,
}

impl ClassCounts {
    pub fn from_indices(predicted: &[i64], truth: &[i64], num_classes: usize) -> Self {
        assert_eq!(
            predicted.len(),
            truth.len(),
            "expected one prediction per ground-truth pixel"
        );
        let mut counts = Self {
            intersection: vec![0; num_classes],
            truth: vec![0; num_classes],
            predicted: vec![0; num_classes],
        };
        let class = |i: i64| usize::try_from(i).ok().filter(|&c| c < num_classes);
        for (&p, &t) in predicted.iter().zip(truth) {
            let (p, t) = (class(p), class(t));
            if let Some(t) = t {
                counts.truth[t] += 1;
            }
            if let Some(p) = p {
                counts.predicted[p] += 1;
                if Some(p) == t {
                    counts.intersection[p] += 1;
                }
            }
        }
        counts
    }

    /// # Shapes
    ///   - Probabilities [batch_size, num_classes, height, width]
    ///   - Targets [batch_size, height, width]
    pub fn from_tensors<B: Backend>(probs: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        let [batch_size, num_classes, height, width] = probs.dims();
        let pixels = height * width;
        let predicted = int_values(probs.reshape([batch_size, num_classes, pixels]).argmax(1));
        let truth = int_values(targets.reshape([batch_size, pixels]));
        Self::from_indices(&predicted, &truth, num_classes)
    }

    fn pixels(&self) -> u64 {
        self.truth.iter().sum()
    }

    /// Mean over classes of intersection / union, classes with an empty union skipped.
    pub fn mean_iou(&self) -> f64 {
        mean_finite(
            self.intersection
                .iter()
                .zip(self.truth.iter().zip(&self.predicted))
                .map(|(&i, (&t, &p))| ratio(i, t + p - i)),
        )
    }

    /// Mean over classes of correct / ground-truth pixels, absent classes skipped.
    pub fn mean_accuracy(&self) -> f64 {
        mean_finite(
            self.intersection
                .iter()
                .zip(&self.truth)
                .map(|(&i, &t)| ratio(i, t)),
        )
    }

    /// Correct pixels over all pixels, regardless of class.
    pub fn pixel_accuracy(&self) -> f64 {
        ratio(self.intersection.iter().sum(), self.pixels())
    }
}

fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

fn ratio(num: u64, den: u64) -> f64 {
    num as f64 / den as f64
}

/// Zero-denominator ratios are NaN and dropped; no finite entry at all yields 0.
fn mean_finite(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// The input type of the segmentation metrics.
pub struct SegmentationInput<B: Backend> {
    outputs: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationInput<B> {
    pub fn new(outputs: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self { outputs, targets }
    }

    fn counts(&self) -> (usize, ClassCounts) {
        let batch_size = self.outputs.dims()[0];
        (
            batch_size,
            ClassCounts::from_tensors(self.outputs.clone(), self.targets.clone()),
        )
    }
}

macro_rules! segmentation_metric {
    ($(#[$doc:meta])* $name:ident, $display:literal, $value:ident) => {
        $(#[$doc])*
        pub struct $name<B: Backend> {
            state: NumericMetricState,
            _b: PhantomData<B>,
        }

        impl<B: Backend> $name<B> {
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl<B: Backend> Default for $name<B> {
            fn default() -> Self {
                Self {
                    state: NumericMetricState::new(),
                    _b: PhantomData,
                }
            }
        }

        impl<B: Backend> Metric for $name<B> {
            const NAME: &'static str = $display;

            type Input = SegmentationInput<B>;

            fn update(
                &mut self,
                input: &SegmentationInput<B>,
                _metadata: &MetricMetadata,
            ) -> MetricEntry {
                let (batch_size, counts) = input.counts();
                self.state.update(
                    100.0 * counts.$value(),
                    batch_size,
                    FormatOptions::new(Self::NAME).unit("%").precision(2),
                )
            }

            fn clear(&mut self) {
                self.state.reset()
            }
        }

        impl<B: Backend> Numeric for $name<B> {
            fn value(&self) -> f64 {
                self.state.value()
            }
        }
    };
}

segmentation_metric!(
    /// Mean intersection over union of the classes present in each batch.
    MeanIouMetric,
    "Mean IoU",
    mean_iou
);
segmentation_metric!(
    /// Mean per-class pixel accuracy.
    MeanAccuracyMetric,
    "Mean Accuracy",
    mean_accuracy
);
segmentation_metric!(
    /// Fraction of correctly classified pixels.
    PixelAccuracyMetric,
    "Pixel Accuracy",
    pixel_accuracy
);
