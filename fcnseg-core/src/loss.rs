use burn::prelude::*;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-5;

/// Softmax over the class axis of `[batch, classes, height, width]` scores,
/// shifted by the per-pixel maximum for numerical stability.
pub fn pixel_softmax<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 4> {
    let max = scores.clone().max_dim(1);
    let exp = (scores - max).exp();
    let sum = exp.clone().sum_dim(1);
    exp / sum
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum LossKind {
    /// Binary cross-entropy over every class channel except background
    #[default]
    NoBackground,
    /// Binary cross-entropy over every class channel
    AllClasses,
}

impl LossKind {
    /// # Shapes
    ///   - Probabilities [batch_size, num_classes, height, width]
    ///   - One-hot targets [batch_size, num_classes, height, width]
    pub fn forward<B: Backend>(self, probs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            LossKind::NoBackground => {
                let [b, c, h, w] = probs.dims();
                binary_cross_entropy(
                    probs.slice([0..b, 1..c, 0..h, 0..w]),
                    targets.slice([0..b, 1..c, 0..h, 0..w]),
                )
            }
            LossKind::AllClasses => binary_cross_entropy(probs, targets),
        }
    }
}

/// Mean binary cross-entropy over every element, predictions clipped to `[eps, 1 - eps]`.
pub fn binary_cross_entropy<B: Backend>(probs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
    let probs = probs.clamp(EPS, 1.0 - EPS);
    let positive = targets.clone() * probs.clone().log();
    let negative = (targets.neg() + 1.0) * (probs.neg() + 1.0).log();
    (positive + negative).mean().neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn pixel_softmax_sums_to_one_per_pixel() {
        let device = Default::default();
        let scores = Tensor::<B, 4>::from_data(
            TensorData::new(
                vec![1.0f32, -2.0, 300.0, 0.5, 2.0, 0.0, 301.0, 0.5, 3.0, 2.0, 299.0, 0.5],
                [1, 3, 2, 2],
            ),
            &device,
        );
        let probs = pixel_softmax(scores);
        let sums = probs.clone().sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "{s}");
        }
        let probs = probs.into_data().to_vec::<f32>().unwrap();
        assert!(probs.iter().all(|p| p.is_finite()));
        // equal scores give a uniform distribution
        assert!((probs[3] - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn perfect_prediction_has_near_zero_loss() {
        let device = Default::default();
        let targets = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0], [1, 2, 1, 2]),
            &device,
        );
        let loss = scalar(LossKind::NoBackground.forward(targets.clone(), targets.clone()));
        assert!(loss < 1e-4, "{loss}");
        let loss = scalar(LossKind::AllClasses.forward(targets.clone(), targets));
        assert!(loss < 1e-4, "{loss}");
    }

    #[test]
    fn background_channel_is_ignored() {
        let device = Default::default();
        // background channel is completely wrong, foreground channel is right
        let probs = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 1.0], [1, 2, 1, 2]),
            &device,
        );
        let targets = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 0.0, 1.0], [1, 2, 1, 2]),
            &device,
        );
        let no_bg = scalar(LossKind::NoBackground.forward(probs.clone(), targets.clone()));
        let all = scalar(LossKind::AllClasses.forward(probs, targets));
        assert!(no_bg < 1e-4, "{no_bg}");
        assert!(all > 1.0, "{all}");
    }

    #[test]
    fn uniform_prediction_matches_closed_form() {
        let device = Default::default();
        let probs = Tensor::<B, 4>::full([1, 2, 2, 2], 0.5, &device);
        let targets = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0], [1, 2, 2, 2]),
            &device,
        );
        let loss = scalar(LossKind::AllClasses.forward(probs, targets));
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5, "{loss}");
    }
}
