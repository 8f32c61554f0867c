use crate::core::model::{OutputGradient, SegmentationOutput};
use crate::types::{ClassCode, LabelBatch, SegError, SegResult};
use ndarray::{s, Array4};

/// Weight of the auxiliary head in the training objective
pub const AUX_LOSS_WEIGHT: f32 = 0.4;

/// Loss value and gradient of one head
#[derive(Debug, Clone)]
pub struct LossTerm {
    pub loss: f64,
    pub grad: Array4<f32>,
    /// Sum of class weights over the counted pixels
    pub weight_sum: f64,
}

/// Class-weighted softmax cross-entropy with an ignored label code
///
/// The loss is the weighted mean over counted pixels,
/// `sum(w[y] * -log p[y]) / sum(w[y])`. Pixels labelled with the ignore
/// code contribute neither to the numerator nor to the denominator.
#[derive(Debug, Clone)]
pub struct CrossEntropy {
    weights: Vec<f32>,
    ignore_index: ClassCode,
}

impl CrossEntropy {
    pub fn new(weights: Vec<f32>, ignore_index: ClassCode) -> SegResult<Self> {
        if weights.is_empty() {
            return Err(SegError::Config("At least one class weight is required".to_string()));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SegError::Config(format!(
                "Class weights must be finite and non-negative: {:?}",
                weights
            )));
        }
        if (0..weights.len() as ClassCode).contains(&ignore_index) {
            return Err(SegError::Config(format!(
                "Ignore code {} collides with one of the {} classes",
                ignore_index,
                weights.len()
            )));
        }
        Ok(Self {
            weights,
            ignore_index,
        })
    }

    pub fn classes(&self) -> usize {
        self.weights.len()
    }

    pub fn ignore_index(&self) -> ClassCode {
        self.ignore_index
    }

    pub fn compute(&self, logits: &Array4<f32>, labels: &LabelBatch) -> SegResult<LossTerm> {
        let (batch, classes, rows, cols) = logits.dim();
        if classes != self.classes() {
            return Err(SegError::Model(format!(
                "Model produced {} class channels, loss expects {}",
                classes,
                self.classes()
            )));
        }
        if labels.dim() != (batch, rows, cols) {
            return Err(SegError::Model(format!(
                "Label shape {:?} does not match scores {:?}",
                labels.dim(),
                logits.dim()
            )));
        }

        let mut grad = Array4::<f32>::zeros(logits.raw_dim());
        let mut total = 0.0f64;
        let mut weight_sum = 0.0f64;
        let mut exp = vec![0.0f64; classes];

        for ((b, r, c), &label) in labels.indexed_iter() {
            if label == self.ignore_index {
                continue;
            }
            let class = usize::try_from(label)
                .ok()
                .filter(|&class| class < classes)
                .ok_or_else(|| {
                    SegError::Model(format!(
                        "Label {} is outside the {} classes and is not the ignore code {}",
                        label, classes, self.ignore_index
                    ))
                })?;

            let scores = logits.slice(s![b, .., r, c]);
            let max = scores.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            for (e, &v) in exp.iter_mut().zip(scores.iter()) {
                *e = ((v - max) as f64).exp();
            }
            let sum: f64 = exp.iter().sum();
            let weight = self.weights[class] as f64;

            total += weight * (sum.ln() - (scores[class] - max) as f64);
            weight_sum += weight;

            for (j, e) in exp.iter().enumerate() {
                let target = if j == class { 1.0 } else { 0.0 };
                grad[[b, j, r, c]] = (weight * (e / sum - target)) as f32;
            }
        }

        if weight_sum > 0.0 {
            let scale = (1.0 / weight_sum) as f32;
            grad.mapv_inplace(|g| g * scale);
            total /= weight_sum;
        } else {
            total = 0.0;
        }

        Ok(LossTerm {
            loss: total,
            grad,
            weight_sum,
        })
    }
}

/// Objective value with the gradient for both heads
#[derive(Debug, Clone)]
pub struct ObjectiveValue {
    pub loss: f64,
    pub grad: OutputGradient,
}

/// `CE(out) + 0.4 * CE(aux)`
#[derive(Debug, Clone)]
pub struct SegmentationObjective {
    criterion: CrossEntropy,
    aux_weight: f32,
}

impl SegmentationObjective {
    pub fn new(criterion: CrossEntropy) -> Self {
        Self {
            criterion,
            aux_weight: AUX_LOSS_WEIGHT,
        }
    }

    pub fn criterion(&self) -> &CrossEntropy {
        &self.criterion
    }

    pub fn evaluate(
        &self,
        output: &SegmentationOutput,
        labels: &LabelBatch,
    ) -> SegResult<ObjectiveValue> {
        let primary = self.criterion.compute(&output.out, labels)?;
        if primary.weight_sum == 0.0 {
            log::warn!("Batch has no counted pixels; loss and gradients are zero");
        }

        let mut loss = primary.loss;
        let aux = match &output.aux {
            Some(aux_logits) => {
                let term = self.criterion.compute(aux_logits, labels)?;
                loss += self.aux_weight as f64 * term.loss;
                let weight = self.aux_weight;
                Some(term.grad.mapv(|g| g * weight))
            }
            None => None,
        };

        Ok(ObjectiveValue {
            loss,
            grad: OutputGradient {
                out: primary.grad,
                aux,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    #[test]
    fn test_uniform_scores() {
        let ce = CrossEntropy::new(vec![1.0, 1.0], 2).unwrap();
        let logits = Array4::<f32>::zeros((1, 2, 2, 2));
        let labels = Array3::<ClassCode>::zeros((1, 2, 2));
        let term = ce.compute(&logits, &labels).unwrap();

        assert_relative_eq!(term.loss, 2.0f64.ln(), epsilon = 1e-9);
        assert_relative_eq!(term.weight_sum, 4.0);
        // (p - onehot) / count
        assert_relative_eq!(term.grad[[0, 0, 0, 0]], -0.125, epsilon = 1e-6);
        assert_relative_eq!(term.grad[[0, 1, 0, 0]], 0.125, epsilon = 1e-6);
    }

    #[test]
    fn test_ignored_pixels_do_not_count() {
        let ce = CrossEntropy::new(vec![1.0, 3.0], 7).unwrap();
        let mut logits = Array4::<f32>::zeros((1, 2, 1, 2));
        logits[[0, 1, 0, 1]] = 50.0;
        let labels = Array3::from_shape_vec((1, 1, 2), vec![1, 7]).unwrap();

        let term = ce.compute(&logits, &labels).unwrap();
        assert_relative_eq!(term.loss, 2.0f64.ln(), epsilon = 1e-9);
        assert_relative_eq!(term.weight_sum, 3.0);
        assert_eq!(term.grad[[0, 0, 0, 1]], 0.0);
        assert_eq!(term.grad[[0, 1, 0, 1]], 0.0);

        let all_ignored = Array3::from_elem((1, 1, 2), 7);
        let term = ce.compute(&logits, &all_ignored).unwrap();
        assert_eq!(term.loss, 0.0);
        assert!(term.grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_invalid_labels_and_codes() {
        assert!(CrossEntropy::new(vec![1.0, 1.0], 1).is_err());
        assert!(CrossEntropy::new(vec![], 0).is_err());

        let ce = CrossEntropy::new(vec![1.0, 1.0], 2).unwrap();
        let logits = Array4::<f32>::zeros((1, 2, 1, 1));
        let labels = Array3::from_elem((1, 1, 1), 5);
        assert!(matches!(ce.compute(&logits, &labels), Err(SegError::Model(_))));
    }

    #[test]
    fn test_objective_weights_aux_head() {
        let ce = CrossEntropy::new(vec![1.0, 1.0], 2).unwrap();
        let objective = SegmentationObjective::new(ce);
        let output = SegmentationOutput {
            out: Array4::zeros((1, 2, 1, 1)),
            aux: Some(Array4::zeros((1, 2, 1, 1))),
        };
        let labels = Array3::zeros((1, 1, 1));

        let value = objective.evaluate(&output, &labels).unwrap();
        assert_relative_eq!(value.loss, 1.4 * 2.0f64.ln(), epsilon = 1e-6);
        let aux = value.grad.aux.unwrap();
        assert_relative_eq!(aux[[0, 1, 0, 0]], 0.4 * 0.5, epsilon = 1e-6);
        assert_relative_eq!(value.grad.out[[0, 1, 0, 0]], 0.5, epsilon = 1e-6);
    }
}
