use crate::core::batch::BatchAssembler;
use crate::core::model::{ModelMode, SegmentationModel};
use crate::core::partition::enumerate_evaluation_tiles;
use crate::io::blob_store::RunStore;
use crate::types::{ClassCode, LabelBatch, NormalizationStats, SegError, SegResult};
use ndarray::{Array1, Array3, Array4, Axis, Zip};
use ndarray_npy::write_npy;
use std::fmt;
use std::fs;
use std::path::Path;

/// Tiles per evaluation batch
pub const EVALUATION_BATCH_SIZE: usize = 64;

/// Evaluation parameters
#[derive(Debug, Clone)]
pub struct EvaluationParams {
    pub max_windows: usize,
    pub batch_size: usize,
}

impl Default for EvaluationParams {
    fn default() -> Self {
        Self {
            max_windows: usize::MAX,
            batch_size: EVALUATION_BATCH_SIZE,
        }
    }
}

/// Per-class pixel counts over the evaluated tiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positives: Vec<u64>,
    pub false_positives: Vec<u64>,
    pub false_negatives: Vec<u64>,
    pub true_negatives: Vec<u64>,
}

impl ConfusionCounts {
    pub fn new(classes: usize) -> Self {
        Self {
            true_positives: vec![0; classes],
            false_positives: vec![0; classes],
            false_negatives: vec![0; classes],
            true_negatives: vec![0; classes],
        }
    }

    pub fn classes(&self) -> usize {
        self.true_positives.len()
    }

    /// Count one batch; pixels labelled `ignore` touch no counter
    pub fn update(
        &mut self,
        predictions: &Array3<ClassCode>,
        labels: &LabelBatch,
        ignore: ClassCode,
    ) {
        let classes = self.classes();
        Zip::from(predictions).and(labels).for_each(|&predicted, &label| {
            if label == ignore {
                return;
            }
            for class in 0..classes {
                let code = class as ClassCode;
                match (predicted == code, label == code) {
                    (true, true) => self.true_positives[class] += 1,
                    (true, false) => self.false_positives[class] += 1,
                    (false, true) => self.false_negatives[class] += 1,
                    (false, false) => self.true_negatives[class] += 1,
                }
            }
        });
    }

    pub fn precision(&self, class: usize) -> Option<f64> {
        ratio(
            self.true_positives[class],
            self.true_positives[class] + self.false_positives[class],
        )
    }

    pub fn recall(&self, class: usize) -> Option<f64> {
        ratio(
            self.true_positives[class],
            self.true_positives[class] + self.false_negatives[class],
        )
    }

    pub fn f1(&self, class: usize) -> Option<f64> {
        let precision = self.precision(class)?;
        let recall = self.recall(class)?;
        let sum = precision + recall;
        if sum == 0.0 {
            None
        } else {
            Some(2.0 * precision * recall / sum)
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

/// Renders `None` as "undefined"
struct MetricList<'a>(&'a [Option<f64>]);

impl fmt::Display for MetricList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self
            .0
            .iter()
            .map(|v| match v {
                Some(v) => format!("{}", v),
                None => "undefined".to_string(),
            })
            .collect();
        write!(f, "[{}]", values.join(", "))
    }
}

/// Result of an evaluation run
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub counts: ConfusionCounts,
    /// Arg-max predictions, ignored pixels shifted up by the class count
    pub predictions: Array1<ClassCode>,
    pub ground_truth: Array1<ClassCode>,
    pub windows: usize,
}

impl EvaluationOutcome {
    pub fn precisions(&self) -> Vec<Option<f64>> {
        (0..self.counts.classes()).map(|c| self.counts.precision(c)).collect()
    }

    pub fn recalls(&self) -> Vec<Option<f64>> {
        (0..self.counts.classes()).map(|c| self.counts.recall(c)).collect()
    }

    pub fn f1_scores(&self) -> Vec<Option<f64>> {
        (0..self.counts.classes()).map(|c| self.counts.f1(c)).collect()
    }

    /// Text summary with counts, metrics and the normalization constants
    pub fn report(&self, stats: &NormalizationStats) -> String {
        format!(
            "True positives: {:?}\n\
             False positives: {:?}\n\
             False negatives: {:?}\n\
             True negatives: {:?}\n\
             Recalls: {}\n\
             Precisions: {}\n\
             f1 scores: {}\n\
             Means:               {:?}\n\
             Standard Deviations: {:?}\n",
            self.counts.true_positives,
            self.counts.false_positives,
            self.counts.false_negatives,
            self.counts.true_negatives,
            MetricList(&self.recalls()),
            MetricList(&self.precisions()),
            MetricList(&self.f1_scores()),
            stats.means(),
            stats.stds(),
        )
    }

    /// Predictions and ground truth restricted to pixels whose truth is 0 or 1
    pub fn binary_subset(&self) -> (Array1<ClassCode>, Array1<ClassCode>) {
        let (predictions, truth): (Vec<ClassCode>, Vec<ClassCode>) = self
            .predictions
            .iter()
            .zip(self.ground_truth.iter())
            .filter(|&(_, &gt)| (0..2).contains(&gt))
            .map(|(&p, &gt)| (p, gt))
            .unzip();
        (Array1::from(predictions), Array1::from(truth))
    }

    /// Write `evaluations.txt`, `predictions.npy` and `ground_truth.npy`
    pub fn write_artifacts(&self, stats: &NormalizationStats, dir: &Path) -> SegResult<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("evaluations.txt"), self.report(stats))?;
        let (predictions, truth) = self.binary_subset();
        write_npy(dir.join("predictions.npy"), &predictions)?;
        write_npy(dir.join("ground_truth.npy"), &truth)?;
        Ok(())
    }

    /// Write the artifacts to scratch space and upload them under the run prefix
    pub fn publish(&self, stats: &NormalizationStats, run: &RunStore) -> SegResult<()> {
        let dir = tempfile::Builder::new()
            .prefix("geoseg-eval-")
            .tempdir_in(run.scratch())?;
        self.write_artifacts(stats, dir.path())?;

        let keys = run.keys();
        run.upload(&dir.path().join("evaluations.txt"), &keys.evaluations())?;
        run.upload(&dir.path().join("predictions.npy"), &keys.predictions())?;
        run.upload(&dir.path().join("ground_truth.npy"), &keys.ground_truth())?;
        Ok(())
    }
}

/// Arg-max over the class axis of (batch, class, rows, cols) scores
///
/// Ties go to the lowest class index.
pub fn argmax_classes(scores: &Array4<f32>) -> Array3<ClassCode> {
    scores.map_axis(Axis(1), |lane| {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (class, &score) in lane.iter().enumerate() {
            if score > best_score {
                best = class;
                best_score = score;
            }
        }
        best as ClassCode
    })
}

/// Runs a model over the held-out evaluation tiles
pub struct Evaluator<'a> {
    assembler: &'a BatchAssembler<'a>,
    classes: usize,
    params: EvaluationParams,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        assembler: &'a BatchAssembler<'a>,
        classes: usize,
        params: EvaluationParams,
    ) -> Self {
        Self {
            assembler,
            classes,
            params,
        }
    }

    pub fn evaluate<M: SegmentationModel>(&self, model: &mut M) -> SegResult<EvaluationOutcome> {
        let pair = self.assembler.pair();
        let tiles = enumerate_evaluation_tiles(
            pair.width(),
            pair.height(),
            self.assembler.params().window_size,
            self.params.max_windows,
        )?;
        if tiles.is_empty() {
            log::warn!("No evaluation tiles; every metric will be undefined");
        }
        log::info!("Evaluating {} windows", tiles.len());

        model.set_mode(ModelMode::Eval);
        let ignore = self.assembler.params().label_nodata;
        let offset = self.classes as ClassCode;
        let mut counts = ConfusionCounts::new(self.classes);
        let mut predictions = Vec::new();
        let mut ground_truth = Vec::new();

        for chunk in tiles.chunks(self.params.batch_size.max(1)) {
            let batch = self.assembler.assemble(chunk)?;
            let output = model.forward(&batch)?;
            if output.out.dim().1 != self.classes {
                return Err(SegError::Model(format!(
                    "Model produced {} class channels, expected {}",
                    output.out.dim().1,
                    self.classes
                )));
            }

            let mut predicted = argmax_classes(&output.out);
            Zip::from(&mut predicted)
                .and(&batch.labels)
                .for_each(|p, &label| {
                    if label == ignore {
                        *p += offset;
                    }
                });

            counts.update(&predicted, &batch.labels, ignore);
            predictions.extend(predicted.iter().copied());
            ground_truth.extend(batch.labels.iter().copied());
        }

        let outcome = EvaluationOutcome {
            counts,
            predictions: Array1::from(predictions),
            ground_truth: Array1::from(ground_truth),
            windows: tiles.len(),
        };
        log::info!("True Positives  {:?}", outcome.counts.true_positives);
        log::info!("False Positives {:?}", outcome.counts.false_positives);
        log::info!("False Negatives {:?}", outcome.counts.false_negatives);
        log::info!("True Negatives  {:?}", outcome.counts.true_negatives);
        log::info!("Recalls    {}", MetricList(&outcome.recalls()));
        log::info!("Precisions {}", MetricList(&outcome.precisions()));
        log::info!("f1 {}", MetricList(&outcome.f1_scores()));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BandStats;
    use ndarray::array;

    #[test]
    fn test_ignored_pixels_touch_no_counter() {
        let mut counts = ConfusionCounts::new(2);
        let predictions: Array3<ClassCode> = array![[[0, 1], [1, 3]]];
        let labels: LabelBatch = array![[[0, 1], [0, 2]]];
        counts.update(&predictions, &labels, 2);

        assert_eq!(counts.true_positives, vec![1, 1]);
        assert_eq!(counts.false_positives, vec![0, 1]);
        assert_eq!(counts.false_negatives, vec![1, 0]);
        assert_eq!(counts.true_negatives, vec![1, 1]);
        let total: u64 = (0..2)
            .map(|c| {
                counts.true_positives[c]
                    + counts.false_positives[c]
                    + counts.false_negatives[c]
                    + counts.true_negatives[c]
            })
            .sum();
        assert_eq!(total, 2 * 3);
    }

    #[test]
    fn test_absent_class_is_undefined() {
        let mut counts = ConfusionCounts::new(3);
        let predictions: Array3<ClassCode> = array![[[0, 0], [1, 1]]];
        let labels: LabelBatch = array![[[0, 1], [1, 1]]];
        counts.update(&predictions, &labels, 3);

        assert_eq!(counts.precision(2), None);
        assert_eq!(counts.recall(2), None);
        assert_eq!(counts.f1(2), None);
        assert_eq!(counts.precision(1), Some(1.0));
        assert_eq!(counts.recall(1), Some(2.0 / 3.0));

        let outcome = EvaluationOutcome {
            counts,
            predictions: Array1::from(vec![0, 0, 1, 1]),
            ground_truth: Array1::from(vec![0, 1, 1, 1]),
            windows: 1,
        };
        let stats = NormalizationStats::new(vec![BandStats { mean: 1.0, std: 2.0 }]);
        let report = outcome.report(&stats);
        assert!(report.contains("Recalls: [1, 0.6666666666666666, undefined]"));
        assert!(report.contains("Precisions: [0.5, 1, undefined]"));
        assert!(report.contains("Means:               [1.0]"));
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 9);
        assert!(lines[0].starts_with("True positives: "));
        assert_eq!(lines[8], "Standard Deviations: [2.0]");
    }

    #[test]
    fn test_argmax_prefers_lowest_class_on_ties() {
        let mut scores = Array4::<f32>::zeros((1, 3, 1, 2));
        scores[[0, 2, 0, 1]] = 1.0;
        let predicted = argmax_classes(&scores);
        let expected: Array3<ClassCode> = array![[[0, 2]]];
        assert_eq!(predicted, expected);
    }

    #[test]
    fn test_binary_subset() {
        let outcome = EvaluationOutcome {
            counts: ConfusionCounts::new(3),
            predictions: Array1::from(vec![0, 2, 1, 5]),
            ground_truth: Array1::from(vec![0, 2, 1, 3]),
            windows: 1,
        };
        let (predictions, truth) = outcome.binary_subset();
        assert_eq!(predictions.to_vec(), vec![0, 1]);
        assert_eq!(truth.to_vec(), vec![0, 1]);
    }
}
