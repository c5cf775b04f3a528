//! Classification report and confusion matrix over a labelled loader.

use std::fmt;

use burn::{data::dataloader::DataLoader, prelude::*};
use log::info;

use crate::{dataset::ClassificationBatch, model::PlantClassifier};

/// Counts indexed `[true_label][predicted_label]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(num_classes: usize, y_true: &[usize], y_pred: &[usize]) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&actual, &predicted) in y_true.iter().zip(y_pred) {
            matrix.add(actual, predicted);
        }
        matrix
    }

    /// Labels outside the class range are ignored.
    pub fn add(&mut self, actual: usize, predicted: usize) {
        let num_classes = self.num_classes();
        if actual < num_classes && predicted < num_classes {
            self.counts[actual][predicted] += 1;
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn max_count(&self) -> usize {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }

    /// Samples whose true label is `class`.
    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Samples predicted as `class`.
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Zero when the denominator is zero.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl ClassMetrics {
    fn from_matrix(matrix: &ConfusionMatrix, class: usize) -> Self {
        let true_positives = matrix.get(class, class) as f64;
        let support = matrix.support(class);
        let precision = ratio(true_positives, matrix.predicted(class) as f64);
        let recall = ratio(true_positives, support as f64);
        let f1 = ratio(2.0 * precision * recall, precision + recall);

        Self {
            precision,
            recall,
            f1,
            support,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub class_names: Vec<String>,
    pub matrix: ConfusionMatrix,
    pub per_class: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

impl EvaluationReport {
    pub fn from_matrix(matrix: ConfusionMatrix, class_names: Vec<String>) -> Self {
        let num_classes = matrix.num_classes();
        let total = matrix.total();
        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|class| ClassMetrics::from_matrix(&matrix, class))
            .collect();

        let uniform = vec![1.0; num_classes];
        let supports: Vec<f64> = per_class.iter().map(|m| m.support as f64).collect();
        let macro_avg = weighted_average(&per_class, &uniform, total);
        let weighted_avg = weighted_average(&per_class, &supports, total);

        Self {
            accuracy: ratio(matrix.correct() as f64, total as f64),
            class_names,
            matrix,
            per_class,
            macro_avg,
            weighted_avg,
        }
    }

    pub fn from_predictions(y_true: &[usize], y_pred: &[usize], class_names: Vec<String>) -> Self {
        let matrix = ConfusionMatrix::from_predictions(class_names.len(), y_true, y_pred);
        Self::from_matrix(matrix, class_names)
    }

    pub fn total(&self) -> usize {
        self.matrix.total()
    }
}

fn weighted_average(per_class: &[ClassMetrics], weights: &[f64], support: usize) -> ClassMetrics {
    let norm: f64 = weights.iter().sum();
    let mean = |value: fn(&ClassMetrics) -> f64| {
        let sum: f64 = per_class.iter().zip(weights).map(|(m, w)| value(m) * w).sum();
        ratio(sum, norm)
    };

    ClassMetrics {
        precision: mean(|m| m.precision),
        recall: mean(|m| m.recall),
        f1: mean(|m| m.f1),
        support,
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .class_names
            .iter()
            .map(String::len)
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(0);

        write!(f, "{:>width$} ", "")?;
        for header in ["precision", "recall", "f1-score", "support"] {
            write!(f, " {header:>9}")?;
        }
        writeln!(f)?;
        writeln!(f)?;

        let row = |f: &mut fmt::Formatter<'_>, name: &str, m: &ClassMetrics| {
            writeln!(
                f,
                "{name:>width$}  {:>9.2} {:>9.2} {:>9.2} {:>9}",
                m.precision, m.recall, m.f1, m.support
            )
        };

        for (class, metrics) in self.per_class.iter().enumerate() {
            let name = self.class_names.get(class).map(String::as_str).unwrap_or("?");
            row(f, name, metrics)?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total()
        )?;
        row(f, "macro avg", &self.macro_avg)?;
        row(f, "weighted avg", &self.weighted_avg)
    }
}

/// Index of the largest value in each row of a row-major `[rows, cols]` buffer.
pub fn argmax_rows(values: &[f32], cols: usize) -> Vec<usize> {
    if cols == 0 {
        return Vec::new();
    }
    values
        .chunks(cols)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
                    if value > best.1 {
                        (index, value)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Runs the model over every batch and pairs each prediction with the label
/// carried in the same batch.
pub fn evaluate<B: Backend>(
    model: &PlantClassifier<B>,
    loader: &dyn DataLoader<ClassificationBatch<B>>,
    class_names: &[String],
) -> EvaluationReport {
    let num_classes = model.num_classes();
    let mut matrix = ConfusionMatrix::new(class_names.len().max(num_classes));

    for batch in loader.iter() {
        let probabilities = model
            .forward_softmax(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .expect("probabilities should read back as f32");
        let labels = batch
            .labels
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .expect("labels should read back as i64");

        for (actual, predicted) in labels.iter().zip(argmax_rows(&probabilities, num_classes)) {
            matrix.add(*actual as usize, predicted);
        }
    }

    let report = EvaluationReport::from_matrix(matrix, class_names.to_vec());
    info!(
        "Evaluated {} samples, accuracy {:.4}",
        report.total(),
        report.accuracy
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn per_class_metrics() {
        // class 0: 3 samples, 2 right; class 1: 2 samples, 1 right; class 2: never predicted
        let y_true = [0, 0, 0, 1, 1, 2];
        let y_pred = [0, 0, 1, 1, 0, 1];
        let report = EvaluationReport::from_predictions(&y_true, &y_pred, names(&["a", "b", "c"]));

        assert_eq!(report.matrix.get(0, 1), 1);
        assert_eq!(report.matrix.get(2, 1), 1);
        assert_eq!(report.total(), 6);
        assert!((report.accuracy - 0.5).abs() < 1e-12);

        let a = report.per_class[0];
        assert!((a.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((a.recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(a.support, 3);

        let b = report.per_class[1];
        assert!((b.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((b.recall - 0.5).abs() < 1e-12);
        assert!((b.f1 - 0.4).abs() < 1e-12);

        let c = report.per_class[2];
        assert_eq!((c.precision, c.recall, c.f1, c.support), (0.0, 0.0, 0.0, 1));
    }

    #[test]
    fn macro_and_weighted_averages() {
        let y_true = [0, 0, 0, 1];
        let y_pred = [0, 0, 0, 0];
        let report = EvaluationReport::from_predictions(&y_true, &y_pred, names(&["x", "y"]));

        // class 0: p=0.75, r=1; class 1: zeros
        assert!((report.macro_avg.precision - 0.375).abs() < 1e-12);
        assert!((report.macro_avg.recall - 0.5).abs() < 1e-12);
        assert!((report.weighted_avg.precision - 0.5625).abs() < 1e-12);
        assert!((report.weighted_avg.recall - 0.75).abs() < 1e-12);
        assert_eq!(report.weighted_avg.support, 4);
    }

    #[test]
    fn empty_input_yields_zeros() {
        let report = EvaluationReport::from_predictions(&[], &[], names(&["x", "y"]));
        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.macro_avg.f1, 0.0);
        assert_eq!(report.weighted_avg.precision, 0.0);
    }

    #[test]
    fn report_layout() {
        let report =
            EvaluationReport::from_predictions(&[0, 1], &[0, 1], names(&["healthy", "rust"]));
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "              precision    recall  f1-score   support");
        assert_eq!(lines[2], "     healthy       1.00      1.00      1.00         1");
        assert_eq!(lines[5], "    accuracy                           1.00         2");
        assert_eq!(lines[7], "weighted avg       1.00      1.00      1.00         2");
    }

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax_rows(&[0.1, 0.7, 0.2, 0.5, 0.5, 0.0], 3), vec![1, 0]);
        assert!(argmax_rows(&[], 0).is_empty());
    }
}
