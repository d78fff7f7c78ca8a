//! Running metrics, top-k accuracy, the loss criterion and CSV epoch logs.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::Serialize;

use crate::error::Result;

/// Loss over a `(n, nb_classes)` prediction matrix and `n` u32 labels.
pub trait Criterion {
    /// Scalar loss tensor.
    fn loss(&self, logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor>;
}

/// Softmax cross entropy, averaged over rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl Criterion for CrossEntropy {
    fn loss(&self, logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::loss::cross_entropy(logits, labels)
    }
}

/// Running average of a scalar.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    /// Last value.
    pub val: f64,
    /// Weighted sum.
    pub sum: f64,
    /// Total weight.
    pub count: usize,
}

impl AverageMeter {
    /// Empty meter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed `n` times.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    /// Current average, 0 before any update.
    #[must_use]
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Rank of `label` in `scores` sorted descending; ties rank the lower index first.
///
/// A NaN label score ranks last, so it never counts as a top-k hit.
#[must_use]
pub fn rank_of(scores: &[f32], label: usize) -> usize {
    let target = scores[label];
    if target.is_nan() {
        return scores.len();
    }
    scores
        .iter()
        .enumerate()
        .filter(|&(j, &s)| s > target || (s == target && j < label))
        .count()
}

/// Largest k used for the "top-5" figure.
#[must_use]
pub fn top_k(nb_classes: usize) -> usize {
    nb_classes.min(5)
}

/// Top-1 and top-k accuracy (percent) of rows of `scores` against `labels`.
#[must_use]
pub fn accuracy_from_rows(scores: &[Vec<f32>], labels: &[usize], k: usize) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let (mut top1, mut topk) = (0usize, 0usize);
    for (row, &label) in scores.iter().zip(labels) {
        let rank = rank_of(row, label);
        if rank == 0 {
            top1 += 1;
        }
        if rank < k {
            topk += 1;
        }
    }
    let n = scores.len() as f64;
    (100.0 * top1 as f64 / n, 100.0 * topk as f64 / n)
}

/// Batch top-1 / top-k accuracy (percent) from `(batch, nb_classes)` logits.
pub fn accuracy(logits: &Tensor, labels: &[usize]) -> Result<(f64, f64)> {
    let rows: Vec<Vec<f32>> = logits.to_vec2()?;
    let k = top_k(logits.dim(1)?);
    Ok(accuracy_from_rows(&rows, labels, k))
}

/// One row of `training.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct TrainRecord {
    /// Epoch index.
    #[serde(rename = "Epoch")]
    pub epoch: usize,
    /// Mean batch time in seconds.
    #[serde(rename = "Batch Time")]
    pub batch_time: f64,
    /// Mean data wait in seconds.
    #[serde(rename = "Data Time")]
    pub data_time: f64,
    /// Mean clip loss.
    #[serde(rename = "Loss")]
    pub loss: f64,
    /// Clip top-1 accuracy.
    #[serde(rename = "Prec@1")]
    pub prec1: f64,
    /// Clip top-5 accuracy.
    #[serde(rename = "Prec@5")]
    pub prec5: f64,
    /// Learning rate during the epoch.
    #[serde(rename = "lr")]
    pub lr: f64,
}

/// One row of `testing.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord {
    /// Epoch index.
    #[serde(rename = "Epoch")]
    pub epoch: usize,
    /// Mean batch time in seconds.
    #[serde(rename = "Batch Time")]
    pub batch_time: f64,
    /// Video-level loss.
    #[serde(rename = "Loss")]
    pub loss: f64,
    /// Video top-1 accuracy.
    #[serde(rename = "Prec@1")]
    pub prec1: f64,
    /// Video top-5 accuracy.
    #[serde(rename = "Prec@5")]
    pub prec5: f64,
}

/// Append-only CSV log; the header is written when the file is created.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    /// Log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row.
    pub fn append<R: Serialize>(&self, record: &R) -> Result<()> {
        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.avg(), 0.0);
        meter.update(2.0, 1);
        meter.update(4.0, 3);
        assert_eq!(meter.val, 4.0);
        assert_eq!(meter.count, 4);
        assert!((meter.avg() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_rank_ties_prefer_lower_index() {
        let scores = [1.0, 3.0, 3.0, 0.5];
        assert_eq!(rank_of(&scores, 1), 0);
        assert_eq!(rank_of(&scores, 2), 1);
        assert_eq!(rank_of(&scores, 0), 2);
        assert_eq!(rank_of(&scores, 3), 3);
    }

    #[test]
    fn test_rank_of_nan_label_is_last() {
        assert_eq!(rank_of(&[f32::NAN; 3], 1), 3);
        assert_eq!(rank_of(&[0.5, f32::NAN, 0.1], 1), 3);
        // a NaN elsewhere does not outrank a real score
        assert_eq!(rank_of(&[f32::NAN, 0.5, 0.1], 1), 0);
    }

    #[test]
    fn test_batch_accuracy() {
        let logits = Tensor::new(
            &[
                [0.1f32, 0.9, 0.0, 0.0, 0.0, 0.0],
                [0.9, 0.1, 0.0, 0.0, 0.0, 0.0],
                [0.6, 0.5, 0.4, 0.3, 0.2, 0.1],
                [0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let (top1, top5) = accuracy(&logits, &[1, 1, 5, 5]).unwrap();
        assert!((top1 - 50.0).abs() < 1e-9);
        // row 2 ranks label 5 sixth
        assert!((top5 - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_top_k_clamped_to_classes() {
        assert_eq!(top_k(12), 5);
        assert_eq!(top_k(3), 3);
        let (top1, topk) = accuracy_from_rows(&[vec![0.0, 1.0, 2.0]], &[0], top_k(3));
        assert_eq!(top1, 0.0);
        assert_eq!(topk, 100.0);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        let loss: f32 = CrossEntropy
            .loss(&logits, &labels)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_metrics_log_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("testing.csv"));
        for epoch in 0..2 {
            log.append(&ValidationRecord {
                epoch,
                batch_time: 0.5,
                loss: 1.25,
                prec1: 50.0,
                prec5: 100.0,
            })
            .unwrap();
        }
        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Epoch,Batch Time,Loss,Prec@1,Prec@5");
        assert!(lines[2].starts_with("1,"));
    }
}
