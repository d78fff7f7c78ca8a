//! Frame-to-video aggregation of clip predictions.
//!
//! A [`VideoAccumulator`] is created for one validation pass, fed every clip's
//! prediction vector and consumed by [`VideoAccumulator::finalize`]. Videos
//! are visited in lexicographic order so repeated runs over the same input
//! give bit-identical figures.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::metrics::{accuracy_from_rows, top_k, Criterion};

#[derive(Debug, Clone)]
struct VideoEntry {
    sum: Vec<f32>,
    label: usize,
    clips: usize,
}

/// Video-level figures of one validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetrics {
    /// Top-1 accuracy over videos, percent.
    pub top1: f64,
    /// Top-5 accuracy over videos, percent.
    pub top5: f64,
    /// Criterion evaluated once over the summed prediction matrix.
    pub loss: f64,
    /// Number of videos scored.
    pub videos: usize,
}

/// Per-video running sums of clip predictions.
#[derive(Debug, Clone)]
pub struct VideoAccumulator {
    nb_classes: usize,
    entries: BTreeMap<String, VideoEntry>,
}

impl VideoAccumulator {
    /// Empty accumulator for `nb_classes`-wide predictions.
    #[must_use]
    pub fn new(nb_classes: usize) -> Self {
        Self {
            nb_classes,
            entries: BTreeMap::new(),
        }
    }

    /// Add one clip's prediction to its video's sum.
    ///
    /// The label is recorded on the video's first clip; clips of one video
    /// are expected to share it.
    pub fn add(&mut self, video: &str, prediction: &[f32], label: usize) -> Result<()> {
        if prediction.len() != self.nb_classes {
            return Err(FusionError::Training(format!(
                "prediction for '{video}' has {} entries, expected {}",
                prediction.len(),
                self.nb_classes
            )));
        }
        if label >= self.nb_classes {
            return Err(FusionError::Dataset(format!(
                "label {label} of '{video}' is out of range for {} classes",
                self.nb_classes
            )));
        }

        match self.entries.get_mut(video) {
            Some(entry) => {
                for (acc, p) in entry.sum.iter_mut().zip(prediction) {
                    *acc += p;
                }
                entry.clips += 1;
            }
            None => {
                self.entries.insert(
                    video.to_string(),
                    VideoEntry {
                        sum: prediction.to_vec(),
                        label,
                        clips: 1,
                    },
                );
            }
        }
        Ok(())
    }

    /// Add a batch of `(batch, nb_classes)` logits.
    pub fn add_batch(&mut self, videos: &[String], logits: &Tensor, labels: &[usize]) -> Result<()> {
        let rows: Vec<Vec<f32>> = logits.to_vec2()?;
        if rows.len() != videos.len() || rows.len() != labels.len() {
            return Err(FusionError::Training(format!(
                "batch has {} predictions for {} videos and {} labels",
                rows.len(),
                videos.len(),
                labels.len()
            )));
        }
        for ((video, row), &label) in videos.iter().zip(&rows).zip(labels) {
            self.add(video, row, label)?;
        }
        Ok(())
    }

    /// Number of distinct videos seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no clip has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed prediction of `video`.
    #[must_use]
    pub fn summed(&self, video: &str) -> Option<&[f32]> {
        self.entries.get(video).map(|e| e.sum.as_slice())
    }

    /// Clips accumulated for `video`.
    #[must_use]
    pub fn clip_count(&self, video: &str) -> usize {
        self.entries.get(video).map_or(0, |e| e.clips)
    }

    /// Reduce to top-1/top-5 accuracy and the loss over summed predictions.
    ///
    /// # Errors
    ///
    /// Fails when no clip was accumulated.
    pub fn finalize(&self, criterion: &dyn Criterion) -> Result<VideoMetrics> {
        if self.entries.is_empty() {
            return Err(FusionError::Dataset(
                "validation pass produced no clip predictions".into(),
            ));
        }

        let n = self.entries.len();
        let mut rows = Vec::with_capacity(n);
        let mut flat = Vec::with_capacity(n * self.nb_classes);
        let mut labels = Vec::with_capacity(n);
        for entry in self.entries.values() {
            flat.extend_from_slice(&entry.sum);
            rows.push(entry.sum.clone());
            labels.push(entry.label);
        }

        let (top1, top5) = accuracy_from_rows(&rows, &labels, top_k(self.nb_classes));

        let device = Device::Cpu;
        let logits = Tensor::from_vec(flat, (n, self.nb_classes), &device)?;
        let targets: Vec<u32> = labels.iter().map(|&l| l as u32).collect();
        let targets = Tensor::from_vec(targets, n, &device)?;
        let loss = criterion.loss(&logits, &targets)?.to_scalar::<f32>()?;

        Ok(VideoMetrics {
            top1,
            top5,
            loss: f64::from(loss),
            videos: n,
        })
    }

    /// Video -> summed prediction map.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<f32>> {
        self.entries
            .iter()
            .map(|(video, entry)| (video.clone(), entry.sum.clone()))
            .collect()
    }

    /// Write the snapshot as JSON.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.snapshot())?;
        Ok(())
    }
}
