//! Clip index construction from video label and frame-count dictionaries.
//!
//! Training uses every admissible start frame of every video. Validation
//! samples one start frame per `nb_per_stack` window so each video is covered
//! by evenly spaced, non-overlapping clips.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};

/// Frames reserved at the end of a video beyond the stack itself.
const TAIL_MARGIN: usize = 3;

/// One clip: a video, its 1-based start frame and the 0-based label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRef {
    /// Video identity.
    pub video: String,
    /// First frame of the stack (1-based).
    pub start: usize,
    /// Class index.
    pub label: usize,
}

/// Labels may be stored as numbers or numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Int(i64),
    Text(String),
}

/// Read a JSON `video -> 1-based label` map.
pub fn load_label_dict(path: &Path) -> Result<BTreeMap<String, i64>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FusionError::Dataset(format!("cannot read label dictionary {}: {e}", path.display()))
    })?;
    let raw: BTreeMap<String, RawLabel> = serde_json::from_str(&content)?;
    raw.into_iter()
        .map(|(video, label)| {
            let value = match label {
                RawLabel::Int(v) => v,
                RawLabel::Text(s) => s.trim().parse().map_err(|_| {
                    FusionError::Dataset(format!("label '{s}' of '{video}' is not an integer"))
                })?,
            };
            Ok((video, value))
        })
        .collect()
}

/// Read a JSON `video -> number of frames` map.
pub fn load_frame_count(path: &Path) -> Result<BTreeMap<String, i64>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FusionError::Dataset(format!("cannot read frame counts {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Train and validation clip lists.
#[derive(Debug, Clone, Default)]
pub struct VideoIndex {
    /// Training clips, sorted by video then start frame.
    pub train: Vec<ClipRef>,
    /// Validation clips, sorted by video then start frame.
    pub val: Vec<ClipRef>,
}

impl VideoIndex {
    /// Build both splits.
    ///
    /// # Errors
    ///
    /// Fails with [`FusionError::Dataset`] when a video has no frame count,
    /// a label outside `1..=nb_classes`, or a non-positive clip count.
    pub fn build(
        train_labels: &BTreeMap<String, i64>,
        test_labels: &BTreeMap<String, i64>,
        frame_count: &BTreeMap<String, i64>,
        nb_per_stack: usize,
        nb_classes: usize,
    ) -> Result<Self> {
        if nb_per_stack == 0 {
            return Err(FusionError::Config("nb_per_stack must be > 0".into()));
        }

        let mut train = Vec::new();
        for (video, &raw) in train_labels {
            let label = zero_based(video, raw, nb_classes)?;
            let clips = available_clips(video, frame_count, nb_per_stack)?;
            train.extend((1..=clips).map(|start| ClipRef {
                video: video.clone(),
                start,
                label,
            }));
        }

        let mut val = Vec::new();
        for (video, &raw) in test_labels {
            let label = zero_based(video, raw, nb_classes)?;
            let clips = available_clips(video, frame_count, nb_per_stack)?;
            val.extend(
                (0..clips)
                    .filter(|i| i % nb_per_stack == 0)
                    .map(|i| ClipRef {
                        video: video.clone(),
                        start: i + 1,
                        label,
                    }),
            );
        }

        tracing::info!(
            "Clip index: {} training clips from {} videos, {} validation clips from {} videos",
            train.len(),
            train_labels.len(),
            val.len(),
            test_labels.len()
        );
        Ok(Self { train, val })
    }

    /// Load the dictionaries named in `config.data` and build the index.
    pub fn from_config(config: &FusionConfig) -> Result<Self> {
        let data = &config.data;
        let train = load_label_dict(Path::new(&data.train_labels))?;
        let test = load_label_dict(Path::new(&data.test_labels))?;
        let frames = load_frame_count(Path::new(&data.frame_count))?;
        Self::build(
            &train,
            &test,
            &frames,
            config.model.clip_length(),
            config.model.nb_classes,
        )
    }
}

fn zero_based(video: &str, raw: i64, nb_classes: usize) -> Result<usize> {
    if raw < 1 || raw as usize > nb_classes {
        return Err(FusionError::Dataset(format!(
            "label {raw} of '{video}' is outside 1..={nb_classes}"
        )));
    }
    Ok(raw as usize - 1)
}

fn available_clips(
    video: &str,
    frame_count: &BTreeMap<String, i64>,
    nb_per_stack: usize,
) -> Result<usize> {
    let frames = *frame_count
        .get(video)
        .ok_or_else(|| FusionError::Dataset(format!("no frame count for '{video}'")))?;
    let clips = frames - (nb_per_stack + TAIL_MARGIN) as i64;
    if clips <= 0 {
        return Err(FusionError::Dataset(format!(
            "'{video}' has {frames} frames, too few for stacks of {nb_per_stack} (clip count {clips})"
        )));
    }
    Ok(clips as usize)
}
