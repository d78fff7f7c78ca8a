//! Checkpoint persistence.
//!
//! A checkpoint is one safetensors file holding every model variable under
//! `model.<component>.<param>` and the optimizer state under `optim.<slot>.<param>`.
//! Scalar training state travels in the safetensors metadata.
//!
//! Each run directory has two checkpoint slots plus a snapshot:
//! - `checkpoint.safetensors`, rewritten every epoch
//! - `model_best.safetensors`, a copy of the latest taken after an improving epoch
//! - `video_preds.json`, the per-video summed predictions of the best epoch

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use crate::aggregate::VideoAccumulator;
use crate::error::{FusionError, Result};
use crate::model::FusionNet;
use crate::optimizer::Optimizer;
use crate::scheduler::ReduceLROnPlateau;

/// File name of the latest checkpoint.
pub const LATEST_CHECKPOINT: &str = "checkpoint.safetensors";
/// File name of the best checkpoint.
pub const BEST_CHECKPOINT: &str = "model_best.safetensors";
/// File name of the video-prediction snapshot.
pub const VIDEO_SNAPSHOT: &str = "video_preds.json";

/// Best-metric value before any validation pass; every real accuracy beats it.
pub const BEST_PREC1_SENTINEL: f64 = f64::NEG_INFINITY;

const FORMAT_TAG: &str = "action-fusion/1";
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

/// Scalar training state stored next to the tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Last completed epoch.
    pub epoch: usize,
    /// Best video-level top-1 so far.
    pub best_prec1: f64,
    /// Learning rate at save time.
    pub lr: f64,
    /// Optimizer updates applied.
    pub optimizer_steps: usize,
    /// Scheduler state.
    pub scheduler: Option<ReduceLROnPlateau>,
    /// Training configuration (YAML).
    pub config: Option<String>,
}

impl TrainingState {
    fn to_metadata(&self) -> Result<HashMap<String, String>> {
        let mut meta = HashMap::new();
        meta.insert("format".to_string(), FORMAT_TAG.to_string());
        meta.insert("epoch".to_string(), self.epoch.to_string());
        meta.insert("best_prec1".to_string(), self.best_prec1.to_string());
        meta.insert("lr".to_string(), self.lr.to_string());
        meta.insert(
            "optimizer_steps".to_string(),
            self.optimizer_steps.to_string(),
        );
        if let Some(scheduler) = &self.scheduler {
            meta.insert("scheduler".to_string(), serde_json::to_string(scheduler)?);
        }
        if let Some(config) = &self.config {
            meta.insert("config".to_string(), config.clone());
        }
        Ok(meta)
    }

    fn from_metadata(meta: &HashMap<String, String>) -> Result<Self> {
        match meta.get("format").map(String::as_str) {
            Some(FORMAT_TAG) => {}
            other => {
                return Err(FusionError::Checkpoint(format!(
                    "unsupported checkpoint format {other:?}"
                )))
            }
        }
        let field = |key: &str| {
            meta.get(key)
                .ok_or_else(|| FusionError::Checkpoint(format!("metadata is missing '{key}'")))
        };
        let parse_err = |key: &str| {
            let key = key.to_string();
            move |e: std::num::ParseIntError| {
                FusionError::Checkpoint(format!("invalid '{key}' in metadata: {e}"))
            }
        };
        let parse_float = |key: &str| -> Result<f64> {
            field(key)?.parse::<f64>().map_err(|e| {
                FusionError::Checkpoint(format!("invalid '{key}' in metadata: {e}"))
            })
        };

        Ok(Self {
            epoch: field("epoch")?.parse().map_err(parse_err("epoch"))?,
            best_prec1: parse_float("best_prec1")?,
            lr: parse_float("lr")?,
            optimizer_steps: field("optimizer_steps")?
                .parse()
                .map_err(parse_err("optimizer_steps"))?,
            scheduler: meta
                .get("scheduler")
                .map(|s| serde_json::from_str(s))
                .transpose()?,
            config: meta.get("config").cloned(),
        })
    }
}

/// Write a checkpoint file (through a temporary file renamed into place).
pub fn write_checkpoint(
    path: &Path,
    state: &TrainingState,
    model: &FusionNet,
    optimizer: &dyn Optimizer,
) -> Result<()> {
    let mut tensors: Vec<(String, Tensor)> = model
        .named_vars()?
        .into_iter()
        .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
        .collect();
    tensors.extend(
        optimizer
            .state_tensors()
            .into_iter()
            .map(|(name, t)| (format!("{OPTIM_PREFIX}{name}"), t)),
    );

    let metadata = Some(state.to_metadata()?);
    let tmp = path.with_extension("safetensors.tmp");
    safetensors::serialize_to_file(tensors, &metadata, &tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A checkpoint read back from disk.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    /// Scalar state.
    pub state: TrainingState,
    tensors: HashMap<String, Tensor>,
}

impl LoadedCheckpoint {
    /// Read a checkpoint file onto the CPU.
    pub fn read(path: &Path) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let meta = header
            .metadata()
            .as_ref()
            .ok_or_else(|| FusionError::Checkpoint(format!("{} has no metadata", path.display())))?;
        let state = TrainingState::from_metadata(meta)?;
        let tensors = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu)?;
        Ok(Self { state, tensors })
    }

    /// Copy weights into `model` and state into `optimizer`.
    ///
    /// Every model variable must be present with a matching shape.
    pub fn restore(&self, model: &FusionNet, optimizer: &mut dyn Optimizer) -> Result<()> {
        for (name, var) in model.named_vars()? {
            let key = format!("{MODEL_PREFIX}{name}");
            let tensor = self
                .tensors
                .get(&key)
                .ok_or_else(|| FusionError::Checkpoint(format!("missing tensor '{key}'")))?;
            if tensor.dims() != var.dims() {
                return Err(FusionError::Checkpoint(format!(
                    "tensor '{key}' has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_device(var.device())?)?;
        }

        let optim_state: HashMap<String, Tensor> = self
            .tensors
            .iter()
            .filter_map(|(name, t)| {
                name.strip_prefix(OPTIM_PREFIX)
                    .map(|n| (n.to_string(), t.clone()))
            })
            .collect();
        optimizer.load_state(self.state.optimizer_steps, &optim_state)?;
        optimizer.set_learning_rate(self.state.lr);
        Ok(())
    }
}

/// Latest / best checkpoint slots of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manager writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Run directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the latest checkpoint.
    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_CHECKPOINT)
    }

    /// Path of the best checkpoint.
    #[must_use]
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }

    /// Path of the video-prediction snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(VIDEO_SNAPSHOT)
    }

    /// Persist the epoch's state.
    ///
    /// The latest slot is always rewritten. When `best` carries the epoch's
    /// accumulator, the snapshot is written and the latest checkpoint is
    /// copied to the best slot.
    pub fn save(
        &self,
        state: &TrainingState,
        model: &FusionNet,
        optimizer: &dyn Optimizer,
        best: Option<&VideoAccumulator>,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let latest = self.latest_path();
        write_checkpoint(&latest, state, model, optimizer)?;
        tracing::debug!("Saved checkpoint to {}", latest.display());

        if let Some(accumulator) = best {
            accumulator.write_snapshot(&self.snapshot_path())?;
            std::fs::copy(&latest, self.best_path())?;
            tracing::info!(
                "Saved best model (epoch {}, Prec@1 {:.3}) to {}",
                state.epoch,
                state.best_prec1,
                self.best_path().display()
            );
        }
        Ok(())
    }
}
