//! Training controller.
//!
//! The controller walks `Uninitialized -> Built -> (Resumed) -> {TrainEpoch <-> ValidateEpoch} -> Done`.
//! Every epoch trains once, validates once at video level, advances the
//! plateau scheduler with the validation loss and persists the training state.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};

use crate::aggregate::{VideoAccumulator, VideoMetrics};
use crate::checkpoint::{CheckpointManager, LoadedCheckpoint, TrainingState, BEST_PREC1_SENTINEL};
use crate::config::FusionConfig;
use crate::data::{
    ClipDataset, ClipDecoder, DataLoader, IndexedClipDataset, LoaderOptions, SafetensorsDecoder,
};
use crate::error::{FusionError, Result};
use crate::index::VideoIndex;
use crate::metrics::{
    accuracy, AverageMeter, Criterion, CrossEntropy, MetricsLog, TrainRecord, ValidationRecord,
};
use crate::model::FusionNet;
use crate::optimizer::{build_optimizer, Optimizer};
use crate::scheduler::{PlateauDecision, ReduceLROnPlateau};

/// Name of the training metrics log inside the run directory.
pub const TRAIN_LOG: &str = "training.csv";
/// Name of the validation metrics log inside the run directory.
pub const VALIDATION_LOG: &str = "testing.csv";

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Configuration accepted, nothing constructed.
    Uninitialized,
    /// Model, optimizer and scheduler constructed.
    Built,
    /// State restored from a checkpoint.
    Resumed,
    /// Inside a training pass.
    TrainEpoch,
    /// Inside a validation pass.
    ValidateEpoch,
    /// Loop finished.
    Done,
}

/// Result of one validation pass.
#[derive(Debug, Clone)]
pub struct Validation {
    /// Video-level figures.
    pub metrics: VideoMetrics,
    /// Mean batch time in seconds.
    pub batch_time: f64,
    /// Per-video sums of the pass.
    pub accumulator: VideoAccumulator,
}

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Epochs trained in this invocation.
    pub epochs_run: usize,
    /// Best video top-1 after the run.
    pub best_prec1: f64,
    /// Figures of the last validation pass.
    pub last: Option<VideoMetrics>,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use action_fusion_rs::{FusionConfig, Trainer};
///
/// # fn main() -> action_fusion_rs::Result<()> {
/// let config = FusionConfig::from_file("fusion.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let summary = trainer.run()?;
/// println!("best Prec@1 {:.3}", summary.best_prec1);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: FusionConfig,
    device: Device,
    phase: Phase,
    /// First epoch the loop will run.
    start_epoch: usize,
    /// Last epoch entered.
    epoch: usize,
    best_prec1: f64,
    train_data: Option<Arc<dyn ClipDataset>>,
    val_data: Option<Arc<dyn ClipDataset>>,
    model: Option<FusionNet>,
    optimizer: Option<Box<dyn Optimizer>>,
    scheduler: Option<ReduceLROnPlateau>,
    criterion: CrossEntropy,
    checkpoints: CheckpointManager,
    train_log: MetricsLog,
    val_log: MetricsLog,
}

impl Trainer {
    /// Create a trainer reading clips through the configured index and clip root.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: FusionConfig) -> Result<Self> {
        config.validate()?;

        let device = select_device();
        let run_dir = config.run_dir();
        Ok(Self {
            start_epoch: config.training.start_epoch,
            epoch: config.training.start_epoch,
            device,
            phase: Phase::Uninitialized,
            best_prec1: BEST_PREC1_SENTINEL,
            train_data: None,
            val_data: None,
            model: None,
            optimizer: None,
            scheduler: None,
            criterion: CrossEntropy,
            checkpoints: CheckpointManager::new(&run_dir),
            train_log: MetricsLog::new(run_dir.join(TRAIN_LOG)),
            val_log: MetricsLog::new(run_dir.join(VALIDATION_LOG)),
            config,
        })
    }

    /// Create a trainer over caller-supplied datasets.
    pub fn with_datasets(
        config: FusionConfig,
        train: Arc<dyn ClipDataset>,
        val: Arc<dyn ClipDataset>,
    ) -> Result<Self> {
        let mut trainer = Self::new(config)?;
        trainer.train_data = Some(train);
        trainer.val_data = Some(val);
        Ok(trainer)
    }

    /// Construct model, optimizer and scheduler.
    pub fn build(&mut self) -> Result<()> {
        self.expect_phase(&[Phase::Uninitialized], "build")?;

        if self.train_data.is_none() || self.val_data.is_none() {
            let index = VideoIndex::from_config(&self.config)?;
            let decoder: Arc<dyn ClipDecoder> =
                Arc::new(SafetensorsDecoder::from_config(&self.config)?);
            self.train_data = Some(Arc::new(IndexedClipDataset::new(
                index.train,
                Arc::clone(&decoder),
            )));
            self.val_data = Some(Arc::new(IndexedClipDataset::new(index.val, decoder)));
        }

        let training = &self.config.training;
        let model = FusionNet::new(&self.config.model, &training.trainable, &self.device)?;
        let optimizer = build_optimizer(
            &training.optimizer,
            training.learning_rate,
            training.weight_decay,
            model.trainable_vars().to_vec(),
        );
        tracing::info!(
            "Built fusion model over {:?}: {} parameters, {} trainable tensors in {:?}",
            model.modalities(),
            model.num_parameters()?,
            model.trainable_vars().len(),
            training.trainable
        );

        self.scheduler = Some(ReduceLROnPlateau::new(
            training.scheduler.clone(),
            training.learning_rate,
        ));
        self.model = Some(model);
        self.optimizer = Some(optimizer);
        self.phase = Phase::Built;
        Ok(())
    }

    /// Restore training state from `training.resume` when it names a readable checkpoint.
    ///
    /// Returns whether state was restored. A missing or unreadable file is
    /// logged and training starts from scratch.
    pub fn resume(&mut self) -> Result<bool> {
        self.expect_phase(&[Phase::Built], "resume")?;

        let Some(path) = self.config.training.resume.clone() else {
            return Ok(false);
        };
        let path = std::path::PathBuf::from(path);
        if !path.is_file() {
            tracing::warn!(
                "No checkpoint found at '{}', training from scratch",
                path.display()
            );
            return Ok(false);
        }
        let loaded = match LoadedCheckpoint::read(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(
                    "Cannot read checkpoint '{}' ({e}), training from scratch",
                    path.display()
                );
                return Ok(false);
            }
        };

        let (Some(model), Some(optimizer)) = (self.model.as_ref(), self.optimizer.as_mut()) else {
            return Err(FusionError::Training("model not built".into()));
        };
        loaded.restore(model, optimizer.as_mut())?;

        let state = &loaded.state;
        self.start_epoch = state.epoch + 1;
        self.epoch = state.epoch;
        self.best_prec1 = state.best_prec1;
        self.scheduler = Some(
            state
                .scheduler
                .clone()
                .unwrap_or_else(|| ReduceLROnPlateau::new(self.config.training.scheduler.clone(), state.lr)),
        );
        tracing::info!(
            "Loaded checkpoint '{}' (epoch {}, best Prec@1 {:.3})",
            path.display(),
            state.epoch,
            state.best_prec1
        );
        self.phase = Phase::Resumed;
        Ok(true)
    }

    /// Run the configured loop, building and resuming first when needed.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.phase == Phase::Uninitialized {
            self.build()?;
        }
        if self.phase == Phase::Built {
            self.resume()?;
        }
        self.expect_phase(&[Phase::Built, Phase::Resumed], "run")?;

        if self.config.training.evaluate {
            let validation = self.validate_epoch(self.epoch)?;
            tracing::info!(
                "Evaluation: Prec@1 {:.3} Prec@5 {:.3} Loss {:.4} over {} videos",
                validation.metrics.top1,
                validation.metrics.top5,
                validation.metrics.loss,
                validation.metrics.videos
            );
            self.phase = Phase::Done;
            return Ok(RunSummary {
                epochs_run: 0,
                best_prec1: self.best_prec1,
                last: Some(validation.metrics),
            });
        }

        let epochs = self.config.training.epochs;
        let mut epochs_run = 0;
        let mut last = None;
        for epoch in self.start_epoch..epochs {
            tracing::info!("Starting epoch {}/{}", epoch + 1, epochs);
            let train_record = self.train_epoch(epoch)?;
            let validation = self.validate_epoch(epoch)?;
            self.finish_epoch(epoch, &train_record, &validation)?;
            epochs_run += 1;
            last = Some(validation.metrics);
        }

        self.phase = Phase::Done;
        tracing::info!(
            "Training finished after {} epochs, best Prec@1 {:.3}",
            epochs_run,
            self.best_prec1
        );
        Ok(RunSummary {
            epochs_run,
            best_prec1: self.best_prec1,
            last,
        })
    }

    /// One pass over the training set.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<TrainRecord> {
        self.expect_phase(
            &[Phase::Built, Phase::Resumed, Phase::ValidateEpoch],
            "train",
        )?;
        self.phase = Phase::TrainEpoch;
        self.epoch = epoch;

        let dataset = self
            .train_data
            .clone()
            .ok_or_else(|| FusionError::Training("no training data".into()))?;
        let loader = DataLoader::shuffled(
            dataset,
            LoaderOptions::from_config(&self.config),
            self.config.seed.wrapping_add(epoch as u64),
            self.device.clone(),
        );
        let (Some(model), Some(optimizer)) = (self.model.as_ref(), self.optimizer.as_mut()) else {
            return Err(FusionError::Training("model not built".into()));
        };
        let lr = optimizer.learning_rate();
        let pb = progress_bar(loader.num_batches(), format!("Epoch {epoch} train"))?;

        let (mut batch_time, mut data_time) = (AverageMeter::new(), AverageMeter::new());
        let (mut losses, mut top1, mut top5) =
            (AverageMeter::new(), AverageMeter::new(), AverageMeter::new());

        let mut end = Instant::now();
        for batch in loader {
            let batch = batch?;
            data_time.update(end.elapsed().as_secs_f64(), 1);

            let labels = batch.label_tensor(model.device())?;
            let logits = model.forward_t(&batch.inputs, true)?;
            let loss = self.criterion.loss(&logits, &labels)?;
            optimizer.backward_step(&loss)?;

            let n = batch.len();
            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            let (prec1, prec5) = accuracy(&logits, &batch.labels)?;
            losses.update(loss_value, n);
            top1.update(prec1, n);
            top5.update(prec5, n);

            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            tracing::debug!("epoch {epoch} batch loss {loss_value:.4} prec@1 {prec1:.2}");
            pb.set_message(format!("Prec@1 {:.3} Loss {:.4}", top1.avg(), losses.avg()));
            pb.inc(1);
        }
        pb.finish_and_clear();

        tracing::info!(
            "Epoch {} train: Loss {:.4} Prec@1 {:.3} Prec@5 {:.3} lr {:.3e}",
            epoch,
            losses.avg(),
            top1.avg(),
            top5.avg(),
            lr
        );
        Ok(TrainRecord {
            epoch,
            batch_time: batch_time.avg(),
            data_time: data_time.avg(),
            loss: losses.avg(),
            prec1: top1.avg(),
            prec5: top5.avg(),
            lr,
        })
    }

    /// One pass over the validation set, aggregated per video.
    pub fn validate_epoch(&mut self, epoch: usize) -> Result<Validation> {
        self.expect_phase(
            &[Phase::Built, Phase::Resumed, Phase::TrainEpoch],
            "validate",
        )?;
        self.phase = Phase::ValidateEpoch;

        let dataset = self
            .val_data
            .clone()
            .ok_or_else(|| FusionError::Training("no validation data".into()))?;
        let loader = DataLoader::sequential(
            dataset,
            LoaderOptions::from_config(&self.config),
            self.device.clone(),
        );
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| FusionError::Training("model not built".into()))?;
        let pb = progress_bar(loader.num_batches(), format!("Epoch {epoch} val"))?;

        let mut accumulator = VideoAccumulator::new(model.nb_classes());
        let mut batch_time = AverageMeter::new();
        let mut end = Instant::now();
        for batch in loader {
            let batch = batch?;
            let logits = model.forward_t(&batch.inputs, false)?;
            accumulator.add_batch(&batch.videos, &logits, &batch.labels)?;

            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();
            pb.set_message(format!("{} videos", accumulator.len()));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let metrics = accumulator.finalize(&self.criterion)?;
        tracing::info!(
            "Epoch {} validation: Loss {:.4} Prec@1 {:.3} Prec@5 {:.3} ({} videos)",
            epoch,
            metrics.loss,
            metrics.top1,
            metrics.top5,
            metrics.videos
        );
        Ok(Validation {
            metrics,
            batch_time: batch_time.avg(),
            accumulator,
        })
    }

    fn finish_epoch(
        &mut self,
        epoch: usize,
        train_record: &TrainRecord,
        validation: &Validation,
    ) -> Result<()> {
        let metrics = &validation.metrics;

        let scheduler = self
            .scheduler
            .as_mut()
            .ok_or_else(|| FusionError::Training("scheduler not built".into()))?;
        let decision = scheduler.step(metrics.loss);
        let scheduler_lr = scheduler.lr();
        let is_best = self.update_best(metrics.top1);

        let (Some(model), Some(optimizer)) = (self.model.as_ref(), self.optimizer.as_mut()) else {
            return Err(FusionError::Training("model not built".into()));
        };
        if let PlateauDecision::Reduced { .. } = decision {
            optimizer.set_learning_rate(scheduler_lr);
        }

        let state = TrainingState {
            epoch,
            best_prec1: self.best_prec1,
            lr: optimizer.learning_rate(),
            optimizer_steps: optimizer.step_count(),
            scheduler: self.scheduler.clone(),
            config: Some(serde_yaml::to_string(&self.config)?),
        };
        self.checkpoints.save(
            &state,
            model,
            optimizer.as_ref(),
            is_best.then_some(&validation.accumulator),
        )?;

        self.train_log.append(train_record)?;
        self.val_log.append(&ValidationRecord {
            epoch,
            batch_time: validation.batch_time,
            loss: metrics.loss,
            prec1: metrics.top1,
            prec5: metrics.top5,
        })?;
        Ok(())
    }

    /// Strictly better top-1 replaces the best; ties do not.
    fn update_best(&mut self, top1: f64) -> bool {
        let is_best = top1 > self.best_prec1;
        if is_best {
            self.best_prec1 = top1;
        }
        is_best
    }

    fn expect_phase(&self, allowed: &[Phase], action: &str) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(FusionError::Training(format!(
                "cannot {action} in phase {:?}",
                self.phase
            )))
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Best video top-1 recorded so far.
    #[must_use]
    pub fn best_prec1(&self) -> f64 {
        self.best_prec1
    }

    /// Last epoch entered (or the restored epoch right after resume).
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// First epoch [`Trainer::run`] trains.
    #[must_use]
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Current learning rate.
    #[must_use]
    pub fn lr(&self) -> f64 {
        self.optimizer
            .as_ref()
            .map_or(self.config.training.learning_rate, |o| o.learning_rate())
    }

    /// Scheduler state, once built.
    #[must_use]
    pub fn scheduler(&self) -> Option<&ReduceLROnPlateau> {
        self.scheduler.as_ref()
    }

    /// Built model.
    #[must_use]
    pub fn model(&self) -> Option<&FusionNet> {
        self.model.as_ref()
    }

    /// Checkpoint slots of this run.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Device for training.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Prefer CUDA when compiled in, unless `ACTION_FUSION_FORCE_CPU` is set.
fn select_device() -> Device {
    let force_cpu = std::env::var("ACTION_FUSION_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("ACTION_FUSION_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu || !cfg!(feature = "cuda") {
        tracing::debug!("Training device: CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(cuda_device) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", cuda_device);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

fn progress_bar(len: usize, prefix: String) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_prefix(prefix);
    Ok(pb)
}
