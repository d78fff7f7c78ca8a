//! # action-fusion-rs
//!
//! Multi-stream video action classification with late fusion.
//!
//! Appearance (rgb), pose heatmap and optical flow stacks each pass through a
//! residual encoder, are brought to a common feature grid by a channel
//! adapter, concatenated and classified by a small fusion head. Clip
//! predictions are summed per video to score whole videos.
//!
//! ## Features
//!
//! - **YAML Configuration** - streams, adapters, trainable components and schedule in one file
//! - **Frozen encoders** - only the declared components reach the optimizer
//! - **Video-level validation** - deterministic per-video aggregation with top-1 / top-5
//! - **Resumable training** - latest / best checkpoints with optimizer and scheduler state
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! action-fusion init fusion.yaml --preset sub-jhmdb
//!
//! # Validate configuration
//! action-fusion validate fusion.yaml
//!
//! # Train, then evaluate the best checkpoint
//! action-fusion train fusion.yaml
//! action-fusion evaluate fusion.yaml --resume record/fusion_rgb+pose+flow_L15/model_best.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use action_fusion_rs::{FusionConfig, Trainer};
//!
//! # fn main() -> action_fusion_rs::Result<()> {
//! let mut config = FusionConfig::from_preset("sub-jhmdb")?;
//! config.training.epochs = 50;
//!
//! let mut trainer = Trainer::new(config)?;
//! trainer.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Scoring Videos
//!
//! ```rust
//! use action_fusion_rs::metrics::CrossEntropy;
//! use action_fusion_rs::VideoAccumulator;
//!
//! # fn main() -> action_fusion_rs::Result<()> {
//! let mut acc = VideoAccumulator::new(3);
//! acc.add("A", &[1.0, 0.0, 0.0], 1)?;
//! acc.add("A", &[0.0, 5.0, 0.0], 1)?;
//! acc.add("A", &[0.0, 0.0, 2.0], 1)?;
//!
//! let metrics = acc.finalize(&CrossEntropy)?;
//! assert_eq!(metrics.top1, 100.0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use aggregate::{VideoAccumulator, VideoMetrics};
pub use checkpoint::CheckpointManager;
pub use config::{FusionConfig, TrainingConfig};
pub use error::{FusionError, Result};
pub use model::FusionNet;
pub use scheduler::ReduceLROnPlateau;
pub use trainer::Trainer;
