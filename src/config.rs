//! Configuration parsing and validation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::model::encoder::Architecture;

/// Main configuration for a fusion training run.
///
/// # Example
///
/// ```rust
/// use action_fusion_rs::FusionConfig;
///
/// # fn main() -> action_fusion_rs::Result<()> {
/// let config = FusionConfig::from_preset("sub-jhmdb")?;
/// config.validate()?;
/// assert_eq!(config.model.nb_classes, 12);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Model layout.
    pub model: ModelConfig,

    /// Training hyperparameters and run control.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Data supply settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Root directory for checkpoints, snapshots and metric logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Inputs were cropped to the actor bounding box (tags the run folder).
    #[serde(default)]
    pub use_bbox: bool,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./record".into()
}

fn default_seed() -> u64 {
    42
}

/// Input modality of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Appearance frames (RGB).
    Rgb,
    /// Stacked joint-position heatmaps.
    Pose,
    /// Stacked optical flow, x and y planes interleaved.
    Flow,
}

impl Modality {
    /// Stream name, also the tensor key in clip files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Modality::Rgb => "rgb",
            Modality::Pose => "pose",
            Modality::Flow => "flow",
        }
    }

    /// Number of input channels for a stack of `nb_per_stack` frames.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported modality/stack combination.
    pub fn input_channels(self, nb_per_stack: usize) -> Result<usize> {
        if nb_per_stack == 0 {
            return Err(FusionError::Config(format!(
                "{} stream: nb_per_stack must be > 0",
                self.name()
            )));
        }
        match self {
            Modality::Rgb if nb_per_stack != 1 => Err(FusionError::Config(format!(
                "rgb stream only supports nb_per_stack = 1, got {nb_per_stack}"
            ))),
            Modality::Rgb => Ok(3),
            Modality::Pose => Ok(nb_per_stack),
            Modality::Flow => Ok(2 * nb_per_stack),
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Model layout: streams in concatenation order plus the fusion head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of action classes.
    pub nb_classes: usize,

    /// Spatial size (height = width) of every stream input.
    #[serde(default = "default_input_size")]
    pub input_size: usize,

    /// Streams, in the channel order used for concatenation.
    pub streams: Vec<StreamConfig>,

    /// Output channels of each 1x1 bottleneck convolution.
    #[serde(default = "default_bottleneck")]
    pub bottleneck: Vec<usize>,

    /// Hidden width of the classifier.
    #[serde(default = "default_hidden")]
    pub hidden: usize,

    /// Dropout probability used before and after the hidden stage.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_input_size() -> usize {
    224
}
fn default_bottleneck() -> Vec<usize> {
    vec![768, 384, 192]
}
fn default_hidden() -> usize {
    1024
}
fn default_dropout() -> f32 {
    0.5
}

impl ModelConfig {
    /// Frames needed per clip, the longest stack over all streams.
    #[must_use]
    pub fn clip_length(&self) -> usize {
        self.streams
            .iter()
            .map(|s| s.nb_per_stack)
            .max()
            .unwrap_or(1)
    }

    /// Configured modalities, in concatenation order.
    #[must_use]
    pub fn modalities(&self) -> Vec<Modality> {
        self.streams.iter().map(|s| s.modality).collect()
    }
}

/// One modality stream: encoder architecture plus its channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Input modality.
    pub modality: Modality,

    /// Encoder architecture tag (`resnet18`, `resnet34`, `resnet50`).
    pub arch: String,

    /// Frames stacked per input.
    #[serde(default = "default_nb_per_stack")]
    pub nb_per_stack: usize,

    /// Width of the first residual stage.
    #[serde(default = "default_base_width")]
    pub base_width: usize,

    /// Pretrained encoder weights (safetensors).
    #[serde(default)]
    pub weights: Option<String>,

    /// Adapter bringing the feature map to the common spatial size.
    #[serde(default)]
    pub adapter: AdapterConfig,
}

fn default_nb_per_stack() -> usize {
    1
}
fn default_base_width() -> usize {
    64
}

impl StreamConfig {
    /// Resolve the architecture tag.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::UnknownArchitecture`] for tags outside the registry.
    pub fn architecture(&self) -> Result<Architecture> {
        Architecture::from_str(&self.arch)
    }
}

/// Per-stream channel adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// Pass the feature map through.
    #[default]
    Identity,
    /// Average pooling (zero padding counts toward the average).
    AvgPool {
        /// Kernel size, also used as stride.
        kernel: usize,
        /// Zero padding on each spatial border.
        #[serde(default)]
        padding: usize,
    },
    /// 1x1 projections without bias, then average pooling.
    Project {
        /// Output channels of each projection.
        channels: Vec<usize>,
        /// Pooling kernel (1 disables pooling).
        #[serde(default = "default_pool_kernel")]
        pool_kernel: usize,
        /// Pooling padding.
        #[serde(default)]
        pool_padding: usize,
    },
    /// View the encoder output as `(channels, height, width)`.
    Reshape {
        /// Target channels.
        channels: usize,
        /// Target height.
        height: usize,
        /// Target width.
        width: usize,
    },
}

fn default_pool_kernel() -> usize {
    1
}

/// A parameter-owning part of the fusion model.
///
/// The optimizer only receives the components listed in
/// [`TrainingConfig::trainable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Appearance encoder.
    RgbEncoder,
    /// Pose encoder.
    PoseEncoder,
    /// Flow encoder.
    FlowEncoder,
    /// Appearance adapter.
    RgbAdapter,
    /// Pose adapter.
    PoseAdapter,
    /// Flow adapter.
    FlowAdapter,
    /// Bottleneck convolutions of the fusion head.
    FusionConv,
    /// Classifier of the fusion head.
    Classifier,
}

impl Component {
    /// Encoder component of a modality.
    #[must_use]
    pub fn encoder(modality: Modality) -> Self {
        match modality {
            Modality::Rgb => Component::RgbEncoder,
            Modality::Pose => Component::PoseEncoder,
            Modality::Flow => Component::FlowEncoder,
        }
    }

    /// Adapter component of a modality.
    #[must_use]
    pub fn adapter(modality: Modality) -> Self {
        match modality {
            Modality::Rgb => Component::RgbAdapter,
            Modality::Pose => Component::PoseAdapter,
            Modality::Flow => Component::FlowAdapter,
        }
    }

    /// Modality the component belongs to, `None` for the fusion head.
    #[must_use]
    pub fn modality(self) -> Option<Modality> {
        match self {
            Component::RgbEncoder | Component::RgbAdapter => Some(Modality::Rgb),
            Component::PoseEncoder | Component::PoseAdapter => Some(Modality::Pose),
            Component::FlowEncoder | Component::FlowAdapter => Some(Modality::Flow),
            Component::FusionConv | Component::Classifier => None,
        }
    }

    /// Prefix of the component's parameters in checkpoints.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Component::RgbEncoder => "rgb_encoder",
            Component::PoseEncoder => "pose_encoder",
            Component::FlowEncoder => "flow_encoder",
            Component::RgbAdapter => "rgb_adapter",
            Component::PoseAdapter => "pose_adapter",
            Component::FlowAdapter => "flow_adapter",
            Component::FusionConv => "fusion_conv",
            Component::Classifier => "classifier",
        }
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Stochastic gradient descent with momentum.
    Sgd {
        /// Momentum factor.
        #[serde(default = "default_momentum")]
        momentum: f64,
    },
    /// Adam.
    Adam {
        /// First moment decay.
        #[serde(default = "default_beta1")]
        beta1: f64,
        /// Second moment decay.
        #[serde(default = "default_beta2")]
        beta2: f64,
        /// Numerical stability term.
        #[serde(default = "default_eps")]
        eps: f64,
    },
}

fn default_momentum() -> f64 {
    0.9
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Sgd {
            momentum: default_momentum(),
        }
    }
}

/// Reduce-on-plateau scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    /// Consecutive non-improving epochs tolerated before reducing.
    #[serde(default = "default_patience")]
    pub patience: usize,

    /// Multiplicative reduction factor.
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Relative improvement threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Lower bound on the learning rate.
    #[serde(default)]
    pub min_lr: f64,
}

fn default_patience() -> usize {
    2
}
fn default_factor() -> f64 {
    0.1
}
fn default_threshold() -> f64 {
    1e-4
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            factor: default_factor(),
            threshold: default_threshold(),
            min_lr: 0.0,
        }
    }
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use action_fusion_rs::TrainingConfig;
///
/// let training = TrainingConfig {
///     epochs: 20,
///     batch_size: 8,
///     ..Default::default()
/// };
/// assert_eq!(training.learning_rate, 1e-3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Total number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Mini-batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Initial learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Optimizer.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// L2 weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Components handed to the optimizer; everything else is frozen.
    #[serde(default = "default_trainable")]
    pub trainable: Vec<Component>,

    /// Learning-rate plateau scheduler.
    #[serde(default)]
    pub scheduler: PlateauConfig,

    /// Checkpoint to resume from.
    #[serde(default)]
    pub resume: Option<String>,

    /// First epoch index when not resuming.
    #[serde(default)]
    pub start_epoch: usize,

    /// Run a single validation pass and stop.
    #[serde(default)]
    pub evaluate: bool,
}

fn default_epochs() -> usize {
    500
}
fn default_batch_size() -> usize {
    16
}
fn default_lr() -> f64 {
    1e-3
}
fn default_trainable() -> Vec<Component> {
    vec![
        Component::FlowAdapter,
        Component::FusionConv,
        Component::Classifier,
    ]
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            optimizer: OptimizerKind::default(),
            weight_decay: 0.0,
            trainable: default_trainable(),
            scheduler: PlateauConfig::default(),
            resume: None,
            start_epoch: 0,
            evaluate: false,
        }
    }
}

/// Data supply settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSON map of training video -> 1-based label.
    #[serde(default)]
    pub train_labels: String,

    /// JSON map of test video -> 1-based label.
    #[serde(default)]
    pub test_labels: String,

    /// JSON map of video -> number of frames.
    #[serde(default)]
    pub frame_count: String,

    /// Directory holding `<video>/<start:05>.safetensors` clip files.
    #[serde(default)]
    pub clip_root: String,

    /// Background decode workers (0 decodes on the training thread).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batches prefetched per worker.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
}

fn default_num_workers() -> usize {
    8
}
fn default_prefetch_factor() -> usize {
    2
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_labels: String::new(),
            test_labels: String::new(),
            frame_count: String::new(),
            clip_root: String::new(),
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
        }
    }
}

impl FusionConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"sub-jhmdb"` - three-stream fusion over Sub-JHMDB (12 classes)
    /// - `"tiny"` - narrow three-stream model on 64x64 inputs for smoke tests
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "sub-jhmdb" => Ok(Self::sub_jhmdb_preset()),
            "tiny" => Ok(Self::tiny_preset()),
            _ => Err(FusionError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Three-stream fusion of resnet34 appearance, resnet18 pose and resnet50 flow.
    #[must_use]
    pub fn sub_jhmdb_preset() -> Self {
        Self {
            model: ModelConfig {
                nb_classes: 12,
                input_size: 224,
                streams: vec![
                    StreamConfig {
                        modality: Modality::Rgb,
                        arch: "resnet34".into(),
                        nb_per_stack: 1,
                        base_width: 64,
                        weights: Some("./pretrained/rgb_resnet34.safetensors".into()),
                        adapter: AdapterConfig::AvgPool {
                            kernel: 2,
                            padding: 1,
                        },
                    },
                    StreamConfig {
                        modality: Modality::Pose,
                        arch: "resnet18".into(),
                        nb_per_stack: 15,
                        base_width: 64,
                        weights: Some("./pretrained/pose_resnet18.safetensors".into()),
                        adapter: AdapterConfig::AvgPool {
                            kernel: 2,
                            padding: 1,
                        },
                    },
                    StreamConfig {
                        modality: Modality::Flow,
                        arch: "resnet50".into(),
                        nb_per_stack: 10,
                        base_width: 64,
                        weights: Some("./pretrained/flow_resnet50.safetensors".into()),
                        adapter: AdapterConfig::Project {
                            channels: vec![1024, 512],
                            pool_kernel: 2,
                            pool_padding: 1,
                        },
                    },
                ],
                bottleneck: default_bottleneck(),
                hidden: default_hidden(),
                dropout: default_dropout(),
            },
            training: TrainingConfig::default(),
            data: DataConfig {
                train_labels: "./dict/train_video.json".into(),
                test_labels: "./dict/test_video.json".into(),
                frame_count: "./dict/frame_count.json".into(),
                clip_root: "./clips".into(),
                ..Default::default()
            },
            output_dir: default_output_dir(),
            use_bbox: false,
            seed: default_seed(),
        }
    }

    /// Narrow model on 64x64 inputs; every stream ends at `(32, 2, 2)`.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelConfig {
                nb_classes: 4,
                input_size: 64,
                streams: vec![
                    StreamConfig {
                        modality: Modality::Rgb,
                        arch: "resnet18".into(),
                        nb_per_stack: 1,
                        base_width: 4,
                        weights: None,
                        adapter: AdapterConfig::AvgPool {
                            kernel: 2,
                            padding: 1,
                        },
                    },
                    StreamConfig {
                        modality: Modality::Pose,
                        arch: "resnet18".into(),
                        nb_per_stack: 2,
                        base_width: 4,
                        weights: None,
                        adapter: AdapterConfig::Reshape {
                            channels: 32,
                            height: 2,
                            width: 2,
                        },
                    },
                    StreamConfig {
                        modality: Modality::Flow,
                        arch: "resnet50".into(),
                        nb_per_stack: 2,
                        base_width: 4,
                        weights: None,
                        adapter: AdapterConfig::Project {
                            channels: vec![32],
                            pool_kernel: 2,
                            pool_padding: 1,
                        },
                    },
                ],
                bottleneck: vec![48, 24],
                hidden: 32,
                dropout: 0.5,
            },
            training: TrainingConfig {
                epochs: 2,
                batch_size: 4,
                learning_rate: 1e-2,
                ..Default::default()
            },
            data: DataConfig {
                num_workers: 0,
                ..Default::default()
            },
            output_dir: default_output_dir(),
            use_bbox: false,
            seed: default_seed(),
        }
    }

    /// Folder for this run's artifacts, e.g. `record/fusion_rgb+pose+flow_L15_Bbox`.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        let streams: Vec<&str> = self.model.streams.iter().map(|s| s.modality.name()).collect();
        let mut name = format!("fusion_{}_L{}", streams.join("+"), self.model.clip_length());
        if self.use_bbox {
            name.push_str("_Bbox");
        }
        Path::new(&self.output_dir).join(name)
    }

    /// Validate the configuration.
    ///
    /// Checks the model layout (stream/stack combinations, architecture tags,
    /// adapter parameters, bottleneck schedule), the run surface (epochs,
    /// batch size, learning rate) and the trainable component list.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Config`] or [`FusionError::UnknownArchitecture`]
    /// describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.validate_model()?;
        self.validate_training()?;
        Ok(())
    }

    fn validate_model(&self) -> Result<()> {
        let model = &self.model;
        if model.nb_classes == 0 {
            return Err(FusionError::Config("model.nb_classes must be > 0".into()));
        }
        if model.input_size < 32 {
            return Err(FusionError::Config(
                "model.input_size must be at least 32".into(),
            ));
        }
        if model.streams.is_empty() {
            return Err(FusionError::Config(
                "model.streams must name at least one stream".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for stream in &model.streams {
            if !seen.insert(stream.modality) {
                return Err(FusionError::Config(format!(
                    "stream '{}' is configured twice",
                    stream.modality
                )));
            }
            stream.architecture()?;
            stream.modality.input_channels(stream.nb_per_stack)?;
            if stream.base_width == 0 {
                return Err(FusionError::Config(format!(
                    "{} stream: base_width must be > 0",
                    stream.modality
                )));
            }
            validate_adapter(stream.modality, &stream.adapter)?;
        }

        if model.bottleneck.is_empty() {
            return Err(FusionError::Config(
                "model.bottleneck must have at least one stage".into(),
            ));
        }
        if model.bottleneck.contains(&0) {
            return Err(FusionError::Config(
                "model.bottleneck stages must be > 0".into(),
            ));
        }
        if model.bottleneck.windows(2).any(|w| w[1] >= w[0]) {
            return Err(FusionError::Config(format!(
                "model.bottleneck must be strictly decreasing, got {:?}",
                model.bottleneck
            )));
        }
        if model.hidden == 0 {
            return Err(FusionError::Config("model.hidden must be > 0".into()));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(FusionError::Config(format!(
                "model.dropout must be in [0, 1), got {}",
                model.dropout
            )));
        }
        Ok(())
    }

    fn validate_training(&self) -> Result<()> {
        let training = &self.training;
        if training.epochs == 0 {
            return Err(FusionError::Config("training.epochs must be > 0".into()));
        }
        if training.batch_size == 0 {
            return Err(FusionError::Config(
                "training.batch_size must be > 0".into(),
            ));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(FusionError::Config(
                "training.learning_rate must be > 0".into(),
            ));
        }
        if let OptimizerKind::Sgd { momentum } = training.optimizer {
            if !(0.0..1.0).contains(&momentum) {
                return Err(FusionError::Config(format!(
                    "sgd momentum must be in [0, 1), got {momentum}"
                )));
            }
        }
        let scheduler = &training.scheduler;
        if !(scheduler.factor > 0.0 && scheduler.factor < 1.0) {
            return Err(FusionError::Config(format!(
                "training.scheduler.factor must be in (0, 1), got {}",
                scheduler.factor
            )));
        }
        if scheduler.patience == 0 {
            return Err(FusionError::Config(
                "training.scheduler.patience must be > 0".into(),
            ));
        }

        let modalities = self.model.modalities();
        for component in &training.trainable {
            if let Some(modality) = component.modality() {
                if !modalities.contains(&modality) {
                    return Err(FusionError::Config(format!(
                        "trainable component '{}' refers to unconfigured stream '{}'",
                        component.name(),
                        modality
                    )));
                }
            }
        }
        if training.trainable.is_empty() && !training.evaluate {
            return Err(FusionError::Config(
                "training.trainable is empty; nothing would be optimized".into(),
            ));
        }
        Ok(())
    }
}

fn validate_adapter(modality: Modality, adapter: &AdapterConfig) -> Result<()> {
    match adapter {
        AdapterConfig::Identity => Ok(()),
        AdapterConfig::AvgPool { kernel, padding } => validate_pool(modality, *kernel, *padding),
        AdapterConfig::Project {
            channels,
            pool_kernel,
            pool_padding,
        } => {
            if channels.is_empty() || channels.contains(&0) {
                return Err(FusionError::Config(format!(
                    "{modality} adapter: projection channels must be non-empty and > 0"
                )));
            }
            validate_pool(modality, *pool_kernel, *pool_padding)
        }
        AdapterConfig::Reshape {
            channels,
            height,
            width,
        } => {
            if *channels == 0 || *height == 0 || *width == 0 {
                return Err(FusionError::Config(format!(
                    "{modality} adapter: reshape dimensions must be > 0"
                )));
            }
            Ok(())
        }
    }
}

fn validate_pool(modality: Modality, kernel: usize, padding: usize) -> Result<()> {
    if kernel == 0 {
        return Err(FusionError::Config(format!(
            "{modality} adapter: pooling kernel must be > 0"
        )));
    }
    if padding * 2 > kernel {
        return Err(FusionError::Config(format!(
            "{modality} adapter: padding {padding} exceeds half the kernel {kernel}"
        )));
    }
    Ok(())
}
