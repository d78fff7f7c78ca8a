//! Multi-stream fusion network.
//!
//! Implements the full inference path:
//! - One residual encoder per configured stream (rgb, pose, flow)
//! - A channel adapter per stream bringing feature maps to a common grid
//! - Channel concatenation in configured stream order
//! - A 1x1 bottleneck, global pooling and the classifier
//!
//! Parameters live in one [`VarMap`] per [`Component`], so the optimizer can be
//! handed exactly the components declared trainable.

pub mod adapter;
pub mod encoder;
pub mod head;

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Module, ModuleT, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{Component, Modality, ModelConfig, StreamConfig};
use crate::error::{FusionError, Result};

pub use adapter::ChannelAdapter;
pub use encoder::{Architecture, ResNet};
pub use head::{Bottleneck, Classifier};

/// Per-modality input tensors of one batch, each `(batch, channels, H, W)`.
pub type StreamInputs = BTreeMap<Modality, Tensor>;

/// Encoder plus adapter for one modality.
#[derive(Debug)]
struct StreamBranch {
    modality: Modality,
    arch: Architecture,
    encoder: ResNet,
    adapter: ChannelAdapter,
    /// Channels after the adapter.
    channels: usize,
    encoder_frozen: bool,
    adapter_frozen: bool,
}

impl StreamBranch {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let features = if self.encoder_frozen {
            self.encoder.forward_t(x, false)?.detach()
        } else {
            self.encoder.forward_t(x, train)?
        };
        let adapted = self.adapter.forward(self.modality, &features)?;
        if self.encoder_frozen && self.adapter_frozen {
            Ok(adapted.detach())
        } else {
            Ok(adapted)
        }
    }
}

/// Fusion model over the configured streams.
pub struct FusionNet {
    streams: Vec<StreamBranch>,
    bottleneck: Bottleneck,
    classifier: Classifier,
    varmaps: BTreeMap<Component, VarMap>,
    trainable: Vec<(String, Var)>,
    input_size: usize,
    nb_classes: usize,
    device: Device,
}

impl FusionNet {
    /// Build the network and collect the trainable parameter list.
    ///
    /// Stream encoders with a `weights` path are initialized from that
    /// safetensors file. Components outside `trainable` are frozen: they are
    /// never handed to the optimizer and frozen encoders always run in
    /// inference mode.
    ///
    /// # Errors
    ///
    /// Fails on an unsupported modality/stack combination, an unknown
    /// architecture, an adapter that cannot accept its encoder's output, or an
    /// unreadable pretrained weight file.
    pub fn new(config: &ModelConfig, trainable: &[Component], device: &Device) -> Result<Self> {
        let mut varmaps: BTreeMap<Component, VarMap> = BTreeMap::new();
        let mut streams = Vec::with_capacity(config.streams.len());

        let feature_size = feature_map_size(config.input_size);
        for stream in &config.streams {
            let branch = Self::build_stream(stream, feature_size, trainable, device, &mut varmaps)?;
            tracing::info!(
                "Built {} stream: {} ({} frames/stack) -> {} channels{}{}",
                branch.modality,
                branch.arch,
                stream.nb_per_stack,
                branch.channels,
                if branch.adapter.has_parameters() { ", learned adapter" } else { "" },
                if branch.encoder_frozen { ", encoder frozen" } else { "" }
            );
            streams.push(branch);
        }

        let fused_channels: usize = streams.iter().map(|s| s.channels).sum();

        let conv_map = VarMap::new();
        let bottleneck = Bottleneck::new(
            fused_channels,
            &config.bottleneck,
            VarBuilder::from_varmap(&conv_map, DType::F32, device),
        )?;
        varmaps.insert(Component::FusionConv, conv_map);

        let classifier_map = VarMap::new();
        let classifier = Classifier::new(
            bottleneck.out_channels(),
            config.hidden,
            config.nb_classes,
            config.dropout,
            VarBuilder::from_varmap(&classifier_map, DType::F32, device),
        )?;
        varmaps.insert(Component::Classifier, classifier_map);

        let trainable = collect_vars(&varmaps, |component| trainable.contains(&component))?;
        let trainable_count: usize = trainable.iter().map(|(_, v)| v.elem_count()).sum();
        tracing::info!(
            "Fusion head: {} -> {:?} -> {} -> {} classes ({} trainable tensors, {} parameters)",
            fused_channels,
            config.bottleneck,
            config.hidden,
            config.nb_classes,
            trainable.len(),
            trainable_count
        );

        Ok(Self {
            streams,
            bottleneck,
            classifier,
            varmaps,
            trainable,
            input_size: config.input_size,
            nb_classes: config.nb_classes,
            device: device.clone(),
        })
    }

    fn build_stream(
        stream: &StreamConfig,
        feature_size: usize,
        trainable: &[Component],
        device: &Device,
        varmaps: &mut BTreeMap<Component, VarMap>,
    ) -> Result<StreamBranch> {
        let modality = stream.modality;
        let in_channels = modality.input_channels(stream.nb_per_stack)?;
        let arch = stream.architecture()?;

        let mut encoder_map = VarMap::new();
        let encoder = arch.build(
            in_channels,
            stream.base_width,
            VarBuilder::from_varmap(&encoder_map, DType::F32, device),
        )?;
        if let Some(path) = &stream.weights {
            load_pretrained(&mut encoder_map, Path::new(path), modality)?;
        }

        let adapter_map = VarMap::new();
        let adapter = ChannelAdapter::new(
            &stream.adapter,
            encoder.out_channels(),
            VarBuilder::from_varmap(&adapter_map, DType::F32, device),
        )?;

        let encoder_shape = (encoder.out_channels(), feature_size, feature_size);
        let Some((channels, _, _)) = adapter.output_shape(encoder_shape) else {
            return Err(FusionError::stream_shape(
                modality.name(),
                format!("an adapter accepting {encoder_shape:?}"),
                format!("{:?}", stream.adapter),
            ));
        };

        let encoder_component = Component::encoder(modality);
        let adapter_component = Component::adapter(modality);
        varmaps.insert(encoder_component, encoder_map);
        varmaps.insert(adapter_component, adapter_map);

        Ok(StreamBranch {
            modality,
            arch,
            encoder,
            adapter,
            channels,
            encoder_frozen: !trainable.contains(&encoder_component),
            adapter_frozen: !trainable.contains(&adapter_component),
        })
    }

    /// Per-clip logits `(batch, nb_classes)`.
    ///
    /// Adapted stream outputs are concatenated along channels in configured
    /// order. Every stream must land on the grid of the first stream with the
    /// channel count fixed at build time.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::StreamShape`] naming the offending stream when
    /// an input or adapted output does not have the expected shape, and
    /// [`FusionError::Dataset`] when a configured stream has no input.
    pub fn forward_t(&self, inputs: &StreamInputs, train: bool) -> Result<Tensor> {
        let mut adapted = Vec::with_capacity(self.streams.len());
        let mut grid: Option<(usize, usize)> = None;

        for stream in &self.streams {
            let x = inputs.get(&stream.modality).ok_or_else(|| {
                FusionError::Dataset(format!("batch has no '{}' input", stream.modality))
            })?;
            let expected_in = (stream.encoder.in_channels(), self.input_size, self.input_size);
            let (_, c, h, w) = x.dims4()?;
            if (c, h, w) != expected_in {
                return Err(FusionError::stream_shape(
                    stream.modality.name(),
                    format!("input {:?}", [expected_in.0, expected_in.1, expected_in.2]),
                    format!("input {:?}", [c, h, w]),
                ));
            }

            let out = stream.forward_t(x, train)?;
            let (_, c, h, w) = out.dims4()?;
            let (gh, gw) = *grid.get_or_insert((h, w));
            if (c, h, w) != (stream.channels, gh, gw) {
                return Err(FusionError::stream_shape(
                    stream.modality.name(),
                    format!("{:?}", [stream.channels, gh, gw]),
                    format!("{:?}", [c, h, w]),
                ));
            }
            adapted.push(out);
        }

        let fused = Tensor::cat(&adapted, 1)?;
        let pooled = self.bottleneck.forward(&fused)?;
        Ok(self.classifier.forward_t(&pooled, train)?)
    }

    /// Parameters handed to the optimizer, named `<component>.<param>`.
    #[must_use]
    pub fn trainable_vars(&self) -> &[(String, Var)] {
        &self.trainable
    }

    /// Every variable of the model (including batch-norm statistics), named
    /// `<component>.<param>` and sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        collect_vars(&self.varmaps, |_| true)
    }

    /// Total element count over all variables.
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .named_vars()?
            .iter()
            .map(|(_, v)| v.elem_count())
            .sum())
    }

    /// Configured modalities in concatenation order.
    #[must_use]
    pub fn modalities(&self) -> Vec<Modality> {
        self.streams.iter().map(|s| s.modality).collect()
    }

    /// Number of output classes.
    #[must_use]
    pub fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Spatial size of a ResNet feature map for a square input.
#[must_use]
pub fn feature_map_size(input: usize) -> usize {
    let halve = |n: usize| n.saturating_sub(1) / 2 + 1;
    // stem conv, max pool, then layers 2..4
    (0..5).fold(input, |n, _| halve(n))
}

fn load_pretrained(varmap: &mut VarMap, path: &Path, modality: Modality) -> Result<()> {
    if !path.exists() {
        return Err(FusionError::Config(format!(
            "pretrained weights for {} stream not found: {}",
            modality,
            path.display()
        )));
    }
    varmap.load(path)?;
    tracing::info!("Loaded pretrained {} encoder from {}", modality, path.display());
    Ok(())
}

fn collect_vars(
    varmaps: &BTreeMap<Component, VarMap>,
    include: impl Fn(Component) -> bool,
) -> Result<Vec<(String, Var)>> {
    let mut vars = Vec::new();
    for (component, varmap) in varmaps {
        if !include(*component) {
            continue;
        }
        let data = varmap
            .data()
            .lock()
            .map_err(|e| FusionError::Training(format!("parameter store poisoned: {e}")))?;
        for (name, var) in data.iter() {
            vars.push((format!("{}.{}", component.name(), name), var.clone()));
        }
    }
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, FusionConfig};

    fn tiny_inputs(config: &ModelConfig, batch: usize) -> StreamInputs {
        let size = config.input_size;
        config
            .streams
            .iter()
            .map(|s| {
                let c = s.modality.input_channels(s.nb_per_stack).unwrap();
                let x = Tensor::randn(0f32, 1.0, (batch, c, size, size), &Device::Cpu).unwrap();
                (s.modality, x)
            })
            .collect()
    }

    #[test]
    fn test_feature_map_size() {
        assert_eq!(feature_map_size(224), 7);
        assert_eq!(feature_map_size(64), 2);
        assert_eq!(feature_map_size(112), 4);
    }

    #[test]
    fn test_forward_produces_logits() {
        let config = FusionConfig::tiny_preset();
        let net = FusionNet::new(&config.model, &config.training.trainable, &Device::Cpu).unwrap();
        let inputs = tiny_inputs(&config.model, 2);

        let logits = net.forward_t(&inputs, true).unwrap();
        assert_eq!(logits.dims(), &[2, config.model.nb_classes]);
        let logits = net.forward_t(&inputs, false).unwrap();
        assert_eq!(logits.dims(), &[2, config.model.nb_classes]);
        assert_eq!(net.modalities(), vec![Modality::Rgb, Modality::Pose, Modality::Flow]);
    }

    #[test]
    fn test_trainable_subset_excludes_frozen_encoders() {
        let config = FusionConfig::tiny_preset();
        let net = FusionNet::new(&config.model, &config.training.trainable, &Device::Cpu).unwrap();

        let names: Vec<&str> = net.trainable_vars().iter().map(|(n, _)| n.as_str()).collect();
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| !n.contains("_encoder.")));
        assert!(names.iter().any(|n| n.starts_with("flow_adapter.")));
        assert!(names.iter().any(|n| n.starts_with("fusion_conv.")));
        assert!(names.iter().any(|n| n.starts_with("classifier.")));

        let all = net.named_vars().unwrap();
        assert!(all.iter().any(|(n, _)| n == "rgb_encoder.conv1.weight"));
        assert!(all.len() > net.trainable_vars().len());
    }

    #[test]
    fn test_spatial_mismatch_names_stream() {
        let mut config = FusionConfig::tiny_preset();
        // pose lands on 1x1 while rgb stays on 2x2
        config.model.streams[1].adapter = AdapterConfig::AvgPool {
            kernel: 2,
            padding: 0,
        };
        let net = FusionNet::new(&config.model, &config.training.trainable, &Device::Cpu).unwrap();
        let inputs = tiny_inputs(&config.model, 1);

        let err = net.forward_t(&inputs, false).unwrap_err();
        assert!(matches!(err, FusionError::StreamShape { ref stream, .. } if stream == "pose"));
    }

    #[test]
    fn test_unacceptable_adapter_fails_at_build() {
        let mut config = FusionConfig::tiny_preset();
        config.model.streams[2].adapter = AdapterConfig::Reshape {
            channels: 7,
            height: 3,
            width: 3,
        };
        let err = FusionNet::new(&config.model, &[], &Device::Cpu).err().unwrap();
        assert!(matches!(err, FusionError::StreamShape { ref stream, .. } if stream == "flow"));
    }

    #[test]
    fn test_missing_stream_input() {
        let config = FusionConfig::tiny_preset();
        let net = FusionNet::new(&config.model, &[], &Device::Cpu).unwrap();
        let mut inputs = tiny_inputs(&config.model, 1);
        inputs.remove(&Modality::Flow);
        assert!(matches!(
            net.forward_t(&inputs, false),
            Err(FusionError::Dataset(_))
        ));
    }

    #[test]
    fn test_wrong_input_channels() {
        let config = FusionConfig::tiny_preset();
        let net = FusionNet::new(&config.model, &[], &Device::Cpu).unwrap();
        let mut inputs = tiny_inputs(&config.model, 1);
        inputs.insert(
            Modality::Flow,
            Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = net.forward_t(&inputs, false).unwrap_err();
        assert!(matches!(err, FusionError::StreamShape { ref stream, .. } if stream == "flow"));
    }

    #[test]
    fn test_rgb_stack_rejected_at_build() {
        let mut config = FusionConfig::tiny_preset();
        config.model.streams[0].nb_per_stack = 4;
        assert!(matches!(
            FusionNet::new(&config.model, &[], &Device::Cpu),
            Err(FusionError::Config(_))
        ));
    }

    #[test]
    fn test_missing_pretrained_weights() {
        let mut config = FusionConfig::tiny_preset();
        config.model.streams[0].weights = Some("/nonexistent/rgb.safetensors".into());
        assert!(matches!(
            FusionNet::new(&config.model, &[], &Device::Cpu),
            Err(FusionError::Config(_))
        ));
    }

    #[test]
    fn test_pretrained_weights_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.safetensors");

        let config = FusionConfig::tiny_preset();
        let donor = FusionNet::new(&config.model, &[], &Device::Cpu).unwrap();
        let donor_vars: std::collections::HashMap<String, Tensor> = donor
            .named_vars()
            .unwrap()
            .into_iter()
            .filter_map(|(name, var)| {
                name.strip_prefix("rgb_encoder.")
                    .map(|n| (n.to_string(), var.as_tensor().clone()))
            })
            .collect();
        candle_core::safetensors::save(&donor_vars, &path).unwrap();

        let mut config = config;
        config.model.streams[0].weights = Some(path.to_string_lossy().into_owned());
        let net = FusionNet::new(&config.model, &[], &Device::Cpu).unwrap();
        let loaded = net
            .named_vars()
            .unwrap()
            .into_iter()
            .find(|(n, _)| n == "rgb_encoder.conv1.weight")
            .unwrap()
            .1;
        let expected = &donor_vars["conv1.weight"];
        let diff = (loaded.as_tensor() - expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
