//! Stream encoders.
//!
//! Every stream is a residual backbone mapping a `(batch, channels, H, W)`
//! stack to a `(batch, C, H/32, W/32)` feature map. Parameter names follow the
//! usual ResNet layout (`conv1`, `bn1`, `layer1.0.conv1`, `layer1.0.downsample.0`)
//! so externally trained weights load without renaming.

use std::fmt;
use std::str::FromStr;

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

use crate::error::FusionError;

const BN_EPS: f64 = 1e-5;

/// Supported encoder architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Basic blocks, `[2, 2, 2, 2]`.
    ResNet18,
    /// Basic blocks, `[3, 4, 6, 3]`.
    ResNet34,
    /// Bottleneck blocks, `[3, 4, 6, 3]`, expansion 4.
    ResNet50,
}

/// Encoder constructor: `(in_channels, base_width, vb)`.
pub type EncoderCtor = fn(usize, usize, VarBuilder) -> Result<ResNet>;

impl Architecture {
    /// Every registered architecture.
    pub const ALL: [Architecture; 3] = [
        Architecture::ResNet18,
        Architecture::ResNet34,
        Architecture::ResNet50,
    ];

    /// Registry tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Architecture::ResNet18 => "resnet18",
            Architecture::ResNet34 => "resnet34",
            Architecture::ResNet50 => "resnet50",
        }
    }

    /// Constructor registered for this architecture.
    #[must_use]
    pub fn constructor(self) -> EncoderCtor {
        match self {
            Architecture::ResNet18 => resnet18,
            Architecture::ResNet34 => resnet34,
            Architecture::ResNet50 => resnet50,
        }
    }

    /// Channels of the final feature map for a given base width.
    #[must_use]
    pub fn out_channels(self, base_width: usize) -> usize {
        base_width * 8 * self.block().expansion()
    }

    fn block(self) -> BlockKind {
        match self {
            Architecture::ResNet18 | Architecture::ResNet34 => BlockKind::Basic,
            Architecture::ResNet50 => BlockKind::Bottleneck,
        }
    }

    /// Build the backbone.
    pub fn build(self, in_channels: usize, base_width: usize, vb: VarBuilder) -> Result<ResNet> {
        (self.constructor())(in_channels, base_width, vb)
    }
}

impl FromStr for Architecture {
    type Err = FusionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Architecture::ALL
            .into_iter()
            .find(|arch| arch.tag() == s.to_ascii_lowercase())
            .ok_or_else(|| FusionError::UnknownArchitecture(s.to_string()))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn resnet18(in_channels: usize, base_width: usize, vb: VarBuilder) -> Result<ResNet> {
    ResNet::new(in_channels, base_width, BlockKind::Basic, [2, 2, 2, 2], vb)
}

fn resnet34(in_channels: usize, base_width: usize, vb: VarBuilder) -> Result<ResNet> {
    ResNet::new(in_channels, base_width, BlockKind::Basic, [3, 4, 6, 3], vb)
}

fn resnet50(in_channels: usize, base_width: usize, vb: VarBuilder) -> Result<ResNet> {
    ResNet::new(in_channels, base_width, BlockKind::Bottleneck, [3, 4, 6, 3], vb)
}

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_channels, out_channels, kernel, config, vb)
}

/// Convolution followed by batch normalization.
#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(x)?, train)
    }
}

/// Residual block: a chain of conv/bn stages plus an optional projection shortcut.
#[derive(Debug, Clone)]
struct Block {
    stages: Vec<ConvBn>,
    downsample: Option<ConvBn>,
}

impl Block {
    fn new(
        kind: BlockKind,
        in_channels: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_channels = planes * kind.expansion();
        // (in, out, kernel, stride) per stage
        let shapes = match kind {
            BlockKind::Basic => vec![(in_channels, planes, 3, stride), (planes, planes, 3, 1)],
            BlockKind::Bottleneck => vec![
                (in_channels, planes, 1, 1),
                (planes, planes, 3, stride),
                (planes, out_channels, 1, 1),
            ],
        };

        let mut stages = Vec::with_capacity(shapes.len());
        for (i, (cin, cout, k, s)) in shapes.into_iter().enumerate() {
            let n = i + 1;
            stages.push(ConvBn {
                conv: conv(cin, cout, k, s, vb.pp(format!("conv{n}")))?,
                bn: batch_norm(cout, BN_EPS, vb.pp(format!("bn{n}")))?,
            });
        }

        let downsample = if stride != 1 || in_channels != out_channels {
            let vb = vb.pp("downsample");
            Some(ConvBn {
                conv: conv(in_channels, out_channels, 1, stride, vb.pp("0"))?,
                bn: batch_norm(out_channels, BN_EPS, vb.pp("1"))?,
            })
        } else {
            None
        };

        Ok(Self { stages, downsample })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = x.clone();
        let last = self.stages.len() - 1;
        for (i, stage) in self.stages.iter().enumerate() {
            out = stage.forward_t(&out, train)?;
            if i != last {
                out = out.relu()?;
            }
        }
        let identity = match &self.downsample {
            Some(down) => down.forward_t(x, train)?,
            None => x.clone(),
        };
        (out + identity)?.relu()
    }
}

/// Residual backbone without the classification layer.
#[derive(Debug, Clone)]
pub struct ResNet {
    stem: ConvBn,
    layers: Vec<Vec<Block>>,
    in_channels: usize,
    out_channels: usize,
}

impl ResNet {
    fn new(
        in_channels: usize,
        base_width: usize,
        kind: BlockKind,
        depths: [usize; 4],
        vb: VarBuilder,
    ) -> Result<Self> {
        let stem = ConvBn {
            conv: conv2d_no_bias(
                in_channels,
                base_width,
                7,
                Conv2dConfig {
                    padding: 3,
                    stride: 2,
                    ..Default::default()
                },
                vb.pp("conv1"),
            )?,
            bn: batch_norm(base_width, BN_EPS, vb.pp("bn1"))?,
        };

        let mut layers = Vec::with_capacity(4);
        let mut channels = base_width;
        for (i, depth) in depths.into_iter().enumerate() {
            let planes = base_width << i;
            let stride = if i == 0 { 1 } else { 2 };
            let vb_layer = vb.pp(format!("layer{}", i + 1));
            let mut blocks = Vec::with_capacity(depth);
            for j in 0..depth {
                let s = if j == 0 { stride } else { 1 };
                blocks.push(Block::new(kind, channels, planes, s, vb_layer.pp(j.to_string()))?);
                channels = planes * kind.expansion();
            }
            layers.push(blocks);
        }

        Ok(Self {
            stem,
            layers,
            in_channels,
            out_channels: channels,
        })
    }

    /// Expected input channels.
    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Channels of the output feature map.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl ModuleT for ResNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.stem.forward_t(x, train)?.relu()?;
        // zero padding is equivalent to -inf padding after ReLU
        let mut x = x
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for layer in &self.layers {
            for block in layer {
                x = block.forward_t(&x, train)?;
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(arch: Architecture, in_channels: usize, width: usize) -> (VarMap, ResNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = arch.build(in_channels, width, vb).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!("resnet18".parse::<Architecture>().unwrap(), Architecture::ResNet18);
        assert_eq!("ResNet50".parse::<Architecture>().unwrap(), Architecture::ResNet50);
        let err = "inception".parse::<Architecture>().unwrap_err();
        assert!(matches!(err, FusionError::UnknownArchitecture(tag) if tag == "inception"));
    }

    #[test]
    fn test_output_channels() {
        assert_eq!(Architecture::ResNet18.out_channels(64), 512);
        assert_eq!(Architecture::ResNet34.out_channels(64), 512);
        assert_eq!(Architecture::ResNet50.out_channels(64), 2048);
    }

    #[test]
    fn test_basic_backbone_shape() {
        let (_varmap, net) = build(Architecture::ResNet18, 3, 4);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &Device::Cpu).unwrap();
        let y = net.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 32, 2, 2]);
        assert_eq!(net.out_channels(), Architecture::ResNet18.out_channels(4));
    }

    #[test]
    fn test_bottleneck_backbone_shape() {
        let (_varmap, net) = build(Architecture::ResNet50, 4, 4);
        let x = Tensor::randn(0f32, 1.0, (1, 4, 64, 64), &Device::Cpu).unwrap();
        let y = net.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[1, Architecture::ResNet50.out_channels(4), 2, 2]);
    }

    #[test]
    fn test_parameter_names() {
        let (varmap, _net) = build(Architecture::ResNet50, 3, 4);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("conv1.weight"));
        assert!(data.contains_key("bn1.running_mean"));
        assert!(data.contains_key("layer1.0.conv3.weight"));
        assert!(data.contains_key("layer1.0.downsample.0.weight"));
        assert!(data.contains_key("layer4.2.bn2.bias"));
        assert!(!data.contains_key("layer4.3.conv1.weight"));
    }
}
