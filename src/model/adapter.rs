//! Channel adapters bringing each stream to the common fusion grid.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::{AdapterConfig, Modality};
use crate::error::{FusionError, Result};

/// Per-stream adapter applied between an encoder and the fusion head.
#[derive(Debug, Clone)]
pub enum ChannelAdapter {
    /// No-op.
    Identity,
    /// Average pooling with zero padding included in the average.
    AvgPool {
        /// Kernel and stride.
        kernel: usize,
        /// Border padding.
        padding: usize,
    },
    /// Bias-free 1x1 projections followed by pooling.
    Project {
        /// Projection layers, applied in order.
        convs: Vec<Conv2d>,
        /// Kernel and stride (1 disables pooling).
        kernel: usize,
        /// Border padding.
        padding: usize,
    },
    /// View as `(channels, height, width)`.
    Reshape {
        /// Target channels.
        channels: usize,
        /// Target height.
        height: usize,
        /// Target width.
        width: usize,
    },
}

impl ChannelAdapter {
    /// Build an adapter for an encoder emitting `in_channels` channels.
    pub fn new(config: &AdapterConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let adapter = match config {
            AdapterConfig::Identity => ChannelAdapter::Identity,
            AdapterConfig::AvgPool { kernel, padding } => ChannelAdapter::AvgPool {
                kernel: *kernel,
                padding: *padding,
            },
            AdapterConfig::Project {
                channels,
                pool_kernel,
                pool_padding,
            } => {
                let mut convs = Vec::with_capacity(channels.len());
                let mut cin = in_channels;
                for (i, &cout) in channels.iter().enumerate() {
                    convs.push(conv2d_no_bias(
                        cin,
                        cout,
                        1,
                        Conv2dConfig::default(),
                        vb.pp(i.to_string()),
                    )?);
                    cin = cout;
                }
                ChannelAdapter::Project {
                    convs,
                    kernel: *pool_kernel,
                    padding: *pool_padding,
                }
            }
            AdapterConfig::Reshape {
                channels,
                height,
                width,
            } => ChannelAdapter::Reshape {
                channels: *channels,
                height: *height,
                width: *width,
            },
        };
        Ok(adapter)
    }

    /// Whether the adapter owns parameters.
    #[must_use]
    pub fn has_parameters(&self) -> bool {
        matches!(self, ChannelAdapter::Project { convs, .. } if !convs.is_empty())
    }

    /// Static shape inference for a `(channels, height, width)` input.
    ///
    /// Returns `None` when the adapter cannot accept the input.
    #[must_use]
    pub fn output_shape(&self, input: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
        let (c, h, w) = input;
        match self {
            ChannelAdapter::Identity => Some(input),
            ChannelAdapter::AvgPool { kernel, padding } => {
                Some((c, pooled(h, *kernel, *padding)?, pooled(w, *kernel, *padding)?))
            }
            ChannelAdapter::Project {
                convs,
                kernel,
                padding,
            } => {
                let c = convs.last().map_or(c, |conv| conv.weight().dims()[0]);
                Some((c, pooled(h, *kernel, *padding)?, pooled(w, *kernel, *padding)?))
            }
            ChannelAdapter::Reshape {
                channels,
                height,
                width,
            } => (c * h * w == channels * height * width).then_some((*channels, *height, *width)),
        }
    }

    /// Adapt one stream's `(batch, C, H, W)` feature map.
    ///
    /// # Errors
    ///
    /// A reshape whose element count does not match the input is reported as
    /// [`FusionError::StreamShape`] for `stream`.
    pub fn forward(&self, stream: Modality, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            ChannelAdapter::Identity => x.clone(),
            ChannelAdapter::AvgPool { kernel, padding } => avg_pool(x, *kernel, *padding)?,
            ChannelAdapter::Project {
                convs,
                kernel,
                padding,
            } => {
                let mut out = x.clone();
                for conv in convs {
                    out = conv.forward(&out)?;
                }
                avg_pool(&out, *kernel, *padding)?
            }
            ChannelAdapter::Reshape {
                channels,
                height,
                width,
            } => {
                let (b, c, h, w) = x.dims4()?;
                if c * h * w != channels * height * width {
                    return Err(FusionError::stream_shape(
                        stream.name(),
                        format!("{} elements per sample", channels * height * width),
                        format!("{:?}", [c, h, w]),
                    ));
                }
                x.reshape((b, *channels, *height, *width))?
            }
        };
        Ok(out)
    }
}

fn pooled(size: usize, kernel: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    (padded >= kernel).then(|| (padded - kernel) / kernel + 1)
}

/// Average pooling with stride equal to the kernel; padded zeros count toward the mean.
pub fn avg_pool(x: &Tensor, kernel: usize, padding: usize) -> candle_core::Result<Tensor> {
    if kernel <= 1 && padding == 0 {
        return Ok(x.clone());
    }
    let x = if padding > 0 {
        x.pad_with_zeros(2, padding, padding)?
            .pad_with_zeros(3, padding, padding)?
    } else {
        x.clone()
    };
    x.avg_pool2d_with_stride(kernel, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn adapter(config: AdapterConfig, in_channels: usize) -> (VarMap, ChannelAdapter) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let adapter = ChannelAdapter::new(&config, in_channels, vb).unwrap();
        (varmap, adapter)
    }

    #[test]
    fn test_padded_pool_counts_zeros() {
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let y = avg_pool(&x, 2, 1).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        // every window covers one real cell and three padded zeros
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_avg_pool_seven_to_four() {
        let (_vm, a) = adapter(AdapterConfig::AvgPool { kernel: 2, padding: 1 }, 512);
        assert_eq!(a.output_shape((512, 7, 7)), Some((512, 4, 4)));
        let x = Tensor::randn(0f32, 1.0, (2, 8, 7, 7), &Device::Cpu).unwrap();
        let y = a.forward(Modality::Rgb, &x).unwrap();
        assert_eq!(y.dims(), &[2, 8, 4, 4]);
        assert!(!a.has_parameters());
    }

    #[test]
    fn test_projection() {
        let config = AdapterConfig::Project {
            channels: vec![16, 8],
            pool_kernel: 2,
            pool_padding: 1,
        };
        let (varmap, a) = adapter(config, 32);
        assert!(a.has_parameters());
        assert_eq!(varmap.all_vars().len(), 2);
        assert_eq!(a.output_shape((32, 7, 7)), Some((8, 4, 4)));

        let x = Tensor::randn(0f32, 1.0, (1, 32, 7, 7), &Device::Cpu).unwrap();
        let y = a.forward(Modality::Flow, &x).unwrap();
        assert_eq!(y.dims(), &[1, 8, 4, 4]);
    }

    #[test]
    fn test_reshape_mismatch_names_stream() {
        let config = AdapterConfig::Reshape {
            channels: 512,
            height: 4,
            width: 4,
        };
        let (_vm, a) = adapter(config, 512);
        assert_eq!(a.output_shape((512, 7, 7)), None);
        assert_eq!(a.output_shape((2048, 2, 2)), Some((512, 4, 4)));

        let x = Tensor::zeros((1, 512, 7, 7), DType::F32, &Device::Cpu).unwrap();
        let err = a.forward(Modality::Pose, &x).unwrap_err();
        assert!(matches!(err, FusionError::StreamShape { ref stream, .. } if stream == "pose"));
    }
}
