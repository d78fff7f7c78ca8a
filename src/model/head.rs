//! Fusion head: 1x1 bottleneck over concatenated streams, then classifier.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Dropout, Linear,
    VarBuilder,
};

/// Bias-free 1x1 convolutions reducing channel depth, then global average pooling.
#[derive(Debug, Clone)]
pub struct Bottleneck {
    convs: Vec<Conv2d>,
    out_channels: usize,
}

impl Bottleneck {
    /// `schedule` lists the output channels of each stage.
    pub fn new(in_channels: usize, schedule: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(schedule.len());
        let mut cin = in_channels;
        for (i, &cout) in schedule.iter().enumerate() {
            convs.push(conv2d_no_bias(
                cin,
                cout,
                1,
                Conv2dConfig::default(),
                vb.pp(i.to_string()),
            )?);
            cin = cout;
        }
        Ok(Self {
            convs,
            out_channels: cin,
        })
    }

    /// Width of the pooled vector.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for Bottleneck {
    /// `(batch, C, H, W)` -> `(batch, out_channels)`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convs {
            x = conv.forward(&x)?;
        }
        x.mean((2, 3))
    }
}

/// Dropout, linear, batch norm, ReLU, dropout, linear. Emits raw logits.
#[derive(Debug, Clone)]
pub struct Classifier {
    dropout: Dropout,
    fc1: Linear,
    bn: BatchNorm,
    fc2: Linear,
}

impl Classifier {
    /// Build the classifier.
    pub fn new(
        in_features: usize,
        hidden: usize,
        nb_classes: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            dropout: Dropout::new(dropout),
            fc1: linear(in_features, hidden, vb.pp("fc1"))?,
            bn: batch_norm(hidden, 1e-5, vb.pp("bn"))?,
            fc2: linear(hidden, nb_classes, vb.pp("fc2"))?,
        })
    }
}

impl ModuleT for Classifier {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.dropout.forward_t(x, train)?;
        let x = self.fc1.forward(&x)?;
        let x = self.bn.forward_t(&x, train)?.relu()?;
        let x = self.dropout.forward_t(&x, train)?;
        self.fc2.forward(&x)
    }
}
