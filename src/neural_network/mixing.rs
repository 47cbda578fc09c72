use super::{
    autograd::{ArcTensor4, Variable, Variable3, Variable4},
    layer::{Activation, Dense, Forward, Layer, LayerNorm, Norm, ParseTagError, PointwiseConv},
};
use anyhow::{ensure, Result};
use ndarray::{Array4, Dimension, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// MLP applied to the last axis.
///
/// LayerNorm(dim) -> Dense(dim, dim) -> activation -> Dense(dim, dim).
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ElementWiseMLP {
    #[remixer(layer)]
    norm: LayerNorm,
    #[remixer(layer)]
    fc1: Dense,
    activation: Activation,
    #[remixer(layer)]
    fc2: Dense,
}

impl ElementWiseMLP {
    /// Creates a new [`ElementWiseMLP`] over `dim` features.
    pub fn new(dim: usize, activation: Activation) -> Result<Self> {
        let dense = || Dense::builder().inputs(dim).outputs(dim).bias(true).build();
        Ok(Self {
            norm: LayerNorm::new(dim)?,
            fc1: dense()?,
            activation,
            fc2: dense()?,
        })
    }
    /// The number of features.
    pub fn dim(&self) -> usize {
        self.fc1.inputs()
    }
}

impl<D: Dimension + 'static> Forward<Variable<D>> for ElementWiseMLP {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        input
            .forward(&self.norm)?
            .forward(&self.fc1)?
            .forward(&self.activation)?
            .forward(&self.fc2)
    }
}

/// Token mixing MLP.
///
/// Applies an [`ElementWiseMLP`] over the patch axis of [batch_size, num_patch, dim].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct MixerMLP {
    #[remixer(layer)]
    mlp: ElementWiseMLP,
}

impl MixerMLP {
    /// Creates a new [`MixerMLP`] over `num_patch` tokens.
    pub fn new(num_patch: usize, activation: Activation) -> Result<Self> {
        Ok(Self {
            mlp: ElementWiseMLP::new(num_patch, activation)?,
        })
    }
    /// The number of tokens.
    pub fn num_patch(&self) -> usize {
        self.mlp.dim()
    }
}

impl Forward<Variable3> for MixerMLP {
    type Output = Variable3;
    fn forward(&self, input: Variable3) -> Result<Variable3> {
        ensure!(
            input.shape()[1] == self.num_patch(),
            "MixerMLP over {} patches can not apply to input with shape {:?}!",
            self.num_patch(),
            input.shape()
        );
        input
            .swap_axes(1, 2)?
            .forward(&self.mlp)?
            .swap_axes(1, 2)
    }
}

/// Padding of the borders for [`SpatialShift2d`].
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum PaddingMode {
    /// Zeros, also parsed from "constant".
    #[cfg_attr(feature = "serde", serde(alias = "constant"))]
    Zeros,
    /// Repeats the edge.
    #[default]
    Replicate,
    /// Mirrors about the edge, excluding it.
    Reflect,
    /// Wraps around.
    Circular,
}

impl PaddingMode {
    const TAGS: &'static [&'static str] = &["zeros", "constant", "replicate", "reflect", "circular"];

    /// The tag, ie "replicate".
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zeros => "zeros",
            Self::Replicate => "replicate",
            Self::Reflect => "reflect",
            Self::Circular => "circular",
        }
    }
    /// Maps `index` along an axis of length `len` to a valid index, or None for zeros.
    fn resolve(self, index: isize, len: usize) -> Option<usize> {
        let n = len as isize;
        if (0..n).contains(&index) {
            return Some(index as usize);
        }
        let index = match self {
            Self::Zeros => return None,
            Self::Replicate => index.clamp(0, n - 1),
            Self::Reflect => {
                if index < 0 {
                    -index
                } else {
                    2 * (n - 1) - index
                }
            }
            Self::Circular => index.rem_euclid(n),
        };
        (0..n).contains(&index).then_some(index as usize)
    }
}

impl Display for PaddingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaddingMode {
    type Err = ParseTagError;
    fn from_str(tag: &str) -> Result<Self, ParseTagError> {
        match tag {
            "zeros" | "constant" => Ok(Self::Zeros),
            "replicate" => Ok(Self::Replicate),
            "reflect" => Ok(Self::Reflect),
            "circular" => Ok(Self::Circular),
            _ => Err(ParseTagError::new("padding_mode", tag, Self::TAGS)),
        }
    }
}

// (di, dj) read offsets of each channel group.
const SHIFTS: [(isize, isize); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];

/// Spatial shift over [batch_size, channels, height, width].
///
/// Channels are split into 4 groups of c / 4, c / 4, c / 4 and c - 3 * (c / 4). The groups
/// are shifted by one pixel: right, left, down and up respectively, ie the first group
/// reads x[i, j - 1]. Pixels shifted in from the border follow the [`PaddingMode`].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpatialShift2d {
    channels: usize,
    padding_mode: PaddingMode,
}

impl SpatialShift2d {
    /// Creates a new [`SpatialShift2d`].
    ///
    /// **Errors**
    ///
    /// Channels must be greater than 0.
    pub fn new(channels: usize, padding_mode: PaddingMode) -> Result<Self> {
        ensure!(channels > 0, "SpatialShift2d channels must be greater than 0!");
        Ok(Self {
            channels,
            padding_mode,
        })
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }
    /// The padding mode.
    pub fn padding_mode(&self) -> PaddingMode {
        self.padding_mode
    }
    /// The sizes of the 4 channel groups.
    pub fn groups(&self) -> [usize; 4] {
        let q = self.channels / 4;
        [q, q, q, self.channels - 3 * q]
    }
    fn group(&self, channel: usize) -> usize {
        let q = self.channels / 4;
        if q == 0 {
            3
        } else {
            (channel / q).min(3)
        }
    }
    fn source(
        &self,
        channel: usize,
        i: usize,
        j: usize,
        h: usize,
        w: usize,
    ) -> Option<(usize, usize)> {
        let (di, dj) = SHIFTS[self.group(channel)];
        let si = self.padding_mode.resolve(i as isize + di, h)?;
        let sj = self.padding_mode.resolve(j as isize + dj, w)?;
        Some((si, sj))
    }
}

impl Layer for SpatialShift2d {}

impl Forward<Variable4> for SpatialShift2d {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (batch_size, channels, h, w) = input.dim();
        ensure!(
            channels == self.channels,
            "SpatialShift2d with {} channels can not apply to input with shape {:?}!",
            self.channels,
            input.shape()
        );
        if self.padding_mode == PaddingMode::Reflect {
            ensure!(
                h >= 2 && w >= 2,
                "Reflect padding requires height and width of at least 2, found {:?}!",
                input.shape()
            );
        }
        let shift = *self;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcTensor4| {
                let mut input_grad = Array4::<f32>::zeros([batch_size, channels, h, w]);
                for ((b, c, i, j), dy) in output_grad.indexed_iter() {
                    if let Some((si, sj)) = shift.source(c, i, j, h, w) {
                        input_grad[(b, c, si, sj)] += *dy;
                    }
                }
                Ok(input_grad.into_shared())
            });
        }
        let x = input.value();
        let mut output = Array4::<f32>::zeros([batch_size, channels, h, w]);
        Zip::indexed(&mut output).par_for_each(|(b, c, i, j), y| {
            if let Some((si, sj)) = shift.source(c, i, j, h, w) {
                *y = x[(b, c, si, sj)];
            }
        });
        Ok(builder.build(output.into_shared()))
    }
}

/// Shift block of a [`ReS2MLP2d`](super::model::ReS2MLP2d).
///
/// Conv1x1 -> activation -> [`SpatialShift2d`] -> Conv1x1 -> norm over [C, H, W].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ShiftMLP {
    #[remixer(layer)]
    fc1: PointwiseConv,
    activation: Activation,
    shift: SpatialShift2d,
    #[remixer(layer)]
    fc2: PointwiseConv,
    #[remixer(layer)]
    norm: LayerNorm,
}

impl ShiftMLP {
    /// Creates a new [`ShiftMLP`] for images of `channels` x `image_size`.
    pub fn new(
        channels: usize,
        image_size: [usize; 2],
        activation: Activation,
        norm: Norm,
        padding_mode: PaddingMode,
    ) -> Result<Self> {
        let [h, w] = image_size;
        Ok(Self {
            fc1: PointwiseConv::new(channels, channels)?,
            activation,
            shift: SpatialShift2d::new(channels, padding_mode)?,
            fc2: PointwiseConv::new(channels, channels)?,
            norm: norm.build([channels, h, w])?,
        })
    }
}

impl Forward<Variable4> for ShiftMLP {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input
            .forward(&self.fc1)?
            .forward(&self.activation)?
            .forward(&self.shift)?
            .forward(&self.fc2)?
            .forward(&self.norm)
    }
}

/// Channel block of a [`ReS2MLP2d`](super::model::ReS2MLP2d).
///
/// Conv1x1 -> activation -> Conv1x1 -> norm over [C, H, W].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ChannelMLP {
    #[remixer(layer)]
    fc1: PointwiseConv,
    activation: Activation,
    #[remixer(layer)]
    fc2: PointwiseConv,
    #[remixer(layer)]
    norm: LayerNorm,
}

impl ChannelMLP {
    /// Creates a new [`ChannelMLP`] for images of `channels` x `image_size`.
    pub fn new(
        channels: usize,
        image_size: [usize; 2],
        activation: Activation,
        norm: Norm,
    ) -> Result<Self> {
        let [h, w] = image_size;
        Ok(Self {
            fc1: PointwiseConv::new(channels, channels)?,
            activation,
            fc2: PointwiseConv::new(channels, channels)?,
            norm: norm.build([channels, h, w])?,
        })
    }
}

impl Forward<Variable4> for ChannelMLP {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input
            .forward(&self.fc1)?
            .forward(&self.activation)?
            .forward(&self.fc2)?
            .forward(&self.norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::tests::{check_gradients, random};
    use ndarray::{s, Array};

    #[test]
    fn shift_groups() -> Result<()> {
        let shift = SpatialShift2d::new(16, PaddingMode::Replicate)?;
        assert_eq!(shift.groups(), [4, 4, 4, 4]);
        let shift = SpatialShift2d::new(17, PaddingMode::Replicate)?;
        assert_eq!(shift.groups(), [4, 4, 4, 5]);
        assert_eq!(shift.channels(), 17);
        assert_eq!(shift.padding_mode(), PaddingMode::Replicate);
        let y = Variable4::from(random([2, 17, 3, 5])).forward(&shift)?;
        assert_eq!(y.shape(), [2, 17, 3, 5]);
        assert!(SpatialShift2d::new(0, PaddingMode::Zeros).is_err());
        Ok(())
    }

    #[test]
    fn shift_directions() -> Result<()> {
        let x = Array::from_shape_fn([1, 4, 3, 3], |(_, _, i, j)| (3 * i + j) as f32);
        let shift = SpatialShift2d::new(4, PaddingMode::Zeros)?;
        let y = Variable4::from(x).forward(&shift)?.into_value();
        // right
        assert_eq!(y.slice(s![0, 0, 1, ..]), ndarray::aview1(&[0f32, 3., 4.]));
        // left
        assert_eq!(y.slice(s![0, 1, 1, ..]), ndarray::aview1(&[4f32, 5., 0.]));
        // down
        assert_eq!(y.slice(s![0, 2, .., 1]), ndarray::aview1(&[0f32, 1., 4.]));
        // up
        assert_eq!(y.slice(s![0, 3, .., 1]), ndarray::aview1(&[4f32, 7., 0.]));
        Ok(())
    }

    #[test]
    fn padding_modes() {
        assert_eq!(PaddingMode::Replicate.resolve(-1, 4), Some(0));
        assert_eq!(PaddingMode::Replicate.resolve(4, 4), Some(3));
        assert_eq!(PaddingMode::Reflect.resolve(-1, 4), Some(1));
        assert_eq!(PaddingMode::Reflect.resolve(4, 4), Some(2));
        assert_eq!(PaddingMode::Circular.resolve(-1, 4), Some(3));
        assert_eq!(PaddingMode::Circular.resolve(4, 4), Some(0));
        assert_eq!(PaddingMode::Zeros.resolve(-1, 4), None);
        assert_eq!(PaddingMode::default(), PaddingMode::Replicate);
        assert_eq!("circular".parse::<PaddingMode>().unwrap(), PaddingMode::Circular);
        assert_eq!("zeros".parse::<PaddingMode>().unwrap(), PaddingMode::Zeros);
        assert_eq!("constant".parse::<PaddingMode>().unwrap(), PaddingMode::Zeros);
        assert_eq!(PaddingMode::Zeros.to_string(), "zeros");
        assert!("mirror".parse::<PaddingMode>().is_err());
    }

    #[test]
    fn reflect_requires_2_pixels() -> Result<()> {
        let shift = SpatialShift2d::new(4, PaddingMode::Reflect)?;
        assert!(Variable4::from(random([1, 4, 1, 3])).forward(&shift).is_err());
        Ok(())
    }

    #[test]
    fn shift_gradients() -> Result<()> {
        for padding_mode in [
            PaddingMode::Zeros,
            PaddingMode::Replicate,
            PaddingMode::Reflect,
            PaddingMode::Circular,
        ] {
            let mut shift = SpatialShift2d::new(5, padding_mode)?;
            check_gradients(&mut shift, random([1, 5, 3, 3]), |shift, x: Variable4| {
                shift.forward(x)
            })?;
        }
        Ok(())
    }

    #[test]
    fn mixer_mlp_gradients() -> Result<()> {
        let mut mixer = MixerMLP::new(3, Activation::Gelu)?;
        assert_eq!(mixer.parameters_len(), 6);
        check_gradients(&mut mixer, random([2, 3, 2]), |mixer, x: Variable3| {
            mixer.forward(x)
        })
    }

    #[test]
    fn mixer_mlp_mixes_patches() -> Result<()> {
        let mixer = MixerMLP::new(4, Activation::Relu)?;
        assert!(Variable3::from(random([2, 5, 4])).forward(&mixer).is_err());
        let y = Variable3::from(random([2, 4, 5])).forward(&mixer)?;
        assert_eq!(y.shape(), [2, 4, 5]);
        Ok(())
    }

    #[test]
    fn shift_mlp_gradients() -> Result<()> {
        let mut f = ShiftMLP::new(
            4,
            [2, 3],
            Activation::Gelu,
            Norm::LayerNorm,
            PaddingMode::Replicate,
        )?;
        check_gradients(&mut f, random([1, 4, 2, 3]), |f, x: Variable4| f.forward(x))
    }

    #[test]
    fn channel_mlp_shape() -> Result<()> {
        let g = ChannelMLP::new(6, [4, 4], Activation::LeakyRelu, Norm::LayerNorm)?;
        assert_eq!(g.parameters_len(), 6);
        let y = Variable4::from(random([2, 6, 4, 4])).forward(&g)?;
        assert_eq!(y.shape(), [2, 6, 4, 4]);
        Ok(())
    }
}
