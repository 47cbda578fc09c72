use super::{
    autograd::{Parameter, ParameterD, Variable2, Variable3, Variable4},
    layer::{Activation, Dense, Forward, Layer, Norm},
    mixing::{ChannelMLP, ElementWiseMLP, MixerMLP, PaddingMode, ShiftMLP},
    patch::{Image2Patch, Patch2Image},
    reversible::{CouplingBlock, DuplicatedSequence, ReversibleSequence},
};
use anyhow::{ensure, Result};
use log::debug;
use ndarray::{ArrayD, Ix2};
use rand::distributions::Distribution;
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Model builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`ReMixer`].
    #[derive(Clone, Debug, PartialEq)]
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(default, deny_unknown_fields)
    )]
    pub struct ReMixerBuilder {
        num_patch: usize,
        dim: usize,
        activation: Activation,
        num_layers: usize,
    }

    impl Default for ReMixerBuilder {
        fn default() -> Self {
            Self {
                num_patch: 0,
                dim: 512,
                activation: Activation::default(),
                num_layers: 1,
            }
        }
    }

    impl ReMixerBuilder {
        /// The number of patches (tokens). Required.
        pub fn num_patch(self, num_patch: usize) -> Self {
            Self { num_patch, ..self }
        }
        /// The feature dimension. Default is 512.
        pub fn dim(self, dim: usize) -> Self {
            Self { dim, ..self }
        }
        /// The activation. Default is gelu.
        pub fn activation(self, activation: Activation) -> Self {
            Self { activation, ..self }
        }
        /// The number of coupling blocks. Default is 1.
        pub fn num_layers(self, num_layers: usize) -> Self {
            Self { num_layers, ..self }
        }
        /// Builds the model.
        ///
        /// **Errors**
        ///
        /// `num_patch` and `dim` must be greater than 0.
        pub fn build(self) -> Result<ReMixer> {
            ReMixer::new(self.num_patch, self.dim, self.activation, self.num_layers)
        }
    }

    /// Builder for creating a [`ReMixerImageClassificator`].
    #[derive(Clone, Debug, PartialEq)]
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(default, deny_unknown_fields)
    )]
    pub struct ReMixerImageClassificatorBuilder {
        channels: usize,
        image_size: usize,
        patch_size: usize,
        classes: usize,
        dim: usize,
        num_layers: usize,
        activation: Activation,
    }

    impl Default for ReMixerImageClassificatorBuilder {
        fn default() -> Self {
            Self {
                channels: 3,
                image_size: 256,
                patch_size: 16,
                classes: 10,
                dim: 512,
                num_layers: 12,
                activation: Activation::default(),
            }
        }
    }

    impl ReMixerImageClassificatorBuilder {
        /// The image channels. Default is 3.
        pub fn channels(self, channels: usize) -> Self {
            Self { channels, ..self }
        }
        /// The height and width of the images. Default is 256.
        pub fn image_size(self, image_size: usize) -> Self {
            Self { image_size, ..self }
        }
        /// The height and width of the patches. Default is 16.
        pub fn patch_size(self, patch_size: usize) -> Self {
            Self { patch_size, ..self }
        }
        /// The number of classes. Default is 10.
        pub fn classes(self, classes: usize) -> Self {
            Self { classes, ..self }
        }
        /// The feature dimension. Default is 512.
        pub fn dim(self, dim: usize) -> Self {
            Self { dim, ..self }
        }
        /// The number of coupling blocks. Default is 12.
        pub fn num_layers(self, num_layers: usize) -> Self {
            Self { num_layers, ..self }
        }
        /// The activation. Default is gelu.
        pub fn activation(self, activation: Activation) -> Self {
            Self { activation, ..self }
        }
        /// Builds the model.
        ///
        /// **Errors**
        ///
        /// The image size must be divisible by the patch size.
        pub fn build(self) -> Result<ReMixerImageClassificator> {
            let Self {
                channels,
                image_size,
                patch_size,
                classes,
                dim,
                num_layers,
                activation,
            } = self;
            let image2patch =
                Image2Patch::new(channels, [image_size; 2], [patch_size; 2])?;
            let num_patch = image2patch.num_patch();
            let embedding = Dense::builder()
                .inputs(image2patch.patch_dim())
                .outputs(dim)
                .bias(true)
                .build()?;
            let remixer = ReMixer::new(num_patch, dim, activation, num_layers)?;
            let dim2class = Dense::builder()
                .inputs(dim)
                .outputs(classes)
                .bias(true)
                .build()?;
            debug!(
                "ReMixerImageClassificator: {num_layers} layers, {num_patch} patches of {}, dim {dim}, {classes} classes",
                image2patch.patch_dim(),
            );
            Ok(ReMixerImageClassificator {
                image2patch,
                embedding,
                remixer,
                dim2class,
            })
        }
    }

    /// Builder for creating a [`ReMixerImageGenerator`].
    #[derive(Clone, Debug, PartialEq)]
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(default, deny_unknown_fields)
    )]
    pub struct ReMixerImageGeneratorBuilder {
        feature_dim: usize,
        channels: usize,
        image_size: usize,
        patch_size: usize,
        dim: usize,
        num_layers: usize,
        activation: Activation,
    }

    impl Default for ReMixerImageGeneratorBuilder {
        fn default() -> Self {
            Self {
                feature_dim: 1024,
                channels: 3,
                image_size: 256,
                patch_size: 16,
                dim: 512,
                num_layers: 12,
                activation: Activation::default(),
            }
        }
    }

    impl ReMixerImageGeneratorBuilder {
        /// The length of the input features. Default is 1024.
        pub fn feature_dim(self, feature_dim: usize) -> Self {
            Self {
                feature_dim,
                ..self
            }
        }
        /// The image channels. Default is 3.
        pub fn channels(self, channels: usize) -> Self {
            Self { channels, ..self }
        }
        /// The height and width of the images. Default is 256.
        pub fn image_size(self, image_size: usize) -> Self {
            Self { image_size, ..self }
        }
        /// The height and width of the patches. Default is 16.
        pub fn patch_size(self, patch_size: usize) -> Self {
            Self { patch_size, ..self }
        }
        /// The feature dimension. Default is 512.
        pub fn dim(self, dim: usize) -> Self {
            Self { dim, ..self }
        }
        /// The number of coupling blocks. Default is 12.
        pub fn num_layers(self, num_layers: usize) -> Self {
            Self { num_layers, ..self }
        }
        /// The activation. Default is gelu.
        pub fn activation(self, activation: Activation) -> Self {
            Self { activation, ..self }
        }
        /// Builds the model.
        ///
        /// The positional embedding is sampled from a standard normal distribution.
        ///
        /// **Errors**
        ///
        /// The image size must be divisible by the patch size.
        pub fn build(self) -> Result<ReMixerImageGenerator> {
            let Self {
                feature_dim,
                channels,
                image_size,
                patch_size,
                dim,
                num_layers,
                activation,
            } = self;
            let patch2image = Patch2Image::new(channels, [image_size; 2], [patch_size; 2])?;
            let num_patch = patch2image.num_patch();
            let embedding = Dense::builder()
                .inputs(feature_dim)
                .outputs(dim)
                .bias(true)
                .build()?;
            let data = StandardNormal
                .sample_iter(rand::thread_rng())
                .take(num_patch * dim)
                .collect::<Vec<f32>>();
            let position = Parameter::from(ArrayD::from_shape_vec(vec![num_patch, dim], data)?);
            let remixer = ReMixer::new(num_patch, dim, activation, num_layers)?;
            let unembedding = Dense::builder()
                .inputs(dim)
                .outputs(patch2image.patch_dim())
                .bias(true)
                .build()?;
            debug!(
                "ReMixerImageGenerator: {num_layers} layers, {feature_dim} features, {num_patch} patches, dim {dim}"
            );
            Ok(ReMixerImageGenerator {
                embedding,
                position,
                remixer,
                unembedding,
                patch2image,
            })
        }
    }

    /// Builder for creating a [`ReMixerImage2Image`].
    #[derive(Clone, Debug, PartialEq)]
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(default, deny_unknown_fields)
    )]
    pub struct ReMixerImage2ImageBuilder {
        input_channels: usize,
        output_channels: usize,
        image_size: usize,
        patch_size: usize,
        dim: usize,
        num_layers: usize,
        activation: Activation,
    }

    impl Default for ReMixerImage2ImageBuilder {
        fn default() -> Self {
            Self {
                input_channels: 0,
                output_channels: 0,
                image_size: 0,
                patch_size: 0,
                dim: 512,
                num_layers: 12,
                activation: Activation::default(),
            }
        }
    }

    impl ReMixerImage2ImageBuilder {
        /// The channels of the input images. Required.
        pub fn input_channels(self, input_channels: usize) -> Self {
            Self {
                input_channels,
                ..self
            }
        }
        /// The channels of the output images. Required.
        pub fn output_channels(self, output_channels: usize) -> Self {
            Self {
                output_channels,
                ..self
            }
        }
        /// The height and width of the images. Required.
        pub fn image_size(self, image_size: usize) -> Self {
            Self { image_size, ..self }
        }
        /// The height and width of the patches. Required.
        pub fn patch_size(self, patch_size: usize) -> Self {
            Self { patch_size, ..self }
        }
        /// The feature dimension. Default is 512.
        pub fn dim(self, dim: usize) -> Self {
            Self { dim, ..self }
        }
        /// The number of coupling blocks. Default is 12.
        pub fn num_layers(self, num_layers: usize) -> Self {
            Self { num_layers, ..self }
        }
        /// The activation. Default is gelu.
        pub fn activation(self, activation: Activation) -> Self {
            Self { activation, ..self }
        }
        /// Builds the model.
        ///
        /// **Errors**
        ///
        /// Channels and sizes must be greater than 0 and the image size must be divisible by
        /// the patch size.
        pub fn build(self) -> Result<ReMixerImage2Image> {
            let Self {
                input_channels,
                output_channels,
                image_size,
                patch_size,
                dim,
                num_layers,
                activation,
            } = self;
            let image2patch =
                Image2Patch::new(input_channels, [image_size; 2], [patch_size; 2])?;
            let patch2image =
                Patch2Image::new(output_channels, [image_size; 2], [patch_size; 2])?;
            let num_patch = image2patch.num_patch();
            let embedding = Dense::builder()
                .inputs(image2patch.patch_dim())
                .outputs(dim)
                .bias(true)
                .build()?;
            let remixer = ReMixer::new(num_patch, dim, activation, num_layers)?;
            let unembedding = Dense::builder()
                .inputs(dim)
                .outputs(patch2image.patch_dim())
                .bias(true)
                .build()?;
            debug!(
                "ReMixerImage2Image: {num_layers} layers, {input_channels} -> {output_channels} channels, {num_patch} patches, dim {dim}"
            );
            Ok(ReMixerImage2Image {
                image2patch,
                embedding,
                remixer,
                unembedding,
                patch2image,
            })
        }
    }

    /// Builder for creating a [`ReS2MLP2d`].
    #[derive(Clone, Debug, PartialEq)]
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(default, deny_unknown_fields)
    )]
    pub struct ReS2MLP2dBuilder {
        channels: usize,
        image_size: [usize; 2],
        activation: Activation,
        norm: Norm,
        num_layers: usize,
        padding_mode: PaddingMode,
    }

    impl Default for ReS2MLP2dBuilder {
        fn default() -> Self {
            Self {
                channels: 0,
                image_size: [28, 28],
                activation: Activation::default(),
                norm: Norm::default(),
                num_layers: 1,
                padding_mode: PaddingMode::default(),
            }
        }
    }

    impl ReS2MLP2dBuilder {
        /// The image channels. Required.
        pub fn channels(self, channels: usize) -> Self {
            Self { channels, ..self }
        }
        /// The height and width of the images. Default is [28, 28].
        pub fn image_size(self, image_size: [usize; 2]) -> Self {
            Self { image_size, ..self }
        }
        /// The activation. Default is gelu.
        pub fn activation(self, activation: Activation) -> Self {
            Self { activation, ..self }
        }
        /// The norm. Default is layernorm.
        pub fn norm(self, norm: Norm) -> Self {
            Self { norm, ..self }
        }
        /// The number of coupling blocks. Default is 1.
        pub fn num_layers(self, num_layers: usize) -> Self {
            Self { num_layers, ..self }
        }
        /// The padding of the spatial shift. Default is replicate.
        pub fn padding_mode(self, padding_mode: PaddingMode) -> Self {
            Self {
                padding_mode,
                ..self
            }
        }
        /// Builds the model.
        ///
        /// **Errors**
        ///
        /// Channels and image size must be greater than 0.
        pub fn build(self) -> Result<ReS2MLP2d> {
            let Self {
                channels,
                image_size,
                activation,
                norm,
                num_layers,
                padding_mode,
            } = self;
            ensure!(
                channels > 0 && image_size.iter().all(|x| *x > 0),
                "Invalid ReS2MLP2d channels {channels} or image_size {image_size:?}!"
            );
            let blocks = (0..num_layers)
                .map(|_| {
                    let f = ShiftMLP::new(channels, image_size, activation, norm, padding_mode)?;
                    let g = ChannelMLP::new(channels, image_size, activation, norm)?;
                    Ok(CouplingBlock::new(f, g, 1))
                })
                .collect::<Result<Vec<_>>>()?;
            let mixer = DuplicatedSequence::new(1, ReversibleSequence::new(blocks)?)?;
            debug!(
                "ReS2MLP2d: {num_layers} layers, {channels} channels, image_size {image_size:?}, {activation}, {norm}, {padding_mode}"
            );
            Ok(ReS2MLP2d {
                mixer,
                channels,
                image_size,
            })
        }
    }
}
use builder::*;

/// Reversible MLP-Mixer over [batch_size, num_patch, dim].
///
/// The input is duplicated along the feature axis and passed through `num_layers`
/// [`CouplingBlock`]'s, each mixing tokens with a [`MixerMLP`] (f) and features with an
/// [`ElementWiseMLP`] (g). The two halves of the output are averaged.
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReMixer {
    #[remixer(layer)]
    mixer: DuplicatedSequence<MixerMLP, ElementWiseMLP>,
    num_patch: usize,
    dim: usize,
}

impl ReMixer {
    /// Creates a new [`ReMixer`].
    ///
    /// **Errors**
    ///
    /// `num_patch` and `dim` must be greater than 0.
    pub fn new(
        num_patch: usize,
        dim: usize,
        activation: Activation,
        num_layers: usize,
    ) -> Result<Self> {
        ensure!(
            num_patch > 0 && dim > 0,
            "Invalid ReMixer num_patch {num_patch} or dim {dim}!"
        );
        let blocks = (0..num_layers)
            .map(|_| {
                Ok(CouplingBlock::new(
                    MixerMLP::new(num_patch, activation)?,
                    ElementWiseMLP::new(dim, activation)?,
                    2,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let mixer = DuplicatedSequence::new(2, ReversibleSequence::new(blocks)?)?;
        Ok(Self {
            mixer,
            num_patch,
            dim,
        })
    }
    /// A builder for [`ReMixer`].
    pub fn builder() -> ReMixerBuilder {
        ReMixerBuilder::default()
    }
    /// The number of patches.
    pub fn num_patch(&self) -> usize {
        self.num_patch
    }
    /// The feature dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }
    /// The number of coupling blocks.
    pub fn num_layers(&self) -> usize {
        self.mixer.sequence().len()
    }
}

impl Forward<Variable3> for ReMixer {
    type Output = Variable3;
    fn forward(&self, input: Variable3) -> Result<Variable3> {
        let (_, num_patch, dim) = input.dim();
        ensure!(
            (num_patch, dim) == (self.num_patch, self.dim),
            "ReMixer expected [_, {}, {}], found {:?}!",
            self.num_patch,
            self.dim,
            input.shape()
        );
        input.forward(&self.mixer)
    }
}

/// Image classifier.
///
/// [batch_size, channels, image_size, image_size] -> [batch_size, classes]
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReMixerImageClassificator {
    image2patch: Image2Patch,
    #[remixer(layer)]
    embedding: Dense,
    #[remixer(layer)]
    remixer: ReMixer,
    #[remixer(layer)]
    dim2class: Dense,
}

impl ReMixerImageClassificator {
    /// A builder for [`ReMixerImageClassificator`].
    pub fn builder() -> ReMixerImageClassificatorBuilder {
        ReMixerImageClassificatorBuilder::default()
    }
    /// The image channels.
    pub fn channels(&self) -> usize {
        self.image2patch.channels()
    }
    /// The image [height, width].
    pub fn image_size(&self) -> [usize; 2] {
        self.image2patch.image_size()
    }
    /// The number of classes.
    pub fn classes(&self) -> usize {
        self.dim2class.outputs()
    }
    /// The mixer.
    pub fn remixer(&self) -> &ReMixer {
        &self.remixer
    }
}

impl Forward<Variable4> for ReMixerImageClassificator {
    type Output = Variable2;
    fn forward(&self, input: Variable4) -> Result<Variable2> {
        input
            .forward(&self.image2patch)?
            .forward(&self.embedding)?
            .forward(&self.remixer)?
            .mean_axis(1)?
            .forward(&self.dim2class)
    }
}

/// Image generator.
///
/// [batch_size, feature_dim] -> [batch_size, channels, image_size, image_size]
///
/// The embedded features are repeated for each patch and summed with a learned
/// positional embedding.
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReMixerImageGenerator {
    #[remixer(layer)]
    embedding: Dense,
    #[remixer(parameter)]
    position: ParameterD,
    #[remixer(layer)]
    remixer: ReMixer,
    #[remixer(layer)]
    unembedding: Dense,
    patch2image: Patch2Image,
}

impl ReMixerImageGenerator {
    /// A builder for [`ReMixerImageGenerator`].
    pub fn builder() -> ReMixerImageGeneratorBuilder {
        ReMixerImageGeneratorBuilder::default()
    }
    /// The length of the input features.
    pub fn feature_dim(&self) -> usize {
        self.embedding.inputs()
    }
    /// The positional embedding, [num_patch, dim].
    pub fn position(&self) -> &ParameterD {
        &self.position
    }
}

impl Forward<Variable2> for ReMixerImageGenerator {
    type Output = Variable4;
    fn forward(&self, input: Variable2) -> Result<Variable4> {
        let batch_size = input.dim().0;
        let (num_patch, dim) = (self.remixer.num_patch(), self.remixer.dim());
        let position = self.position.to_variable().into_dimensionality::<Ix2>()?;
        // Each feature is repeated num_patch times before reshaping into patches.
        input
            .forward(&self.embedding)?
            .repeat_interleave(1, num_patch)?
            .into_shape([batch_size, num_patch, dim])?
            .add(&position)?
            .forward(&self.remixer)?
            .forward(&self.unembedding)?
            .forward(&self.patch2image)
    }
}

/// Image to image translation.
///
/// [batch_size, input_channels, image_size, image_size] ->
/// [batch_size, output_channels, image_size, image_size]
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReMixerImage2Image {
    image2patch: Image2Patch,
    #[remixer(layer)]
    embedding: Dense,
    #[remixer(layer)]
    remixer: ReMixer,
    #[remixer(layer)]
    unembedding: Dense,
    patch2image: Patch2Image,
}

impl ReMixerImage2Image {
    /// A builder for [`ReMixerImage2Image`].
    pub fn builder() -> ReMixerImage2ImageBuilder {
        ReMixerImage2ImageBuilder::default()
    }
}

impl Forward<Variable4> for ReMixerImage2Image {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        input
            .forward(&self.image2patch)?
            .forward(&self.embedding)?
            .forward(&self.remixer)?
            .forward(&self.unembedding)?
            .forward(&self.patch2image)
    }
}

/// Reversible spatial shift MLP over [batch_size, channels, height, width].
///
/// The input is duplicated along the channel axis. Each block shifts spatially in f
/// ([`ShiftMLP`]) and mixes channels in g ([`ChannelMLP`]).
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReS2MLP2d {
    #[remixer(layer)]
    mixer: DuplicatedSequence<ShiftMLP, ChannelMLP>,
    channels: usize,
    image_size: [usize; 2],
}

impl ReS2MLP2d {
    /// A builder for [`ReS2MLP2d`].
    pub fn builder() -> ReS2MLP2dBuilder {
        ReS2MLP2dBuilder::default()
    }
    /// The image channels.
    pub fn channels(&self) -> usize {
        self.channels
    }
    /// The height and width of the images.
    pub fn image_size(&self) -> [usize; 2] {
        self.image_size
    }
}

impl Forward<Variable4> for ReS2MLP2d {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, c, h, w) = input.dim();
        let [ih, iw] = self.image_size;
        ensure!(
            (c, h, w) == (self.channels, ih, iw),
            "ReS2MLP2d expected [_, {}, {ih}, {iw}], found {:?}!",
            self.channels,
            input.shape()
        );
        input.forward(&self.mixer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::tests::random;

    #[test]
    fn remixer_shapes() -> Result<()> {
        for dim in [64, 512] {
            for num_layers in [1, 4] {
                let remixer = ReMixer::builder()
                    .num_patch(4)
                    .dim(dim)
                    .num_layers(num_layers)
                    .build()?;
                assert_eq!(remixer.num_layers(), num_layers);
                let y = Variable3::from(random([2, 4, dim])).forward(&remixer)?;
                assert_eq!(y.shape(), [2, 4, dim]);
            }
        }
        Ok(())
    }

    #[test]
    fn remixer_shape_mismatch() -> Result<()> {
        let remixer = ReMixer::new(4, 8, Activation::Relu, 0)?;
        assert!(Variable3::from(random([1, 4, 6])).forward(&remixer).is_err());
        assert!(ReMixer::new(0, 8, Activation::Relu, 1).is_err());
        Ok(())
    }

    #[test]
    fn res2mlp2d_shapes() -> Result<()> {
        for (channels, image_size) in [(64, [6, 5]), (512, [2, 2])] {
            for num_layers in [1, 4] {
                let model = ReS2MLP2d::builder()
                    .channels(channels)
                    .image_size(image_size)
                    .num_layers(num_layers)
                    .build()?;
                assert_eq!(model.parameters().len(), num_layers * 12);
                let [h, w] = image_size;
                let y = Variable4::from(random([1, channels, h, w])).forward(&model)?;
                assert_eq!(y.shape(), [1, channels, h, w]);
            }
        }
        Ok(())
    }

    #[test]
    fn res2mlp2d_invalid() -> Result<()> {
        assert!(ReS2MLP2d::builder().build().is_err());
        let model = ReS2MLP2d::builder()
            .channels(4)
            .image_size([4, 4])
            .padding_mode(PaddingMode::Zeros)
            .build()?;
        assert!(Variable4::from(random([1, 4, 4, 5])).forward(&model).is_err());
        Ok(())
    }

    #[test]
    fn classificator() -> Result<()> {
        let model = ReMixerImageClassificator::builder()
            .channels(3)
            .image_size(64)
            .patch_size(16)
            .classes(10)
            .dim(32)
            .num_layers(2)
            .build()?;
        assert_eq!(model.classes(), 10);
        assert_eq!((model.channels(), model.image_size()), (3, [64, 64]));
        assert_eq!(model.remixer().num_patch(), 16);
        let y = Variable4::from(random([2, 3, 64, 64])).forward(&model)?;
        assert_eq!(y.shape(), [2, 10]);
        assert!(y.value().iter().all(|x| x.is_finite()));
        Ok(())
    }

    #[test]
    fn classificator_not_divisible() {
        let result = ReMixerImageClassificator::builder()
            .image_size(60)
            .patch_size(16)
            .dim(8)
            .num_layers(1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn generator() -> Result<()> {
        let model = ReMixerImageGenerator::builder()
            .feature_dim(16)
            .channels(3)
            .image_size(16)
            .patch_size(4)
            .dim(8)
            .num_layers(2)
            .build()?;
        assert_eq!(model.feature_dim(), 16);
        assert_eq!(model.position().shape(), [16, 8]);
        let y = Variable2::from(random([2, 16])).forward(&model)?;
        assert_eq!(y.shape(), [2, 3, 16, 16]);
        Ok(())
    }

    #[test]
    fn image2image() -> Result<()> {
        assert!(ReMixerImage2Image::builder().build().is_err());
        let model = ReMixerImage2Image::builder()
            .input_channels(3)
            .output_channels(1)
            .image_size(16)
            .patch_size(4)
            .dim(8)
            .num_layers(1)
            .build()?;
        let y = Variable4::from(random([2, 3, 16, 16])).forward(&model)?;
        assert_eq!(y.shape(), [2, 1, 16, 16]);
        Ok(())
    }

    #[test]
    fn classificator_parameters_train() -> Result<()> {
        let mut model = ReMixerImageClassificator::builder()
            .image_size(8)
            .patch_size(4)
            .classes(3)
            .dim(4)
            .num_layers(2)
            .build()?;
        // embedding 2 + 2 blocks * 2 mlps * 6 + dim2class 2
        assert_eq!(model.parameters_len(), 28);
        model.set_training(true);
        let y = Variable4::from(random([2, 3, 8, 8])).forward(&model)?;
        y.node().unwrap().backward()?;
        for parameter in model.parameters() {
            let grad = parameter.grad().unwrap();
            assert_eq!(grad.shape(), parameter.shape());
        }
        Ok(())
    }
}
