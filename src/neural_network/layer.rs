use super::{
    autograd::{reshape, ArcTensor, Parameter, ParameterD, Variable, Variable4},
    optimizer::Optimizer,
};
use anyhow::{ensure, Result};
use ndarray::{linalg::Dot, Array1, Array2, ArrayD, Axis, Dimension, IntoDimension, Ix2, Zip};
use rand::distributions::{Distribution, Uniform};
#[doc(hidden)]
pub use remixer_derive::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    str::FromStr,
};
use thiserror::Error;

/// Layers and networks of layers.
///
/// Reflection over parameters, usually implemented with `#[derive(Layer)]`.
///
/// # Derive
/// [`Layer`] should be [derived](remixer_derive).
///
/// # Clone
/// Implement [`Clone`] (typically this can be derived) to make it easier to share the layer.
/// Clones share the gradients of their parameters.
///
/// # serde
/// With the `serde` feature, layers implement [`Serialize`](serde::Serialize) and
/// [`Deserialize`](serde::Deserialize) for saving and loading.
pub trait Layer: Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// Same as `self.parameters().len()`, without collecting.
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {}
    /// All parameters, children first in field order.
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters(&mut parameters);
        parameters
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {}
    /// Mutable [`.parameters()`](Self::parameters).
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Enables / disables training for all parameters.
    ///
    /// See [`Parameter::set_training()`].
    fn set_training(&mut self, training: bool) {
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
    }
    /// Whether any parameter will compute a gradient.
    fn requires_grad(&self) -> bool {
        self.parameters().iter().any(Parameter::requires_grad)
    }
    /// Steps every parameter with `optimizer`.
    ///
    /// Gradients are consumed, so call after the backward pass(es) of a batch.
    fn update<O: Optimizer>(&mut self, learning_rate: f32, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(())
    }
}

impl<L: Layer> Layer for Vec<L> {
    fn parameters_len(&self) -> usize {
        self.iter().map(Layer::parameters_len).sum()
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        for layer in self.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        for layer in self.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
}

/// Computes an output from `X`.
///
/// Layers are applied with [`Variable::forward`](super::autograd::Variable::forward) or directly.
pub trait Forward<X> {
    /// The type of the output.
    type Output;
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`] are expected to apply backward ops via
    /// [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implementation
    /// should return an error instead of panicking.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

/// Error parsing a configuration tag.
#[derive(Debug, Error)]
#[error("Unknown {kind} {tag:?}, expected one of {expected:?}!")]
pub struct ParseTagError {
    kind: &'static str,
    tag: String,
    expected: &'static [&'static str],
}

impl ParseTagError {
    pub(crate) fn new(kind: &'static str, tag: &str, expected: &'static [&'static str]) -> Self {
        Self {
            kind,
            tag: tag.to_string(),
            expected,
        }
    }
    /// The tag that failed to parse.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Layer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Dense`].
    pub struct DenseBuilder {
        inputs: usize,
        outputs: usize,
        bias: bool,
    }

    impl DenseBuilder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 0,
                outputs: 0,
                bias: false,
            }
        }
        /// The number of inputs.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// The number of outputs.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Add a bias. Default is false.
        ///
        /// The bias is initialized with 0's.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Builds the layer.
        ///
        /// The weight is initialized with a uniform distribution in
        /// (-1 / sqrt(inputs), 1 / sqrt(inputs)).
        ///
        /// **Errors**
        ///
        /// Inputs and outputs must be greater than 0.
        pub fn build(self) -> Result<Dense> {
            let Self {
                inputs,
                outputs,
                bias,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Dense inputs {inputs} and outputs {outputs} must be greater than 0!"
            );
            let a = (inputs as f32).sqrt().recip();
            let data = Uniform::new(-a, a)
                .sample_iter(&mut rand::thread_rng())
                .take(inputs * outputs)
                .collect::<Vec<_>>();
            let weight = Parameter::from(ArrayD::from_shape_vec(vec![outputs, inputs], data)?);
            let bias = if bias {
                Some(Parameter::from(ArrayD::zeros(vec![outputs])))
            } else {
                None
            };
            Ok(Dense { weight, bias })
        }
    }
}
use builder::*;

/// Fully connected layer over the last axis.
///
/// Applies to the last axis, ie [.., inputs] -> [.., outputs].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct Dense {
    #[remixer(parameter)]
    weight: ParameterD,
    #[remixer(optional_parameter)]
    bias: Option<ParameterD>,
}

impl Dense {
    /// Returns a builder for creating a [`Dense`].
    pub fn builder() -> DenseBuilder {
        DenseBuilder::new()
    }
    /// The number of inputs.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of outputs.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
    /// The weight, [outputs, inputs].
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias, [outputs].
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
}

impl<D: Dimension + 'static> Forward<Variable<D>> for Dense {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let inputs = self.inputs();
        let mut shape = input.shape().to_vec();
        ensure!(
            shape.last() == Some(&inputs),
            "Dense with {inputs} inputs can not apply to input with shape {shape:?}!"
        );
        let batch_size = shape[..shape.len() - 1].iter().product::<usize>();
        let x = input.into_shape([batch_size, inputs])?;
        let weight = self.weight.to_variable().into_dimensionality::<Ix2>()?;
        let mut y = x.dot(&weight.t())?;
        if let Some(bias) = self.bias.as_ref() {
            y = y.add(&bias.to_variable())?;
        }
        if let Some(last) = shape.last_mut() {
            *last = self.outputs();
        }
        y.into_shape(shape)?.into_dimensionality()
    }
}

/// 1x1 convolution with bias, over [batch_size, channels, height, width].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct PointwiseConv {
    #[remixer(layer)]
    dense: Dense,
}

impl PointwiseConv {
    /// Creates a new [`PointwiseConv`] mapping `inputs` channels to `outputs` channels.
    pub fn new(inputs: usize, outputs: usize) -> Result<Self> {
        let dense = Dense::builder()
            .inputs(inputs)
            .outputs(outputs)
            .bias(true)
            .build()?;
        Ok(Self { dense })
    }
}

impl Forward<Variable4> for PointwiseConv {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let channels = input.shape()[1];
        ensure!(
            channels == self.dense.inputs(),
            "PointwiseConv with {} inputs can not apply to input with shape {:?}!",
            self.dense.inputs(),
            input.shape()
        );
        let y = self.dense.forward(input.permuted_axes([0, 2, 3, 1]))?;
        Ok(y.permuted_axes([0, 3, 1, 2]))
    }
}

/// Layer normalization over the trailing `normalized_shape` axes.
///
/// The normalized input is scaled by a learnable weight (ones) and shifted by a learnable
/// bias (zeros), both of `normalized_shape`.
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct LayerNorm {
    #[remixer(parameter)]
    weight: ParameterD,
    #[remixer(parameter)]
    bias: ParameterD,
    eps: f32,
}

impl LayerNorm {
    /// Creates a new [`LayerNorm`] for `normalized_shape`.
    ///
    /// **Errors**
    ///
    /// The normalized shape must not be empty or contain 0's.
    pub fn new<E: IntoDimension>(normalized_shape: E) -> Result<Self> {
        let dim = normalized_shape.into_dimension().into_dyn();
        ensure!(
            dim.ndim() > 0 && dim.size() > 0,
            "Invalid LayerNorm normalized_shape {:?}!",
            dim.slice()
        );
        Ok(Self {
            weight: Parameter::from(ArrayD::ones(dim.clone())),
            bias: Parameter::from(ArrayD::zeros(dim)),
            eps: 1e-5,
        })
    }
    /// The normalized shape.
    pub fn normalized_shape(&self) -> &[usize] {
        self.weight.shape()
    }
}

impl<D: Dimension + 'static> Forward<Variable<D>> for LayerNorm {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let normalized_shape = self.normalized_shape();
        let ndim = input.ndim();
        ensure!(
            ndim >= normalized_shape.len()
                && input.shape()[ndim - normalized_shape.len()..] == *normalized_shape,
            "LayerNorm{normalized_shape:?} can not apply to input with shape {:?}!",
            input.shape()
        );
        let m = normalized_shape.iter().product::<usize>();
        let n = input.value().len() / m;
        let x = reshape(input.value().clone(), [n, m])?;
        let eps = self.eps;
        let mut x_hat = Array2::<f32>::zeros([n, m]);
        let mut rstd = Array1::<f32>::zeros(n);
        Zip::from(x_hat.rows_mut())
            .and(x.rows())
            .and(&mut rstd)
            .par_for_each(|mut x_hat, x, rstd| {
                let mean = x.sum() / m as f32;
                let var = x.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / m as f32;
                let r = (var + eps).sqrt().recip();
                *rstd = r;
                Zip::from(&mut x_hat)
                    .and(&x)
                    .for_each(|x_hat, x| *x_hat = (x - mean) * r);
            });
        let x_hat = x_hat.into_shared();
        let rstd = rstd.into_shared();
        let weight = reshape(self.weight.value().clone(), [m])?;
        let bias = reshape(self.bias.value().clone(), [m])?;
        let output = &(&x_hat * &weight) + &bias;
        let mut builder = Variable::<D>::builder();
        if let Some(node) = input.node() {
            let x_hat = x_hat.clone();
            let weight = weight.clone();
            let dim = input.raw_dim();
            builder.edge(node, move |output_grad| {
                let dy = reshape(output_grad, [n, m])?;
                let mut dx = Array2::<f32>::zeros([n, m]);
                Zip::from(dx.rows_mut())
                    .and(dy.rows())
                    .and(x_hat.rows())
                    .and(&rstd)
                    .par_for_each(|mut dx, dy, x_hat, rstd| {
                        let mut mean_dx_hat = 0f32;
                        let mut mean_dx_hat_x_hat = 0f32;
                        for ((dy, x_hat), w) in dy.iter().zip(x_hat.iter()).zip(weight.iter()) {
                            let dx_hat = dy * w;
                            mean_dx_hat += dx_hat;
                            mean_dx_hat_x_hat += dx_hat * x_hat;
                        }
                        mean_dx_hat /= m as f32;
                        mean_dx_hat_x_hat /= m as f32;
                        for (((dx, dy), x_hat), w) in dx
                            .iter_mut()
                            .zip(dy.iter())
                            .zip(x_hat.iter())
                            .zip(weight.iter())
                        {
                            *dx = rstd * (dy * w - mean_dx_hat - x_hat * mean_dx_hat_x_hat);
                        }
                    });
                reshape(dx.into_shared(), dim)
            });
        }
        if let Some(node) = self.weight.to_variable().node() {
            let x_hat = x_hat.clone();
            let dim = self.weight.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                let dy = reshape(output_grad, [n, m])?;
                let dw = (&dy * &x_hat).sum_axis(Axis(0));
                reshape(dw.into_shared(), dim)
            });
        }
        if let Some(node) = self.bias.to_variable().node() {
            let dim = self.bias.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                let dy = reshape(output_grad, [n, m])?;
                reshape(dy.sum_axis(Axis(0)).into_shared(), dim)
            });
        }
        Ok(builder.build(reshape(output.into_shared(), input.raw_dim())?))
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044_715;
const LEAKY_RELU_SLOPE: f32 = 0.2;

/// Activation functions.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Activation {
    /// GELU, with the tanh approximation.
    #[default]
    Gelu,
    /// ReLU.
    Relu,
    /// Leaky ReLU with negative slope 0.2.
    LeakyRelu,
}

impl Activation {
    const TAGS: &'static [&'static str] = &["gelu", "relu", "leakyrelu"];

    /// The tag, ie "gelu".
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gelu => "gelu",
            Self::Relu => "relu",
            Self::LeakyRelu => "leakyrelu",
        }
    }
    fn eval(self, x: f32) -> f32 {
        match self {
            Self::Gelu => 0.5 * x * (1. + (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh()),
            Self::Relu => x.max(0.),
            Self::LeakyRelu => {
                if x >= 0. {
                    x
                } else {
                    LEAKY_RELU_SLOPE * x
                }
            }
        }
    }
    fn derivative(self, x: f32) -> f32 {
        match self {
            Self::Gelu => {
                let t = (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh();
                0.5 * (1. + t)
                    + 0.5 * x * (1. - t * t) * SQRT_2_OVER_PI * (1. + 3. * GELU_COEF * x * x)
            }
            Self::Relu => {
                if x > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::LeakyRelu => {
                if x >= 0. {
                    1.
                } else {
                    LEAKY_RELU_SLOPE
                }
            }
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = ParseTagError;
    fn from_str(tag: &str) -> Result<Self, ParseTagError> {
        match tag {
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            "leakyrelu" => Ok(Self::LeakyRelu),
            _ => Err(ParseTagError::new("activation", tag, Self::TAGS)),
        }
    }
}

impl Layer for Activation {}

impl<D: Dimension + 'static> Forward<Variable<D>> for Activation {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let activation = *self;
        let mut builder = Variable::<D>::builder();
        if let Some(node) = input.node() {
            let x = input.value().clone();
            builder.edge(node, move |output_grad| {
                let mut dx = output_grad.into_owned();
                Zip::from(&mut dx)
                    .and(&x)
                    .par_for_each(|dx, x| *dx *= activation.derivative(*x));
                Ok(dx.into_shared())
            });
        }
        let value = input.value().map(|x| activation.eval(*x));
        Ok(builder.build(value.into_shared()))
    }
}

/// Normalization layers.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Norm {
    /// [`LayerNorm`].
    #[default]
    LayerNorm,
}

impl Norm {
    const TAGS: &'static [&'static str] = &["layernorm"];

    /// The tag, ie "layernorm".
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayerNorm => "layernorm",
        }
    }
    /// Builds the norm layer for `normalized_shape`.
    pub fn build<E: IntoDimension>(&self, normalized_shape: E) -> Result<LayerNorm> {
        match self {
            Self::LayerNorm => LayerNorm::new(normalized_shape),
        }
    }
}

impl Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Norm {
    type Err = ParseTagError;
    fn from_str(tag: &str) -> Result<Self, ParseTagError> {
        match tag {
            "layernorm" => Ok(Self::LayerNorm),
            _ => Err(ParseTagError::new("norm", tag, Self::TAGS)),
        }
    }
}

#[cfg(test)]
mod tests;
