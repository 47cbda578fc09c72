use super::{
    autograd::{ArcTensor, Node, Variable},
    layer::{Forward, Layer},
};
use anyhow::{ensure, Result};
use log::trace;
use ndarray::{Axis, Dimension, Slice};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

fn half_len(shape: &[usize], axis: usize) -> Result<usize> {
    ensure!(
        axis < shape.len(),
        "Split axis {axis} out of range for shape {shape:?}!"
    );
    let len = shape[axis];
    ensure!(
        len % 2 == 0,
        "Can not split odd length {len} along axis {axis} of shape {shape:?}!"
    );
    Ok(len / 2)
}

fn split_tensor<D: Dimension>(
    x: &ArcTensor<D>,
    axis: usize,
) -> Result<(ArcTensor<D>, ArcTensor<D>)> {
    let half = half_len(x.shape(), axis)?;
    let mut x1 = x.clone();
    x1.slice_axis_inplace(Axis(axis), Slice::from(0..half));
    let mut x2 = x.clone();
    x2.slice_axis_inplace(Axis(axis), Slice::from(half..2 * half));
    Ok((x1, x2))
}

fn concatenate_tensors<D: Dimension>(
    axis: usize,
    x1: &ArcTensor<D>,
    x2: &ArcTensor<D>,
) -> Result<ArcTensor<D>> {
    let x = ndarray::concatenate(Axis(axis), &[x1.view().into_dyn(), x2.view().into_dyn()])?;
    Ok(x.into_dimensionality()?.into_shared())
}

fn sub_tensors<D: Dimension>(a: &ArcTensor<D>, b: &ArcTensor<D>) -> Result<ArcTensor<D>> {
    ensure!(
        a.shape() == b.shape(),
        "Expected residual shape {:?}, found {:?}!",
        a.shape(),
        b.shape()
    );
    Ok((a - b).into_shared())
}

fn add_grad<D: Dimension + 'static>(grad: ArcTensor<D>, node: Option<&Node<D>>) -> ArcTensor<D> {
    match node.and_then(Node::grad) {
        Some(other) => (&grad + &other).into_shared(),
        None => grad,
    }
}

/// Reversible coupling block.
///
/// The input X is split along `split_axis` into equal halves (X1, X2):
///```text
/// Y1 = X1 + f(X2)
/// Y2 = X2 + g(Y1)
///```
/// The input can be reconstructed from the output:
///```text
/// X2 = Y2 - g(Y1)
/// X1 = Y1 - f(X2)
///```
/// `f` and `g` must preserve the shape of a half.
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct CouplingBlock<F, G> {
    #[remixer(layer)]
    f: F,
    #[remixer(layer)]
    g: G,
    split_axis: usize,
}

impl<F, G> CouplingBlock<F, G> {
    /// Creates a new [`CouplingBlock`].
    pub fn new(f: F, g: G, split_axis: usize) -> Self {
        Self { f, g, split_axis }
    }
    /// The axis the input is split along.
    pub fn split_axis(&self) -> usize {
        self.split_axis
    }
    /// The residual of the first half.
    pub fn f(&self) -> &F {
        &self.f
    }
    /// The residual of the second half.
    pub fn g(&self) -> &G {
        &self.g
    }
}

impl<F, G> CouplingBlock<F, G> {
    /// Computes the output without retaining a graph.
    pub fn forward_value<D>(&self, input: ArcTensor<D>) -> Result<ArcTensor<D>>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        let (x1, x2) = split_tensor(&input, self.split_axis)?;
        let fx2 = self.f.forward(Variable::from(x2.clone()))?.into_value();
        let y1 = residual_add(&x1, &fx2)?;
        let gy1 = self.g.forward(Variable::from(y1.clone()))?.into_value();
        let y2 = residual_add(&x2, &gy1)?;
        concatenate_tensors(self.split_axis, &y1, &y2)
    }
    /// Reconstructs the input from the `output`.
    pub fn inverse<D>(&self, output: ArcTensor<D>) -> Result<ArcTensor<D>>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        let (y1, y2) = split_tensor(&output, self.split_axis)?;
        let gy1 = self.g.forward(Variable::from(y1.clone()))?.into_value();
        let x2 = sub_tensors(&y2, &gy1)?;
        let fx2 = self.f.forward(Variable::from(x2.clone()))?.into_value();
        let x1 = sub_tensors(&y1, &fx2)?;
        concatenate_tensors(self.split_axis, &x1, &x2)
    }
    /// Reconstructs the input from the `output` and computes the input gradient from the
    /// `output_grad`.
    ///
    /// Recomputes f and g on graph leaves, accumulating the gradients of their parameters.
    /// Returns (input, input_grad).
    pub fn backward_value<D>(
        &self,
        output: ArcTensor<D>,
        output_grad: ArcTensor<D>,
    ) -> Result<(ArcTensor<D>, ArcTensor<D>)>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        ensure!(
            output.shape() == output_grad.shape(),
            "Expected output_grad shape {:?}, found {:?}!",
            output.shape(),
            output_grad.shape()
        );
        let (y1, y2) = split_tensor(&output, self.split_axis)?;
        let (dy1, dy2) = split_tensor(&output_grad, self.split_axis)?;
        let (x2, dy1) = {
            let y1 = Variable::builder().node().build(y1.clone());
            let gy1 = self.g.forward(y1.clone())?;
            let x2 = sub_tensors(&y2, gy1.value())?;
            if let Some(node) = gy1.node() {
                node.backward_grad(dy2.clone())?;
            }
            (x2, add_grad(dy1, y1.node()))
        };
        let (x1, dx2) = {
            let x2 = Variable::builder().node().build(x2.clone());
            let fx2 = self.f.forward(x2.clone())?;
            let x1 = sub_tensors(&y1, fx2.value())?;
            if let Some(node) = fx2.node() {
                node.backward_grad(dy1.clone())?;
            }
            (x1, add_grad(dy2, x2.node()))
        };
        let input = concatenate_tensors(self.split_axis, &x1, &x2)?;
        let input_grad = concatenate_tensors(self.split_axis, &dy1, &dx2)?;
        Ok((input, input_grad))
    }
}

fn residual_add<D: Dimension>(x: &ArcTensor<D>, fx: &ArcTensor<D>) -> Result<ArcTensor<D>> {
    ensure!(
        x.shape() == fx.shape(),
        "Expected residual shape {:?}, found {:?}!",
        x.shape(),
        fx.shape()
    );
    Ok((x + fx).into_shared())
}

impl<D, F, G> Forward<Variable<D>> for CouplingBlock<F, G>
where
    D: Dimension + 'static,
    F: Forward<Variable<D>, Output = Variable<D>>,
    G: Forward<Variable<D>, Output = Variable<D>>,
{
    type Output = Variable<D>;
    /// Differentiable forward, retaining the graph of f and g.
    ///
    /// See [`ReversibleSequence`] for a forward pass that does not retain the graph.
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let axis = self.split_axis;
        let half = half_len(input.shape(), axis)?;
        let x1 = input.slice_axis(axis, 0..half)?;
        let x2 = input.slice_axis(axis, half..2 * half)?;
        let fx2 = self.f.forward(x2.clone())?;
        ensure!(
            fx2.shape() == x1.shape(),
            "Expected residual shape {:?}, found {:?}!",
            x1.shape(),
            fx2.shape()
        );
        let y1 = x1.add(&fx2)?;
        let gy1 = self.g.forward(y1.clone())?;
        ensure!(
            gy1.shape() == x2.shape(),
            "Expected residual shape {:?}, found {:?}!",
            x2.shape(),
            gy1.shape()
        );
        let y2 = x2.add(&gy1)?;
        Variable::concatenate(axis, &[y1, y2])
    }
}

/// A sequence of [`CouplingBlock`]'s with a memory saving backward pass.
///
/// The forward pass does not retain the graph of the blocks. Instead, a single backward op
/// reconstructs the input of each block from its output, in reverse, recomputing the local
/// graph of one block at a time.
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct ReversibleSequence<F, G> {
    #[remixer(layer)]
    blocks: Vec<CouplingBlock<F, G>>,
}

impl<F, G> ReversibleSequence<F, G> {
    /// Creates a new [`ReversibleSequence`].
    ///
    /// **Errors**
    ///
    /// The blocks must split along the same axis.
    pub fn new(blocks: Vec<CouplingBlock<F, G>>) -> Result<Self> {
        if let Some(first) = blocks.first() {
            let axis = first.split_axis();
            for (i, block) in blocks.iter().enumerate() {
                ensure!(
                    block.split_axis() == axis,
                    "Block {i} splits along axis {}, expected {axis}!",
                    block.split_axis()
                );
            }
        }
        Ok(Self { blocks })
    }
    /// The blocks.
    pub fn blocks(&self) -> &[CouplingBlock<F, G>] {
        &self.blocks
    }
    /// The number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }
    /// Whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
    /// The split axis of the blocks, None if empty.
    pub fn split_axis(&self) -> Option<usize> {
        self.blocks.first().map(CouplingBlock::split_axis)
    }
    /// Computes the output without retaining a graph.
    pub fn forward_value<D>(&self, input: ArcTensor<D>) -> Result<ArcTensor<D>>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        self.blocks
            .iter()
            .try_fold(input, |x, block| block.forward_value(x))
    }
    /// Reconstructs the input from the `output`.
    pub fn inverse<D>(&self, output: ArcTensor<D>) -> Result<ArcTensor<D>>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        self.blocks
            .iter()
            .rev()
            .try_fold(output, |y, block| block.inverse(y))
    }
    /// Walks the blocks in reverse, see [`CouplingBlock::backward_value()`].
    ///
    /// Returns (input, input_grad).
    pub fn backward_value<D>(
        &self,
        output: ArcTensor<D>,
        output_grad: ArcTensor<D>,
    ) -> Result<(ArcTensor<D>, ArcTensor<D>)>
    where
        D: Dimension + 'static,
        F: Forward<Variable<D>, Output = Variable<D>>,
        G: Forward<Variable<D>, Output = Variable<D>>,
    {
        let len = self.blocks.len();
        self.blocks.iter().enumerate().rev().try_fold(
            (output, output_grad),
            |(y, dy), (i, block)| {
                trace!("reversible backward block {}/{len} {:?}", i + 1, y.shape());
                block.backward_value(y, dy)
            },
        )
    }
}

impl<D, F, G> Forward<Variable<D>> for ReversibleSequence<F, G>
where
    D: Dimension + 'static,
    F: Forward<Variable<D>, Output = Variable<D>> + Layer + Clone,
    G: Forward<Variable<D>, Output = Variable<D>> + Layer + Clone,
{
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        if self.blocks.is_empty() {
            return Ok(input);
        }
        let output = self.forward_value(input.value().clone())?;
        if !input.requires_grad() && !self.requires_grad() {
            return Ok(output.into());
        }
        // Parameters may require a gradient when the input does not.
        let sink;
        let node = if let Some(node) = input.node() {
            node
        } else {
            sink = Node::leaf(input.raw_dim());
            &sink
        };
        let mut builder = Variable::<D>::builder();
        let sequence = self.clone();
        let y = output.clone();
        builder.edge(node, move |output_grad| {
            let (_, input_grad) = sequence.backward_value(y, output_grad)?;
            Ok(input_grad)
        });
        Ok(builder.build(output))
    }
}

/// Duplicates the input along an axis, applies a [`ReversibleSequence`], and averages the
/// halves of the output.
///
/// The input is repeated with interleaving, ie [a, b] -> [a, a, b, b], so that the
/// sequence splits the result into [a, a] and [b, b].
#[derive(Layer, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[remixer(crate)]
pub struct DuplicatedSequence<F, G> {
    #[remixer(layer)]
    sequence: ReversibleSequence<F, G>,
    axis: usize,
}

impl<F, G> DuplicatedSequence<F, G> {
    /// Creates a new [`DuplicatedSequence`] along `axis`.
    ///
    /// **Errors**
    ///
    /// The blocks of the sequence must split along `axis`.
    pub fn new(axis: usize, sequence: ReversibleSequence<F, G>) -> Result<Self> {
        if let Some(split_axis) = sequence.split_axis() {
            ensure!(
                split_axis == axis,
                "Sequence splits along axis {split_axis}, expected {axis}!"
            );
        }
        Ok(Self { sequence, axis })
    }
    /// The reversible sequence.
    pub fn sequence(&self) -> &ReversibleSequence<F, G> {
        &self.sequence
    }
    /// The duplicated axis.
    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl<D, F, G> Forward<Variable<D>> for DuplicatedSequence<F, G>
where
    D: Dimension + 'static,
    F: Forward<Variable<D>, Output = Variable<D>> + Layer + Clone,
    G: Forward<Variable<D>, Output = Variable<D>> + Layer + Clone,
{
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let axis = self.axis;
        ensure!(
            axis < input.ndim(),
            "Can not duplicate axis {axis} of input with shape {:?}!",
            input.shape()
        );
        let len = input.shape()[axis];
        let y = input
            .repeat_interleave(axis, 2)?
            .forward(&self.sequence)?;
        let y1 = y.slice_axis(axis, 0..len)?;
        let y2 = y.slice_axis(axis, len..2 * len)?;
        Ok(y1.add(&y2)?.scale(0.5))
    }
}

#[cfg(test)]
mod tests;
