use super::{layer::Forward, optimizer::State as OptimizerState};
use anyhow::{ensure, Error, Result};
use ndarray::{
    linalg::Dot, ArcArray, Array, ArrayD, ArrayViewMut, Axis, Dimension, IntoDimension, Ix0, Ix1,
    Ix2, Ix3, Ix4, IxDyn, Slice,
};
use parking_lot::{Mutex, RwLock};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    ops::Range,
    sync::{Arc, Weak},
};

/// Shared f32 tensor.
///
/// Clones share the same buffer, mutation copies on write.
pub type ArcTensor<D> = ArcArray<f32, D>;
/// ArcTensor with 1 element.
pub type ArcTensor0 = ArcTensor<Ix0>;
/// ArcTensor with 1 dimension.
pub type ArcTensor1 = ArcTensor<Ix1>;
/// ArcTensor with 2 dimensions.
pub type ArcTensor2 = ArcTensor<Ix2>;
/// ArcTensor with 3 dimensions.
pub type ArcTensor3 = ArcTensor<Ix3>;
/// ArcTensor with 4 dimensions.
pub type ArcTensor4 = ArcTensor<Ix4>;
/// ArcTensor with dynamic dimensions.
pub type ArcTensorD = ArcTensor<IxDyn>;

type GradLock = Arc<RwLock<Option<ArcTensorD>>>;

/// Reshapes `tensor` in row major order, copying if it is not in standard layout.
pub(crate) fn reshape<D: Dimension, E: IntoDimension>(
    tensor: ArcTensor<D>,
    shape: E,
) -> Result<ArcTensor<E::Dim>> {
    let dim = shape.into_dimension();
    if tensor.is_standard_layout() {
        Ok(tensor.into_shape(dim)?)
    } else {
        Ok(tensor
            .as_standard_layout()
            .into_owned()
            .into_shape(dim)?
            .into_shared())
    }
}

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use remixer::neural_network::autograd::{ArcTensor2, Variable, Variable2};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // input gradient as a function of the output gradient
    ///     builder.edge(node, |output_grad: ArcTensor2| -> Result<ArcTensor2> { todo!() });
    /// }
    /// let output_value: ArcTensor2 = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added. Used to make a leaf that
        /// collects a gradient, ie when recomputing part of a graph.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(GradLock::default());
            }
            self
        }
        /// Adds an edge.
        ///
        /// `f` maps the output gradient to a gradient for `node` when the graph is walked
        /// backward. Gradients arriving at `node` from several edges are summed, and `node`
        /// only propagates further after its last incoming edge has run.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcTensor<D>) -> Result<ArcTensor<D2>> + Send + Sync + 'static,
        {
            let mut output_grad_lock = Some(self.grad.get_or_insert_with(GradLock::default).clone());
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let Some(grad) = grad else {
                        return Ok(());
                    };
                    let grad = (f)(grad.into_dimensionality()?)?;
                    assert_eq!(grad.shape(), dim.slice(), "{name}");
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcTensor<D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Holds the gradient of a variable. Edges added with [`VariableBuilder::edge()`] link
/// nodes into the graph walked by [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension + 'static> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// A node without edges, collecting the gradient of a tensor with `dim`.
    pub fn leaf(dim: D) -> Self {
        Self::new(dim.into_dyn(), GradLock::default(), Vec::new())
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, seeding the gradient with ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcTensor::ones(self.inner.dim.clone()).into_dimensionality::<D>()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the gradient of this node was already computed.
    pub fn backward_grad(&self, grad: ArcTensor<D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "Expected grad shape {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node.clone())
                }
            }
        }
        Ok(())
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// A tensor paired with an optional [`Node`]. Ops on a variable that has a node record
/// edges, and the backward pass follows them to produce gradients. Without a node the
/// variable is a constant and nothing is recorded.
///
/// Tensors convert into constant variables with [`From`]. New ops are written with
/// [`builder()`](Variable::builder).
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcTensor<D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with any number of dimensions.
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension + 'static> Variable<D> {
    /// Starts a new output variable.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Unwraps the value, dropping the node.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Whether a gradient will be computed for this variable.
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }
    /// Same as `f.forward(self)`, for chaining.
    pub fn forward<F: Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The number of dimensions.
    pub fn ndim(&self) -> usize {
        self.value.ndim()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Casts to `D2`, failing if the number of axes differs.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>>
    where
        D2: Dimension + 'static,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Casts to [`IxDyn`].
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dimensionality),
        }
    }
    /// Converts into `shape`, in row major order.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::<E::Dim>::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| reshape(output_grad, dim));
        }
        Ok(builder.build(reshape(self.value, shape)?))
    }
    /// Reorders the axes, output axis `i` is input axis `axes[i]`.
    pub fn permuted_axes<A>(self, axes: A) -> Self
    where
        A: IntoDimension<Dim = D>,
    {
        let mut builder = Self::builder();
        let axes = axes.into_dimension();
        let mut input_axes = D::zeros(axes.ndim());
        for (i, a) in axes.slice().iter().copied().enumerate() {
            input_axes[a] = i;
        }
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.permuted_axes(input_axes))
            })
        }
        builder.build(self.value.permuted_axes(axes))
    }
    /// Swaps axes `a` and `b`.
    pub fn swap_axes(self, a: usize, b: usize) -> Result<Self> {
        let ndim = self.ndim();
        ensure!(
            a < ndim && b < ndim,
            "Can not swap axes {a} and {b} of variable with shape {:?}!",
            self.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |mut output_grad| {
                output_grad.swap_axes(a, b);
                Ok(output_grad)
            })
        }
        let mut value = self.value;
        value.swap_axes(a, b);
        Ok(builder.build(value))
    }
    /// Reverses the order of the axes.
    pub fn reversed_axes(self) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, |output_grad| Ok(output_grad.reversed_axes()));
        }
        builder.build(self.value.reversed_axes())
    }
    /// Transposes the variable.
    pub fn t(&self) -> Self {
        self.clone().reversed_axes()
    }
    /// Adds `rhs`, broadcasting it to the shape of `self`.
    ///
    /// **Errors**
    ///
    /// If `rhs` can not be broadcast to `self`.
    pub fn add<D2>(&self, rhs: &Variable<D2>) -> Result<Self>
    where
        D2: Dimension + 'static,
    {
        let Some(rhs_value) = rhs.value.broadcast(self.raw_dim()) else {
            anyhow::bail!(
                "Can not broadcast {:?} -> {:?}!",
                rhs.shape(),
                self.shape()
            );
        };
        let mut value = self.value.to_owned();
        value += &rhs_value;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| broadcast_backward(output_grad, dim));
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Multiplies by `alpha`.
    pub fn scale(&self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok((&output_grad * alpha).into_shared())
            });
        }
        builder.build((&self.value * alpha).into_shared())
    }
    /// Slices `range` along `axis`.
    pub fn slice_axis(&self, axis: usize, range: Range<usize>) -> Result<Self> {
        ensure!(
            axis < self.ndim() && range.start <= range.end && range.end <= self.shape()[axis],
            "Can not slice {range:?} along axis {axis} of variable with shape {:?}!",
            self.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            let range = range.clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = Array::zeros(dim);
                input_grad
                    .slice_axis_mut(Axis(axis), Slice::from(range))
                    .assign(&output_grad);
                Ok(input_grad.into_shared())
            });
        }
        let mut value = self.value.clone();
        value.slice_axis_inplace(Axis(axis), Slice::from(range));
        Ok(builder.build(value))
    }
    /// Concatenates `variables` along `axis`.
    ///
    /// **Errors**
    ///
    /// If `variables` is empty or the shapes differ along any other axis.
    pub fn concatenate(axis: usize, variables: &[Self]) -> Result<Self> {
        ensure!(!variables.is_empty(), "Can not concatenate 0 variables!");
        let views: Vec<_> = variables.iter().map(|x| x.value.view().into_dyn()).collect();
        let value = ndarray::concatenate(Axis(axis), &views)?.into_dimensionality::<D>()?;
        let mut builder = Self::builder();
        let mut offset = 0;
        for variable in variables {
            let len = variable.shape()[axis];
            if let Some(node) = variable.node() {
                let range = offset..offset + len;
                builder.edge(node, move |mut output_grad| {
                    output_grad.slice_axis_inplace(Axis(axis), Slice::from(range));
                    Ok(output_grad)
                });
            }
            offset += len;
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Repeats each element `repeats` times along `axis`, ie [a, b] -> [a, a, b, b].
    pub fn repeat_interleave(&self, axis: usize, repeats: usize) -> Result<Self> {
        ensure!(
            axis < self.ndim() && repeats > 0,
            "Can not repeat {repeats} times along axis {axis} of variable with shape {:?}!",
            self.shape()
        );
        let mut expanded_shape = self.shape().to_vec();
        expanded_shape.insert(axis + 1, repeats);
        let expanded_dim = IxDyn(&expanded_shape);
        let mut output_dim = self.raw_dim();
        output_dim[axis] *= repeats;
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let expanded_dim = expanded_dim.clone();
            builder.edge(node, move |output_grad| {
                let input_grad = reshape(output_grad, expanded_dim)?.sum_axis(Axis(axis + 1));
                Ok(input_grad.into_dimensionality::<D>()?.into_shared())
            });
        }
        let expanded = self
            .value
            .view()
            .into_dyn()
            .insert_axis(Axis(axis + 1))
            .broadcast(expanded_dim)
            .ok_or_else(|| Error::msg("repeat_interleave broadcast failed!"))?
            .to_owned()
            .into_shared();
        Ok(builder.build(reshape(expanded, output_dim)?))
    }
    /// Mean along `axis`, removing it.
    pub fn mean_axis(&self, axis: usize) -> Result<Variable<D::Smaller>> {
        ensure!(
            axis < self.ndim() && self.shape()[axis] > 0,
            "Can not take the mean along axis {axis} of variable with shape {:?}!",
            self.shape()
        );
        let n = self.shape()[axis] as f32;
        let value = self
            .value
            .view()
            .into_dyn()
            .mean_axis(Axis(axis))
            .ok_or_else(|| Error::msg("mean_axis of empty axis!"))?
            .into_dimensionality::<D::Smaller>()?;
        let mut builder = Variable::<D::Smaller>::builder();
        if let Some(node) = self.node() {
            let input_dim = self.raw_dim().into_dyn();
            builder.edge(node, move |output_grad: ArcTensor<D::Smaller>| {
                let output_grad = output_grad.into_dyn().insert_axis(Axis(axis));
                let input_grad = output_grad
                    .broadcast(input_dim)
                    .ok_or_else(|| Error::msg("mean_axis backward broadcast failed!"))?
                    .map(|dy| dy / n);
                Ok(input_grad.into_dimensionality::<D>()?.into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

fn broadcast_backward<D1: Dimension, D2: Dimension>(
    grad: ArcTensor<D1>,
    dim: D2,
) -> Result<ArcTensor<D2>> {
    let mut grad: ArrayD<f32> = grad.into_dyn().into_owned();
    while grad.ndim() > dim.ndim() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, n) in dim.slice().iter().copied().enumerate() {
        if n == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    ensure!(
        grad.shape() == dim.slice(),
        "Broadcast backward {:?} -> {:?} failed!",
        grad.shape(),
        dim.slice()
    );
    Ok(grad.into_dimensionality()?.into_shared())
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

impl Dot<Self> for Variable2 {
    type Output = Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        ensure!(
            lhs.shape()[1] == rhs.shape()[0],
            "Can not multiply {:?} x {:?}!",
            lhs.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(tensor: Array<f32, D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Variable<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            node: None,
        }
    }
}

/// Parameter.
///
/// A trainable tensor, stepped by an [`Optimizer`](super::optimizer::Optimizer).
/// [`.to_variable()`](Parameter::to_variable) lifts it into ops. After
/// [`.set_training(true)`](Parameter::set_training) that variable carries a [`Node`] feeding
/// the gradient of the parameter. Clones share the gradient.
#[derive(Clone)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))
)]
pub struct Parameter<D: Dimension> {
    value: ArcTensor<D>,
    #[cfg_attr(feature = "serde", serde(skip))]
    grad: Option<GradLock>,
    #[cfg_attr(
        feature = "serde",
        serde(skip_serializing_if = "Option::is_none", default)
    )]
    optimizer_state: Option<Arc<OptimizerState>>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension + 'static> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Borrows the value mutably, copying it if it is shared.
    pub fn value_view_mut(&mut self) -> ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// Takes the gradient, leaving `None`.
    pub fn take_grad(&mut self) -> Option<ArcTensor<D>> {
        self.grad
            .as_ref()?
            .write()
            .take()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Whether training is enabled.
    pub fn requires_grad(&self) -> bool {
        self.grad.is_some()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(GradLock::default());
        } else if !training {
            self.grad = None;
        }
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optimizer_state.as_deref()
    }
    /// Borrows the optimizer state mutably, copying it if it is shared.
    pub fn optimizer_state_mut(&mut self) -> Option<&mut OptimizerState> {
        self.optimizer_state.as_mut().map(Arc::make_mut)
    }
    /// Replaces the optimizer state.
    pub fn init_optimizer_state(&mut self, state: OptimizerState) {
        self.optimizer_state.replace(Arc::new(state));
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_optimizer_state_mut(
        &mut self,
    ) -> (ArrayViewMut<f32, D>, Option<&mut OptimizerState>) {
        (
            self.value.view_mut(),
            self.optimizer_state.as_mut().map(Arc::make_mut),
        )
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Casts to `D2`, failing if the number of axes differs.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
            optimizer_state: self.optimizer_state,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optimizer_state: self.optimizer_state,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(tensor: Array<f32, D>) -> Self {
        Self::from(tensor.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Parameter<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            grad: None,
            optimizer_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.value.shape())
            .field("training", &self.grad.is_some())
            .field("optimizer_state", &self.optimizer_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn leaf<D: Dimension + 'static>(value: Array<f32, D>) -> Variable<D> {
        Variable::builder().node().build(value.into_shared())
    }

    #[test]
    fn dot_backward() -> Result<()> {
        let x = leaf(array![[1f32, 2.], [3., 4.]]);
        let w = leaf(array![[1f32, 0., -1.], [2., 1., 0.]]);
        let y = x.dot(&w)?;
        y.node().unwrap().backward()?;
        let dx = x.node().unwrap().grad().unwrap();
        let dw = w.node().unwrap().grad().unwrap();
        assert_eq!(dx, array![[0f32, 3.], [0., 3.]]);
        assert_eq!(dw, array![[4f32, 4., 4.], [6., 6., 6.]]);
        Ok(())
    }

    #[test]
    fn add_broadcast_backward() -> Result<()> {
        let x = leaf(Array2::<f32>::zeros([3, 2]));
        let b = leaf(array![1f32, 2.]);
        let y = x.add(&b)?;
        assert_eq!(y.value(), &array![[1f32, 2.], [1., 2.], [1., 2.]].into_shared());
        y.node().unwrap().backward()?;
        assert_eq!(b.node().unwrap().grad().unwrap(), array![3f32, 3.]);
        assert_eq!(x.node().unwrap().grad().unwrap(), Array2::ones([3, 2]));
        Ok(())
    }

    #[test]
    fn add_broadcast_error() {
        let x = Variable::from(Array2::<f32>::zeros([3, 2]));
        let b = Variable::from(array![1f32, 2., 3.]);
        assert!(x.add(&b).is_err());
    }

    #[test]
    fn repeat_interleave() -> Result<()> {
        let x = leaf(array![[1f32, 2., 3.]]);
        let y = x.repeat_interleave(1, 2)?;
        assert_eq!(y.value(), &array![[1f32, 1., 2., 2., 3., 3.]].into_shared());
        let dy = array![[1f32, 2., 3., 4., 5., 6.]].into_shared();
        y.node().unwrap().backward_grad(dy)?;
        assert_eq!(x.node().unwrap().grad().unwrap(), array![[3f32, 7., 11.]]);
        Ok(())
    }

    #[test]
    fn slice_concatenate() -> Result<()> {
        let x = leaf(array![[1f32, 2., 3., 4.], [5., 6., 7., 8.]]);
        let a = x.slice_axis(1, 0..2)?;
        let b = x.slice_axis(1, 2..4)?;
        let y = Variable::concatenate(1, &[b, a])?;
        assert_eq!(
            y.value(),
            &array![[3f32, 4., 1., 2.], [7., 8., 5., 6.]].into_shared()
        );
        let dy = array![[1f32, 2., 3., 4.], [5., 6., 7., 8.]].into_shared();
        y.node().unwrap().backward_grad(dy)?;
        assert_eq!(
            x.node().unwrap().grad().unwrap(),
            array![[3f32, 4., 1., 2.], [7., 8., 5., 6.]]
        );
        Ok(())
    }

    #[test]
    fn mean_axis_swap_reshape() -> Result<()> {
        let x = leaf(Array::from_shape_vec([2, 3], vec![1f32, 2., 3., 4., 5., 6.])?);
        let y = x.clone().swap_axes(0, 1)?.into_shape([6])?;
        assert_eq!(y.value(), &array![1f32, 4., 2., 5., 3., 6.].into_shared());
        let z = y.into_shape([3, 2])?.mean_axis(1)?;
        assert_abs_diff_eq!(z.value(), &array![2.5f32, 3.5, 4.5].into_shared());
        z.node().unwrap().backward_grad(array![2f32, 4., 6.].into_shared())?;
        assert_eq!(
            x.node().unwrap().grad().unwrap(),
            array![[1f32, 2., 3.], [1., 2., 3.]]
        );
        Ok(())
    }

    #[test]
    fn shared_node_accumulates() -> Result<()> {
        let x = leaf(array![1f32, 2.]);
        let y = x.add(&x.scale(3.))?;
        y.node().unwrap().backward()?;
        assert_eq!(x.node().unwrap().grad().unwrap(), array![4f32, 4.]);
        Ok(())
    }

    #[test]
    fn parameter_grad_shared_by_clones() -> Result<()> {
        let mut parameter = Parameter::from(array![1f32, 2.]);
        parameter.set_training(true);
        let clone = parameter.clone();
        let y = clone.to_variable().scale(2.);
        y.node().unwrap().backward()?;
        assert_eq!(parameter.grad().unwrap(), array![2f32, 2.]);
        assert_eq!(parameter.take_grad().unwrap(), array![2f32, 2.]);
        assert!(parameter.grad().is_none());
        parameter.set_training(false);
        assert!(!parameter.to_variable().requires_grad());
        Ok(())
    }
}
