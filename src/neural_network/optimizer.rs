#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterD;
use anyhow::{bail, Result};
use ndarray::{ArrayD, ArrayViewMutD, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::any::TypeId;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Configures an [`SGD`].
    pub struct SGDBuilder {
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: None }
        }
        /// Momentum, disabled unless greater than 0.
        ///
        /// With momentum each [`Parameter`] keeps a "velocity" in its [`State`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum).filter(|m| *m > 0.),
            }
        }
        /// Finishes the builder.
        pub fn build(self) -> SGD {
            SGD {
                momentum: self.momentum,
            }
        }
    }
}
use builder::*;

/// Per parameter optimizer state, ie momentum buffers.
///
/// Attach to a parameter with [`Parameter::init_optimizer_state()`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct State {
    name: String,
    #[cfg_attr(feature = "serde", serde(skip, default = "default_type_id"))]
    id: TypeId,
    key_values: Vec<(String, ArrayD<f32>)>,
}

#[cfg(feature = "serde")]
fn default_type_id() -> TypeId {
    TypeId::of::<()>()
}

impl State {
    /// Creates a new state for `parameter`.
    ///
    /// **Errors**
    ///
    /// The shape of each value must match the shape of the parameter.
    pub fn new(
        parameter: &ParameterD,
        name: impl Into<String>,
        id: TypeId,
        key_values: Vec<(String, ArrayD<f32>)>,
    ) -> Result<Self> {
        let name = name.into();
        if let Some((key, value)) = key_values
            .iter()
            .find(|(_, value)| value.shape() != parameter.shape())
        {
            bail!(
                "Expected {name:?}.{key:?} shape {:?} to match parameter {:?}!",
                value.shape(),
                parameter.shape()
            );
        }
        Ok(Self {
            name,
            id,
            key_values,
        })
    }
    /// The name of the optimizer that created the state.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The [`TypeId`] of the optimizer, used to detect a change of optimizer.
    pub fn id(&self) -> TypeId {
        self.id
    }
    /// The named buffers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// The named buffers, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, ArrayViewMutD<f32>)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value.view_mut()))
    }
}

/// Updates parameters from their gradients.
///
/// Applied to a whole network with [`Layer::update()`](super::layer::Layer::update).
pub trait Optimizer {
    /// Steps `parameter` with `learning_rate`, taking its gradient.
    ///
    /// Parameters without a gradient are left unchanged.
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()>;
}

/// Stochastic gradient descent, with optional momentum:
///```text
/// v = momentum * v + grad
/// w -= learning_rate * v
///```
#[derive(Default, Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SGD {
    momentum: Option<f32>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// The momentum, if any.
    pub fn momentum(&self) -> Option<f32> {
        self.momentum
    }
    fn init_state(&self, parameter: &mut ParameterD) -> Result<()> {
        if let Some(state) = parameter.optimizer_state() {
            if state.id() == TypeId::of::<Self>()
                && self.momentum.is_some() == state.iter().next().is_some()
            {
                return Ok(());
            }
        }
        let mut key_values = Vec::new();
        if self.momentum.is_some() {
            key_values.push((
                "velocity".to_string(),
                ArrayD::zeros(parameter.raw_dim()),
            ));
        }
        let state = State::new(parameter, "SGD", TypeId::of::<Self>(), key_values)?;
        parameter.init_optimizer_state(state);
        Ok(())
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        self.init_state(parameter)?;
        let Some(grad) = parameter.take_grad() else {
            return Ok(());
        };
        if let Some(momentum) = self.momentum {
            let (value, state) = parameter.value_view_optimizer_state_mut();
            let Some((_, velocity)) = state.and_then(|state| state.iter_mut().next()) else {
                bail!("SGD velocity not initialized!");
            };
            Zip::from(value)
                .and(&grad)
                .and(velocity)
                .for_each(|w, dw, v| {
                    kernels::sgd_update_with_momentum(w, *dw, learning_rate, momentum, v)
                });
        } else {
            parameter
                .value_view_mut()
                .scaled_add(-learning_rate, &grad);
        }
        Ok(())
    }
}

mod kernels {
    pub fn sgd_update_with_momentum(w: &mut f32, dw: f32, lr: f32, m: f32, v: &mut f32) {
        *v = m * *v + dw;
        *w -= lr * *v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::autograd::Parameter;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn parameter_with_grad(value: ArrayD<f32>, grad: ArrayD<f32>) -> Result<ParameterD> {
        let mut parameter = Parameter::from(value);
        parameter.set_training(true);
        let variable = parameter.to_variable();
        variable.node().unwrap().backward_grad(grad.into_shared())?;
        Ok(parameter)
    }

    #[test]
    fn sgd() -> Result<()> {
        let mut parameter = parameter_with_grad(
            array![1f32, 2.].into_dyn(),
            array![0.5f32, -1.].into_dyn(),
        )?;
        SGD::default().update(0.1, &mut parameter)?;
        assert_abs_diff_eq!(
            parameter.value(),
            &array![0.95f32, 2.1].into_dyn().into_shared(),
            epsilon = 1e-6
        );
        assert!(parameter.grad().is_none());
        Ok(())
    }

    #[test]
    fn sgd_momentum() -> Result<()> {
        assert_eq!(SGD::default().momentum(), None);
        assert_eq!(SGD::builder().momentum(0.).build().momentum(), None);
        let sgd = SGD::builder().momentum(0.5).build();
        assert_eq!(sgd.momentum(), Some(0.5));
        let mut parameter = parameter_with_grad(array![1f32].into_dyn(), array![1f32].into_dyn())?;
        sgd.update(1., &mut parameter)?;
        assert_eq!(parameter.value()[[0]], 0.);
        let variable = parameter.to_variable();
        variable
            .node()
            .unwrap()
            .backward_grad(array![1f32].into_dyn().into_shared())?;
        sgd.update(1., &mut parameter)?;
        // v = 0.5 * 1 + 1
        assert_eq!(parameter.value()[[0]], -1.5);
        let state = parameter.optimizer_state().unwrap();
        assert_eq!(state.name(), "SGD");
        assert_eq!(state.iter().next().unwrap().1[[0]], 1.5);
        Ok(())
    }

    #[test]
    fn sgd_without_grad_is_noop() -> Result<()> {
        let mut parameter = Parameter::from(array![1f32, 2.].into_dyn());
        SGD::builder().momentum(0.9).build().update(0.1, &mut parameter)?;
        assert_eq!(parameter.value(), &array![1f32, 2.].into_dyn().into_shared());
        Ok(())
    }
}
