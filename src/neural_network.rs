/*!
# Reversible networks
[`ReversibleSequence`](reversible::ReversibleSequence) chains
[`CouplingBlock`](reversible::CouplingBlock)'s. Any pair of layers mapping a half of the input
to a tensor of the same shape can be coupled:
```
use remixer::neural_network::{
    autograd::Variable3,
    layer::Activation,
    mixing::{ElementWiseMLP, MixerMLP},
    reversible::{CouplingBlock, DuplicatedSequence, ReversibleSequence},
};
# fn main() -> anyhow::Result<()> {
let blocks = (0..2)
    .map(|_| {
        let f = MixerMLP::new(4, Activation::Gelu)?;
        let g = ElementWiseMLP::new(8, Activation::Gelu)?;
        Ok(CouplingBlock::new(f, g, 2))
    })
    .collect::<anyhow::Result<Vec<_>>>()?;
let mixer = DuplicatedSequence::new(2, ReversibleSequence::new(blocks)?)?;
let x = Variable3::from(ndarray::Array::<f32, _>::zeros([1, 4, 8]));
let y = x.forward(&mixer)?;
assert_eq!(y.shape(), [1, 4, 8]);
# Ok(())
# }
```
*/

/// Variables and Parameters.
pub mod autograd;
/// Loss functions.
pub mod criterion;
/// Layers.
pub mod layer;
/// Token and channel mixing layers.
pub mod mixing;
/// Models.
pub mod model;
/// Optimizers.
pub mod optimizer;
/// Image / patch adapters.
pub mod patch;
/// Reversible blocks and sequences.
pub mod reversible;
