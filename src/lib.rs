/*!
# remixer
Reversible MLP-mixer networks.

A reversible coupling block computes its input from its output, so the backward pass
does not need to keep the activations of every block. Instead, each block recomputes its
input and a local graph while walking the stack in reverse, bounding the extra memory of a
deep stack to that of one block.

```no_run
# fn main() -> anyhow::Result<()> {
use remixer::neural_network::{
    autograd::Variable,
    criterion::cross_entropy_loss,
    layer::Layer,
    model::ReMixerImageClassificator,
    optimizer::SGD,
};
use ndarray::{Array, Array1};

let mut model = ReMixerImageClassificator::builder()
    .image_size(32)
    .patch_size(8)
    .dim(64)
    .num_layers(4)
    .build()?;
model.set_training(true);
let optimizer = SGD::builder().momentum(0.9).build();
let images = Array::<f32, _>::zeros([8, 3, 32, 32]);
let classes = Array1::<usize>::zeros(8);
let logits = Variable::from(images).forward(&model)?;
let loss = cross_entropy_loss(logits, classes.view())?;
loss.backward()?;
model.update(0.01, &optimizer)?;
# Ok(())
# }
```

# Logging
The library logs through [`log`](https://docs.rs/log). Models log their configuration at `debug`
level when built, and the reversible backward pass traces each block at `trace` level.
*/

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]

/// Neural networks.
pub mod neural_network;
