use super::*;
use crate::neural_network::{
    autograd::{ArcTensorD, Variable3},
    layer::Activation,
    mixing::{ElementWiseMLP, MixerMLP},
    tests::{check_gradients, random},
};
use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::array;

type MixerBlock = CouplingBlock<MixerMLP, ElementWiseMLP>;
type MixerSequence = ReversibleSequence<MixerMLP, ElementWiseMLP>;

fn mixer_block(num_patch: usize, dim: usize) -> Result<MixerBlock> {
    Ok(CouplingBlock::new(
        MixerMLP::new(num_patch, Activation::Gelu)?,
        ElementWiseMLP::new(dim, Activation::Gelu)?,
        2,
    ))
}

fn mixer_sequence(len: usize, num_patch: usize, dim: usize) -> Result<MixerSequence> {
    let blocks = (0..len)
        .map(|_| mixer_block(num_patch, dim))
        .collect::<Result<Vec<_>>>()?;
    ReversibleSequence::new(blocks)
}

fn take_grads<L: Layer>(layer: &mut L) -> Vec<ArcTensorD> {
    layer
        .parameters_mut()
        .into_iter()
        .map(|parameter| parameter.take_grad().unwrap())
        .collect()
}

#[test]
fn coupling_block_inverse() -> Result<()> {
    let block = mixer_block(4, 8)?;
    let x = random([2, 4, 16]).into_shared();
    let y = block.forward_value(x.clone())?;
    assert_eq!(y.shape(), x.shape());
    let y_graph = Variable3::from(x.clone()).forward(&block)?.into_value();
    assert_abs_diff_eq!(y_graph, y, epsilon = 1e-5);
    assert_abs_diff_eq!(block.inverse(y)?, x, epsilon = 1e-5);
    Ok(())
}

#[test]
fn coupling_block_halves() -> Result<()> {
    let block = mixer_block(4, 8)?;
    assert_eq!(block.split_axis(), 2);
    let x = random([2, 4, 16]).into_shared();
    let (x1, x2) = split_tensor(&x, 2)?;
    let y = block.forward_value(x)?;
    let (y1, y2) = split_tensor(&y, 2)?;
    let f_x2 = Variable3::from(x2.clone()).forward(block.f())?.into_value();
    assert_abs_diff_eq!(y1, (&x1 + &f_x2).into_shared(), epsilon = 1e-5);
    let g_y1 = Variable3::from(y1).forward(block.g())?.into_value();
    assert_abs_diff_eq!(y2, (&x2 + &g_y1).into_shared(), epsilon = 1e-5);
    Ok(())
}

#[test]
fn sequence_inverse() -> Result<()> {
    for len in [1, 3, 8] {
        let sequence = mixer_sequence(len, 4, 8)?;
        assert_eq!(sequence.len(), len);
        let x = random([2, 4, 16]).into_shared();
        let y = sequence.forward_value(x.clone())?;
        assert_abs_diff_eq!(sequence.inverse(y)?, x, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn empty_sequence_is_identity() -> Result<()> {
    let sequence = MixerSequence::new(Vec::new())?;
    assert!(sequence.is_empty());
    assert_eq!(sequence.split_axis(), None);
    let x = random([1, 4, 8]).into_shared();
    let y = Variable3::from(x.clone()).forward(&sequence)?;
    assert_eq!(y.value(), &x);
    assert_eq!(sequence.inverse(x.clone())?, x);
    Ok(())
}

#[test]
fn mismatched_split_axis() -> Result<()> {
    let blocks = vec![
        mixer_block(4, 8)?,
        CouplingBlock::new(
            MixerMLP::new(4, Activation::Gelu)?,
            ElementWiseMLP::new(8, Activation::Gelu)?,
            1,
        ),
    ];
    assert!(ReversibleSequence::new(blocks).is_err());
    Ok(())
}

#[test]
fn odd_split_length() -> Result<()> {
    let block = mixer_block(4, 4)?;
    let x = random([1, 4, 7]).into_shared();
    assert!(block.forward_value(x.clone()).is_err());
    assert!(block.inverse(x.clone()).is_err());
    assert!(Variable3::from(x.clone()).forward(&block).is_err());
    let sequence = ReversibleSequence::new(vec![block])?;
    assert!(Variable3::from(x).forward(&sequence).is_err());
    Ok(())
}

#[test]
fn residual_error_propagates() -> Result<()> {
    // g normalizes 3 features but the halves have 4.
    let block = CouplingBlock::new(
        MixerMLP::new(2, Activation::Gelu)?,
        ElementWiseMLP::new(3, Activation::Gelu)?,
        2,
    );
    let x = random([1, 2, 8]).into_shared();
    assert!(block.forward_value(x.clone()).is_err());
    assert!(Variable3::from(x.clone()).forward(&block).is_err());
    let sequence = ReversibleSequence::new(vec![block])?;
    assert!(Variable3::from(x).forward(&sequence).is_err());
    Ok(())
}

#[test]
fn duplicated_empty_averages_neighbors() -> Result<()> {
    let duplicated = DuplicatedSequence::new(2, MixerSequence::new(Vec::new())?)?;
    let x = array![[[1f32, 2., 4.]]];
    let y = Variable3::from(x).forward(&duplicated)?;
    assert_abs_diff_eq!(
        y.into_value(),
        array![[[1.5f32, 2.5, 3.]]].into_shared(),
        epsilon = 1e-6
    );
    Ok(())
}

#[test]
fn duplicated_shape() -> Result<()> {
    let duplicated = DuplicatedSequence::new(2, mixer_sequence(2, 4, 8)?)?;
    assert_eq!(duplicated.axis(), 2);
    assert_eq!(duplicated.sequence().len(), 2);
    let y = Variable3::from(random([2, 4, 8])).forward(&duplicated)?;
    assert_eq!(y.shape(), [2, 4, 8]);
    assert!(y.node().is_none());
    Ok(())
}

#[test]
fn duplicated_axis_mismatch() -> Result<()> {
    assert!(DuplicatedSequence::new(1, mixer_sequence(1, 4, 8)?).is_err());
    let duplicated = DuplicatedSequence::new(3, MixerSequence::new(Vec::new())?)?;
    assert!(Variable3::from(random([1, 4, 8])).forward(&duplicated).is_err());
    Ok(())
}

#[test]
fn duplicated_gradients() -> Result<()> {
    let mut duplicated = DuplicatedSequence::new(2, mixer_sequence(1, 4, 4)?)?;
    check_gradients(&mut duplicated, random([1, 4, 4]), |layer, x: Variable3| {
        layer.forward(x)
    })
}

#[test]
fn reversible_gradients_match_graph() -> Result<()> {
    let mut sequence = mixer_sequence(3, 4, 4)?;
    sequence.set_training(true);
    let x = random([2, 4, 8]).into_shared();

    let input = Variable::builder().node().build(x.clone());
    let output = input.clone().forward(&sequence)?;
    let w = random(output.raw_dim()).into_shared();
    output.node().unwrap().backward_grad(w.clone())?;
    let input_grad = input.node().unwrap().grad().unwrap();
    let parameter_grads = take_grads(&mut sequence);

    let graph_input = Variable::builder().node().build(x);
    let graph_output = sequence
        .blocks()
        .iter()
        .try_fold(graph_input.clone(), |x, block| block.forward(x))?;
    assert_abs_diff_eq!(graph_output.value(), output.value(), epsilon = 1e-5);
    graph_output.node().unwrap().backward_grad(w)?;
    assert_relative_eq!(
        input_grad,
        graph_input.node().unwrap().grad().unwrap(),
        epsilon = 1e-4,
        max_relative = 1e-3
    );
    let graph_parameter_grads = take_grads(&mut sequence);
    assert_eq!(parameter_grads.len(), graph_parameter_grads.len());
    for (grad, graph_grad) in parameter_grads.iter().zip(graph_parameter_grads.iter()) {
        assert_relative_eq!(grad, graph_grad, epsilon = 1e-4, max_relative = 1e-3);
    }
    Ok(())
}

#[test]
fn reversible_parameter_gradients_without_input_node() -> Result<()> {
    let mut sequence = mixer_sequence(2, 4, 4)?;
    sequence.set_training(true);
    let x = random([1, 4, 8]).into_shared();

    let output = Variable3::from(x.clone()).forward(&sequence)?;
    let w = random(output.raw_dim()).into_shared();
    output.node().unwrap().backward_grad(w.clone())?;
    let parameter_grads = take_grads(&mut sequence);

    let graph_output = sequence
        .blocks()
        .iter()
        .try_fold(Variable3::from(x), |x, block| block.forward(x))?;
    graph_output.node().unwrap().backward_grad(w)?;
    let graph_parameter_grads = take_grads(&mut sequence);
    for (grad, graph_grad) in parameter_grads.iter().zip(graph_parameter_grads.iter()) {
        assert_relative_eq!(grad, graph_grad, epsilon = 1e-4, max_relative = 1e-3);
    }
    Ok(())
}

#[test]
fn no_grad_output_is_constant() -> Result<()> {
    let sequence = mixer_sequence(2, 4, 4)?;
    assert!(!sequence.requires_grad());
    let output = Variable3::from(random([1, 4, 8])).forward(&sequence)?;
    assert!(output.node().is_none());
    Ok(())
}
