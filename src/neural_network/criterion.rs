use super::autograd::{ArcTensor, Variable, Variable0, Variable2};
use anyhow::{ensure, Result};
use ndarray::{Array, Array2, ArrayView, ArrayView1, ArrayView2, Dimension, Zip};

/// Mean cross entropy loss of logits `input` [batch_size, classes] with class indices `target`.
///
/// **Errors**
///
/// If the batch sizes do not match, the batch is empty, or a target is not less than classes.
pub fn cross_entropy_loss(input: Variable2, target: ArrayView1<usize>) -> Result<Variable0> {
    let (batch_size, classes) = input.dim();
    ensure!(
        batch_size > 0 && batch_size == target.len(),
        "Expected target of len {batch_size}, found {}!",
        target.len()
    );
    if let Some(t) = target.iter().copied().find(|t| *t >= classes) {
        anyhow::bail!("Target {t} out of range for {classes} classes!");
    }
    let target = target.to_owned();
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        let input = input.value().clone();
        let target = target.clone();
        builder.edge(node, move |output_grad: ArcTensor<ndarray::Ix0>| {
            let dy = output_grad[()];
            Ok(cross_entropy_loss_backward(input.view(), target.view(), dy).into_shared())
        });
    }
    let value = cross_entropy_loss_forward(input.value().view(), target.view());
    Ok(builder.build(Array::from_elem((), value).into_shared()))
}

fn log_softmax_row(x: ArrayView1<f32>) -> (f32, f32) {
    let m = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let s: f32 = x.iter().map(|x| (x - m).exp()).sum();
    (m, s)
}

fn cross_entropy_loss_forward(x: ArrayView2<f32>, t: ArrayView1<usize>) -> f32 {
    let mut loss = 0.;
    for (x, t) in x.outer_iter().zip(t.iter().copied()) {
        let (m, s) = log_softmax_row(x.view());
        loss += m + s.ln() - x[t];
    }
    loss / x.nrows() as f32
}

fn cross_entropy_loss_backward(x: ArrayView2<f32>, t: ArrayView1<usize>, dy: f32) -> Array2<f32> {
    let mut dx = Array::zeros(x.raw_dim());
    let scale = dy / x.nrows() as f32;
    for ((x, t), mut dx) in x
        .outer_iter()
        .zip(t.iter().copied())
        .zip(dx.outer_iter_mut())
    {
        let (m, s) = log_softmax_row(x.view());
        for (i, (x, dx)) in x.iter().copied().zip(dx.iter_mut()).enumerate() {
            let t = if i == t { 1. } else { 0. };
            *dx = scale * ((x - m).exp() / s - t);
        }
    }
    dx
}

/// Mean squared error of `input` and `target`.
///
/// **Errors**
///
/// If the shapes do not match or are empty.
pub fn mse_loss<D: Dimension + 'static>(
    input: Variable<D>,
    target: ArrayView<f32, D>,
) -> Result<Variable0> {
    ensure!(
        input.shape() == target.shape() && !target.is_empty(),
        "Expected target shape {:?}, found {:?}!",
        input.shape(),
        target.shape()
    );
    let n = target.len() as f32;
    let diff = Zip::from(input.value()).and(&target).map_collect(|x, t| x - t);
    let value = diff.iter().map(|d| d * d).sum::<f32>() / n;
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad: ArcTensor<ndarray::Ix0>| {
            let scale = 2. * output_grad[()] / n;
            Ok(diff.mapv(|d| scale * d).into_shared())
        });
    }
    Ok(builder.build(Array::from_elem((), value).into_shared()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural_network::{
        layer::Dense,
        tests::{check_gradients, random},
    };
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cross_entropy_uniform() -> Result<()> {
        let input = Variable::builder()
            .node()
            .build(Array2::<f32>::zeros([2, 4]).into_shared());
        let loss = cross_entropy_loss(input.clone(), array![1, 3].view())?;
        assert_abs_diff_eq!(loss.value()[()], 4f32.ln(), epsilon = 1e-6);
        loss.backward()?;
        let dx = input.node().unwrap().grad().unwrap();
        assert_abs_diff_eq!(dx[[0, 0]], 0.125, epsilon = 1e-6);
        assert_abs_diff_eq!(dx[[0, 1]], -0.375, epsilon = 1e-6);
        assert_abs_diff_eq!(dx.sum(), 0., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn cross_entropy_gradients() -> Result<()> {
        let classes = array![2, 0, 1];
        check_gradients(
            &mut Vec::<Dense>::new(),
            random([3, 4]).mapv(|x| 2. * x),
            |_, x: Variable2| cross_entropy_loss(x, classes.view()),
        )
    }

    #[test]
    fn cross_entropy_target_out_of_range() {
        let input = Variable::from(Array2::<f32>::zeros([1, 3]));
        assert!(cross_entropy_loss(input, array![3].view()).is_err());
    }

    #[test]
    fn mse() -> Result<()> {
        let input = Variable::builder()
            .node()
            .build(array![1f32, 2., 3., 4.].into_shared());
        let target = array![1f32, 0., 3., 2.];
        let loss = mse_loss(input.clone(), target.view())?;
        assert_abs_diff_eq!(loss.value()[()], 2., epsilon = 1e-6);
        loss.backward()?;
        assert_abs_diff_eq!(
            input.node().unwrap().grad().unwrap(),
            array![0f32, 1., 0., 1.].into_shared(),
            epsilon = 1e-6
        );
        Ok(())
    }
}
