use super::*;
use crate::neural_network::{
    autograd::{Variable2, Variable3},
    tests::{check_gradients, random},
};
use approx::assert_abs_diff_eq;

#[test]
fn dense_shape() -> Result<()> {
    let dense = Dense::builder().inputs(5).outputs(3).bias(true).build()?;
    assert_eq!(dense.parameters_len(), 2);
    let y = Variable3::from(random([2, 4, 5])).forward(&dense)?;
    assert_eq!(y.shape(), [2, 4, 3]);
    assert!(Variable2::from(random([2, 4])).forward(&dense).is_err());
    let dense = Dense::builder().inputs(5).outputs(3).build()?;
    assert_eq!(dense.parameters_len(), 1);
    assert!(dense.bias().is_none());
    Ok(())
}

#[test]
fn dense_invalid() {
    assert!(Dense::builder().inputs(0).outputs(3).build().is_err());
}

#[test]
fn dense_gradients() -> Result<()> {
    let mut dense = Dense::builder().inputs(3).outputs(2).bias(true).build()?;
    check_gradients(&mut dense, random([2, 2, 3]), |dense, x: Variable3| {
        dense.forward(x)
    })
}

#[test]
fn pointwise_conv() -> Result<()> {
    let conv = PointwiseConv::new(3, 2)?;
    let x = random([2, 3, 4, 5]);
    let y = Variable4::from(x.clone()).forward(&conv)?;
    assert_eq!(y.shape(), [2, 2, 4, 5]);
    let weight = conv.dense.weight().value().clone().into_dimensionality::<Ix2>()?;
    let pixel = x.slice(ndarray::s![1, .., 2, 3]);
    let expected = weight.dot(&pixel);
    let actual = y.value().slice(ndarray::s![1, .., 2, 3]).to_owned();
    assert_abs_diff_eq!(actual, expected, epsilon = 1e-5);
    Ok(())
}

#[test]
fn pointwise_conv_gradients() -> Result<()> {
    let mut conv = PointwiseConv::new(2, 3)?;
    check_gradients(&mut conv, random([1, 2, 2, 2]), |conv, x: Variable4| {
        conv.forward(x)
    })
}

#[test]
fn layer_norm_normalizes() -> Result<()> {
    let norm = LayerNorm::new([2, 3])?;
    let x = random([4, 2, 3]).mapv(|x| 3. * x + 1.);
    let y = Variable3::from(x).forward(&norm)?;
    for sample in y.value().outer_iter() {
        let mean = sample.sum() / 6.;
        let var = sample.iter().map(|y| (y - mean) * (y - mean)).sum::<f32>() / 6.;
        assert_abs_diff_eq!(mean, 0., epsilon = 1e-5);
        assert_abs_diff_eq!(var, 1., epsilon = 1e-3);
    }
    assert!(Variable3::from(random([4, 3, 2])).forward(&norm).is_err());
    Ok(())
}

#[test]
fn layer_norm_gradients() -> Result<()> {
    let mut norm = LayerNorm::new(4)?;
    // non trivial affine
    for parameter in norm.parameters_mut() {
        let noise = random(parameter.raw_dim());
        parameter.value_view_mut().zip_mut_with(&noise, |x, n| *x += 0.5 * n);
    }
    check_gradients(&mut norm, random([3, 4]), |norm, x: Variable2| {
        norm.forward(x)
    })
}

#[test]
fn activations() -> Result<()> {
    let x = Variable2::from(ndarray::array![[-1f32, 0., 2.]]);
    let relu = x.clone().forward(&Activation::Relu)?;
    assert_eq!(relu.value(), &ndarray::array![[0f32, 0., 2.]].into_shared());
    let leaky = x.clone().forward(&Activation::LeakyRelu)?;
    assert_abs_diff_eq!(
        leaky.value(),
        &ndarray::array![[-0.2f32, 0., 2.]].into_shared(),
        epsilon = 1e-6
    );
    let gelu = x.forward(&Activation::Gelu)?;
    assert_abs_diff_eq!(
        gelu.value(),
        &ndarray::array![[-0.158_808f32, 0., 1.954_597]].into_shared(),
        epsilon = 1e-4
    );
    Ok(())
}

#[test]
fn gelu_gradients() -> Result<()> {
    let mut gelu = Activation::Gelu;
    check_gradients(&mut gelu, random([3, 5]).mapv(|x| 3. * x), |gelu, x: Variable2| {
        gelu.forward(x)
    })
}

#[test]
fn parse_tags() {
    assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
    assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
    assert_eq!(
        "leakyrelu".parse::<Activation>().unwrap(),
        Activation::LeakyRelu
    );
    assert_eq!(Activation::default().to_string(), "gelu");
    let error = "swish".parse::<Activation>().unwrap_err();
    assert_eq!(error.tag(), "swish");
    assert!(error.to_string().contains("leakyrelu"));
    assert_eq!("layernorm".parse::<Norm>().unwrap(), Norm::LayerNorm);
    assert!("batchnorm".parse::<Norm>().is_err());
}

#[test]
fn training_vec() -> Result<()> {
    let mut layers = (0..3)
        .map(|_| Dense::builder().inputs(2).outputs(2).bias(true).build())
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(layers.parameters_len(), 6);
    assert!(!layers.requires_grad());
    layers.set_training(true);
    assert!(layers.parameters().iter().all(|p| p.requires_grad()));
    Ok(())
}
