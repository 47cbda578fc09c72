use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use ndarray::{Array, Array1, Array4, Axis};
use rand::{distributions::Uniform, seq::SliceRandom, Rng};
use remixer::neural_network::{
    autograd::Variable4,
    criterion::cross_entropy_loss,
    layer::Layer,
    model::{builder::ReMixerImageClassificatorBuilder, ReMixerImageClassificator},
    optimizer::SGD,
};
use std::{f32::consts::PI, fs, path::PathBuf, time::Instant};

/// Trains a ReMixer image classifier on synthetic stripe images.
#[derive(Parser, Debug)]
#[command(name = "remixer-train")]
struct Options {
    /// Model configuration (JSON). Defaults to a small 32 x 32 model.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the feature dimension.
    #[arg(long)]
    dim: Option<usize>,
    /// Overrides the number of coupling blocks.
    #[arg(long)]
    layers: Option<usize>,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f32,
    /// SGD momentum, 0 to disable.
    #[arg(long, default_value_t = 0.9)]
    momentum: f32,
    /// The number of training images.
    #[arg(long, default_value_t = 512)]
    samples: usize,
    /// Saves the trained model (JSON).
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    info!("{options:?}");
    let mut builder = if let Some(path) = options.config.as_ref() {
        let config = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {path:?}!"))?;
        serde_json::from_str::<ReMixerImageClassificatorBuilder>(&config)?
    } else {
        ReMixerImageClassificator::builder()
            .image_size(32)
            .patch_size(8)
            .classes(4)
            .dim(64)
            .num_layers(4)
    };
    if let Some(dim) = options.dim {
        builder = builder.dim(dim);
    }
    if let Some(layers) = options.layers {
        builder = builder.num_layers(layers);
    }
    let mut model = builder.build()?;
    model.set_training(true);
    info!(
        "model: {} parameters",
        model
            .parameters()
            .iter()
            .map(|parameter| parameter.value().len())
            .sum::<usize>()
    );
    let (images, classes) = stripes(
        options.samples,
        model.channels(),
        model.image_size(),
        model.classes(),
    );
    let optimizer = SGD::builder().momentum(options.momentum).build();
    let batch_size = options.batch_size.max(1);
    let mut indices: Vec<usize> = (0..options.samples).collect();
    for epoch in 1..=options.epochs {
        let start = Instant::now();
        indices.shuffle(&mut rand::thread_rng());
        let mut total_loss = 0f32;
        let mut correct = 0;
        for batch in indices.chunks(batch_size) {
            let x = images.select(Axis(0), batch);
            let t = classes.select(Axis(0), batch);
            let logits = Variable4::from(x).forward(&model)?;
            correct += logits
                .value()
                .outer_iter()
                .zip(t.iter())
                .filter(|(y, t)| argmax(y.iter().copied()) == **t)
                .count();
            let loss = cross_entropy_loss(logits, t.view())?;
            total_loss += loss.value()[()] * batch.len() as f32;
            loss.backward()?;
            model.update(options.learning_rate, &optimizer)?;
        }
        let samples = options.samples.max(1) as f32;
        info!(
            "epoch: {epoch} elapsed: {:.2?} loss: {:.5} accuracy: {:.2}%",
            start.elapsed(),
            total_loss / samples,
            100. * correct as f32 / samples,
        );
    }
    if let Some(path) = options.save.as_ref() {
        model.set_training(false);
        fs::write(path, serde_json::to_vec(&model)?)
            .with_context(|| format!("Failed to save model to {path:?}!"))?;
        info!("saved model to {path:?}");
    }
    Ok(())
}

/// Images of vertical stripes, where the class selects the frequency.
fn stripes(
    samples: usize,
    channels: usize,
    [h, w]: [usize; 2],
    classes: usize,
) -> (Array4<f32>, Array1<usize>) {
    let mut rng = rand::thread_rng();
    let classes = Array::from_shape_fn(samples, |_| rng.gen_range(0..classes));
    let noise = Uniform::new(-0.2f32, 0.2);
    let images = Array::from_shape_fn([samples, channels, h, w], |(i, _, _, x)| {
        let frequency = (classes[i] + 1) as f32;
        (2. * PI * frequency * x as f32 / w as f32).cos() + rng.sample(noise)
    });
    (images, classes)
}

fn argmax(x: impl Iterator<Item = f32>) -> usize {
    x.enumerate()
        .fold((0, f32::NEG_INFINITY), |(i_max, x_max), (i, x)| {
            if x > x_max {
                (i, x)
            } else {
                (i_max, x_max)
            }
        })
        .0
}
