//! A linear regression trainer on synthetic data.
//!
//! Every actor draws its own dataset from `y = x * w + b + noise` with a common ground truth, which
//! makes the trainer a cheap stand-in for a real model when running a network of actors.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Deserialize;
use validator::Validate;

use crate::model::{
    params::{DType, Layer, ParameterContainer},
    trainer::{LocalTrainer, Metrics, Proximal, TrainerError},
};

#[derive(Debug, Clone, Deserialize, Validate)]
/// The settings of the synthetic linear trainer.
pub struct LinearTrainerSettings {
    /// The number of input features.
    #[validate(range(min = 1))]
    pub features: usize,
    /// The number of local training samples.
    #[validate(range(min = 1))]
    pub samples: usize,
    /// The number of local validation samples.
    #[validate(range(min = 1))]
    pub validation_samples: usize,
    /// The standard deviation of the label noise.
    #[validate(range(min = 0.0))]
    pub noise: f64,
    /// The learning rate of local gradient descent.
    pub learning_rate: f64,
    /// The number of full batch gradient steps per fit.
    #[validate(range(min = 1))]
    pub local_epochs: usize,
    /// The seed of the ground truth, shared by all actors.
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct Dataset {
    inputs: Vec<Vec<f64>>,
    labels: Vec<f64>,
}

impl Dataset {
    fn generate(rng: &mut ChaCha20Rng, truth: &[f64], bias: f64, len: usize, noise: f64) -> Self {
        let mut inputs = Vec::with_capacity(len);
        let mut labels = Vec::with_capacity(len);
        for _ in 0..len {
            let x = truth
                .iter()
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect::<Vec<f64>>();
            let y = dot(&x, truth) + bias + noise * rng.gen_range(-1.0..1.0);
            inputs.push(x);
            labels.push(y);
        }
        Self { inputs, labels }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(a, b)| a * b).sum()
}

#[derive(Debug, Clone)]
/// A linear model `y = x * w + b` trained with full batch gradient descent on the mean squared
/// error.
pub struct LinearTrainer {
    weights: Vec<f64>,
    bias: f64,
    train: Dataset,
    validation: Dataset,
    learning_rate: f64,
    local_epochs: usize,
}

impl LinearTrainer {
    /// Creates a trainer with zero weights and the dataset of the actor with the given index.
    pub fn new(settings: &LinearTrainerSettings, actor_index: usize) -> Self {
        let mut truth_rng = ChaCha20Rng::seed_from_u64(settings.seed);
        let truth = (0..settings.features)
            .map(|_| truth_rng.gen_range(-2.0..2.0))
            .collect::<Vec<f64>>();
        let bias = truth_rng.gen_range(-1.0..1.0);

        let mut rng = ChaCha20Rng::seed_from_u64(settings.seed);
        rng.set_stream(actor_index as u64 + 1);
        let train = Dataset::generate(&mut rng, &truth, bias, settings.samples, settings.noise);
        let validation = Dataset::generate(
            &mut rng,
            &truth,
            bias,
            settings.validation_samples,
            settings.noise,
        );

        Self {
            weights: vec![0.0; settings.features],
            bias: 0.0,
            train,
            validation,
            learning_rate: settings.learning_rate,
            local_epochs: settings.local_epochs,
        }
    }

    fn loss(&self, data: &Dataset) -> f64 {
        let total = data
            .inputs
            .iter()
            .zip(data.labels.iter())
            .map(|(x, y)| {
                let residual = dot(x, &self.weights) + self.bias - y;
                residual * residual
            })
            .sum::<f64>();
        total / data.labels.len().max(1) as f64
    }

    fn gradient(&self, data: &Dataset) -> (Vec<f64>, f64) {
        let n = data.labels.len().max(1) as f64;
        let mut grad_w = vec![0.0; self.weights.len()];
        let mut grad_b = 0.0;
        for (x, y) in data.inputs.iter().zip(data.labels.iter()) {
            let residual = dot(x, &self.weights) + self.bias - y;
            for (g, xi) in grad_w.iter_mut().zip(x.iter()) {
                *g += 2.0 * residual * xi / n;
            }
            grad_b += 2.0 * residual / n;
        }
        (grad_w, grad_b)
    }

    fn to_container(weights: &[f64], bias: f64) -> ParameterContainer {
        vec![
            Layer::from_values(weights.to_vec()),
            Layer::from_values(vec![bias]),
        ]
        .into()
    }
}

impl LocalTrainer for LinearTrainer {
    fn fit(&mut self, proximal: Option<&Proximal>) -> Result<Metrics, TrainerError> {
        for _ in 0..self.local_epochs {
            let (mut grad_w, mut grad_b) = self.gradient(&self.train);
            if let Some(proximal) = proximal {
                let penalty = proximal.gradient(&self.weights())?.flatten();
                for (g, p) in grad_w.iter_mut().zip(penalty.iter()) {
                    *g += p;
                }
                grad_b += penalty.last().copied().unwrap_or_default();
            }
            // the weights are f32 layers
            for (w, g) in self.weights.iter_mut().zip(grad_w.iter()) {
                *w = DType::F32.cast(*w - self.learning_rate * g);
            }
            self.bias = DType::F32.cast(self.bias - self.learning_rate * grad_b);
        }
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), self.loss(&self.train));
        if let Some(proximal) = proximal {
            metrics.insert("proximal".into(), proximal.penalty(&self.weights())?);
        }
        Ok(metrics)
    }

    fn compute_gradient(&self) -> Result<ParameterContainer, TrainerError> {
        let (grad_w, grad_b) = self.gradient(&self.train);
        Ok(Self::to_container(&grad_w, grad_b))
    }

    fn weights(&self) -> ParameterContainer {
        Self::to_container(&self.weights, self.bias)
    }

    fn set_weights(&mut self, weights: ParameterContainer) -> Result<(), TrainerError> {
        let structure = self.weights();
        // checks the structure
        structure.sub(&weights)?;
        let flat = weights.flatten();
        let (bias, weights) = flat
            .split_last()
            .ok_or_else(|| TrainerError::Training("empty weights".into()))?;
        self.weights = weights.to_vec();
        self.bias = *bias;
        Ok(())
    }

    fn evaluate(&self) -> Result<Metrics, TrainerError> {
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), self.loss(&self.validation));
        Ok(metrics)
    }

    fn evaluate_training(&self) -> Result<Metrics, TrainerError> {
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), self.loss(&self.train));
        Ok(metrics)
    }

    fn sample_count(&self) -> u64 {
        self.train.labels.len() as u64
    }

    fn clone_trainer(&self) -> Box<dyn LocalTrainer> {
        Box::new(self.clone())
    }
}
