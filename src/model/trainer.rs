//! The local training collaborator.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::params::{ParameterContainer, ParameterError};

/// Named evaluation or training metrics, e.g. `loss`.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Error)]
/// Errors of a local trainer.
pub enum TrainerError {
    #[error("training failed: {0}")]
    Training(String),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

#[derive(Debug, Clone, PartialEq)]
/// A proximal term `(mu / 2) * ||w - anchor||^2` added to the local objective.
pub struct Proximal {
    pub mu: f64,
    /// The weights held at the start of the round.
    pub anchor: ParameterContainer,
}

impl Proximal {
    /// Gets the value of the term at `weights`.
    ///
    /// # Errors
    /// Fails if the weights don't have the structure of the anchor.
    pub fn penalty(&self, weights: &ParameterContainer) -> Result<f64, ParameterError> {
        let squared_norm = weights
            .sub(&self.anchor)?
            .flatten()
            .iter()
            .map(|value| value * value)
            .sum::<f64>();
        Ok(self.mu / 2.0 * squared_norm)
    }

    /// Gets the gradient `mu * (w - anchor)` of the term at `weights`.
    ///
    /// # Errors
    /// Fails if the weights don't have the structure of the anchor.
    pub fn gradient(
        &self,
        weights: &ParameterContainer,
    ) -> Result<ParameterContainer, ParameterError> {
        Ok(weights.sub(&self.anchor)?.scale(self.mu))
    }
}

/// A model bound to its local dataset.
///
/// Implementations own their training and validation data, the actor only moves parameters in and
/// out.
pub trait LocalTrainer: Send + Sync + 'static {
    /// Trains the model on the local training data.
    ///
    /// If a proximal term is given, it is added to the local objective.
    fn fit(&mut self, proximal: Option<&Proximal>) -> Result<Metrics, TrainerError>;

    /// Computes the gradient of the local loss at the current weights.
    fn compute_gradient(&self) -> Result<ParameterContainer, TrainerError>;

    /// Gets the current weights.
    fn weights(&self) -> ParameterContainer;

    /// Replaces the current weights.
    fn set_weights(&mut self, weights: ParameterContainer) -> Result<(), TrainerError>;

    /// Evaluates the current weights on the local validation data.
    fn evaluate(&self) -> Result<Metrics, TrainerError>;

    /// Evaluates the current weights on the local training data.
    fn evaluate_training(&self) -> Result<Metrics, TrainerError> {
        self.evaluate()
    }

    /// Gets the number of local training samples.
    fn sample_count(&self) -> u64;

    /// Creates an independent copy of this trainer.
    fn clone_trainer(&self) -> Box<dyn LocalTrainer>;

    /// Computes the gradient at the current weights, then trains.
    fn fit_gradient(
        &mut self,
        proximal: Option<&Proximal>,
    ) -> Result<(ParameterContainer, Metrics), TrainerError> {
        let gradient = self.compute_gradient()?;
        let metrics = self.fit(proximal)?;
        Ok((gradient, metrics))
    }

    /// Computes the gradient of the local loss at other weights, leaving this trainer untouched.
    fn gradient_at(&self, weights: ParameterContainer) -> Result<ParameterContainer, TrainerError> {
        let mut trainer = self.clone_trainer();
        trainer.set_weights(weights)?;
        trainer.compute_gradient()
    }

    /// Evaluates other weights on the local training data, leaving this trainer untouched.
    fn evaluate_training_at(&self, weights: ParameterContainer) -> Result<Metrics, TrainerError> {
        let mut trainer = self.clone_trainer();
        trainer.set_weights(weights)?;
        trainer.evaluate_training()
    }

    /// Evaluates other weights on the local validation data, leaving this trainer untouched.
    fn evaluate_weights(&self, weights: ParameterContainer) -> Result<Metrics, TrainerError> {
        let mut trainer = self.clone_trainer();
        trainer.set_weights(weights)?;
        trainer.evaluate()
    }
}
