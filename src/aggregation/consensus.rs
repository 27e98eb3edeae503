use std::collections::BTreeMap;

use crate::{
    aggregation::AggregationError,
    common::identity::ActorAddress,
    model::ParameterContainer,
};

/// The contribution of a neighbor to a consensus step with gradient correction.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusPeer<'a> {
    pub weights: &'a ParameterContainer,
    /// The gradient the neighbor predicts for the local weights.
    pub gradient: &'a ParameterContainer,
    pub alpha: f64,
    pub beta: f64,
}

/// The consensus step `current + sum(epsilon * alpha * (peer - current))`.
///
/// # Errors
/// Fails if the peers' weights differ in structure from the current weights.
pub fn consensus(
    current: &ParameterContainer,
    peers: &[(&ParameterContainer, f64)],
    epsilon: f64,
) -> Result<ParameterContainer, AggregationError> {
    let mut result = current.clone();
    for (weights, alpha) in peers {
        result = result.add(&weights.sub(current)?.scale(epsilon * alpha))?;
    }
    Ok(result)
}

/// The consensus step with gradient correction.
///
/// Returns the plain consensus step and the adjusted weights
/// `current + sum(epsilon * alpha * (peer - current) - mu * beta * gradient)`.
///
/// # Errors
/// Fails if the peers' weights or gradients differ in structure from the current weights.
pub fn consensus_with_gradient(
    current: &ParameterContainer,
    peers: &[ConsensusPeer],
    epsilon: f64,
    mu: f64,
) -> Result<(ParameterContainer, ParameterContainer), AggregationError> {
    let mut parameters = current.clone();
    let mut adjusted = current.clone();
    for peer in peers {
        let step = peer.weights.sub(current)?.scale(epsilon * peer.alpha);
        parameters = parameters.add(&step)?;
        adjusted = adjusted
            .add(&step)?
            .sub(&peer.gradient.scale(mu * peer.beta))?;
    }
    Ok((parameters, adjusted))
}

#[derive(Debug, Clone)]
/// Exponentially weighted moving averages of the gradients of the local loss at the weights of
/// every neighbor.
///
/// Predictions start at zero. The prediction for a neighbor is what gets sent to it.
pub struct GradientPredictor {
    smoothing: f64,
    predictions: BTreeMap<ActorAddress, ParameterContainer>,
}

impl GradientPredictor {
    /// Creates zero predictions with the structure of `template` for all neighbors.
    ///
    /// # Errors
    /// Fails if the smoothing factor is not in `(0, 1]`.
    pub fn new(
        neighbors: impl IntoIterator<Item = ActorAddress>,
        template: &ParameterContainer,
        smoothing: f64,
    ) -> Result<Self, AggregationError> {
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(AggregationError::InvalidSmoothing(smoothing));
        }
        let zeros = template.zeros_like();
        let predictions = neighbors
            .into_iter()
            .map(|address| (address, zeros.clone()))
            .collect();
        Ok(Self {
            smoothing,
            predictions,
        })
    }

    /// Gets the prediction for a neighbor.
    pub fn prediction(&self, address: &ActorAddress) -> Option<&ParameterContainer> {
        self.predictions.get(address)
    }

    /// Blends a freshly computed gradient into the prediction of a neighbor:
    /// `smoothing * fresh + (1 - smoothing) * previous`.
    ///
    /// Neighbors without a fresh gradient this round keep their prediction.
    ///
    /// # Errors
    /// Fails if the gradient differs in structure from the prediction.
    pub fn update(
        &mut self,
        address: &ActorAddress,
        fresh: &ParameterContainer,
    ) -> Result<(), AggregationError> {
        let blended = match self.predictions.get(address) {
            Some(previous) => fresh
                .scale(self.smoothing)
                .add(&previous.scale(1.0 - self.smoothing))?,
            None => fresh.scale(self.smoothing),
        };
        self.predictions.insert(address.clone(), blended);
        Ok(())
    }
}
