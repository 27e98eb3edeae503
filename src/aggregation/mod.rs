//! Aggregation of the local update with the updates of the neighbors.
//!
//! All functions are pure: they take the local state, the contributions and the hyperparameters
//! and return new parameters. Which function runs in a round is decided by the [`Algorithm`].
//!
//! Contributions without content never reach these functions, they are excluded before. A total
//! weight of zero is an error, it is never treated as zero.

mod consensus;
mod fednova;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    consensus::{consensus, consensus_with_gradient, ConsensusPeer, GradientPredictor},
    fednova::{fed_nova, NovaContribution},
};
use crate::{
    model::{ParameterContainer, ParameterError},
    partition::{PartitionError, PartitionScheme},
};

#[derive(Debug, Error, PartialEq)]
/// Errors of the aggregation.
pub enum AggregationError {
    #[error("nothing to aggregate")]
    NoContributions,
    #[error("the total aggregation weight is zero")]
    ZeroTotalWeight,
    #[error("an a_value of zero cannot be normalized")]
    ZeroNormalization,
    #[error("the smoothing factor {0} is not in (0, 1]")]
    InvalidSmoothing(f64),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
}

fn one() -> f64 {
    1.0
}

fn default_smoothing() -> f64 {
    0.99
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// The aggregation algorithm of the actors.
pub enum Algorithm {
    /// Federated averaging of weight deltas.
    FedAvg,
    /// A consensus step towards the weights of the neighbors.
    Consensus {
        /// The global step size.
        #[serde(default = "one")]
        epsilon: f64,
        /// The mixing weight of every neighbor, `1 / neighbors` if not set.
        #[serde(default)]
        alpha: Option<f64>,
    },
    /// A consensus step corrected by the gradients the neighbors predict for the local weights.
    ConsensusGradient {
        #[serde(default = "one")]
        epsilon: f64,
        #[serde(default)]
        alpha: Option<f64>,
        /// The step size of the gradient correction.
        #[serde(default = "one")]
        mu: f64,
        /// The correction weight of every neighbor, `1 / neighbors` if not set.
        #[serde(default)]
        beta: Option<f64>,
        /// The factor of a fresh gradient in the moving average of the predictions.
        #[serde(default = "default_smoothing")]
        smoothing: f64,
    },
    /// Averaging of normalized gradients.
    ///
    /// The `a_value` isn't exchanged, every actor normalizes all gradients it aggregates with its
    /// own. All actors of a run are expected to use the same one.
    FedNova {
        #[serde(default = "one")]
        a_value: f64,
        #[serde(default = "one")]
        tau_eff: f64,
        learning_rate: f64,
    },
    /// Averaging of gradients, applied with a global learning rate.
    GradientAverage { learning_rate: f64 },
    /// Federated averaging where every actor aggregates only its own partition.
    Partitioned {
        #[serde(default)]
        scheme: PartitionScheme,
    },
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::FedAvg
    }
}

impl Algorithm {
    /// Checks whether the algorithm needs every actor to be a neighbor of every other actor.
    pub fn requires_full_connectivity(&self) -> bool {
        !matches!(
            self,
            Algorithm::Consensus { .. } | Algorithm::ConsensusGradient { .. }
        )
    }
}

/// Computes the elementwise mean of the contributions weighted by their sample counts.
///
/// # Errors
/// Fails if there are no contributions, the weights sum up to zero or the contributions differ in
/// structure.
pub fn weighted_average(
    contributions: &[(&ParameterContainer, u64)],
) -> Result<ParameterContainer, AggregationError> {
    let ((first, first_weight), rest) = contributions
        .split_first()
        .ok_or(AggregationError::NoContributions)?;
    let total = contributions.iter().map(|(_, weight)| *weight).sum::<u64>();
    if total == 0 {
        return Err(AggregationError::ZeroTotalWeight);
    }
    let mut sum = first.scale(*first_weight as f64);
    for (params, weight) in rest {
        sum = sum.add(&params.scale(*weight as f64))?;
    }
    let total = total as f64;
    Ok(sum.map(|value| value / total))
}

/// Federated averaging in delta form: `previous + weighted_average(deltas)`.
///
/// The local delta comes first, followed by the deltas of the peers.
///
/// # Errors
/// Fails like [`weighted_average()`].
pub fn fed_avg(
    previous: &ParameterContainer,
    deltas: &[(&ParameterContainer, u64)],
) -> Result<ParameterContainer, AggregationError> {
    Ok(previous.add(&weighted_average(deltas)?)?)
}

/// Gradient averaging: `previous - learning_rate * weighted_average(gradients)`.
///
/// # Errors
/// Fails like [`weighted_average()`].
pub fn gradient_average(
    previous: &ParameterContainer,
    gradients: &[(&ParameterContainer, u64)],
    learning_rate: f64,
) -> Result<ParameterContainer, AggregationError> {
    let step = weighted_average(gradients)?.scale(learning_rate);
    Ok(previous.sub(&step)?)
}
