use crate::{
    aggregation::{Algorithm, AggregationError, GradientPredictor},
    common::identity::{ActorAddress, Identity},
    market::Collected,
    model::{ParameterContainer, UpdatePayload},
    partition::{PartitionAssignment, PartitionError},
};

/// The hyperparameters and the state an algorithm keeps across rounds.
pub(crate) enum AggregationState {
    FedAvg,
    Consensus {
        epsilon: f64,
        alpha: f64,
    },
    ConsensusGradient {
        epsilon: f64,
        alpha: f64,
        mu: f64,
        beta: f64,
        /// The result of the plain consensus step, which is what gets broadcast.
        parameters: ParameterContainer,
        predictor: GradientPredictor,
    },
    FedNova {
        a_value: f64,
        tau_eff: f64,
        learning_rate: f64,
    },
    GradientAverage {
        learning_rate: f64,
    },
    Partitioned {
        assignment: PartitionAssignment,
        /// The partition of the global weights owned by this actor.
        global: ParameterContainer,
    },
}

impl AggregationState {
    /// Sets up the state of an algorithm for the given initial weights.
    pub(crate) fn new(
        algorithm: &Algorithm,
        identity: &Identity,
        initial: &ParameterContainer,
    ) -> Result<Self, AggregationError> {
        let uniform = 1.0 / identity.neighbors.len().max(1) as f64;
        let state = match *algorithm {
            Algorithm::FedAvg => AggregationState::FedAvg,
            Algorithm::Consensus { epsilon, alpha } => AggregationState::Consensus {
                epsilon,
                alpha: alpha.unwrap_or(uniform),
            },
            Algorithm::ConsensusGradient {
                epsilon,
                alpha,
                mu,
                beta,
                smoothing,
            } => AggregationState::ConsensusGradient {
                epsilon,
                alpha: alpha.unwrap_or(uniform),
                mu,
                beta: beta.unwrap_or(uniform),
                parameters: initial.clone(),
                predictor: GradientPredictor::new(
                    identity.neighbor_addresses(),
                    initial,
                    smoothing,
                )?,
            },
            Algorithm::FedNova {
                a_value,
                tau_eff,
                learning_rate,
            } => AggregationState::FedNova {
                a_value,
                tau_eff,
                learning_rate,
            },
            Algorithm::GradientAverage { learning_rate } => {
                AggregationState::GradientAverage { learning_rate }
            }
            Algorithm::Partitioned { scheme } => {
                let assignment = PartitionAssignment::new(scheme, initial, identity.actor_count)?;
                let global = assignment.partition(initial, identity.index)?;
                AggregationState::Partitioned { assignment, global }
            }
        };
        Ok(state)
    }
}

/// Gets the neighbors that own a non-empty partition.
///
/// # Errors
/// Fails if a neighbor index is out of range.
pub(crate) fn partition_owners(
    assignment: &PartitionAssignment,
    identity: &Identity,
) -> Result<Vec<ActorAddress>, PartitionError> {
    let mut owners = Vec::new();
    for neighbor in &identity.neighbors {
        if !assignment.indices(neighbor.index)?.is_empty() {
            owners.push(neighbor.address.clone());
        }
    }
    Ok(owners)
}

/// A contribution to an averaging step: its sender, its parameters and its sample count.
pub(crate) type Contribution<'a> = (&'a ActorAddress, &'a ParameterContainer, u64);

/// Gets the weights or weight deltas of all updates together with their sample counts.
pub(crate) fn peer_weights(collected: &Collected) -> Vec<Contribution<'_>> {
    collected
        .iter()
        .flat_map(|(address, updates)| updates.iter().map(move |update| (address, update)))
        .filter_map(|(address, update)| {
            update
                .payload
                .weights()
                .map(|weights| (address, weights, update.weight.samples()))
        })
        .collect()
}

/// Gets the gradients of all updates together with their sample counts.
pub(crate) fn peer_gradients(collected: &Collected) -> Vec<Contribution<'_>> {
    collected
        .iter()
        .flat_map(|(address, updates)| updates.iter().map(move |update| (address, update)))
        .filter_map(|(address, update)| {
            update
                .payload
                .gradient()
                .map(|gradient| (address, gradient, update.weight.samples()))
        })
        .collect()
}

/// Puts the local contribution among those of the peers, ordered by sender.
///
/// Every actor of a fully connected network sums up the same contributions in the same order and
/// therefore ends up with identical weights.
pub(crate) fn in_actor_order<'a>(
    own: Contribution<'a>,
    mut peers: Vec<Contribution<'a>>,
) -> Vec<(&'a ParameterContainer, u64)> {
    peers.push(own);
    // stable, several updates of one neighbor keep their arrival order
    peers.sort_by(|a, b| a.0.cmp(b.0));
    peers
        .into_iter()
        .map(|(_, params, samples)| (params, samples))
        .collect()
}

/// Gets the most recent weights of every neighbor.
pub(crate) fn latest_weights(collected: &Collected) -> Vec<&ParameterContainer> {
    collected
        .values()
        .filter_map(|updates| updates.iter().rev().find_map(|u| u.payload.weights()))
        .collect()
}

/// Gets the most recent weights and gradient of every neighbor.
pub(crate) fn latest_weights_and_gradients(
    collected: &Collected,
) -> Vec<(&ActorAddress, &ParameterContainer, &ParameterContainer)> {
    collected
        .iter()
        .filter_map(|(address, updates)| {
            updates.iter().rev().find_map(|update| match &update.payload {
                UpdatePayload::WeightsAndGradient { weights, gradient } => {
                    Some((address, weights, gradient))
                }
                _ => None,
            })
        })
        .collect()
}
