//! The round loop of an actor.
//!
//! Every round an [`Actor`] trains locally, broadcasts its contribution to the neighbors selected
//! by the participation policy, collects the contributions of its neighbors from the update market
//! and aggregates them according to the configured [`Algorithm`]. After the last round it takes
//! part in the termination protocol and writes its run records.

mod outbox;
mod state;

use std::{collections::BTreeMap, sync::Arc};

use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing_futures::Instrument;

use self::{
    outbox::Outbox,
    state::{
        in_actor_order,
        latest_weights,
        latest_weights_and_gradients,
        partition_owners,
        peer_gradients,
        peer_weights,
        AggregationState,
    },
};
use crate::{
    aggregation::{
        consensus,
        consensus_with_gradient,
        fed_avg,
        fed_nova,
        gradient_average,
        weighted_average,
        AggregationError,
        Algorithm,
        ConsensusPeer,
        NovaContribution,
    },
    common::{
        identity::{ActorAddress, Identity},
        records::{Phase, RecordsError, RunRecorder},
        round_rng,
    },
    compression::{Compression, CompressionError},
    market::{Collected, MarketError, SynchronizationStrategy},
    model::{
        LocalTrainer,
        Metrics,
        ModelUpdate,
        ParameterContainer,
        ParameterError,
        Proximal,
        TrainerError,
        UpdatePayload,
    },
    participation::{Participation, Selection},
    partition::{PartitionAssignment, PartitionError},
    service::{Peer, ServiceHandle},
    settings::Settings,
    topology::TopologyError,
};

#[derive(Debug, Error)]
/// Errors that stop the round loop.
pub enum ActorError {
    #[error("local training failed: {0}")]
    Trainer(#[from] TrainerError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),
    #[error("partitioning failed: {0}")]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("collecting updates failed: {0}")]
    Market(#[from] MarketError),
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("no peer for the neighbor {0}")]
    MissingPeer(ActorAddress),
    #[error(transparent)]
    Records(#[from] RecordsError),
}

#[derive(Debug, Clone, Default)]
/// The settings of the round loop.
pub struct RoundSettings {
    pub rounds: u32,
    pub seed: u64,
    pub proximal_mu: Option<f64>,
    pub algorithm: Algorithm,
    pub strategy: SynchronizationStrategy,
    pub allow_empty: bool,
    pub compression: Compression,
    pub participation: Participation,
}

impl From<&Settings> for RoundSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            rounds: settings.training.rounds,
            seed: settings.training.seed,
            proximal_mu: settings.training.proximal_mu,
            algorithm: settings.algorithm.clone(),
            strategy: settings.synchronization.strategy,
            allow_empty: settings.synchronization.allow_empty,
            compression: settings.compression.clone(),
            participation: settings.participation,
        }
    }
}

/// Creates the inbound state of an actor, with a partition mailbox for the neighbors that own a
/// partition if the algorithm partitions the weights.
///
/// # Errors
/// Fails if the partitions can't be assigned.
pub fn service_handle(
    identity: &Identity,
    settings: &RoundSettings,
    trainer: &dyn LocalTrainer,
) -> Result<ServiceHandle, ActorError> {
    let evaluator = trainer.clone_trainer();
    let owners = match settings.algorithm {
        Algorithm::Partitioned { scheme } => {
            let assignment =
                PartitionAssignment::new(scheme, &trainer.weights(), identity.actor_count)?;
            partition_owners(&assignment, identity)?
        }
        _ => identity.neighbor_addresses(),
    };
    Ok(ServiceHandle::with_partition_owners(
        identity,
        settings.strategy,
        settings.allow_empty,
        evaluator,
        owners,
    ))
}

/// What the local step of a round produced.
struct LocalStep {
    /// The weights at the start of the round.
    start: ParameterContainer,
    /// The local contribution to the aggregation: the weight delta, the gradient or the trained
    /// weights, depending on the algorithm.
    contribution: ParameterContainer,
    metrics: Metrics,
}

/// A participant of the decentralized training.
pub struct Actor {
    identity: Identity,
    settings: RoundSettings,
    trainer: Box<dyn LocalTrainer>,
    handle: ServiceHandle,
    outbox: Outbox,
    state: AggregationState,
}

impl Actor {
    /// Creates an actor.
    ///
    /// The `handle` must be the one inbound calls of the neighbors are served with, see
    /// [`service_handle()`].
    ///
    /// # Errors
    /// Fails if the algorithm requires full connectivity but the actor isn't connected to every
    /// other actor, if a neighbor has no peer or if the algorithm can't be set up.
    pub fn new(
        identity: Identity,
        settings: RoundSettings,
        trainer: Box<dyn LocalTrainer>,
        handle: ServiceHandle,
        peers: BTreeMap<ActorAddress, Arc<dyn Peer>>,
        recorder: RunRecorder,
    ) -> Result<Self, ActorError> {
        if settings.algorithm.requires_full_connectivity() && !identity.is_fully_connected() {
            return Err(TopologyError::NotFullyConnected(identity.address.clone()).into());
        }
        let outbox = Outbox::new(peers, recorder, settings.strategy.timeout());
        if let Some(neighbor) = identity
            .neighbors
            .iter()
            .find(|neighbor| !outbox.has_peer(&neighbor.address))
        {
            return Err(ActorError::MissingPeer(neighbor.address.clone()));
        }
        let state = AggregationState::new(&settings.algorithm, &identity, &trainer.weights())?;
        Ok(Self {
            identity,
            settings,
            trainer,
            handle,
            outbox,
            state,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    pub fn trainer(&self) -> &dyn LocalTrainer {
        self.trainer.as_ref()
    }

    pub fn recorder(&self) -> &RunRecorder {
        self.outbox.recorder()
    }

    /// Runs all rounds, then waits until the actor and its neighbors are done and writes the run
    /// records.
    ///
    /// # Errors
    /// Fails if a round fails or the records can't be written. The termination protocol is
    /// skipped in that case.
    pub async fn run(&mut self) -> Result<(), ActorError> {
        info!(
            "starting {} rounds of {:?} with {} neighbors",
            self.settings.rounds,
            self.settings.algorithm,
            self.identity.neighbors.len()
        );
        for round in 1..=self.settings.rounds {
            let span = info_span!("round", round);
            self.round(round).instrument(span).await?;
        }
        self.terminate().await;
        self.outbox.recorder().flush()?;
        Ok(())
    }

    async fn round(&mut self, round: u32) -> Result<(), ActorError> {
        let mut rng = round_rng(self.settings.seed, round, self.identity.index);

        let started = Instant::now();
        let step = self.fit_local()?;
        self.outbox
            .recorder_mut()
            .metrics(round, Phase::Fit, &step.metrics, started.elapsed());

        let selection = self
            .settings
            .participation
            .select(&self.identity.neighbor_addresses(), &mut rng);
        let updates = self.outgoing(&step, &selection)?;
        self.outbox
            .send(round, updates, &self.settings.compression, &mut rng)
            .await?;

        let started = Instant::now();
        let collected = self.handle.updates().collect().await?;
        debug!("collected updates from {} neighbors", collected.len());
        let contributions = self.aggregate(round, &step, collected, &mut rng).await?;
        let mut metrics = Metrics::new();
        metrics.insert("contributions".into(), contributions as f64);
        self.outbox
            .recorder_mut()
            .metrics(round, Phase::Aggregate, &metrics, started.elapsed());

        let started = Instant::now();
        let metrics = self.trainer.evaluate()?;
        if let Some(loss) = metrics.get("loss") {
            info!("round {} done with a validation loss of {}", round, loss);
        }
        self.outbox
            .recorder_mut()
            .metrics(round, Phase::Evaluate, &metrics, started.elapsed());
        Ok(())
    }

    /// Trains locally and derives the local contribution.
    fn fit_local(&mut self) -> Result<LocalStep, ActorError> {
        let start = self.trainer.weights();
        let proximal = self.settings.proximal_mu.map(|mu| Proximal {
            mu,
            anchor: start.clone(),
        });
        let (contribution, metrics) = match self.state {
            AggregationState::FedNova { learning_rate, .. } => {
                let gradient = self.trainer.compute_gradient()?;
                let stepped = start.sub(&gradient.scale(learning_rate))?;
                let metrics = self.trainer.evaluate_training_at(stepped)?;
                (gradient, metrics)
            }
            AggregationState::GradientAverage { .. } => {
                self.trainer.fit_gradient(proximal.as_ref())?
            }
            AggregationState::FedAvg | AggregationState::Partitioned { .. } => {
                let metrics = self.trainer.fit(proximal.as_ref())?;
                (self.trainer.weights().sub(&start)?, metrics)
            }
            AggregationState::Consensus { .. } | AggregationState::ConsensusGradient { .. } => {
                let metrics = self.trainer.fit(proximal.as_ref())?;
                (self.trainer.weights(), metrics)
            }
        };
        Ok(LocalStep {
            start,
            contribution,
            metrics,
        })
    }

    /// Creates the update of every neighbor. Neighbors that are not selected get an empty update.
    fn outgoing(
        &self,
        step: &LocalStep,
        selection: &Selection,
    ) -> Result<Vec<(ActorAddress, ModelUpdate)>, ActorError> {
        let own = &self.identity.address;
        let samples = self.trainer.sample_count();
        let mut updates = Vec::with_capacity(self.identity.neighbors.len());
        for neighbor in &self.identity.neighbors {
            let payload = if !selection.selected.contains(&neighbor.address) {
                UpdatePayload::Empty
            } else {
                match &self.state {
                    AggregationState::FedAvg => UpdatePayload::WeightDelta(step.contribution.clone()),
                    AggregationState::Consensus { .. } => {
                        UpdatePayload::Weights(step.contribution.clone())
                    }
                    AggregationState::ConsensusGradient {
                        parameters,
                        predictor,
                        ..
                    } => UpdatePayload::WeightsAndGradient {
                        weights: parameters.clone(),
                        gradient: predictor
                            .prediction(&neighbor.address)
                            .cloned()
                            .unwrap_or_else(|| parameters.zeros_like()),
                    },
                    AggregationState::FedNova { .. } | AggregationState::GradientAverage { .. } => {
                        UpdatePayload::Gradient(step.contribution.clone())
                    }
                    AggregationState::Partitioned { assignment, .. } => {
                        let partition = assignment.partition(&step.contribution, neighbor.index)?;
                        if partition.is_empty() {
                            UpdatePayload::Empty
                        } else {
                            UpdatePayload::WeightDelta(partition)
                        }
                    }
                }
            };
            let update = if payload.is_empty() {
                ModelUpdate::empty(own.clone())
            } else {
                ModelUpdate::new(own.clone(), payload, samples)
            };
            updates.push((neighbor.address.clone(), update));
        }
        Ok(updates)
    }

    /// Aggregates the local contribution with the collected ones and sets the new weights.
    ///
    /// Returns the number of contributions, including the local one.
    async fn aggregate(
        &mut self,
        round: u32,
        step: &LocalStep,
        collected: Collected,
        rng: &mut ChaCha20Rng,
    ) -> Result<usize, ActorError> {
        let samples = self.trainer.sample_count();
        let compression = &self.settings.compression;
        match self.state {
            AggregationState::FedAvg => {
                let local = lossy(compression, &step.contribution, rng)?;
                let deltas = in_actor_order(
                    (&self.identity.address, &local, samples),
                    peer_weights(&collected),
                );
                self.trainer.set_weights(fed_avg(&step.start, &deltas)?)?;
                Ok(deltas.len())
            }
            AggregationState::Consensus { epsilon, alpha } => {
                let peers = latest_weights(&collected)
                    .into_iter()
                    .map(|weights| (weights, alpha))
                    .collect::<Vec<_>>();
                let weights = consensus(&step.contribution, &peers, epsilon)?;
                self.trainer.set_weights(weights)?;
                Ok(peers.len() + 1)
            }
            AggregationState::ConsensusGradient {
                epsilon,
                alpha,
                mu,
                beta,
                ref mut parameters,
                ref mut predictor,
            } => {
                let received = latest_weights_and_gradients(&collected);
                let mut computed = Vec::with_capacity(received.len());
                for (address, weights, _) in &received {
                    computed.push((*address, self.trainer.gradient_at((*weights).clone())?));
                }
                let peers = received
                    .iter()
                    .map(|(_, weights, gradient)| ConsensusPeer {
                        weights: *weights,
                        gradient: *gradient,
                        alpha,
                        beta,
                    })
                    .collect::<Vec<_>>();
                let (mixed, adjusted) =
                    consensus_with_gradient(&step.contribution, &peers, epsilon, mu)?;
                for (address, gradient) in &computed {
                    predictor.update(address, gradient)?;
                }
                *parameters = mixed;
                self.trainer.set_weights(adjusted)?;
                Ok(peers.len() + 1)
            }
            AggregationState::FedNova {
                a_value,
                tau_eff,
                learning_rate,
            } => {
                let local = lossy(compression, &step.contribution, rng)?;
                let contributions = in_actor_order(
                    (&self.identity.address, &local, samples),
                    peer_gradients(&collected),
                )
                .into_iter()
                .map(|(gradient, samples)| NovaContribution {
                    gradient,
                    samples,
                    a_value,
                })
                .collect::<Vec<_>>();
                let weights = fed_nova(&step.start, &contributions, tau_eff, learning_rate)?;
                self.trainer.set_weights(weights)?;
                Ok(contributions.len())
            }
            AggregationState::GradientAverage { learning_rate } => {
                let local = lossy(compression, &step.contribution, rng)?;
                let gradients = in_actor_order(
                    (&self.identity.address, &local, samples),
                    peer_gradients(&collected),
                );
                let weights = gradient_average(&step.start, &gradients, learning_rate)?;
                self.trainer.set_weights(weights)?;
                Ok(gradients.len())
            }
            AggregationState::Partitioned {
                ref assignment,
                ref mut global,
            } => {
                let own_index = self.identity.index;
                let mut contributions = 0;
                if !assignment.indices(own_index)?.is_empty() {
                    let local = lossy(
                        compression,
                        &assignment.partition(&step.contribution, own_index)?,
                        rng,
                    )?;
                    let deltas = in_actor_order(
                        (&self.identity.address, &local, samples),
                        peer_weights(&collected),
                    );
                    *global = global.add(&weighted_average(&deltas)?)?;
                    contributions = deltas.len();

                    let updates = self
                        .identity
                        .neighbors
                        .iter()
                        .map(|neighbor| {
                            let update =
                                ModelUpdate::partition(self.identity.address.clone(), global.clone());
                            (neighbor.address.clone(), update)
                        })
                        .collect();
                    // partitions are sent uncompressed so all actors reconstruct the same weights
                    self.outbox
                        .send(round, updates, &Compression::None, rng)
                        .await?;
                }

                let mut partitions = BTreeMap::new();
                for (address, updates) in self.handle.partitions().collect().await? {
                    let index = self
                        .identity
                        .neighbor_index(&address)
                        .ok_or(ActorError::MissingPeer(address))?;
                    let partition = updates.into_iter().rev().find_map(|update| match update.payload {
                        UpdatePayload::PartitionedWeights(partition) => Some(partition),
                        _ => None,
                    });
                    if let Some(partition) = partition {
                        partitions.insert(index, partition);
                    }
                }
                if !global.is_empty() {
                    partitions.insert(own_index, global.clone());
                }
                let weights = assignment.reconstruct(&step.start, &partitions)?;
                self.trainer.set_weights(weights)?;
                Ok(contributions)
            }
        }
    }

    /// Marks the actor as done, notifies the neighbors and waits until all of them are done.
    async fn terminate(&mut self) {
        let state = self.handle.termination().mark_self_ready();
        info!(
            "training finished ({}), notifying {} neighbors",
            state,
            self.identity.neighbors.len()
        );
        self.outbox.notify_termination(&self.identity.address).await;
        self.handle.termination().all_ready().await;
        info!("all neighbors finished training");
    }
}

/// Subjects a local contribution to the lossy part of the compression.
fn lossy(
    compression: &Compression,
    params: &ParameterContainer,
    rng: &mut ChaCha20Rng,
) -> Result<ParameterContainer, CompressionError> {
    if compression.is_none() {
        Ok(params.clone())
    } else {
        compression.compress_decompress(params, rng)
    }
}
