//! The inbound side of an actor.
//!
//! A [`ServiceHandle`] is shared by the RPC server, in-process peers and the round loop. Inbound
//! calls only enqueue updates or record termination permissions, the round loop consumes them.

pub mod peer;
pub mod rpc;

use std::{convert::TryFrom, sync::Arc};

use thiserror::Error;
use tokio::task;

pub use self::{
    peer::{LocalPeer, Peer, PeerError, RpcPeer},
    rpc::serve,
};
use crate::{
    common::identity::{ActorAddress, Identity},
    market::{SynchronizationStrategy, UpdateMarket},
    model::{EncodedParameters, LocalTrainer, Metrics, ParameterContainer, UpdateMessage},
    termination::{TerminationPermission, TerminationState},
};

#[derive(Debug, Error)]
/// Errors of an evaluation request.
pub enum EvaluationError {
    #[error("invalid parameters: {0}")]
    Parameters(String),
    #[error("evaluation failed: {0}")]
    Trainer(String),
    #[error("evaluation task panicked")]
    Panicked,
}

struct Inner {
    address: ActorAddress,
    updates: UpdateMarket,
    partitions: UpdateMarket,
    termination: TerminationPermission,
    /// Evaluates weights sent by other actors on the local validation data.
    evaluator: Box<dyn LocalTrainer>,
}

#[derive(Clone)]
/// A cheaply cloneable handle to the inbound state of an actor.
pub struct ServiceHandle(Arc<Inner>);

impl ServiceHandle {
    /// Creates the update market, the partition mailbox and the termination permissions of an
    /// actor.
    pub fn new(
        identity: &Identity,
        strategy: SynchronizationStrategy,
        allow_empty: bool,
        evaluator: Box<dyn LocalTrainer>,
    ) -> Self {
        let owners = identity.neighbor_addresses();
        Self::with_partition_owners(identity, strategy, allow_empty, evaluator, owners)
    }

    /// Creates the inbound state like [`new()`], with a partition mailbox for the given neighbors
    /// only.
    ///
    /// The partition mailbox always waits for one partition from every owner.
    ///
    /// [`new()`]: ServiceHandle::new
    pub fn with_partition_owners(
        identity: &Identity,
        strategy: SynchronizationStrategy,
        allow_empty: bool,
        evaluator: Box<dyn LocalTrainer>,
        partition_owners: Vec<ActorAddress>,
    ) -> Self {
        let neighbors = identity.neighbor_addresses();
        let inner = Inner {
            address: identity.address.clone(),
            updates: UpdateMarket::new(neighbors.clone(), strategy, allow_empty),
            partitions: UpdateMarket::new(
                partition_owners,
                SynchronizationStrategy::OneFromEach,
                false,
            ),
            termination: TerminationPermission::new(identity.address.clone(), neighbors),
            evaluator,
        };
        Self(Arc::new(inner))
    }

    /// Gets the address of the actor this handle belongs to.
    pub fn address(&self) -> &ActorAddress {
        &self.0.address
    }

    pub fn updates(&self) -> &UpdateMarket {
        &self.0.updates
    }

    pub fn partitions(&self) -> &UpdateMarket {
        &self.0.partitions
    }

    pub fn termination(&self) -> &TerminationPermission {
        &self.0.termination
    }

    /// Decodes an update and puts it into the update market, or into the partition mailbox if it
    /// carries a partition.
    ///
    /// Updates from actors that are not neighbors are discarded.
    pub fn transfer_model_update(&self, message: UpdateMessage) {
        let update = message.decode();
        let mailbox = if update.weight.is_partition() {
            &self.0.partitions
        } else {
            &self.0.updates
        };
        if let Err(err) = mailbox.put(update) {
            warn!("discarding update: {}", err);
        }
    }

    /// Evaluates the given weights on the local validation data.
    ///
    /// The evaluation runs on a copy of the local trainer on the blocking thread pool.
    ///
    /// # Errors
    /// Fails if the parameters are malformed or the evaluation fails.
    pub async fn evaluate_model(
        &self,
        parameters: EncodedParameters,
    ) -> Result<Metrics, EvaluationError> {
        let weights = ParameterContainer::try_from(parameters)
            .map_err(|err| EvaluationError::Parameters(err.to_string()))?;
        let trainer = self.0.evaluator.clone_trainer();
        task::spawn_blocking(move || trainer.evaluate_weights(weights))
            .await
            .map_err(|_| EvaluationError::Panicked)?
            .map_err(|err| EvaluationError::Trainer(err.to_string()))
    }

    /// Records that a neighbor is done.
    pub fn allow_termination(&self, sender: &ActorAddress) -> Option<TerminationState> {
        match self.0.termination.grant(sender) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("ignoring termination permission: {}", err);
                None
            }
        }
    }
}
