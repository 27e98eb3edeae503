use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::future::join_all;
use rand_chacha::ChaCha20Rng;
use tokio::time::timeout;

use crate::{
    common::{identity::ActorAddress, records::RunRecorder},
    compression::{Compression, CompressionError},
    model::{ModelUpdate, UpdateMessage},
    service::Peer,
};

/// The outbound side of an actor: its peers and the record of everything sent to them.
pub(crate) struct Outbox {
    peers: BTreeMap<ActorAddress, Arc<dyn Peer>>,
    recorder: RunRecorder,
    /// Bounds every call of a broadcast.
    bound: Option<Duration>,
}

impl Outbox {
    pub(crate) fn new(
        peers: BTreeMap<ActorAddress, Arc<dyn Peer>>,
        recorder: RunRecorder,
        bound: Option<Duration>,
    ) -> Self {
        Self {
            peers,
            recorder,
            bound,
        }
    }

    pub(crate) fn has_peer(&self, address: &ActorAddress) -> bool {
        self.peers.contains_key(address)
    }

    pub(crate) fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    pub(crate) fn recorder_mut(&mut self) -> &mut RunRecorder {
        &mut self.recorder
    }

    /// Encodes the updates and sends them concurrently, one call per receiver.
    ///
    /// Failed or timed out calls are logged and not retried.
    ///
    /// # Errors
    /// Fails if an update can't be compressed, in which case nothing is sent.
    pub(crate) async fn send(
        &mut self,
        round: u32,
        updates: Vec<(ActorAddress, ModelUpdate)>,
        compression: &Compression,
        rng: &mut ChaCha20Rng,
    ) -> Result<(), CompressionError> {
        let mut calls = Vec::with_capacity(updates.len());
        for (to, update) in updates {
            let message = UpdateMessage::encode(&update, compression, rng)?;
            let peer = match self.peers.get(&to) {
                Some(peer) => Arc::clone(peer),
                None => {
                    warn!("no peer for {}, dropping the update", to);
                    continue;
                }
            };
            if !update.is_empty() {
                self.recorder
                    .message(round, to.clone(), message.kind, message.byte_len());
            }
            calls.push(deliver(to, peer, message, self.bound));
        }
        debug!("sending {} updates", calls.len());
        join_all(calls).await;
        Ok(())
    }

    /// Tells every peer that `sender` is done. Failures are expected while neighbors shut down and
    /// are only logged.
    pub(crate) async fn notify_termination(&self, sender: &ActorAddress) {
        let notifications = self.peers.iter().map(|(address, peer)| async move {
            if let Err(err) = peer.allow_termination(sender.clone()).await {
                debug!("failed to notify {} about termination: {}", address, err);
            }
        });
        join_all(notifications).await;
    }
}

async fn deliver(
    to: ActorAddress,
    peer: Arc<dyn Peer>,
    message: UpdateMessage,
    bound: Option<Duration>,
) {
    let call = peer.transfer_model_update(message);
    let result = match bound {
        Some(bound) => match timeout(bound, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("sending the update to {} timed out after {:?}", to, bound);
                return;
            }
        },
        None => call.await,
    };
    if let Err(err) = result {
        warn!("failed to send the update to {}: {}", to, err);
    }
}
