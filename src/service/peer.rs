//! Outbound calls to neighbors.

use std::io;

use async_trait::async_trait;
use tarpc::{
    client::{self, RpcError},
    context,
    serde_transport::tcp,
    tokio_serde::formats::Bincode,
};
use thiserror::Error;
use tokio::{sync::OnceCell, time::sleep};

use crate::{
    common::identity::ActorAddress,
    model::{EncodedParameters, Metrics, UpdateMessage},
    service::{rpc::{ActorRpcClient, MAX_FRAME_LENGTH}, ServiceHandle},
    settings::RpcSettings,
};

#[derive(Debug, Error)]
/// Errors of calls to a neighbor.
pub enum PeerError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: ActorAddress,
        source: io::Error,
    },
    #[error("RPC to {address} failed: {source}")]
    Rpc {
        address: ActorAddress,
        source: RpcError,
    },
    #[error("{address} failed to evaluate the model: {reason}")]
    Evaluation {
        address: ActorAddress,
        reason: String,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// The remote operations of a neighbor.
pub trait Peer: Send + Sync {
    /// Sends a model update to the neighbor.
    async fn transfer_model_update(&self, message: UpdateMessage) -> Result<(), PeerError>;

    /// Lets the neighbor evaluate the given weights on its validation data.
    async fn evaluate_model(&self, parameters: EncodedParameters) -> Result<Metrics, PeerError>;

    /// Tells the neighbor that `sender` has finished its last round.
    async fn allow_termination(&self, sender: ActorAddress) -> Result<(), PeerError>;
}

/// A neighbor reached over TCP.
///
/// The connection is established on the first call and reused afterwards.
pub struct RpcPeer {
    address: ActorAddress,
    settings: RpcSettings,
    client: OnceCell<ActorRpcClient>,
}

impl RpcPeer {
    pub fn new(address: ActorAddress, settings: RpcSettings) -> Self {
        Self {
            address,
            settings,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&ActorRpcClient, PeerError> {
        self.client.get_or_try_init(|| self.connect()).await
    }

    /// Keeps trying to connect to the neighbor until the configured number of attempts is used up.
    async fn connect(&self) -> Result<ActorRpcClient, PeerError> {
        let mut attempt = 1;
        loop {
            let mut connect = tcp::connect(self.address.as_ref(), Bincode::default);
            connect.config_mut().max_frame_length(MAX_FRAME_LENGTH);
            match connect.await {
                Ok(transport) => {
                    debug!("connected to {}", self.address);
                    return Ok(ActorRpcClient::new(client::Config::default(), transport).spawn());
                }
                Err(source) if attempt >= self.settings.connect_attempts => {
                    return Err(PeerError::Connect {
                        address: self.address.clone(),
                        source,
                    });
                }
                Err(e) => {
                    debug!(
                        "connection attempt {} to {} failed: {}",
                        attempt, self.address, e
                    );
                    attempt += 1;
                    sleep(self.settings.retry_delay()).await;
                }
            }
        }
    }

    fn rpc_error(&self, source: RpcError) -> PeerError {
        PeerError::Rpc {
            address: self.address.clone(),
            source,
        }
    }
}

#[async_trait]
impl Peer for RpcPeer {
    async fn transfer_model_update(&self, message: UpdateMessage) -> Result<(), PeerError> {
        self.client()
            .await?
            .transfer_model_update(context::current(), message)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn evaluate_model(&self, parameters: EncodedParameters) -> Result<Metrics, PeerError> {
        self.client()
            .await?
            .evaluate_model(context::current(), parameters)
            .await
            .map_err(|e| self.rpc_error(e))?
            .map_err(|reason| PeerError::Evaluation {
                address: self.address.clone(),
                reason,
            })
    }

    async fn allow_termination(&self, sender: ActorAddress) -> Result<(), PeerError> {
        self.client()
            .await?
            .allow_termination(context::current(), sender)
            .await
            .map_err(|e| self.rpc_error(e))
    }
}

#[derive(Clone)]
/// A neighbor living in the same process.
pub struct LocalPeer(ServiceHandle);

impl LocalPeer {
    pub fn new(handle: ServiceHandle) -> Self {
        Self(handle)
    }
}

#[async_trait]
impl Peer for LocalPeer {
    async fn transfer_model_update(&self, message: UpdateMessage) -> Result<(), PeerError> {
        self.0.transfer_model_update(message);
        Ok(())
    }

    async fn evaluate_model(&self, parameters: EncodedParameters) -> Result<Metrics, PeerError> {
        self.0
            .evaluate_model(parameters)
            .await
            .map_err(|err| PeerError::Evaluation {
                address: self.0.address().clone(),
                reason: err.to_string(),
            })
    }

    async fn allow_termination(&self, sender: ActorAddress) -> Result<(), PeerError> {
        self.0.allow_termination(&sender);
        Ok(())
    }
}
