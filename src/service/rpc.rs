//! The tarpc service every actor exposes to its neighbors.

use std::io;

use futures::{future, StreamExt};
use tarpc::{
    context,
    serde_transport::tcp,
    server::{self, Channel},
    tokio_serde::formats::Bincode,
};
use tokio::net::ToSocketAddrs;
use tracing_futures::Instrument;

use crate::{
    common::identity::ActorAddress,
    model::{EncodedParameters, Metrics, UpdateMessage},
    service::ServiceHandle,
};

/// The largest frame a connection accepts.
pub(crate) const MAX_FRAME_LENGTH: usize = 1 << 30;

/// The number of connections served at the same time.
const MAX_CONNECTIONS: usize = 1024;

#[tarpc::service]
/// Definition of the methods exposed by an actor.
pub trait ActorRpc {
    /// Hands a model update of the sender to the actor.
    async fn transfer_model_update(message: UpdateMessage);

    /// Evaluates the given weights on the validation data of the actor.
    async fn evaluate_model(parameters: EncodedParameters) -> Result<Metrics, String>;

    /// Notifies the actor that the sender has finished its last round.
    async fn allow_termination(sender: ActorAddress);
}

/// A server that serves a single connection. A new `Server` is created for each new connection.
#[derive(Clone)]
struct Server(ServiceHandle);

impl ActorRpc for Server {
    async fn transfer_model_update(self, _: context::Context, message: UpdateMessage) {
        debug!("handling model update from {}", message.sender);
        let span = trace_span!("rpc_transfer_model_update_handler", sender = %message.sender);
        span.in_scope(|| self.0.transfer_model_update(message))
    }

    async fn evaluate_model(
        self,
        _: context::Context,
        parameters: EncodedParameters,
    ) -> Result<Metrics, String> {
        debug!("handling evaluation request");
        let span = trace_span!("rpc_evaluate_model_handler");
        self.0
            .evaluate_model(parameters)
            .instrument(span)
            .await
            .map_err(|err| err.to_string())
    }

    async fn allow_termination(self, _: context::Context, sender: ActorAddress) {
        debug!("handling termination permission of {}", sender);
        let span = trace_span!("rpc_allow_termination_handler", sender = %sender);
        span.in_scope(|| {
            self.0.allow_termination(&sender);
        })
    }
}

/// Runs the RPC server of an actor until the actor and all of its neighbors are done.
///
/// # Errors
/// Fails if the server can't bind to the address.
pub async fn serve<A: ToSocketAddrs>(addr: A, service_handle: ServiceHandle) -> io::Result<()> {
    let mut listener = tcp::listen(addr, Bincode::default).await?;
    listener.config_mut().max_frame_length(MAX_FRAME_LENGTH);
    info!("serving RPC requests on {}", listener.local_addr());

    let connections = listener
        .filter_map(|accept_result| {
            future::ready(match accept_result {
                Ok(transport) => Some(transport),
                Err(e) => {
                    error!("failed to accept RPC connection: {:?}", e);
                    None
                }
            })
        })
        .map(server::BaseChannel::with_defaults)
        .map(|channel| {
            let server = Server(service_handle.clone());
            channel
                .execute(server.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .instrument(trace_span!("rpc_handler"))
        })
        .buffer_unordered(MAX_CONNECTIONS)
        .for_each(|_| async {});

    tokio::select! {
        _ = connections => {}
        _ = service_handle.termination().all_ready() => {
            info!("all neighbors are done, stopping the RPC server");
        }
    }
    Ok(())
}
