use std::{collections::BTreeMap, path::PathBuf, process, sync::Arc};

use anyhow::Context;
use structopt::StructOpt;
use tokio::signal;

use dfl_actor::{
    actor::{service_handle, Actor, RoundSettings},
    common::{identity::ActorAddress, logging, records::RunRecorder},
    model::linear::LinearTrainer,
    service::{serve, Peer, RpcPeer},
    settings::Settings,
    topology::Topology,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Actor")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let round_settings = RoundSettings::from(&settings);
    let Settings {
        actor: actor_settings,
        topology: topology_settings,
        trainer: trainer_settings,
        rpc: rpc_settings,
        records: record_settings,
        log: log_settings,
        ..
    } = settings;

    logging::configure(log_settings)?;

    let addresses = topology_settings
        .addresses
        .iter()
        .map(|address| ActorAddress::from(address.as_str()))
        .collect();
    let topology =
        Topology::new(addresses, &topology_settings.adjacency).context("invalid topology")?;
    let address = ActorAddress::from(actor_settings.address.as_str());
    let identity = topology
        .identity(&address)
        .context("the actor is not part of the topology")?;
    if round_settings.algorithm.requires_full_connectivity() {
        topology
            .require_full_connectivity(&address)
            .context("the algorithm requires a fully connected topology")?;
    }
    info!(
        "actor {} of {} at {} with neighbors {:?}",
        identity.index,
        identity.actor_count,
        identity.address,
        identity.neighbor_addresses()
    );

    let trainer = LinearTrainer::new(&trainer_settings, identity.index);
    let handle = service_handle(&identity, &round_settings, &trainer)?;
    let peers = identity
        .neighbors
        .iter()
        .map(|neighbor| {
            let peer = RpcPeer::new(neighbor.address.clone(), rpc_settings.clone());
            (neighbor.address.clone(), Arc::new(peer) as Arc<dyn Peer>)
        })
        .collect::<BTreeMap<_, _>>();
    let recorder = RunRecorder::new(address, record_settings.into());
    let mut actor = Actor::new(
        identity,
        round_settings,
        Box::new(trainer),
        handle.clone(),
        peers,
        recorder,
    )?;

    let server = tokio::spawn(serve(actor_settings.bind_address, handle));

    tokio::select! {
        result = actor.run() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
            return Ok(());
        }
    }
    server
        .await
        .context("the RPC server panicked")?
        .context("the RPC server failed")?;
    info!("shutting down: training finished");
    Ok(())
}
