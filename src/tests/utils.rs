use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::timeout;
use tracing_subscriber::filter::EnvFilter;

use crate::{
    actor::{service_handle, Actor, RoundSettings},
    common::{
        identity::{ActorAddress, Identity},
        logging,
        records::{RecordPaths, RunRecorder},
    },
    model::{LocalTrainer, Metrics, ParameterContainer, Proximal, TrainerError},
    service::{LocalPeer, Peer, ServiceHandle},
    settings::LoggingSettings,
    topology::Topology,
};

/// This function makes it easy to toggle logging in the tests. If the `TEST_LOGS` environment
/// variable is set, its value is used as a filter for tracing. For instance, to have the logs
/// dumped during the tests one can do:
///
/// ```no_rust
/// TEST_LOGS=debug cargo test
/// ```
pub fn enable_logging() {
    if let Ok(filter) = std::env::var("TEST_LOGS") {
        let _ = logging::configure(LoggingSettings {
            filter: EnvFilter::try_new(filter).unwrap(),
        });
    }
}

#[derive(Debug, Clone)]
/// A trainer whose fit adds a fixed delta to the weights and whose gradient is fixed.
pub struct StaticTrainer {
    weights: ParameterContainer,
    delta: Option<ParameterContainer>,
    gradient: ParameterContainer,
    samples: u64,
}

impl StaticTrainer {
    pub fn new(weights: Vec<Vec<f64>>, samples: u64) -> Self {
        let weights = ParameterContainer::from_vecs(weights);
        Self {
            gradient: weights.zeros_like(),
            weights,
            delta: None,
            samples,
        }
    }

    pub fn with_delta(mut self, delta: Vec<Vec<f64>>) -> Self {
        self.delta = Some(ParameterContainer::from_vecs(delta));
        self
    }

    pub fn with_gradient(mut self, gradient: Vec<Vec<f64>>) -> Self {
        self.gradient = ParameterContainer::from_vecs(gradient);
        self
    }
}

impl LocalTrainer for StaticTrainer {
    fn fit(&mut self, _: Option<&Proximal>) -> Result<Metrics, TrainerError> {
        if let Some(delta) = &self.delta {
            self.weights = self.weights.add(delta)?;
        }
        Ok(Metrics::new())
    }

    fn compute_gradient(&self) -> Result<ParameterContainer, TrainerError> {
        Ok(self.gradient.clone())
    }

    fn weights(&self) -> ParameterContainer {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: ParameterContainer) -> Result<(), TrainerError> {
        self.weights = weights;
        Ok(())
    }

    fn evaluate(&self) -> Result<Metrics, TrainerError> {
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), self.weights.flatten().iter().sum());
        Ok(metrics)
    }

    fn sample_count(&self) -> u64 {
        self.samples
    }

    fn clone_trainer(&self) -> Box<dyn LocalTrainer> {
        Box::new(self.clone())
    }
}

pub fn address(index: usize) -> ActorAddress {
    format!("actor:{}", index).into()
}

/// Gets the adjacency matrix of `n` fully connected actors.
pub fn complete(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| (0..n).map(|j| u8::from(i != j)).collect())
        .collect()
}

/// Gets the identities of the actors of a topology.
pub fn identities(adjacency: &[Vec<u8>]) -> Vec<Identity> {
    let addresses = (0..adjacency.len()).map(address).collect::<Vec<_>>();
    let topology = Topology::new(addresses.clone(), adjacency).unwrap();
    addresses
        .iter()
        .map(|address| topology.identity(address).unwrap())
        .collect()
}

/// Creates actors that talk to each other in-process.
pub fn actors(
    adjacency: &[Vec<u8>],
    settings: &RoundSettings,
    trainers: Vec<StaticTrainer>,
) -> Vec<Actor> {
    let settings = vec![settings.clone(); adjacency.len()];
    actors_with_settings(adjacency, settings, trainers)
}

/// Creates actors with individual settings that talk to each other in-process.
pub fn actors_with_settings(
    adjacency: &[Vec<u8>],
    settings: Vec<RoundSettings>,
    trainers: Vec<StaticTrainer>,
) -> Vec<Actor> {
    let identities = identities(adjacency);
    let handles = identities
        .iter()
        .zip(settings.iter().zip(trainers.iter()))
        .map(|(identity, (settings, trainer))| {
            service_handle(identity, settings, trainer).unwrap()
        })
        .collect::<Vec<ServiceHandle>>();
    identities
        .into_iter()
        .zip(settings.into_iter().zip(trainers))
        .map(|(identity, (settings, trainer))| {
            let peers = identity
                .neighbors
                .iter()
                .map(|neighbor| {
                    let peer = LocalPeer::new(handles[neighbor.index].clone());
                    (neighbor.address.clone(), Arc::new(peer) as Arc<dyn Peer>)
                })
                .collect::<BTreeMap<_, _>>();
            let recorder = RunRecorder::new(identity.address.clone(), RecordPaths::default());
            let handle = handles[identity.index].clone();
            Actor::new(
                identity,
                settings,
                Box::new(trainer),
                handle,
                peers,
                recorder,
            )
            .unwrap()
        })
        .collect()
}

/// Runs all actors to completion, failing if they don't finish within a few seconds.
pub async fn run(actors: Vec<Actor>) -> Vec<Actor> {
    let tasks = actors.into_iter().map(|mut actor| {
        tokio::spawn(async move {
            actor.run().await?;
            Ok::<_, crate::actor::ActorError>(actor)
        })
    });
    timeout(Duration::from_secs(10), join_all(tasks))
        .await
        .expect("the actors didn't finish")
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect()
}

/// Gets the flattened weights of every actor.
pub fn weights(actors: &[Actor]) -> Vec<Vec<f64>> {
    actors
        .iter()
        .map(|actor| actor.trainer().weights().flatten())
        .collect()
}
