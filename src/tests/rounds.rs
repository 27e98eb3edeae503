use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::time::timeout;

use crate::{
    actor::{service_handle, Actor, ActorError, RoundSettings},
    aggregation::Algorithm,
    common::records::{Phase, RecordPaths, RunRecorder},
    compression::Compression,
    market::SynchronizationStrategy,
    model::{ModelUpdate, ParameterContainer, UpdateKind, UpdateMessage, UpdatePayload},
    participation::Participation,
    partition::{PartitionError, PartitionScheme},
    service::{peer::MockPeer, Peer},
    termination::TerminationState,
    tests::utils::{
        actors,
        address,
        complete,
        enable_logging,
        identities,
        run,
        weights,
        StaticTrainer,
    },
    topology::TopologyError,
};

fn settings(rounds: u32, algorithm: Algorithm) -> RoundSettings {
    RoundSettings {
        rounds,
        seed: 42,
        algorithm,
        strategy: SynchronizationStrategy::OneFromEach,
        ..RoundSettings::default()
    }
}

#[tokio::test]
async fn test_ring_keeps_unchanged_weights() {
    enable_logging();
    let trainers = (0..3).map(|_| StaticTrainer::new(vec![vec![1.0]], 10)).collect();
    let actors = actors(&complete(3), &settings(2, Algorithm::FedAvg), trainers);

    let actors = run(actors).await;

    for actor in &actors {
        assert_eq!(actor.trainer().weights().flatten(), vec![1.0]);
        assert_eq!(actor.handle().termination().state(), TerminationState::AllReady);
        assert!(actor.handle().updates().is_empty());

        let records = actor.recorder().performance();
        let aggregations = records
            .iter()
            .filter(|record| record.phase == Phase::Aggregate)
            .map(|record| (record.round, record.value))
            .collect::<Vec<_>>();
        assert_eq!(aggregations, vec![(1, 3.0), (2, 3.0)]);
        for neighbor in &actor.identity().neighbors {
            let messages = actor.recorder().messages_to(&neighbor.address);
            assert_eq!(messages.len(), 2);
            assert!(messages
                .iter()
                .all(|message| message.kind == UpdateKind::WeightDelta));
        }
    }
}

#[tokio::test]
async fn test_fed_avg_averages_deltas() {
    let trainers = vec![
        StaticTrainer::new(vec![vec![0.0, 0.0]], 1).with_delta(vec![vec![1.0, 2.0]]),
        StaticTrainer::new(vec![vec![0.0, 0.0]], 1).with_delta(vec![vec![2.0, 4.0]]),
        StaticTrainer::new(vec![vec![0.0, 0.0]], 2).with_delta(vec![vec![3.0, 6.0]]),
    ];
    let actors = run(actors(&complete(3), &settings(1, Algorithm::FedAvg), trainers)).await;

    // (1 * 1 + 1 * 2 + 2 * 3) / 4
    for weights in weights(&actors) {
        assert_eq!(weights, vec![2.25, 4.5]);
    }
}

fn bits(weights: &[Vec<f64>]) -> Vec<Vec<u64>> {
    weights
        .iter()
        .map(|weights| weights.iter().map(|w| w.to_bits()).collect())
        .collect()
}

#[tokio::test]
async fn test_partitioned_matches_fed_avg() {
    // none of the deltas nor their weighted sums are exact in single precision
    let trainers = || {
        vec![
            StaticTrainer::new(vec![vec![1.0], vec![2.0], vec![3.0]], 3)
                .with_delta(vec![vec![0.1], vec![0.2], vec![0.7]]),
            StaticTrainer::new(vec![vec![1.0], vec![2.0], vec![3.0]], 5)
                .with_delta(vec![vec![0.2], vec![0.7], vec![0.1]]),
            StaticTrainer::new(vec![vec![1.0], vec![2.0], vec![3.0]], 7)
                .with_delta(vec![vec![0.7], vec![0.1], vec![0.2]]),
        ]
    };
    let fed_avg = weights(&run(actors(&complete(3), &settings(2, Algorithm::FedAvg), trainers())).await);
    let agreed = bits(&fed_avg);
    assert!(agreed.iter().all(|weights| *weights == agreed[0]));
    // 1 + 2 * (3 * 0.1 + 5 * 0.2 + 7 * 0.7) / 15
    assert!((fed_avg[0][0] - (1.0 + 2.0 * 6.2 / 15.0)).abs() < 1e-5);

    for scheme in [PartitionScheme::LayerWise, PartitionScheme::Balanced] {
        let partitioned = run(actors(
            &complete(3),
            &settings(2, Algorithm::Partitioned { scheme }),
            trainers(),
        ))
        .await;
        assert_eq!(bits(&weights(&partitioned)), bits(&fed_avg));
        for actor in &partitioned {
            assert!(actor.handle().partitions().is_empty());
        }
    }
}

#[tokio::test]
async fn test_malformed_partition_fails_the_round() {
    let identities = identities(&complete(2));
    let trainer = StaticTrainer::new(vec![vec![1.0], vec![2.0]], 1);
    let settings = settings(
        1,
        Algorithm::Partitioned {
            scheme: PartitionScheme::LayerWise,
        },
    );
    let handle = service_handle(&identities[0], &settings, &trainer).unwrap();

    // actor:1 owns the second layer and sends its delta of the first one, then a partition whose
    // payload can't be decoded
    let mut rng = ChaCha20Rng::seed_from_u64(0);
    let delta = ModelUpdate::new(
        address(1),
        UpdatePayload::WeightDelta(ParameterContainer::from_vecs(vec![vec![0.5]])),
        1,
    );
    handle.transfer_model_update(UpdateMessage::encode(&delta, &Compression::None, &mut rng).unwrap());
    let partition = ModelUpdate::partition(address(1), ParameterContainer::from_vecs(vec![vec![2.0]]));
    let mut malformed = UpdateMessage::encode(&partition, &Compression::None, &mut rng).unwrap();
    if let Some(payload) = malformed.weights.as_mut() {
        payload.parameters.layers[0].bytes.truncate(1);
    }
    handle.transfer_model_update(malformed);
    assert_eq!(handle.updates().pending(&address(1)), 1);
    assert_eq!(handle.partitions().pending(&address(1)), 1);

    let mut peer = MockPeer::new();
    peer.expect_transfer_model_update().returning(|_| Ok(()));
    let mut peers = BTreeMap::new();
    peers.insert(address(1), Arc::new(peer) as Arc<dyn Peer>);
    let mut actor = Actor::new(
        identities[0].clone(),
        settings,
        Box::new(trainer),
        handle,
        peers,
        RunRecorder::new(address(0), RecordPaths::default()),
    )
    .unwrap();

    let result = timeout(Duration::from_secs(5), actor.run()).await.unwrap();
    assert!(matches!(
        result,
        Err(ActorError::Partition(PartitionError::Missing(1)))
    ));
}

#[tokio::test]
async fn test_partitioned_with_more_actors_than_layers() {
    let trainers = (0..3)
        .map(|i| {
            StaticTrainer::new(vec![vec![1.0], vec![2.0]], 1)
                .with_delta(vec![vec![i as f64], vec![1.0]])
        })
        .collect();
    let algorithm = Algorithm::Partitioned {
        scheme: PartitionScheme::LayerWise,
    };
    let actors = run(actors(&complete(3), &settings(1, algorithm), trainers)).await;

    // the last actor owns no layer, the others average over (0, 1, 2) and (1, 1, 1)
    for weights in weights(&actors) {
        assert_eq!(weights, vec![2.0, 3.0]);
    }
}

#[tokio::test]
async fn test_partial_participation_sends_empty_updates() {
    let trainers = (0..3).map(|_| StaticTrainer::new(vec![vec![1.0]], 10)).collect();
    let settings = RoundSettings {
        participation: Participation::RandomK { k: 1 },
        ..settings(3, Algorithm::FedAvg)
    };
    let actors = run(actors(&complete(3), &settings, trainers)).await;

    for actor in &actors {
        let sent = actor
            .identity()
            .neighbors
            .iter()
            .map(|neighbor| actor.recorder().messages_to(&neighbor.address).len())
            .sum::<usize>();
        assert_eq!(sent, 3);
        assert_eq!(actor.trainer().weights().flatten(), vec![1.0]);
    }
}

#[tokio::test]
async fn test_consensus_on_a_line() {
    let line = vec![vec![0, 1, 0], vec![1, 0, 1], vec![0, 1, 0]];
    let trainers = vec![
        StaticTrainer::new(vec![vec![0.0]], 1),
        StaticTrainer::new(vec![vec![3.0]], 1),
        StaticTrainer::new(vec![vec![6.0]], 1),
    ];
    let algorithm = Algorithm::Consensus {
        epsilon: 1.0,
        alpha: None,
    };
    let actors = run(actors(&line, &settings(1, algorithm), trainers)).await;

    assert_eq!(weights(&actors), vec![vec![3.0], vec![3.0], vec![3.0]]);
    assert_eq!(
        actors[1].recorder().messages_to(&address(0))[0].kind,
        UpdateKind::Weights
    );
}

#[tokio::test]
async fn test_averaging_requires_full_connectivity() {
    let line = vec![vec![0, 1, 0], vec![1, 0, 1], vec![0, 1, 0]];
    let identities = identities(&line);
    let trainer = StaticTrainer::new(vec![vec![1.0]], 1);
    let settings = settings(1, Algorithm::FedAvg);
    let handle = service_handle(&identities[0], &settings, &trainer).unwrap();

    let result = Actor::new(
        identities[0].clone(),
        settings,
        Box::new(trainer),
        handle,
        Default::default(),
        RunRecorder::new(address(0), RecordPaths::default()),
    );
    assert!(matches!(
        result,
        Err(ActorError::Topology(TopologyError::NotFullyConnected(_)))
    ));
}
