use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::time::timeout;

use crate::{
    actor::{service_handle, Actor, RoundSettings},
    common::records::{RecordPaths, RunRecorder},
    market::SynchronizationStrategy,
    service::{peer::MockPeer, Peer, PeerError},
    termination::TerminationState,
    tests::utils::{
        actors_with_settings,
        address,
        complete,
        identities,
        run,
        weights,
        StaticTrainer,
    },
};

fn settings(rounds: u32) -> RoundSettings {
    RoundSettings {
        rounds,
        strategy: SynchronizationStrategy::Available,
        ..RoundSettings::default()
    }
}

#[tokio::test]
async fn test_actors_wait_for_the_slowest_neighbor() {
    let trainers = (0..3)
        .map(|_| StaticTrainer::new(vec![vec![1.0]], 1))
        .collect();
    let actors = actors_with_settings(
        &complete(3),
        vec![settings(1), settings(4), settings(2)],
        trainers,
    );
    let actors = run(actors).await;

    for actor in &actors {
        assert_eq!(actor.handle().termination().state(), TerminationState::AllReady);
        for neighbor in &actor.identity().neighbors {
            assert!(actor.handle().termination().is_granted(&neighbor.address));
        }
    }
    assert_eq!(weights(&actors), vec![vec![1.0]; 3]);
}

#[tokio::test]
async fn test_failed_termination_notifications_are_swallowed() {
    let identities = identities(&complete(2));
    let trainer = StaticTrainer::new(vec![vec![1.0]], 1);
    let handle = service_handle(&identities[0], &settings(1), &trainer).unwrap();

    let mut peer = MockPeer::new();
    peer.expect_transfer_model_update()
        .times(1)
        .returning(|_| Ok(()));
    peer.expect_allow_termination().times(1).returning(|_| {
        Err(PeerError::Evaluation {
            address: address(1),
            reason: "shutting down".into(),
        })
    });
    let mut peers = BTreeMap::new();
    peers.insert(address(1), Arc::new(peer) as Arc<dyn Peer>);

    let mut actor = Actor::new(
        identities[0].clone(),
        settings(1),
        Box::new(trainer),
        handle.clone(),
        peers,
        RunRecorder::new(address(0), RecordPaths::default()),
    )
    .unwrap();
    let task = tokio::spawn(async move {
        actor.run().await.unwrap();
        actor
    });

    // the neighbor hasn't finished yet, so the actor keeps waiting
    let mut state = handle.termination().subscribe();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == TerminationState::SelfReady),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!task.is_finished());

    handle.allow_termination(&address(1));
    let actor = timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(actor.handle().termination().state(), TerminationState::AllReady);
}
