use crate::{
    actor::RoundSettings,
    aggregation::Algorithm,
    common::records::Phase,
    compression::Compression,
    market::SynchronizationStrategy,
    model::UpdateKind,
    tests::utils::{actors, address, complete, run, weights, StaticTrainer},
};

fn settings(algorithm: Algorithm) -> RoundSettings {
    RoundSettings {
        rounds: 1,
        seed: 7,
        algorithm,
        strategy: SynchronizationStrategy::OneFromEach,
        ..RoundSettings::default()
    }
}

fn gradient_trainers() -> Vec<StaticTrainer> {
    vec![
        StaticTrainer::new(vec![vec![1.0]], 1).with_gradient(vec![vec![0.5]]),
        StaticTrainer::new(vec![vec![1.0]], 1).with_gradient(vec![vec![1.0]]),
        StaticTrainer::new(vec![vec![1.0]], 2).with_gradient(vec![vec![1.5]]),
    ]
}

#[tokio::test]
async fn test_fed_nova_equals_gradient_averaging() {
    let nova = Algorithm::FedNova {
        a_value: 1.0,
        tau_eff: 1.0,
        learning_rate: 0.5,
    };
    let nova = run(actors(&complete(3), &settings(nova), gradient_trainers())).await;
    let average = Algorithm::GradientAverage { learning_rate: 0.5 };
    let average = run(actors(&complete(3), &settings(average), gradient_trainers())).await;

    // 1 - 0.5 * (0.5 + 1 + 2 * 1.5) / 4
    assert_eq!(weights(&nova), vec![vec![0.4375]; 3]);
    assert_eq!(weights(&nova), weights(&average));
    assert_eq!(
        nova[0].recorder().messages_to(&address(1))[0].kind,
        UpdateKind::Gradient
    );
}

#[tokio::test]
async fn test_fed_nova_negative_a_value_flips_the_step() {
    let nova = Algorithm::FedNova {
        a_value: -2.0,
        tau_eff: 1.0,
        learning_rate: 0.5,
    };
    let actors = run(actors(&complete(3), &settings(nova), gradient_trainers())).await;
    assert_eq!(weights(&actors), vec![vec![1.5625]; 3]);
}

#[tokio::test]
async fn test_fed_nova_fit_evaluates_the_local_step() {
    let nova = Algorithm::FedNova {
        a_value: 1.0,
        tau_eff: 1.0,
        learning_rate: 0.5,
    };
    let actors = run(actors(&complete(3), &settings(nova), gradient_trainers())).await;

    // the training loss of the static trainer is the sum of the weights, 1 - 0.5 * 1.5
    let fit = actors[2]
        .recorder()
        .performance()
        .iter()
        .filter(|record| record.phase == Phase::Fit && record.metric == "loss")
        .map(|record| record.value)
        .collect::<Vec<_>>();
    assert_eq!(fit, vec![0.25]);
}

#[tokio::test]
async fn test_sparse_gradients() {
    let trainers = (0..3)
        .map(|_| {
            StaticTrainer::new(vec![vec![0.0, 0.0]], 1).with_gradient(vec![vec![1.0, -2.0]])
        })
        .collect();
    let settings = RoundSettings {
        compression: Compression::TopK { k: 1 },
        ..settings(Algorithm::GradientAverage {
            learning_rate: 0.25,
        })
    };
    let actors = run(actors(&complete(3), &settings, trainers)).await;

    // only the largest magnitude survives, locally as well as on the wire
    assert_eq!(weights(&actors), vec![vec![0.0, 0.5]; 3]);
    for actor in &actors {
        for neighbor in &actor.identity().neighbors {
            assert_eq!(
                actor.recorder().messages_to(&neighbor.address)[0].kind,
                UpdateKind::SparseGradient
            );
        }
    }
}

#[tokio::test]
async fn test_quantized_deltas() {
    let trainers = (0..3)
        .map(|i| StaticTrainer::new(vec![vec![0.0, 0.0]], 1).with_delta(vec![vec![i as f64, 1.0]]))
        .collect();
    let settings = RoundSettings {
        compression: Compression::Quantize { precision: 16 },
        ..settings(Algorithm::FedAvg)
    };
    let actors = run(actors(&complete(3), &settings, trainers)).await;

    for weights in weights(&actors) {
        assert!((weights[0] - 1.0).abs() < 1e-3);
        assert!((weights[1] - 1.0).abs() < 1e-3);
    }
}

#[tokio::test]
async fn test_consensus_with_gradient_correction() {
    let trainers = (0..3)
        .map(|_| StaticTrainer::new(vec![vec![1.0]], 1).with_gradient(vec![vec![1.0]]))
        .collect();
    let algorithm = Algorithm::ConsensusGradient {
        epsilon: 1.0,
        alpha: None,
        mu: 1.0,
        beta: None,
        smoothing: 0.99,
    };
    let settings = RoundSettings {
        rounds: 2,
        ..settings(algorithm)
    };
    let actors = run(actors(&complete(3), &settings, trainers)).await;

    // the first round exchanges zero predictions, the second one the smoothed gradients, which
    // travel as f32
    for weights in weights(&actors) {
        assert!((weights[0] - (1.0 - 2.0 * 0.5 * 0.99)).abs() < 1e-6);
    }
    for message in actors[2].recorder().messages_to(&address(0)) {
        assert_eq!(message.kind, UpdateKind::WeightsAndGradient);
    }
}
