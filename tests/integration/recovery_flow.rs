//! Recovery and replay-determinism scenarios against a real store.

use chrono::Utc;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crasher::detector::{DetectorConfig, HotstreakDetector};
use crasher::recovery::{recover, RecoveryConfig};
use crasher::store::Store;
use crasher::types::{Bet, BetOutcome, MultiplierEvent};

use super::mock_driver::mock_driver;

async fn settle_rounds(store: &Store, session_id: Uuid, crashes: &[f64]) {
    for crash in crashes {
        let round_id = Uuid::new_v4();
        store.open_round(round_id, session_id, Utc::now()).await.unwrap();
        store
            .append_event(&MultiplierEvent {
                round_id,
                sequence_id: 1,
                value: 1.0,
                observed_at: Utc::now(),
            })
            .await
            .unwrap();
        store.settle_round(round_id, *crash, &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_detector_replay_matches_live_signal() {
    let crashes = [1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9, 4.1, 1.0, 2.8,
                   3.3, 1.4, 2.6, 1.8, 7.2, 2.1, 1.3, 3.9, 2.4, 1.6];
    let config = DetectorConfig { window_capacity: 20, ..DetectorConfig::default() };

    // Live path: observe each settlement as it happens.
    let mut live = HotstreakDetector::new(config.clone());
    let mut live_signal = None;
    for crash in crashes {
        live_signal = Some(live.observe(crash));
    }

    // Recovery path: persist the same history, recover, seed a fresh
    // detector from the seed.
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(None).await.unwrap();
    settle_rounds(&store, session.session_id, &crashes).await;

    let (mut driver, _handle) = mock_driver();
    let recovered = recover(&store, &mut driver, &RecoveryConfig::default(), 20)
        .await
        .unwrap();

    let mut replayed = HotstreakDetector::new(config);
    replayed.seed(recovered.detector_seed);

    assert_eq!(replayed.signal(), live_signal.unwrap());
}

#[tokio::test]
async fn test_gap_round_excluded_from_detector_seed() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(None).await.unwrap();

    settle_rounds(&store, session.session_id, &[1.5, 2.5]).await;

    // A settled round whose event stream has a hole (sequence 2 missing):
    // its crash must not poison the statistics.
    let gappy = Uuid::new_v4();
    store.open_round(gappy, session.session_id, Utc::now()).await.unwrap();
    for seq in [1u64, 3] {
        store
            .append_event(&MultiplierEvent {
                round_id: gappy,
                sequence_id: seq,
                value: seq as f64,
                observed_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    store.settle_round(gappy, 99.0, &[]).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;

    settle_rounds(&store, session.session_id, &[3.5]).await;

    let (mut driver, _handle) = mock_driver();
    let recovered = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
        .await
        .unwrap();

    assert!(recovered.resumed);
    assert_eq!(recovered.detector_seed, vec![1.5, 2.5, 3.5]);
}

#[tokio::test]
async fn test_page_alignment_backfills_into_resumed_session() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(None).await.unwrap();
    settle_rounds(&store, session.session_id, &[1.2, 3.4, 2.0, 1.1, 5.6]).await;

    // The page saw two more rounds than we recorded before dying.
    let (mut driver, handle) = mock_driver();
    handle.set_history(vec![1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9]);

    let recovered = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
        .await
        .unwrap();

    assert!(recovered.resumed);
    assert_eq!(recovered.detector_seed, vec![1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9]);

    let rounds = store.session_rounds(session.session_id).await.unwrap();
    assert_eq!(rounds.len(), 7);
    assert!(rounds.iter().all(|r| r.is_settled()));
}

#[tokio::test]
async fn test_unmatchable_page_history_leaves_store_untouched() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(None).await.unwrap();
    settle_rounds(&store, session.session_id, &[1.2, 3.4, 2.0, 1.1, 5.6]).await;

    // Page history from some other table entirely: no aligned run.
    let (mut driver, handle) = mock_driver();
    handle.set_history(vec![9.1, 8.2, 7.3, 6.4, 5.5, 4.6]);

    let recovered = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
        .await
        .unwrap();

    assert_eq!(recovered.detector_seed, vec![1.2, 3.4, 2.0, 1.1, 5.6]);
    assert_eq!(store.session_rounds(session.session_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_recovered_pending_bet_keeps_strategy_honest() {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(Some(dec!(1000))).await.unwrap();

    // Round died before the target was reached: outcome is unknowable.
    let round_id = Uuid::new_v4();
    store.open_round(round_id, session.session_id, Utc::now()).await.unwrap();
    store
        .append_event(&MultiplierEvent {
            round_id,
            sequence_id: 1,
            value: 1.3,
            observed_at: Utc::now(),
        })
        .await
        .unwrap();
    let bet = Bet {
        bet_id: Uuid::new_v4(),
        session_id: session.session_id,
        round_id,
        strategy_name: "steady".into(),
        stake: dec!(10),
        target_cashout: Some(2.0),
        outcome: BetOutcome::Pending,
        placed_at: Utc::now(),
        resolved_at: None,
    };
    store.record_bet(&bet).await.unwrap();

    let (mut driver, _handle) = mock_driver();
    let recovered = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
        .await
        .unwrap();

    assert_eq!(recovered.resolved_pending.len(), 1);
    assert_eq!(recovered.resolved_pending[0].1, BetOutcome::Unknown);

    // Neither a win nor a loss was attributed.
    let seed = recovered.strategy_seeds.get("steady").unwrap();
    assert_eq!(seed.wins, 0);
    assert_eq!(seed.consecutive_losses, 0);
}
