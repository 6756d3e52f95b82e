//! End-to-end engine runs against the scripted driver.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

use crasher::detector::{DetectorConfig, HotstreakDetector, PatternConfig, SeriesKind};
use crasher::driver::DriverError;
use crasher::engine::{Engine, EngineConfig, EngineHandle};
use crasher::recovery::RecoveredState;
use crasher::store::Store;
use crasher::strategy::policy::StakePolicy;
use crasher::strategy::{StrategyBook, StrategyConfig};
use crasher::types::{BetOutcome, ControlCommand, StreakClass};

use super::mock_driver::{mock_driver, MockDriverHandle};

struct Rig {
    driver: MockDriverHandle,
    engine: EngineHandle,
    store: Store,
    session_id: Uuid,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn spawn_engine(
    strategies: Vec<StrategyConfig>,
    balance: Option<Decimal>,
    detector: DetectorConfig,
) -> Rig {
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(balance).await.unwrap();
    spawn_engine_on(store, session_recovered(session), strategies, detector).await
}

fn session_recovered(session: crasher::types::Session) -> RecoveredState {
    RecoveredState {
        session,
        resumed: false,
        detector_seed: Vec::new(),
        strategy_seeds: HashMap::new(),
        resolved_pending: Vec::new(),
    }
}

async fn spawn_engine_on(
    store: Store,
    recovered: RecoveredState,
    strategies: Vec<StrategyConfig>,
    detector: DetectorConfig,
) -> Rig {
    let (driver, driver_handle) = mock_driver();
    let session_id = recovered.session.session_id;

    let (engine, engine_handle) = Engine::new(
        Box::new(driver),
        store.clone(),
        EngineConfig { retry_backoff_ms: 1, ..EngineConfig::default() },
        HotstreakDetector::new(detector),
        PatternConfig::default(),
        StrategyBook::from_configs(&strategies),
        recovered,
        Decimal::ZERO,
    );
    let task = tokio::spawn(engine.run());

    Rig { driver: driver_handle, engine: engine_handle, store, session_id, task }
}

fn fixed(name: &str, stake: Decimal, target: f64) -> StrategyConfig {
    StrategyConfig {
        name: name.to_string(),
        enabled: true,
        target_cashout: target,
        manual: false,
        policy: StakePolicy::Fixed { stake },
        trigger: None,
        arm_on_pre_streak: false,
        max_consecutive_losses: 50,
        cooldown_rounds: 0,
        stop_profit_wins: None,
    }
}

async fn stop_and_join(rig: &mut Rig) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.engine.control.send(ControlCommand::Stop).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), &mut rig.task)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------------------
// Strategy progression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_martingale_progression_end_to_end() {
    let strategy = StrategyConfig {
        policy: StakePolicy::Martingale {
            base: dec!(10),
            multiplier: dec!(2),
            max_stake: dec!(1000),
        },
        ..fixed("doubler", dec!(10), 2.0)
    };
    let mut rig = spawn_engine(vec![strategy], Some(dec!(10_000)), DetectorConfig::default()).await;

    // Two losses then a win.
    rig.driver.send_round(1.5);
    rig.driver.send_round(1.4);
    rig.driver.send_round(2.5);
    stop_and_join(&mut rig).await;

    assert_eq!(rig.driver.placed_stakes(), vec![dec!(10), dec!(20), dec!(40)]);

    let bets = rig.store.session_bets(rig.session_id).await.unwrap();
    assert_eq!(bets.len(), 3);
    assert_eq!(bets[0].outcome, BetOutcome::Lost);
    assert_eq!(bets[1].outcome, BetOutcome::Lost);
    assert_eq!(bets[2].outcome, BetOutcome::Won { payout: dec!(40.0) });
}

#[tokio::test]
async fn test_signal_gated_strategy_waits_for_hot_streak() {
    let strategy = StrategyConfig {
        policy: StakePolicy::SignalGated {
            base: dec!(10),
            multiplier: dec!(2),
            max_stake: dec!(100),
            target: StreakClass::Hot,
            min_confidence: 0.5,
        },
        ..fixed("streak-rider", dec!(10), 2.0)
    };
    let detector = DetectorConfig {
        window_capacity: 20,
        short_len: 5,
        long_len: 15,
        threshold_sigma: 1.5,
        high_multiplier: 2.0,
        series: SeriesKind::Multiplier,
    };
    let mut rig = spawn_engine(vec![strategy], Some(dec!(10_000)), detector).await;

    // Quiet baseline, then a surge. The gate stays closed through all of
    // it (insufficient data, then the signal only fires once the window
    // fills), and opens for the 21st round.
    for _ in 0..15 {
        rig.driver.send_round(2.0);
    }
    for _ in 0..5 {
        rig.driver.send_round(4.0);
    }
    rig.driver.send_round(4.2);
    stop_and_join(&mut rig).await;

    let bets = rig.store.session_bets(rig.session_id).await.unwrap();
    assert_eq!(bets.len(), 1, "gated strategy must bet exactly once");
    assert!(matches!(bets[0].outcome, BetOutcome::Won { .. }));

    let rounds = rig.store.session_rounds(rig.session_id).await.unwrap();
    assert_eq!(rounds.len(), 21);
}

// ---------------------------------------------------------------------------
// Crash / recovery equivalence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mid_round_crash_recovery_matches_uninterrupted_run() {
    let round_id = Uuid::new_v4();

    // Uninterrupted reference run.
    let mut reference =
        spawn_engine(vec![fixed("steady", dec!(10), 2.0)], Some(dec!(1000)), DetectorConfig::default())
            .await;
    reference.driver.send_multiplier(round_id, 1, 1.0);
    reference.driver.send_multiplier(round_id, 2, 2.1);
    reference.driver.send_multiplier(round_id, 3, 2.6);
    reference.driver.send_settled(round_id, 3.0);
    stop_and_join(&mut reference).await;
    let reference_bets = reference.store.session_bets(reference.session_id).await.unwrap();
    assert_eq!(reference_bets.len(), 1);

    // Interrupted run: the process dies mid-round, after the trajectory
    // reached the cash-out target.
    let store = Store::open_in_memory().await.unwrap();
    let session = store.create_session(Some(dec!(1000))).await.unwrap();
    let rig = spawn_engine_on(
        store.clone(),
        session_recovered(session),
        vec![fixed("steady", dec!(10), 2.0)],
        DetectorConfig::default(),
    )
    .await;
    rig.driver.send_multiplier(round_id, 1, 1.0);
    rig.driver.send_multiplier(round_id, 2, 2.1);
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.task.abort();
    let _ = rig.task.await;

    // Recover on the same store, then resume and complete the round with
    // the identical downstream events.
    let (mut recovery_driver, _recovery_handle) = mock_driver();
    let recovered = crasher::recovery::recover(
        &store,
        &mut recovery_driver,
        &crasher::recovery::RecoveryConfig::default(),
        50,
    )
    .await
    .unwrap();
    assert!(recovered.resumed);

    let mut resumed = spawn_engine_on(
        store.clone(),
        recovered,
        vec![fixed("steady", dec!(10), 2.0)],
        DetectorConfig::default(),
    )
    .await;
    resumed.driver.send_multiplier(round_id, 3, 2.6);
    resumed.driver.send_settled(round_id, 3.0);
    stop_and_join(&mut resumed).await;

    // Same bet outcomes as the uninterrupted run.
    let recovered_bets = store.session_bets(resumed.session_id).await.unwrap();
    assert_eq!(recovered_bets.len(), reference_bets.len());
    assert_eq!(recovered_bets[0].outcome, reference_bets[0].outcome);
    assert_eq!(recovered_bets[0].stake, reference_bets[0].stake);
    assert!(store.pending_bets().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Driver failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_repeated_transient_failures_are_fatal_but_clean() {
    let mut rig =
        spawn_engine(vec![fixed("steady", dec!(10), 2.0)], Some(dec!(1000)), DetectorConfig::default())
            .await;

    // A bet goes in flight, then the stream dies for good.
    let round_id = Uuid::new_v4();
    rig.driver.send_multiplier(round_id, 1, 1.0);
    for _ in 0..6 {
        rig.driver.send(Err(DriverError::Unreachable("connection refused".into())));
    }

    let result = tokio::time::timeout(Duration::from_secs(5), &mut rig.task)
        .await
        .expect("engine did not halt")
        .unwrap();
    assert!(result.is_err());

    // The session is closed and no bet is left in an ambiguous state.
    let session = rig.store.last_session().await.unwrap().unwrap();
    assert!(!session.is_active());
    assert!(rig.store.pending_bets().await.unwrap().is_empty());

    let bets = rig.store.session_bets(rig.session_id).await.unwrap();
    assert_eq!(bets.len(), 1);
    assert_eq!(bets[0].outcome, BetOutcome::Unknown);
}

#[tokio::test]
async fn test_stale_session_reconnects_and_continues() {
    let mut rig =
        spawn_engine(vec![fixed("steady", dec!(10), 2.0)], Some(dec!(1000)), DetectorConfig::default())
            .await;

    rig.driver.send(Err(DriverError::StaleSession));
    rig.driver.send_round(2.5);
    stop_and_join(&mut rig).await;

    assert_eq!(rig.driver.reconnects.load(Ordering::SeqCst), 1);
    let rounds = rig.store.session_rounds(rig.session_id).await.unwrap();
    assert_eq!(rounds.len(), 1);
    let bets = rig.store.session_bets(rig.session_id).await.unwrap();
    assert_eq!(bets.len(), 1);
    assert!(matches!(bets[0].outcome, BetOutcome::Won { .. }));
}
