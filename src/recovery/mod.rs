//! Session recovery and backfill.
//!
//! Runs once at startup, before the control loop: resumes the last
//! session (or opens a new one), reconciles stored history against the
//! crash history visible on the page, resolves bets left pending by a
//! crash or connectivity gap, and produces the seeds the engine needs to
//! continue as if it had never stopped. Recovery is the only writer to
//! the store besides the engine and never runs concurrently with it.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::driver::GameDriver;
use crate::store::Store;
use crate::types::{Bet, BetOutcome, Session};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_min_match_run() -> usize {
    5
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_max_pattern() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Shortest aligned run accepted when matching stored history against
    /// page history.
    #[serde(default = "default_min_match_run")]
    pub min_match_run: usize,
    /// Multiplier equality tolerance for alignment.
    #[serde(default = "default_tolerance")]
    pub match_tolerance: f64,
    /// Longest stored pattern tried during alignment.
    #[serde(default = "default_max_pattern")]
    pub max_pattern: usize,
    /// Seed a brand-new session with the page's visible history.
    #[serde(default = "default_true")]
    pub import_on_new: bool,
    /// Assumed seconds per round when synthesizing backfill timestamps.
    #[serde(default = "default_backfill_secs")]
    pub backfill_secs_per_round: i64,
}

fn default_backfill_secs() -> i64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_match_run: default_min_match_run(),
            match_tolerance: default_tolerance(),
            max_pattern: default_max_pattern(),
            import_on_new: true,
            backfill_secs_per_round: default_backfill_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Per-strategy streak counters reconstructed from resolved bets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategySeed {
    pub consecutive_losses: u32,
    pub wins: u32,
}

/// Everything the engine needs to resume.
pub struct RecoveredState {
    pub session: Session,
    /// True when an interrupted session was resumed rather than replaced.
    pub resumed: bool,
    /// Crash history feeding the detector window, oldest first.
    pub detector_seed: Vec<f64>,
    pub strategy_seeds: HashMap<String, StrategySeed>,
    /// Pending bets found at startup and how they were resolved.
    pub resolved_pending: Vec<(Bet, BetOutcome)>,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Reconstruct in-memory state from the store, backfilling from the
/// driver's visible history where possible.
pub async fn recover(
    store: &Store,
    driver: &mut dyn GameDriver,
    config: &RecoveryConfig,
    detector_window: u32,
) -> Result<RecoveredState> {
    let page_history = match driver.replay_history().await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "Page history unavailable — gaps will be unrecoverable");
            Vec::new()
        }
    };
    let balance = driver.balance().await.unwrap_or(None);

    let last = store.last_session().await?;
    let (session, resumed) = match last {
        Some(s) if s.is_active() => {
            info!(session = %s, "Resuming interrupted session");
            (s, true)
        }
        _ => {
            let s = store.create_session(balance).await?;
            info!(session = %s, "Opened new session");
            (s, false)
        }
    };

    let resolved_pending = resolve_pending_bets(store).await?;

    if resumed {
        reconcile_rounds(store, &session, config).await?;
        backfill_from_page(store, &session, &page_history, config).await?;
    } else if config.import_on_new && !page_history.is_empty() {
        let now = Utc::now();
        let span = Duration::seconds(config.backfill_secs_per_round * page_history.len() as i64);
        store
            .backfill_rounds(session.session_id, &page_history, now - span, now)
            .await?;
        info!(count = page_history.len(), "Imported page history into new session");
    }

    let (detector_seed, strategy_seeds) = futures::try_join!(
        store.settled_crashes(session.session_id, detector_window),
        seed_strategies(store, &session),
    )?;

    info!(
        session_id = %session.session_id,
        resumed,
        detector_samples = detector_seed.len(),
        pending_resolved = resolved_pending.len(),
        "Recovery complete"
    );

    Ok(RecoveredState {
        session,
        resumed,
        detector_seed,
        strategy_seeds,
        resolved_pending,
    })
}

/// Resolve bets left `pending` by a crash. A bet whose round settled in
/// the store resolves exactly as live settlement would; one whose round
/// never settled resolves from the recorded trajectory — a win only if
/// the target was provably reached — else `Unknown`.
async fn resolve_pending_bets(store: &Store) -> Result<Vec<(Bet, BetOutcome)>> {
    let pending = store.pending_bets().await?;
    let mut resolved = Vec::with_capacity(pending.len());

    for bet in pending {
        let round = store.round(bet.round_id).await?;
        let outcome = match round.as_ref().and_then(|r| r.crash_multiplier) {
            Some(crash) => match bet.resolve_against(crash) {
                // Manual bets have no target; without a cash-out ack there
                // is no evidence either way.
                BetOutcome::Unknown => BetOutcome::Unknown,
                other => other,
            },
            None => {
                let events = store.round_events(bet.round_id).await?;
                let peak = events.iter().map(|e| e.value).fold(f64::MIN, f64::max);
                match bet.target_cashout {
                    Some(target) if !events.is_empty() && target <= peak => BetOutcome::Won {
                        payout: bet.profit_at(target),
                    },
                    _ => BetOutcome::Unknown,
                }
            }
        };

        warn!(bet = %bet, resolution = %outcome, "Resolved orphaned pending bet");
        store.resolve_bet(bet.bet_id, &outcome).await?;
        resolved.push((bet, outcome));
    }

    Ok(resolved)
}

/// Flag rounds whose evidence is incomplete: unsettled rounds and rounds
/// with sequence gaps the page history cannot fill.
async fn reconcile_rounds(store: &Store, session: &Session, _config: &RecoveryConfig) -> Result<()> {
    let rounds = store.session_rounds(session.session_id).await?;

    for round in rounds {
        if round.excluded {
            continue;
        }
        if !round.is_settled() {
            warn!(round_id = %round.round_id, "Unsettled round — excluding from statistics");
            store.mark_round_excluded(round.round_id).await?;
            continue;
        }

        let events = store.round_events(round.round_id).await?;
        if !events.is_empty() && has_sequence_gap(&events.iter().map(|e| e.sequence_id).collect::<Vec<_>>()) {
            // The page only replays per-round crash values, so an
            // intra-round event gap is unrecoverable.
            warn!(round_id = %round.round_id, "Sequence gap — excluding from statistics");
            store.mark_round_excluded(round.round_id).await?;
        }
    }

    Ok(())
}

/// Detect whether sequence ids are non-contiguous or non-increasing.
pub fn has_sequence_gap(sequence_ids: &[u64]) -> bool {
    sequence_ids
        .windows(2)
        .any(|w| w[1] != w[0] + 1)
}

/// Align the session's stored crash history against the page's visible
/// history and backfill the rounds that happened while we were down.
async fn backfill_from_page(
    store: &Store,
    session: &Session,
    page_history: &[f64],
    config: &RecoveryConfig,
) -> Result<()> {
    if page_history.is_empty() {
        return Ok(());
    }

    let stored = store
        .settled_crashes(session.session_id, config.max_pattern as u32)
        .await
        .context("Failed to load stored crashes for alignment")?;

    if stored.is_empty() {
        // Nothing to align against; treat the page as the missing tail.
        let now = Utc::now();
        let span = Duration::seconds(config.backfill_secs_per_round * page_history.len() as i64);
        store
            .backfill_rounds(session.session_id, page_history, now - span, now)
            .await?;
        return Ok(());
    }

    match align_history(&stored, page_history, config.min_match_run, config.match_tolerance) {
        Some(missing) if !missing.is_empty() => {
            // Missing rounds happened between the last stored round and now.
            let now = Utc::now();
            let last_end = store
                .session_rounds(session.session_id)
                .await?
                .iter()
                .filter_map(|r| r.ended_at)
                .max()
                .unwrap_or_else(|| {
                    now - Duration::seconds(config.backfill_secs_per_round * missing.len() as i64)
                });
            store
                .backfill_rounds(session.session_id, &missing, last_end, now)
                .await?;
            info!(count = missing.len(), "Backfilled gap from page history");
        }
        Some(_) => {
            info!("Stored history is current — nothing to backfill");
        }
        None => {
            warn!("Could not align stored history with page — gap is unrecoverable");
        }
    }

    Ok(())
}

/// Find the stored tail inside the page history; returns the page suffix
/// after the aligned run (the rounds missing from the store), or `None`
/// when no run of at least `min_run` aligns.
pub fn align_history(
    stored: &[f64],
    page: &[f64],
    min_run: usize,
    tolerance: f64,
) -> Option<Vec<f64>> {
    let max_run = stored.len();
    if max_run < min_run {
        return None;
    }

    for run in (min_run..=max_run).rev() {
        let pattern = &stored[stored.len() - run..];
        if page.len() < run {
            continue;
        }
        for start in 0..=page.len() - run {
            let window = &page[start..start + run];
            if pattern
                .iter()
                .zip(window)
                .all(|(a, b)| (a - b).abs() < tolerance)
            {
                return Some(page[start + run..].to_vec());
            }
        }
    }

    None
}

/// Rebuild per-strategy streak counters from the session's resolved bets.
/// `Unknown` and `Rejected` outcomes are skipped so an ambiguous recovery
/// neither penalizes nor rewards a strategy twice.
async fn seed_strategies(store: &Store, session: &Session) -> Result<HashMap<String, StrategySeed>> {
    let bets = store.session_bets(session.session_id).await?;

    let mut seeds: HashMap<String, StrategySeed> = HashMap::new();
    for bet in &bets {
        let seed = seeds.entry(bet.strategy_name.clone()).or_default();
        match &bet.outcome {
            BetOutcome::Won { .. } => {
                seed.wins += 1;
                seed.consecutive_losses = 0;
            }
            BetOutcome::Lost => {
                seed.consecutive_losses += 1;
            }
            BetOutcome::Pending | BetOutcome::Unknown | BetOutcome::Rejected => {}
        }
    }

    Ok(seeds)
}

/// Convenience: the session's total realized P/L (won payouts minus lost
/// stakes), used to restore the engine's loss-limit accounting.
pub async fn session_pnl(store: &Store, session: &Session) -> Result<Decimal> {
    let bets = store.session_bets(session.session_id).await?;
    let mut pnl = Decimal::ZERO;
    for bet in bets {
        match bet.outcome {
            BetOutcome::Won { payout } => pnl += payout,
            BetOutcome::Lost => pnl -= bet.stake,
            _ => {}
        }
    }
    Ok(pnl)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BetAck, CashOutAck, Credentials, DriverError, DriverEvent};
    use crate::types::MultiplierEvent;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    /// Driver stub with a fixed page history.
    struct PageDriver {
        history: Vec<f64>,
    }

    #[async_trait]
    impl GameDriver for PageDriver {
        async fn login(&mut self, _: &Credentials) -> Result<(), DriverError> {
            Ok(())
        }
        async fn next_event(&mut self) -> Result<DriverEvent, DriverError> {
            Err(DriverError::Unreachable("stub".into()))
        }
        async fn place_bet(
            &mut self,
            _: Decimal,
            _: Option<f64>,
        ) -> Result<BetAck, DriverError> {
            Err(DriverError::Rejected("stub".into()))
        }
        async fn cash_out(&mut self) -> Result<CashOutAck, DriverError> {
            Err(DriverError::Rejected("stub".into()))
        }
        async fn replay_history(&mut self) -> Result<Vec<f64>, DriverError> {
            Ok(self.history.clone())
        }
        async fn balance(&mut self) -> Result<Option<Decimal>, DriverError> {
            Ok(Some(dec!(500)))
        }
        async fn keepalive(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn reconnect(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    async fn settle_rounds(store: &Store, session_id: Uuid, crashes: &[f64]) {
        for crash in crashes {
            let round_id = Uuid::new_v4();
            store.open_round(round_id, session_id, Utc::now()).await.unwrap();
            store.settle_round(round_id, *crash, &[]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    // ---- alignment ---------------------------------------------------------

    #[test]
    fn test_align_history_finds_missing_suffix() {
        let stored = [1.2, 3.4, 2.0, 1.1, 5.6];
        let page = [9.0, 1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9];
        let missing = align_history(&stored, &page, 5, 0.01).unwrap();
        assert_eq!(missing, vec![2.2, 1.9]);
    }

    #[test]
    fn test_align_history_exact_tail_means_nothing_missing() {
        let stored = [1.2, 3.4, 2.0, 1.1, 5.6];
        let page = [9.0, 1.2, 3.4, 2.0, 1.1, 5.6];
        let missing = align_history(&stored, &page, 5, 0.01).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_align_history_no_match() {
        let stored = [1.2, 3.4, 2.0, 1.1, 5.6];
        let page = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        assert!(align_history(&stored, &page, 5, 0.01).is_none());
    }

    #[test]
    fn test_align_history_tolerates_rounding() {
        let stored = [1.2, 3.4, 2.0, 1.1, 5.6];
        let page = [1.205, 3.395, 2.004, 1.096, 5.603, 4.4];
        let missing = align_history(&stored, &page, 5, 0.01).unwrap();
        assert_eq!(missing, vec![4.4]);
    }

    #[test]
    fn test_has_sequence_gap() {
        assert!(!has_sequence_gap(&[1, 2, 3, 4]));
        assert!(has_sequence_gap(&[1, 2, 4]));
        assert!(has_sequence_gap(&[2, 1]));
        assert!(!has_sequence_gap(&[7]));
        assert!(!has_sequence_gap(&[]));
    }

    // ---- recovery ----------------------------------------------------------

    #[tokio::test]
    async fn test_fresh_start_imports_page_history() {
        let store = Store::open_in_memory().await.unwrap();
        let mut driver = PageDriver { history: vec![1.5, 2.5, 3.5] };

        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert!(!state.resumed);
        assert_eq!(state.detector_seed, vec![1.5, 2.5, 3.5]);
        assert_eq!(state.session.starting_balance, Some(dec!(500)));
    }

    #[tokio::test]
    async fn test_resumes_open_session() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(Some(dec!(100))).await.unwrap();

        let mut driver = PageDriver { history: Vec::new() };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert!(state.resumed);
        assert_eq!(state.session.session_id, session.session_id);
    }

    #[tokio::test]
    async fn test_closed_session_opens_new_one() {
        let store = Store::open_in_memory().await.unwrap();
        let old = store.create_session(None).await.unwrap();
        store.end_session(old.session_id, None).await.unwrap();

        let mut driver = PageDriver { history: Vec::new() };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert!(!state.resumed);
        assert_ne!(state.session.session_id, old.session_id);
    }

    #[tokio::test]
    async fn test_backfills_gap_found_on_page() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();
        settle_rounds(&store, session.session_id, &[1.2, 3.4, 2.0, 1.1, 5.6]).await;

        // Page shows our tail plus two rounds we missed.
        let mut driver = PageDriver { history: vec![1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9] };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert!(state.resumed);
        assert_eq!(state.detector_seed, vec![1.2, 3.4, 2.0, 1.1, 5.6, 2.2, 1.9]);
    }

    #[tokio::test]
    async fn test_unsettled_round_excluded_and_bet_unknown() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();
        settle_rounds(&store, session.session_id, &[2.0, 2.0, 2.0, 2.0, 2.0]).await;

        // A round that died mid-flight with a pending bet that never
        // reached its target.
        let round_id = Uuid::new_v4();
        store.open_round(round_id, session.session_id, Utc::now()).await.unwrap();
        store
            .append_event(&MultiplierEvent {
                round_id,
                sequence_id: 1,
                value: 1.4,
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

        let mut driver = PageDriver { history: Vec::new() };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert_eq!(state.resolved_pending.len(), 1);
        assert_eq!(state.resolved_pending[0].1, BetOutcome::Unknown);
        // Excluded round contributes nothing to the detector seed.
        assert_eq!(state.detector_seed.len(), 5);
        // Unknown outcomes seed no streak counters.
        let seed = state.strategy_seeds.get("steady").unwrap();
        assert_eq!(*seed, StrategySeed::default());
    }

    #[tokio::test]
    async fn test_pending_bet_wins_when_trajectory_reached_target() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();

        let round_id = Uuid::new_v4();
        store.open_round(round_id, session.session_id, Utc::now()).await.unwrap();
        for (seq, v) in [(1u64, 1.5), (2, 2.1), (3, 2.6)] {
            store
                .append_event(&MultiplierEvent {
                    round_id,
                    sequence_id: seq,
                    value: v,
                    observed_at: Utc::now(),
                })
                .await
                .unwrap();
        }
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

        let mut driver = PageDriver { history: Vec::new() };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        assert_eq!(
            state.resolved_pending[0].1,
            BetOutcome::Won { payout: dec!(10.0) }
        );
    }

    #[tokio::test]
    async fn test_strategy_seeds_from_resolved_bets() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();
        let round_id = Uuid::new_v4();
        store.open_round(round_id, session.session_id, Utc::now()).await.unwrap();
        store.settle_round(round_id, 1.5, &[]).await.unwrap();

        for (outcome, at) in [
            (BetOutcome::Won { payout: dec!(10) }, 1),
            (BetOutcome::Lost, 2),
            (BetOutcome::Lost, 3),
            (BetOutcome::Unknown, 4),
        ] {
            let bet = Bet {
                bet_id: Uuid::new_v4(),
                session_id: session.session_id,
                round_id,
                strategy_name: "doubler".into(),
                stake: dec!(10),
                target_cashout: Some(2.0),
                outcome,
                placed_at: Utc::now() + Duration::seconds(at),
                resolved_at: Some(Utc::now() + Duration::seconds(at)),
            };
            store.record_bet(&bet).await.unwrap();
        }

        let mut driver = PageDriver { history: Vec::new() };
        let state = recover(&store, &mut driver, &RecoveryConfig::default(), 50)
            .await
            .unwrap();

        let seed = state.strategy_seeds.get("doubler").unwrap();
        assert_eq!(seed.wins, 1);
        assert_eq!(seed.consecutive_losses, 2);
    }

    #[tokio::test]
    async fn test_session_pnl() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();
        let round_id = Uuid::new_v4();
        store.open_round(round_id, session.session_id, Utc::now()).await.unwrap();
        store.settle_round(round_id, 2.5, &[]).await.unwrap();

        for outcome in [BetOutcome::Won { payout: dec!(15) }, BetOutcome::Lost] {
            let bet = Bet {
                bet_id: Uuid::new_v4(),
                session_id: session.session_id,
                round_id,
                strategy_name: "steady".into(),
                stake: dec!(10),
                target_cashout: Some(2.0),
                outcome,
                placed_at: Utc::now(),
                resolved_at: Some(Utc::now()),
            };
            store.record_bet(&bet).await.unwrap();
        }

        assert_eq!(session_pnl(&store, &session).await.unwrap(), dec!(5));
    }
}
