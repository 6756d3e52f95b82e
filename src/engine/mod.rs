//! Engine — the control loop and single authority over one round at a time.
//!
//! Consumes driver events and front-end control commands through one
//! `select!` merge, drives the hotstreak detector and every strategy
//! machine, serializes outbound driver commands through the command
//! queue, and writes rounds/bets to the store. No two rounds are ever
//! evaluated concurrently; a stop request always lets the current round
//! finish resolving before the loop halts.

pub mod commands;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detector::{analyze_window, HotstreakDetector, PatternConfig};
use crate::driver::{DriverError, DriverEvent, GameDriver};
use crate::recovery::RecoveredState;
use crate::store::Store;
use crate::strategy::{Action, GameContext, StrategyBook};
use crate::types::{
    Bet, BetOutcome, ControlCommand, EngineSnapshot, MachineState, MultiplierEvent, RoundPhase,
    RoundView, Session, SessionSummary,
};
use commands::{CommandOutcome, CommandQueue, DriverCommand};

/// Settlements closer than this are considered the same value by the
/// duplicate guard.
const CRASH_EPSILON: f64 = 0.005;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session loss limit: the loop stops cleanly once cumulative P/L
    /// breaches it.
    pub max_loss: Decimal,
    /// Send a keepalive after this many settled rounds (0 = off).
    pub keepalive_every: u32,
    /// Window within which an identical settlement is treated as a
    /// duplicate report.
    pub dup_debounce_secs: i64,
    /// Backoff before the single transient-command retry.
    pub retry_backoff_ms: u64,
    /// Reconnect attempts after a stale session before giving up.
    pub max_reconnects: u32,
    /// Consecutive transient stream failures tolerated before the loop
    /// stops.
    pub max_transient_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loss: dec!(100_000_000),
            keepalive_every: 20,
            dup_debounce_secs: 5,
            retry_backoff_ms: 500,
            max_reconnects: 3,
            max_transient_failures: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Front-end side of the engine: control channel in, snapshots out.
#[derive(Clone)]
pub struct EngineHandle {
    pub control: mpsc::Sender<ControlCommand>,
    pub snapshots: watch::Receiver<EngineSnapshot>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct CurrentRound {
    round_id: Uuid,
    started_at: DateTime<Utc>,
    trajectory: Vec<f64>,
    last_seq: u64,
    /// Failed an integrity check; excluded from statistics at settlement.
    corrupt: bool,
}

pub struct Engine {
    config: EngineConfig,
    driver: Box<dyn GameDriver>,
    store: Store,
    detector: HotstreakDetector,
    patterns: PatternConfig,
    book: StrategyBook,
    queue: CommandQueue,
    session: Session,

    control_rx: mpsc::Receiver<ControlCommand>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    control_closed: bool,

    phase: RoundPhase,
    current: Option<CurrentRound>,
    /// In-flight bets by strategy name.
    open_bets: HashMap<String, Bet>,
    /// Acknowledged manual cash-out multipliers by strategy name.
    cashouts: HashMap<String, f64>,

    paused: bool,
    stopping: bool,
    balance: Option<Decimal>,
    total_pnl: Decimal,
    rounds_seen: u64,
    bets_placed: u64,
    bets_won: u64,
    bets_lost: u64,
    keepalive_counter: u32,
    last_settlement: Option<(f64, DateTime<Utc>)>,
}

impl Engine {
    /// Build an engine from recovered state. Recovery must be complete
    /// before this runs — the engine assumes it is the sole store writer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Box<dyn GameDriver>,
        store: Store,
        config: EngineConfig,
        mut detector: HotstreakDetector,
        patterns: PatternConfig,
        mut book: StrategyBook,
        recovered: RecoveredState,
        initial_pnl: Decimal,
    ) -> (Self, EngineHandle) {
        detector.seed(recovered.detector_seed.iter().copied());
        for machine in book.iter_mut() {
            if let Some(seed) = recovered.strategy_seeds.get(machine.name()) {
                machine.seed_counters(seed.consecutive_losses, seed.wins);
            }
        }

        let (control_tx, control_rx) = mpsc::channel(32);
        let balance = recovered.session.starting_balance;

        let initial_snapshot = EngineSnapshot {
            phase: RoundPhase::AwaitingRoundStart,
            paused: false,
            session: SessionSummary {
                session_id: recovered.session.session_id,
                started_at: recovered.session.started_at,
                rounds_seen: 0,
                bets_placed: 0,
                bets_won: 0,
                bets_lost: 0,
                total_pnl: initial_pnl,
                balance,
            },
            current_round: None,
            signal: detector.signal(),
            strategies: book.snapshots(),
            updated_at: Utc::now(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial_snapshot);
        let backoff = Duration::from_millis(config.retry_backoff_ms);

        let engine = Self {
            config,
            driver,
            store,
            detector,
            patterns,
            book,
            queue: CommandQueue::new(backoff),
            session: recovered.session,
            control_rx,
            snapshot_tx,
            control_closed: false,
            phase: RoundPhase::AwaitingRoundStart,
            current: None,
            open_bets: HashMap::new(),
            cashouts: HashMap::new(),
            paused: false,
            stopping: false,
            balance,
            total_pnl: initial_pnl,
            rounds_seen: 0,
            bets_placed: 0,
            bets_won: 0,
            bets_lost: 0,
            keepalive_counter: 0,
            last_settlement: None,
        };

        let handle = EngineHandle {
            control: control_tx,
            snapshots: snapshot_rx,
        };
        (engine, handle)
    }

    /// Run the control loop until stopped or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        info!(
            session_id = %self.session.session_id,
            strategies = self.book.len(),
            detector_samples = self.detector.len(),
            "Engine starting"
        );
        self.publish();

        match self.event_loop().await {
            Ok(()) => {
                self.shutdown().await?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Engine halting on fatal error");
                self.halt_on_failure().await;
                Err(e)
            }
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut transient_failures = 0u32;

        loop {
            if self.stopping && !self.book.any_in_flight() {
                info!("Stop complete — no bets in flight");
                return Ok(());
            }

            tokio::select! {
                biased;

                cmd = self.control_rx.recv(), if !self.control_closed => {
                    match cmd {
                        Some(cmd) => self.handle_control(cmd),
                        None => self.control_closed = true,
                    }
                }

                event = self.driver.next_event() => {
                    match event {
                        Ok(event) => {
                            transient_failures = 0;
                            self.handle_event(event).await?;
                        }
                        Err(e) => {
                            self.handle_driver_error(e, &mut transient_failures).await?;
                        }
                    }
                }
            }
        }
    }

    // -- Control ----------------------------------------------------------

    fn handle_control(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Pause => {
                self.paused = true;
                info!("Paused — observing only");
            }
            ControlCommand::Resume => {
                self.paused = false;
                info!("Resumed");
            }
            ControlCommand::Stop => {
                self.stopping = true;
                self.queue.drop_pending_bets();
                info!("Stop requested — finishing current round first");
            }
            ControlCommand::UpdateStrategy { name, base_stake, target_cashout } => {
                match self.book.get_mut(&name) {
                    Some(machine) => machine.apply_update(base_stake, target_cashout),
                    None => warn!(strategy = %name, "Update for unknown strategy"),
                }
            }
        }
        self.publish();
    }

    // -- Events -----------------------------------------------------------

    async fn handle_event(&mut self, event: DriverEvent) -> Result<()> {
        match event {
            DriverEvent::Multiplier(ev) => self.on_multiplier(ev).await,
            DriverEvent::RoundSettled { round_id, crash_multiplier } => {
                self.on_settled(round_id, crash_multiplier).await
            }
        }
    }

    async fn on_multiplier(&mut self, ev: MultiplierEvent) -> Result<()> {
        let new_round = match &self.current {
            Some(current) => current.round_id != ev.round_id,
            None => true,
        };

        if new_round {
            self.start_round(ev).await
        } else {
            self.track_event(ev).await
        }
    }

    async fn start_round(&mut self, ev: MultiplierEvent) -> Result<()> {
        // A round that never settled is ambiguous evidence: flag it and
        // resolve whatever was riding on it before moving on.
        if self.current.is_some() {
            warn!("New round started before previous settled");
            self.abandon_current_round().await?;
        }

        self.store
            .open_round(ev.round_id, self.session.session_id, ev.observed_at)
            .await
            .context("Failed to persist round start")?;
        self.store
            .append_event(&ev)
            .await
            .context("Failed to persist first event")?;

        // Joining a round that is already underway (first observed event
        // is not sequence 1) happens after recovery or a reconnect; the
        // round is tracked but betting on it is no longer valid.
        let joined_mid_round = ev.sequence_id > 1;

        self.current = Some(CurrentRound {
            round_id: ev.round_id,
            started_at: ev.observed_at,
            trajectory: vec![ev.value],
            last_seq: ev.sequence_id,
            corrupt: false,
        });
        self.phase = RoundPhase::InProgress;
        debug!(round_id = %ev.round_id, "Round started");

        if joined_mid_round {
            debug!(round_id = %ev.round_id, sequence = ev.sequence_id, "Joined mid-round — observing only");
        } else if !self.paused && !self.stopping {
            self.round_start_pass(ev.round_id).await?;
        }

        self.publish();
        Ok(())
    }

    async fn track_event(&mut self, ev: MultiplierEvent) -> Result<()> {
        let current = self.current.as_mut().expect("track_event without current round");

        if ev.sequence_id <= current.last_seq {
            let violation = crate::types::BotError::DataIntegrity(format!(
                "out-of-order event {} after {}",
                ev.sequence_id, current.last_seq
            ));
            warn!(round_id = %ev.round_id, error = %violation, "Flagging round");
            current.corrupt = true;
            return Ok(());
        }

        current.last_seq = ev.sequence_id;
        current.trajectory.push(ev.value);
        self.store
            .append_event(&ev)
            .await
            .context("Failed to persist event")?;

        // Manual strategies may want to cash out on this tick.
        self.in_flight_pass(ev.round_id, ev.value).await?;
        Ok(())
    }

    /// Round-start decision pass: arm machines and queue accepted bets.
    async fn round_start_pass(&mut self, round_id: Uuid) -> Result<()> {
        let recent = self.detector.contents();
        let pattern_window = self.detector.last_n(self.patterns.window);
        let patterns = analyze_window(&pattern_window, &self.patterns);
        let signal = self.detector.signal();

        let ctx = GameContext {
            phase: RoundPhase::InProgress,
            current_multiplier: self.current.as_ref().and_then(|c| c.trajectory.last().copied()),
            available_balance: self.balance,
            recent_crashes: &recent,
            patterns: &patterns,
        };

        let mut proposals = Vec::new();
        for machine in self.book.iter_mut() {
            if let Action::Bet { stake, target_cashout } = machine.decide(&ctx, &signal) {
                proposals.push((machine.name().to_string(), stake, target_cashout));
            }
        }

        for (strategy, stake, target) in proposals {
            if stake <= Decimal::ZERO {
                self.constraint_violation(&strategy, "stake must be positive");
                continue;
            }
            if let Some(balance) = self.balance {
                if stake > balance {
                    self.constraint_violation(
                        &strategy,
                        &format!("stake {stake} exceeds balance {balance}"),
                    );
                    continue;
                }
            }
            self.queue.enqueue(DriverCommand::PlaceBet {
                round_id,
                strategy,
                stake,
                target_cashout: target,
            });
        }

        self.flush_commands().await
    }

    /// Mid-round pass: let machines with open manual bets cash out.
    async fn in_flight_pass(&mut self, round_id: Uuid, multiplier: f64) -> Result<()> {
        if !self.book.any_in_flight() {
            return Ok(());
        }

        let recent = self.detector.contents();
        let signal = self.detector.signal();
        let ctx = GameContext {
            phase: RoundPhase::InProgress,
            current_multiplier: Some(multiplier),
            available_balance: self.balance,
            recent_crashes: &recent,
            patterns: &[],
        };

        let mut cashing_out = Vec::new();
        for machine in self.book.iter_mut() {
            // Only machines with an open bet get the mid-round pass;
            // arming is a round-start decision.
            if machine.state() != MachineState::BetPlaced {
                continue;
            }
            if machine.decide(&ctx, &signal) == Action::CashOut {
                cashing_out.push(machine.name().to_string());
            }
        }

        for strategy in cashing_out {
            self.queue.enqueue(DriverCommand::CashOut { round_id, strategy });
        }

        self.flush_commands().await
    }

    /// Drain the command queue and apply the outcomes.
    async fn flush_commands(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let outcomes = self.queue.drain(self.driver.as_mut()).await;

        for outcome in outcomes {
            match outcome {
                CommandOutcome::BetPlaced { strategy, round_id, stake, target_cashout, ack } => {
                    let bet = Bet {
                        bet_id: Uuid::new_v4(),
                        session_id: self.session.session_id,
                        round_id,
                        strategy_name: strategy.clone(),
                        stake: ack.accepted_stake,
                        target_cashout,
                        outcome: BetOutcome::Pending,
                        placed_at: Utc::now(),
                        resolved_at: None,
                    };
                    self.store
                        .record_bet(&bet)
                        .await
                        .context("Failed to record bet")?;
                    if let Some(machine) = self.book.get_mut(&strategy) {
                        machine.on_bet_placed(ack.accepted_stake);
                    }
                    if let Some(balance) = self.balance {
                        self.balance = Some(balance - ack.accepted_stake);
                    }
                    self.open_bets.insert(strategy.clone(), bet);
                    self.bets_placed += 1;
                    info!(strategy = %strategy, stake = %stake, "Bet placed");
                }
                CommandOutcome::BetRejected { strategy, round_id, stake, target_cashout, error } => {
                    // Record the refused attempt so it is never silently
                    // dropped, then stand the strategy down.
                    let bet = Bet {
                        bet_id: Uuid::new_v4(),
                        session_id: self.session.session_id,
                        round_id,
                        strategy_name: strategy.clone(),
                        stake,
                        target_cashout,
                        outcome: BetOutcome::Rejected,
                        placed_at: Utc::now(),
                        resolved_at: Some(Utc::now()),
                    };
                    self.store
                        .record_bet(&bet)
                        .await
                        .context("Failed to record rejected bet")?;
                    self.constraint_violation(&strategy, &format!("driver rejected bet: {error}"));
                }
                CommandOutcome::CashedOut { strategy, ack } => {
                    info!(strategy = %strategy, multiplier = ack.multiplier, "Cashed out");
                    self.cashouts.insert(strategy.clone(), ack.multiplier);
                    if let Some(machine) = self.book.get_mut(&strategy) {
                        machine.on_cashed_out();
                    }
                }
                CommandOutcome::CashOutFailed { strategy, error } => {
                    // The bet stays open; settlement decides it.
                    warn!(strategy = %strategy, %error, "Cash-out failed — bet rides to settlement");
                }
                CommandOutcome::KeepaliveSent => {}
            }
        }

        Ok(())
    }

    fn constraint_violation(&mut self, strategy: &str, message: &str) {
        let violation = crate::types::BotError::Constraint {
            strategy: strategy.to_string(),
            message: message.to_string(),
        };
        warn!(error = %violation, "Strategy forced to idle");
        if let Some(machine) = self.book.get_mut(strategy) {
            machine.force_idle();
        }
    }

    // -- Settlement -------------------------------------------------------

    async fn on_settled(&mut self, round_id: Uuid, crash: f64) -> Result<()> {
        let Some(current) = &self.current else {
            if self.is_duplicate_settlement(crash) {
                debug!(crash, "Duplicate settlement dropped");
            } else {
                warn!(round_id = %round_id, crash, "Settlement for unknown round ignored");
            }
            return Ok(());
        };

        if current.round_id != round_id {
            warn!(
                expected = %current.round_id,
                got = %round_id,
                "Settlement for a different round — abandoning current"
            );
            self.abandon_current_round().await?;
            return Ok(());
        }

        self.phase = RoundPhase::Settling;
        let current = self.current.take().expect("settling without current round");

        let mut corrupt = current.corrupt;
        if let Some(last) = current.trajectory.last() {
            if (last - crash).abs() > CRASH_EPSILON && *last > crash {
                // The final observed value overshooting the crash breaks
                // the trajectory invariant.
                let violation = crate::types::BotError::DataIntegrity(format!(
                    "trajectory peak {last:.2} exceeds crash {crash:.2}"
                ));
                warn!(round_id = %round_id, error = %violation, "Flagging round");
                corrupt = true;
            }
        }

        // Resolve every open bet against the settled round.
        let mut resolutions = Vec::new();
        let mut machine_outcomes = Vec::new();
        for (strategy, bet) in self.open_bets.drain() {
            let outcome = match bet.target_cashout {
                Some(_) => bet.resolve_against(crash),
                None => match self.cashouts.remove(&strategy) {
                    Some(multiplier) => BetOutcome::Won { payout: bet.profit_at(multiplier) },
                    None => BetOutcome::Lost,
                },
            };
            resolutions.push((bet.bet_id, outcome.clone()));
            machine_outcomes.push((strategy, bet.stake, outcome));
        }

        self.store
            .settle_round(round_id, crash, &resolutions)
            .await
            .context("Failed to settle round")?;
        if corrupt {
            self.store
                .mark_round_excluded(round_id)
                .await
                .context("Failed to flag round")?;
        }

        for (strategy, stake, outcome) in machine_outcomes {
            match &outcome {
                BetOutcome::Won { payout } => {
                    self.total_pnl += *payout;
                    self.bets_won += 1;
                    if let Some(balance) = self.balance {
                        // Stake returned plus profit.
                        self.balance = Some(balance + stake + *payout);
                    }
                }
                BetOutcome::Lost => {
                    self.total_pnl -= stake;
                    self.bets_lost += 1;
                }
                _ => {}
            }
            if let Some(machine) = self.book.get_mut(&strategy) {
                machine.on_round_settled(&outcome);
            }
        }

        if !corrupt {
            let signal = self.detector.observe(crash);
            debug!(signal = %signal, "Detector updated");
        }

        self.rounds_seen += 1;
        self.last_settlement = Some((crash, Utc::now()));
        self.queue.prune_round(round_id);
        self.phase = RoundPhase::Settled;

        info!(
            round = self.rounds_seen,
            crash = format!("{crash:.2}x"),
            pnl = %self.total_pnl,
            "Round settled"
        );

        // Refresh the displayed balance when the driver can read it.
        if let Ok(Some(balance)) = self.driver.balance().await {
            self.balance = Some(balance);
        }

        self.keepalive_counter += 1;
        if self.config.keepalive_every > 0 && self.keepalive_counter >= self.config.keepalive_every
        {
            self.keepalive_counter = 0;
            self.queue.enqueue(DriverCommand::Keepalive);
            self.flush_commands().await?;
        }

        if self.total_pnl <= -self.config.max_loss {
            warn!(pnl = %self.total_pnl, limit = %self.config.max_loss, "Max loss reached — stopping");
            self.stopping = true;
        }

        self.phase = RoundPhase::AwaitingRoundStart;
        self.publish();
        Ok(())
    }

    fn is_duplicate_settlement(&self, crash: f64) -> bool {
        match self.last_settlement {
            Some((last_crash, at)) => {
                (last_crash - crash).abs() < CRASH_EPSILON
                    && (Utc::now() - at).num_seconds() < self.config.dup_debounce_secs
            }
            None => false,
        }
    }

    /// Flag the current round and resolve its bets from the recorded
    /// trajectory: a win only if the target was provably reached, else
    /// unknown. Never leaves a bet unrecorded.
    async fn abandon_current_round(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };

        self.store
            .mark_round_excluded(current.round_id)
            .await
            .context("Failed to flag abandoned round")?;

        let peak = current.trajectory.iter().copied().fold(f64::MIN, f64::max);
        for (strategy, bet) in self.open_bets.drain() {
            let outcome = match bet.target_cashout {
                Some(target) if !current.trajectory.is_empty() && target <= peak => {
                    BetOutcome::Won { payout: bet.profit_at(target) }
                }
                _ => match self.cashouts.remove(&strategy) {
                    Some(multiplier) => BetOutcome::Won { payout: bet.profit_at(multiplier) },
                    None => BetOutcome::Unknown,
                },
            };
            warn!(bet = %bet, resolution = %outcome, "Resolved bet on abandoned round");
            self.store
                .resolve_bet(bet.bet_id, &outcome)
                .await
                .context("Failed to resolve abandoned bet")?;
            if let BetOutcome::Won { payout } = &outcome {
                self.total_pnl += *payout;
                self.bets_won += 1;
            }
            if let Some(machine) = self.book.get_mut(&strategy) {
                machine.on_round_settled(&outcome);
            }
        }

        self.cashouts.clear();
        self.queue.prune_round(current.round_id);
        self.phase = RoundPhase::AwaitingRoundStart;
        Ok(())
    }

    // -- Driver failures --------------------------------------------------

    async fn handle_driver_error(
        &mut self,
        error: DriverError,
        transient_failures: &mut u32,
    ) -> Result<()> {
        match &error {
            DriverError::Auth(_) => {
                error!(%error, "Authentication lost — fatal");
                Err(anyhow!(error))
            }
            DriverError::StaleSession => {
                warn!("Browser session stale — reconnecting");
                for attempt in 1..=self.config.max_reconnects {
                    match self.driver.reconnect().await {
                        Ok(()) => {
                            info!(attempt, "Reconnected");
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnect failed");
                            tokio::time::sleep(Duration::from_millis(
                                self.config.retry_backoff_ms * attempt as u64,
                            ))
                            .await;
                        }
                    }
                }
                Err(anyhow!(DriverError::StaleSession).context("Reconnect attempts exhausted"))
            }
            e if e.is_transient() => {
                *transient_failures += 1;
                if *transient_failures > self.config.max_transient_failures {
                    return Err(anyhow!(error).context("Driver stream failed repeatedly"));
                }
                let backoff = Duration::from_millis(
                    self.config.retry_backoff_ms * *transient_failures as u64,
                );
                warn!(%error, failures = *transient_failures, ?backoff, "Transient stream failure");
                tokio::time::sleep(backoff).await;
                Ok(())
            }
            _ => {
                warn!(%error, "Malformed driver event — continuing");
                Ok(())
            }
        }
    }

    // -- Shutdown ---------------------------------------------------------

    async fn shutdown(&mut self) -> Result<()> {
        // A stop never leaves a placed bet behind, but a closed control
        // channel can; resolve anything still open before closing out.
        self.abandon_current_round().await?;

        let balance = self.driver.balance().await.unwrap_or(self.balance);
        self.store
            .end_session(self.session.session_id, balance)
            .await
            .context("Failed to close session")?;

        info!(
            session_id = %self.session.session_id,
            rounds = self.rounds_seen,
            bets = self.bets_placed,
            won = self.bets_won,
            lost = self.bets_lost,
            pnl = %self.total_pnl,
            "Engine shut down cleanly"
        );
        self.publish();
        Ok(())
    }

    /// Fatal-error path: same bet accounting as a clean stop, then the
    /// session is closed with whatever we know.
    async fn halt_on_failure(&mut self) {
        if let Err(e) = self.abandon_current_round().await {
            error!(error = %e, "Failed to resolve bets during halt");
        }
        if let Err(e) = self.store.end_session(self.session.session_id, self.balance).await {
            error!(error = %e, "Failed to close session during halt");
        }
        self.publish();
    }

    // -- Snapshots --------------------------------------------------------

    fn publish(&self) {
        let snapshot = EngineSnapshot {
            phase: self.phase,
            paused: self.paused,
            session: SessionSummary {
                session_id: self.session.session_id,
                started_at: self.session.started_at,
                rounds_seen: self.rounds_seen,
                bets_placed: self.bets_placed,
                bets_won: self.bets_won,
                bets_lost: self.bets_lost,
                total_pnl: self.total_pnl,
                balance: self.balance,
            },
            current_round: self.current.as_ref().map(|c| RoundView {
                round_id: c.round_id,
                started_at: c.started_at,
                trajectory: c.trajectory.clone(),
            }),
            signal: self.detector.signal(),
            strategies: self.book.snapshots(),
            updated_at: Utc::now(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
