//! Historical backtesting.
//!
//! Replays a crash-multiplier history through the full strategy set —
//! detector, pattern scans, arming, sizing, settlement — to evaluate a
//! configuration before letting it near real money. Manual strategies are
//! simulated as cashing out exactly at their exit level whenever the
//! round reached it.

use rust_decimal::Decimal;

use crate::detector::{analyze_window, DetectorConfig, HotstreakDetector, PatternConfig};
use crate::strategy::{Action, GameContext, StrategyBook, StrategyConfig};
use crate::types::{BetOutcome, RoundPhase};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Individual simulated bet.
#[derive(Debug, Clone)]
pub struct BacktestBet {
    pub round_index: usize,
    pub strategy: String,
    pub stake: Decimal,
    pub target_cashout: f64,
    pub crash_multiplier: f64,
    pub won: bool,
    pub pnl: Decimal,
    pub balance_after: Decimal,
}

/// Complete backtest performance report.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub total_pnl: Decimal,
    pub rounds: usize,
    pub bets: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub peak_balance: Decimal,
    pub max_drawdown: Decimal,
    /// Per-bet log, chronological.
    pub trade_log: Vec<BacktestBet>,
}

// ---------------------------------------------------------------------------
// Backtester
// ---------------------------------------------------------------------------

pub struct Backtester {
    detector_config: DetectorConfig,
    patterns: PatternConfig,
}

impl Backtester {
    pub fn new(detector_config: DetectorConfig, patterns: PatternConfig) -> Self {
        Self { detector_config, patterns }
    }

    /// Replay `crashes` (chronological) through fresh strategy machines.
    pub fn run(
        &self,
        crashes: &[f64],
        strategies: &[StrategyConfig],
        initial_balance: Decimal,
    ) -> BacktestReport {
        let mut detector = HotstreakDetector::new(self.detector_config.clone());
        let mut book = StrategyBook::from_configs(strategies);

        let mut balance = initial_balance;
        let mut peak = initial_balance;
        let mut max_drawdown = Decimal::ZERO;
        let mut trade_log: Vec<BacktestBet> = Vec::new();
        let mut wins = 0usize;
        let mut losses = 0usize;

        for (round_index, crash) in crashes.iter().copied().enumerate() {
            let recent = detector.contents();
            let pattern_window = detector.last_n(self.patterns.window);
            let patterns = analyze_window(&pattern_window, &self.patterns);
            let signal = detector.signal();

            let ctx = GameContext {
                phase: RoundPhase::InProgress,
                current_multiplier: Some(1.0),
                available_balance: Some(balance),
                recent_crashes: &recent,
                patterns: &patterns,
            };

            // Round-start pass: collect accepted bets.
            let mut placed: Vec<(String, Decimal, f64)> = Vec::new();
            for machine in book.iter_mut() {
                if let Action::Bet { stake, target_cashout } = machine.decide(&ctx, &signal) {
                    let target = target_cashout.unwrap_or_else(|| machine.target_cashout());
                    if stake <= Decimal::ZERO || stake > balance {
                        machine.force_idle();
                        continue;
                    }
                    machine.on_bet_placed(stake);
                    balance -= stake;
                    placed.push((machine.name().to_string(), stake, target));
                }
            }

            // Settlement pass.
            for (strategy, stake, target) in placed {
                let won = target <= crash;
                let outcome = if won {
                    let payout = stake
                        * Decimal::from_f64_retain(target - 1.0).unwrap_or(Decimal::ZERO);
                    balance += stake + payout;
                    wins += 1;
                    BetOutcome::Won { payout }
                } else {
                    losses += 1;
                    BetOutcome::Lost
                };
                let pnl = match &outcome {
                    BetOutcome::Won { payout } => *payout,
                    _ => -stake,
                };
                if let Some(machine) = book.get_mut(&strategy) {
                    machine.on_round_settled(&outcome);
                }
                trade_log.push(BacktestBet {
                    round_index,
                    strategy,
                    stake,
                    target_cashout: target,
                    crash_multiplier: crash,
                    won,
                    pnl,
                    balance_after: balance,
                });
            }

            detector.observe(crash);

            if balance > peak {
                peak = balance;
            }
            let drawdown = peak - balance;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        let bets = trade_log.len();
        BacktestReport {
            initial_balance,
            final_balance: balance,
            total_pnl: balance - initial_balance,
            rounds: crashes.len(),
            bets,
            wins,
            losses,
            win_rate: if bets > 0 { wins as f64 / bets as f64 } else { 0.0 },
            peak_balance: peak,
            max_drawdown,
            trade_log,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
