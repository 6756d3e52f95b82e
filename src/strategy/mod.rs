//! Strategy state machines.
//!
//! Each configured strategy runs an independent machine through the
//! `idle → armed → bet_placed → resolved → idle` lifecycle. Machines never
//! share mutable state; the engine drives every machine once per round and
//! is the only caller of the transition methods.

pub mod policy;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::detector::PatternSignal;
use crate::types::{BetOutcome, HotstreakSignal, MachineState, RoundPhase, StrategySnapshot};
use policy::{ColdTrigger, StakePolicy};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_max_losses() -> u32 {
    20
}

/// Per-strategy configuration, deserialized from the `[[strategies]]`
/// tables in config.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Auto-cashout target. With `manual = true` the bet is placed without
    /// an auto target and the machine cashes out itself when the live
    /// multiplier reaches this value.
    pub target_cashout: f64,
    #[serde(default)]
    pub manual: bool,
    pub policy: StakePolicy,
    /// Optional cold trigger gating arming.
    #[serde(default)]
    pub trigger: Option<ColdTrigger>,
    /// Arm a signal-gated strategy on a pre-streak pattern as well.
    #[serde(default)]
    pub arm_on_pre_streak: bool,
    #[serde(default = "default_max_losses")]
    pub max_consecutive_losses: u32,
    /// Rounds to sit out after a loss-cap disarm.
    #[serde(default)]
    pub cooldown_rounds: u32,
    /// Retire the strategy for the session after this many wins.
    #[serde(default)]
    pub stop_profit_wins: Option<u32>,
}

// ---------------------------------------------------------------------------
// Decision contract
// ---------------------------------------------------------------------------

/// What a strategy wants to do this step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Skip,
    Bet {
        stake: Decimal,
        /// `None` = manual cash-out.
        target_cashout: Option<f64>,
    },
    CashOut,
}

/// Game state handed to every machine on each decision pass.
#[derive(Debug, Clone, Copy)]
pub struct GameContext<'a> {
    pub phase: RoundPhase,
    /// Latest live multiplier of the current round, if any.
    pub current_multiplier: Option<f64>,
    pub available_balance: Option<Decimal>,
    /// Recent crash multipliers, oldest first.
    pub recent_crashes: &'a [f64],
    pub patterns: &'a [PatternSignal],
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// One strategy's runtime state machine.
pub struct StrategyMachine {
    config: StrategyConfig,
    state: MachineState,
    consecutive_losses: u32,
    wins: u32,
    cooldown_remaining: u32,
    total_pnl: Decimal,
    retired: bool,
    /// Stake of the bet currently in flight (valid in `BetPlaced`).
    placed_stake: Decimal,
    cashed_out: bool,
}

impl StrategyMachine {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            state: MachineState::Idle,
            consecutive_losses: 0,
            wins: 0,
            cooldown_remaining: 0,
            total_pnl: Decimal::ZERO,
            retired: false,
            placed_stake: Decimal::ZERO,
            cashed_out: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Configured cash-out target (auto target, or the manual exit level).
    pub fn target_cashout(&self) -> f64 {
        self.config.target_cashout
    }

    /// Decide the next action given current game state and signal.
    ///
    /// Called once at round start (arming/bet pass) and again on each live
    /// multiplier while a manual bet is open (cash-out pass).
    pub fn decide(&mut self, ctx: &GameContext<'_>, signal: &HotstreakSignal) -> Action {
        match self.state {
            MachineState::BetPlaced => self.decide_in_flight(ctx),
            MachineState::Idle => {
                if ctx.phase != RoundPhase::InProgress {
                    return Action::Skip;
                }
                if !self.try_arm(ctx, signal) {
                    return Action::Skip;
                }
                self.propose_bet()
            }
            MachineState::Armed => self.propose_bet(),
            MachineState::Resolved => Action::Skip,
        }
    }

    fn decide_in_flight(&mut self, ctx: &GameContext<'_>) -> Action {
        if !self.config.manual || self.cashed_out {
            return Action::Skip;
        }
        match ctx.current_multiplier {
            Some(m) if m >= self.config.target_cashout => Action::CashOut,
            _ => Action::Skip,
        }
    }

    /// Round-start entry condition: cooldown expired and the policy's
    /// gates satisfied.
    fn try_arm(&mut self, ctx: &GameContext<'_>, signal: &HotstreakSignal) -> bool {
        if self.retired {
            return false;
        }
        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            debug!(
                strategy = %self.config.name,
                remaining = self.cooldown_remaining,
                "Cooling down"
            );
            return false;
        }

        if let Some(trigger) = &self.config.trigger {
            if !trigger.matches(ctx.recent_crashes) {
                return false;
            }
        }

        if let Some((target, min_confidence)) = self.config.policy.signal_gate() {
            let gate_open = signal.classification == target && signal.confidence >= min_confidence;
            let pattern_open = self.config.arm_on_pre_streak
                && ctx.patterns.contains(&PatternSignal::PreStreak);
            if !gate_open && !pattern_open {
                return false;
            }
        }

        self.state = MachineState::Armed;
        info!(strategy = %self.config.name, "Armed");
        true
    }

    fn propose_bet(&self) -> Action {
        Action::Bet {
            stake: self.config.policy.stake_for(self.consecutive_losses),
            target_cashout: if self.config.manual {
                None
            } else {
                Some(self.config.target_cashout)
            },
        }
    }

    // ---- transitions driven by the engine ---------------------------------

    /// `armed → bet_placed`: the engine accepted the action and the driver
    /// acknowledged the bet.
    pub fn on_bet_placed(&mut self, stake: Decimal) {
        self.state = MachineState::BetPlaced;
        self.placed_stake = stake;
        self.cashed_out = false;
    }

    /// The engine acknowledged this machine's cash-out.
    pub fn on_cashed_out(&mut self) {
        self.cashed_out = true;
    }

    pub fn has_cashed_out(&self) -> bool {
        self.cashed_out
    }

    /// Force back to `idle` (constraint violation, rejected placement, or
    /// front-end stop). Not a loss: streak counters are untouched.
    pub fn force_idle(&mut self) {
        if self.state != MachineState::Idle {
            warn!(strategy = %self.config.name, from = %self.state, "Forced to idle");
        }
        self.state = MachineState::Idle;
        self.placed_stake = Decimal::ZERO;
        self.cashed_out = false;
    }

    /// `bet_placed → resolved → idle` on round settlement. Updates streak
    /// counters; `Unknown`/`Rejected` outcomes leave them untouched.
    pub fn on_round_settled(&mut self, outcome: &BetOutcome) {
        if self.state != MachineState::BetPlaced {
            return;
        }
        self.state = MachineState::Resolved;

        match outcome {
            BetOutcome::Won { payout } => {
                self.wins += 1;
                self.consecutive_losses = 0;
                self.total_pnl += *payout;
                info!(
                    strategy = %self.config.name,
                    payout = %payout,
                    wins = self.wins,
                    "WIN"
                );
                if let Some(cap) = self.config.stop_profit_wins {
                    if self.wins >= cap {
                        info!(strategy = %self.config.name, wins = self.wins, "Stop-profit reached — retiring");
                        self.retired = true;
                    }
                }
            }
            BetOutcome::Lost => {
                self.consecutive_losses += 1;
                self.total_pnl -= self.placed_stake;
                info!(
                    strategy = %self.config.name,
                    lost = %self.placed_stake,
                    streak = self.consecutive_losses,
                    "LOSS"
                );
                if self.consecutive_losses >= self.config.max_consecutive_losses {
                    warn!(
                        strategy = %self.config.name,
                        losses = self.consecutive_losses,
                        "Max consecutive losses — disarming"
                    );
                    self.consecutive_losses = 0;
                    self.cooldown_remaining = self.config.cooldown_rounds.max(1);
                }
            }
            BetOutcome::Unknown | BetOutcome::Rejected | BetOutcome::Pending => {
                debug!(strategy = %self.config.name, outcome = %outcome, "Settled without streak accounting");
            }
        }

        // resolved → idle is immediate.
        self.state = MachineState::Idle;
        self.placed_stake = Decimal::ZERO;
        self.cashed_out = false;
    }

    /// Seed streak counters from recovered history.
    pub fn seed_counters(&mut self, consecutive_losses: u32, wins: u32) {
        self.consecutive_losses = consecutive_losses;
        self.wins = wins;
    }

    /// Apply a front-end strategy update.
    pub fn apply_update(&mut self, base_stake: Option<Decimal>, target_cashout: Option<f64>) {
        if let Some(stake) = base_stake {
            self.config.policy.set_base_stake(stake);
        }
        if let Some(target) = target_cashout {
            self.config.target_cashout = target;
        }
        info!(strategy = %self.config.name, "Strategy config updated");
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            name: self.config.name.clone(),
            state: self.state,
            current_stake: self.config.policy.stake_for(self.consecutive_losses),
            consecutive_losses: self.consecutive_losses,
            wins: self.wins,
            cooldown_remaining: self.cooldown_remaining,
            total_pnl: self.total_pnl,
            retired: self.retired,
        }
    }
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

/// All enabled strategy machines, driven together every round.
pub struct StrategyBook {
    machines: Vec<StrategyMachine>,
}

impl StrategyBook {
    pub fn from_configs(configs: &[StrategyConfig]) -> Self {
        let machines = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| StrategyMachine::new(c.clone()))
            .collect();
        Self { machines }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StrategyMachine> {
        self.machines.iter_mut()
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StrategyMachine> {
        self.machines.iter_mut().find(|m| m.name() == name)
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.machines.iter().map(|m| m.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Any machine with a bet in flight?
    pub fn any_in_flight(&self) -> bool {
        self.machines
            .iter()
            .any(|m| m.state() == MachineState::BetPlaced)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
