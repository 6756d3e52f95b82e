//! Shared types for the CRASHER engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that driver, strategy, store,
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Multiplier events & rounds
// ---------------------------------------------------------------------------

/// A single observation from the live multiplier stream.
///
/// `sequence_id` is strictly increasing within a round; events are
/// immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierEvent {
    pub round_id: Uuid,
    pub sequence_id: u64,
    /// Current multiplier value, always ≥ 1.0.
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for MultiplierEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:.2}x", self.sequence_id, self.value)
    }
}

/// One game round. Terminal once `ended_at` is set; `crash_multiplier`
/// equals the last event value observed before settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: Uuid,
    pub session_id: Uuid,
    pub crash_multiplier: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when the round has an unrecoverable event gap or failed an
    /// integrity check; excluded rounds are skipped in detector replay.
    pub excluded: bool,
}

impl Round {
    pub fn is_settled(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Engine view of the round lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    AwaitingRoundStart,
    InProgress,
    Settling,
    Settled,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundPhase::AwaitingRoundStart => write!(f, "awaiting_round_start"),
            RoundPhase::InProgress => write!(f, "in_progress"),
            RoundPhase::Settling => write!(f, "settling"),
            RoundPhase::Settled => write!(f, "settled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A betting session. Exactly one session is active at a time; creating a
/// new one requires the prior session to be closed or recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub starting_balance: Option<Decimal>,
    pub ending_balance: Option<Decimal>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} ({})",
            self.session_id,
            if self.is_active() { "active" } else { "closed" },
        )
    }
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// Final state of a bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BetOutcome {
    Pending,
    /// Won; `payout` is the net profit credited (stake × (target − 1)).
    Won { payout: Decimal },
    Lost,
    /// Could not be resolved during recovery; excluded from streak
    /// accounting.
    Unknown,
    /// The driver refused the placement; recorded so the attempt is never
    /// silently dropped.
    Rejected,
}

impl BetOutcome {
    /// Storage discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            BetOutcome::Pending => "pending",
            BetOutcome::Won { .. } => "won",
            BetOutcome::Lost => "lost",
            BetOutcome::Unknown => "unknown",
            BetOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for BetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetOutcome::Won { payout } => write!(f, "won (+{payout})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// A placed bet. Owned by the session that was active at placement;
/// immutable after `resolved_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: Uuid,
    pub session_id: Uuid,
    pub round_id: Uuid,
    pub strategy_name: String,
    pub stake: Decimal,
    /// `None` means manual cash-out (no auto target).
    pub target_cashout: Option<f64>,
    pub outcome: BetOutcome,
    pub placed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Bet {
    pub fn is_pending(&self) -> bool {
        matches!(self.outcome, BetOutcome::Pending)
    }

    /// Resolve this bet against a final crash multiplier: a win iff the
    /// auto-cashout target was reached before the crash.
    ///
    /// Manual bets (no target) cannot be resolved from the crash value
    /// alone and yield `Unknown` here; the engine resolves them from
    /// cash-out acknowledgements instead.
    pub fn resolve_against(&self, crash_multiplier: f64) -> BetOutcome {
        match self.target_cashout {
            Some(target) if target <= crash_multiplier => BetOutcome::Won {
                payout: self.profit_at(target),
            },
            Some(_) => BetOutcome::Lost,
            None => BetOutcome::Unknown,
        }
    }

    /// Net profit if cashed out at `multiplier`.
    pub fn profit_at(&self, multiplier: f64) -> Decimal {
        let gain = Decimal::from_f64_retain(multiplier - 1.0).unwrap_or(Decimal::ZERO);
        self.stake * gain
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target_cashout {
            Some(t) => write!(
                f,
                "[{}] {} @ {:.2}x ({})",
                self.strategy_name, self.stake, t, self.outcome
            ),
            None => write!(f, "[{}] {} manual ({})", self.strategy_name, self.stake, self.outcome),
        }
    }
}

// ---------------------------------------------------------------------------
// Hotstreak signal
// ---------------------------------------------------------------------------

/// Detector classification over the rolling outcome window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakClass {
    Neutral,
    Hot,
    Cold,
}

impl fmt::Display for StreakClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreakClass::Neutral => write!(f, "neutral"),
            StreakClass::Hot => write!(f, "hot"),
            StreakClass::Cold => write!(f, "cold"),
        }
    }
}

/// Output of the Hotstreak Detector. Derived from the window contents
/// only — recomputable from persisted history, never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotstreakSignal {
    pub classification: StreakClass,
    /// Normalised distance measure in [0, 1].
    pub confidence: f64,
    pub short_mean: f64,
    pub long_mean: f64,
    pub long_std: f64,
    /// Number of observations the signal was computed from.
    pub samples: usize,
}

impl HotstreakSignal {
    /// The neutral signal produced when the window holds too little data.
    pub fn insufficient(samples: usize) -> Self {
        Self {
            classification: StreakClass::Neutral,
            confidence: 0.0,
            short_mean: 0.0,
            long_mean: 0.0,
            long_std: 0.0,
            samples,
        }
    }
}

impl fmt::Display for HotstreakSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.0}%, short {:.2} vs long {:.2})",
            self.classification,
            self.confidence * 100.0,
            self.short_mean,
            self.long_mean,
        )
    }
}

// ---------------------------------------------------------------------------
// Strategy lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a strategy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Armed,
    BetPlaced,
    Resolved,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Idle => write!(f, "idle"),
            MachineState::Armed => write!(f, "armed"),
            MachineState::BetPlaced => write!(f, "bet_placed"),
            MachineState::Resolved => write!(f, "resolved"),
        }
    }
}

/// Read-only view of one strategy machine, published to the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub name: String,
    pub state: MachineState,
    pub current_stake: Decimal,
    pub consecutive_losses: u32,
    pub wins: u32,
    pub cooldown_remaining: u32,
    pub total_pnl: Decimal,
    pub retired: bool,
}

// ---------------------------------------------------------------------------
// Engine snapshot (front-end stream)
// ---------------------------------------------------------------------------

/// Session roll-up included in every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub rounds_seen: u64,
    pub bets_placed: u64,
    pub bets_won: u64,
    pub bets_lost: u64,
    pub total_pnl: Decimal,
    pub balance: Option<Decimal>,
}

/// Live trajectory of the current round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundView {
    pub round_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub trajectory: Vec<f64>,
}

/// One consistent, immutable view of engine state — published per settled
/// round and on control transitions, so readers never observe a
/// half-written round/bet pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub phase: RoundPhase,
    pub paused: bool,
    pub session: SessionSummary,
    pub current_round: Option<RoundView>,
    pub signal: HotstreakSignal,
    pub strategies: Vec<StrategySnapshot>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Front-end control commands
// ---------------------------------------------------------------------------

/// Commands the front end can inject into the engine's control queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    /// Finish resolving the current round, then halt cleanly.
    Stop,
    UpdateStrategy {
        name: String,
        #[serde(default)]
        base_stake: Option<Decimal>,
        #[serde(default)]
        target_cashout: Option<f64>,
    },
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CRASHER.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error(transparent)]
    Driver(#[from] crate::driver::DriverError),

    #[error("Constraint violation [{strategy}]: {message}")]
    Constraint { strategy: String, message: String },

    #[error("Data integrity: {0}")]
    DataIntegrity(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
