//! Stake-sizing policies.
//!
//! A closed set of tagged variants behind one sizing contract — strategy
//! variance lives here, not in a trait hierarchy.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::StreakClass;

// ---------------------------------------------------------------------------
// Arm conditions
// ---------------------------------------------------------------------------

/// Cold trigger: arm only after `count` consecutive crashes below `below`.
#[derive(Debug, Clone, Deserialize)]
pub struct ColdTrigger {
    pub count: usize,
    pub below: f64,
}

impl ColdTrigger {
    /// `recent` is oldest-first; the trigger matches when the last
    /// `count` crashes are all below the threshold.
    pub fn matches(&self, recent: &[f64]) -> bool {
        if recent.len() < self.count {
            return false;
        }
        recent[recent.len() - self.count..]
            .iter()
            .all(|m| *m < self.below)
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Stake-sizing policy for one strategy.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StakePolicy {
    /// Constant stake every bet.
    Fixed { stake: Decimal },
    /// Stake scales by `multiplier` per consecutive loss, bounded by
    /// `max_stake`; a win resets to `base`.
    Martingale {
        base: Decimal,
        multiplier: Decimal,
        max_stake: Decimal,
    },
    /// Bets only while the hotstreak signal matches `target` at or above
    /// `min_confidence`; sizes like `Martingale`.
    SignalGated {
        base: Decimal,
        multiplier: Decimal,
        max_stake: Decimal,
        target: StreakClass,
        min_confidence: f64,
    },
}

impl StakePolicy {
    /// Stake for the next bet after `consecutive_losses` losses.
    pub fn stake_for(&self, consecutive_losses: u32) -> Decimal {
        match self {
            StakePolicy::Fixed { stake } => *stake,
            StakePolicy::Martingale { base, multiplier, max_stake }
            | StakePolicy::SignalGated { base, multiplier, max_stake, .. } => {
                let mut stake = *base;
                for _ in 0..consecutive_losses {
                    stake *= *multiplier;
                    if stake >= *max_stake {
                        return *max_stake;
                    }
                }
                stake.min(*max_stake)
            }
        }
    }

    /// The signal gate, if this policy has one.
    pub fn signal_gate(&self) -> Option<(StreakClass, f64)> {
        match self {
            StakePolicy::SignalGated { target, min_confidence, .. } => {
                Some((*target, *min_confidence))
            }
            _ => None,
        }
    }

    pub fn base_stake(&self) -> Decimal {
        match self {
            StakePolicy::Fixed { stake } => *stake,
            StakePolicy::Martingale { base, .. } | StakePolicy::SignalGated { base, .. } => *base,
        }
    }

    /// Replace the base stake (front-end strategy update).
    pub fn set_base_stake(&mut self, new_base: Decimal) {
        match self {
            StakePolicy::Fixed { stake } => *stake = new_base,
            StakePolicy::Martingale { base, .. } | StakePolicy::SignalGated { base, .. } => {
                *base = new_base
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
