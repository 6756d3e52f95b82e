//! Outbound driver command queue.
//!
//! All commands to the driver flow through one ordered queue so the
//! driver never sees overlapping commands for the same round. Bet and
//! cash-out commands carry an idempotency key (round + strategy); a
//! retried or re-enqueued command can never double-bet. Transient driver
//! failures get one bounded-backoff retry; everything else is reported
//! back to the engine as a command outcome.

use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::driver::{BetAck, CashOutAck, DriverError, GameDriver};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// An outbound command awaiting execution.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    PlaceBet {
        round_id: Uuid,
        strategy: String,
        stake: Decimal,
        target_cashout: Option<f64>,
    },
    CashOut {
        round_id: Uuid,
        strategy: String,
    },
    Keepalive,
}

impl DriverCommand {
    /// Idempotency key: one bet and one cash-out per (round, strategy).
    fn idempotency_key(&self) -> Option<String> {
        match self {
            DriverCommand::PlaceBet { round_id, strategy, .. } => {
                Some(format!("bet:{round_id}:{strategy}"))
            }
            DriverCommand::CashOut { round_id, strategy } => {
                Some(format!("cashout:{round_id}:{strategy}"))
            }
            DriverCommand::Keepalive => None,
        }
    }
}

/// What the driver said about an executed command.
#[derive(Debug)]
pub enum CommandOutcome {
    BetPlaced {
        strategy: String,
        round_id: Uuid,
        stake: Decimal,
        target_cashout: Option<f64>,
        ack: BetAck,
    },
    BetRejected {
        strategy: String,
        round_id: Uuid,
        stake: Decimal,
        target_cashout: Option<f64>,
        error: DriverError,
    },
    CashedOut {
        strategy: String,
        ack: CashOutAck,
    },
    CashOutFailed {
        strategy: String,
        error: DriverError,
    },
    KeepaliveSent,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Ordered, deduplicating command queue with retry-once semantics.
pub struct CommandQueue {
    queue: VecDeque<DriverCommand>,
    issued_keys: HashSet<String>,
    retry_backoff: Duration,
}

impl CommandQueue {
    pub fn new(retry_backoff: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            issued_keys: HashSet::new(),
            retry_backoff,
        }
    }

    /// Enqueue a command. Returns false (and drops it) when a command
    /// with the same idempotency key was already issued.
    pub fn enqueue(&mut self, command: DriverCommand) -> bool {
        if let Some(key) = command.idempotency_key() {
            if !self.issued_keys.insert(key.clone()) {
                debug!(%key, "Duplicate command dropped");
                return false;
            }
        }
        self.queue.push_back(command);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop queued bet placements (stop takes priority over new bets).
    /// Cash-outs stay queued: an open position must still be closed.
    pub fn drop_pending_bets(&mut self) {
        let before = self.queue.len();
        self.queue.retain(|c| !matches!(c, DriverCommand::PlaceBet { .. }));
        if self.queue.len() < before {
            debug!(dropped = before - self.queue.len(), "Dropped queued bets for stop");
        }
    }

    /// Forget idempotency keys for a finished round so the set stays
    /// bounded.
    pub fn prune_round(&mut self, round_id: Uuid) {
        let marker = round_id.to_string();
        self.issued_keys.retain(|k| !k.contains(&marker));
    }

    /// Execute every queued command in order, returning their outcomes.
    pub async fn drain(&mut self, driver: &mut dyn GameDriver) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::new();
        while let Some(command) = self.queue.pop_front() {
            outcomes.push(self.execute(driver, command).await);
        }
        outcomes
    }

    async fn execute(
        &self,
        driver: &mut dyn GameDriver,
        command: DriverCommand,
    ) -> CommandOutcome {
        match command {
            DriverCommand::PlaceBet { round_id, strategy, stake, target_cashout } => {
                let mut result = driver.place_bet(stake, target_cashout).await;
                if let Err(e) = &result {
                    if e.is_transient() {
                        warn!(strategy = %strategy, error = %e, backoff = ?self.retry_backoff, "Transient bet failure — retrying once");
                        tokio::time::sleep(self.retry_backoff).await;
                        result = driver.place_bet(stake, target_cashout).await;
                    }
                }
                match result {
                    Ok(ack) => CommandOutcome::BetPlaced {
                        strategy,
                        round_id,
                        stake,
                        target_cashout,
                        ack,
                    },
                    Err(error) => {
                        warn!(strategy = %strategy, %error, "Bet placement failed");
                        CommandOutcome::BetRejected {
                            strategy,
                            round_id,
                            stake,
                            target_cashout,
                            error,
                        }
                    }
                }
            }
            DriverCommand::CashOut { strategy, .. } => {
                let mut result = driver.cash_out().await;
                if let Err(e) = &result {
                    if e.is_transient() {
                        warn!(strategy = %strategy, error = %e, backoff = ?self.retry_backoff, "Transient cash-out failure — retrying once");
                        tokio::time::sleep(self.retry_backoff).await;
                        result = driver.cash_out().await;
                    }
                }
                match result {
                    Ok(ack) => CommandOutcome::CashedOut { strategy, ack },
                    Err(error) => {
                        warn!(strategy = %strategy, %error, "Cash-out failed");
                        CommandOutcome::CashOutFailed { strategy, error }
                    }
                }
            }
            DriverCommand::Keepalive => {
                if let Err(error) = driver.keepalive().await {
                    debug!(%error, "Keepalive failed");
                }
                CommandOutcome::KeepaliveSent
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
