//! Game driver abstraction.
//!
//! Defines the `GameDriver` trait — the interface the engine needs from
//! the browser-driving collaborator — and provides the `BridgeDriver`
//! implementation that talks to a local automation sidecar. The sidecar
//! owns all DOM mechanics; the engine only sees typed events and acks.

pub mod bridge;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use uuid::Uuid;

use crate::types::MultiplierEvent;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Login credentials. The password is never logged or serialized.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Events & acks
// ---------------------------------------------------------------------------

/// An event delivered by the driver's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A live multiplier observation for the current round.
    Multiplier(MultiplierEvent),
    /// The round crashed; `crash_multiplier` is the final value.
    RoundSettled { round_id: Uuid, crash_multiplier: f64 },
}

/// Acknowledgement of an accepted bet.
#[derive(Debug, Clone)]
pub struct BetAck {
    pub accepted_stake: Decimal,
    pub reference: String,
}

/// Acknowledgement of a cash-out, carrying the multiplier at which the
/// position was closed (needed to resolve manual bets).
#[derive(Debug, Clone)]
pub struct CashOutAck {
    pub multiplier: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Driver failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Driver unreachable: {0}")]
    Unreachable(String),

    #[error("Browser session is stale")]
    StaleSession,

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Driver timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// Transient failures are retried with bounded backoff; everything
    /// else escalates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Timeout(_) | DriverError::Unreachable(_))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the browser-driving collaborator.
///
/// The engine is the sole caller. Implementations deliver multiplier
/// events and settlement notices via `next_event`, and execute the
/// outbound commands the engine serializes through its queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GameDriver: Send {
    /// Authenticate the browser session.
    async fn login(&mut self, credentials: &Credentials) -> Result<(), DriverError>;

    /// Wait for the next event from the multiplier stream.
    async fn next_event(&mut self) -> Result<DriverEvent, DriverError>;

    /// Place a bet for the current round.
    async fn place_bet(
        &mut self,
        stake: Decimal,
        target_cashout: Option<f64>,
    ) -> Result<BetAck, DriverError>;

    /// Cash out the open position at the current multiplier.
    async fn cash_out(&mut self) -> Result<CashOutAck, DriverError>;

    /// Read the crash history visible on the page (most recent last).
    /// Used by recovery to backfill gaps.
    async fn replay_history(&mut self) -> Result<Vec<f64>, DriverError>;

    /// Current account balance, if the page exposes it.
    async fn balance(&mut self) -> Result<Option<Decimal>, DriverError>;

    /// Poke the page so the session is not idled out.
    async fn keepalive(&mut self) -> Result<(), DriverError>;

    /// Re-establish a stale browser session.
    async fn reconnect(&mut self) -> Result<(), DriverError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
