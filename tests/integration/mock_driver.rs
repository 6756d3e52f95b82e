//! Mock game driver for integration testing.
//!
//! Provides a deterministic `GameDriver` implementation scripted from
//! test code through a channel — events arrive exactly when the test
//! sends them, placed bets are recorded, and failures are injectable.
//! All state is in-memory with no external dependencies.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crasher::driver::{
    BetAck, CashOutAck, Credentials, DriverError, DriverEvent, GameDriver,
};
use crasher::types::MultiplierEvent;

/// A bet the engine asked the driver to place.
#[derive(Debug, Clone)]
pub struct PlacedBet {
    pub stake: Decimal,
    pub target_cashout: Option<f64>,
}

/// Test-side controls for a running [`MockDriver`].
#[derive(Clone)]
pub struct MockDriverHandle {
    events: mpsc::UnboundedSender<Result<DriverEvent, DriverError>>,
    pub placed: Arc<Mutex<Vec<PlacedBet>>>,
    reject_bets: Arc<AtomicBool>,
    pub reconnects: Arc<AtomicU32>,
    history: Arc<Mutex<Vec<f64>>>,
    balance: Arc<Mutex<Option<Decimal>>>,
}

impl MockDriverHandle {
    /// Deliver an event (or stream error) to the engine.
    pub fn send(&self, event: Result<DriverEvent, DriverError>) {
        self.events.send(event).expect("engine hung up");
    }

    pub fn send_multiplier(&self, round_id: Uuid, sequence_id: u64, value: f64) {
        self.send(Ok(DriverEvent::Multiplier(MultiplierEvent {
            round_id,
            sequence_id,
            value,
            observed_at: Utc::now(),
        })));
    }

    pub fn send_settled(&self, round_id: Uuid, crash_multiplier: f64) {
        self.send(Ok(DriverEvent::RoundSettled { round_id, crash_multiplier }));
    }

    /// Deliver a complete round: ticks from 1.0 up to the crash, then
    /// the settlement.
    pub fn send_round(&self, crash: f64) -> Uuid {
        let round_id = Uuid::new_v4();
        let mut seq = 1u64;
        let mut value = 1.0;
        while value < crash {
            self.send_multiplier(round_id, seq, value);
            seq += 1;
            value += (crash / 3.0).max(0.4);
        }
        self.send_multiplier(round_id, seq, crash);
        self.send_settled(round_id, crash);
        round_id
    }

    /// Force all subsequent bet placements to be refused.
    pub fn set_reject_bets(&self, reject: bool) {
        self.reject_bets.store(reject, Ordering::SeqCst);
    }

    pub fn set_history(&self, history: Vec<f64>) {
        *self.history.lock().unwrap() = history;
    }

    pub fn set_balance(&self, balance: Option<Decimal>) {
        *self.balance.lock().unwrap() = balance;
    }

    pub fn placed_stakes(&self) -> Vec<Decimal> {
        self.placed.lock().unwrap().iter().map(|b| b.stake).collect()
    }
}

/// Scripted driver. `next_event` waits on the test's channel and hangs
/// once it closes, so the engine only exits through control commands.
pub struct MockDriver {
    events: mpsc::UnboundedReceiver<Result<DriverEvent, DriverError>>,
    placed: Arc<Mutex<Vec<PlacedBet>>>,
    reject_bets: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
    history: Arc<Mutex<Vec<f64>>>,
    balance: Arc<Mutex<Option<Decimal>>>,
    cashout_multiplier: f64,
}

pub fn mock_driver() -> (MockDriver, MockDriverHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let placed = Arc::new(Mutex::new(Vec::new()));
    let reject_bets = Arc::new(AtomicBool::new(false));
    let reconnects = Arc::new(AtomicU32::new(0));
    let history = Arc::new(Mutex::new(Vec::new()));
    let balance = Arc::new(Mutex::new(None));

    let driver = MockDriver {
        events: rx,
        placed: placed.clone(),
        reject_bets: reject_bets.clone(),
        reconnects: reconnects.clone(),
        history: history.clone(),
        balance: balance.clone(),
        cashout_multiplier: 2.0,
    };
    let handle = MockDriverHandle {
        events: tx,
        placed,
        reject_bets,
        reconnects,
        history,
        balance,
    };
    (driver, handle)
}

#[async_trait]
impl GameDriver for MockDriver {
    async fn login(&mut self, _: &Credentials) -> Result<(), DriverError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<DriverEvent, DriverError> {
        match self.events.recv().await {
            Some(event) => event,
            None => futures::future::pending().await,
        }
    }

    async fn place_bet(
        &mut self,
        stake: Decimal,
        target_cashout: Option<f64>,
    ) -> Result<BetAck, DriverError> {
        if self.reject_bets.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("scripted rejection".into()));
        }
        self.placed.lock().unwrap().push(PlacedBet { stake, target_cashout });
        Ok(BetAck { accepted_stake: stake, reference: format!("mock-{stake}") })
    }

    async fn cash_out(&mut self) -> Result<CashOutAck, DriverError> {
        Ok(CashOutAck { multiplier: self.cashout_multiplier })
    }

    async fn replay_history(&mut self) -> Result<Vec<f64>, DriverError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn balance(&mut self) -> Result<Option<Decimal>, DriverError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn keepalive(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), DriverError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
