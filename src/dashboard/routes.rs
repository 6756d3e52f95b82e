//! Dashboard route handlers.
//!
//! Every read handler serves from the engine's snapshot channel or the
//! store; snapshots are immutable per-round views, so the front end never
//! observes a half-written round/bet pair. The control handler forwards
//! validated commands into the engine's queue.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use uuid::Uuid;

use crate::store::Store;
use crate::types::{ControlCommand, EngineSnapshot, HotstreakSignal};

/// Rounds/bets returned by the history endpoints.
const HISTORY_LIMIT: usize = 100;

/// Shared dashboard state.
pub struct DashboardState {
    snapshots: watch::Receiver<EngineSnapshot>,
    control: mpsc::Sender<ControlCommand>,
    store: Store,
    session_id: Uuid,
}

pub type AppState = Arc<DashboardState>;

impl DashboardState {
    pub fn new(
        snapshots: watch::Receiver<EngineSnapshot>,
        control: mpsc::Sender<ControlCommand>,
        store: Store,
        session_id: Uuid,
    ) -> Self {
        Self { snapshots, control, store, session_id }
    }

    /// State with an inert snapshot channel, for route tests.
    #[cfg(test)]
    pub fn for_tests(store: Store, session_id: Uuid) -> (Self, mpsc::Receiver<ControlCommand>) {
        use crate::types::{RoundPhase, SessionSummary};

        let snapshot = EngineSnapshot {
            phase: RoundPhase::AwaitingRoundStart,
            paused: false,
            session: SessionSummary {
                session_id,
                started_at: chrono::Utc::now(),
                rounds_seen: 0,
                bets_placed: 0,
                bets_won: 0,
                bets_lost: 0,
                total_pnl: rust_decimal::Decimal::ZERO,
                balance: None,
            },
            current_round: None,
            signal: HotstreakSignal::insufficient(0),
            strategies: Vec::new(),
            updated_at: chrono::Utc::now(),
        };
        let (tx, rx) = watch::channel(snapshot);
        // Keep the sender alive for the lifetime of the state.
        std::mem::forget(tx);
        let (control_tx, control_rx) = mpsc::channel(8);
        (Self::new(rx, control_tx, store, session_id), control_rx)
    }

    fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }
}

// ---------------------------------------------------------------------------
// Read handlers
// ---------------------------------------------------------------------------

pub async fn health() -> &'static str {
    "ok"
}

/// Full engine snapshot: phase, session summary, live trajectory,
/// signal, and per-strategy state.
pub async fn get_status(State(state): State<AppState>) -> Json<EngineSnapshot> {
    Json(state.snapshot())
}

pub async fn get_signal(State(state): State<AppState>) -> Json<HotstreakSignal> {
    Json(state.snapshot().signal)
}

pub async fn get_strategies(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot().strategies)
}

/// Recent rounds of the active session, newest last.
pub async fn get_rounds(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.session_rounds(state.session_id).await {
        Ok(mut rounds) => {
            if rounds.len() > HISTORY_LIMIT {
                rounds.drain(..rounds.len() - HISTORY_LIMIT);
            }
            Json(rounds).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load rounds");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Recent bets of the active session, newest last.
pub async fn get_bets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.session_bets(state.session_id).await {
        Ok(mut bets) => {
            if bets.len() > HISTORY_LIMIT {
                bets.drain(..bets.len() - HISTORY_LIMIT);
            }
            Json(bets).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load bets");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Control handler
// ---------------------------------------------------------------------------

/// Accept a control command and forward it to the engine.
pub async fn post_control(
    State(state): State<AppState>,
    Json(command): Json<ControlCommand>,
) -> impl IntoResponse {
    match state.control.send(command).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => {
            // Engine gone; nothing to control.
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
