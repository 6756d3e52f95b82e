//! Bridge driver — HTTP client for the local browser-automation sidecar.
//!
//! The sidecar wraps the actual browser (login form, bet panel, multiplier
//! display) behind a small JSON API on localhost. This client maps that
//! API onto the `GameDriver` trait and translates HTTP failures into the
//! driver error taxonomy.
//!
//! Endpoints:
//!   POST /session/login        — authenticate
//!   POST /session/reconnect    — re-establish a stale session
//!   GET  /stream/next          — long-poll the next stream event
//!   POST /bet                  — place a bet
//!   POST /cashout              — cash out the open position
//!   GET  /history              — crash multipliers visible on the page
//!   GET  /balance              — account balance, if visible
//!   POST /keepalive            — poke the page

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BetAck, CashOutAck, Credentials, DriverError, DriverEvent, GameDriver};
use crate::types::MultiplierEvent;

/// Default sidecar address.
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7878";

/// Client-side request timeout. The sidecar's long poll returns within
/// this window or the request counts as a driver timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types (sidecar JSON → Rust)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Event shape returned by `/stream/next`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "multiplier", rename_all = "camelCase")]
    Multiplier {
        round_id: Uuid,
        sequence_id: u64,
        value: f64,
        /// Milliseconds since epoch.
        observed_at: i64,
    },
    #[serde(rename = "round_settled", rename_all = "camelCase")]
    RoundSettled { round_id: Uuid, crash_multiplier: f64 },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BetRequest {
    stake: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_cashout: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetResponse {
    accepted_stake: Decimal,
    reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CashOutResponse {
    multiplier: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    /// Oldest first.
    multipliers: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// `GameDriver` implementation backed by the automation sidecar.
pub struct BridgeDriver {
    http: Client,
    base_url: String,
}

impl BridgeDriver {
    pub fn new(base_url: Option<String>) -> Result<Self, DriverError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("crasher/0.2.0")
            .build()
            .map_err(|e| DriverError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Translate a transport-level reqwest error.
    fn transport_error(e: reqwest::Error) -> DriverError {
        if e.is_timeout() {
            DriverError::Timeout(REQUEST_TIMEOUT)
        } else if e.is_connect() {
            DriverError::Unreachable(e.to_string())
        } else {
            DriverError::Protocol(e.to_string())
        }
    }

    /// Translate a non-success HTTP status.
    async fn status_error(resp: reqwest::Response) -> DriverError {
        let status = resp.status();
        let message = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DriverError::Auth(message),
            StatusCode::GONE => DriverError::StaleSession,
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                DriverError::Rejected(message)
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                DriverError::Unreachable(format!("sidecar {status}: {message}"))
            }
            other => DriverError::Protocol(format!("sidecar {other}: {message}")),
        }
    }

    fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl GameDriver for BridgeDriver {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), DriverError> {
        let body = LoginRequest {
            username: &credentials.username,
            password: credentials.password.expose_secret(),
        };

        let resp = self
            .http
            .post(self.url("/session/login"))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        debug!(username = %credentials.username, "Sidecar login accepted");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<DriverEvent, DriverError> {
        let resp = self
            .http
            .get(self.url("/stream/next"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let wire: WireEvent = resp
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("bad event payload: {e}")))?;

        Ok(match wire {
            WireEvent::Multiplier { round_id, sequence_id, value, observed_at } => {
                DriverEvent::Multiplier(MultiplierEvent {
                    round_id,
                    sequence_id,
                    value,
                    observed_at: Self::ms_to_datetime(observed_at),
                })
            }
            WireEvent::RoundSettled { round_id, crash_multiplier } => {
                DriverEvent::RoundSettled { round_id, crash_multiplier }
            }
        })
    }

    async fn place_bet(
        &mut self,
        stake: Decimal,
        target_cashout: Option<f64>,
    ) -> Result<BetAck, DriverError> {
        let resp = self
            .http
            .post(self.url("/bet"))
            .json(&BetRequest { stake, target_cashout })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let ack: BetResponse = resp
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("bad bet ack: {e}")))?;

        if ack.accepted_stake != stake {
            warn!(
                requested = %stake,
                accepted = %ack.accepted_stake,
                "Sidecar accepted a different stake than requested"
            );
        }

        Ok(BetAck {
            accepted_stake: ack.accepted_stake,
            reference: ack.reference,
        })
    }

    async fn cash_out(&mut self) -> Result<CashOutAck, DriverError> {
        let resp = self
            .http
            .post(self.url("/cashout"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let ack: CashOutResponse = resp
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("bad cashout ack: {e}")))?;

        Ok(CashOutAck { multiplier: ack.multiplier })
    }

    async fn replay_history(&mut self) -> Result<Vec<f64>, DriverError> {
        let resp = self
            .http
            .get(self.url("/history"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let history: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("bad history payload: {e}")))?;

        Ok(history.multipliers)
    }

    async fn balance(&mut self) -> Result<Option<Decimal>, DriverError> {
        let resp = self
            .http
            .get(self.url("/balance"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }

        let body: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("bad balance payload: {e}")))?;

        Ok(body.balance)
    }

    async fn keepalive(&mut self) -> Result<(), DriverError> {
        let resp = self
            .http
            .post(self.url("/keepalive"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), DriverError> {
        let resp = self
            .http
            .post(self.url("/session/reconnect"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
