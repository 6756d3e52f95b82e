//! Persistence layer.
//!
//! SQLite-backed, append-mostly record sets for sessions, rounds,
//! multiplier events, and bets. The engine is the only writer while the
//! control loop runs (recovery writes only before it starts); dashboard
//! reads go through the same pool and WAL mode keeps them consistent with
//! in-flight writes. Round settlement is transactional so no reader can
//! observe a settled round with unresolved bets.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Bet, BetOutcome, MultiplierEvent, Round, Session};

/// Durable log of sessions, rounds, multiplier events, and bets.
/// Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run the
    /// schema migration.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open database")?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.as_ref().display(), "Store opened");
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query
    /// on the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Bad in-memory connection string")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id       TEXT PRIMARY KEY,
                started_at       TEXT NOT NULL,
                ended_at         TEXT,
                starting_balance TEXT,
                ending_balance   TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rounds (
                round_id         TEXT PRIMARY KEY,
                session_id       TEXT NOT NULL REFERENCES sessions(session_id),
                crash_multiplier REAL,
                started_at       TEXT NOT NULL,
                ended_at         TEXT,
                excluded         INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS multiplier_events (
                round_id    TEXT NOT NULL REFERENCES rounds(round_id),
                sequence_id INTEGER NOT NULL,
                value       REAL NOT NULL,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (round_id, sequence_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bets (
                bet_id         TEXT PRIMARY KEY,
                session_id     TEXT NOT NULL REFERENCES sessions(session_id),
                round_id       TEXT NOT NULL REFERENCES rounds(round_id),
                strategy_name  TEXT NOT NULL,
                stake          TEXT NOT NULL,
                target_cashout REAL,
                outcome        TEXT NOT NULL
                    CHECK(outcome IN ('pending','won','lost','unknown','rejected')),
                payout         TEXT,
                placed_at      TEXT NOT NULL,
                resolved_at    TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rounds_session ON rounds(session_id, started_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bets_session ON bets(session_id, placed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // -- Sessions ---------------------------------------------------------

    pub async fn create_session(&self, starting_balance: Option<Decimal>) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            starting_balance,
            ending_balance: None,
        };

        sqlx::query(
            "INSERT INTO sessions (session_id, started_at, starting_balance) VALUES (?, ?, ?)",
        )
        .bind(session.session_id.to_string())
        .bind(session.started_at.to_rfc3339())
        .bind(session.starting_balance.map(|b| b.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        info!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    pub async fn end_session(
        &self,
        session_id: Uuid,
        ending_balance: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ?, ending_balance = ? WHERE session_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(ending_balance.map(|b| b.to_string()))
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to end session")?;
        info!(session_id = %session_id, "Session closed");
        Ok(())
    }

    /// The most recently started session, if any.
    pub async fn last_session(&self) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT session_id, started_at, ended_at, starting_balance, ending_balance
             FROM sessions ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query last session")?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    // -- Rounds -----------------------------------------------------------

    pub async fn open_round(
        &self,
        round_id: Uuid,
        session_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        // Idempotent: resuming an interrupted round after recovery must
        // not fail on the existing row.
        sqlx::query(
            "INSERT INTO rounds (round_id, session_id, started_at) VALUES (?, ?, ?)
             ON CONFLICT(round_id) DO NOTHING",
        )
        .bind(round_id.to_string())
        .bind(session_id.to_string())
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to open round")?;
        debug!(round_id = %round_id, "Round opened");
        Ok(())
    }

    /// Settle a round and resolve its bets in one transaction, so readers
    /// never see a settled round with still-pending bets.
    pub async fn settle_round(
        &self,
        round_id: Uuid,
        crash_multiplier: f64,
        resolutions: &[(Uuid, BetOutcome)],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.context("Failed to begin settlement")?;

        sqlx::query("UPDATE rounds SET crash_multiplier = ?, ended_at = ? WHERE round_id = ?")
            .bind(crash_multiplier)
            .bind(&now)
            .bind(round_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to settle round")?;

        for (bet_id, outcome) in resolutions {
            let payout = match outcome {
                BetOutcome::Won { payout } => Some(payout.to_string()),
                _ => None,
            };
            sqlx::query("UPDATE bets SET outcome = ?, payout = ?, resolved_at = ? WHERE bet_id = ?")
                .bind(outcome.kind())
                .bind(payout)
                .bind(&now)
                .bind(bet_id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to resolve bet")?;
        }

        tx.commit().await.context("Failed to commit settlement")?;
        debug!(round_id = %round_id, crash = crash_multiplier, bets = resolutions.len(), "Round settled");
        Ok(())
    }

    /// Flag a round so detector replay skips it.
    pub async fn mark_round_excluded(&self, round_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE rounds SET excluded = 1 WHERE round_id = ?")
            .bind(round_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to exclude round")?;
        Ok(())
    }

    pub async fn round(&self, round_id: Uuid) -> Result<Option<Round>> {
        let row = sqlx::query(
            "SELECT round_id, session_id, crash_multiplier, started_at, ended_at, excluded
             FROM rounds WHERE round_id = ?",
        )
        .bind(round_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query round")?;

        row.map(|r| round_from_row(&r)).transpose()
    }

    /// All rounds of a session, chronological.
    pub async fn session_rounds(&self, session_id: Uuid) -> Result<Vec<Round>> {
        let rows = sqlx::query(
            "SELECT round_id, session_id, crash_multiplier, started_at, ended_at, excluded
             FROM rounds WHERE session_id = ? ORDER BY started_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query session rounds")?;

        rows.iter().map(round_from_row).collect()
    }

    /// Rounds across sessions within a time range, chronological.
    pub async fn rounds_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Round>> {
        let rows = sqlx::query(
            "SELECT round_id, session_id, crash_multiplier, started_at, ended_at, excluded
             FROM rounds WHERE started_at >= ? AND started_at < ? ORDER BY started_at ASC",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query rounds by time range")?;

        rows.iter().map(round_from_row).collect()
    }

    /// Crash multipliers of the last `limit` settled, non-excluded rounds
    /// of a session, chronological. This is the detector replay feed.
    pub async fn settled_crashes(&self, session_id: Uuid, limit: u32) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            "SELECT crash_multiplier FROM (
                 SELECT crash_multiplier, started_at FROM rounds
                 WHERE session_id = ? AND ended_at IS NOT NULL
                   AND excluded = 0 AND crash_multiplier IS NOT NULL
                 ORDER BY started_at DESC LIMIT ?
             ) ORDER BY started_at ASC",
        )
        .bind(session_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query settled crashes")?;

        Ok(rows.iter().map(|r| r.get::<f64, _>(0)).collect())
    }

    /// Insert settled rounds reconstructed from page history, spacing
    /// timestamps evenly between `start` and `end`.
    pub async fn backfill_rounds(
        &self,
        session_id: Uuid,
        crashes: &[f64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if crashes.is_empty() {
            return Ok(Vec::new());
        }
        let total = (end - start).num_milliseconds().max(0);
        let step = total / crashes.len().max(1) as i64;

        let mut ids = Vec::with_capacity(crashes.len());
        for (i, crash) in crashes.iter().enumerate() {
            let at = start + chrono::Duration::milliseconds(step * (i as i64 + 1));
            let round_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO rounds (round_id, session_id, crash_multiplier, started_at, ended_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(round_id.to_string())
            .bind(session_id.to_string())
            .bind(*crash)
            .bind(at.to_rfc3339())
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await
            .context("Failed to backfill round")?;
            ids.push(round_id);
        }

        info!(session_id = %session_id, count = crashes.len(), "Backfilled rounds");
        Ok(ids)
    }

    // -- Multiplier events ------------------------------------------------

    /// Append an observed event. Re-delivery of an already-stored
    /// (round, sequence) pair is ignored; events are immutable once
    /// recorded.
    pub async fn append_event(&self, event: &MultiplierEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO multiplier_events (round_id, sequence_id, value, observed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(round_id, sequence_id) DO NOTHING",
        )
        .bind(event.round_id.to_string())
        .bind(event.sequence_id as i64)
        .bind(event.value)
        .bind(event.observed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to append multiplier event")?;
        Ok(())
    }

    /// All events of a round in sequence order.
    pub async fn round_events(&self, round_id: Uuid) -> Result<Vec<MultiplierEvent>> {
        let rows = sqlx::query(
            "SELECT round_id, sequence_id, value, observed_at
             FROM multiplier_events WHERE round_id = ? ORDER BY sequence_id ASC",
        )
        .bind(round_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query round events")?;

        rows.iter().map(event_from_row).collect()
    }

    // -- Bets -------------------------------------------------------------

    pub async fn record_bet(&self, bet: &Bet) -> Result<()> {
        let payout = match &bet.outcome {
            BetOutcome::Won { payout } => Some(payout.to_string()),
            _ => None,
        };
        sqlx::query(
            "INSERT INTO bets (bet_id, session_id, round_id, strategy_name, stake,
                               target_cashout, outcome, payout, placed_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bet.bet_id.to_string())
        .bind(bet.session_id.to_string())
        .bind(bet.round_id.to_string())
        .bind(&bet.strategy_name)
        .bind(bet.stake.to_string())
        .bind(bet.target_cashout)
        .bind(bet.outcome.kind())
        .bind(payout)
        .bind(bet.placed_at.to_rfc3339())
        .bind(bet.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("Failed to record bet")?;
        debug!(bet_id = %bet.bet_id, strategy = %bet.strategy_name, "Bet recorded");
        Ok(())
    }

    pub async fn resolve_bet(&self, bet_id: Uuid, outcome: &BetOutcome) -> Result<()> {
        let payout = match outcome {
            BetOutcome::Won { payout } => Some(payout.to_string()),
            _ => None,
        };
        sqlx::query("UPDATE bets SET outcome = ?, payout = ?, resolved_at = ? WHERE bet_id = ?")
            .bind(outcome.kind())
            .bind(payout)
            .bind(Utc::now().to_rfc3339())
            .bind(bet_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to resolve bet")?;
        Ok(())
    }

    /// All unresolved bets, oldest first.
    pub async fn pending_bets(&self) -> Result<Vec<Bet>> {
        let rows = sqlx::query(
            "SELECT bet_id, session_id, round_id, strategy_name, stake, target_cashout,
                    outcome, payout, placed_at, resolved_at
             FROM bets WHERE outcome = 'pending' ORDER BY placed_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query pending bets")?;

        rows.iter().map(bet_from_row).collect()
    }

    /// All bets of a session, oldest first.
    pub async fn session_bets(&self, session_id: Uuid) -> Result<Vec<Bet>> {
        let rows = sqlx::query(
            "SELECT bet_id, session_id, round_id, strategy_name, stake, target_cashout,
                    outcome, payout, placed_at, resolved_at
             FROM bets WHERE session_id = ? ORDER BY placed_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query session bets")?;

        rows.iter().map(bet_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Bad uuid in database: {s}"))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Bad timestamp in database: {s}"))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Bad decimal in database: {s}"))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        started_at: parse_ts(&row.get::<String, _>("started_at"))?,
        ended_at: row
            .get::<Option<String>, _>("ended_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        starting_balance: row
            .get::<Option<String>, _>("starting_balance")
            .as_deref()
            .map(parse_decimal)
            .transpose()?,
        ending_balance: row
            .get::<Option<String>, _>("ending_balance")
            .as_deref()
            .map(parse_decimal)
            .transpose()?,
    })
}

fn round_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Round> {
    Ok(Round {
        round_id: parse_uuid(&row.get::<String, _>("round_id"))?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        crash_multiplier: row.get::<Option<f64>, _>("crash_multiplier"),
        started_at: parse_ts(&row.get::<String, _>("started_at"))?,
        ended_at: row
            .get::<Option<String>, _>("ended_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        excluded: row.get::<i64, _>("excluded") != 0,
    })
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MultiplierEvent> {
    Ok(MultiplierEvent {
        round_id: parse_uuid(&row.get::<String, _>("round_id"))?,
        sequence_id: row.get::<i64, _>("sequence_id") as u64,
        value: row.get::<f64, _>("value"),
        observed_at: parse_ts(&row.get::<String, _>("observed_at"))?,
    })
}

fn bet_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Bet> {
    let outcome = match row.get::<String, _>("outcome").as_str() {
        "pending" => BetOutcome::Pending,
        "won" => BetOutcome::Won {
            payout: row
                .get::<Option<String>, _>("payout")
                .as_deref()
                .map(parse_decimal)
                .transpose()?
                .unwrap_or(Decimal::ZERO),
        },
        "lost" => BetOutcome::Lost,
        "unknown" => BetOutcome::Unknown,
        "rejected" => BetOutcome::Rejected,
        other => anyhow::bail!("Bad bet outcome in database: {other}"),
    };

    Ok(Bet {
        bet_id: parse_uuid(&row.get::<String, _>("bet_id"))?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        round_id: parse_uuid(&row.get::<String, _>("round_id"))?,
        strategy_name: row.get::<String, _>("strategy_name"),
        stake: parse_decimal(&row.get::<String, _>("stake"))?,
        target_cashout: row.get::<Option<f64>, _>("target_cashout"),
        outcome,
        placed_at: parse_ts(&row.get::<String, _>("placed_at"))?,
        resolved_at: row
            .get::<Option<String>, _>("resolved_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
