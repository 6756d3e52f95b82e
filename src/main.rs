//! CRASHER — automated crash-game betting engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! recovers the previous session from the store, logs the driver in,
//! and runs the control loop with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use crasher::config::AppConfig;
use crasher::dashboard::{self, routes::DashboardState};
use crasher::detector::HotstreakDetector;
use crasher::driver::bridge::BridgeDriver;
use crasher::driver::{Credentials, GameDriver};
use crasher::engine::Engine;
use crasher::recovery;
use crasher::store::Store;
use crasher::strategy::StrategyBook;
use crasher::types::ControlCommand;

const BANNER: &str = r#"
  ____ ____      _    ____  _   _ _____ ____
 / ___|  _ \    / \  / ___|| | | | ____|  _ \
| |   | |_) |  / _ \ \___ \| |_| |  _| | |_) |
| |___|  _ <  / ___ \ ___) |  _  | |___|  _ <
 \____|_| \_\/_/   \_\____/|_| |_|_____|_| \_\

  Crash-game betting engine
  v0.2.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        bot_name = %cfg.bot.name,
        strategies = cfg.strategies.len(),
        db_path = %cfg.bot.db_path,
        "CRASHER starting up"
    );

    // -- Store + driver ----------------------------------------------------

    let store = Store::open(&cfg.bot.db_path).await?;

    let mut driver = BridgeDriver::new(cfg.driver.sidecar_url.clone())
        .context("Failed to build bridge driver")?;

    let credentials = Credentials::new(
        AppConfig::resolve_env(&cfg.driver.username_env)?,
        AppConfig::resolve_env(&cfg.driver.password_env)?,
    );
    driver
        .login(&credentials)
        .await
        .context("Driver login failed")?;
    info!("Driver session established");

    // -- Recovery (completes fully before the control loop starts) --------

    let recovered = recovery::recover(
        &store,
        &mut driver,
        &cfg.recovery,
        cfg.detector.window_capacity as u32,
    )
    .await?;
    let initial_pnl = recovery::session_pnl(&store, &recovered.session).await?;
    let session_id = recovered.session.session_id;

    // -- Engine ------------------------------------------------------------

    let detector = HotstreakDetector::new(cfg.detector.clone());
    let book = StrategyBook::from_configs(&cfg.strategies);

    let (engine, handle) = Engine::new(
        Box::new(driver),
        store.clone(),
        cfg.engine.clone(),
        detector,
        cfg.patterns.clone(),
        book,
        recovered,
        initial_pnl,
    );

    // -- Dashboard ---------------------------------------------------------

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(
            handle.snapshots.clone(),
            handle.control.clone(),
            store.clone(),
            session_id,
        ));
        dashboard::spawn_dashboard(state, cfg.dashboard.port)?;
    }

    // -- Shutdown signal ---------------------------------------------------

    let control = handle.control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            if control.send(ControlCommand::Stop).await.is_err() {
                error!("Engine already gone");
            }
        }
    });

    // -- Run ---------------------------------------------------------------

    info!("Entering control loop. Press Ctrl+C to stop.");
    engine.run().await?;

    info!("CRASHER shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crasher=info"));

    let json_logging = std::env::var("CRASHER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
