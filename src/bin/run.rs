//! Dual-grid strategy runner
//!
//! Starts the supervisor over both accounts and runs until SIGINT/SIGTERM,
//! then shuts down cleanly: executors cancel their orders and close their
//! positions, and both accounts are verified flat.
//!
//! ```bash
//! cargo run --bin run -- --config config.toml
//! ```
//!
//! Credentials are read from the environment (or a `.env` file):
//! `BINANCE_A_API_KEY`, `BINANCE_A_API_SECRET`, `BINANCE_B_API_KEY`,
//! `BINANCE_B_API_SECRET`.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use hedge_grid_bot::settings::account_credentials;
use hedge_grid_bot::{BinanceVenue, Settings, StopReason, StrategyController, TradeType};

const EXIT_FATAL: u8 = 1;
const EXIT_SIGINT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(_) => info!("No .env file found, using process environment"),
    }

    let config_path = config_path_from_args().unwrap_or_else(|| "config".to_string());
    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration '{config_path}': {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let (credentials_a, credentials_b) =
        match (account_credentials("A"), account_credentials("B")) {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                for result in [a, b] {
                    if let Err(e) = result {
                        error!("{e}");
                    }
                }
                return ExitCode::from(EXIT_FATAL);
            }
        };

    let pair = settings.trading.pair.clone();
    let venue_a = match BinanceVenue::connect(credentials_a, &pair, "Account_A").await {
        Ok(venue) => Arc::new(venue),
        Err(e) => {
            error!("Account A session failed: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let venue_b = match BinanceVenue::connect(credentials_b, &pair, "Account_B").await {
        Ok(venue) => Arc::new(venue),
        Err(e) => {
            error!("Account B session failed: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let mut controller = match StrategyController::new(
        venue_a,
        venue_b,
        settings.executor_config(TradeType::Buy),
        settings.executor_config(TradeType::Sell),
        settings.controller_settings(),
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Invalid strategy configuration: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    if let Err(e) = controller.start().await {
        error!("Strategy startup failed: {e}");
        // Leave nothing behind even when startup dies halfway
        let _ = controller.stop().await;
        return ExitCode::from(EXIT_FATAL);
    }

    info!("Strategy running; Ctrl-C to stop");

    let mut interrupted = false;
    let reason = tokio::select! {
        reason = controller.supervise() => reason,
        _ = shutdown_signal() => {
            interrupted = true;
            info!("Stop signal received, shutting down");
            StopReason::Requested
        }
    };

    if reason != StopReason::Requested {
        error!("Supervisor stop: {reason:?}");
    }

    let flat = match controller.stop().await {
        Ok(flat) => flat,
        Err(e) => {
            error!("Shutdown error: {e}");
            false
        }
    };

    // A stop that leaves both accounts flat is a clean stop, whatever
    // triggered it; residue is the only fatal outcome here
    if !flat {
        return ExitCode::from(EXIT_FATAL);
    }
    if interrupted {
        return ExitCode::from(EXIT_SIGINT);
    }
    ExitCode::SUCCESS
}

fn config_path_from_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    args.windows(2).find_map(|pair| {
        if pair[0] == "--config" {
            Some(pair[1].clone())
        } else {
            None
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
