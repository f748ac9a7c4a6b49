//! One-shot account cleanup
//!
//! Cancels all orders and closes all positions on both accounts, verifies
//! both are flat, and exits 0 on success, 1 otherwise. Useful after a crash
//! or before switching strategy parameters.

use std::env;
use std::process::ExitCode;

use log::{error, info};

use hedge_grid_bot::settings::account_credentials;
use hedge_grid_bot::venue::Venue;
use hedge_grid_bot::{BinanceVenue, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if dotenvy::dotenv().is_err() {
        info!("No .env file found, using process environment");
    }

    let config_path = config_path_from_args().unwrap_or_else(|| "config".to_string());
    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration '{config_path}': {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut all_flat = true;

    for account in ["A", "B"] {
        let credentials = match account_credentials(account) {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        };

        let venue = match BinanceVenue::connect(
            credentials,
            &settings.trading.pair,
            &format!("Account_{account}_Cleanup"),
        )
        .await
        {
            Ok(venue) => venue,
            Err(e) => {
                error!("Account {account} session failed: {e}");
                return ExitCode::FAILURE;
            }
        };

        info!("Account {account}: state before cleanup");
        report_account_state(&venue).await;

        let success = match venue.cleanup().await {
            Ok(success) => success,
            Err(e) => {
                error!("Account {account} cleanup failed: {e}");
                false
            }
        };

        info!("Account {account}: state after cleanup");
        report_account_state(&venue).await;

        if success {
            info!("Account {account} cleanup verified");
        } else {
            error!("Account {account} cleanup incomplete");
            all_flat = false;
        }
    }

    if all_flat {
        info!("Both accounts flat");
        ExitCode::SUCCESS
    } else {
        error!("Cleanup incomplete, manual intervention required");
        ExitCode::FAILURE
    }
}

async fn report_account_state(venue: &BinanceVenue) {
    match venue.open_orders().await {
        Ok(orders) => info!("  resting orders: {}", orders.len()),
        Err(e) => error!("  failed to fetch orders: {e}"),
    }
    match venue.positions().await {
        Ok((long, short)) => info!("  positions: long={long}, short={short}"),
        Err(e) => error!("  failed to fetch positions: {e}"),
    }
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
