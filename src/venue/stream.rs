//! User-data WebSocket stream task for the live venue
//!
//! Maintains the listen key, keeps the book-ticker mid cached, and forwards
//! order/account events onto the owning executor's queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::grid::order::StreamOrderUpdate;

use super::{PositionsUpdate, VenueEvent};

/// Stream heartbeat staleness threshold
const HEARTBEAT_STALE_SECS: u64 = 90;
/// Per-receive deadline; one silent window triggers a ping, a second one a
/// reconnect
const RECV_TIMEOUT_SECS: u64 = 30;
/// Listen-key keepalive cadence
const KEEPALIVE_SECS: u64 = 1800;

const RECONNECT_BASE_DELAY_SECS: u64 = 5;
const RECONNECT_MAX_DELAY_SECS: u64 = 60;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Shared view of a running stream task
pub struct StreamHandle {
    running: Arc<AtomicBool>,
    last_heartbeat_secs: Arc<AtomicU64>,
    cached_mid: Arc<Mutex<Option<Decimal>>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// The stream counts as healthy while messages keep arriving
    pub fn is_healthy(&self) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            return false;
        }
        let last = self.last_heartbeat_secs.load(Ordering::Relaxed);
        last > 0 && now_secs().saturating_sub(last) <= HEARTBEAT_STALE_SECS
    }

    pub fn cached_mid(&self) -> Option<Decimal> {
        self.cached_mid.lock().ok().and_then(|guard| *guard)
    }

    pub fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        self.task.abort();
    }
}

pub(super) struct UserDataStream {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    api_key: String,
    symbol: String,
    account_name: String,
}

impl UserDataStream {
    pub(super) fn new(
        http: reqwest::Client,
        base_url: String,
        ws_url: String,
        api_key: String,
        symbol: String,
        account_name: String,
    ) -> Self {
        Self {
            http,
            base_url,
            ws_url,
            api_key,
            symbol,
            account_name,
        }
    }

    pub(super) fn spawn(self, tx: mpsc::UnboundedSender<VenueEvent>) -> StreamHandle {
        let running = Arc::new(AtomicBool::new(true));
        let last_heartbeat_secs = Arc::new(AtomicU64::new(0));
        let cached_mid = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run_stream(
            self,
            tx,
            running.clone(),
            last_heartbeat_secs.clone(),
            cached_mid.clone(),
        ));

        StreamHandle {
            running,
            last_heartbeat_secs,
            cached_mid,
            task,
        }
    }

    async fn acquire_listen_key(&self) -> Option<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        body["listenKey"].as_str().map(str::to_string)
    }

    async fn keepalive_listen_key(&self) {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let result = self
            .http
            .put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        match result {
            Ok(_) => debug!("[{}] Listen key renewed", self.account_name),
            Err(e) => warn!("[{}] Listen key keepalive failed: {}", self.account_name, e),
        }
    }
}

async fn run_stream(
    stream: UserDataStream,
    tx: mpsc::UnboundedSender<VenueEvent>,
    running: Arc<AtomicBool>,
    last_heartbeat_secs: Arc<AtomicU64>,
    cached_mid: Arc<Mutex<Option<Decimal>>>,
) {
    let mut reconnect_attempts = 0u32;

    while running.load(Ordering::Relaxed) {
        let listen_key = match stream.acquire_listen_key().await {
            Some(key) => key,
            None => {
                error!("[{}] Failed to acquire listen key", stream.account_name);
                reconnect_attempts += 1;
                if backoff_or_give_up(&stream, &running, reconnect_attempts).await {
                    break;
                }
                continue;
            }
        };

        match connect_and_consume(
            &stream,
            &listen_key,
            &tx,
            &running,
            &last_heartbeat_secs,
            &cached_mid,
        )
        .await
        {
            Ok(()) => {
                // Clean session end (e.g. listen key expiry); reconnect fresh
                reconnect_attempts = 0;
            }
            Err(e) => {
                warn!("[{}] Stream connection lost: {}", stream.account_name, e);
                reconnect_attempts += 1;
                if backoff_or_give_up(&stream, &running, reconnect_attempts).await {
                    break;
                }
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    info!("[{}] User-data stream task exited", stream.account_name);
}

/// Sleep the backoff delay. Returns true when the attempt budget is spent.
async fn backoff_or_give_up(
    stream: &UserDataStream,
    running: &AtomicBool,
    attempts: u32,
) -> bool {
    if attempts >= MAX_RECONNECT_ATTEMPTS {
        error!(
            "[{}] Giving up after {} reconnect attempts",
            stream.account_name, attempts
        );
        running.store(false, Ordering::Relaxed);
        return true;
    }

    let delay = (RECONNECT_BASE_DELAY_SECS << (attempts.saturating_sub(1)).min(8))
        .min(RECONNECT_MAX_DELAY_SECS);
    info!(
        "[{}] Reconnecting in {}s (attempt {}/{})",
        stream.account_name, delay, attempts, MAX_RECONNECT_ATTEMPTS
    );
    tokio::time::sleep(Duration::from_secs(delay)).await;
    false
}

async fn connect_and_consume(
    stream: &UserDataStream,
    listen_key: &str,
    tx: &mpsc::UnboundedSender<VenueEvent>,
    running: &AtomicBool,
    last_heartbeat_secs: &AtomicU64,
    cached_mid: &Mutex<Option<Decimal>>,
) -> Result<(), String> {
    let (mut ws, _) = connect_async(stream.ws_url.as_str())
        .await
        .map_err(|e| e.to_string())?;

    // One connection carries both the book ticker and the user-data stream
    let subscribe = json!({
        "method": "SUBSCRIBE",
        "params": [
            format!("{}@bookTicker", stream.symbol.to_lowercase()),
            listen_key,
        ],
        "id": 1,
    });
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    info!("[{}] User-data stream connected", stream.account_name);
    last_heartbeat_secs.store(now_secs(), Ordering::Relaxed);

    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await; // immediate first tick

    let mut pinged_since_last_message = false;

    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = keepalive.tick() => {
                stream.keepalive_listen_key().await;
            }
            received = tokio::time::timeout(
                Duration::from_secs(RECV_TIMEOUT_SECS),
                ws.next(),
            ) => {
                match received {
                    Ok(Some(Ok(message))) => {
                        pinged_since_last_message = false;
                        last_heartbeat_secs.store(now_secs(), Ordering::Relaxed);
                        match message {
                            Message::Text(text) => {
                                if handle_message(stream, &text, tx, cached_mid) {
                                    // Listen key expired; reconnect with a fresh one
                                    return Ok(());
                                }
                            }
                            Message::Ping(payload) => {
                                ws.send(Message::Pong(payload))
                                    .await
                                    .map_err(|e| e.to_string())?;
                            }
                            Message::Close(_) => return Err("server closed stream".into()),
                            _ => {}
                        }
                    }
                    Ok(Some(Err(e))) => return Err(e.to_string()),
                    Ok(None) => return Err("stream ended".into()),
                    Err(_) => {
                        if pinged_since_last_message {
                            return Err("no message for two receive windows".into());
                        }
                        ws.send(Message::Ping(Vec::new()))
                            .await
                            .map_err(|e| e.to_string())?;
                        pinged_since_last_message = true;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Dispatch one stream message. Returns true when the listen key expired.
fn handle_message(
    stream: &UserDataStream,
    text: &str,
    tx: &mpsc::UnboundedSender<VenueEvent>,
    cached_mid: &Mutex<Option<Decimal>>,
) -> bool {
    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("[{}] Unparseable stream message: {}", stream.account_name, e);
            return false;
        }
    };

    match data["e"].as_str() {
        Some("bookTicker") => {
            let bid = data["b"].as_str().and_then(|s| s.parse::<Decimal>().ok());
            let ask = data["a"].as_str().and_then(|s| s.parse::<Decimal>().ok());
            if let (Some(bid), Some(ask)) = (bid, ask) {
                if bid > Decimal::ZERO && ask > Decimal::ZERO {
                    if let Ok(mut guard) = cached_mid.lock() {
                        *guard = Some((bid + ask) / Decimal::TWO);
                    }
                }
            }
        }
        Some("ORDER_TRADE_UPDATE") => {
            let payload: Result<StreamOrderUpdate, _> =
                serde_json::from_value(data["o"].clone());
            match payload {
                Ok(order) => {
                    if order.symbol.as_deref() == Some(stream.symbol.as_str()) {
                        if let Some(update) = order.normalize() {
                            let _ = tx.send(VenueEvent::OrderUpdate(update));
                        }
                    }
                }
                Err(e) => debug!(
                    "[{}] Malformed order update: {}",
                    stream.account_name, e
                ),
            }
        }
        Some("ACCOUNT_UPDATE") => {
            if let Some(update) = positions_from_account_update(&data["a"], &stream.symbol) {
                let _ = tx.send(VenueEvent::AccountUpdate(update));
            }
        }
        Some("listenKeyExpired") => {
            warn!("[{}] Listen key expired", stream.account_name);
            let _ = tx.send(VenueEvent::StreamExpired);
            return true;
        }
        _ => {}
    }

    false
}

fn positions_from_account_update(payload: &Value, symbol: &str) -> Option<PositionsUpdate> {
    let positions = payload["P"].as_array()?;
    let entry = positions.iter().find(|p| p["s"].as_str() == Some(symbol))?;
    let amount: Decimal = entry["pa"].as_str()?.parse().ok()?;

    Some(if amount >= Decimal::ZERO {
        PositionsUpdate {
            long: amount,
            short: Decimal::ZERO,
        }
    } else {
        PositionsUpdate {
            long: Decimal::ZERO,
            short: amount.abs(),
        }
    })
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_update_positions_split_by_sign() {
        let payload = json!({
            "P": [
                {"s": "XRPUSDC", "pa": "120"},
                {"s": "BTCUSDT", "pa": "-1"}
            ]
        });

        let long = positions_from_account_update(&payload, "XRPUSDC").unwrap();
        assert_eq!(long.long, "120".parse::<Decimal>().unwrap());
        assert_eq!(long.short, Decimal::ZERO);

        let short = positions_from_account_update(&payload, "BTCUSDT").unwrap();
        assert_eq!(short.long, Decimal::ZERO);
        assert_eq!(short.short, Decimal::ONE);
    }

    #[test]
    fn unknown_symbol_yields_no_update() {
        let payload = json!({"P": [{"s": "ETHUSDT", "pa": "3"}]});
        assert!(positions_from_account_update(&payload, "XRPUSDC").is_none());
    }
}
