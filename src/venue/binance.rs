//! Live Binance USDⓈ-M futures adapter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::{info, warn};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::order::{OrderStatus, OrderUpdate};
use crate::grid::types::{
    Balance, OrderCandidate, OrderType, PlacedOrder, PositionAction, TradeType, TradingRules,
};

use super::stream::{StreamHandle, UserDataStream};
use super::{Venue, VenueEvent};

const REST_URL: &str = "https://fapi.binance.com";
const WS_URL: &str = "wss://fstream.binance.com/ws";
const RECV_WINDOW_MS: u64 = 5000;

/// API credentials for one account
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Binance futures session for a single account and trading pair.
///
/// One executor owns one session exclusively; the two accounts of the hedge
/// pair never share a session.
pub struct BinanceVenue {
    http: reqwest::Client,
    base_url: String,
    credentials: VenueCredentials,
    trading_pair: String,
    /// Venue-native symbol, e.g. "XRPUSDC" for "XRP/USDC:USDC"
    symbol: String,
    quote_asset: String,
    account_name: String,
    rules: TradingRules,
    stream: Arc<Mutex<Option<StreamHandle>>>,
}

impl BinanceVenue {
    /// Establish a session: build the HTTP client, discover trading rules,
    /// and verify the pair exists on the venue.
    pub async fn connect(
        credentials: VenueCredentials,
        trading_pair: &str,
        account_name: &str,
    ) -> GridResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GridError::Venue(e.to_string()))?;

        let symbol = symbol_for(trading_pair);
        let quote_asset = quote_asset_for(trading_pair);

        let venue = Self {
            http,
            base_url: REST_URL.to_string(),
            credentials,
            trading_pair: trading_pair.to_string(),
            symbol,
            quote_asset,
            account_name: account_name.to_string(),
            rules: TradingRules {
                trading_pair: trading_pair.to_string(),
                min_price_increment: Decimal::ZERO,
                min_base_amount_increment: Decimal::ZERO,
                min_notional: Decimal::ZERO,
                min_order_size: Decimal::ZERO,
            },
            stream: Arc::new(Mutex::new(None)),
        };

        let rules = venue.fetch_trading_rules().await?;
        info!(
            "[{}] Session established for {}: {:?}",
            venue.account_name, venue.trading_pair, rules
        );

        Ok(Self { rules, ..venue })
    }

    async fn fetch_trading_rules(&self) -> GridResult<TradingRules> {
        let response = self
            .public_request("/fapi/v1/exchangeInfo", &[])
            .await?;

        let symbols = response["symbols"]
            .as_array()
            .ok_or_else(|| GridError::Venue("malformed exchangeInfo response".into()))?;

        let entry = symbols
            .iter()
            .find(|s| s["symbol"].as_str() == Some(self.symbol.as_str()))
            .ok_or_else(|| {
                GridError::VenueFatal(format!("symbol {} not listed on venue", self.symbol))
            })?;

        let mut min_price_increment = None;
        let mut min_base_amount_increment = None;
        let mut min_order_size = None;
        let mut min_notional = None;

        for filter in entry["filters"].as_array().into_iter().flatten() {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    min_price_increment = decimal_field(filter, "tickSize");
                }
                Some("LOT_SIZE") => {
                    min_base_amount_increment = decimal_field(filter, "stepSize");
                    min_order_size = decimal_field(filter, "minQty");
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = decimal_field(filter, "notional");
                }
                _ => {}
            }
        }

        match (
            min_price_increment,
            min_base_amount_increment,
            min_order_size,
            min_notional,
        ) {
            (Some(price), Some(amount), Some(size), Some(notional)) => Ok(TradingRules {
                trading_pair: self.trading_pair.clone(),
                min_price_increment: price,
                min_base_amount_increment: amount,
                min_notional: notional,
                min_order_size: size,
            }),
            _ => Err(GridError::VenueFatal(format!(
                "incomplete trading rules for {}",
                self.symbol
            ))),
        }
    }

    fn sign(&self, query: &str) -> GridResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| GridError::VenueFatal(format!("invalid API secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_request(&self, path: &str, params: &[(&str, String)]) -> GridResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| GridError::Venue(e.to_string()))?;

        Self::parse_response(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> GridResult<Value> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!("recvWindow={RECV_WINDOW_MS}"));
        query.push(format!("timestamp={timestamp}"));
        let query = query.join("&");

        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await
            .map_err(|e| GridError::Venue(e.to_string()))?;

        Self::parse_response(response).await
    }

    /// Map venue HTTP answers onto the transient/fatal error split.
    async fn parse_response(response: reqwest::Response) -> GridResult<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GridError::Venue(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(GridError::from);
        }

        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["msg"].as_str().map(str::to_string))
            .unwrap_or(body);

        if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(GridError::VenueFatal(format!("authentication failed: {detail}")))
        } else {
            // 5xx, 429 and the rest are worth retrying on a later tick
            Err(GridError::Venue(format!("HTTP {status}: {detail}")))
        }
    }

    fn order_update_from_rest(&self, order: &Value) -> Option<OrderUpdate> {
        let status = OrderStatus::parse(order["status"].as_str()?)?;
        Some(OrderUpdate {
            order_id: order["orderId"].as_u64().map(|id| id.to_string()),
            client_order_id: order["clientOrderId"].as_str().map(str::to_string),
            status,
            executed_amount_base: decimal_field(order, "executedQty").unwrap_or_default(),
            executed_amount_quote: decimal_field(order, "cumQuote").unwrap_or_default(),
            fee_quote: None,
        })
    }

    /// Hedge-mode position side from (order side, position action).
    fn position_side(side: TradeType, action: PositionAction) -> &'static str {
        match (side, action) {
            (TradeType::Buy, PositionAction::Open) => "LONG",
            (TradeType::Buy, PositionAction::Close) => "SHORT",
            (TradeType::Sell, PositionAction::Open) => "SHORT",
            (TradeType::Sell, PositionAction::Close) => "LONG",
        }
    }
}

#[async_trait]
impl Venue for BinanceVenue {
    fn trading_rules(&self) -> TradingRules {
        self.rules.clone()
    }

    async fn mid_price(&self) -> GridResult<Decimal> {
        // Prefer the stream's book-ticker cache when it is fresh
        if let Some(handle) = self.stream.lock().await.as_ref() {
            if handle.is_healthy() {
                if let Some(mid) = handle.cached_mid() {
                    return Ok(mid);
                }
            }
        }

        let ticker = self
            .public_request(
                "/fapi/v1/ticker/bookTicker",
                &[("symbol", self.symbol.clone())],
            )
            .await?;

        let bid = decimal_field(&ticker, "bidPrice");
        let ask = decimal_field(&ticker, "askPrice");
        if let (Some(bid), Some(ask)) = (bid, ask) {
            if bid > Decimal::ZERO && ask > Decimal::ZERO {
                return Ok((bid + ask) / Decimal::TWO);
            }
        }

        // Top of book unavailable; fall back to the last traded price
        let last = self
            .public_request("/fapi/v1/ticker/price", &[("symbol", self.symbol.clone())])
            .await?;
        decimal_field(&last, "price")
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| GridError::Venue("no usable price data".into()))
    }

    async fn positions(&self) -> GridResult<(Decimal, Decimal)> {
        let response = self
            .signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", self.symbol.clone())],
            )
            .await?;

        let mut long = Decimal::ZERO;
        let mut short = Decimal::ZERO;

        for position in response.as_array().into_iter().flatten() {
            let amount = decimal_field(position, "positionAmt").unwrap_or_default();
            match position["positionSide"].as_str() {
                Some("LONG") => long = amount,
                Some("SHORT") => short = amount.abs(),
                _ => {}
            }
        }

        Ok((long, short))
    }

    async fn open_orders(&self) -> GridResult<Vec<OrderUpdate>> {
        let response = self
            .signed_request(
                Method::GET,
                "/fapi/v1/openOrders",
                &[("symbol", self.symbol.clone())],
            )
            .await?;

        Ok(response
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|o| self.order_update_from_rest(o))
            .collect())
    }

    async fn order_status(&self, order_id: &str) -> GridResult<Option<OrderUpdate>> {
        let result = self
            .signed_request(
                Method::GET,
                "/fapi/v1/order",
                &[
                    ("symbol", self.symbol.clone()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(order) => Ok(self.order_update_from_rest(&order)),
            // An unknown order is not a tick failure; the caller decides
            Err(GridError::Venue(msg)) if msg.contains("Order does not exist") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn order_status_bulk(
        &self,
        order_ids: &[String],
    ) -> GridResult<HashMap<String, OrderUpdate>> {
        let mut statuses = HashMap::with_capacity(order_ids.len());
        for order_id in order_ids {
            match self.order_status(order_id).await {
                Ok(Some(update)) => {
                    statuses.insert(order_id.clone(), update);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "[{}] Status lookup failed for order {}: {}",
                    self.account_name, order_id, e
                ),
            }
        }
        Ok(statuses)
    }

    async fn place_order(&self, candidate: &OrderCandidate) -> GridResult<PlacedOrder> {
        let mut amount = self.rules.quantize_amount(candidate.amount);
        if amount < self.rules.min_order_size {
            amount = self.rules.min_order_size;
        }

        let price = candidate.price.map(|p| self.rules.quantize_price(p));

        // The notional gate is contractual; a rejected order costs a tick
        let reference_price = match price {
            Some(p) => p,
            None => self.mid_price().await?,
        };
        if amount * reference_price < self.rules.min_notional {
            return Err(GridError::Venue(format!(
                "order notional {} below venue minimum {}",
                amount * reference_price,
                self.rules.min_notional
            )));
        }

        let client_order_id =
            format!("DualGridBot_{}", &Uuid::new_v4().simple().to_string()[..8]);

        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", candidate.side.as_str().to_string()),
            (
                "positionSide",
                Self::position_side(candidate.side, candidate.position_action).to_string(),
            ),
            ("type", candidate.order_type.as_str().to_string()),
            ("quantity", amount.normalize().to_string()),
            ("newClientOrderId", client_order_id.clone()),
        ];

        if candidate.order_type == OrderType::Limit {
            let price = price
                .ok_or_else(|| GridError::Venue("limit order without price".into()))?;
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        if candidate.position_action == PositionAction::Close {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;

        let order_id = response["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .ok_or_else(|| GridError::Venue("placement response without orderId".into()))?;

        info!(
            "[{}] Placed {} {} {} @ {:?} (order {}, client {})",
            self.account_name,
            candidate.side.as_str(),
            amount,
            self.symbol,
            price,
            order_id,
            client_order_id
        );

        Ok(PlacedOrder {
            order_id,
            client_order_id,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> GridResult<bool> {
        let result = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                &[
                    ("symbol", self.symbol.clone()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                info!("[{}] Cancelled order {}", self.account_name, order_id);
                Ok(true)
            }
            // Already terminal venue-side; the next refresh will observe it
            Err(GridError::Venue(msg)) if msg.contains("Unknown order") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self) -> GridResult<bool> {
        self.signed_request(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &[("symbol", self.symbol.clone())],
        )
        .await?;

        info!("[{}] Cancelled all open orders", self.account_name);
        Ok(true)
    }

    async fn close_all_positions(&self) -> GridResult<bool> {
        let (long, short) = self.positions().await?;
        let mut success = true;

        if long > Decimal::ZERO {
            let candidate = OrderCandidate {
                trading_pair: self.trading_pair.clone(),
                order_type: OrderType::Market,
                side: TradeType::Sell,
                amount: long,
                price: None,
                position_action: PositionAction::Close,
            };
            if let Err(e) = self.place_order(&candidate).await {
                warn!("[{}] Failed to close long position: {}", self.account_name, e);
                success = false;
            }
        }

        if short > Decimal::ZERO {
            let candidate = OrderCandidate {
                trading_pair: self.trading_pair.clone(),
                order_type: OrderType::Market,
                side: TradeType::Buy,
                amount: short,
                price: None,
                position_action: PositionAction::Close,
            };
            if let Err(e) = self.place_order(&candidate).await {
                warn!("[{}] Failed to close short position: {}", self.account_name, e);
                success = false;
            }
        }

        info!(
            "[{}] Position close pass: long={}, short={}, success={}",
            self.account_name, long, short, success
        );
        Ok(success)
    }

    async fn balance(&self) -> GridResult<Balance> {
        let response = self
            .signed_request(Method::GET, "/fapi/v2/balance", &[])
            .await?;

        for entry in response.as_array().into_iter().flatten() {
            if entry["asset"].as_str() == Some(self.quote_asset.as_str()) {
                let total = decimal_field(entry, "balance").unwrap_or_default();
                let free = decimal_field(entry, "availableBalance").unwrap_or_default();
                return Ok(Balance {
                    free,
                    used: total - free,
                    total,
                });
            }
        }

        Ok(Balance::default())
    }

    async fn check_connection(&self) -> bool {
        self.public_request("/fapi/v1/ping", &[]).await.is_ok()
    }

    fn stream_healthy(&self) -> bool {
        self.stream
            .try_lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(StreamHandle::is_healthy))
            .unwrap_or(false)
    }

    async fn subscribe_events(&self) -> GridResult<mpsc::UnboundedReceiver<VenueEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let stream = UserDataStream::new(
            self.http.clone(),
            self.base_url.clone(),
            WS_URL.to_string(),
            self.credentials.api_key.clone(),
            self.symbol.clone(),
            self.account_name.clone(),
        );
        let handle = stream.spawn(tx);

        let mut guard = self.stream.lock().await;
        if let Some(old) = guard.replace(handle) {
            old.shutdown();
        }

        Ok(rx)
    }
}

/// "XRP/USDC:USDC" -> "XRPUSDC"
fn symbol_for(trading_pair: &str) -> String {
    trading_pair
        .split(':')
        .next()
        .unwrap_or(trading_pair)
        .replace('/', "")
}

/// "XRP/USDC:USDC" -> "USDC"
fn quote_asset_for(trading_pair: &str) -> String {
    trading_pair
        .split(':')
        .next()
        .unwrap_or(trading_pair)
        .split('/')
        .nth(1)
        .unwrap_or("USDT")
        .to_string()
}

/// Read a decimal that the venue serializes as a JSON string or number.
fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match &value[key] {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_mapping() {
        assert_eq!(symbol_for("XRP/USDC:USDC"), "XRPUSDC");
        assert_eq!(symbol_for("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(quote_asset_for("XRP/USDC:USDC"), "USDC");
    }

    #[test]
    fn position_side_mapping() {
        assert_eq!(
            BinanceVenue::position_side(TradeType::Buy, PositionAction::Open),
            "LONG"
        );
        assert_eq!(
            BinanceVenue::position_side(TradeType::Buy, PositionAction::Close),
            "SHORT"
        );
        assert_eq!(
            BinanceVenue::position_side(TradeType::Sell, PositionAction::Open),
            "SHORT"
        );
        assert_eq!(
            BinanceVenue::position_side(TradeType::Sell, PositionAction::Close),
            "LONG"
        );
    }

    #[test]
    fn decimal_fields_from_either_json_shape() {
        let value: Value = serde_json::json!({"a": "0.264", "b": 0.264, "c": null});
        assert_eq!(decimal_field(&value, "a"), Some(dec!(0.264)));
        assert_eq!(decimal_field(&value, "b"), Some(dec!(0.264)));
        assert_eq!(decimal_field(&value, "c"), None);
    }
}
