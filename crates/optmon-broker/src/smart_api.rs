//! SmartAPI REST adapter.
//!
//! Implements [`BrokerSession`] over the venue's order endpoints. Every
//! response is wrapped as `{status, message, errorcode, data}`.

use crate::error::{BrokerError, BrokerResult};
use crate::session::{BoxFuture, BrokerSession};
use crate::types::{BrokerPosition, OrderParams, OrderRecord, TradeRecord};
use optmon_core::serde_util::{flexible_bool, flexible_decimal};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://apiconnect.angelone.in";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const PLACE_ORDER: &str = "/rest/secure/angelbroking/order/v1/placeOrder";
const CANCEL_ORDER: &str = "/rest/secure/angelbroking/order/v1/cancelOrder";
const ORDER_BOOK: &str = "/rest/secure/angelbroking/order/v1/getOrderBook";
const TRADE_BOOK: &str = "/rest/secure/angelbroking/order/v1/getTradeBook";
const LTP_DATA: &str = "/rest/secure/angelbroking/order/v1/getLtpData";
const POSITIONS: &str = "/rest/secure/angelbroking/order/v1/getPosition";

/// Connection settings for one account.
#[derive(Debug, Clone)]
pub struct SmartApiConfig {
    pub base_url: String,
    pub auth_token: String,
    pub api_key: String,
    pub client_local_ip: String,
    pub client_public_ip: String,
    pub mac_address: String,
}

impl Default for SmartApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: String::new(),
            api_key: String::new(),
            client_local_ip: "127.0.0.1".to_string(),
            client_public_ip: "127.0.0.1".to_string(),
            mac_address: "00:00:00:00:00:00".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "flexible_bool")]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errorcode: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    fn into_data(self) -> BrokerResult<serde_json::Value> {
        if self.status {
            Ok(self.data)
        } else {
            Err(BrokerError::Api {
                code: self.errorcode,
                message: self.message,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaceOrderData {
    #[serde(default)]
    orderid: String,
}

#[derive(Debug, Deserialize)]
struct LtpData {
    #[serde(default, deserialize_with = "flexible_decimal")]
    ltp: Decimal,
}

#[derive(Debug, Serialize)]
struct CancelOrderRequest<'a> {
    variety: &'a str,
    orderid: &'a str,
}

#[derive(Debug, Serialize)]
struct LtpRequest<'a> {
    exchange: &'a str,
    tradingsymbol: &'a str,
    symboltoken: &'a str,
}

/// Parse a list payload; the venue sends `null` for an empty book.
fn parse_list<T: DeserializeOwned>(data: serde_json::Value) -> BrokerResult<Vec<T>> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(data).map_err(|e| BrokerError::InvalidResponse(e.to_string()))
}

/// REST client for one SmartAPI account.
pub struct SmartApiSession {
    client: Client,
    config: SmartApiConfig,
}

impl SmartApiSession {
    /// Create a new session client.
    pub fn new(config: SmartApiConfig) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn with_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.config.auth_token.trim();
        let bearer = if token.starts_with("Bearer ") {
            token.to_string()
        } else {
            format!("Bearer {token}")
        };
        builder
            .header("Authorization", bearer)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", &self.config.client_local_ip)
            .header("X-ClientPublicIP", &self.config.client_public_ip)
            .header("X-MACAddress", &self.config.mac_address)
            .header("X-PrivateKey", &self.config.api_key)
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> BrokerResult<serde_json::Value> {
        let response = self
            .with_headers(builder)
            .send()
            .await
            .map_err(|e| BrokerError::HttpClient(format!("{path}: request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::HttpClient(format!("{path}: HTTP {status}: {body}")));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(format!("{path}: {e}")))?;
        debug!(path, status = envelope.status, "Broker response");
        envelope.into_data()
    }

    async fn get(&self, path: &str) -> BrokerResult<serde_json::Value> {
        self.send(self.client.get(self.url(path)), path).await
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> BrokerResult<serde_json::Value> {
        self.send(self.client.post(self.url(path)).json(body), path)
            .await
    }
}

impl BrokerSession for SmartApiSession {
    fn place_order(&self, params: OrderParams) -> BoxFuture<'_, BrokerResult<String>> {
        Box::pin(async move {
            info!(
                symbol = %params.trading_symbol,
                side = %params.transaction_type,
                order_type = %params.order_type,
                quantity = %params.quantity,
                "Placing order"
            );
            let data = self.post(PLACE_ORDER, &params).await?;
            let placed: PlaceOrderData = serde_json::from_value(data)
                .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
            if placed.orderid.is_empty() {
                return Err(BrokerError::InvalidResponse(
                    "placeOrder returned no order id".to_string(),
                ));
            }
            Ok(placed.orderid)
        })
    }

    fn cancel_order<'a>(
        &'a self,
        variety: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            self.post(
                CANCEL_ORDER,
                &CancelOrderRequest {
                    variety,
                    orderid: order_id,
                },
            )
            .await
            .map(|_| ())
        })
    }

    fn order_book(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderRecord>>> {
        Box::pin(async move { parse_list(self.get(ORDER_BOOK).await?) })
    }

    fn trade_book(&self) -> BoxFuture<'_, BrokerResult<Vec<TradeRecord>>> {
        Box::pin(async move { parse_list(self.get(TRADE_BOOK).await?) })
    }

    fn ltp_data<'a>(
        &'a self,
        exchange: &'a str,
        symbol: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, BrokerResult<Decimal>> {
        Box::pin(async move {
            let data = self
                .post(
                    LTP_DATA,
                    &LtpRequest {
                        exchange,
                        tradingsymbol: symbol,
                        symboltoken: token,
                    },
                )
                .await?;
            let quote: LtpData = serde_json::from_value(data)
                .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
            if quote.ltp <= Decimal::ZERO {
                warn!(%exchange, %symbol, "Broker returned non-positive LTP");
                return Err(BrokerError::NoQuote(format!("{exchange}:{symbol}")));
            }
            Ok(quote.ltp)
        })
    }

    fn positions(&self) -> BoxFuture<'_, BrokerResult<Option<Vec<BrokerPosition>>>> {
        Box::pin(async move { parse_list(self.get(POSITIONS).await?).map(Some) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_envelope_success_and_failure() {
        let ok: Envelope =
            serde_json::from_str(r#"{"status":true,"message":"SUCCESS","data":{"orderid":"1"}}"#)
                .unwrap();
        assert_eq!(ok.into_data().unwrap()["orderid"], "1");

        let err: Envelope = serde_json::from_str(
            r#"{"status":false,"message":"Invalid Token","errorcode":"AG8001","data":null}"#,
        )
        .unwrap();
        match err.into_data() {
            Err(BrokerError::Api { code, message }) => {
                assert_eq!(code, "AG8001");
                assert_eq!(message, "Invalid Token");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_list_null_is_empty() {
        let rows: Vec<OrderRecord> = parse_list(serde_json::Value::Null).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_ltp_payload() {
        let data: LtpData =
            serde_json::from_value(serde_json::json!({"exchange":"NFO","ltp":"104.35"})).unwrap();
        assert_eq!(data.ltp, dec!(104.35));
    }

    #[test]
    fn test_url_join() {
        let session = SmartApiSession::new(SmartApiConfig {
            base_url: "https://example.invalid/".to_string(),
            ..SmartApiConfig::default()
        })
        .unwrap();
        assert_eq!(
            session.url(ORDER_BOOK),
            "https://example.invalid/rest/secure/angelbroking/order/v1/getOrderBook"
        );
    }
}
