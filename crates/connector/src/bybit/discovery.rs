//! Option instrument discovery via the Bybit v5 REST API
//!
//! Pages through `GET /v5/market/instruments-info?category=option&baseCoin=X`
//! for each configured base coin and keeps instruments in `Trading` status.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use optfeed_schema::normalize_symbol;

use crate::backoff::retry_delay;
use crate::error::DiscoveryError;
use crate::traits::SymbolDirectory;

/// Max page size accepted by instruments-info
const PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<InstrumentsResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<InstrumentInfo>,
    #[serde(default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentInfo {
    symbol: String,
    #[serde(default)]
    status: String,
}

pub struct BybitSymbolDirectory {
    client: reqwest::Client,
    base_url: String,
    assets: Vec<String>,
    max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl BybitSymbolDirectory {
    pub fn new(base_url: impl Into<String>, assets: Vec<String>) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            assets,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_base_delay = base_delay;
        self.retry_max_delay = max_delay;
        self
    }

    /// One full pass over every base coin
    pub async fn discover_once(&self) -> Result<BTreeSet<String>, DiscoveryError> {
        let mut symbols = BTreeSet::new();
        for coin in &self.assets {
            let found = self.fetch_coin(coin).await?;
            if found.is_empty() {
                warn!(coin = %coin, "No trading option instruments for base coin");
            }
            debug!(coin = %coin, count = found.len(), "Discovered instruments");
            symbols.extend(found);
        }
        Ok(symbols)
    }

    async fn fetch_coin(&self, coin: &str) -> Result<Vec<String>, DiscoveryError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let url = format!("{}/v5/market/instruments-info", self.base_url);
            let limit = PAGE_LIMIT.to_string();
            let mut query: Vec<(&str, &str)> = vec![
                ("category", "option"),
                ("baseCoin", coin),
                ("limit", limit.as_str()),
            ];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }

            let response = self.client.get(&url).query(&query).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(DiscoveryError::Status {
                    coin: coin.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response.text().await?;
            let parsed: InstrumentsResponse = serde_json::from_str(&body).map_err(|e| {
                DiscoveryError::Json(format!("{}: {}", e, body_excerpt(&body)))
            })?;
            if parsed.ret_code != 0 {
                return Err(DiscoveryError::Venue {
                    coin: coin.to_string(),
                    code: parsed.ret_code,
                    message: parsed.ret_msg,
                });
            }

            let result = match parsed.result {
                Some(r) => r,
                None => break,
            };
            out.extend(
                result
                    .list
                    .into_iter()
                    .filter(|i| i.status == "Trading")
                    .map(|i| normalize_symbol(&i.symbol)),
            );

            match result.next_page_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(out)
    }
}

/// First 200 characters of a response body, for error messages
fn body_excerpt(body: &str) -> String {
    body.chars().take(200).collect()
}

#[async_trait]
impl SymbolDirectory for BybitSymbolDirectory {
    async fn discover(&self) -> Result<BTreeSet<String>, DiscoveryError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.discover_once().await {
                Ok(symbols) => {
                    info!(total = symbols.len(), attempt, "Symbol discovery complete");
                    return Ok(symbols);
                }
                Err(e) => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %e, "Symbol discovery attempt failed");
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        let delay = retry_delay(self.retry_base_delay, self.retry_max_delay, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(DiscoveryError::Exhausted {
            attempts: self.max_attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instruments(list: &[(&str, &str)], cursor: &str) -> serde_json::Value {
        let list: Vec<_> = list
            .iter()
            .map(|(symbol, status)| {
                serde_json::json!({
                    "symbol": symbol,
                    "status": status,
                    "baseCoin": "BTC",
                    "quoteCoin": "USD",
                    "optionsType": "Call",
                    "launchTime": "1700000000000",
                    "deliveryTime": "1703664000000"
                })
            })
            .collect();
        serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {"category": "option", "nextPageCursor": cursor, "list": list},
            "time": 1700000000000u64
        })
    }

    fn directory(server: &MockServer, assets: &[&str]) -> BybitSymbolDirectory {
        BybitSymbolDirectory::new(server.uri(), assets.iter().map(|s| s.to_string()).collect())
            .unwrap()
            .with_retry(2, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_discover_pages_and_filters() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .and(query_param("baseCoin", "BTC"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instruments(
                &[("BTC-27DEC24-90000-P", "Trading")],
                "",
            )))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .and(query_param("baseCoin", "BTC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instruments(
                &[
                    ("btc-27dec24-100000-c", "Trading"),
                    ("BTC-20DEC24-80000-C", "Delivering"),
                    ("BTC-27DEC24-100000-C", "Trading"),
                ],
                "page2",
            )))
            .with_priority(2)
            .mount(&server)
            .await;

        let symbols = directory(&server, &["BTC"]).discover().await.unwrap();
        let symbols: Vec<_> = symbols.into_iter().collect();
        assert_eq!(symbols, vec!["BTC-27DEC24-100000-C", "BTC-27DEC24-90000-P"]);
    }

    #[tokio::test]
    async fn test_empty_coin_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instruments(&[], "")))
            .mount(&server)
            .await;

        let symbols = directory(&server, &["SOL"]).discover().await.unwrap();
        assert!(symbols.is_empty());
    }

    #[tokio::test]
    async fn test_venue_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "retCode": 10001,
                "retMsg": "params error",
                "result": {},
            })))
            .expect(2)
            .mount(&server)
            .await;

        let err = directory(&server, &["BTC"]).discover().await.unwrap_err();
        match err {
            DiscoveryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("10001"));
            }
            e => panic!("expected Exhausted, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = directory(&server, &["ETH"]);
        let err = dir.discover_once().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_non_json_body_with_multibyte_text() {
        let server = MockServer::start().await;
        let body = format!("{}错误信息", "x".repeat(199));
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let dir = directory(&server, &["BTC"]);
        match dir.discover_once().await.unwrap_err() {
            DiscoveryError::Json(msg) => {
                assert!(msg.ends_with(&format!("{}错", "x".repeat(199))));
            }
            e => panic!("expected Json, got: {:?}", e),
        }
        assert!(matches!(
            dir.discover().await.unwrap_err(),
            DiscoveryError::Exhausted { attempts: 2, .. }
        ));
    }
}
