use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use trunkscribe_common::{Instance, Offer};

use crate::{BidRequest, MarketError, Marketplace, OfferQuery};

/// HTTP client for the vast.ai console API.
///
/// Every call carries a bounded timeout and is retried once on transient
/// failure (connect/timeout/5xx). 4xx responses are never retried: they mean
/// the request itself is wrong (stale offer, undercut bid, bad credentials)
/// and a second attempt would only repeat the mistake.
pub struct VastMarket {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

#[derive(Deserialize)]
struct InstancesResponse {
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
struct BidResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    new_contract: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

impl VastMarket {
    pub fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        // Default reqwest client has no overall timeout. If the marketplace
        // stalls, a cycle step would hang past the next tick.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, MarketError> {
        let resp = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| MarketError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MarketError::AuthFailure(status.as_u16()))
            }
            s if s.is_client_error() => Err(MarketError::Rejected {
                status: s.as_u16(),
                body,
            }),
            s => Err(MarketError::Transient(format!(
                "status={} body={}",
                s.as_u16(),
                body
            ))),
        }
    }

    /// One retry on `Transient` only.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, MarketError> {
        let retry = req.try_clone();
        match self.execute(req).await {
            Err(MarketError::Transient(first)) => {
                let Some(retry) = retry else {
                    return Err(MarketError::Transient(first));
                };
                self.execute(retry).await.map_err(|e| match e {
                    MarketError::Transient(second) => {
                        MarketError::Transient(format!("{} (after retry: {})", first, second))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }
}

#[async_trait]
impl Marketplace for VastMarket {
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, MarketError> {
        let req = self
            .client
            .get(self.url("/offers"))
            .query(&[("query", query.to_string())]);
        let resp = self.send(req).await?;
        let parsed: OffersResponse = resp
            .json()
            .await
            .map_err(|e| MarketError::Transient(format!("offers decode: {}", e)))?;
        Ok(parsed.offers)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, MarketError> {
        let req = self.client.get(self.url("/instances"));
        let resp = self.send(req).await?;
        let parsed: InstancesResponse = resp
            .json()
            .await
            .map_err(|e| MarketError::Transient(format!("instances decode: {}", e)))?;
        Ok(parsed.instances)
    }

    async fn destroy_instance(&self, instance_id: i64) -> Result<(), MarketError> {
        let req = self
            .client
            .delete(self.url(&format!("/instances/{}", instance_id)));
        self.send(req).await?;
        Ok(())
    }

    async fn place_bid(&self, bid: &BidRequest) -> Result<i64, MarketError> {
        // env must serialize with stable ordering so identical bids produce
        // identical payloads; BidRequest carries a BTreeMap for that reason.
        let env: &BTreeMap<String, String> = &bid.env;
        let body = json!({
            "client_id": "me",
            "image": bid.image,
            "args": bid.args,
            "env": env,
            "price": bid.price,
            "disk": bid.disk_gb,
            "runtype": "args",
        });

        let req = self
            .client
            .put(self.url(&format!("/asks/{}", bid.offer_id)))
            .json(&body);
        let resp = self.send(req).await?;

        let parsed: BidResponse = resp
            .json()
            .await
            .map_err(|e| MarketError::Transient(format!("bid decode: {}", e)))?;

        if !parsed.success {
            // HTTP 200 with success=false means the ask was taken or undercut.
            return Err(MarketError::Rejected {
                status: 200,
                body: parsed.msg.unwrap_or_else(|| "bid not accepted".to_string()),
            });
        }
        parsed.new_contract.ok_or_else(|| {
            MarketError::Transient("bid accepted but no contract id in response".to_string())
        })
    }
}
