use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use trunkscribe_common::{Instance, Offer};

/// Error taxonomy for marketplace calls. Callers branch on the kind:
/// a `Transient` failure skips one cycle step, a `Rejected` bid skips that
/// offer only, an `AuthFailure` aborts the whole cycle.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("transient marketplace error: {0}")]
    Transient(String),

    #[error("marketplace rejected request: status={status} body={body}")]
    Rejected { status: u16, body: String },

    #[error("marketplace authentication failed (http {0})")]
    AuthFailure(u16),
}

impl MarketError {
    pub fn is_auth(&self) -> bool {
        matches!(self, MarketError::AuthFailure(_))
    }
}

/// Filter expression for the offers search. Rendered into the marketplace's
/// `key<op>value` query language, space-separated.
#[derive(Debug, Clone)]
pub struct OfferQuery {
    pub reliability_min: f64,
    pub gpu_count_min: u32,
    /// GB, as the search API takes it (raw offers report MB).
    pub gpu_ram_min_gb: f64,
    pub perf_per_dollar_min: f64,
    pub price_max: f64,
    pub cuda_min: f64,
    pub inet_up_min: f64,
    pub inet_down_min: f64,
}

impl Default for OfferQuery {
    fn default() -> Self {
        // Thresholds tuned for single-GPU speech-to-text workers.
        Self {
            reliability_min: 0.98,
            gpu_count_min: 1,
            gpu_ram_min_gb: 8.0,
            perf_per_dollar_min: 200.0,
            price_max: 0.1,
            cuda_min: 11.7,
            inet_up_min: 90.0,
            inet_down_min: 90.0,
        }
    }
}

impl fmt::Display for OfferQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // rentable/rented are not configurable: bidding on rented or
        // unlisted machines is never meaningful.
        write!(
            f,
            "rentable=true rented=false reliability>{} num_gpus>={} gpu_ram>={} \
             dlperf_usd>{} dph<={} cuda_vers>={} inet_up>={} inet_down>={}",
            self.reliability_min,
            self.gpu_count_min,
            self.gpu_ram_min_gb,
            self.perf_per_dollar_min,
            self.price_max,
            self.cuda_min,
            self.inet_up_min,
            self.inet_down_min,
        )
    }
}

/// Write-once bid submission: one selected offer, one computed price, the
/// full container launch configuration. A failed bid is never silently retried at a
/// different price; the next cycle starts over from a fresh offer list.
#[derive(Debug, Clone)]
pub struct BidRequest {
    pub offer_id: i64,
    pub price: f64,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub disk_gb: f64,
}

#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>, MarketError>;
    async fn list_instances(&self) -> Result<Vec<Instance>, MarketError>;
    async fn destroy_instance(&self, instance_id: i64) -> Result<(), MarketError>;
    /// Submit a bid; on acceptance returns the new instance id.
    async fn place_bid(&self, bid: &BidRequest) -> Result<i64, MarketError>;
}

pub mod mock;
pub mod vast;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_renders_marketplace_filter_language() {
        let q = OfferQuery::default();
        let rendered = q.to_string();
        assert!(rendered.starts_with("rentable=true rented=false"));
        assert!(rendered.contains("reliability>0.98"));
        assert!(rendered.contains("dph<=0.1"));
        assert!(rendered.contains("cuda_vers>=11.7"));
    }

    #[test]
    fn auth_failure_is_distinguishable() {
        let err = MarketError::AuthFailure(401);
        assert!(err.is_auth());
        assert!(!MarketError::Transient("timeout".into()).is_auth());
    }
}
