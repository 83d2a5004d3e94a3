use std::collections::BTreeMap;

use futures_util::{stream, StreamExt};
use tracing::{info, warn};
use trunkscribe_common::{worker_identity, Offer};
use trunkscribe_marketplace::{BidRequest, MarketError, Marketplace};

use crate::config::Config;

/// Result of one provisioning pass. A rejected bid (price undercut, offer
/// already taken) is recorded and never aborts the remaining bids.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    /// (offer_id, new instance id)
    pub accepted: Vec<(i64, i64)>,
    pub rejected: Vec<(i64, MarketError)>,
}

impl ProvisionOutcome {
    /// Pull out an auth failure among the rejections, if any bid hit one.
    /// Auth failures abort the cycle, so the caller wants the error itself.
    pub fn take_auth_failure(&mut self) -> Option<MarketError> {
        let pos = self.rejected.iter().position(|(_, e)| e.is_auth())?;
        Some(self.rejected.swap_remove(pos).1)
    }
}

/// Bid the listed price times the configured multiplier, rounded to the
/// 6 decimal places the marketplace accepts.
pub fn bid_price(listed_price: f64, multiplier: f64) -> f64 {
    (listed_price * multiplier * 1e6).round() / 1e6
}

/// How many jobs this machine can run at once, from its GPU memory and the
/// model footprint. Floors at 1: an offer that passed the search filter can
/// always hold one model.
pub fn worker_concurrency(gpu_ram_mb: f64, model_ram_mb: f64) -> u32 {
    ((gpu_ram_mb / model_ram_mb).floor() as u32).max(1)
}

/// Assemble the full launch configuration for one offer: operator env block merged
/// with the computed identity and concurrency variables. Computed values win
/// over operator ones, otherwise two leases could share a consumer name.
pub fn build_bid(cfg: &Config, base_env: &BTreeMap<String, String>, offer: &Offer) -> BidRequest {
    let mut env = base_env.clone();
    // Identity is keyed on the machine id, which survives bid acceptance;
    // the contract id the marketplace assigns does not exist yet.
    env.insert(
        "CELERY_HOSTNAME".to_string(),
        worker_identity(&cfg.consumer_prefix, &cfg.build_id, offer.machine_id),
    );
    env.insert(
        "CELERY_CONCURRENCY".to_string(),
        worker_concurrency(offer.gpu_ram_mb, cfg.model_ram_mb).to_string(),
    );

    BidRequest {
        offer_id: offer.id,
        price: bid_price(offer.price_per_hour, cfg.bid_multiplier),
        image: cfg.image.clone(),
        args: vec!["worker".to_string()],
        env,
        disk_gb: cfg.disk_gb,
    }
}

/// Submit the selected bids with bounded concurrency and collect results.
pub async fn provision(
    market: &dyn Marketplace,
    bids: Vec<BidRequest>,
    concurrency: usize,
) -> ProvisionOutcome {
    let results: Vec<(i64, Result<i64, MarketError>)> = stream::iter(bids)
        .map(|bid| async move { (bid.offer_id, market.place_bid(&bid).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = ProvisionOutcome::default();
    for (offer_id, result) in results {
        match result {
            Ok(instance_id) => {
                info!("bid on offer {} accepted as instance {}", offer_id, instance_id);
                outcome.accepted.push((offer_id, instance_id));
            }
            Err(e) => {
                warn!("bid on offer {} not accepted: {}", offer_id, e);
                outcome.rejected.push((offer_id, e));
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use trunkscribe_marketplace::mock::MockMarket;

    fn test_config() -> Config {
        let mut cfg = Config::parse_from(["trunkscribe-autoscaler"]);
        cfg.build_id = "abc1234".to_string();
        cfg
    }

    #[test]
    fn bid_price_is_multiplied_and_rounded() {
        assert_eq!(bid_price(0.0666, 1.5), 0.0999);
        // 0.1 * 1.5 carries float noise without the rounding step.
        assert_eq!(bid_price(0.1, 1.5), 0.15);
        assert_eq!(bid_price(0.0333333333, 1.5), 0.05);
    }

    #[test]
    fn concurrency_scales_with_gpu_ram() {
        // 24 GB card, medium.en at ~7 GB per model instance
        assert_eq!(worker_concurrency(24576.0, 7168.0), 3);
        // Card barely above the filter floor still runs one model.
        assert_eq!(worker_concurrency(8192.0, 7168.0), 1);
        assert_eq!(worker_concurrency(4096.0, 7168.0), 1);
    }

    #[test]
    fn launch_env_merges_operator_block_with_identity() {
        let cfg = test_config();
        let mut base = BTreeMap::new();
        base.insert("CELERY_BROKER_URL".to_string(), "amqp://rabbit".to_string());
        // Operator-set identity must lose to the computed one.
        base.insert("CELERY_HOSTNAME".to_string(), "stale".to_string());

        let offer = MockMarket::offer(555, 42, 0.05);
        let bid = build_bid(&cfg, &base, &offer);

        // Keyed on machine 42, not offer 555.
        assert_eq!(
            bid.env.get("CELERY_HOSTNAME").map(String::as_str),
            Some("celery-abc1234@vast-42")
        );
        assert_eq!(
            bid.env.get("CELERY_BROKER_URL").map(String::as_str),
            Some("amqp://rabbit")
        );
        assert_eq!(bid.env.get("CELERY_CONCURRENCY").map(String::as_str), Some("3"));
        assert_eq!(bid.args, vec!["worker".to_string()]);
    }

    #[tokio::test]
    async fn rejected_bid_never_blocks_the_next_one() {
        let cfg = test_config();
        let market = MockMarket::new();
        market.add_offer(MockMarket::offer(1, 100, 0.03));
        market.add_offer(MockMarket::offer(2, 200, 0.04));
        market.reject_bid(1);

        let bids = vec![
            build_bid(&cfg, &BTreeMap::new(), &MockMarket::offer(1, 100, 0.03)),
            build_bid(&cfg, &BTreeMap::new(), &MockMarket::offer(2, 200, 0.04)),
        ];
        let mut outcome = provision(&market, bids, 2).await;

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].0, 2);
        assert_eq!(outcome.rejected.len(), 1);
        // An ordinary rejection is not an auth failure.
        assert!(outcome.take_auth_failure().is_none());
        // The accepted bid shows up as a new lease on the offer's machine.
        assert!(market.instances().iter().any(|i| i.machine_id == 200));
    }
}
