use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use trunkscribe_common::{Instance, Offer};

use crate::{BidRequest, MarketError, Marketplace, OfferQuery};

/// In-memory marketplace for tests: scriptable offers/instances, records
/// every bid and destroy, and can inject per-id failures so partial-failure
/// paths are exercisable without a network.
#[derive(Default)]
pub struct MockMarket {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    offers: Vec<Offer>,
    instances: Vec<Instance>,
    bids: Vec<BidRequest>,
    destroyed: Vec<i64>,
    fail_destroy: HashSet<i64>,
    reject_bid: HashSet<i64>,
    fail_search: bool,
    auth_broken: bool,
    next_contract: i64,
}

impl MockMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_offer(&self, offer: Offer) {
        self.state.lock().unwrap().offers.push(offer);
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    /// Make `destroy_instance(id)` fail with a transient error.
    pub fn fail_destroy(&self, instance_id: i64) {
        self.state.lock().unwrap().fail_destroy.insert(instance_id);
    }

    /// Make a bid on `offer_id` come back rejected (undercut/taken).
    pub fn reject_bid(&self, offer_id: i64) {
        self.state.lock().unwrap().reject_bid.insert(offer_id);
    }

    pub fn fail_next_search(&self) {
        self.state.lock().unwrap().fail_search = true;
    }

    pub fn break_auth(&self) {
        self.state.lock().unwrap().auth_broken = true;
    }

    pub fn destroyed(&self) -> Vec<i64> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn bids(&self) -> Vec<BidRequest> {
        self.state.lock().unwrap().bids.clone()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().unwrap().instances.clone()
    }

    /// Plain test offer; gpu_ram defaults to 24 GB.
    pub fn offer(id: i64, machine_id: i64, price_per_hour: f64) -> Offer {
        Offer {
            id,
            machine_id,
            price_per_hour,
            reliability: 0.99,
            gpu_count: 1,
            gpu_ram_mb: 24576.0,
            perf_per_dollar: 250.0,
            cuda_version: 12.0,
        }
    }

    pub fn instance(id: i64, machine_id: i64, actual_status: &str) -> Instance {
        Instance {
            id,
            machine_id,
            actual_status: Some(actual_status.to_string()),
            start_date: Some(1_700_000_000.0),
        }
    }
}

#[async_trait]
impl Marketplace for MockMarket {
    async fn search_offers(&self, _query: &OfferQuery) -> Result<Vec<Offer>, MarketError> {
        let mut state = self.state.lock().unwrap();
        if state.auth_broken {
            return Err(MarketError::AuthFailure(401));
        }
        if state.fail_search {
            state.fail_search = false;
            return Err(MarketError::Transient("search timed out".to_string()));
        }
        Ok(state.offers.clone())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, MarketError> {
        let state = self.state.lock().unwrap();
        if state.auth_broken {
            return Err(MarketError::AuthFailure(401));
        }
        Ok(state.instances.clone())
    }

    async fn destroy_instance(&self, instance_id: i64) -> Result<(), MarketError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_destroy.contains(&instance_id) {
            return Err(MarketError::Transient(format!(
                "destroy {} timed out",
                instance_id
            )));
        }
        state.instances.retain(|i| i.id != instance_id);
        state.destroyed.push(instance_id);
        Ok(())
    }

    async fn place_bid(&self, bid: &BidRequest) -> Result<i64, MarketError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_bid.contains(&bid.offer_id) {
            return Err(MarketError::Rejected {
                status: 200,
                body: "bid price too low".to_string(),
            });
        }
        // Bidding on an offer the mock never advertised models a stale offer.
        let Some(offer) = state.offers.iter().find(|o| o.id == bid.offer_id).cloned() else {
            return Err(MarketError::Rejected {
                status: 404,
                body: format!("no such ask {}", bid.offer_id),
            });
        };

        state.next_contract += 1;
        let contract_id = 10_000 + state.next_contract;
        state.bids.push(bid.clone());
        state.instances.push(Instance {
            id: contract_id,
            machine_id: offer.machine_id,
            actual_status: None,
            start_date: None,
        });
        Ok(contract_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bid_for(offer_id: i64) -> BidRequest {
        BidRequest {
            offer_id,
            price: 0.12,
            image: "test-image".to_string(),
            args: vec!["worker".to_string()],
            env: BTreeMap::new(),
            disk_gb: 0.5,
        }
    }

    #[tokio::test]
    async fn accepted_bid_creates_instance_on_offer_machine() {
        let market = MockMarket::new();
        market.add_offer(MockMarket::offer(1, 900, 0.05));

        let contract = market.place_bid(&bid_for(1)).await.unwrap();
        let instances = market.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, contract);
        assert_eq!(instances[0].machine_id, 900);
    }

    #[tokio::test]
    async fn stale_offer_is_rejected() {
        let market = MockMarket::new();
        let err = market.place_bid(&bid_for(99)).await.unwrap_err();
        assert!(matches!(err, MarketError::Rejected { status: 404, .. }));
    }
}
