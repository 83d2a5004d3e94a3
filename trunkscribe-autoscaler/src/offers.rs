use std::collections::HashSet;

use trunkscribe_common::Offer;

/// Rank eligible offers and take at most `needed`, cheapest first.
///
/// Offers on machines we already lease are dropped: the marketplace happily
/// sells two leases on one host, and the second one would just evict or
/// starve our own worker. Returning fewer than `needed` offers is normal
/// market tightness, handled by the caller, retried next cycle.
pub fn select_offers(
    mut offers: Vec<Offer>,
    owned_machines: &HashSet<i64>,
    needed: usize,
) -> Vec<Offer> {
    if needed == 0 {
        return Vec::new();
    }
    offers.retain(|o| !owned_machines.contains(&o.machine_id));
    offers.sort_by(|a, b| a.price_per_hour.total_cmp(&b.price_per_hour));
    offers.truncate(needed);
    offers
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkscribe_marketplace::mock::MockMarket;

    fn owned(ids: &[i64]) -> HashSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn never_returns_offers_on_owned_machines() {
        let offers = vec![
            MockMarket::offer(1, 100, 0.03),
            MockMarket::offer(2, 200, 0.04),
            MockMarket::offer(3, 300, 0.05),
        ];
        let selected = select_offers(offers, &owned(&[100, 300]), 3);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].machine_id, 200);
    }

    #[test]
    fn cheapest_first_and_bounded_by_needed() {
        let offers = vec![
            MockMarket::offer(1, 100, 0.09),
            MockMarket::offer(2, 200, 0.02),
            MockMarket::offer(3, 300, 0.07),
            MockMarket::offer(4, 400, 0.01),
            MockMarket::offer(5, 500, 0.05),
        ];
        let selected = select_offers(offers, &owned(&[]), 3);
        let ids: Vec<i64> = selected.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![4, 2, 5]);
    }

    #[test]
    fn zero_needed_returns_nothing() {
        let offers = vec![MockMarket::offer(1, 100, 0.03)];
        assert!(select_offers(offers, &owned(&[]), 0).is_empty());
    }

    #[test]
    fn shortfall_returns_what_exists() {
        let offers = vec![MockMarket::offer(1, 100, 0.03)];
        let selected = select_offers(offers, &owned(&[]), 3);
        assert_eq!(selected.len(), 1);
    }
}
