use std::collections::{HashMap, HashSet};

use futures_util::{stream, StreamExt};
use tracing::warn;
use trunkscribe_common::{identity_machine_id, Instance, InstanceStatus};
use trunkscribe_marketplace::{MarketError, Marketplace};

/// The controller's view of currently owned leases, rebuilt from the
/// marketplace every cycle. Nothing here survives a cycle, let alone a
/// process restart; correctness comes from recomputation, not caching.
#[derive(Debug, Default)]
pub struct FleetSnapshot {
    pub instances: Vec<Instance>,
}

/// Result of one cleanup pass. One bad instance never blocks the rest,
/// so failures are collected rather than short-circuited.
#[derive(Debug, Default)]
pub struct DestroyOutcome {
    pub destroyed: Vec<i64>,
    pub failed: Vec<(i64, MarketError)>,
}

impl DestroyOutcome {
    /// Pull out an auth failure among the per-instance errors, if any.
    pub fn take_auth_failure(&mut self) -> Option<MarketError> {
        let pos = self.failed.iter().position(|(_, e)| e.is_auth())?;
        Some(self.failed.swap_remove(pos).1)
    }
}

impl FleetSnapshot {
    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances.iter().filter(|i| i.status() == status).count()
    }

    /// Leases that still cost money: everything not observed as exited.
    /// Unknown counts as live so a flaky status string never causes a
    /// double-provision.
    pub fn live(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.status() != InstanceStatus::Exited)
            .count()
    }

    pub fn running(&self) -> usize {
        self.count(InstanceStatus::Running)
    }

    /// Hosts we already lease. Offers on these machines are excluded from
    /// selection so the controller never competes against itself.
    pub fn machine_ids(&self) -> HashSet<i64> {
        self.instances.iter().map(|i| i.machine_id).collect()
    }

    pub fn exited_ids(&self) -> Vec<i64> {
        self.instances
            .iter()
            .filter(|i| i.status() == InstanceStatus::Exited)
            .map(|i| i.id)
            .collect()
    }

    /// Cross-reference worker-health entries against owned instances, keyed
    /// on the machine id embedded in the worker's identity name. A worker
    /// reported responsive whose identity does not resolve to a machine we
    /// lease (old build, bare-metal worker) is ignored, and a `running`
    /// lease whose worker never registered is not responsive.
    pub fn responsive(&self, workers: &HashMap<String, bool>) -> usize {
        let registered: HashSet<i64> = workers
            .iter()
            .filter(|(_, alive)| **alive)
            .filter_map(|(name, _)| identity_machine_id(name))
            .collect();
        self.instances
            .iter()
            .filter(|i| registered.contains(&i.machine_id))
            .count()
    }
}

pub async fn refresh(market: &dyn Marketplace) -> Result<FleetSnapshot, MarketError> {
    let instances = market.list_instances().await?;
    Ok(FleetSnapshot { instances })
}

/// Destroy every exited lease in the snapshot, bounded-concurrently, and
/// drop the destroyed ones from the snapshot so capacity math never counts
/// dead instances as live.
pub async fn destroy_exited(
    market: &dyn Marketplace,
    snapshot: &mut FleetSnapshot,
    concurrency: usize,
) -> DestroyOutcome {
    let exited = snapshot.exited_ids();
    if exited.is_empty() {
        return DestroyOutcome::default();
    }

    let results: Vec<(i64, Result<(), MarketError>)> = stream::iter(exited)
        .map(|id| async move { (id, market.destroy_instance(id).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = DestroyOutcome::default();
    for (id, result) in results {
        match result {
            Ok(()) => outcome.destroyed.push(id),
            Err(e) => {
                warn!("failed to destroy exited instance {}: {}", id, e);
                outcome.failed.push((id, e));
            }
        }
    }

    let removed: HashSet<i64> = outcome.destroyed.iter().copied().collect();
    snapshot.instances.retain(|i| !removed.contains(&i.id));
    outcome
}
