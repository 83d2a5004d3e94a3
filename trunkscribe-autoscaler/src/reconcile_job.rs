use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trunkscribe_marketplace::{MarketError, Marketplace};

use crate::config::{Config, HealthFallback};
use crate::demand::FleetTarget;
use crate::inventory;
use crate::offers::select_offers;
use crate::provisioner;
use crate::worker_health::WorkerHealth;

/// One cycle's decisions and results, for the summary log line and for tests.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub instances: usize,
    pub destroyed: usize,
    pub destroy_failed: usize,
    pub responsive: usize,
    pub desired: u32,
    pub needed: usize,
    pub offers_eligible: usize,
    pub bids_accepted: usize,
    pub bids_rejected: usize,
    pub skipped: Option<String>,
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instances={} destroyed={} destroy_failed={} responsive={} desired={} \
             needed={} offers={} accepted={} rejected={}",
            self.instances,
            self.destroyed,
            self.destroy_failed,
            self.responsive,
            self.desired,
            self.needed,
            self.offers_eligible,
            self.bids_accepted,
            self.bids_rejected,
        )?;
        if let Some(reason) = &self.skipped {
            write!(f, " skipped={}", reason)?;
        }
        Ok(())
    }
}

/// Timer-driven control loop. One cycle at a time by construction: the loop
/// awaits each cycle, and an overrun delays the next tick instead of
/// overlapping it. Remote failures never end the loop; only startup
/// configuration errors are process-fatal, and those happen before we get here.
pub async fn run(
    cfg: Config,
    worker_env: BTreeMap<String, String>,
    market: Arc<dyn Marketplace>,
    health: Arc<dyn WorkerHealth>,
) {
    let mut ticker = interval(Duration::from_secs(cfg.interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "reconcile loop started: min_instances={} max_instances={} throughput={} image={}",
        cfg.min_instances, cfg.max_instances, cfg.throughput, cfg.image
    );

    loop {
        ticker.tick().await;
        match run_cycle(&cfg, &worker_env, market.as_ref(), health.as_ref()).await {
            Ok(summary) => info!("cycle complete: {}", summary),
            Err(e) => {
                let auth = e
                    .downcast_ref::<MarketError>()
                    .map(MarketError::is_auth)
                    .unwrap_or(false);
                if auth {
                    // Credentials can be rotated externally; keep running so
                    // the next tick picks the fix up without a restart.
                    error!("cycle aborted, marketplace rejected our credentials: {:#}", e);
                } else {
                    warn!("cycle failed: {:#}", e);
                }
            }
        }
    }
}

/// One reconciliation pass: refresh -> destroy exited -> estimate ->
/// (select + provision if there is a deficit).
pub async fn run_cycle(
    cfg: &Config,
    worker_env: &BTreeMap<String, String>,
    market: &dyn Marketplace,
    health: &dyn WorkerHealth,
) -> anyhow::Result<CycleSummary> {
    let mut summary = CycleSummary::default();

    let mut snapshot = inventory::refresh(market)
        .await
        .context("refreshing fleet inventory")?;
    summary.instances = snapshot.instances.len();

    // Dead leases are destroyed before any capacity math so they are never
    // counted as live. Failures here are per-instance and already logged.
    let mut cleanup = inventory::destroy_exited(market, &mut snapshot, cfg.bid_concurrency).await;
    summary.destroyed = cleanup.destroyed.len();
    summary.destroy_failed = cleanup.failed.len();
    if let Some(err) = cleanup.take_auth_failure() {
        return Err(anyhow::Error::new(err).context("destroying exited instances"));
    }

    let (responsive, target) = estimate_demand(cfg, &snapshot, health, &mut summary).await;
    summary.responsive = responsive;
    summary.desired = target.desired_instances;
    if summary.skipped.is_some() {
        return Ok(summary);
    }

    summary.needed = (target.desired_instances as usize).saturating_sub(responsive);
    if summary.needed == 0 {
        debug!(
            "fleet satisfied: responsive={} desired={}",
            responsive, target.desired_instances
        );
        return Ok(summary);
    }

    let available = market
        .search_offers(&cfg.offer_query())
        .await
        .context("searching marketplace offers")?;
    let selected = select_offers(available, &snapshot.machine_ids(), summary.needed);
    summary.offers_eligible = selected.len();

    if selected.is_empty() {
        // Ordinary market tightness, not an error; retried next cycle.
        info!(
            "no eligible offers for {} needed instance(s); waiting for the market",
            summary.needed
        );
        return Ok(summary);
    }
    if selected.len() < summary.needed {
        info!(
            "market shortfall: bidding on {} of {} needed instance(s)",
            selected.len(),
            summary.needed
        );
    }

    let bids = selected
        .iter()
        .map(|offer| provisioner::build_bid(cfg, worker_env, offer))
        .collect();
    let mut outcome = provisioner::provision(market, bids, cfg.bid_concurrency).await;
    summary.bids_accepted = outcome.accepted.len();
    summary.bids_rejected = outcome.rejected.len();
    if let Some(err) = outcome.take_auth_failure() {
        return Err(anyhow::Error::new(err).context("placing bids"));
    }

    Ok(summary)
}

/// Demand estimation with the steady-fleet short-circuit and the configured
/// health-unreachable fallback. Returns (responsive count, target).
async fn estimate_demand(
    cfg: &Config,
    snapshot: &inventory::FleetSnapshot,
    health: &dyn WorkerHealth,
    summary: &mut CycleSummary,
) -> (usize, FleetTarget) {
    // Steady-fleet mode: the health collaborator is not queried at all, and
    // every non-exited lease counts toward the pinned size.
    if cfg.min_instances == cfg.max_instances {
        return (snapshot.live(), FleetTarget::steady(cfg.min_instances));
    }

    let signals = async {
        let workers = health.workers().await?;
        let backlog = health.queue_backlog().await?;
        anyhow::Ok((workers, backlog))
    }
    .await;

    match signals {
        Ok((workers, backlog)) => {
            let responsive = snapshot.responsive(&workers);
            let target = FleetTarget::from_backlog(
                cfg.min_instances,
                cfg.max_instances,
                backlog,
                cfg.throughput,
            );
            (responsive, target)
        }
        Err(e) => match cfg.health_fallback {
            HealthFallback::Skip => {
                warn!("worker-health unreachable, skipping provisioning this cycle: {:#}", e);
                summary.skipped = Some("health-unreachable".to_string());
                (snapshot.running(), FleetTarget::hold(
                    cfg.min_instances,
                    cfg.max_instances,
                    snapshot.running() as u32,
                ))
            }
            HealthFallback::Market => {
                warn!("worker-health unreachable, falling back to marketplace status: {:#}", e);
                let running = snapshot.running();
                (running, FleetTarget::hold(cfg.min_instances, cfg.max_instances, running as u32))
            }
            HealthFallback::Min => {
                warn!("worker-health unreachable, holding at min_instances: {:#}", e);
                (snapshot.running(), FleetTarget {
                    min_instances: cfg.min_instances,
                    max_instances: cfg.max_instances,
                    desired_instances: cfg.min_instances,
                })
            }
        },
    }
}
