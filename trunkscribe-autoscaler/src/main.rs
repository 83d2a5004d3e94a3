use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use trunkscribe_autoscaler::config::Config;
use trunkscribe_autoscaler::reconcile_job;
use trunkscribe_autoscaler::worker_health::FlowerHealth;
use trunkscribe_marketplace::vast::VastMarket;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let cfg = Config::parse();
    cfg.validate().context("invalid configuration")?;

    // Everything read here is startup-fatal on failure; after this point the
    // process only ever logs and retries.
    let api_key = cfg.api_key()?;
    let worker_env = cfg.worker_env()?;

    let market = Arc::new(VastMarket::new(cfg.api_url.clone(), api_key)?);
    let health = Arc::new(FlowerHealth::new(cfg.health_url.clone())?);

    info!(
        "autoscaler started: min_instances={} max_instances={} interval={}s build_id={}",
        cfg.min_instances, cfg.max_instances, cfg.interval_seconds, cfg.build_id
    );

    tokio::select! {
        _ = reconcile_job::run(cfg, worker_env, market, health) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}
