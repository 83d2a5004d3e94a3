pub mod config;
pub mod demand;
pub mod inventory;
pub mod offers;
pub mod provisioner;
pub mod reconcile_job;
pub mod worker_health;
