use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

/// Marketplace-reported lifecycle state of a leased machine.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Loading, // Bid accepted, image still pulling/booting
    Running, // Container is up (worker may or may not have registered)
    Exited,  // Dead lease, must be destroyed
    Unknown, // Status string we don't recognize
}

impl InstanceStatus {
    /// Map the marketplace's `actual_status` string.
    ///
    /// A just-accepted bid reports no status at all for a short window, so
    /// `None` is treated as `Loading` (the lease exists, the container doesn't yet).
    pub fn from_actual(actual: Option<&str>) -> Self {
        match actual {
            None => InstanceStatus::Loading,
            Some("loading") | Some("created") => InstanceStatus::Loading,
            Some("running") => InstanceStatus::Running,
            Some("exited") => InstanceStatus::Exited,
            Some(_) => InstanceStatus::Unknown,
        }
    }
}

// --- Wire entities ---

/// A candidate rentable machine, as returned by the offers search.
/// Snapshot at query time; offers expire implicitly and a stale one may fail to bid.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Offer {
    pub id: i64,
    pub machine_id: i64,
    #[serde(rename = "dph_total")]
    pub price_per_hour: f64,
    #[serde(default)]
    pub reliability: f64,
    #[serde(rename = "num_gpus", default)]
    pub gpu_count: u32,
    /// GPU memory in MB (the marketplace reports raw MB here even though
    /// search filters take GB).
    #[serde(rename = "gpu_ram", default)]
    pub gpu_ram_mb: f64,
    #[serde(rename = "dlperf_usd", default)]
    pub perf_per_dollar: f64,
    #[serde(rename = "cuda_vers", default)]
    pub cuda_version: f64,
}

/// A running or pending lease owned by the controller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: i64,
    pub machine_id: i64,
    #[serde(default)]
    pub actual_status: Option<String>,
    /// Launch time as a unix epoch, as the marketplace reports it.
    #[serde(default)]
    pub start_date: Option<f64>,
}

impl Instance {
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::from_actual(self.actual_status.as_deref())
    }

    pub fn launched_at(&self) -> Option<DateTime<Utc>> {
        let epoch = self.start_date?;
        Utc.timestamp_opt(epoch as i64, 0).single()
    }
}

// --- Worker identity ---

/// Queue-consumer name injected into each leased worker:
/// `{prefix}-{build_id}@vast-{machine_id}`.
///
/// Keyed on the machine, not the lease: the machine id is known at bid time
/// (it is on the offer) and is reported unchanged on the resulting instance,
/// whereas a lease gets a fresh contract id from the marketplace that the
/// bidder never chose. The name ties a registered worker back to both the
/// software build and the host, which is what lets the inventory
/// cross-reference worker-health entries against marketplace instances.
pub fn worker_identity(prefix: &str, build_id: &str, machine_id: i64) -> String {
    format!("{}-{}@vast-{}", prefix, build_id, machine_id)
}

/// Extract the machine id back out of a worker name, if it follows the
/// identity scheme. Names from other deployments (bare-metal workers, old
/// builds) simply return `None` and are ignored by the fleet math.
pub fn identity_machine_id(worker_name: &str) -> Option<i64> {
    let (_, tail) = worker_name.rsplit_once("@vast-")?;
    tail.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(InstanceStatus::from_actual(None), InstanceStatus::Loading);
        assert_eq!(
            InstanceStatus::from_actual(Some("loading")),
            InstanceStatus::Loading
        );
        assert_eq!(
            InstanceStatus::from_actual(Some("running")),
            InstanceStatus::Running
        );
        assert_eq!(
            InstanceStatus::from_actual(Some("exited")),
            InstanceStatus::Exited
        );
        assert_eq!(
            InstanceStatus::from_actual(Some("offline")),
            InstanceStatus::Unknown
        );
    }

    #[test]
    fn identity_round_trip() {
        let name = worker_identity("celery", "abc1234", 8675309);
        assert_eq!(name, "celery-abc1234@vast-8675309");
        assert_eq!(identity_machine_id(&name), Some(8675309));
    }

    #[test]
    fn identity_ignores_foreign_names() {
        assert_eq!(identity_machine_id("celery@bare-metal-01"), None);
        assert_eq!(identity_machine_id("celery-abc@vast-notanum"), None);
    }

    #[test]
    fn offer_parses_wire_names() {
        let raw = r#"{
            "id": 42, "machine_id": 7, "dph_total": 0.081,
            "reliability": 0.995, "num_gpus": 1, "gpu_ram": 24576,
            "dlperf_usd": 310.5, "cuda_vers": 12.1
        }"#;
        let offer: Offer = serde_json::from_str(raw).unwrap();
        assert_eq!(offer.machine_id, 7);
        assert!((offer.price_per_hour - 0.081).abs() < f64::EPSILON);
        assert_eq!(offer.gpu_count, 1);
    }

    #[test]
    fn instance_without_status_is_loading() {
        let raw = r#"{"id": 1, "machine_id": 2}"#;
        let instance: Instance = serde_json::from_str(raw).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Loading);
        assert!(instance.launched_at().is_none());
    }
}
