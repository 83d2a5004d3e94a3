use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use trunkscribe_marketplace::OfferQuery;

/// What to do when the worker-health collaborator is unreachable during a
/// scale-up cycle. Steady-fleet mode (min == max) never consults it, so this
/// only matters when demand estimation is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HealthFallback {
    /// Skip provisioning this cycle; cleanup still runs. Safest default:
    /// without a demand signal we cannot justify spending money.
    Skip,
    /// Fall back to marketplace-reported status: count running leases as
    /// responsive and hold capacity between the configured bounds.
    Market,
    /// Treat desired capacity as min_instances.
    Min,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "trunkscribe-autoscaler",
    about = "Scales a fleet of vast.ai GPU transcription workers to match queue demand"
)]
pub struct Config {
    /// Minimum number of worker instances
    #[arg(long, env = "MIN_INSTANCES", default_value_t = 1)]
    pub min_instances: u32,

    /// Maximum number of worker instances
    #[arg(long, env = "MAX_INSTANCES", default_value_t = 10)]
    pub max_instances: u32,

    /// Seconds between reconciliation cycles
    #[arg(long, env = "INTERVAL_SECONDS", default_value_t = 60)]
    pub interval_seconds: u64,

    /// How many queued calls one worker clears per interval (demand divisor)
    #[arg(long, env = "THROUGHPUT", default_value_t = 20)]
    pub throughput: u32,

    /// Bid this multiple of the listed price to outlast interruption competition
    #[arg(long, env = "BID_MULTIPLIER", default_value_t = 1.5)]
    pub bid_multiplier: f64,

    /// Docker image to run on each leased machine
    #[arg(
        long,
        env = "WORKER_IMAGE",
        default_value = "crimeisdown/trunk-transcribe:main-medium.en-cu117"
    )]
    pub image: String,

    /// Env file injected into every worker container (queue broker URL,
    /// storage and search credentials)
    #[arg(long, env = "WORKER_ENV_FILE", default_value = ".env.vast")]
    pub env_file: PathBuf,

    /// Marketplace API base URL
    #[arg(long, env = "VAST_API_URL", default_value = "https://console.vast.ai/api/v0")]
    pub api_url: String,

    /// File holding the marketplace API key (VAST_API_KEY env overrides)
    #[arg(long, env = "VAST_API_KEY_FILE")]
    pub api_key_file: Option<PathBuf>,

    /// Worker-health (Flower) API base URL
    #[arg(long, env = "WORKER_HEALTH_URL", default_value = "http://localhost:5555/api")]
    pub health_url: String,

    /// Behavior when the worker-health API is unreachable during scale-up
    #[arg(long, env = "HEALTH_FALLBACK", value_enum, default_value_t = HealthFallback::Skip)]
    pub health_fallback: HealthFallback,

    /// Queue-consumer name prefix for worker identities
    #[arg(long, env = "CONSUMER_PREFIX", default_value = "celery")]
    pub consumer_prefix: String,

    /// Build identifier baked into worker identities
    #[arg(long, env = "GIT_COMMIT", default_value = "dev")]
    pub build_id: String,

    /// Max concurrent destroy/bid calls per cycle (marketplace rate limits)
    #[arg(long, env = "BID_CONCURRENCY", default_value_t = 4)]
    pub bid_concurrency: usize,

    /// Disk to request with each bid, in GB
    #[arg(long, env = "WORKER_DISK_GB", default_value_t = 0.5)]
    pub disk_gb: f64,

    /// GPU memory one model instance needs, in MB (sets per-worker concurrency)
    #[arg(long, env = "MODEL_RAM_MB", default_value_t = 7168.0)]
    pub model_ram_mb: f64,

    // Offer filter thresholds
    /// Minimum host reliability score (0-1)
    #[arg(long, env = "OFFER_RELIABILITY_MIN", default_value_t = 0.98)]
    pub reliability_min: f64,

    /// Minimum GPUs per offer
    #[arg(long, env = "OFFER_GPU_COUNT_MIN", default_value_t = 1)]
    pub gpu_count_min: u32,

    /// Minimum GPU memory per offer, in GB
    #[arg(long, env = "OFFER_GPU_RAM_MIN_GB", default_value_t = 8.0)]
    pub gpu_ram_min_gb: f64,

    /// Minimum DL performance per dollar
    #[arg(long, env = "OFFER_PERF_PER_DOLLAR_MIN", default_value_t = 200.0)]
    pub perf_per_dollar_min: f64,

    /// Maximum listed price per hour, in dollars
    #[arg(long, env = "OFFER_PRICE_MAX", default_value_t = 0.1)]
    pub price_max: f64,

    /// Minimum CUDA version
    #[arg(long, env = "OFFER_CUDA_MIN", default_value_t = 11.7)]
    pub cuda_min: f64,

    /// Minimum host uplink, Mbps
    #[arg(long, env = "OFFER_INET_UP_MIN", default_value_t = 90.0)]
    pub inet_up_min: f64,

    /// Minimum host downlink, Mbps
    #[arg(long, env = "OFFER_INET_DOWN_MIN", default_value_t = 90.0)]
    pub inet_down_min: f64,
}

impl Config {
    /// Static validation at startup. These are the only process-fatal errors;
    /// everything after startup is a logged cycle failure.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_instances > self.max_instances {
            bail!(
                "min_instances ({}) must not exceed max_instances ({})",
                self.min_instances,
                self.max_instances
            );
        }
        if self.bid_multiplier <= 1.0 {
            bail!(
                "bid_multiplier must be > 1.0 (got {}); bidding at or below the \
                 listed price loses every interruption auction",
                self.bid_multiplier
            );
        }
        if self.throughput == 0 {
            bail!("throughput must be at least 1");
        }
        if self.interval_seconds == 0 {
            bail!("interval_seconds must be at least 1");
        }
        if self.model_ram_mb <= 0.0 {
            bail!("model_ram_mb must be positive");
        }
        Ok(())
    }

    /// Marketplace API key: env var wins, then the configured key file,
    /// then `~/.vast_api_key`.
    pub fn api_key(&self) -> anyhow::Result<String> {
        if let Ok(key) = std::env::var("VAST_API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok(key);
            }
        }

        let path = match &self.api_key_file {
            Some(p) => p.clone(),
            None => {
                let home = std::env::var("HOME").context("HOME not set; cannot locate ~/.vast_api_key")?;
                PathBuf::from(home).join(".vast_api_key")
            }
        };
        let key = std::fs::read_to_string(&path)
            .with_context(|| format!("reading marketplace API key from {}", path.display()))?;
        let key = key.trim().to_string();
        if key.is_empty() {
            bail!("marketplace API key file {} is empty", path.display());
        }
        Ok(key)
    }

    /// Operator-provided env block for worker containers. Read once at
    /// startup; a missing file is a fatal configuration error since workers
    /// cannot reach the queue broker without it.
    pub fn worker_env(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let iter = dotenv::from_filename_iter(&self.env_file)
            .with_context(|| format!("reading worker env file {}", self.env_file.display()))?;
        let mut env = BTreeMap::new();
        for item in iter {
            let (key, value) =
                item.with_context(|| format!("parsing {}", self.env_file.display()))?;
            env.insert(key, value);
        }
        Ok(env)
    }

    pub fn offer_query(&self) -> OfferQuery {
        OfferQuery {
            reliability_min: self.reliability_min,
            gpu_count_min: self.gpu_count_min,
            gpu_ram_min_gb: self.gpu_ram_min_gb,
            perf_per_dollar_min: self.perf_per_dollar_min,
            price_max: self.price_max,
            cuda_min: self.cuda_min,
            inet_up_min: self.inet_up_min,
            inet_down_min: self.inet_down_min,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn defaults() -> Config {
        Config::parse_from(["trunkscribe-autoscaler"])
    }

    #[test]
    fn default_config_is_valid() {
        assert!(defaults().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = defaults();
        cfg.min_instances = 5;
        cfg.max_instances = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_competitive_multiplier() {
        let mut cfg = defaults();
        cfg.bid_multiplier = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_throughput() {
        let mut cfg = defaults();
        cfg.throughput = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_env_reads_dotenv_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CELERY_BROKER_URL=amqp://guest@rabbit:5672//").unwrap();
        writeln!(file, "S3_BUCKET=radio-audio").unwrap();

        let mut cfg = defaults();
        cfg.env_file = file.path().to_path_buf();
        let env = cfg.worker_env().unwrap();
        assert_eq!(
            env.get("CELERY_BROKER_URL").map(String::as_str),
            Some("amqp://guest@rabbit:5672//")
        );
        assert_eq!(env.get("S3_BUCKET").map(String::as_str), Some("radio-audio"));
    }

    #[test]
    fn missing_env_file_is_fatal() {
        let mut cfg = defaults();
        cfg.env_file = PathBuf::from("/nonexistent/.env.vast");
        assert!(cfg.worker_env().is_err());
    }
}
