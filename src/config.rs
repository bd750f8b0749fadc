//! Configuration for the pool coordinator
//!
//! CLI arguments and environment variables via clap, pool tables from TOML.
//! Everything is resolved once into a [`CoordinatorConfig`] before the
//! coordinator is built.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::allocator::DEFAULT_ALLOCATION_TIMEOUT;
use crate::pool::{Capacity, NamingScheme, PoolConfig, RetryPolicy};
use crate::reaper::ReaperConfig;
use crate::types::{CoordinatorError, Result};

/// Default length of random slot name suffixes
pub const DEFAULT_RANDOM_LENGTH: usize = 6;

/// Pool coordinator - capacity-bounded slot allocation
#[derive(Parser, Debug, Clone)]
#[command(name = "pool-coordinator")]
#[command(about = "Allocate and reclaim capacity-bounded slots over a shared store")]
pub struct Args {
    /// Path to the sled coordination store. sled locks it exclusively, so
    /// while `run` holds it other subcommands must use a different path.
    #[arg(long, env = "POOL_STORE_PATH", default_value = "./pool-coordinator.sled")]
    pub store_path: PathBuf,

    /// TOML file with [[pool]] tables
    #[arg(long, env = "POOLS_FILE")]
    pub pools_file: Option<PathBuf>,

    /// Inline pool definition, repeatable: id=capacity[:prefix]
    #[arg(long = "pool", value_name = "ID=CAPACITY[:PREFIX]")]
    pub pools: Vec<String>,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Seconds between reaper passes
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value = "60")]
    pub reap_interval_secs: u64,

    /// Upper bound of the random reaper start offset, in seconds
    #[arg(long, env = "REAP_JITTER_SECS", default_value = "15")]
    pub reap_jitter_secs: u64,

    /// Seconds without a heartbeat before an owner counts as gone
    #[arg(long, env = "HEARTBEAT_STALE_SECS", default_value = "90")]
    pub heartbeat_stale_secs: u64,

    /// Attempts for contended store operations
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "8")]
    pub retry_max_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value = "25")]
    pub retry_base_delay_ms: u64,

    /// Retry delay cap in milliseconds
    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value = "250")]
    pub retry_max_delay_ms: u64,

    /// Time allowed to register a slot after reserving capacity, in milliseconds
    #[arg(long, env = "ALLOCATION_TIMEOUT_MS", default_value = "5000")]
    pub allocation_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// NATS connection arguments
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// Coordinator commands
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Show usage of every configured pool
    Usage {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Allocate a slot for an owner from the least-used candidate pool
    Allocate {
        /// Owner token
        owner: String,
        /// Candidate pools (defaults to every configured pool)
        pools: Vec<String>,
    },

    /// Release one slot
    Release {
        /// Pool id
        pool: String,
        /// Slot name
        slot: String,
        /// Owner token the slot was allocated to
        owner: String,
    },

    /// Run one reaper pass against an explicit set of live owners
    Reap {
        /// Comma-separated live owner tokens; everyone else is reclaimed
        #[arg(long, value_delimiter = ',')]
        live: Vec<String>,
    },

    /// Run the reaper daemon fed by NATS heartbeats and terminations
    Run,

    /// Publish heartbeats for an owner until interrupted
    Heartbeat {
        /// Owner token
        owner: String,
        /// Seconds between heartbeats
        #[arg(long, default_value = "30")]
        interval_secs: u64,
        /// Host name reported in heartbeats
        #[arg(long, env = "HOSTNAME")]
        host: Option<String>,
    },
}

impl Args {
    /// Validate argument combinations
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.retry_max_attempts == 0 {
            return Err("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(
                "RETRY_BASE_DELAY_MS must be less than or equal to RETRY_MAX_DELAY_MS".to_string(),
            );
        }

        if self.reap_interval_secs == 0 {
            return Err("REAP_INTERVAL_SECS must be greater than 0".to_string());
        }

        let needs_pools = !matches!(self.command, Command::Heartbeat { .. });
        if needs_pools && self.pools_file.is_none() && self.pools.is_empty() {
            return Err("No pools configured: pass --pool or POOLS_FILE".to_string());
        }

        Ok(())
    }

    /// Retry policy from the retry arguments
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Reaper timing from the reaper arguments
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig::new(
            Duration::from_secs(self.reap_interval_secs),
            Duration::from_secs(self.reap_jitter_secs),
        )
    }

    /// Stale threshold for the heartbeat oracle
    pub fn heartbeat_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    /// Resolve pools from the pools file and inline definitions
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut pools = match &self.pools_file {
            Some(path) => PoolsFile::load(path)?.into_pool_configs()?,
            None => Vec::new(),
        };
        for definition in &self.pools {
            pools.push(parse_pool_arg(definition)?);
        }

        let config = CoordinatorConfig::new(pools)
            .with_retry(self.retry_policy())
            .with_allocation_timeout(Duration::from_millis(self.allocation_timeout_ms));
        config.validate()?;
        Ok(config)
    }
}

/// Parse `id=capacity[:prefix]`
pub fn parse_pool_arg(definition: &str) -> Result<PoolConfig> {
    let (id, rest) = definition.split_once('=').ok_or_else(|| {
        CoordinatorError::Config(format!(
            "pool definition '{definition}' must look like id=capacity[:prefix]"
        ))
    })?;

    let (capacity, prefix) = match rest.split_once(':') {
        Some((capacity, prefix)) => (capacity, Some(prefix)),
        None => (rest, None),
    };

    let capacity: Capacity = capacity
        .parse()
        .map_err(|e| CoordinatorError::Config(format!("pool {id}: {e}")))?;

    let mut pool = PoolConfig::new(id.trim(), capacity);
    if let Some(prefix) = prefix {
        pool = pool.with_name_prefix(prefix.trim());
    }
    Ok(pool)
}

/// Everything the coordinator needs, resolved once
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pools this coordinator serves
    pub pools: Vec<PoolConfig>,
    /// Bound on contended store operations
    pub retry: RetryPolicy,
    /// Time allowed between reserving capacity and registering the slot
    pub allocation_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            retry: RetryPolicy::default(),
            allocation_timeout: DEFAULT_ALLOCATION_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(pools: Vec<PoolConfig>) -> Self {
        Self {
            pools,
            ..Default::default()
        }
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the allocation timeout
    pub fn with_allocation_timeout(mut self, timeout: Duration) -> Self {
        self.allocation_timeout = timeout;
        self
    }

    /// Reject duplicate pools, bad names and a zero retry ceiling
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(CoordinatorError::Config(
                "retry policy needs at least one attempt".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.id.as_str()) {
                return Err(CoordinatorError::Config(format!(
                    "pool {} is defined more than once",
                    pool.id
                )));
            }
        }
        Ok(())
    }
}

/// Pool tables loaded from TOML
///
/// ```toml
/// [[pool]]
/// id = "ghost"
/// capacity = 4
/// name_prefix = "GH"
///
/// [[pool]]
/// id = "runids"
/// capacity = "unlimited"
/// naming = "random"
/// random_length = 3
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolsFile {
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolEntry>,
}

/// One `[[pool]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct PoolEntry {
    pub id: String,
    pub capacity: CapacitySetting,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default = "default_naming")]
    pub naming: String,
    #[serde(default = "default_random_length")]
    pub random_length: usize,
}

/// Capacity as written in TOML: a number or `"unlimited"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CapacitySetting {
    Count(i64),
    Word(String),
}

fn default_naming() -> String {
    "sequential".to_string()
}

fn default_random_length() -> usize {
    DEFAULT_RANDOM_LENGTH
}

impl PoolsFile {
    /// Load pool tables from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoordinatorError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse pool tables from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Turn the tables into pool configs
    pub fn into_pool_configs(self) -> Result<Vec<PoolConfig>> {
        self.pools.into_iter().map(PoolEntry::into_pool_config).collect()
    }
}

impl PoolEntry {
    fn into_pool_config(self) -> Result<PoolConfig> {
        let capacity = match self.capacity {
            CapacitySetting::Count(n) => Capacity::Limited(n),
            CapacitySetting::Word(word) => word
                .parse()
                .map_err(|e| CoordinatorError::Config(format!("pool {}: {}", self.id, e)))?,
        };

        let naming = match self.naming.as_str() {
            "sequential" => NamingScheme::Sequential,
            "random" => NamingScheme::Random {
                length: self.random_length,
            },
            other => {
                return Err(CoordinatorError::Config(format!(
                    "pool {}: unknown naming scheme '{}'",
                    self.id, other
                )))
            }
        };

        let mut pool = PoolConfig::new(self.id, capacity).with_naming(naming);
        if let Some(prefix) = self.name_prefix {
            pool = pool.with_name_prefix(prefix);
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_arg() {
        let pool = parse_pool_arg("ghost=4:GH").unwrap();
        assert_eq!(pool.id, "ghost");
        assert_eq!(pool.capacity, Capacity::Limited(4));
        assert_eq!(pool.name_prefix, "GH");

        let open = parse_pool_arg("runids=unlimited").unwrap();
        assert_eq!(open.capacity, Capacity::Unlimited);
        assert_eq!(open.name_prefix, "runids");

        assert!(parse_pool_arg("missing-capacity").is_err());
        assert!(parse_pool_arg("p=lots").is_err());
    }

    #[test]
    fn test_pools_file() {
        let file = PoolsFile::parse(
            r#"
            [[pool]]
            id = "ghost"
            capacity = 4
            name_prefix = "GH"

            [[pool]]
            id = "runids"
            capacity = "unlimited"
            naming = "random"
            random_length = 3
            "#,
        )
        .unwrap();

        let pools = file.into_pool_configs().unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name_prefix, "GH");
        assert_eq!(pools[0].naming, NamingScheme::Sequential);
        assert_eq!(pools[1].capacity, Capacity::Unlimited);
        assert_eq!(pools[1].naming, NamingScheme::Random { length: 3 });
    }

    #[test]
    fn test_unknown_naming_rejected() {
        let file = PoolsFile::parse(
            r#"
            [[pool]]
            id = "p"
            capacity = 1
            naming = "fancy"
            "#,
        )
        .unwrap();
        assert!(matches!(
            file.into_pool_configs(),
            Err(CoordinatorError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_pools_rejected() {
        let config = CoordinatorConfig::new(vec![
            PoolConfig::new("p", Capacity::Limited(1)),
            PoolConfig::new("p", Capacity::Limited(2)),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_resolve_inline_pools() {
        let args = Args::try_parse_from([
            "pool-coordinator",
            "--pool",
            "P=2",
            "--pool",
            "Q=3:q",
            "--retry-max-attempts",
            "3",
            "usage",
        ])
        .unwrap();
        args.validate().unwrap();

        let config = args.coordinator_config().unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(matches!(args.command, Command::Usage { json: false }));
    }

    #[test]
    fn test_args_validation() {
        let args = Args::try_parse_from(["pool-coordinator", "run"]).unwrap();
        assert!(args.validate().is_err());

        let args = Args::try_parse_from([
            "pool-coordinator",
            "--pool",
            "P=1",
            "--retry-base-delay-ms",
            "500",
            "--retry-max-delay-ms",
            "100",
            "run",
        ])
        .unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_reap_live_list() {
        let args =
            Args::try_parse_from(["pool-coordinator", "--pool", "P=1", "reap", "--live", "a,b"])
                .unwrap();
        match args.command {
            Command::Reap { live } => assert_eq!(live, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_needs_no_pools() {
        let args = Args::try_parse_from([
            "pool-coordinator",
            "heartbeat",
            "run1",
            "--interval-secs",
            "10",
            "--host",
            "worker-3",
        ])
        .unwrap();
        args.validate().unwrap();

        match args.command {
            Command::Heartbeat {
                owner,
                interval_secs,
                host,
            } => {
                assert_eq!(owner, "run1");
                assert_eq!(interval_secs, 10);
                assert_eq!(host.as_deref(), Some("worker-3"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
