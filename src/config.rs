//! Demo configuration and CLI argument parsing
//!
//! Settings come from three places, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (with the THROTTLER_ prefix)
//! 3. Default values
//!
//! Quota limits start from the built-in table. A limits file (TOML, JSON or
//! YAML, picked by extension) can override single actions and add priority
//! reservations:
//!
//! ```toml
//! [[limits]]
//! action = "ListOrders"
//! quota_max = 6
//! restore_rate = 60.0
//!
//! [[priorities]]
//! action = "ListOrders"
//! shares = [2, 4]
//! ```
//!
//! Entries are lists rather than maps keyed by action: the `config` crate
//! does not preserve the case of map keys.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use quota_throttler::{LimitTable, PriorityTable, QuotaLimit, default_limits};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Everything the demo needs to run
#[derive(Debug, Clone)]
pub struct Config {
    /// Limit table after applying the limits file
    pub limits: LimitTable,
    /// Priority reservations from the limits file
    pub priorities: PriorityTable,
    /// Sleep until quota is available instead of only accounting usage
    pub blocking: bool,
    /// Burst to replay
    pub burst: BurstConfig,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// The burst of admissions replayed by the demo
#[derive(Debug, Clone, PartialEq)]
pub struct BurstConfig {
    /// Action every call is issued for
    pub action: String,
    /// Total number of calls
    pub calls: usize,
    /// Priority tier of every call
    pub priority: usize,
    /// Number of tasks issuing calls concurrently
    pub concurrency: usize,
}

/// Contents of a limits file
#[derive(Debug, Default, Deserialize)]
pub struct LimitsFile {
    #[serde(default)]
    pub limits: Vec<LimitEntry>,
    #[serde(default)]
    pub priorities: Vec<PriorityEntry>,
}

/// One action's limit in a limits file
#[derive(Debug, Deserialize)]
pub struct LimitEntry {
    pub action: String,
    pub quota_max: u64,
    pub restore_rate: f64,
    #[serde(default)]
    pub hourly_max: Option<u64>,
}

impl LimitEntry {
    fn limit(&self) -> QuotaLimit {
        let limit = QuotaLimit::new(self.quota_max, self.restore_rate);
        match self.hourly_max {
            Some(hourly_max) => limit.with_hourly_max(hourly_max),
            None => limit,
        }
    }
}

/// One action's per-tier shares in a limits file
#[derive(Debug, Deserialize)]
pub struct PriorityEntry {
    pub action: String,
    pub shares: Vec<u64>,
}

impl LimitsFile {
    /// Reads a limits file; the format follows the file extension
    pub fn load(path: &Path) -> Result<Self> {
        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .and_then(|source| source.try_deserialize())
            .with_context(|| format!("Failed to load limits file {}", path.display()))
    }

    /// Applies the file on top of `limits` and returns the reservations
    pub fn apply(self, limits: &mut LimitTable) -> PriorityTable {
        for entry in self.limits {
            let limit = entry.limit();
            limits.insert(entry.action, limit);
        }

        let mut priorities = PriorityTable::new();
        for entry in self.priorities {
            for (tier, share) in entry.shares.into_iter().enumerate() {
                priorities.reserve(entry.action.clone(), tier, share);
            }
        }
        priorities
    }
}

/// Command-line arguments for the demo
///
/// All arguments can also be set via environment variables with the
/// THROTTLER_ prefix. CLI arguments take precedence over environment variables.
///
/// # Examples
///
/// Replay 30 blocking calls from 4 tasks:
/// ```bash
/// quota-throttler --blocking --action ListOrders --calls 30 --concurrency 4
/// ```
///
/// Use a custom limits file with debug logging:
/// ```bash
/// quota-throttler --limits-file limits.toml --log-level debug
/// ```
#[derive(Parser, Debug)]
#[command(
    name = "quota-throttler",
    about = "Replay a burst of API calls through the quota throttler",
    long_about = "Replays a burst of calls for one action through the quota throttler using a dry-run executor and prints every admission decision.\n\nEnvironment variables with THROTTLER_ prefix are supported. CLI arguments take precedence over environment variables.\n\nPress Ctrl-C to cancel calls that are still waiting for quota."
)]
pub struct Args {
    // Quota configuration
    #[arg(
        long,
        value_name = "PATH",
        help = "Limits file (toml, json or yaml) merged over the built-in table",
        env = "THROTTLER_LIMITS_FILE"
    )]
    pub limits_file: Option<PathBuf>,
    #[arg(
        long,
        help = "Wait for quota instead of only accounting usage",
        env = "THROTTLER_BLOCKING"
    )]
    pub blocking: bool,

    // Burst
    #[arg(
        long,
        value_name = "NAME",
        help = "Action to call",
        default_value = "ListOrders",
        env = "THROTTLER_ACTION"
    )]
    pub action: String,
    #[arg(
        long,
        value_name = "N",
        help = "Total number of calls",
        default_value_t = 10,
        env = "THROTTLER_CALLS"
    )]
    pub calls: usize,
    #[arg(
        long,
        value_name = "TIER",
        help = "Priority tier of every call",
        default_value_t = 0,
        env = "THROTTLER_PRIORITY"
    )]
    pub priority: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Number of concurrent callers",
        default_value_t = 1,
        env = "THROTTLER_CONCURRENCY"
    )]
    pub concurrency: usize,

    // General options
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "THROTTLER_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if the limits file cannot be read or the resulting
    /// configuration is invalid.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    fn from_args(args: Args) -> Result<Self> {
        let file = match &args.limits_file {
            Some(path) => LimitsFile::load(path)?,
            None => LimitsFile::default(),
        };

        let mut limits = default_limits();
        let priorities = file.apply(&mut limits);

        let config = Config {
            limits,
            priorities,
            blocking: args.blocking,
            burst: BurstConfig {
                action: args.action,
                calls: args.calls,
                priority: args.priority,
                concurrency: args.concurrency,
            },
            log_level: args.log_level,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the burst is empty, the log level is unknown or a
    /// limit is malformed.
    fn validate(&self) -> Result<()> {
        if self.burst.calls == 0 {
            return Err(anyhow!("--calls must be at least 1"));
        }

        if self.burst.concurrency == 0 {
            return Err(anyhow!("--concurrency must be at least 1"));
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level: {}. Valid options are: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        self.limits.validate()?;

        Ok(())
    }

    /// Print all available environment variables and their descriptions
    fn print_env_vars() {
        println!("quota-throttler Environment Variables");
        println!("=====================================");
        println!();
        println!("All environment variables use the THROTTLER_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Quota Configuration:");
        println!("  THROTTLER_LIMITS_FILE=<path>     Limits file merged over the built-in table");
        println!("  THROTTLER_BLOCKING=true|false    Wait for quota [default: false]");
        println!();

        println!("Burst Configuration:");
        println!("  THROTTLER_ACTION=<name>          Action to call [default: ListOrders]");
        println!("  THROTTLER_CALLS=<n>              Total number of calls [default: 10]");
        println!("  THROTTLER_PRIORITY=<tier>        Priority tier [default: 0]");
        println!("  THROTTLER_CONCURRENCY=<n>        Concurrent callers [default: 1]");
        println!();

        println!("General Configuration:");
        println!(
            "  THROTTLER_LOG_LEVEL=<level>      Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  # Replay 30 blocking ListOrders calls from 4 tasks");
        println!("  export THROTTLER_BLOCKING=true");
        println!("  export THROTTLER_CALLS=30");
        println!("  quota-throttler --concurrency 4");
    }
}
