use std::path::PathBuf;

use crate::build_info;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "segmenter",
    about = "Refresh due segments and audit every store operation",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[arg(long = "database-url")]
    /// Overrides DATABASE_URL
    pub database_url: Option<String>,

    #[arg(long = "config-table")]
    /// Overrides SEGMENTER_CONFIG_TABLE
    pub config_table: Option<String>,

    #[arg(long = "log-table")]
    /// Overrides SEGMENTER_LOG_TABLE
    pub log_table: Option<String>,

    #[arg(long = "default-namespace")]
    /// Overrides SEGMENTER_DEFAULT_NAMESPACE
    pub default_namespace: Option<String>,

    #[arg(long = "pool-size")]
    /// Overrides SEGMENTER_POOL_SIZE (Postgres only)
    pub pool_size: Option<u32>,

    #[arg(long = "check", value_name = "NAME")]
    /// Run only these checks (repeatable). Default: every registered check.
    pub checks: Vec<String>,

    #[arg(long = "stop-at-first-failure", default_value_t = false)]
    /// Stop a segment's check chain at the first check that does not pass.
    ///
    /// By default every check runs so each segment has a complete audit trail.
    pub stop_at_first_failure: bool,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    #[arg(long = "metrics-textfile", value_name = "PATH")]
    /// Write Prometheus metrics to this file after the batch
    pub metrics_textfile: Option<PathBuf>,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
