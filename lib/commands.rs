use crate::{
    checks::{CheckPolicy, CheckRegistry},
    cli::Cli,
    config::{parse_pool_size, Config, ConfigError},
    logging::{format_error_report, init_logging},
    metrics::{write_textfile, SegmenterMetrics},
    segmenter::{Segmenter, SegmenterOptions},
    store::connector_from_url,
};
use dotenv::dotenv;
use prometheus_client::registry::Registry;
use std::env;
use tracing::{error, info, warn};

/// Environment settings with the command-line overrides applied on top.
pub fn resolve_config(
    args: &Cli,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let overrides = [
        ("DATABASE_URL", args.database_url.clone()),
        ("SEGMENTER_CONFIG_TABLE", args.config_table.clone()),
        ("SEGMENTER_LOG_TABLE", args.log_table.clone()),
        ("SEGMENTER_DEFAULT_NAMESPACE", args.default_namespace.clone()),
        ("SEGMENTER_POOL_SIZE", args.pool_size.map(|size| size.to_string())),
    ];
    Config::from_lookup(|name| {
        overrides
            .iter()
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| value.clone())
            .or_else(|| lookup(name))
    })
}

pub fn resolve_checks(args: &Cli) -> Result<CheckRegistry, String> {
    let registry = CheckRegistry::default_chain();
    if args.checks.is_empty() {
        return Ok(registry);
    }
    registry.only(&args.checks).map_err(|err| err.to_string())
}

pub fn validate_args(args: &Cli) -> Result<(), String> {
    if let Some(size) = args.pool_size {
        parse_pool_size(&size.to_string()).map_err(|err| format!("--pool-size: {err}"))?;
    }
    Ok(())
}

/// Runs one batch and returns the process exit code.
///
/// 0 when the batch completed (individual segment failures included), 2 for usage or
/// configuration errors, 1 when the store or the log sink is unusable.
pub fn run_segmenter_once(args: Cli) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("segmenter", &args.log_level);
    let run_span = tracing::info_span!(
        "segmenter_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();
    info!(event = "segmenter_starting", "starting segment refresh batch");

    if let Err(err) = validate_args(&args) {
        eprintln!("{err}");
        return 2;
    }

    let config = match resolve_config(&args, |name| env::var(name).ok()) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let (config_table, log_table) = match (config.config_table_ref(), config.log_table_ref()) {
        (Ok(config_table), Ok(log_table)) => (config_table, log_table),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let checks = match resolve_checks(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let policy = if args.stop_at_first_failure {
        CheckPolicy::StopAtFirstFailure
    } else {
        CheckPolicy::RunAll
    };

    let connector = match connector_from_url(&config.database_url, config.pool_size) {
        Ok(value) => value,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "segmenter_connector_build_failed",
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "failed to build store connector"
            );
            eprintln!("failed to build store connector: {err}");
            eprintln!("{error_report}");
            return 1;
        }
    };

    let mut registry = Registry::default();
    let metrics = SegmenterMetrics::register(&mut registry, "segmenter");

    let options = SegmenterOptions {
        config_table,
        log_table,
        default_namespace: config.default_namespace.clone(),
        checks,
        policy,
        metrics,
        ..SegmenterOptions::default()
    };
    let segmenter = match Segmenter::connect(connector, options) {
        Ok(value) => value,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "segmenter_connect_failed",
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "failed to start segmenter"
            );
            eprintln!("failed to start segmenter: {err}");
            eprintln!("{error_report}");
            return 1;
        }
    };

    let exit_code = match segmenter.refresh_segments() {
        Ok(report) => {
            info!(
                event = "segmenter_finished",
                run_id = %segmenter.run_id(),
                refreshed = report.refreshed.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "segment refresh batch finished"
            );
            0
        }
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "segmenter_batch_aborted",
                run_id = %segmenter.run_id(),
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "batch aborted: audit log unavailable"
            );
            eprintln!("batch aborted: {err}");
            eprintln!("{error_report}");
            1
        }
    };

    if let Some(path) = &args.metrics_textfile {
        if let Err(err) = write_textfile(&registry, path) {
            warn!(
                event = "metrics_textfile_failed",
                path = %path.display(),
                error = %err,
                "failed to write metrics textfile"
            );
        }
    }

    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["segmenter"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn flags_override_environment() {
        let args = cli(&["--database-url", "flag.db", "--log-table", "audit.log"]);
        let config = resolve_config(&args, |name| match name {
            "DATABASE_URL" => Some("env.db".to_string()),
            "SEGMENTER_LOG_TABLE" => Some("env_log".to_string()),
            "SEGMENTER_CONFIG_TABLE" => Some("env_config".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.database_url, "flag.db");
        assert_eq!(config.log_table, "audit.log");
        assert_eq!(config.config_table, "env_config");
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = resolve_config(&cli(&[]), |_| None).unwrap_err();
        assert_eq!(err, ConfigError::MissingDatabaseUrl);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        assert!(validate_args(&cli(&["--pool-size", "0"])).is_err());
        assert!(validate_args(&cli(&["--pool-size", "2"])).is_ok());
    }

    #[test]
    fn check_selection() {
        assert_eq!(resolve_checks(&cli(&[])).unwrap().len(), 3);
        let only = resolve_checks(&cli(&["--check", "check_cron"])).unwrap();
        assert_eq!(only.names(), ["check_cron"]);
        let err = resolve_checks(&cli(&["--check", "check_relevance"]))
            .err()
            .unwrap();
        assert!(err.contains("check_relevance"));
    }

    #[test]
    fn unknown_check_exits_with_usage_code() {
        let code = run_segmenter_once(cli(&[
            "--database-url",
            "unused.db",
            "--check",
            "check_nothing",
        ]));
        assert_eq!(code, 2);
    }
}
