//! tempest-soak - soak-test an OpenStack control plane with repeated Tempest runs
//!
//! ## Commands
//!
//! - `run`: submit Tempest CRs until the duration passes or Ctrl-C, then
//!   write `run_record.json` and `run_summary.md`. A second Ctrl-C writes
//!   the partial record and exits without draining.
//! - `show-config`: print the effective configuration as JSON

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use tempest_soak_core::metrics::METRICS;
use tempest_soak_core::{
    write_run_record_json, write_run_summary_md, CrPhase, Orchestrator, RunConfig, RunHandle,
    RunRecord,
};
use tempest_soak_oc::{OcCluster, OcRunner, DEFAULT_OC_BINARY};

#[derive(Parser)]
#[command(name = "tempest-soak")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Repeated Tempest CR runs with pod sampling and log analysis", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a soak test against the cluster
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        oc: OcArgs,

        /// Directory for run_record.json and run_summary.md
        #[arg(short, long, env = "TEMPEST_SOAK_OUTPUT", default_value = ".")]
        output: PathBuf,
    },

    /// Print the effective configuration after layering flags over the file
    ShowConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Run settings. Flags that are not given keep the value from `--config`
/// (or the built-in default).
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// JSON config file
    #[arg(long, env = "TEMPEST_SOAK_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace the operator and services live in
    #[arg(short, long, env = "TEMPEST_SOAK_NAMESPACE")]
    namespace: Option<String>,

    /// Total run duration in seconds
    #[arg(long, env = "TEMPEST_SOAK_DURATION_SECS")]
    duration_secs: Option<u64>,

    /// Seconds between pod samples
    #[arg(long, env = "TEMPEST_SOAK_SAMPLING_INTERVAL_SECS")]
    sampling_interval_secs: Option<u64>,

    /// Seconds between CR status polls
    #[arg(long, env = "TEMPEST_SOAK_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Seconds before a CR counts as timed out
    #[arg(long, env = "TEMPEST_SOAK_CR_TIMEOUT_SECS")]
    cr_timeout_secs: Option<u64>,

    /// CRs submitted concurrently per iteration
    #[arg(long, env = "TEMPEST_SOAK_CRS_PER_ITERATION")]
    crs_per_iteration: Option<u32>,

    /// Retries for a transient submission failure
    #[arg(long, env = "TEMPEST_SOAK_SUBMIT_RETRIES")]
    submit_retries: Option<u32>,

    /// Fuzzy-match threshold for error deduplication, in (0, 1]
    #[arg(long, env = "TEMPEST_SOAK_SIMILARITY_THRESHOLD")]
    similarity_threshold: Option<f32>,

    /// Service pod globs, comma separated
    #[arg(long, env = "TEMPEST_SOAK_SERVICE_PODS", value_delimiter = ',')]
    service_pods: Vec<String>,

    /// Test pod globs, comma separated
    #[arg(long, env = "TEMPEST_SOAK_TEST_PODS", value_delimiter = ',')]
    test_pods: Vec<String>,

    /// API pod globs, comma separated
    #[arg(long, env = "TEMPEST_SOAK_API_PODS", value_delimiter = ',')]
    api_pods: Vec<String>,

    /// Pods to sample, comma separated (default: service + test pods)
    #[arg(long, env = "TEMPEST_SOAK_MONITOR_PODS", value_delimiter = ',')]
    monitor_pods: Vec<String>,

    /// Prefix for generated CR names
    #[arg(long, env = "TEMPEST_SOAK_CR_NAME_PREFIX")]
    cr_name_prefix: Option<String>,
}

#[derive(Args, Debug)]
struct OcArgs {
    /// `oc` binary to run
    #[arg(long, env = "TEMPEST_SOAK_OC_BINARY", default_value = DEFAULT_OC_BINARY)]
    oc_binary: String,

    /// Kubeconfig passed to every `oc` call
    #[arg(long, env = "TEMPEST_SOAK_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Per-command timeout in seconds
    #[arg(long, env = "TEMPEST_SOAK_COMMAND_TIMEOUT_SECS", default_value = "60")]
    command_timeout_secs: u64,
}

impl ConfigArgs {
    /// Load the file (or defaults), apply every flag that was given and
    /// validate the result.
    fn build(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => RunConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply(&self, config: &mut RunConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(v) = self.duration_secs {
            config.run_duration_secs = v;
        }
        if let Some(v) = self.sampling_interval_secs {
            config.sampling_interval_secs = v;
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.cr_timeout_secs {
            config.cr_timeout_secs = v;
        }
        if let Some(v) = self.crs_per_iteration {
            config.crs_per_iteration = v;
        }
        if let Some(v) = self.submit_retries {
            config.submit_retries = v;
        }
        if let Some(v) = self.similarity_threshold {
            config.similarity_threshold = v;
        }
        if let Some(prefix) = &self.cr_name_prefix {
            config.cr_name_prefix = prefix.clone();
        }
        override_patterns(&mut config.service_pod_patterns, &self.service_pods);
        override_patterns(&mut config.test_pod_patterns, &self.test_pods);
        override_patterns(&mut config.api_pod_patterns, &self.api_pods);
        override_patterns(&mut config.monitor_pod_patterns, &self.monitor_pods);
    }
}

fn override_patterns(target: &mut Vec<String>, given: &[String]) {
    let given: Vec<String> = given
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if !given.is_empty() {
        *target = given;
    }
}

impl OcArgs {
    fn runner(&self) -> OcRunner {
        let runner = OcRunner::new(
            self.oc_binary.clone(),
            Duration::from_secs(self.command_timeout_secs),
        );
        match &self.kubeconfig {
            Some(path) => runner.with_global_args(["--kubeconfig".to_string(), path.display().to_string()]),
            None => runner,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tempest_soak_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run { config, oc, output } => cmd_run(&config, &oc, &output).await,
        Commands::ShowConfig { config } => cmd_show_config(&config),
    }
}

async fn cmd_run(args: &ConfigArgs, oc: &OcArgs, output: &Path) -> Result<()> {
    let config = args.build()?;
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;

    let cluster = Arc::new(OcCluster::new(oc.runner(), config.cr_pod_label.clone()));
    let orchestrator = Orchestrator::new(config, cluster).context("Invalid configuration")?;

    let token = CancellationToken::new();
    tokio::spawn(watch_signals(
        token.clone(),
        orchestrator.handle(),
        output.to_path_buf(),
    ));

    info!(run_id = %orchestrator.run_id(), output = %output.display(), "Starting soak run");
    let record = orchestrator.run(token).await;

    let record_path = write_outputs(&record, output)?;
    METRICS.flush();
    print_summary(&record, &record_path);
    Ok(())
}

fn cmd_show_config(args: &ConfigArgs) -> Result<()> {
    let config = args.build()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Write `run_record.json` and `run_summary.md` into `output`; returns the
/// record path.
fn write_outputs(record: &RunRecord, output: &Path) -> Result<PathBuf> {
    let record_path = output.join("run_record.json");
    write_run_record_json(&record_path, record)
        .with_context(|| format!("Failed to write {}", record_path.display()))?;
    let summary_path = output.join("run_summary.md");
    write_run_summary_md(&summary_path, record)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    Ok(record_path)
}

/// The first Ctrl-C or SIGTERM cancels `token` so in-flight CRs drain. A
/// second one writes the partial record and exits with status 130.
async fn watch_signals(token: CancellationToken, handle: RunHandle, output: PathBuf) {
    let mut signals = SignalWatch::new();

    let Some(name) = signals.next().await else {
        return;
    };
    info!(signal = name, "Draining in-flight CRs; send again to stop now");
    token.cancel();

    let Some(name) = signals.next().await else {
        return;
    };
    warn!(signal = name, "Stopping without waiting for the drain");
    match write_outputs(&handle.record(), &output) {
        Ok(path) => info!(record = %path.display(), "Partial run record written"),
        Err(e) => warn!(error = %format!("{e:#}"), "Failed to write partial run record"),
    }
    METRICS.flush();
    std::process::exit(130);
}

/// Ctrl-C plus, on unix, SIGTERM. Handlers are installed once so a repeated
/// signal is not lost between waits.
struct SignalWatch {
    #[cfg(unix)]
    sigterm: Option<tokio::signal::unix::Signal>,
}

impl SignalWatch {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let sigterm = signal(SignalKind::terminate())
                .map_err(|e| warn!(error = %e, "Cannot install SIGTERM handler"))
                .ok();
            Self { sigterm }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Name of the next signal; `None` when no handler could be installed.
    async fn next(&mut self) -> Option<&'static str> {
        #[cfg(unix)]
        if let Some(sigterm) = self.sigterm.as_mut() {
            return tokio::select! {
                res = tokio::signal::ctrl_c() => res.ok().map(|()| "SIGINT"),
                _ = sigterm.recv() => Some("SIGTERM"),
            };
        }
        tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT")
    }
}

fn print_summary(record: &RunRecord, record_path: &Path) {
    let counts = record.test_counts();
    println!("Run {} finished", record.run_id);
    println!(
        "  Reason:     {}",
        record.reason.map(|r| r.as_str()).unwrap_or("unknown")
    );
    println!("  Iterations: {}", record.iterations);
    println!(
        "  CRs:        {} completed, {} error, {} timed out",
        record.jobs_in_phase(CrPhase::Completed),
        record.jobs_in_phase(CrPhase::Error),
        record.jobs_in_phase(CrPhase::TimedOut)
    );
    println!(
        "  Tests:      {} total, {} passed, {} failed, {} skipped",
        counts.total, counts.passed, counts.failed, counts.skipped
    );
    if let Some(errors) = &record.errors {
        println!(
            "  Errors:     {} unique ({} critical)",
            errors.unique_count, errors.critical_count
        );
    }
    println!("  Record:     {}", record_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = ConfigArgs {
            namespace: Some("openstack-kuttl".to_string()),
            duration_secs: Some(600),
            crs_per_iteration: Some(3),
            service_pods: vec!["nova-*".to_string(), " ".to_string()],
            ..ConfigArgs::default()
        };
        let config = args.build().unwrap();
        assert_eq!(config.namespace, "openstack-kuttl");
        assert_eq!(config.run_duration_secs, 600);
        assert_eq!(config.crs_per_iteration, 3);
        assert_eq!(config.service_pod_patterns, vec!["nova-*".to_string()]);
        assert_eq!(config.poll_interval_secs, RunConfig::default().poll_interval_secs);
    }

    #[test]
    fn test_flags_layer_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soak.json");
        std::fs::write(
            &path,
            r#"{"namespace": "from-file", "poll_interval_secs": 30, "crs_per_iteration": 2}"#,
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(path),
            crs_per_iteration: Some(4),
            ..ConfigArgs::default()
        };
        let config = args.build().unwrap();
        assert_eq!(config.namespace, "from-file");
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.crs_per_iteration, 4);
    }

    #[test]
    fn test_invalid_flag_is_fatal() {
        let args = ConfigArgs {
            similarity_threshold: Some(1.5),
            ..ConfigArgs::default()
        };
        let err = args.build().unwrap_err();
        assert!(format!("{err:#}").contains("similarity_threshold"));
    }

    #[test]
    fn test_missing_config_file_is_fatal() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/soak.json")),
            ..ConfigArgs::default()
        };
        assert!(args.build().is_err());
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::parse_from([
            "tempest-soak",
            "run",
            "--kubeconfig",
            "/tmp/kc",
            "--namespace",
            "openstack",
        ]);
        let Commands::Run { oc, .. } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(oc.oc_binary, "oc");
        assert_eq!(oc.command_timeout_secs, 60);
        assert_eq!(oc.kubeconfig, Some(PathBuf::from("/tmp/kc")));
        assert_eq!(oc.runner().timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_record_written_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(tempest_soak_core::fakes::FakeCluster::new());
        let orchestrator = Orchestrator::new(RunConfig::default(), cluster).unwrap();
        let record = orchestrator.handle().record();

        let path = write_outputs(&record, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("run_record.json"));

        let loaded: RunRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.run_id, orchestrator.run_id());
        assert!(loaded.finished_at.is_none());
        let summary = std::fs::read_to_string(dir.path().join("run_summary.md")).unwrap();
        assert!(summary.contains("- stopped by: running"));
    }

    #[test]
    fn test_write_outputs_to_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(tempest_soak_core::fakes::FakeCluster::new());
        let record = Orchestrator::new(RunConfig::default(), cluster)
            .unwrap()
            .record();
        let err = write_outputs(&record, &dir.path().join("missing")).unwrap_err();
        assert!(format!("{err:#}").contains("run_record.json"));
    }
}
