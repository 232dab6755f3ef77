//! Stack operator CLI entrypoint.
//!
//! This is the main entrypoint for the stack-operator command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_stack_operator::cli::{Cli, Commands, LogFormat, OutputFormatter};
use halldyll_stack_operator::cloudformation::{CloudFormationProvisioner, StackProvisioner};
use halldyll_stack_operator::config::{
    apply_env_overrides, find_config_file, ConfigParser, ConfigValidator, OperatorConfig,
};
use halldyll_stack_operator::controller::Controller;
use halldyll_stack_operator::error::{OperatorError, Result};
use halldyll_stack_operator::follower::Follower;
use halldyll_stack_operator::hub::Hub;
use halldyll_stack_operator::metrics::{serve_metrics, PrometheusMetrics};
use halldyll_stack_operator::reconciler::StackReconciler;
use halldyll_stack_operator::resource::{
    LocalResourceStore, ResourceLocator, ResourceStore, StackStatus,
};

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` forces debug. Otherwise `RUST_LOG` applies, defaulting to info.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Run { dry_run, region } => cmd_run(config_path, dry_run, region).await,
        Commands::Apply { file } => cmd_apply(config_path, &file, &formatter).await,
        Commands::Delete { locator } => cmd_delete(config_path, &locator, &formatter).await,
        Commands::Get { locator } => cmd_get(config_path, &locator, &formatter).await,
        Commands::List => cmd_list(config_path, &formatter).await,
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
    }
}

/// Run the operator until interrupted.
async fn cmd_run(config_path: Option<&PathBuf>, dry_run: bool, region: Option<String>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if dry_run {
        config.dry_run = true;
    }
    if region.is_some() {
        config.region = region;
    }

    let state_dir = config.resolved_state_dir();
    info!(
        state_dir = %state_dir.display(),
        region = config.region.as_deref().unwrap_or("default"),
        dry_run = config.dry_run,
        "Starting stack operator"
    );

    let local_store = Arc::new(LocalResourceStore::with_base_dir(state_dir));
    // Picks up `apply` and `delete` run from other processes
    let _watcher = match local_store.watch().await {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Not watching the state directory, relying on resyncs: {e}");
            None
        }
    };
    let store: Arc<dyn ResourceStore> = local_store;
    let provisioner: Arc<dyn StackProvisioner> = Arc::new(
        CloudFormationProvisioner::new(config.region.as_deref(), config.request_timeout()).await,
    );
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let (hub, receiver) = Hub::channel(config.hub_capacity);

    let follower = Arc::new(
        Follower::new(Arc::clone(&store), Arc::clone(&provisioner), metrics.clone())
            .with_poll_interval(config.poll_interval())
            .with_request_timeout(config.request_timeout()),
    );

    let cancel = CancellationToken::new();
    let (receiver_task, worker_task) = follower.spawn(receiver, &cancel);

    let metrics_task = match config.metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                OperatorError::internal(format!("Failed to bind metrics endpoint {addr}: {e}"))
            })?;
            Some(tokio::spawn(serve_metrics(listener, metrics.clone(), cancel.clone())))
        }
        None => None,
    };

    let reconciler = StackReconciler::new(Arc::clone(&store), provisioner, hub).with_config(&config);
    let controller = Controller::new(store, reconciler).with_resync_interval(config.resync_interval());

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signal: {e}"),
            }
        }
    });

    let result = controller.run(cancel.clone()).await;
    cancel.cancel();

    for (name, task) in [("receiver", receiver_task), ("worker", worker_task)] {
        if let Err(e) = task.await {
            warn!("Follower {name} task ended abnormally: {e}");
        }
    }

    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{e}"),
            Err(e) => warn!("Metrics task ended abnormally: {e}"),
        }
    }

    match metrics.render() {
        Ok(text) => debug!("Final metrics:\n{text}"),
        Err(e) => warn!("Failed to render metrics: {e}"),
    }
    info!(following = follower.following_count(), "Stack operator stopped");

    result
}

/// Create or update a stack resource from a manifest.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    file: &Path,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let mut resource = ConfigParser::new().load_resource_file(file)?;

    let validation = ConfigValidator::new().validate_resource(&resource)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let store = LocalResourceStore::with_base_dir(config.resolved_state_dir());
    let locator = resource.locator();

    let action = match store.get(&locator).await {
        Ok(mut existing) => {
            if existing.is_marked_for_deletion() {
                return Err(OperatorError::internal(format!(
                    "Stack resource {locator} is being deleted"
                )));
            }
            if existing.spec == resource.spec {
                "unchanged"
            } else {
                existing.spec = resource.spec;
                store.update(&existing).await?;
                "configured"
            }
        }
        Err(e) if e.is_not_found() => {
            // Status and finalizers are owned by the operator
            resource.status = StackStatus::default();
            resource.metadata.finalizers.clear();
            store.create(resource).await?;
            "created"
        }
        Err(e) => return Err(e),
    };

    eprintln!("{}", formatter.format_message(&format!("Stack resource {locator} {action}")));
    Ok(())
}

/// Request deletion of a stack resource.
async fn cmd_delete(
    config_path: Option<&PathBuf>,
    locator: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let locator = ResourceLocator::parse(locator)?;
    let store = LocalResourceStore::with_base_dir(config.resolved_state_dir());

    let mut resource = store.get(&locator).await?;
    if resource.metadata.deletion_timestamp.is_none() {
        resource.metadata.deletion_timestamp = Some(Utc::now());
        store.update(&resource).await?;
    }

    let message = if resource.has_stack_finalizer() {
        format!("Deletion of {locator} requested, the operator will remove its stack")
    } else {
        format!("Stack resource {locator} deleted")
    };
    eprintln!("{}", formatter.format_message(&message));
    Ok(())
}

/// Show one stack resource.
async fn cmd_get(
    config_path: Option<&PathBuf>,
    locator: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config = load_config(config_path)?;
    let locator = ResourceLocator::parse(locator)?;
    let store = LocalResourceStore::with_base_dir(config.resolved_state_dir());

    let resource = store.get(&locator).await?;
    eprintln!("{}", formatter.format_resource(&resource));
    Ok(())
}

/// List stack resources.
async fn cmd_list(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let config = load_config(config_path)?;
    let store = LocalResourceStore::with_base_dir(config.resolved_state_dir());

    let mut resources = Vec::new();
    for locator in store.list().await? {
        match store.get(&locator).await {
            Ok(resource) => resources.push(resource),
            // Removed between listing and reading
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    eprintln!("{}", formatter.format_list(&resources));
    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    eprintln!("{}", formatter.format_validation(&result, show_warnings));

    eprintln!("\nConfiguration summary:");
    eprintln!("  State dir: {}", config.resolved_state_dir().display());
    eprintln!("  Region: {}", config.region.as_deref().unwrap_or("default"));
    eprintln!("  Poll interval: {}s", config.poll_interval_secs);
    eprintln!("  Resync interval: {}s", config.resync_interval_secs);
    match config.metrics_addr {
        Some(addr) => eprintln!("  Metrics: http://{addr}/metrics"),
        None => eprintln!("  Metrics: disabled"),
    }
    eprintln!("  Dry run: {}", config.dry_run);

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates configuration.
///
/// Without an explicit path and with no file found, defaults plus
/// environment overrides are used.
fn load_config(config_path: Option<&PathBuf>) -> Result<OperatorConfig> {
    let config = match resolve_config_path(config_path) {
        Ok(config_file) => {
            debug!("Loading configuration from: {}", config_file.display());
            let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
            parser.load_dotenv()?;
            parser.load_with_env(&config_file)?
        }
        Err(e) if config_path.is_none() => {
            debug!("No configuration file, using defaults: {e}");
            ConfigParser::new().load_dotenv()?;
            let mut config = OperatorConfig::default();
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            config
        }
        Err(e) => return Err(e),
    };

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok(config)
}
