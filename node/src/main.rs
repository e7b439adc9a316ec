use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vanity_name_registry::{
    Clock, InboxForwarder, NameRegistry, RegistryConfig, RegistrySnapshot, SystemClock,
};
use vanity_rpc::{start_server_with_shutdown, AppState};
use vanity_storage::{RegistryStore, SledRegistryStore};

const CONFIG_FILENAME: &str = "vanity.toml";
const ENV_PREFIX: &str = "VANITY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AppConfig {
    // Network
    rpc_host: String,
    rpc_port: u16,

    // Storage
    data_dir: String,

    // Observability
    log_level: String,
    log_format: String,
    prometheus_enabled: bool,

    // API
    require_signatures: bool,

    registry: RegistryConfig,

    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 8088,
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            prometheus_enabled: true,
            require_signatures: true,
            registry: RegistryConfig::default(),
            config_path: None,
        }
    }
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("vanity"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .into_owned()
}

impl AppConfig {
    /// Layer built-in defaults, an optional TOML file and `VANITY_*` environment variables.
    fn load(config_path_override: Option<&str>, data_dir_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let data_dir = data_dir_override
                .map(str::to_string)
                .unwrap_or_else(default_data_dir);
            let path = Path::new(&data_dir).join(CONFIG_FILENAME);
            path.exists().then_some(path)
        };

        let mut builder = Config::builder();

        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid node configuration")?;
        config.config_path = resolved_path;
        Ok(config)
    }

    fn db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("db")
    }

    fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    fn validate(&self) -> Result<()> {
        self.registry
            .validate()
            .map_err(|err| anyhow!("invalid registry configuration: {err}"))?;
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "Invalid log_format '{}'; expected 'pretty' or 'json'",
                self.log_format
            );
        }
        Ok(())
    }
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(|value| value.as_str());
    let data_dir = matches.get_one::<String>("data-dir").map(|value| value.as_str());
    let mut config = AppConfig::load(config_path, data_dir)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if matches.get_flag("disable-metrics") {
        config.prometheus_enabled = false;
    }

    if matches.get_flag("insecure-no-signatures") {
        config.require_signatures = false;
    }
}

fn cli() -> Command {
    Command::new("vanity-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Vanity name registry node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is unset")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format: pretty or json")
                .global(true),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("API bind host"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("API bind port"),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Do not install the Prometheus exporter"),
        )
        .arg(
            Arg::new("insecure-no-signatures")
                .long("insecure-no-signatures")
                .action(ArgAction::SetTrue)
                .help("Accept unsigned mutating requests (local development only)"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate configuration and storage, then exit"),
        )
        .subcommand(Command::new("start").about("Serve the registry API (default)"))
        .subcommand(
            Command::new("snapshot")
                .about("Export or import the persisted registry state")
                .subcommand_required(true)
                .subcommand(
                    Command::new("export")
                        .about("Write the stored snapshot as JSON")
                        .arg(
                            Arg::new("file")
                                .long("file")
                                .value_name("FILE")
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new("import")
                        .about("Replace the stored snapshot with a JSON export")
                        .arg(
                            Arg::new("file")
                                .long("file")
                                .value_name("FILE")
                                .required(true),
                        )
                        .arg(
                            Arg::new("force")
                                .long("force")
                                .action(ArgAction::SetTrue)
                                .help("Overwrite an existing stored snapshot"),
                        ),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    if let Some(snapshot_matches) = matches.subcommand_matches("snapshot") {
        return handle_snapshot_subcommand(snapshot_matches, &config);
    }

    if matches.get_flag("check") {
        return run_self_check(&config);
    }

    init_logging(&config)?;
    let prometheus_handle = init_metrics(&config);

    info!("Starting vanity node {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config.config_path {
        info!("Config file: {}", path.display());
    } else {
        info!("Config file: (built-in defaults)");
    }
    info!("Data directory: {}", config.data_dir);
    if !config.require_signatures {
        warn!("Request signatures are disabled; any caller can act for any account");
    }
    if let Ok(ip) = config.rpc_host.parse::<IpAddr>() {
        if ip.is_unspecified() {
            warn!(
                "API host {} binds to all interfaces; consider VANITY_RPC_HOST=127.0.0.1 behind a reverse proxy",
                config.rpc_host
            );
        }
    }

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir))?;
    let store = Arc::new(SledRegistryStore::open(config.db_path())?);

    let inbox = InboxForwarder::new();
    let registry = Arc::new(NameRegistry::new(
        config.registry.clone(),
        Arc::new(SystemClock),
        Arc::new(inbox.clone()),
    )?);

    match store.load_snapshot()? {
        Some(snapshot) => registry
            .restore(snapshot)
            .context("stored registry state is inconsistent")?,
        None => info!("No stored registry state; starting empty"),
    }

    let mut state = AppState::new(registry.clone());
    state.store = Some(store.clone());
    state.inbox = Some(inbox);
    state.require_signatures = config.require_signatures;
    state.metrics = prometheus_handle;

    start_server_with_shutdown(state, &config.rpc_addr(), shutdown_signal()).await?;

    store
        .save_snapshot(&registry.snapshot(), registry.now())
        .context("failed to save registry state on shutdown")?;
    info!("Registry state saved; node stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            warn!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

fn init_metrics(config: &AppConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!("vanity_registrations_total", "Names registered");
            describe_counter!("vanity_renewals_total", "Registrations renewed");
            describe_counter!("vanity_releases_total", "Registrations released");
            describe_counter!("vanity_forwards_total", "Calls forwarded to name owners");
            describe_counter!(
                "vanity_forward_failures_total",
                "Forwarded calls the recipient rejected"
            );
            describe_counter!(
                "vanity_persist_failures_total",
                "Registry snapshots the store failed to save"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn run_self_check(config: &AppConfig) -> Result<()> {
    println!("Running vanity node self-check...");
    let mut issues = Vec::new();

    if config.rpc_port == 0 {
        issues.push("rpc_port must be greater than zero".to_string());
    }

    if let Err(err) = config.rpc_addr().parse::<std::net::SocketAddr>() {
        if config.rpc_host.parse::<IpAddr>().is_ok() {
            issues.push(format!("API address {} is invalid: {err}", config.rpc_addr()));
        }
    }

    if let Err(err) = fs::create_dir_all(&config.data_dir) {
        issues.push(format!(
            "Data directory {} is not writable: {err}",
            config.data_dir
        ));
    } else {
        match SledRegistryStore::open(config.db_path()).and_then(|store| store.load_snapshot()) {
            Ok(Some(snapshot)) => println!(
                "Stored state: {} registrations, {} pending commitments",
                snapshot.registrations.len(),
                snapshot.pending.len()
            ),
            Ok(None) => println!("Stored state: empty"),
            Err(err) => issues.push(format!("Registry store is unreadable: {err}")),
        }
    }

    if issues.is_empty() {
        println!("OK");
        Ok(())
    } else {
        for issue in &issues {
            eprintln!("- {issue}");
        }
        anyhow::bail!("self-check failed")
    }
}

fn handle_snapshot_subcommand(matches: &clap::ArgMatches, config: &AppConfig) -> Result<()> {
    fs::create_dir_all(&config.data_dir)?;
    let store = SledRegistryStore::open(config.db_path())?;
    match matches.subcommand() {
        Some(("export", export_matches)) => {
            let file = export_matches
                .get_one::<String>("file")
                .ok_or_else(|| anyhow!("--file is required"))?;
            let snapshot = store.load_snapshot()?.unwrap_or_default();
            export_snapshot(&snapshot, Path::new(file))?;
            println!(
                "Snapshot exported to {} ({} registrations)",
                file,
                snapshot.registrations.len()
            );
            Ok(())
        }
        Some(("import", import_matches)) => {
            let file = import_matches
                .get_one::<String>("file")
                .ok_or_else(|| anyhow!("--file is required"))?;
            if store.load_snapshot()?.is_some() && !import_matches.get_flag("force") {
                anyhow::bail!(
                    "Data directory {} already holds registry state; pass --force to replace it",
                    config.data_dir
                );
            }
            let snapshot = import_snapshot(Path::new(file), &config.registry)?;
            store.save_snapshot(&snapshot, SystemClock.now())?;
            println!(
                "Snapshot imported from {} ({} registrations)",
                file,
                snapshot.registrations.len()
            );
            Ok(())
        }
        _ => anyhow::bail!("unknown snapshot command"),
    }
}

fn export_snapshot(snapshot: &RegistrySnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}

/// Read a JSON export and check it loads into a registry built from `config`.
fn import_snapshot(path: &Path, config: &RegistryConfig) -> Result<RegistrySnapshot> {
    let data =
        fs::read(path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot: RegistrySnapshot =
        serde_json::from_slice(&data).context("snapshot file is not a registry export")?;
    let registry = NameRegistry::with_system_clock(config.clone())?;
    registry
        .restore(snapshot.clone())
        .context("snapshot is not a consistent registry state")?;
    Ok(snapshot)
}
