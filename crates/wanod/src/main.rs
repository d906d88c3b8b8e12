// # wanod - WAN Orchestrator Daemon
//
// Thin integration layer around wano-core. The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering plugins
// 4. Building the store and the reachability probe
// 5. Running the orchestrator until SIGTERM/SIGINT
//
// All provisioning logic lives in wano-core and the plugin crates.
//
// ## Configuration
//
// An optional JSON file given by `WANO_CONFIG` provides the base
// configuration; environment variables override it.
//
// ### Interfaces
// - `WANO_INTERFACES`: Space-separated uplink interfaces (e.g. "eth0 eth1")
// - `WANO_IFTYPE`: Interface type of those interfaces (default: eth)
//
// ### Pipeline
// - `WANO_PLUGIN_TIMEOUT_MS`: Per-plugin timeout
// - `WANO_RETRY_BASE_MS`: Base of the exponential retry backoff
// - `WANO_RETRY_CAP`: Backoff exponent clamp
//
// ### Reachability probe
// - `WANO_PROBE`: `dns` (default) or `none` to accept every link
// - `WANO_PROBE_TARGET`: Host name resolved to verify a link (unset: no probing)
// - `WANO_PROBE_RESOLVERS`: Comma-separated resolver addresses
//   (default: read from resolv.conf)
//
// ### Store
// The daemon drives the in-memory store; built-in interfaces are brought up
// with carrier.
// - `WANO_WAN_CONFIG`: JSON array of WAN configuration rows to seed
// - `WANO_DHCP_LEASE`: Address handed out to DHCP clients
//
// ### Logging
// - `WANO_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```bash
// export WANO_INTERFACES="eth0 eth1"
// export WANO_WAN_CONFIG=/etc/wano/wan.json
// export WANO_PROBE_TARGET=connectivity.example.net
//
// wanod
// ```

use anyhow::{Context, Result};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use wano_core::traits::{AlwaysReachable, ReachabilityProbe};
use wano_core::{DnsProbe, MemoryConfigStore, Orchestrator, PluginRegistry, WanoConfig};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum WanoExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<WanoExitCode> for ExitCode {
    fn from(code: WanoExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// How links are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Dns,
    /// Accept every provisioned link
    Disabled,
}

impl FromStr for ProbeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dns" => Ok(ProbeKind::Dns),
            "none" => Ok(ProbeKind::Disabled),
            other => anyhow::bail!(
                "WANO_PROBE '{}' is not supported. Supported probes: dns, none",
                other
            ),
        }
    }
}

/// Daemon configuration
struct Config {
    core: WanoConfig,
    probe: ProbeKind,
    wan_seed: Option<PathBuf>,
    dhcp_lease: Option<Ipv4Addr>,
    log_level: String,
}

/// Parse an optional environment variable
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} '{}' is not valid: {}", name, raw, e)),
        _ => Ok(None),
    }
}

/// Parse a comma-separated list of addresses
fn parse_addr_list(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .with_context(|| format!("Invalid resolver address '{}'", s))
        })
        .collect()
}

fn parse_log_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

impl Config {
    /// Load configuration from the optional JSON base and environment variables
    fn from_env() -> Result<Self> {
        let mut core = match env::var("WANO_CONFIG") {
            Ok(path) if !path.is_empty() => WanoConfig::from_file(&path)
                .with_context(|| format!("Failed to load WANO_CONFIG {}", path))?,
            _ => WanoConfig::new(),
        };

        if let Ok(interfaces) = env::var("WANO_INTERFACES") {
            core.builtin_interfaces = interfaces;
        }
        if let Ok(iftype) = env::var("WANO_IFTYPE") {
            core.builtin_iftype = iftype;
        }
        if let Some(timeout) = env_parse("WANO_PLUGIN_TIMEOUT_MS")? {
            core.pipeline.plugin_timeout_ms = timeout;
        }
        if let Some(base) = env_parse("WANO_RETRY_BASE_MS")? {
            core.pipeline.retry_base_ms = base;
        }
        if let Some(cap) = env_parse("WANO_RETRY_CAP")? {
            core.pipeline.retry_cap = cap;
        }
        if let Ok(target) = env::var("WANO_PROBE_TARGET") {
            core.probe.target = Some(target).filter(|t| !t.is_empty());
        }
        if let Ok(resolvers) = env::var("WANO_PROBE_RESOLVERS") {
            core.probe.resolvers = parse_addr_list(&resolvers)?;
        }

        Ok(Self {
            core,
            probe: env_parse("WANO_PROBE")?.unwrap_or(ProbeKind::Dns),
            wan_seed: env::var("WANO_WAN_CONFIG")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            dhcp_lease: env_parse("WANO_DHCP_LEASE")?,
            log_level: env::var("WANO_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.core.validate()?;

        if self.core.builtin_interfaces().is_empty() {
            anyhow::bail!(
                "WANO_INTERFACES must name at least one interface. \
                Set it via: export WANO_INTERFACES=\"eth0\""
            );
        }

        if let Some(path) = &self.wan_seed
            && !path.exists()
        {
            anyhow::bail!("WANO_WAN_CONFIG file does not exist: {}", path.display());
        }

        if parse_log_level(&self.log_level).is_none() {
            anyhow::bail!(
                "WANO_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            );
        }

        Ok(())
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return WanoExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return WanoExitCode::ConfigError.into();
    }

    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return WanoExitCode::ConfigError.into();
    }

    info!("Starting wanod daemon");
    info!(
        "Configuration loaded: interfaces [{}]",
        config.core.builtin_interfaces().join(" ")
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return WanoExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            WanoExitCode::RuntimeError
        } else {
            WanoExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until SIGTERM/SIGINT
async fn run_daemon(config: Config) -> Result<()> {
    #[allow(unused_mut)]
    let mut registry = PluginRegistry::new();

    #[cfg(feature = "builtin-plugins")]
    {
        info!("Registering built-in plugins");
        wano_plugins::register(&mut registry);
    }

    if registry.is_empty() {
        warn!("No plugins registered, interfaces will never be provisioned");
    }
    for descriptor in registry.iter() {
        debug!(
            "Plugin {} (priority {}, mask {:#x})",
            descriptor.name(),
            descriptor.priority(),
            descriptor.mask()
        );
    }

    let store = MemoryConfigStore::new();
    if let Some(path) = &config.wan_seed {
        let count = store
            .load_wan_seed(path)
            .await
            .with_context(|| format!("Failed to load WAN configuration {}", path.display()))?;
        info!("Seeded {} WAN configuration row(s)", count);
    }
    store.set_dhcp_lease(config.dhcp_lease).await;
    for ifname in config.core.builtin_interfaces() {
        store.set_carrier(&ifname, true).await;
    }

    let probe: Arc<dyn ReachabilityProbe> = match config.probe {
        ProbeKind::Dns => {
            if config.core.probe.target.is_none() {
                warn!("WANO_PROBE_TARGET not set, the DNS probe accepts every link");
            }
            Arc::new(DnsProbe::new(config.core.probe.clone()))
        }
        ProbeKind::Disabled => {
            warn!("Reachability probing disabled, every provisioned link is accepted");
            Arc::new(AlwaysReachable)
        }
    };

    let (orchestrator, mut events) =
        Orchestrator::new(config.core, registry, Arc::new(store), probe)?;

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!("Event: {:?}", event);
        }
    });

    info!("Starting orchestrator");
    orchestrator.run().await?;

    if let Err(e) = event_log.await {
        warn!("Event log task failed: {}", e);
    }
    info!("Shutting down daemon");

    Ok(())
}
