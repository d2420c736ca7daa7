mod handlers;
mod state;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use nsd_exporter_core::collector::{ControlTransport, StatsCollector};
use nsd_exporter_core::config::MetricConfig;
use nsd_exporter_core::control::{
    ClientOptions, ControlClient, DaemonKind, Endpoint, TlsFiles, endpoint_from_config,
};
use nsd_exporter_core::exposition::Exporter;
use nsd_exporter_core::resolve::Resolver;

use state::AppState;

// ============================================================
// CLI
// ============================================================

#[derive(Parser, Debug)]
#[command(
    name = "nsd_exporter",
    about = "Prometheus exporter for NSD and Unbound statistics",
    version = nsd_exporter_core::VERSION
)]
struct Args {
    /// Address to serve metrics on. ":8080" listens on all interfaces.
    #[arg(long, default_value = ":8080", env = "NSD_EXPORTER_LISTEN_ADDRESS")]
    listen_address: String,

    /// Path under which metrics are exposed.
    #[arg(long, default_value = "/metrics", env = "NSD_EXPORTER_METRIC_PATH")]
    metric_path: String,

    /// Metric mapping file. Empty uses the built-in mapping for NSD 4.x.
    #[arg(long, default_value = "", env = "NSD_EXPORTER_METRIC_CONFIG")]
    metric_config: String,

    /// Daemon configuration to autodetect the control channel from.
    /// Defaults to /etc/nsd/nsd.conf or /etc/unbound/unbound.conf by --type.
    /// Ignored when --nsd-address, --cert, --key or --ca is given.
    #[arg(long, env = "NSD_EXPORTER_CONFIG_FILE")]
    config_file: Option<String>,

    /// Daemon to scrape: nsd or unbound. Also the metric namespace.
    #[arg(long = "type", default_value = "nsd", env = "NSD_EXPORTER_TYPE")]
    daemon_type: DaemonKind,

    /// Client certificate file.
    #[arg(long, env = "NSD_EXPORTER_CERT")]
    cert: Option<String>,

    /// Client key file (PKCS#8 PEM).
    #[arg(long, env = "NSD_EXPORTER_KEY")]
    key: Option<String>,

    /// Server certificate / CA file.
    #[arg(long, env = "NSD_EXPORTER_CA")]
    ca: Option<String>,

    /// Control channel address: host[:port] or an absolute Unix socket path.
    #[arg(long, env = "NSD_EXPORTER_NSD_ADDRESS")]
    nsd_address: Option<String>,

    /// Control channel timeout in seconds.
    #[arg(long, default_value = "5", env = "NSD_EXPORTER_TIMEOUT")]
    timeout: u64,

    /// Do not verify the daemon's certificate.
    #[arg(long, env = "NSD_EXPORTER_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        error!("exporter failed: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["nsd_exporter", "nsd_exporter_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let addr = parse_listen_address(&args.listen_address)?;
    check_metric_path(&args.metric_path)?;
    let kind = args.daemon_type;
    info!(version = nsd_exporter_core::VERSION, %kind, "starting");

    // Collector construction talks to the daemon; do it before the runtime exists.
    let exporter = build_exporter(&args)?;
    let state = AppState::new(exporter, kind, &args.metric_path);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(addr, router(state)))
}

fn build_exporter(args: &Args) -> anyhow::Result<Exporter<Box<dyn ControlTransport>>> {
    let kind = args.daemon_type;
    let config = MetricConfig::load(&args.metric_config).with_context(|| {
        if args.metric_config.is_empty() {
            "failed to load built-in metric config".to_string()
        } else {
            format!("failed to load metric config {}", args.metric_config)
        }
    })?;
    info!(
        exact = config.static_metric_count(),
        patterns = config.pattern_metrics().len(),
        "metric config loaded"
    );

    let endpoint = control_endpoint(args)?;
    if args.timeout == 0 {
        bail!("--timeout must be at least 1 second");
    }
    let options = ClientOptions {
        timeout: Duration::from_secs(args.timeout),
        insecure_skip_verify: args.insecure_skip_verify,
    };
    if options.insecure_skip_verify {
        warn!("server certificate verification disabled");
    }
    let client = ControlClient::new(kind, endpoint, options)
        .context("failed to set up control client")?;
    info!(endpoint = %client.endpoint(), "control channel configured");

    let transport: Box<dyn ControlTransport> = Box::new(client);
    let collector = StatsCollector::new(transport, Resolver::new(Arc::new(config), kind.as_str()))
        .with_context(|| format!("failed to reach {kind}"))?;
    info!(descriptors = collector.cache().len(), "initial scrape done");

    Exporter::new(collector).context("failed to register exporter metrics")
}

/// Control endpoint from flags when any connection flag is set, otherwise
/// from the daemon configuration file.
fn control_endpoint(args: &Args) -> anyhow::Result<Endpoint> {
    let cert = non_empty(&args.cert);
    let key = non_empty(&args.key);
    let ca = non_empty(&args.ca);
    let address = non_empty(&args.nsd_address);

    if cert.is_none() && key.is_none() && ca.is_none() && address.is_none() {
        let path = Path::new(daemon_config_path(args));
        return endpoint_from_config(path, args.daemon_type)
            .with_context(|| format!("failed to autodetect control channel from {}", path.display()));
    }

    let Some(address) = address else {
        bail!("--nsd-address is required when --cert, --key or --ca is given");
    };
    if address.starts_with('/') {
        if cert.is_some() || key.is_some() || ca.is_some() {
            warn!(address, "certificates are not used for a Unix socket");
        }
        return Endpoint::parse(address, None).map_err(anyhow::Error::msg);
    }

    let (Some(cert), Some(key), Some(ca)) = (cert, key, ca) else {
        bail!("--cert, --key, --ca and --nsd-address must be set together");
    };
    let tls = TlsFiles {
        ca: ca.into(),
        key: key.into(),
        cert: cert.into(),
    };
    Endpoint::parse(address, Some(tls)).map_err(anyhow::Error::msg)
}

/// `--config-file`, or the standard location for the selected daemon.
fn daemon_config_path(args: &Args) -> &str {
    non_empty(&args.config_file).unwrap_or(args.daemon_type.default_config_path())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Accepts `host:port`, `ip:port` and `:port` (all interfaces).
fn parse_listen_address(address: &str) -> anyhow::Result<SocketAddr> {
    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in listen address '{address}'"))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    address
        .to_socket_addrs()
        .with_context(|| format!("invalid listen address '{address}'"))?
        .next()
        .with_context(|| format!("listen address '{address}' resolved to nothing"))
}

fn check_metric_path(path: &str) -> anyhow::Result<()> {
    if !path.starts_with('/') {
        bail!("metric path '{path}' must start with '/'");
    }
    if path == "/" || path == "/health" {
        bail!("metric path '{path}' collides with a built-in route");
    }
    Ok(())
}

// ============================================================
// HTTP
// ============================================================

fn router(state: AppState) -> Router {
    let metric_path = state.metric_path.to_string();
    Router::new()
        .route("/", get(handlers::handle_landing))
        .route("/health", get(handlers::handle_health))
        .route(&metric_path, get(handlers::handle_metrics))
        .with_state(state)
        .layer(CompressionLayer::new())
}

async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
