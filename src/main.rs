use anyhow::Context;
use clap::Parser;
use std::fs::{self, File};
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use egress::config::{self, ConnectMode, FetchMode, Settings};
use egress::connect::{self, ConnectorParts, RelayDialer, TcpDialer};
use egress::fetch::{self, DirectFetcher, RemoteFetcher};
use egress::geoip::{extract, GeoTable};
use egress::listener::{serve, HttpHandler};
use egress::metrics::Metrics;
use egress::protocol::{transform, TunnelCodec};
use egress::proxy::LocalProxy;
use egress::relay::{RelayEndpoints, RelayServer};
use egress::routing::{HostRoutingTable, RoutingPolicy};
use egress::tls::CertAuthority;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "egress")]
#[command(about = "A forward HTTP/HTTPS proxy that learns which hosts need a remote relay", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the local proxy
    Local {
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Relay base URL
        #[arg(long)]
        remote: Option<String>,
        /// Working directory for the routing file and certificates
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        fetch: Option<FetchMode>,
        #[arg(long, value_enum)]
        connect: Option<ConnectMode>,
        /// Create a root CA in the working directory if none exists
        #[arg(long)]
        init_ca: bool,
    },
    /// Run the relay
    Relay {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// GeoIP table tools
    Geoip {
        #[command(subcommand)]
        action: GeoipCommand,
    },
}

#[derive(Debug, clap::Subcommand)]
enum GeoipCommand {
    /// Build a range file from the GeoLite2 country CSVs
    Build {
        #[arg(long)]
        blocks: PathBuf,
        #[arg(long)]
        locations: PathBuf,
        #[arg(long, default_value = "CN")]
        country: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => config::load()?,
    };

    let _log_guard = egress::logging::init(&settings.logging, args.debug)?;

    match args.command {
        Command::Local {
            listen,
            remote,
            dir,
            fetch,
            connect,
            init_ca,
        } => {
            if let Some(listen) = listen {
                settings.local.listen = listen;
            }
            if let Some(remote) = remote {
                settings.local.remote = remote;
            }
            if let Some(dir) = dir {
                settings.local.work_dir = dir;
            }
            if let Some(fetch) = fetch {
                settings.local.fetch = fetch;
            }
            if let Some(connect) = connect {
                settings.local.connect = connect;
            }
            config::validate(&settings)?;
            run_local(settings, init_ca).await
        }
        Command::Relay { listen } => {
            if let Some(listen) = listen {
                settings.relay.listen = listen;
            }
            run_relay(settings).await
        }
        Command::Geoip {
            action:
                GeoipCommand::Build {
                    blocks,
                    locations,
                    country,
                    out,
                },
        } => build_geoip(&blocks, &locations, &country, &out),
    }
}

async fn run_local(settings: Settings, init_ca: bool) -> anyhow::Result<()> {
    let local = &settings.local;
    fs::create_dir_all(&local.work_dir)
        .with_context(|| format!("creating {}", local.work_dir.display()))?;

    let metrics = Arc::new(Metrics::new()?);
    let routing_by_geo = local.fetch == FetchMode::Smart
        || matches!(local.connect, ConnectMode::Smart | ConnectMode::Intercept);
    let geo = GeoTable::load_or_embedded(local.geoip_table.as_deref(), routing_by_geo)?;
    let table = HostRoutingTable::open(local.blocklist_path())?;
    info!(
        ranges = geo.len(),
        hosts = table.len(),
        path = %table.path().display(),
        "Routing state loaded"
    );
    let policy = Arc::new(RoutingPolicy::new(
        Arc::new(table),
        Arc::new(geo),
        metrics.clone(),
    ));

    let endpoints = RelayEndpoints::from_base(&local.remote)?;
    let codec = TunnelCodec::new(transform::from_secret(settings.relay.secret.as_deref()));

    let direct = Arc::new(DirectFetcher::new(local.direct_timeout(), metrics.clone())?);
    let remote = Arc::new(RemoteFetcher::new(
        endpoints.fetch.clone(),
        codec,
        local.relay_timeout(),
        metrics.clone(),
    )?);
    let fetcher = fetch::build(
        local.fetch,
        direct,
        remote,
        policy.clone(),
        local.max_replay_body_bytes,
    );

    let (ca_cert, ca_key) = (local.ca_cert_path(), local.ca_key_path());
    if init_ca {
        if ca_cert.exists() {
            info!(path = %ca_cert.display(), "CA already present");
        } else {
            CertAuthority::generate_root("egress local CA", &ca_cert, &ca_key)?;
            info!(path = %ca_cert.display(), "Created root CA; add it to your trust store");
        }
    }
    let authority = if local.connect == ConnectMode::Intercept {
        Some(Arc::new(CertAuthority::load(&ca_cert, &ca_key, local.cert_dir())?))
    } else {
        None
    };

    let connector = connect::build(
        local.connect,
        ConnectorParts {
            direct: Arc::new(TcpDialer::new(local.direct_timeout())),
            remote: Arc::new(RelayDialer::new(endpoints.connect, local.relay_timeout())?),
            policy,
            fetcher: fetcher.clone(),
            metrics: metrics.clone(),
            authority,
        },
    )?;

    info!(
        remote = %local.remote,
        fetch = ?local.fetch,
        connect = ?local.connect,
        "Starting local proxy"
    );
    let listener = TcpListener::bind(local.listen)
        .await
        .with_context(|| format!("binding {}", local.listen))?;
    let proxy = Arc::new(LocalProxy::new(fetcher, connector, metrics));
    run_until_shutdown(listener, proxy).await
}

async fn run_relay(settings: Settings) -> anyhow::Result<()> {
    let relay = &settings.relay;
    let codec = TunnelCodec::new(transform::from_secret(relay.secret.as_deref()));
    let server = Arc::new(RelayServer::new(codec, relay.dial_timeout())?);

    info!(listen = %relay.listen, "Starting relay");
    let listener = TcpListener::bind(relay.listen)
        .await
        .with_context(|| format!("binding {}", relay.listen))?;
    run_until_shutdown(listener, server).await
}

fn build_geoip(
    blocks: &Path,
    locations: &Path,
    country: &str,
    out: &Path,
) -> anyhow::Result<()> {
    let blocks_file =
        File::open(blocks).with_context(|| format!("opening {}", blocks.display()))?;
    let locations_file =
        File::open(locations).with_context(|| format!("opening {}", locations.display()))?;
    let table = extract::build_table(blocks_file, locations_file, country)?;

    let out_file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    extract::write_table(&table, BufWriter::new(out_file))?;
    info!(country, ranges = table.len(), path = %out.display(), "Wrote GeoIP table");
    Ok(())
}

async fn run_until_shutdown<H: HttpHandler>(
    listener: TcpListener,
    handler: Arc<H>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(serve(listener, handler, shutdown_rx));

    shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => info!("Graceful shutdown completed"),
        Ok(Ok(Err(e))) => error!(error = %e, "Listener failed"),
        Ok(Err(e)) => error!(error = %e, "Listener task panicked"),
        Err(_) => warn!("Shutdown timeout exceeded"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
