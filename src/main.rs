use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetplane::config::{parse_network_flag, OperatorConfig, SeedConfig};
use fleetplane::controller::{
    cbsl_sync, ipam, CbslSyncController, IpamController, KubeEventRecorder, MigrationRegistry,
    SeedCluster,
};
use fleetplane::crd::{ClusterBackupStorageLocation, Machine};
use fleetplane::leader::{holder_identity, LeaderElector};
use fleetplane::store::{KubeStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show what the controllers currently manage
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator configuration file (TOML)
    #[arg(long, env = "FLEETPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Operator namespace, holds the leader lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Controllers to run
    #[arg(
        long,
        env = "FLEETPLANE_CONTROLLERS",
        value_delimiter = ',',
        default_value = "ipam,cbsl-sync"
    )]
    controllers: Vec<String>,

    /// Address for /health, /readyz and /metrics
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION")]
    leader_election: bool,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Kubeconfig of the user cluster whose Machines get addresses
    #[arg(long, env = "USER_KUBECONFIG")]
    user_kubeconfig: Option<PathBuf>,

    /// Extra IPAM network as cidr,gateway[,dns...]; may be repeated
    #[arg(long = "network")]
    networks: Vec<String>,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace of the master backup storage locations
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("fleetplane-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = fleetplane::telemetry::init_telemetry(&registry)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

/// Client for a kubeconfig file, or the ambient configuration when absent
async fn client_for(kubeconfig: Option<&Path>, context: Option<&str>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .context("failed to create Kubernetes client");
    };
    let raw = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let options = KubeConfigOptions {
        context: context.map(String::from),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(raw, &options)
        .await
        .with_context(|| format!("invalid kubeconfig {}", path.display()))?;
    Client::try_from(config).context("failed to create Kubernetes client")
}

async fn seed_clusters(master: &Client, seeds: &[SeedConfig]) -> anyhow::Result<Vec<SeedCluster>> {
    let mut clusters = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let client = match &seed.kubeconfig {
            Some(path) => client_for(Some(path), seed.context.as_deref())
                .await
                .with_context(|| format!("seed {}", seed.name))?,
            None => master.clone(),
        };
        clusters.push(SeedCluster::new(
            &seed.name,
            Arc::new(KubeStore::<ClusterBackupStorageLocation>::new(client.clone())),
            Arc::new(KubeStore::<Secret>::new(client)),
        ));
        info!(seed = %seed.name, "Registered seed");
    }
    Ok(clusters)
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let locations =
        KubeStore::<ClusterBackupStorageLocation>::namespaced(client.clone(), &args.namespace);
    let items = locations.list(Some(&args.namespace)).await?;
    println!("Backup storage locations in {}: {}", args.namespace, items.len());
    for location in &items {
        println!("  {} ({})", location.name_any(), location.sync_phase());
    }

    let machines = KubeStore::<Machine>::new(client);
    let waiting = machines
        .list(None)
        .await?
        .iter()
        .filter(|m| ipam::needs_network(m))
        .count();
    println!("Machines waiting for an address: {}", waiting);
    println!("Built-in addon migrations: {}", MigrationRegistry::builtin().len());
    Ok(())
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json)?;
    info!("Starting fleetplane-operator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };
    for flag in &args.networks {
        config.ipam.networks.push(parse_network_flag(flag)?);
    }
    config.validate()?;

    for name in &args.controllers {
        if name != ipam::CONTROLLER_NAME && name != cbsl_sync::CONTROLLER_NAME {
            bail!("unknown controller {name:?}");
        }
    }

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let controllers_started = Arc::new(AtomicBool::new(false));
    let elector = args
        .leader_election
        .then(|| Arc::new(LeaderElector::new(client.clone(), &args.namespace, &holder_identity())));
    let is_leader = match &elector {
        Some(elector) => elector.is_leader(),
        None => Arc::new(AtomicBool::new(true)),
    };

    #[cfg(feature = "rest-api")]
    {
        let state = Arc::new(fleetplane::rest_api::ApiState {
            controllers: args.controllers.clone(),
            controllers_started: Arc::clone(&controllers_started),
            is_leader: Arc::clone(&is_leader),
        });
        let addr = args.metrics_addr;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = fleetplane::rest_api::run_server(addr, state, cancel).await {
                error!("HTTP server error: {}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.metrics_addr;

    if let Some(elector) = &elector {
        {
            let elector = Arc::clone(elector);
            let cancel = cancel.clone();
            tokio::spawn(async move { elector.run(cancel).await });
        }
        info!("Waiting for leadership");
        if !elector.wait_for_leadership(&cancel).await {
            fleetplane::telemetry::shutdown_telemetry();
            return Ok(());
        }
        // a replica that lost the lease must stop reconciling
        let is_leader = Arc::clone(&is_leader);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !is_leader.load(Ordering::Relaxed) {
                            warn!("Leadership lost, stopping controllers");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    let backoff = config.queue_backoff();
    let mut handles: Vec<JoinHandle<fleetplane::Result<()>>> = Vec::new();

    if args.controllers.iter().any(|c| c == ipam::CONTROLLER_NAME) {
        let user_client = match &args.user_kubeconfig {
            Some(path) => client_for(Some(path), None).await?,
            None => client.clone(),
        };
        let controller = Arc::new(IpamController::new(
            Arc::new(KubeStore::<Machine>::new(user_client.clone())),
            Arc::new(KubeEventRecorder::new(user_client, "fleetplane-ipam")),
            config.ipam_options()?,
        ));
        if config.ipam.networks.is_empty() {
            warn!("IPAM controller has no networks configured, every allocation will fail");
        }
        handles.push(tokio::spawn(controller.controller(backoff).run(cancel.clone())));
    }

    if args.controllers.iter().any(|c| c == cbsl_sync::CONTROLLER_NAME) {
        let options = config.sync_options();
        let (master, master_secrets) = match &options.namespace {
            Some(ns) => (
                KubeStore::<ClusterBackupStorageLocation>::namespaced(client.clone(), ns),
                KubeStore::<Secret>::namespaced(client.clone(), ns),
            ),
            None => (
                KubeStore::<ClusterBackupStorageLocation>::new(client.clone()),
                KubeStore::<Secret>::new(client.clone()),
            ),
        };
        let seeds = seed_clusters(&client, &config.sync.seeds).await?;
        if seeds.is_empty() {
            warn!("No seeds configured, locations will only get finalizers and status");
        }
        let controller = Arc::new(CbslSyncController::new(
            Arc::new(master),
            Arc::new(master_secrets),
            seeds,
            Arc::new(KubeEventRecorder::new(client.clone(), "fleetplane-cbsl-sync")),
            options,
        ));
        handles.push(tokio::spawn(
            controller
                .controller(config.controller.workers, backoff)
                .run(cancel.clone()),
        ));
    }

    controllers_started.store(true, Ordering::Relaxed);
    info!(controllers = ?args.controllers, "Controllers running");

    let mut result = Ok(());
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Controller failed: {}", e);
                result = Err(e.into());
            }
            Err(e) => {
                error!("Controller task panicked: {}", e);
                result = Err(e.into());
            }
        }
    }

    // Flush any remaining traces
    fleetplane::telemetry::shutdown_telemetry();

    result
}
