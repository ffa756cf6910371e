use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use gpupool_control::cluster::{ClusterAdapter, DockerCluster, SimulatedCluster, WorkloadOutcome};
use gpupool_control::config::ControlPlaneConfig;
use gpupool_control::shutdown::install_shutdown_handler;
use gpupool_control::ControlPlane;

#[derive(Parser, Debug)]
#[command(name = "gpupool-control")]
#[command(version)]
#[command(about = "Autoscaling control plane for a single GPU node pool")]
struct Args {
    /// Address to bind the HTTP API on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port for the HTTP API
    #[arg(long, env = "GPUPOOL_PORT", default_value = "5000")]
    port: u16,

    /// Name of the GPU node pool to manage
    #[arg(long, env = "GPU_NODEPOOL_NAME", default_value = "gpupool")]
    nodepool_name: String,

    /// VM size of the pool's nodes
    #[arg(long, env = "GPU_VM_SIZE", default_value = "Standard_NC6s_v3")]
    vm_size: String,

    /// Largest size the pool may be scaled to
    #[arg(long, env = "GPU_POOL_MAX_NODES", default_value = "10")]
    max_nodes: u32,

    /// Backend that owns the node pool and runs workloads
    #[arg(long, value_enum, default_value = "simulated")]
    substrate: Substrate,

    /// Container image for job workloads
    #[arg(long, env = "GPU_JOB_IMAGE")]
    image: Option<String>,

    /// Expose host GPUs to workload containers (docker substrate)
    #[arg(long)]
    gpus: bool,

    /// Seconds between reconcile ticks
    #[arg(long, default_value = "10")]
    reconcile_interval_secs: u64,

    /// Seconds a job may wait for capacity before it fails
    #[arg(long, default_value = "600")]
    provisioning_timeout_secs: u64,

    /// Seconds a simulated resize takes to land
    #[arg(long, default_value = "30")]
    sim_provisioning_delay_secs: u64,

    /// Seconds after which a simulated workload succeeds
    #[arg(long, default_value = "60")]
    sim_workload_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Substrate {
    /// In-memory node pool and workloads
    Simulated,
    /// Virtual node pool, workloads as local Docker containers
    Docker,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn build_config(args: &Args) -> ControlPlaneConfig {
    let interval = Duration::from_secs(args.reconcile_interval_secs);
    let mut config = ControlPlaneConfig::new(SocketAddr::new(args.host, args.port))
        .with_nodepool(args.nodepool_name.clone(), args.vm_size.clone())
        .with_max_nodes(args.max_nodes);

    config.reconciler.interval = interval;
    config.reconciler.health_staleness = config.reconciler.health_staleness.max(interval * 3);
    config.lifecycle.provisioning_timeout = Duration::from_secs(args.provisioning_timeout_secs);
    if let Some(image) = &args.image {
        config.workload.image = image.clone();
    }
    config.sandbox.gpus = args.gpus;
    config
}

fn build_cluster(args: &Args, config: &ControlPlaneConfig) -> Arc<dyn ClusterAdapter> {
    match args.substrate {
        Substrate::Simulated => Arc::new(
            SimulatedCluster::new(config.nodepool.name.clone(), config.nodepool.vm_size.clone())
                .with_quota(config.nodepool.max_nodes)
                .with_provisioning_delay(Duration::from_secs(args.sim_provisioning_delay_secs))
                .with_default_outcome(WorkloadOutcome::SucceedAfter(Duration::from_secs(
                    args.sim_workload_secs,
                ))),
        ),
        Substrate::Docker => Arc::new(DockerCluster::new(
            config.nodepool.clone(),
            config.sandbox.clone(),
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = build_config(&args);
    config.validate()?;

    tracing::info!(substrate = ?args.substrate, "Using cluster substrate");
    let cluster = build_cluster(&args, &config);

    let shutdown = install_shutdown_handler()?;
    ControlPlane::new(config, cluster).run(shutdown).await?;
    Ok(())
}
