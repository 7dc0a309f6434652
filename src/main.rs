use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use linode_ccm::config::{Config, LogFormat, RunArgs};
use linode_ccm::controller::{
    self, CidrAllocator, CiliumLoadBalancers, HealthChecker, InstanceResolver, LoadBalancers,
    NodeController, RouteController, ServiceDeletions, StopSignal, VpcResolver,
};
use linode_ccm::k8s::{ClusterClient, KubeClusterClient};
use linode_ccm::linode::{LinodeApi, LinodeClient};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers
    Run(RunArgs),
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("linode-ccm v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => {
            let config = Config::from_args(&run_args).context("invalid configuration")?;
            init_tracing(config.log_format);
            run(Arc::new(config)).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        region = %config.region,
        cluster = %config.cluster_name,
        "Starting linode-ccm"
    );

    let linode: Arc<dyn LinodeApi> = Arc::new(
        LinodeClient::new(&config.linode_url, &config.linode_token, config.api_timeout)
            .context("building Linode client")?,
    );
    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    info!("Connected to Kubernetes cluster");

    let vpcs = Arc::new(
        VpcResolver::init(linode.clone(), &config)
            .await
            .context("resolving VPC configuration")?,
    );
    let instances = Arc::new(InstanceResolver::new(
        linode.clone(),
        config.instance_cache_ttl,
    ));
    let cilium = Arc::new(CiliumLoadBalancers::new(
        linode.clone(),
        cluster.clone(),
        config.clone(),
        instances.clone(),
    ));
    let lbs = Arc::new(LoadBalancers::new(
        linode.clone(),
        cluster.clone(),
        config.clone(),
        vpcs.clone(),
        cilium.clone(),
    ));

    let stop = StopSignal::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    {
        let client = client.clone();
        let lbs = lbs.clone();
        let cluster = cluster.clone();
        let retry_interval = config.retry_interval;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = controller::run_controller(client, lbs, cluster, retry_interval).await
            {
                error!(error = %e, "LoadBalancer controller failed");
            }
        }));
    }

    let deletions = Arc::new(ServiceDeletions::new(lbs.clone(), config.retry_interval));
    tasks.push(tokio::spawn(deletions.run(client.clone())));

    let nodes = Arc::new(NodeController::new(
        linode.clone(),
        cluster.clone(),
        instances.clone(),
        cilium.clone(),
        &config.cluster_name,
        config.metadata_ttl,
        config.retry_interval,
    ));
    tasks.push(tokio::spawn(nodes.run(client.clone())));

    if config.allocate_node_cidrs {
        let allocator = Arc::new(
            CidrAllocator::init(cluster.clone(), &config)
                .await
                .context("initializing node CIDR allocator")?,
        );
        tasks.push(tokio::spawn(allocator.run(client.clone())));
    }

    if config.enable_route_controller && config.vpc_enabled() {
        let routes = Arc::new(RouteController::new(
            linode.clone(),
            cluster.clone(),
            vpcs.clone(),
            instances.clone(),
            config.cluster_cidr,
            config.routes_cache_ttl,
        ));
        tasks.push(tokio::spawn(routes.run()));
    }

    if let Some(period) = config.token_health_check_period {
        let checker = HealthChecker::new(linode.clone(), period, stop.clone());
        tasks.push(tokio::spawn(checker.run()));
    }

    #[cfg(feature = "rest-api")]
    {
        let state = Arc::new(linode_ccm::rest_api::ApiState { stop: stop.clone() });
        let addr = config.metrics_bind_address;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = linode_ccm::rest_api::run_server(addr, state).await {
                error!(error = %e, "REST API server failed");
            }
        }));
    }

    let interrupted = tokio::select! {
        _ = stop.wait() => false,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            stop.trigger();
            true
        }
    };

    for task in &tasks {
        task.abort();
    }
    if interrupted {
        info!("Interrupted, controllers stopped");
        Ok(())
    } else {
        warn!("Stop signal received, controllers stopped");
        anyhow::bail!("Linode API token was rejected")
    }
}
