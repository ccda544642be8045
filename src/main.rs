use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vm_deployer::cli::{format_dry_run, Args, IpSource, LogFormat};
use vm_deployer::config::load_cluster_file;
use vm_deployer::hypervisor::{ProxmoxClient, ProxmoxConfig, TaskTracker};
use vm_deployer::metrics::DeployerMetrics;
use vm_deployer::network::{
    AddressResolver, IpDiscoverer, LeaseResolver, MikrotikClient, MikrotikConfig,
};
use vm_deployer::provisioning::{PipelineTimings, ProvisioningPipeline};
use vm_deployer::registration::TalosRegistrar;
use vm_deployer::reporting::TracingReporter;
use vm_deployer::scheduling::RandomSource;
use vm_deployer::server::{create_router, AppState};

fn init_logging(args: &Args) {
    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> &'a str {
    match value.as_deref().filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => {
            error!("{} is required", name);
            process::exit(1);
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested, cancelling in-flight requests");
    token.cancel();
}

#[tokio::main]
async fn main() {
    // Env fallbacks are resolved at parse time, so parse again once the
    // env file has been loaded
    let args = Args::parse();
    let env_loaded = match args.env_file {
        Some(ref env_file) => dotenvy::from_path(env_file).map_err(|e| (env_file.clone(), e)),
        None => {
            dotenvy::dotenv().ok();
            Ok(())
        }
    };
    let args = Args::parse();
    init_logging(&args);

    if let Err((env_file, e)) = env_loaded {
        error!("Failed to load env file {}: {}", env_file.display(), e);
        process::exit(1);
    }

    // Load and validate the topology
    let config_path = args.config_path();
    let cluster = match load_cluster_file(&config_path) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(
                "Failed to load cluster config {}: {}",
                config_path.display(),
                e
            );
            process::exit(1);
        }
    };

    if args.dry_run {
        println!("{}", format_dry_run(&cluster, &args));
        return;
    }

    let auth_token = required(&args.auth_token, "AUTH_TOKEN").to_string();
    let proxmox_config = ProxmoxConfig::new(
        required(&args.proxmox_base_addr, "PROXMOX_BASE_ADDR"),
        required(&args.proxmox_token, "PROXMOX_TOKEN"),
    )
    .with_verify_ssl(args.verify_ssl)
    .with_timeout(Duration::from_secs(args.api_timeout));

    if !args.verify_ssl {
        warn!("TLS certificate verification is disabled for the hypervisor API");
    }

    let hypervisor = match ProxmoxClient::new(proxmox_config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create hypervisor client: {}", e);
            process::exit(1);
        }
    };

    let timings = PipelineTimings::default();
    let tracker = TaskTracker::new(hypervisor.clone())
        .with_poll_interval(timings.task_poll_interval)
        .with_timeout(args.task_timeout());

    let resolver: Arc<dyn AddressResolver> = match args.ip_source {
        IpSource::GuestAgent => Arc::new(
            IpDiscoverer::new(hypervisor.clone())
                .with_interface(args.vm_interface.clone())
                .with_settings(timings.discovery),
        ),
        IpSource::DhcpLease => {
            let router = MikrotikConfig {
                address: required(&args.mikrotik_ip, "MIKROTIK_IP").to_string(),
                port: args.mikrotik_port,
                username: args.mikrotik_username.clone(),
                password: args.mikrotik_password.clone(),
                timeout: Duration::from_secs(args.api_timeout),
            };
            let leases = match MikrotikClient::new(router) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    error!("Failed to create DHCP lease client: {}", e);
                    process::exit(1);
                }
            };
            Arc::new(
                LeaseResolver::new(hypervisor.clone(), leases).with_settings(timings.discovery),
            )
        }
    };

    let registrar = TalosRegistrar::new(
        args.talos_machine_template(),
        args.talos_controlplane_endpoint.clone(),
    )
    .with_readiness(timings.readiness);

    let metrics = Arc::new(DeployerMetrics::new());
    let reporter = Arc::new(TracingReporter);
    let pipeline = ProvisioningPipeline::new(
        Arc::new(cluster),
        hypervisor,
        tracker,
        resolver,
        Arc::new(registrar),
    )
    .with_random(Arc::new(RandomSource::from_entropy()))
    .with_metrics(metrics)
    .with_reporter(reporter.clone())
    .with_reset_settle(timings.reset_settle);

    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::new(pipeline), auth_token)
        .with_reporter(reporter)
        .with_shutdown(shutdown.clone())
        .with_request_timeout(args.request_timeout());

    info!(
        "Loaded {} nodes and {} VM templates",
        state.pipeline.cluster().nodes.len(),
        state.pipeline.cluster().vm_templates.len()
    );

    let app = create_router(state);
    let addr = format!("{}:{}", args.listen_addr, args.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health-check   - Health check");
    info!("  GET  /metrics        - Prometheus metrics");
    info!("  POST /api/v1/create  - Create VMs");
    info!("  POST /api/v1/delete  - Delete a VM");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
    {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
