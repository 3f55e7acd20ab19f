// Copyright (c) 2026 Faultline Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use faultline_daemon::cache::SnapshotCache;
use faultline_daemon::config::{ClusterKey, ControllerConfig};
use faultline_daemon::criteria::{MaxDurationCriterion, TerminationCriterion};
use faultline_daemon::experiment::ExperimentStore;
use faultline_daemon::monitor::Monitor;
use faultline_daemon::refresher::Refresher;
use faultline_daemon::server::RuntimeStreamService;
use faultline_daemon::store::InMemoryExperimentStore;
use faultline_daemon::telemetry::Telemetry;
use faultline_protocol::pb::v2::runtime_discovery_service_server::RuntimeDiscoveryServiceServer as RuntimeDiscoveryV2Server;
use faultline_protocol::pb::v3::runtime_discovery_service_server::RuntimeDiscoveryServiceServer as RuntimeDiscoveryV3Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ClusterKeyArg {
    Cluster,
    Id,
}

impl From<ClusterKeyArg> for ClusterKey {
    fn from(value: ClusterKeyArg) -> Self {
        match value {
            ClusterKeyArg::Cluster => ClusterKey::Cluster,
            ClusterKeyArg::Id => ClusterKey::Id,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "faultline-daemon")]
#[command(about = "Faultline chaos-experiment controller and runtime discovery daemon")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen: String,

    #[arg(long, default_value = "127.0.0.1:9464")]
    metrics_listen: String,

    #[arg(long, default_value = "info")]
    log: String,

    /// Name of the runtime layer served to data-plane clients.
    #[arg(long, default_value = "rtds")]
    rtds_layer_name: String,

    #[arg(long, default_value_t = 5000)]
    cache_refresh_interval_ms: u64,

    #[arg(long, default_value = "fault.http")]
    ingress_fault_runtime_prefix: String,

    #[arg(long, default_value = "egress.fault.http")]
    egress_fault_runtime_prefix: String,

    /// Wrap served resources with this TTL and keep them alive with
    /// heartbeats. Requires --heartbeat-interval-ms.
    #[arg(long)]
    resource_ttl_ms: Option<u64>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Config type URLs considered by the monitor and the refresher.
    /// Defaults to the ingress and egress fault types.
    #[arg(long = "enabled-config-type")]
    enabled_config_types: Vec<String>,

    #[arg(long, default_value_t = 5000)]
    outer_loop_interval_ms: u64,

    #[arg(long, default_value_t = 1000)]
    per_experiment_check_interval_ms: u64,

    /// Cluster assumed for clients whose node metadata carries none.
    #[arg(long, default_value = "default")]
    default_cluster: String,

    /// Which node field identifies a client's cluster.
    #[arg(long, value_enum, default_value = "cluster")]
    cluster_key: ClusterKeyArg,

    #[arg(long, default_value_t = 60_000)]
    nonce_expiry_ms: u64,

    /// When set, running experiments older than this are terminated.
    #[arg(long)]
    max_experiment_duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log.clone()))
        .init();

    let defaults = ControllerConfig::default();
    let config = ControllerConfig {
        rtds_layer_name: args.rtds_layer_name,
        cache_refresh_interval: Duration::from_millis(args.cache_refresh_interval_ms),
        ingress_fault_runtime_prefix: args.ingress_fault_runtime_prefix,
        egress_fault_runtime_prefix: args.egress_fault_runtime_prefix,
        resource_ttl: args.resource_ttl_ms.map(Duration::from_millis),
        heartbeat_interval: args.heartbeat_interval_ms.map(Duration::from_millis),
        enabled_config_types: if args.enabled_config_types.is_empty() {
            defaults.enabled_config_types
        } else {
            args.enabled_config_types
        },
        outer_loop_interval: Duration::from_millis(args.outer_loop_interval_ms),
        per_experiment_check_interval: Duration::from_millis(
            args.per_experiment_check_interval_ms,
        ),
        default_cluster: args.default_cluster,
        cluster_key: args.cluster_key.into(),
        nonce_expiry: Duration::from_millis(args.nonce_expiry_ms),
    };
    config.validate()?;

    let addr: SocketAddr = args.listen.parse()?;
    let metrics_addr: SocketAddr = args.metrics_listen.parse()?;

    let telemetry = Telemetry::new();
    let _metrics_handle = Arc::new(telemetry.clone())
        .spawn_metrics_server(metrics_addr)
        .await?;

    let store: Arc<dyn ExperimentStore> = Arc::new(InMemoryExperimentStore::new());
    let cache = Arc::new(SnapshotCache::new());

    let mut criteria: Vec<Arc<dyn TerminationCriterion>> = Vec::new();
    if let Some(secs) = args.max_experiment_duration_secs {
        criteria.push(Arc::new(MaxDurationCriterion::new(Duration::from_secs(
            secs,
        ))));
    }

    let _refresher = Refresher::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        config.enabled_config_types.clone(),
        config.cache_refresh_interval,
        config.ingress_fault_runtime_prefix.clone(),
        config.egress_fault_runtime_prefix.clone(),
    )
    .spawn();

    let _monitor = Monitor::new(
        Arc::clone(&store),
        criteria,
        config.enabled_config_types.clone(),
        config.outer_loop_interval,
        config.per_experiment_check_interval,
        telemetry.clone(),
    )
    .spawn();

    tracing::info!(
        %addr,
        metrics_addr = %metrics_addr,
        layer = %config.rtds_layer_name,
        ttl_enabled = config.resource_ttl.is_some(),
        "starting runtime discovery server"
    );

    let service = RuntimeStreamService::new(config, cache, telemetry);

    tonic::transport::Server::builder()
        .add_service(RuntimeDiscoveryV3Server::new(service.clone()))
        .add_service(RuntimeDiscoveryV2Server::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
