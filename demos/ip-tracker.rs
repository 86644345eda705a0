//! Pod IP change tracker example.
//!
//! Waits until the Kubernetes API is stable, then watches database pod
//! endpoints across all namespaces and logs every IP change. Kubernetes API
//! calls go through a rate gate shared with the retrying client.
//!
//! # Running
//!
//! Uses the in-cluster configuration or the local kubeconfig.
//!
//! # Environment Variables
//!
//! - `API_CALL_RATE`: Admitted API calls per second (default: 10)
//! - `API_QUEUE_SIZE`: Callers allowed to queue for the gate (default: 1000)
//! - `LABEL_SELECTOR`: Endpoints to watch (default: app.kubernetes.io/name=scylla)
//! - `WATCH_NAMESPACE`: Namespace whose pods get the logging callback (default: scylla)
//! - `RUN_SECONDS`: Stop after this many seconds (default: until Ctrl-C)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use k8s_ops_gate::health::DEFAULT_STABLE_TIMEOUT;
use k8s_ops_gate::k8s::{KubeWatchTransport, PodListProbe, RetryConfig, gated_client};
use k8s_ops_gate::{
    Callback, Gate, GateConfig, HealthProber, ProberConfig, Registry, WatchConfig,
    WatchStreamReader,
};
use tokio::time::sleep;
use tracing::{Level, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let rate: f64 = env::var("API_CALL_RATE")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(10.0);
    let queue_size: u32 = env::var("API_QUEUE_SIZE")
        .ok()
        .and_then(|q| q.parse().ok())
        .unwrap_or(1000);
    let namespace = env::var("WATCH_NAMESPACE").unwrap_or_else(|_| "scylla".to_string());
    let run_for = env::var("RUN_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs);

    let mut watch = WatchConfig::default();
    if let Ok(selector) = env::var("LABEL_SELECTOR") {
        watch = watch.label_selector(selector);
    }

    info!("API call rate: {rate}/s, queue size: {queue_size}");

    let gate = Gate::new(GateConfig::new(rate, queue_size))?;
    gate.start();

    let config = kube::Config::infer().await?;
    let client = gated_client(config.clone(), Arc::clone(&gate), &RetryConfig::default())?;

    let prober = HealthProber::new(PodListProbe::new(client), ProberConfig::for_gate(gate.config()));
    info!("Waiting for the k8s API to become stable...");
    prober.wait_until_stable(DEFAULT_STABLE_TIMEOUT).await?;

    let registry = Arc::new(Registry::default());
    registry.register_callbacks(
        &namespace,
        k8s_ops_gate::EACH,
        [Callback::new("log-ip-change", |ctx| {
            let pod = ctx.resource_name.unwrap_or("?");
            info!("pod {}/{pod} changed its IP address", ctx.namespace);
            Ok(())
        })],
        true,
    );

    let reader = WatchStreamReader::new(KubeWatchTransport::new(config, &watch)?, registry, watch);
    reader.start();

    match run_for {
        Some(duration) => sleep(duration).await,
        None => tokio::signal::ctrl_c().await?,
    }

    info!("\n=== Tracked pods ===");
    for (key, entry) in reader.registry().snapshot() {
        info!(
            "{key}: {} (previously: {:?})",
            entry.current_ip.as_deref().unwrap_or("-"),
            entry.old_ips
        );
    }

    if !reader.stop(Some(Duration::from_secs(5))).await {
        warn!("watch task did not finish in time");
    }

    gate.stop().await;

    Ok(())
}
