//! Kubernetes client plumbing.
//!
//! Builds the gate-bound `kube` client used for all latency-sensitive API
//! calls and provides the kube-backed implementations of the probe and watch
//! traits.
//!
//! # How It Works
//!
//! 1. [`gated_client`] assembles a client whose requests each wait on the
//!    [`Gate`], and whose retries (429, 503 and 504 responses) back off and then
//!    wait on the gate as well, failing with a full queue like any request
//! 2. [`PodListProbe`] lists pods with that client to sample API health
//! 3. [`KubeWatchTransport`] streams `Endpoints` watch events across all
//!    namespaces, line by line
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_ops_gate::{Gate, GateConfig, HealthProber, ProberConfig, Registry, WatchConfig, WatchStreamReader};
//! use k8s_ops_gate::k8s::{gated_client, KubeWatchTransport, PodListProbe, RetryConfig};
//!
//! let gate = Gate::new(GateConfig::new(10.0, 1000))?;
//! gate.start();
//!
//! let config = kube::Config::infer().await?;
//! let client = gated_client(config.clone(), Arc::clone(&gate), &RetryConfig::default())?;
//!
//! let prober = HealthProber::new(PodListProbe::new(client), ProberConfig::for_gate(gate.config()));
//! prober.wait_until_stable(DEFAULT_STABLE_TIMEOUT).await?;
//!
//! let watch = WatchConfig::default();
//! let reader = WatchStreamReader::new(
//!     KubeWatchTransport::new(config, &watch)?,
//!     Arc::new(Registry::default()),
//!     watch,
//! );
//! reader.start();
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{AsyncBufReadExt, StreamExt};
use hyper_util::rt::TokioExecutor;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchParams};
use kube::client::ConfigExt;
use kube::client::retry::RetryPolicy;
use kube::{Api, Client, Config};
use parking_lot::Mutex;
use tower::buffer::BufferLayer;
use tower::retry::RetryLayer;
use tower::{BoxError, ServiceBuilder};

use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::health::ApiProbe;
use crate::retry::{GateLayer, GatedRetry};
use crate::watch::{LineStream, WatchConfig, WatchTransport};

/// Path of the cluster-wide `Endpoints` collection.
const ENDPOINTS_PATH: &str = "/api/v1/endpoints";

/// HTTP retry settings of the gated client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Backoff before the first retry, doubled on every further retry.
    pub backoff_factor: Duration,

    /// Upper bound of the backoff.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Creates retry settings.
    #[must_use]
    pub fn new(max_retries: u32, backoff_factor: Duration) -> Self {
        Self {
            max_retries,
            backoff_factor,
            ..Self::default()
        }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_factor, self.max_backoff, self.max_retries)
    }
}

/// Builds a client whose requests and retries are admitted through `gate`.
///
/// Must be called within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the TLS connector or the authentication layer cannot
/// be created from `config`.
pub fn gated_client(config: Config, gate: Arc<Gate>, retry: &RetryConfig) -> Result<Client> {
    let https = config.rustls_https_connector()?;

    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .layer(BufferLayer::new(1024))
        .layer(RetryLayer::new(GatedRetry::new(retry.policy())))
        // every attempt, retries included, waits for a slot here
        .layer(GateLayer::new(gate))
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, config.default_namespace))
}

/// Infers the cluster configuration and builds a [`gated_client`].
///
/// # Errors
///
/// Returns [`Error::Config`] if no configuration could be inferred, or any
/// error of [`gated_client`].
pub async fn infer_gated_client(gate: Arc<Gate>, retry: &RetryConfig) -> Result<Client> {
    let config = Config::infer()
        .await
        .map_err(|e| Error::Config(format!("cannot infer kubernetes config: {e}")))?;

    gated_client(config, gate, retry)
}

/// Probes the API by listing pods across all namespaces.
#[derive(Clone)]
pub struct PodListProbe {
    pods: Api<Pod>,
}

impl PodListProbe {
    /// Creates a probe issuing calls through `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            pods: Api::all(client),
        }
    }
}

impl ApiProbe for PodListProbe {
    async fn probe(&self) -> Result<()> {
        self.pods.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }
}

/// Streams `Endpoints` watch events of the whole cluster.
///
/// The watch connection bypasses the gate. After a failed open the client is
/// rebuilt from the original configuration, since forced connection failures
/// can leave stale authentication state behind.
pub struct KubeWatchTransport {
    config: Config,
    client: Mutex<Client>,
    params: WatchParams,
}

impl KubeWatchTransport {
    /// Creates a transport watching endpoints selected by `watch`.
    ///
    /// # Errors
    ///
    /// Returns an error if no client can be built from `config`.
    pub fn new(config: Config, watch: &WatchConfig) -> Result<Self> {
        let client = Client::try_from(config.clone())?;
        let params = WatchParams::default()
            .labels(&watch.label_selector)
            .timeout(watch.server_timeout);

        Ok(Self {
            config,
            client: Mutex::new(client),
            params,
        })
    }

    fn reset_client(&self) {
        match Client::try_from(self.config.clone()) {
            Ok(client) => *self.client.lock() = client,
            Err(e) => tracing::warn!("failed to rebuild kubernetes client: {e}"),
        }
    }
}

impl WatchTransport for KubeWatchTransport {
    async fn open(&self) -> Result<LineStream> {
        let request = kube::core::Request::new(ENDPOINTS_PATH)
            .watch(&self.params, "0")
            .map_err(|e| Error::Config(format!("invalid watch request: {e}")))?;

        let client = self.client.lock().clone();
        match client.request_stream(request).await {
            Ok(body) => Ok(body.lines().boxed()),
            Err(e) => {
                tracing::warn!("failed to open endpoints watch: {e}");
                self.reset_client();
                Err(Error::Connection(e.to_string()))
            }
        }
    }
}
