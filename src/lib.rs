#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Rate-limited Kubernetes API access and pod IP change tracking for
//! disruptive cluster testing.
//!
//! Chaos tests against database clusters on Kubernetes hammer the API server
//! while deliberately breaking things. This crate keeps that traffic bounded
//! and lets the test harness react when a database pod comes back with a new
//! address.
//!
//! # Features
//!
//! - **Rate gate**: At most `rate` API calls per second, a bounded wait
//!   before a call is rejected, and a pause switch for planned API outages
//! - **Gated retries**: HTTP retries of the `kube` client back off and then
//!   wait on the same gate, so retries never exceed the rate bound
//! - **Health probing**: Decide whether the API is stable or down
//! - **IP change tracking**: A resilient `Endpoints` watch that records every
//!   pod's address history and runs registered callbacks on changes
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_ops_gate::{Callback, Gate, GateConfig, Registry, WatchConfig, WatchStreamReader};
//! use k8s_ops_gate::k8s::{KubeWatchTransport, RetryConfig, infer_gated_client};
//!
//! let gate = Gate::new(GateConfig::new(10.0, 1000))?;
//! gate.start();
//! let client = infer_gated_client(Arc::clone(&gate), &RetryConfig::default()).await?;
//!
//! let registry = Arc::new(Registry::default());
//! registry.register_callbacks(
//!     "scylla",
//!     "scylla-dc1-rack1-0",
//!     [Callback::new("reconfigure-monitor", |_| Ok(()))],
//!     false,
//! );
//!
//! let watch = WatchConfig::default();
//! let reader = WatchStreamReader::new(
//!     KubeWatchTransport::new(kube::Config::infer().await?, &watch)?,
//!     registry,
//!     watch,
//! );
//! reader.start();
//!
//! // run the disruption
//! let _paused = gate.pause_scope();
//! ```

pub mod dispatch;
pub mod error;
pub mod gate;
pub mod health;
pub mod k8s;
pub mod registry;
pub mod retry;
pub mod watch;

pub use dispatch::{Callback, CallbackContext, CallbackId, CallbackTarget, Dispatcher, EACH};
pub use error::{BoxError, Error, Result};
pub use gate::{Gate, GateConfig, PauseGuard};
pub use health::{ApiProbe, HealthProber, ProberConfig};
pub use registry::{AddressEntry, IpChange, Registry, ResourceKey};
pub use retry::{GateLayer, GateService, GatedRetry};
pub use watch::{ReconnectPolicy, WatchConfig, WatchStreamReader, WatchTransport};
