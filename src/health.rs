//! Kubernetes API health probing for disruption tests.
//!
//! Chaos scenarios need to assert both that the API went down and that it
//! came back. The two checks tolerate flakiness differently: "stable" demands
//! every probe call to succeed, "not operational" only needs fewer than 80% of
//! them to.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::gate::GateConfig;

/// Probe calls per stability check.
pub const DEFAULT_STABLE_REQUESTS: u32 = 20;

/// Probe calls per non-operational check.
pub const DEFAULT_NOT_OPERATIONAL_REQUESTS: u32 = 10;

/// Default timeout for [`HealthProber::wait_until_stable`].
pub const DEFAULT_STABLE_TIMEOUT: Duration = Duration::from_secs(1200);

/// Default timeout for [`HealthProber::wait_until_not_operational`].
pub const DEFAULT_NOT_OPERATIONAL_TIMEOUT: Duration = Duration::from_secs(360);

/// A cheap, side-effect-free API call.
pub trait ApiProbe: Send + Sync {
    /// Issues one probe call.
    fn probe(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Health prober configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ProberConfig {
    /// Probe calls per stability check.
    pub stable_requests: u32,

    /// Probe calls per non-operational check.
    pub not_operational_requests: u32,

    /// Pause after a failed call during a non-operational check.
    pub failure_pause: Duration,

    /// Pause between two checks while waiting.
    pub poll_interval: Duration,

    /// Treat a non-operational wait that never converged as an error.
    pub strict: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            stable_requests: DEFAULT_STABLE_REQUESTS,
            not_operational_requests: DEFAULT_NOT_OPERATIONAL_REQUESTS,
            failure_pause: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            strict: false,
        }
    }
}

impl ProberConfig {
    /// Creates a configuration pausing one gate slot interval after failures.
    #[must_use]
    pub fn for_gate(gate: &GateConfig) -> Self {
        Self {
            failure_pause: gate.slot_interval(),
            ..Self::default()
        }
    }

    /// Sets whether an inconclusive non-operational wait is an error.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Sets the pause between checks.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Samples API responsiveness through an [`ApiProbe`].
#[derive(Debug)]
pub struct HealthProber<P> {
    probe: P,
    config: ProberConfig,
}

impl<P: ApiProbe> HealthProber<P> {
    /// Creates a prober.
    #[must_use]
    pub fn new(probe: P, config: ProberConfig) -> Self {
        Self { probe, config }
    }

    /// Returns the prober configuration.
    #[must_use]
    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Issues `requests` probe calls, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first probe failure.
    pub async fn check_stable(&self, requests: u32) -> Result<()> {
        for _ in 0..requests {
            self.probe.probe().await?;
        }

        Ok(())
    }

    /// Issues `requests` probe calls and reports whether fewer than 80% of
    /// them succeeded.
    pub async fn check_not_operational(&self, requests: u32) -> bool {
        let mut passed = 0_u32;

        for _ in 0..requests {
            match self.probe.probe().await {
                Ok(()) => passed += 1,
                Err(e) => {
                    tracing::trace!("API probe failed: {e}");
                    tokio::time::sleep(self.config.failure_pause).await;
                }
            }
        }

        f64::from(passed) < f64::from(requests) * 0.8
    }

    /// Waits until a stability check passes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProbeTimeout`] if no check passed within `timeout`.
    pub async fn wait_until_stable(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.check_stable(self.config.stable_requests).await {
                Ok(()) => {
                    tracing::info!("k8s API is stable");
                    return Ok(());
                }
                Err(e) => tracing::debug!("k8s API is not stable yet: {e}"),
            }

            if !self.pause_before(deadline).await {
                return Err(Error::ProbeTimeout {
                    probe: "stability",
                    timeout,
                });
            }
        }
    }

    /// Waits until a non-operational check reports the API as down.
    ///
    /// Returns `Ok(false)` if that did not happen within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProbeTimeout`] instead of `Ok(false)` when the
    /// prober is configured as strict.
    pub async fn wait_until_not_operational(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            if self
                .check_not_operational(self.config.not_operational_requests)
                .await
            {
                tracing::info!("k8s API is not operational");
                return Ok(true);
            }

            if !self.pause_before(deadline).await {
                if self.config.strict {
                    return Err(Error::ProbeTimeout {
                        probe: "non-operational",
                        timeout,
                    });
                }

                tracing::warn!("k8s API stayed operational for {timeout:?}");
                return Ok(false);
            }
        }
    }

    /// Sleeps one poll interval unless that would pass the deadline.
    async fn pause_before(&self, deadline: Instant) -> bool {
        if Instant::now() + self.config.poll_interval > deadline {
            return false;
        }

        tokio::time::sleep(self.config.poll_interval).await;
        true
    }
}
