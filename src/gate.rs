//! Admission control for Kubernetes API calls.
//!
//! The [`Gate`] lets one call through every `1 / rate` seconds. A background
//! task refills a single slot on that schedule; callers queue on the slot and
//! give up with [`Error::QueueFull`] once they have waited
//! `queue_capacity / rate` seconds.
//!
//! The gate can be paused for maintenance windows. While paused no caller is
//! admitted, up to [`GateConfig::pause_ceiling`] (15 minutes by default), after
//! which waiting callers proceed anyway so that a forgotten pause cannot wedge
//! a whole test run.
//!
//! # Example
//!
//! ```ignore
//! use k8s_ops_gate::{Gate, GateConfig};
//!
//! let gate = Gate::new(GateConfig::new(10.0, 1000))?;
//! gate.start();
//!
//! gate.wait().await?;
//! // issue the API call
//!
//! {
//!     let _pause = gate.pause_scope();
//!     // disruptive work, no API calls are admitted meanwhile
//! }
//!
//! gate.stop().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};

/// How long a caller waits for a paused gate before proceeding anyway.
pub const DEFAULT_PAUSE_CEILING: Duration = Duration::from_secs(15 * 60);

/// Configuration for the API call rate limiter.
#[derive(Clone, Debug, PartialEq)]
pub struct GateConfig {
    /// Admitted calls per second.
    pub rate: f64,

    /// Number of callers allowed to queue for a slot.
    pub queue_capacity: u32,

    /// Longest a caller waits for the gate to be resumed.
    pub pause_ceiling: Duration,
}

impl GateConfig {
    /// Creates a configuration admitting `rate` calls per second with room
    /// for `queue_capacity` waiting callers.
    #[must_use]
    pub fn new(rate: f64, queue_capacity: u32) -> Self {
        Self {
            rate,
            queue_capacity,
            pause_ceiling: DEFAULT_PAUSE_CEILING,
        }
    }

    /// Sets how long callers wait for a paused gate.
    #[must_use]
    pub fn pause_ceiling(mut self, ceiling: Duration) -> Self {
        self.pause_ceiling = ceiling;
        self
    }

    /// Interval between slot refills.
    #[must_use]
    pub fn slot_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.rate).unwrap_or(Duration::MAX)
    }

    /// Longest a caller queues for a slot before failing.
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from(self.queue_capacity) / self.rate)
            .unwrap_or(Duration::MAX)
    }

    fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(Error::Config(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }

        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }

        let slot_interval = Duration::try_from_secs_f64(1.0 / self.rate);
        let queue_timeout =
            Duration::try_from_secs_f64(f64::from(self.queue_capacity) / self.rate);

        match (slot_interval, queue_timeout) {
            (Ok(interval), Ok(timeout)) if !interval.is_zero() && !timeout.is_zero() => Ok(()),
            _ => Err(Error::Config(format!(
                "rate {} gives no usable slot interval for a queue of {}",
                self.rate, self.queue_capacity
            ))),
        }
    }
}

/// Shared API call rate limiter.
///
/// Clone the surrounding [`Arc`] to share one gate among any number of
/// callers; all of them are admitted against the same budget.
#[derive(Debug)]
pub struct Gate {
    config: GateConfig,
    slots: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Gate {
    /// Creates a gate with one slot available.
    ///
    /// Slots are only refilled after [`Gate::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the rate is not a positive number, if the
    /// queue capacity is zero, or if the slot interval or queue timeout
    /// derived from them is zero or too large for a [`Duration`].
    pub fn new(config: GateConfig) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            config,
            slots: Arc::new(Semaphore::new(1)),
            paused: watch::Sender::new(false),
            shutdown: watch::Sender::new(false),
            ticker: Mutex::new(None),
        }))
    }

    /// Returns the gate configuration.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Spawns the slot replenishment task. Calling it again is a no-op.
    ///
    /// The task ends on [`Gate::stop`] or when the gate is dropped.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        tracing::info!(
            "k8s API call rate limiter started: rate={}, queue_capacity={}",
            self.config.rate,
            self.config.queue_capacity
        );

        *ticker = Some(tokio::spawn(replenish(
            Arc::clone(&self.slots),
            self.config.slot_interval(),
            self.shutdown.subscribe(),
        )));
    }

    /// Waits until the caller is admitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if no slot became available within
    /// `queue_capacity / rate` seconds.
    pub async fn wait(&self) -> Result<()> {
        let resume_deadline = Instant::now().checked_add(self.config.pause_ceiling);
        let resumed = self.wait_resumed(resume_deadline).await;

        let waited = self.config.queue_timeout();
        match tokio::time::timeout(waited, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                // the slot is consumed; only the ticker hands out new ones
                permit.forget();
            }
            Ok(Err(_)) | Err(_) => {
                tracing::error!("k8s API call rate limiter queue size limit has been reached");
                return Err(Error::QueueFull { waited });
            }
        }

        // paused while queued: hold the slot until resumed
        if resumed {
            self.wait_resumed(resume_deadline).await;
        }

        Ok(())
    }

    /// Waits while the gate is paused, at most until `deadline`.
    ///
    /// Returns `false` if the deadline passed first.
    async fn wait_resumed(&self, deadline: Option<Instant>) -> bool {
        if !self.is_paused() {
            return true;
        }

        let mut paused = self.paused.subscribe();
        let resumed = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, paused.wait_for(|p| !*p))
                .await
                .is_ok(),
            None => paused.wait_for(|p| !*p).await.is_ok(),
        };

        if !resumed {
            tracing::warn!(
                "API calls paused for longer than {:?}, proceeding",
                self.config.pause_ceiling
            );
        }

        resumed
    }

    /// Stops admitting calls until [`Gate::resume`].
    pub fn pause(&self) {
        tracing::debug!("pausing k8s API calls");
        self.paused.send_replace(true);
    }

    /// Admits calls again after [`Gate::pause`].
    pub fn resume(&self) {
        tracing::debug!("resuming k8s API calls");
        self.paused.send_replace(false);
    }

    /// Pauses the gate until the returned guard is dropped.
    #[must_use = "the gate resumes as soon as the guard is dropped"]
    pub fn pause_scope(&self) -> PauseGuard<'_> {
        self.pause();
        PauseGuard { gate: self }
    }

    /// Returns whether the gate is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stops slot replenishment and waits for the task to finish.
    ///
    /// Safe to call more than once and from any task.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                tracing::warn!("rate limiter task ended abnormally: {e}");
            }
            tracing::info!("k8s API call rate limiter stopped");
        }
    }
}

/// Keeps a [`Gate`] paused while alive.
#[derive(Debug)]
pub struct PauseGuard<'a> {
    gate: &'a Gate,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.gate.resume();
    }
}

/// Tops up the single slot once per interval until shutdown.
async fn replenish(slots: Arc<Semaphore>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    // the initial slot covers the first interval
    let Some(first_refill) = Instant::now().checked_add(interval) else {
        let _ = shutdown.wait_for(|stop| *stop).await;
        return;
    };

    let mut ticks = tokio::time::interval_at(first_refill, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if slots.available_permits() == 0 {
                    slots.add_permits(1);
                }
            }
            // also fires when the gate has been dropped
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn config_timeouts() {
        let config = GateConfig::new(4.0, 10);

        assert_eq!(config.slot_interval(), Duration::from_millis(250));
        assert_eq!(config.queue_timeout(), Duration::from_millis(2500));
        assert_eq!(config.pause_ceiling, DEFAULT_PAUSE_CEILING);
    }

    #[test]
    fn config_rejects_bad_rate() {
        assert!(matches!(
            Gate::new(GateConfig::new(0.0, 10)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Gate::new(GateConfig::new(f64::NAN, 10)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn config_rejects_rates_without_usable_interval() {
        // 1 / rate overflows a Duration
        let tiny = GateConfig::new(1e-300, 10);
        assert!(matches!(Gate::new(tiny.clone()), Err(Error::Config(_))));
        assert_eq!(tiny.queue_timeout(), Duration::MAX);

        // 1 / rate rounds down to zero
        let huge = GateConfig::new(1e300, 1);
        assert!(matches!(Gate::new(huge.clone()), Err(Error::Config(_))));
        assert!(huge.slot_interval().is_zero());

        assert!(Gate::new(GateConfig::new(1e-6, 1)).is_ok());
        assert!(Gate::new(GateConfig::new(1e6, 1000)).is_ok());
    }

    #[test]
    fn config_rejects_empty_queue() {
        assert!(matches!(
            Gate::new(GateConfig::new(5.0, 0)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn admits_at_configured_rate() {
        let gate = Gate::new(GateConfig::new(10.0, 1000)).unwrap();
        gate.start();

        let start = Instant::now();
        let mut waiters = Vec::new();
        for _ in 0..30 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move {
                gate.wait().await.unwrap();
                Instant::now()
            }));
        }

        let mut done = Vec::new();
        for waiter in waiters {
            done.push(waiter.await.unwrap());
        }

        // at most ceil(rate * 1s) + 1 completions in any one-second window
        for &window_start in &done {
            let in_window = done
                .iter()
                .filter(|&&t| t >= window_start && t < window_start + Duration::from_secs(1))
                .count();
            assert!(in_window <= 11, "{in_window} calls admitted within one second");
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2900), "finished after {elapsed:?}");

        gate.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_refill_comes_one_interval_after_start() {
        let gate = Gate::new(GateConfig::new(2.0, 10)).unwrap();
        gate.start();

        let start = Instant::now();
        gate.wait().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        gate.wait().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));

        gate.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_when_no_slot_arrives() {
        let gate = Gate::new(GateConfig::new(1.0, 2)).unwrap();
        // not started: the initial slot is the only one

        gate.wait().await.unwrap();

        let start = Instant::now();
        let err = gate.wait().await.unwrap_err();

        assert!(matches!(err, Error::QueueFull { waited } if waited == Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_until_resume() {
        let gate = Gate::new(GateConfig::new(10.0, 100)).unwrap();
        gate.start();
        gate.pause();
        assert!(gate.is_paused());

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let admitted = Arc::clone(&admitted);
            tokio::spawn(async move {
                gate.wait().await.unwrap();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!admitted.load(Ordering::SeqCst));

        gate.resume();
        waiter.await.unwrap();
        assert!(admitted.load(Ordering::SeqCst));

        gate.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn caller_queued_before_pause_waits_for_resume() {
        let gate = Gate::new(GateConfig::new(1.0, 100)).unwrap();
        gate.start();
        gate.wait().await.unwrap();

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let admitted = Arc::clone(&admitted);
            tokio::spawn(async move {
                gate.wait().await.unwrap();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        // the waiter is queued for the next slot when the pause starts
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.pause();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!admitted.load(Ordering::SeqCst));

        gate.resume();
        waiter.await.unwrap();
        assert!(admitted.load(Ordering::SeqCst));

        gate.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_ceiling_lets_callers_through() {
        let gate = Gate::new(GateConfig::new(10.0, 100)).unwrap();
        gate.start();
        gate.pause();

        let start = Instant::now();
        gate.wait().await.unwrap();

        assert!(start.elapsed() >= DEFAULT_PAUSE_CEILING);
        assert!(gate.is_paused());

        gate.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_scope_resumes_on_early_return() {
        fn failing_maintenance(gate: &Gate) -> Result<()> {
            let _pause = gate.pause_scope();
            assert!(gate.is_paused());
            Err(Error::Config("maintenance failed".into()))
        }

        let gate = Gate::new(GateConfig::new(10.0, 100)).unwrap();

        assert!(failing_maintenance(&gate).is_err());
        assert!(!gate.is_paused());
        gate.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let gate = Gate::new(GateConfig::new(10.0, 100)).unwrap();
        gate.start();
        gate.start();

        let other = Arc::clone(&gate);
        tokio::spawn(async move { other.stop().await })
            .await
            .unwrap();
        gate.stop().await;

        // no refills after stop, so only the leftover slot remains
        let _ = gate.wait().await;
        assert!(matches!(gate.wait().await, Err(Error::QueueFull { .. })));
    }
}
