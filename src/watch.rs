//! Long-lived watch of database pod endpoints.
//!
//! The reader opens a streaming watch through a [`WatchTransport`], decodes one
//! JSON watch event per line and feeds it to the [`Registry`]. It runs for the
//! whole test duration:
//!
//! 1. **Connecting**: open the stream, retrying after
//!    [`ReconnectPolicy::pause`]. Opens are spaced at least
//!    [`WatchConfig::min_reopen_interval`] apart.
//! 2. **Streaming**: read and process lines in arrival order. A malformed line
//!    is logged and dropped.
//! 3. **Reconnecting**: a read error or the server closing the stream sends the
//!    reader back to connecting.
//!
//! Only [`WatchStreamReader::stop`] ends the loop. Stopping drops the active
//! stream, which unblocks a pending read.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Endpoints;
use kube::core::WatchEvent;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Selects the endpoints of database pods.
pub const DEFAULT_LABEL_SELECTOR: &str = "app.kubernetes.io/name=scylla";

/// Stream of raw watch lines.
pub type LineStream = BoxStream<'static, io::Result<String>>;

/// Opens watch streams.
pub trait WatchTransport: Send + Sync + 'static {
    /// Opens a new stream of newline-delimited watch events.
    fn open(&self) -> impl Future<Output = Result<LineStream>> + Send;
}

/// When and how often a failed operation is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Pause before the next attempt.
    pub pause: Duration,

    /// Consecutive failures tolerated, `None` for no limit.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Returns whether to retry after `failures` consecutive failures, the
    /// latest being `error`.
    #[must_use]
    pub fn should_retry(&self, failures: u32, error: &Error) -> bool {
        error.is_transient() && self.max_attempts.is_none_or(|max| failures < max)
    }
}

/// Watch stream reader configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// Label selector of the watched endpoints.
    pub label_selector: String,

    /// Server-side watch timeout in seconds.
    ///
    /// The API server ends the stream after this long and the reader
    /// reconnects. Kubernetes rejects values of 295 and above.
    pub server_timeout: u32,

    /// Retry policy for opening and reading the stream.
    pub reconnect: ReconnectPolicy,

    /// Minimum time between two stream opens.
    pub min_reopen_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            label_selector: DEFAULT_LABEL_SELECTOR.to_string(),
            server_timeout: 290,
            reconnect: ReconnectPolicy::default(),
            min_reopen_interval: Duration::from_secs(5),
        }
    }
}

impl WatchConfig {
    /// Sets the label selector.
    #[must_use]
    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = selector.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the minimum time between two stream opens.
    #[must_use]
    pub fn min_reopen_interval(mut self, interval: Duration) -> Self {
        self.min_reopen_interval = interval;
        self
    }
}

/// Background task tracking pod IP changes from a watch stream.
#[derive(Debug)]
pub struct WatchStreamReader<T> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    config: WatchConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: WatchTransport> WatchStreamReader<T> {
    /// Creates a reader feeding `registry` from `transport`.
    #[must_use]
    pub fn new(transport: T, registry: Arc<Registry>, config: WatchConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            registry,
            config,
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        }
    }

    /// Returns the registry fed by this reader.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Spawns the watch task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        self.shutdown.send_replace(false);

        let worker = Worker {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            shutdown: self.shutdown.subscribe(),
            last_open: None,
        };

        *task = Some(tokio::spawn(worker.run()));
    }

    /// Returns whether the watch task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the watch task and waits up to `timeout` for it to finish.
    ///
    /// Returns whether the task finished in time. Without a timeout it waits
    /// indefinitely.
    pub async fn stop(&self, timeout: Option<Duration>) -> bool {
        tracing::warn!("stopping pod IP change tracker");
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();
        let Some(task) = task else {
            return true;
        };

        let joined = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, task).await.ok(),
            None => Some(task.await),
        };

        match joined {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                tracing::warn!("pod IP change tracker ended abnormally: {e}");
                true
            }
            None => false,
        }
    }
}

/// State owned by the running watch task.
struct Worker<T> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    config: WatchConfig,
    shutdown: watch::Receiver<bool>,
    last_open: Option<Instant>,
}

impl<T: WatchTransport> Worker<T> {
    async fn run(mut self) {
        tracing::debug!(
            "starting pod IP change tracker for '{}'",
            self.config.label_selector
        );

        loop {
            let Some(stream) = self.connect().await else {
                break;
            };

            if !self.stream(stream).await {
                break;
            }
        }

        tracing::info!("pod IP change tracker has been stopped");
    }

    /// Opens a stream, retrying per the reconnect policy.
    ///
    /// Returns `None` when stopped or when the policy gives up.
    async fn connect(&mut self) -> Option<LineStream> {
        let mut failures = 0;

        loop {
            if let Some(last_open) = self.last_open {
                let next_open = last_open + self.config.min_reopen_interval;
                if !self.sleep_until(next_open).await {
                    return None;
                }
            }
            self.last_open = Some(Instant::now());

            let opened = tokio::select! {
                opened = self.transport.open() => opened,
                _ = self.shutdown.wait_for(|stop| *stop) => return None,
            };

            match opened {
                Ok(stream) => {
                    tracing::info!("watch stream opened");
                    return Some(stream);
                }
                Err(e) => {
                    failures += 1;
                    let e = match e {
                        Error::Connection(_) | Error::Config(_) => e,
                        other => Error::Connection(other.to_string()),
                    };

                    if !self.config.reconnect.should_retry(failures, &e) {
                        tracing::error!("giving up on opening the watch stream: {e}");
                        return None;
                    }

                    tracing::warn!("failed to open watch stream: {e}");
                    if !self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Processes lines until the stream fails or ends.
    ///
    /// Returns whether the reader should reconnect.
    async fn stream(&mut self, mut stream: LineStream) -> bool {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = self.shutdown.wait_for(|stop| *stop) => return false,
            };

            match next {
                Some(Ok(line)) => process_line(&self.registry, &line),

                Some(Err(e)) => {
                    let e = Error::Io(e);

                    if !self.config.reconnect.should_retry(1, &e) {
                        tracing::error!("giving up on reading the watch stream: {e}");
                        return false;
                    }

                    tracing::warn!("watch stream read failed, reconnecting: {e}");
                    // the failed stream is dropped before pausing
                    drop(stream);
                    return self.pause().await;
                }

                None => {
                    tracing::debug!("watch stream closed by the server, reconnecting");
                    return true;
                }
            }
        }
    }

    /// Sleeps for the policy pause. Returns `false` if stopped meanwhile.
    async fn pause(&mut self) -> bool {
        let deadline = Instant::now() + self.config.reconnect.pause;
        self.sleep_until(deadline).await
    }

    async fn sleep_until(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => true,
            _ = self.shutdown.wait_for(|stop| *stop) => false,
        }
    }
}

/// Decodes and applies one watch line.
///
/// Failures are logged and never interrupt the stream.
fn process_line(registry: &Registry, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    tracing::trace!("processing watch line: {line}");

    let result = serde_json::from_str::<WatchEvent<Endpoints>>(line)
        .map_err(Error::from)
        .and_then(|event| registry.handle_event(&event));

    if let Err(e) = result {
        tracing::warn!("failed to process watch line: {line}\nerr: {e}");
    }
}
