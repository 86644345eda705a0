//! Tower middleware binding HTTP calls and their retries to a [`Gate`].
//!
//! [`GateLayer`] admits every request through the gate before it reaches the
//! transport, failing with [`Error::QueueFull`] when no slot turns up in
//! time. Placed inside the retry layer it gates each retry attempt as well,
//! so retry storms during an API outage are held to the same rate as
//! ordinary traffic. [`GatedRetry`] wraps the transport's retry policy and
//! never retries a [`Error::QueueFull`], which reaches the caller as is.
//!
//! ```ignore
//! ServiceBuilder::new()
//!     .layer(RetryLayer::new(GatedRetry::new(policy)))
//!     .layer(GateLayer::new(gate))
//!     .service(transport)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::retry::Policy;
use tower::{Layer, Service};

use crate::error::{BoxError, Error};
use crate::gate::Gate;

/// Retry policy wrapper for a gated service.
///
/// Defers to the inner policy, except that an attempt rejected by the gate
/// is never retried.
#[derive(Clone, Debug)]
pub struct GatedRetry<P> {
    inner: P,
}

impl<P> GatedRetry<P> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P, Req, Res> Policy<Req, Res, BoxError> for GatedRetry<P>
where
    P: Policy<Req, Res, BoxError>,
{
    type Future = P::Future;

    fn retry(&mut self, req: &mut Req, result: &mut Result<Res, BoxError>) -> Option<Self::Future> {
        if result.as_ref().is_err_and(is_queue_full) {
            return None;
        }

        self.inner.retry(req, result)
    }

    fn clone_request(&mut self, req: &Req) -> Option<Req> {
        self.inner.clone_request(req)
    }
}

fn is_queue_full(error: &BoxError) -> bool {
    matches!(error.downcast_ref::<Error>(), Some(Error::QueueFull { .. }))
}

/// Layer applying [`GateService`].
#[derive(Clone, Debug)]
pub struct GateLayer {
    gate: Arc<Gate>,
}

impl GateLayer {
    /// Creates a layer admitting requests through `gate`.
    #[must_use]
    pub fn new(gate: Arc<Gate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            gate: Arc::clone(&self.gate),
        }
    }
}

/// Service waiting on the gate before forwarding each request.
#[derive(Clone, Debug)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S, Req> Service<Req> for GateService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = Arc::clone(&self.gate);

        Box::pin(async move {
            gate.wait().await?;
            inner.call(req).await.map_err(Into::into)
        })
    }
}
