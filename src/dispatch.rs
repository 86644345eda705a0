//! Callbacks run when a tracked pod changes its IP address.
//!
//! Callbacks are registered per namespace, either for one resource or for
//! every resource in the namespace ([`CallbackTarget::Each`]). On a change the
//! resource's own callbacks run first, in registration order, followed by the
//! namespace-wide ones. A failing or panicking callback is logged and skipped;
//! it never stops the callbacks after it or the watch loop.
//!
//! Callbacks run synchronously on the task that processes the watch stream,
//! which is a tokio worker. They must not block; hand long or blocking
//! reconfiguration off with [`tokio::task::spawn_blocking`] or a channel.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{BoxError, Error};

/// Textual name of the namespace-wide target.
pub const EACH: &str = "__each__";

/// What a registration fires for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallbackTarget {
    /// Changes of the named resource only.
    Resource(String),
    /// Changes of any resource in the namespace.
    Each,
}

impl From<&str> for CallbackTarget {
    fn from(name: &str) -> Self {
        if name.is_empty() || name == EACH {
            Self::Each
        } else {
            Self::Resource(name.to_string())
        }
    }
}

impl From<String> for CallbackTarget {
    fn from(name: String) -> Self {
        if name.is_empty() || name == EACH {
            Self::Each
        } else {
            Self::Resource(name)
        }
    }
}

/// What a callback is told about the change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackContext<'a> {
    /// Namespace of the changed resource.
    pub namespace: &'a str,
    /// Name of the changed resource, set only for registrations that asked
    /// for it.
    pub resource_name: Option<&'a str>,
}

type Handler = dyn Fn(&CallbackContext<'_>) -> Result<(), BoxError> + Send + Sync;

/// A named reconfiguration handler.
///
/// Any arguments the handler needs are captured by the closure. The handler
/// runs on an async runtime thread and must return quickly.
#[derive(Clone)]
pub struct Callback {
    name: String,
    handler: Arc<Handler>,
}

impl Callback {
    /// Creates a callback.
    #[must_use]
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }

    /// Returns the name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Identifies a registration for [`Dispatcher::unregister`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// A registered callback.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Registration id.
    pub id: CallbackId,
    /// The handler.
    pub callback: Callback,
    /// Whether the handler receives the changed resource's name.
    pub inject_resource_name: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CallbackKey {
    namespace: String,
    target: CallbackTarget,
}

/// Ordered callback registrations keyed by namespace and target.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_id: AtomicU64,
    registrations: Mutex<HashMap<CallbackKey, Vec<Registration>>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callbacks` for `target` in `namespace`, keeping their order.
    ///
    /// With `inject_resource_name` each callback receives the name of the
    /// changed resource, which lets a namespace-wide registration act on
    /// pods that do not exist yet.
    pub fn register(
        &self,
        namespace: &str,
        target: impl Into<CallbackTarget>,
        callbacks: impl IntoIterator<Item = Callback>,
        inject_resource_name: bool,
    ) -> Vec<CallbackId> {
        let target = target.into();
        let new: Vec<Registration> = callbacks
            .into_iter()
            .map(|callback| Registration {
                id: CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                callback,
                inject_resource_name,
            })
            .collect();

        if new.is_empty() {
            tracing::warn!(
                "no callbacks provided, nothing to register (namespace={namespace}, target={target:?})"
            );
            return Vec::new();
        }

        let ids = new.iter().map(|r| r.id).collect();
        self.registrations
            .lock()
            .entry(CallbackKey {
                namespace: namespace.to_string(),
                target,
            })
            .or_default()
            .extend(new);

        ids
    }

    /// Removes a registration. Returns whether it existed.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut registrations = self.registrations.lock();

        for list in registrations.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }

        false
    }

    /// Returns the registrations that fire for a change of `resource` in
    /// `namespace`, in invocation order.
    #[must_use]
    pub fn registrations_for(&self, namespace: &str, resource: &str) -> Vec<Registration> {
        let registrations = self.registrations.lock();
        let lookup = |target: CallbackTarget| {
            registrations
                .get(&CallbackKey {
                    namespace: namespace.to_string(),
                    target,
                })
                .cloned()
                .unwrap_or_default()
        };

        let mut ordered = lookup(CallbackTarget::Resource(resource.to_string()));

        // pod-specific handlers registered namespace-wide go before the rest
        let mut each = lookup(CallbackTarget::Each);
        each.sort_by_key(|r| !r.inject_resource_name);
        ordered.extend(each);

        ordered
    }

    /// Runs every callback for a change of `resource` in `namespace`.
    ///
    /// Callbacks run one after another on the calling thread before this
    /// returns. Returns the number of callbacks that completed successfully.
    pub fn dispatch(&self, namespace: &str, resource: &str) -> usize {
        // no lock is held while callbacks run, so they may register more
        let registrations = self.registrations_for(namespace, resource);

        let mut succeeded = 0;
        for registration in &registrations {
            match invoke(registration, namespace, resource) {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    tracing::warn!(
                        "callback call failed (namespace={namespace}, pod_name={resource}): {e}"
                    );
                }
            }
        }

        succeeded
    }
}

fn invoke(registration: &Registration, namespace: &str, resource: &str) -> Result<(), Error> {
    let callback = &registration.callback;
    let context = CallbackContext {
        namespace,
        resource_name: registration.inject_resource_name.then_some(resource),
    };

    tracing::debug!(
        "calling '{}' callback (namespace={namespace}, pod_name={resource})",
        callback.name()
    );

    let message = match panic::catch_unwind(AssertUnwindSafe(|| (callback.handler)(&context))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };

    Err(Error::Callback {
        name: callback.name().to_string(),
        message,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
