//! Live mapping of database pods to their IP addresses.
//!
//! The registry is fed `Endpoints` watch events. For every tracked pod it
//! keeps the current IP and the chronological list of IPs the pod had before.
//! A change of the current IP triggers the callbacks registered with the
//! [`Dispatcher`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use k8s_openapi::api::core::v1::Endpoints;
use kube::core::WatchEvent;
use parking_lot::Mutex;

use crate::dispatch::{Callback, CallbackId, CallbackTarget, Dispatcher};
use crate::error::{Error, Result};

/// Label keys every database pod endpoint carries.
pub const DEFAULT_REQUIRED_LABELS: [&str; 2] = ["scylla/datacenter", "scylla/rack"];

/// Identity of a tracked resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace of the resource.
    pub namespace: String,
    /// Name of the resource.
    pub name: String,
}

impl ResourceKey {
    /// Creates a key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Observed addresses of one resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressEntry {
    /// Latest observed IP, `None` until the first observation.
    pub current_ip: Option<String>,
    /// Previous IPs, oldest first.
    pub old_ips: Vec<String>,
}

impl AddressEntry {
    /// Records the first of `ips` that differs from the current IP.
    ///
    /// Returns the superseded IP, or `None` when nothing changed or when this
    /// was the first observation.
    fn observe<'a>(&mut self, ips: impl IntoIterator<Item = &'a str>) -> Option<String> {
        let ip = ips
            .into_iter()
            .find(|ip| self.current_ip.as_deref() != Some(*ip))?;

        let previous = self.current_ip.replace(ip.to_string())?;
        self.old_ips.push(previous.clone());
        Some(previous)
    }
}

/// An IP address change of a tracked resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpChange {
    /// The resource that changed.
    pub key: ResourceKey,
    /// IP before the change.
    pub previous: String,
    /// IP after the change.
    pub current: String,
}

/// Pod identity to address registry with change callbacks.
#[derive(Debug)]
pub struct Registry {
    required_labels: Vec<String>,
    entries: Mutex<HashMap<ResourceKey, AddressEntry>>,
    dispatcher: Dispatcher,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_LABELS)
    }
}

impl Registry {
    /// Creates a registry tracking endpoints that carry all `required_labels`.
    #[must_use]
    pub fn new<I, S>(required_labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_labels: required_labels.into_iter().map(Into::into).collect(),
            entries: Mutex::new(HashMap::new()),
            dispatcher: Dispatcher::new(),
        }
    }

    /// Registers callbacks to run after an IP change.
    ///
    /// `target` is either a resource name or [`CallbackTarget::Each`] (also
    /// spelled `"__each__"`) for every resource in `namespace`. Per-resource
    /// callbacks run before namespace-wide ones.
    pub fn register_callbacks(
        &self,
        namespace: &str,
        target: impl Into<CallbackTarget>,
        callbacks: impl IntoIterator<Item = Callback>,
        inject_resource_name: bool,
    ) -> Vec<CallbackId> {
        self.dispatcher
            .register(namespace, target, callbacks, inject_resource_name)
    }

    /// Removes a callback registration. Returns whether it existed.
    pub fn unregister(&self, id: CallbackId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Returns the callback dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Returns the entry of a resource, if it has been seen.
    #[must_use]
    pub fn entry(&self, key: &ResourceKey) -> Option<AddressEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns the current IP of a resource.
    #[must_use]
    pub fn current_ip(&self, namespace: &str, name: &str) -> Option<String> {
        self.entry(&ResourceKey::new(namespace, name))
            .and_then(|entry| entry.current_ip)
    }

    /// Returns a copy of the whole mapping.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ResourceKey, AddressEntry> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Applies a watch event and runs callbacks if an IP changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the event object has no namespace
    /// or name.
    pub fn handle_event(&self, event: &WatchEvent<Endpoints>) -> Result<Option<IpChange>> {
        match event {
            WatchEvent::Added(endpoints)
            | WatchEvent::Modified(endpoints)
            | WatchEvent::Deleted(endpoints) => {
                let change = self.observe(endpoints)?;

                if let Some(change) = &change {
                    self.dispatcher
                        .dispatch(&change.key.namespace, &change.key.name);
                }

                Ok(change)
            }

            WatchEvent::Bookmark(_) => Ok(None),

            WatchEvent::Error(e) => {
                tracing::warn!("watch stream reported an error: {e:?}");
                Ok(None)
            }
        }
    }

    /// Updates the mapping from an `Endpoints` object without running
    /// callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the object has no namespace or name.
    pub fn observe(&self, endpoints: &Endpoints) -> Result<Option<IpChange>> {
        let metadata = &endpoints.metadata;

        let namespace = metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::InvalidEvent("endpoints without a namespace".into()))?;

        // skips load balancer and headless endpoints that do not belong to a single pod
        let labeled = metadata.labels.as_ref().is_some_and(|labels| {
            self.required_labels
                .iter()
                .all(|key| labels.contains_key(key))
        });
        if !labeled {
            return Ok(None);
        }

        let name = metadata
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::InvalidEvent(format!("endpoints in namespace {namespace} without a name"))
            })?;

        let addresses = endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .map(|address| address.ip.as_str());

        let key = ResourceKey::new(namespace, name);
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();

        let Some(previous) = entry.observe(addresses) else {
            return Ok(None);
        };
        let current = entry.current_ip.clone().unwrap_or_default();

        tracing::info!(
            "'{key}' node has changed its pod IP address from '{previous}' to '{current}'. All old IPs: {}",
            entry.old_ips.join(", ")
        );

        Ok(Some(IpChange {
            key,
            previous,
            current,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    // Helper to create a database pod endpoint with the given addresses
    fn pod_endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [
                        ("app.kubernetes.io/name", "scylla"),
                        ("scylla/datacenter", "dc-1"),
                        ("scylla/rack", "kind"),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: (*ip).to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn counting(registry: &Registry, namespace: &str, target: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        registry.register_callbacks(
            namespace,
            target,
            [Callback::new("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })],
            false,
        );
        count
    }

    #[test]
    fn entry_first_observation_is_not_a_change() {
        let mut entry = AddressEntry::default();

        assert_eq!(entry.observe(["10.0.0.1"]), None);
        assert_eq!(entry.current_ip.as_deref(), Some("10.0.0.1"));
        assert!(entry.old_ips.is_empty());
    }

    #[test]
    fn entry_only_first_differing_address_counts() {
        let mut entry = AddressEntry {
            current_ip: Some("10.0.0.1".into()),
            old_ips: Vec::new(),
        };

        assert_eq!(
            entry.observe(["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            Some("10.0.0.1".into())
        );
        assert_eq!(entry.current_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(entry.old_ips, vec!["10.0.0.1"]);
    }

    #[test]
    fn ip_history_and_callback_count() {
        let registry = Registry::default();
        let calls = counting(&registry, "ns", "p1");

        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.2", "10.0.0.3"] {
            registry
                .handle_event(&WatchEvent::Modified(pod_endpoints("ns", "p1", &[ip])))
                .unwrap();
        }

        let entry = registry.entry(&ResourceKey::new("ns", "p1")).unwrap();
        assert_eq!(entry.current_ip.as_deref(), Some("10.0.0.3"));
        assert_eq!(entry.old_ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn change_is_reported() {
        let registry = Registry::default();
        registry
            .handle_event(&WatchEvent::Added(pod_endpoints("ns", "p1", &["10.0.0.1"])))
            .unwrap();

        let change = registry
            .handle_event(&WatchEvent::Modified(pod_endpoints("ns", "p1", &["10.0.0.9"])))
            .unwrap();

        assert_eq!(
            change,
            Some(IpChange {
                key: ResourceKey::new("ns", "p1"),
                previous: "10.0.0.1".into(),
                current: "10.0.0.9".into(),
            })
        );
        assert_eq!(registry.current_ip("ns", "p1").as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn callbacks_run_in_registration_order_then_wildcard() {
        let registry = Registry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = |label: &'static str| {
            let log = Arc::clone(&log);
            Callback::new(label, move |_| {
                log.lock().push(label);
                Ok(())
            })
        };

        registry.register_callbacks("ns", "__each__", [recorder("wildcard")], false);
        registry.register_callbacks("ns", "p1", [recorder("pod-1")], false);
        registry.register_callbacks("ns", "p1", [recorder("pod-2")], false);

        registry
            .handle_event(&WatchEvent::Added(pod_endpoints("ns", "p1", &["10.0.0.1"])))
            .unwrap();
        registry
            .handle_event(&WatchEvent::Modified(pod_endpoints("ns", "p1", &["10.0.0.2"])))
            .unwrap();

        assert_eq!(*log.lock(), vec!["pod-1", "pod-2", "wildcard"]);
    }

    #[test]
    fn events_without_required_labels_are_ignored() {
        let registry = Registry::default();
        let calls = counting(&registry, "ns", "__each__");

        let mut endpoints = pod_endpoints("ns", "scylla-client", &["10.0.0.1"]);
        endpoints.metadata.labels = Some(
            [("app.kubernetes.io/name".to_string(), "scylla".to_string())]
                .into_iter()
                .collect(),
        );

        assert_eq!(registry.handle_event(&WatchEvent::Added(endpoints.clone())).unwrap(), None);

        endpoints.metadata.labels = None;
        assert_eq!(registry.handle_event(&WatchEvent::Added(endpoints)).unwrap(), None);

        assert!(registry.snapshot().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_without_required_labels_leave_tracked_pods_alone() {
        let registry = Registry::default();
        let calls = counting(&registry, "ns", "p1");

        registry
            .handle_event(&WatchEvent::Added(pod_endpoints("ns", "p1", &["10.0.0.1"])))
            .unwrap();
        let before = registry.entry(&ResourceKey::new("ns", "p1")).unwrap();

        let mut unlabeled = pod_endpoints("ns", "p1", &["10.0.0.2"]);
        unlabeled.metadata.labels = None;
        assert_eq!(registry.handle_event(&WatchEvent::Modified(unlabeled)).unwrap(), None);

        assert_eq!(registry.entry(&ResourceKey::new("ns", "p1")).unwrap(), before);
        assert_eq!(registry.current_ip("ns", "p1").as_deref(), Some("10.0.0.1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_without_namespace_are_rejected() {
        let registry = Registry::default();
        let mut endpoints = pod_endpoints("ns", "p1", &["10.0.0.1"]);
        endpoints.metadata.namespace = None;

        let err = registry.handle_event(&WatchEvent::Added(endpoints)).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn events_without_addresses_create_empty_entry() {
        let registry = Registry::default();
        let mut endpoints = pod_endpoints("ns", "p1", &[]);
        endpoints.subsets = None;

        assert_eq!(registry.observe(&endpoints).unwrap(), None);
        assert_eq!(
            registry.entry(&ResourceKey::new("ns", "p1")),
            Some(AddressEntry::default())
        );
    }

    #[test]
    fn pods_are_tracked_independently() {
        let registry = Registry::default();

        registry.observe(&pod_endpoints("ns", "p1", &["10.0.0.1"])).unwrap();
        registry.observe(&pod_endpoints("ns", "p2", &["10.0.0.1"])).unwrap();
        registry.observe(&pod_endpoints("other", "p1", &["10.0.1.1"])).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot[&ResourceKey::new("other", "p1")].current_ip.as_deref(),
            Some("10.0.1.1")
        );
    }

    #[test]
    fn custom_required_labels() {
        let registry = Registry::new(["team"]);
        let mut endpoints = pod_endpoints("ns", "p1", &["10.0.0.1"]);

        assert_eq!(registry.observe(&endpoints).unwrap(), None);
        assert!(registry.snapshot().is_empty());

        endpoints
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("team".into(), "db".into());
        registry.observe(&endpoints).unwrap();
        assert_eq!(registry.current_ip("ns", "p1").as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn bookmark_events_are_ignored() {
        let registry = Registry::default();
        let bookmark: WatchEvent<Endpoints> = serde_json::from_str(
            r#"{"type":"BOOKMARK","object":{"kind":"Endpoints","apiVersion":"v1","metadata":{"resourceVersion":"12345"}}}"#,
        )
        .unwrap();

        assert_eq!(registry.handle_event(&bookmark).unwrap(), None);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn resource_key_display() {
        assert_eq!(
            ResourceKey::new("scylla", "sct-cluster-dc-1-kind-0").to_string(),
            "scylla/sct-cluster-dc-1-kind-0"
        );
    }
}
