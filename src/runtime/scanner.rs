//! Remote registry scanner
//!
//! Polls remote endpoints for plugin advertisements at the well-known
//! descriptor path and diffs each response against what it saw last time,
//! emitting added / updated / removed events. The scanner only observes and
//! reports; acting on an event is the runtime's job.
//!
//! A remote plugin's identity is `endpoint#name`, so the same plugin name
//! advertised by two endpoints is two distinct plugins. One endpoint failing
//! never aborts the cycle and never fabricates removal events for the
//! plugins it advertised before.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::{self, PluginDescriptor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Well-known path probed on every endpoint
pub const WELL_KNOWN_PATH: &str = "/.well-known/portal-plugins.json";

/// Change observed at a remote endpoint
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added {
        identity: String,
        descriptor: PluginDescriptor,
    },
    /// Same identity, different advertisement content
    Updated {
        identity: String,
        descriptor: PluginDescriptor,
    },
    Removed {
        identity: String,
        name: String,
    },
}

/// Fetches one endpoint's advertisement document.
///
/// A seam for tests; production uses `HttpSource`.
#[async_trait::async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value>;
}

/// HTTP source backed by a shared reqwest client
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PortalError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), WELL_KNOWN_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PortalError::Network(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(PortalError::Network(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PortalError::Network(format!("{}: invalid JSON: {}", url, e)))
    }
}

struct KnownPlugin {
    name: String,
    fingerprint: String,
}

/// Periodic scanner over a fixed set of endpoints
pub struct RemoteRegistryScanner {
    source: Arc<dyn RemoteSource>,
    endpoints: Vec<String>,
    poll_interval: Duration,
    cancel: CancellationToken,
    known: Mutex<HashMap<String, KnownPlugin>>,
}

impl RemoteRegistryScanner {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        endpoints: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            endpoints,
            poll_interval,
            cancel: CancellationToken::new(),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the poll loop. Events flow into `sink` until `stop` is called
    /// or the receiving side goes away. Cancellation also aborts a sweep
    /// already in flight; shutdown never waits out a slow endpoint.
    pub fn start(self: Arc<Self>, sink: mpsc::Sender<WatchEvent>) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Remote registry scanner stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let events = tokio::select! {
                            _ = cancel.cancelled() => {
                                tracing::info!("Remote registry scanner stopped mid-sweep");
                                break;
                            }
                            events = self.scan_once() => events,
                        };
                        for event in events {
                            if sink.send(event).await.is_err() {
                                tracing::warn!("Watch event sink closed; stopping scanner");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One poll cycle over every endpoint.
    ///
    /// Endpoint failures are logged and skipped; the endpoint's previously
    /// seen plugins stay known, so a transient outage does not churn the
    /// registry with remove/add pairs.
    pub async fn scan_once(&self) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        for endpoint in &self.endpoints {
            match self.source.fetch(endpoint).await {
                Ok(document) => {
                    events.extend(self.diff_endpoint(endpoint, document).await);
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Remote registry probe failed");
                }
            }
        }
        events
    }

    async fn diff_endpoint(&self, endpoint: &str, document: serde_json::Value) -> Vec<WatchEvent> {
        let current = match parse_advertisements(endpoint, document) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Invalid advertisement document");
                return Vec::new();
            }
        };

        let mut known = self.known.lock().await;
        let mut events = Vec::new();
        let prefix = identity(endpoint, "");

        for (id, fingerprint, descriptor) in &current {
            match known.get(id) {
                None => events.push(WatchEvent::Added {
                    identity: id.clone(),
                    descriptor: descriptor.clone(),
                }),
                Some(prev) if &prev.fingerprint != fingerprint => {
                    events.push(WatchEvent::Updated {
                        identity: id.clone(),
                        descriptor: descriptor.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        let current_ids: std::collections::HashSet<&str> =
            current.iter().map(|(id, _, _)| id.as_str()).collect();
        for (id, plugin) in known.iter() {
            if id.starts_with(&prefix) && !current_ids.contains(id.as_str()) {
                events.push(WatchEvent::Removed {
                    identity: id.clone(),
                    name: plugin.name.clone(),
                });
            }
        }

        // Commit the new view of this endpoint.
        known.retain(|id, _| !id.starts_with(&prefix));
        for (id, fingerprint, descriptor) in current {
            known.insert(
                id,
                KnownPlugin {
                    name: descriptor.name,
                    fingerprint,
                },
            );
        }
        events
    }
}

fn identity(endpoint: &str, name: &str) -> String {
    format!("{}#{}", endpoint.trim_end_matches('/'), name)
}

/// Parse one advertisement document into (identity, fingerprint, descriptor)
/// triples. Entries are validated against the same manifest schema as local
/// plugins; an invalid entry fails the whole document, matching manifest
/// ingestion semantics.
fn parse_advertisements(
    endpoint: &str,
    mut document: serde_json::Value,
) -> Result<Vec<(String, String, PluginDescriptor)>> {
    // Advertisement entries may carry fields the manifest schema forbids;
    // they contribute to the fingerprint, then come off before validation.
    let mut fingerprints = Vec::new();
    if let Some(plugins) = document
        .get_mut("plugins")
        .and_then(serde_json::Value::as_array_mut)
    {
        for entry in plugins.iter_mut() {
            fingerprints.push(fingerprint(entry));
            if let Some(object) = entry.as_object_mut() {
                object.remove("version");
                object.remove("packageRoot");
            }
        }
    }

    let origin = format!("{}{}", endpoint.trim_end_matches('/'), WELL_KNOWN_PATH);
    let descriptors = descriptor::normalize(Path::new(&origin), document)?;

    Ok(descriptors
        .into_iter()
        .zip(fingerprints)
        .map(|(descriptor, fingerprint)| {
            let id = identity(endpoint, &descriptor.name);
            (id, fingerprint, descriptor)
        })
        .collect())
}

/// Content hash over an advertisement entry, for change detection
fn fingerprint(entry: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(entry).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubSource {
        responses: Mutex<HashMap<String, serde_json::Value>>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
            }
        }

        async fn set(&self, endpoint: &str, document: serde_json::Value) {
            self.responses
                .lock()
                .await
                .insert(endpoint.to_string(), document);
        }
    }

    #[async_trait::async_trait]
    impl RemoteSource for StubSource {
        async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value> {
            self.responses
                .lock()
                .await
                .get(endpoint)
                .cloned()
                .ok_or_else(|| PortalError::Network(format!("{}: connection refused", endpoint)))
        }
    }

    fn entry(name: &str, priority: i32) -> serde_json::Value {
        json!({
            "name": name,
            "type": "service",
            "bootstrap": "src/index",
            "priority": priority,
        })
    }

    const EP: &str = "http://plugins.internal:9000";

    fn scanner(source: Arc<StubSource>) -> RemoteRegistryScanner {
        RemoteRegistryScanner::new(source, vec![EP.to_string()], Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_first_scan_emits_added() {
        let source = Arc::new(StubSource::new());
        source
            .set(EP, json!({ "plugins": [entry("a", 0), entry("b", 0)] }))
            .await;

        let scanner = scanner(Arc::clone(&source));
        let events = scanner.scan_once().await;
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, WatchEvent::Added { .. })));
    }

    #[tokio::test]
    async fn test_diff_detects_update_add_and_remove() {
        let source = Arc::new(StubSource::new());
        source
            .set(EP, json!({ "plugins": [entry("a", 0), entry("b", 0)] }))
            .await;
        let scanner = scanner(Arc::clone(&source));
        scanner.scan_once().await;

        // {a, b} becomes {b (changed), c}: a removed, b updated, c added.
        source
            .set(EP, json!({ "plugins": [entry("b", 9), entry("c", 0)] }))
            .await;
        let events = scanner.scan_once().await;

        let mut added = 0;
        let mut updated = 0;
        let mut removed = 0;
        for event in &events {
            match event {
                WatchEvent::Added { descriptor, .. } => {
                    assert_eq!(descriptor.name, "c");
                    added += 1;
                }
                WatchEvent::Updated { descriptor, .. } => {
                    assert_eq!(descriptor.name, "b");
                    assert_eq!(descriptor.priority, 9);
                    updated += 1;
                }
                WatchEvent::Removed { name, .. } => {
                    assert_eq!(name, "a");
                    removed += 1;
                }
            }
        }
        assert_eq!((added, updated, removed), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unchanged_advertisement_is_silent() {
        let source = Arc::new(StubSource::new());
        source.set(EP, json!({ "plugins": [entry("a", 0)] })).await;

        let scanner = scanner(Arc::clone(&source));
        scanner.scan_once().await;
        assert!(scanner.scan_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_failure_does_not_fabricate_removals() {
        let source = Arc::new(StubSource::new());
        source.set(EP, json!({ "plugins": [entry("a", 0)] })).await;
        let scanner = scanner(Arc::clone(&source));
        scanner.scan_once().await;

        // Endpoint goes dark: no events, and nothing forgotten.
        source.responses.lock().await.clear();
        assert!(scanner.scan_once().await.is_empty());

        // It comes back unchanged: still no events.
        source.set(EP, json!({ "plugins": [entry("a", 0)] })).await;
        assert!(scanner.scan_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_name_on_two_endpoints_is_two_identities() {
        let source = Arc::new(StubSource::new());
        let other = "http://plugins-b.internal:9000";
        source.set(EP, json!({ "plugins": [entry("a", 0)] })).await;
        source
            .set(other, json!({ "plugins": [entry("a", 0)] }))
            .await;

        let scanner = RemoteRegistryScanner::new(
            Arc::clone(&source) as Arc<dyn RemoteSource>,
            vec![EP.to_string(), other.to_string()],
            Duration::from_secs(60),
        );
        let events = scanner.scan_once().await;
        assert_eq!(events.len(), 2);
        let identities: Vec<&str> = events
            .iter()
            .map(|e| match e {
                WatchEvent::Added { identity, .. } => identity.as_str(),
                _ => panic!("expected added"),
            })
            .collect();
        assert_ne!(identities[0], identities[1]);
    }

    #[tokio::test]
    async fn test_invalid_document_skipped() {
        let source = Arc::new(StubSource::new());
        source
            .set(EP, json!({ "plugins": [{ "name": "broken" }] }))
            .await;

        let scanner = scanner(Arc::clone(&source));
        assert!(scanner.scan_once().await.is_empty());
    }

    /// Source whose fetch never completes, standing in for a hung endpoint.
    struct StalledSource;

    #[async_trait::async_trait]
    impl RemoteSource for StalledSource {
        async fn fetch(&self, _endpoint: &str) -> Result<serde_json::Value> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_stop_aborts_in_flight_sweep() {
        let scanner = Arc::new(RemoteRegistryScanner::new(
            Arc::new(StalledSource) as Arc<dyn RemoteSource>,
            vec![EP.to_string()],
            Duration::from_millis(1),
        ));

        let (tx, _rx) = mpsc::channel(16);
        let handle = Arc::clone(&scanner).start(tx);

        // Let the first tick start a sweep that will never finish on its own.
        tokio::time::sleep(Duration::from_millis(20)).await;
        scanner.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scanner did not stop while a sweep was in flight")
            .unwrap();
    }

    #[tokio::test]
    async fn test_scanner_stops_on_cancel() {
        let source = Arc::new(StubSource::new());
        source.set(EP, json!({ "plugins": [] })).await;
        let scanner = Arc::new(RemoteRegistryScanner::new(
            Arc::clone(&source) as Arc<dyn RemoteSource>,
            vec![EP.to_string()],
            Duration::from_millis(10),
        ));

        let (tx, mut rx) = mpsc::channel(16);
        let handle = Arc::clone(&scanner).start(tx);
        scanner.stop();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
