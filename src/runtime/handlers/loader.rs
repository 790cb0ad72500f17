//! Handler for plugin-loader plugins
//!
//! A loader plugin's bootstrap returns a new `PluginTypeHandler`; loading it
//! inserts that handler into the dispatch map, making its kind loadable from
//! then on. Unloading removes the kind again; plugins of that kind already
//! loaded stay loaded, but new loads of the kind fail until a handler
//! returns.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::dispatch::{LoadedHandle, PluginTypeHandler};
use crate::runtime::handlers::output_mismatch;
use crate::runtime::module_host::{BootstrapOutput, BootstrapPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

type HandlerMap = Arc<RwLock<HashMap<PluginKind, Arc<dyn PluginTypeHandler>>>>;

pub struct PluginLoaderHandler {
    handlers: HandlerMap,
    /// Which kind each loader plugin contributed, for removal at unload
    contributed: Mutex<HashMap<String, PluginKind>>,
}

impl PluginLoaderHandler {
    pub fn new(handlers: HandlerMap) -> Self {
        Self {
            handlers,
            contributed: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl PluginTypeHandler for PluginLoaderHandler {
    fn kind(&self) -> PluginKind {
        PluginKind::PluginLoader
    }

    fn generate_minimum_config(&self, _descriptor: &PluginDescriptor) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        payload: BootstrapPayload,
    ) -> Result<LoadedHandle> {
        let (kind, handler) = match payload.output {
            BootstrapOutput::Loader { kind, handler } => (kind, handler),
            other => return Err(output_mismatch(&descriptor.name, &self.kind(), other.kind_name())),
        };

        // Built-in kinds are not up for grabs.
        if !matches!(kind, PluginKind::Custom(_)) {
            return Err(PortalError::Initialization {
                plugin: descriptor.name.clone(),
                cause: format!("loader plugins cannot replace the built-in '{}' handler", kind),
            });
        }

        {
            let mut handlers = self.handlers.write().expect("handler lock poisoned");
            if handlers.contains_key(&kind) {
                return Err(PortalError::Initialization {
                    plugin: descriptor.name.clone(),
                    cause: format!("a handler for kind '{}' is already registered", kind),
                });
            }
            handlers.insert(kind.clone(), handler);
        }
        self.contributed
            .lock()
            .expect("contributed lock poisoned")
            .insert(descriptor.name.clone(), kind.clone());
        tracing::info!(plugin = %descriptor.name, kind = %kind, "Loader plugin contributed a type handler");

        Ok(LoadedHandle::new(descriptor.name.clone(), self.kind())
            .with_teardown(payload.teardown))
    }

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()> {
        let kind = self
            .contributed
            .lock()
            .expect("contributed lock poisoned")
            .remove(&handle.plugin);
        if let Some(kind) = kind {
            self.handlers
                .write()
                .expect("handler lock poisoned")
                .remove(&kind);
            tracing::info!(plugin = %handle.plugin, kind = %kind, "Contributed type handler withdrawn");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    struct StubHandler(PluginKind);

    #[async_trait::async_trait]
    impl PluginTypeHandler for StubHandler {
        fn kind(&self) -> PluginKind {
            self.0.clone()
        }

        fn generate_minimum_config(&self, _descriptor: &PluginDescriptor) -> serde_json::Value {
            json!({})
        }

        async fn load(
            &self,
            descriptor: &PluginDescriptor,
            _payload: BootstrapPayload,
        ) -> Result<LoadedHandle> {
            Ok(LoadedHandle::new(descriptor.name.clone(), self.0.clone()))
        }

        async fn unload(&self, _handle: &mut LoadedHandle) -> Result<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str) -> PluginDescriptor {
        PluginDescriptor {
            name: name.into(),
            kind: PluginKind::PluginLoader,
            bootstrap: "src/index".into(),
            default_config: json!({}),
            dependencies: Vec::new(),
            priority: 0,
            package_root: PathBuf::from("/plugins").join(name),
        }
    }

    fn loader_payload(kind: PluginKind) -> BootstrapPayload {
        BootstrapPayload {
            output: BootstrapOutput::Loader {
                kind: kind.clone(),
                handler: Arc::new(StubHandler(kind)),
            },
            teardown: None,
        }
    }

    fn empty_map() -> HandlerMap {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[tokio::test]
    async fn test_contributed_kind_becomes_loadable_then_withdrawn() {
        let map = empty_map();
        let handler = PluginLoaderHandler::new(Arc::clone(&map));
        let kind = PluginKind::Custom("cron-job".into());

        let mut handle = handler
            .load(&descriptor("cron-loader"), loader_payload(kind.clone()))
            .await
            .unwrap();
        assert!(map.read().unwrap().contains_key(&kind));

        handler.unload(&mut handle).await.unwrap();
        assert!(!map.read().unwrap().contains_key(&kind));
    }

    #[tokio::test]
    async fn test_builtin_kind_cannot_be_replaced() {
        let handler = PluginLoaderHandler::new(empty_map());
        let err = handler
            .load(&descriptor("rogue"), loader_payload(PluginKind::Service))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::Initialization { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_contribution_rejected() {
        let map = empty_map();
        let handler = PluginLoaderHandler::new(map);
        let kind = PluginKind::Custom("cron-job".into());

        handler
            .load(&descriptor("first"), loader_payload(kind.clone()))
            .await
            .unwrap();
        assert!(handler
            .load(&descriptor("second"), loader_payload(kind))
            .await
            .is_err());
    }
}
