//! Handler for service plugins

use crate::core::error::Result;
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::dispatch::{LoadedHandle, PluginTypeHandler, ServiceRegistry};
use crate::runtime::handlers::output_mismatch;
use crate::runtime::module_host::{BootstrapOutput, BootstrapPayload};
use std::sync::Arc;

/// Publishes a service plugin's capabilities into the service registry
pub struct ServiceHandler {
    services: Arc<ServiceRegistry>,
}

impl ServiceHandler {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }
}

#[async_trait::async_trait]
impl PluginTypeHandler for ServiceHandler {
    fn kind(&self) -> PluginKind {
        PluginKind::Service
    }

    fn generate_minimum_config(&self, _descriptor: &PluginDescriptor) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        payload: BootstrapPayload,
    ) -> Result<LoadedHandle> {
        let services = match payload.output {
            BootstrapOutput::Service { services } => services,
            other => return Err(output_mismatch(&descriptor.name, &self.kind(), other.kind_name())),
        };

        // Drop anything a previous install of this plugin published, so a
        // reload never leaves orphaned names behind.
        self.services.remove_plugin(&descriptor.name).await;

        let count = services.len();
        for (name, service) in services {
            if let Err(e) = self.services.register(&descriptor.name, &name, service).await {
                // Registration is all-or-nothing per plugin.
                self.services.remove_plugin(&descriptor.name).await;
                return Err(e);
            }
        }
        tracing::info!(plugin = %descriptor.name, services = count, "Services published");

        Ok(LoadedHandle::new(descriptor.name.clone(), self.kind())
            .with_teardown(payload.teardown))
    }

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()> {
        let removed = self.services.remove_plugin(&handle.plugin).await;
        tracing::info!(plugin = %handle.plugin, services = removed, "Services withdrawn");
        Ok(())
    }
}
