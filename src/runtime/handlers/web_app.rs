//! Handler for web-app plugins

use crate::core::error::Result;
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::dispatch::{LoadedHandle, PluginTypeHandler, RouteTable};
use crate::runtime::handlers::output_mismatch;
use crate::runtime::module_host::{BootstrapOutput, BootstrapPayload};
use std::sync::Arc;

/// Installs a web-app's routes into the portal route table
pub struct WebAppHandler {
    routes: Arc<RouteTable>,
}

impl WebAppHandler {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }
}

#[async_trait::async_trait]
impl PluginTypeHandler for WebAppHandler {
    fn kind(&self) -> PluginKind {
        PluginKind::WebApp
    }

    fn generate_minimum_config(&self, descriptor: &PluginDescriptor) -> serde_json::Value {
        serde_json::json!({
            "routePath": format!("/apps/{}", descriptor.name),
        })
    }

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        payload: BootstrapPayload,
    ) -> Result<LoadedHandle> {
        let routes = match payload.output {
            BootstrapOutput::WebApp { routes } => routes,
            other => return Err(output_mismatch(&descriptor.name, &self.kind(), other.kind_name())),
        };

        let count = routes.len();
        self.routes.install(&descriptor.name, routes).await;
        tracing::info!(plugin = %descriptor.name, routes = count, "Web app routes installed");

        Ok(LoadedHandle::new(descriptor.name.clone(), self.kind())
            .with_teardown(payload.teardown))
    }

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()> {
        let removed = self.routes.remove_plugin(&handle.plugin).await;
        tracing::info!(plugin = %handle.plugin, routes = removed, "Web app routes removed");
        Ok(())
    }
}
