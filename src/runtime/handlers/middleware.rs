//! Handler for middleware plugins

use crate::core::error::Result;
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::dispatch::{LoadedHandle, MiddlewareChain, PluginTypeHandler};
use crate::runtime::handlers::output_mismatch;
use crate::runtime::module_host::{BootstrapOutput, BootstrapPayload};
use std::sync::Arc;

/// Installs request middleware into the portal's middleware chain
pub struct MiddlewareHandler {
    chain: Arc<MiddlewareChain>,
}

impl MiddlewareHandler {
    pub fn new(chain: Arc<MiddlewareChain>) -> Self {
        Self { chain }
    }
}

#[async_trait::async_trait]
impl PluginTypeHandler for MiddlewareHandler {
    fn kind(&self) -> PluginKind {
        PluginKind::Middleware
    }

    fn generate_minimum_config(&self, descriptor: &PluginDescriptor) -> serde_json::Value {
        // Chain position defaults to the descriptor's load priority so the
        // two orderings agree unless the plugin says otherwise.
        serde_json::json!({ "order": descriptor.priority })
    }

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        payload: BootstrapPayload,
    ) -> Result<LoadedHandle> {
        let (middleware, order) = match payload.output {
            BootstrapOutput::Middleware { middleware, order } => (middleware, order),
            other => return Err(output_mismatch(&descriptor.name, &self.kind(), other.kind_name())),
        };

        self.chain.install(&descriptor.name, middleware, order).await;
        tracing::info!(plugin = %descriptor.name, order, "Middleware installed");

        Ok(LoadedHandle::new(descriptor.name.clone(), self.kind())
            .with_teardown(payload.teardown))
    }

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()> {
        self.chain.remove_plugin(&handle.plugin).await;
        tracing::info!(plugin = %handle.plugin, "Middleware removed");
        Ok(())
    }
}
