//! Handler for portal-app plugins

use crate::core::error::Result;
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::dispatch::{FragmentRegistry, LoadedHandle, PluginTypeHandler};
use crate::runtime::handlers::output_mismatch;
use crate::runtime::module_host::{BootstrapOutput, BootstrapPayload};
use std::sync::Arc;

/// Mounts a portal-app's micro-frontend fragment
pub struct PortalAppHandler {
    fragments: Arc<FragmentRegistry>,
}

impl PortalAppHandler {
    pub fn new(fragments: Arc<FragmentRegistry>) -> Self {
        Self { fragments }
    }
}

#[async_trait::async_trait]
impl PluginTypeHandler for PortalAppHandler {
    fn kind(&self) -> PluginKind {
        PluginKind::PortalApp
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
        let fragment = match payload.output {
            BootstrapOutput::PortalApp { fragment } => fragment,
            other => return Err(output_mismatch(&descriptor.name, &self.kind(), other.kind_name())),
        };

        tracing::info!(
            plugin = %descriptor.name,
            route_path = %fragment.route_path,
            "Portal fragment mounted"
        );
        self.fragments.install(&descriptor.name, fragment).await;

        Ok(LoadedHandle::new(descriptor.name.clone(), self.kind())
            .with_teardown(payload.teardown))
    }

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()> {
        self.fragments.remove_plugin(&handle.plugin).await;
        tracing::info!(plugin = %handle.plugin, "Portal fragment unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::module_host::PortalFragment;
    use serde_json::json;
    use std::path::PathBuf;

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor {
            name: "dashboard".into(),
            kind: PluginKind::PortalApp,
            bootstrap: "src/index".into(),
            default_config: json!({ "routePath": "/dashboard" }),
            dependencies: Vec::new(),
            priority: 0,
            package_root: PathBuf::from("/plugins/dashboard"),
        }
    }

    #[tokio::test]
    async fn test_mount_and_unmount() {
        let fragments = Arc::new(FragmentRegistry::default());
        let handler = PortalAppHandler::new(Arc::clone(&fragments));

        let payload = BootstrapPayload {
            output: BootstrapOutput::PortalApp {
                fragment: PortalFragment {
                    route_path: "/dashboard".into(),
                    entry: "src/fragment".into(),
                    metadata: json!({ "title": "Dashboard" }),
                },
            },
            teardown: None,
        };
        let mut handle = handler.load(&descriptor(), payload).await.unwrap();
        assert!(fragments.lookup_by_route("/dashboard").await.is_some());

        handler.unload(&mut handle).await.unwrap();
        assert!(fragments.lookup_by_route("/dashboard").await.is_none());
    }
}
