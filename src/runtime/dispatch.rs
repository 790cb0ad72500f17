//! Loader dispatch
//!
//! Routes a plugin load to the handler registered for its kind. The
//! dispatcher never branches on type strings itself; a kind is loadable
//! exactly when a `PluginTypeHandler` is registered for it, so new kinds
//! arrive by registering a handler (which a loader plugin can do at runtime).
//!
//! Dispatch also owns the portal surfaces loads write into: the route table,
//! middleware chain, service registry, and fragment registry. Handlers get
//! shared references at construction and are the only writers.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::{PluginDescriptor, PluginKind};
use crate::runtime::hot_reload::HotReloadResolver;
use crate::runtime::module_host::{
    BootstrapArgs, BootstrapPayload, ModuleHost, PluginContext, PluginContextHolder,
    PortalFragment, PortalMiddleware, PortalRequest, PortalService, RouteHandler, RouteSpec,
    TeardownHook,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Proof of a completed load, stored in the registry while the plugin is
/// `Loaded` and consumed by the unload path.
pub struct LoadedHandle {
    pub plugin: String,
    pub kind: PluginKind,
    teardown: Option<TeardownHook>,
}

impl LoadedHandle {
    pub fn new(plugin: String, kind: PluginKind) -> Self {
        Self {
            plugin,
            kind,
            teardown: None,
        }
    }

    pub fn with_teardown(mut self, teardown: Option<TeardownHook>) -> Self {
        self.teardown = teardown;
        self
    }

    fn take_teardown(&mut self) -> Option<TeardownHook> {
        self.teardown.take()
    }
}

/// Handler for one plugin kind.
///
/// `generate_minimum_config` supplies the kind's baseline configuration,
/// merged *under* the descriptor's `defaultConfig` before bootstrap. `load`
/// installs a bootstrap's output into the portal surfaces; `unload` removes
/// everything `load` installed. Both must be idempotent per plugin name.
#[async_trait::async_trait]
pub trait PluginTypeHandler: Send + Sync {
    fn kind(&self) -> PluginKind;

    fn generate_minimum_config(&self, descriptor: &PluginDescriptor) -> serde_json::Value;

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        payload: BootstrapPayload,
    ) -> Result<LoadedHandle>;

    async fn unload(&self, handle: &mut LoadedHandle) -> Result<()>;
}

/// Route table the portal router consults per request
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<RouteBinding>>,
}

struct RouteBinding {
    plugin: String,
    method: String,
    path: String,
    handler: Arc<dyn RouteHandler>,
}

/// Serializable view of one installed route
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub plugin: String,
    pub method: String,
    pub path: String,
}

impl RouteTable {
    /// Install a plugin's routes, replacing any routes it installed before.
    pub async fn install(&self, plugin: &str, specs: Vec<RouteSpec>) {
        let mut routes = self.routes.write().await;
        routes.retain(|r| r.plugin != plugin);
        for spec in specs {
            routes.push(RouteBinding {
                plugin: plugin.to_string(),
                method: spec.method.to_ascii_uppercase(),
                path: spec.path,
                handler: spec.handler,
            });
        }
    }

    pub async fn remove_plugin(&self, plugin: &str) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|r| r.plugin != plugin);
        before - routes.len()
    }

    pub async fn lookup(&self, method: &str, path: &str) -> Option<Arc<dyn RouteHandler>> {
        let method = method.to_ascii_uppercase();
        self.routes
            .read()
            .await
            .iter()
            .find(|r| r.method == method && r.path == path)
            .map(|r| Arc::clone(&r.handler))
    }

    pub async fn list(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .await
            .iter()
            .map(|r| RouteInfo {
                plugin: r.plugin.clone(),
                method: r.method.clone(),
                path: r.path.clone(),
            })
            .collect()
    }
}

/// Middleware chain applied before route dispatch, in ascending order
#[derive(Default)]
pub struct MiddlewareChain {
    entries: RwLock<Vec<MiddlewareBinding>>,
}

struct MiddlewareBinding {
    plugin: String,
    order: i32,
    middleware: Arc<dyn PortalMiddleware>,
}

impl MiddlewareChain {
    pub async fn install(&self, plugin: &str, middleware: Arc<dyn PortalMiddleware>, order: i32) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.plugin != plugin);
        entries.push(MiddlewareBinding {
            plugin: plugin.to_string(),
            order,
            middleware,
        });
        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.plugin.cmp(&b.plugin)));
    }

    pub async fn remove_plugin(&self, plugin: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.plugin != plugin);
        before - entries.len()
    }

    /// Run every middleware against the request, in chain order. The first
    /// error vetoes the request.
    pub async fn apply(&self, request: &mut PortalRequest) -> Result<()> {
        let snapshot: Vec<Arc<dyn PortalMiddleware>> = self
            .entries
            .read()
            .await
            .iter()
            .map(|e| Arc::clone(&e.middleware))
            .collect();
        for middleware in snapshot {
            middleware.apply(request).await?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Named services published by service plugins
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceBinding>>,
}

struct ServiceBinding {
    plugin: String,
    service: Arc<dyn PortalService>,
}

impl ServiceRegistry {
    /// Publish a service under a name. A plugin may replace its own service;
    /// claiming a name held by another plugin is a conflict.
    pub async fn register(
        &self,
        plugin: &str,
        name: &str,
        service: Arc<dyn PortalService>,
    ) -> Result<()> {
        let mut services = self.services.write().await;
        if let Some(existing) = services.get(name) {
            if existing.plugin != plugin {
                return Err(PortalError::Initialization {
                    plugin: plugin.to_string(),
                    cause: format!(
                        "service name '{}' already published by plugin '{}'",
                        name, existing.plugin
                    ),
                });
            }
        }
        services.insert(
            name.to_string(),
            ServiceBinding {
                plugin: plugin.to_string(),
                service,
            },
        );
        Ok(())
    }

    pub async fn remove_plugin(&self, plugin: &str) -> usize {
        let mut services = self.services.write().await;
        let before = services.len();
        services.retain(|_, b| b.plugin != plugin);
        before - services.len()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn PortalService>> {
        self.services
            .read()
            .await
            .get(name)
            .map(|b| Arc::clone(&b.service))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Micro-frontend fragments contributed by portal-app plugins
#[derive(Default)]
pub struct FragmentRegistry {
    fragments: RwLock<HashMap<String, PortalFragment>>,
}

impl FragmentRegistry {
    pub async fn install(&self, plugin: &str, fragment: PortalFragment) {
        self.fragments
            .write()
            .await
            .insert(plugin.to_string(), fragment);
    }

    pub async fn remove_plugin(&self, plugin: &str) -> bool {
        self.fragments.write().await.remove(plugin).is_some()
    }

    pub async fn lookup_by_route(&self, route_path: &str) -> Option<PortalFragment> {
        self.fragments
            .read()
            .await
            .values()
            .find(|f| f.route_path == route_path)
            .cloned()
    }

    pub async fn list(&self) -> Vec<PortalFragment> {
        let mut fragments: Vec<PortalFragment> =
            self.fragments.read().await.values().cloned().collect();
        fragments.sort_by(|a, b| a.route_path.cmp(&b.route_path));
        fragments
    }
}

/// The portal surfaces loads write into, shared between dispatch, the
/// built-in handlers, and the HTTP layer.
#[derive(Clone, Default)]
pub struct PortalSurfaces {
    pub routes: Arc<RouteTable>,
    pub middleware: Arc<MiddlewareChain>,
    pub services: Arc<ServiceRegistry>,
    pub fragments: Arc<FragmentRegistry>,
}

type HandlerMap = Arc<std::sync::RwLock<HashMap<PluginKind, Arc<dyn PluginTypeHandler>>>>;

/// Dispatches loads and unloads to per-kind handlers
pub struct LoaderDispatch {
    handlers: HandlerMap,
    host: Arc<dyn ModuleHost>,
    hot_reload: Arc<HotReloadResolver>,
    surfaces: PortalSurfaces,
    load_timeout: Duration,
    data_dir: PathBuf,
}

impl LoaderDispatch {
    pub fn new(
        host: Arc<dyn ModuleHost>,
        hot_reload: Arc<HotReloadResolver>,
        load_timeout: Duration,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            handlers: Arc::new(std::sync::RwLock::new(HashMap::new())),
            host,
            hot_reload,
            surfaces: PortalSurfaces::default(),
            load_timeout,
            data_dir,
        }
    }

    pub fn surfaces(&self) -> &PortalSurfaces {
        &self.surfaces
    }

    /// Register a handler for its kind, replacing any previous handler.
    pub fn register_handler(&self, handler: Arc<dyn PluginTypeHandler>) {
        let kind = handler.kind();
        tracing::info!(kind = %kind, "Plugin type handler registered");
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(kind, handler);
    }

    /// Shared handle to the handler map, given to the plugin-loader handler
    /// so loader plugins can contribute handlers at runtime.
    pub fn handler_map(&self) -> HandlerMap {
        Arc::clone(&self.handlers)
    }

    pub fn handler_for(&self, kind: &PluginKind) -> Result<Arc<dyn PluginTypeHandler>> {
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .get(kind)
            .cloned()
            .ok_or_else(|| PortalError::UnknownPluginType(kind.to_string()))
    }

    pub fn registered_kinds(&self) -> Vec<PluginKind> {
        let mut kinds: Vec<PluginKind> = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .keys()
            .cloned()
            .collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    /// Drop the host's cached evaluation of this plugin's bootstrap module.
    ///
    /// An explicit re-register or reload means new code may be behind the
    /// same specifier; without eviction a host without hot reload would keep
    /// serving the instance it memoized, including one whose bootstrap
    /// failed.
    pub fn invalidate_module(&self, descriptor: &PluginDescriptor) {
        let specifier = descriptor
            .package_root
            .join(&descriptor.bootstrap)
            .to_string_lossy()
            .into_owned();
        self.host.invalidate(&specifier);
    }

    /// Effective config: the handler's minimum merged under the descriptor's
    /// `defaultConfig` (descriptor wins on conflicts, recursively).
    pub fn effective_config(&self, descriptor: &PluginDescriptor) -> Result<serde_json::Value> {
        let handler = self.handler_for(&descriptor.kind)?;
        Ok(merge_config(
            handler.generate_minimum_config(descriptor),
            descriptor.default_config.clone(),
        ))
    }

    /// Load one plugin: resolve its bootstrap module (through the hot-reload
    /// decorator), invoke it with the effective config, and hand the output
    /// to the kind's handler. The whole sequence runs under the load
    /// deadline.
    pub async fn load(&self, descriptor: &PluginDescriptor) -> Result<LoadedHandle> {
        let handler = self.handler_for(&descriptor.kind)?;
        let config = merge_config(
            handler.generate_minimum_config(descriptor),
            descriptor.default_config.clone(),
        );

        let specifier = descriptor
            .package_root
            .join(&descriptor.bootstrap)
            .to_string_lossy()
            .into_owned();
        let resolution = self.hot_reload.resolve(&specifier);

        let context = PluginContextHolder::new(PluginContext {
            plugin_name: descriptor.name.clone(),
            config: config.clone(),
            package_root: descriptor.package_root.clone(),
            data_dir: self.data_dir.join(&descriptor.name),
        });

        let load = async {
            let bootstrap = self.host.resolve(&resolution).await?;
            let payload = bootstrap
                .invoke(BootstrapArgs {
                    plugin_name: descriptor.name.clone(),
                    config,
                    context,
                })
                .await?;
            handler.load(descriptor, payload).await
        };

        match tokio::time::timeout(self.load_timeout, load).await {
            Ok(result) => result,
            Err(_) => Err(PortalError::Timeout(format!(
                "plugin '{}' did not finish loading within {:?}",
                descriptor.name, self.load_timeout
            ))),
        }
    }

    /// Unload one plugin: the handler removes what it installed, then the
    /// bootstrap's teardown hook runs. A failing teardown is logged and
    /// swallowed; the unload itself still completes.
    pub async fn unload(&self, mut handle: LoadedHandle) -> Result<()> {
        let handler = self.handler_for(&handle.kind)?;
        handler.unload(&mut handle).await?;

        if let Some(teardown) = handle.take_teardown() {
            if let Err(e) = teardown().await {
                tracing::warn!(
                    plugin = %handle.plugin,
                    error = %e,
                    "Plugin teardown failed during unload"
                );
            }
        }
        Ok(())
    }
}

/// Recursive JSON object merge; `overrides` wins on every conflict.
pub fn merge_config(
    minimum: serde_json::Value,
    overrides: serde_json::Value,
) -> serde_json::Value {
    match (minimum, overrides) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            serde_json::Value::Object(base)
        }
        (_, over) if !over.is_null() => over,
        (base, _) => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::module_host::PortalResponse;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RouteHandler for EchoHandler {
        async fn handle(&self, request: PortalRequest) -> Result<PortalResponse> {
            Ok(PortalResponse::ok(json!({ "path": request.path })))
        }
    }

    fn route(method: &str, path: &str) -> RouteSpec {
        RouteSpec {
            method: method.to_string(),
            path: path.to_string(),
            handler: Arc::new(EchoHandler),
        }
    }

    #[tokio::test]
    async fn test_route_table_install_is_idempotent() {
        let table = RouteTable::default();
        table.install("home", vec![route("GET", "/home")]).await;
        table
            .install("home", vec![route("GET", "/home"), route("GET", "/home/about")])
            .await;

        let routes = table.list().await;
        assert_eq!(routes.len(), 2);
        assert!(table.lookup("get", "/home").await.is_some());
    }

    #[tokio::test]
    async fn test_route_table_remove_plugin() {
        let table = RouteTable::default();
        table.install("home", vec![route("GET", "/home")]).await;
        table.install("shop", vec![route("GET", "/shop")]).await;

        assert_eq!(table.remove_plugin("home").await, 1);
        assert!(table.lookup("GET", "/home").await.is_none());
        assert!(table.lookup("GET", "/shop").await.is_some());
    }

    struct TagMiddleware(String);

    #[async_trait::async_trait]
    impl PortalMiddleware for TagMiddleware {
        async fn apply(&self, request: &mut PortalRequest) -> Result<()> {
            request.headers.push(("x-tag".into(), self.0.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_middleware_runs_in_chain_order() {
        let chain = MiddlewareChain::default();
        chain
            .install("second", Arc::new(TagMiddleware("2".into())), 20)
            .await;
        chain
            .install("first", Arc::new(TagMiddleware("1".into())), 10)
            .await;

        let mut request = PortalRequest {
            method: "GET".into(),
            path: "/".into(),
            headers: Vec::new(),
            body: json!(null),
        };
        chain.apply(&mut request).await.unwrap();

        let tags: Vec<&str> = request
            .headers
            .iter()
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(tags, vec!["1", "2"]);
    }

    struct ConstService(serde_json::Value);

    #[async_trait::async_trait]
    impl PortalService for ConstService {
        async fn call(&self, _method: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_service_name_conflict_across_plugins() {
        let registry = ServiceRegistry::default();
        registry
            .register("a", "search", Arc::new(ConstService(json!(1))))
            .await
            .unwrap();

        // Same plugin may replace its own service.
        registry
            .register("a", "search", Arc::new(ConstService(json!(2))))
            .await
            .unwrap();

        let err = registry
            .register("b", "search", Arc::new(ConstService(json!(3))))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Initialization { .. }));

        let service = registry.get("search").await.unwrap();
        assert_eq!(service.call("any", json!(null)).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_fragment_lookup_by_route() {
        let registry = FragmentRegistry::default();
        registry
            .install(
                "dashboard",
                PortalFragment {
                    route_path: "/dashboard".into(),
                    entry: "src/fragment".into(),
                    metadata: json!({}),
                },
            )
            .await;

        assert!(registry.lookup_by_route("/dashboard").await.is_some());
        assert!(registry.lookup_by_route("/missing").await.is_none());
        assert!(registry.remove_plugin("dashboard").await);
        assert!(registry.lookup_by_route("/dashboard").await.is_none());
    }

    #[test]
    fn test_merge_config_descriptor_wins() {
        let merged = merge_config(
            json!({ "routePath": "/default", "limits": { "rps": 10, "burst": 5 } }),
            json!({ "routePath": "/home", "limits": { "rps": 50 } }),
        );

        assert_eq!(merged["routePath"], "/home");
        assert_eq!(merged["limits"]["rps"], 50);
        // Untouched minimums survive the merge.
        assert_eq!(merged["limits"]["burst"], 5);
    }

    #[test]
    fn test_merge_config_null_override_keeps_minimum() {
        let merged = merge_config(json!({ "a": 1 }), json!(null));
        assert_eq!(merged, json!({ "a": 1 }));
    }
}
