//! Module hosts and the bootstrap contract
//!
//! A module host turns a resolved module specifier into a bootstrap function.
//! The host decides what "evaluate a module" means: `FactoryHost` keeps
//! in-process factories and is what the portal itself and tests use;
//! `LibraryHost` evaluates native dynamic libraries over a C ABI.
//!
//! Both honor the hot-reload contract the same way: a resolution carrying a
//! ticket bypasses the module cache and re-evaluates from source, and an
//! evaluation failure propagates to the caller; a stale cached instance is
//! never substituted for a failed reload.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::PluginKind;
use crate::runtime::dispatch::PluginTypeHandler;
use crate::runtime::hot_reload::{strip_cache_token, ModuleResolution};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Entry point a native bootstrap library must export.
///
/// `int portal_bootstrap(const char* context_json, char** result_json)`
/// Returns 0 on success and writes a heap-allocated JSON result; any other
/// value is a failure. The host frees the result through `portal_free`.
pub const BOOTSTRAP_SYMBOL: &[u8] = b"portal_bootstrap";
/// `int portal_invoke(const char* method, const char* params_json, char** result_json)`
pub const INVOKE_SYMBOL: &[u8] = b"portal_invoke";
/// Optional: `int portal_teardown(void)`
pub const TEARDOWN_SYMBOL: &[u8] = b"portal_teardown";
/// `void portal_free(char* ptr)` releases strings the library allocated
pub const FREE_SYMBOL: &[u8] = b"portal_free";

type BootstrapFn = unsafe extern "C" fn(*const c_char, *mut *mut c_char) -> c_int;
type InvokeFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_char) -> c_int;
type TeardownFn = unsafe extern "C" fn() -> c_int;
type FreeFn = unsafe extern "C" fn(*mut c_char);

/// Execution context handed to a plugin's bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginContext {
    pub plugin_name: String,
    /// Effective configuration: handler minimum merged under the descriptor's
    /// `defaultConfig`
    pub config: serde_json::Value,
    pub package_root: PathBuf,
    pub data_dir: PathBuf,
}

/// Shared, updatable view of a plugin's context.
///
/// Handed to bootstrap code so long-lived plugin tasks observe config
/// replacement after a reload without re-bootstrapping.
#[derive(Clone)]
pub struct PluginContextHolder {
    inner: Arc<RwLock<PluginContext>>,
}

impl PluginContextHolder {
    pub fn new(context: PluginContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    pub fn get_plugin_context(&self) -> PluginContext {
        self.inner.read().expect("context lock poisoned").clone()
    }

    pub fn set_plugin_context(&self, context: PluginContext) {
        *self.inner.write().expect("context lock poisoned") = context;
    }
}

/// A minimal request shape routed through plugin-contributed routes
#[derive(Debug, Clone)]
pub struct PortalRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Response produced by a plugin route handler
#[derive(Debug, Clone, Serialize)]
pub struct PortalResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl PortalResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }
}

/// Handler for one route contributed by a web-app plugin
#[async_trait::async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: PortalRequest) -> Result<PortalResponse>;
}

/// Request middleware contributed by a middleware plugin; runs in chain
/// order before route dispatch and may mutate the request or veto it.
#[async_trait::async_trait]
pub trait PortalMiddleware: Send + Sync {
    async fn apply(&self, request: &mut PortalRequest) -> Result<()>;
}

/// A named backend capability other plugins call through the service registry
#[async_trait::async_trait]
pub trait PortalService: Send + Sync {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// One route a web-app plugin contributes
#[derive(Clone)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
    pub handler: Arc<dyn RouteHandler>,
}

/// A portal-app micro-frontend fragment, served to the shell for mounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalFragment {
    /// Mount path within the portal shell
    pub route_path: String,
    /// Entry module the shell loads to render the fragment
    pub entry: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What a successful bootstrap produced, by plugin kind
pub enum BootstrapOutput {
    WebApp { routes: Vec<RouteSpec> },
    Middleware { middleware: Arc<dyn PortalMiddleware>, order: i32 },
    Service { services: Vec<(String, Arc<dyn PortalService>)> },
    PortalApp { fragment: PortalFragment },
    /// A loader plugin contributing a handler for an additional plugin kind
    Loader { kind: PluginKind, handler: Arc<dyn PluginTypeHandler> },
}

impl BootstrapOutput {
    /// Human-readable name used in mismatch errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            BootstrapOutput::WebApp { .. } => "web-app",
            BootstrapOutput::Middleware { .. } => "middleware",
            BootstrapOutput::Service { .. } => "service",
            BootstrapOutput::PortalApp { .. } => "portal-app",
            BootstrapOutput::Loader { .. } => "plugin-loader",
        }
    }
}

/// Cleanup a bootstrap may hand back; invoked exactly once at unload
pub type TeardownHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything a bootstrap returns
pub struct BootstrapPayload {
    pub output: BootstrapOutput,
    pub teardown: Option<TeardownHook>,
}

/// Arguments every bootstrap invocation receives, fixed arity by contract
pub struct BootstrapArgs {
    pub plugin_name: String,
    pub config: serde_json::Value,
    pub context: PluginContextHolder,
}

/// A plugin's entry point, obtained from a module host
#[async_trait::async_trait]
pub trait PortalBootstrap: Send + Sync {
    async fn invoke(&self, args: BootstrapArgs) -> Result<BootstrapPayload>;
}

/// Resolves an (already hot-reload-decorated) module specifier to a bootstrap
#[async_trait::async_trait]
pub trait ModuleHost: Send + Sync {
    async fn resolve(&self, resolution: &ModuleResolution) -> Result<Arc<dyn PortalBootstrap>>;

    /// Drop any cached evaluation of `specifier` (the plain specifier,
    /// without a cache token), so the next resolve re-evaluates from source.
    /// An explicit re-register or reload calls this even when hot reload is
    /// disabled.
    fn invalidate(&self, _specifier: &str) {}
}

type BootstrapFactory = Arc<dyn Fn() -> Result<Arc<dyn PortalBootstrap>> + Send + Sync>;

/// In-process module host backed by registered factories.
///
/// A factory stands in for "evaluating the module": it is re-invoked every
/// time a ticketed resolution arrives, and memoized otherwise: exactly the
/// caching behavior the cache-busting contract assumes.
#[derive(Default)]
pub struct FactoryHost {
    factories: RwLock<HashMap<String, BootstrapFactory>>,
    cache: RwLock<HashMap<String, Arc<dyn PortalBootstrap>>>,
}

impl FactoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a module specifier (the plain specifier,
    /// without any cache token).
    pub fn register_factory<F>(&self, specifier: &str, factory: F)
    where
        F: Fn() -> Result<Arc<dyn PortalBootstrap>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .expect("factory lock poisoned")
            .insert(specifier.to_string(), Arc::new(factory));
    }

    fn factory_for(&self, specifier: &str) -> Result<BootstrapFactory> {
        self.factories
            .read()
            .expect("factory lock poisoned")
            .get(specifier)
            .cloned()
            .ok_or_else(|| PortalError::ModuleResolution {
                specifier: specifier.to_string(),
                cause: "no factory registered for module".to_string(),
            })
    }
}

#[async_trait::async_trait]
impl ModuleHost for FactoryHost {
    async fn resolve(&self, resolution: &ModuleResolution) -> Result<Arc<dyn PortalBootstrap>> {
        let original = strip_cache_token(&resolution.specifier);

        if !resolution.reload() {
            if let Some(cached) = self
                .cache
                .read()
                .expect("cache lock poisoned")
                .get(original)
            {
                return Ok(Arc::clone(cached));
            }
        }

        // Fresh evaluation. On failure the old cache entry is left alone but
        // the error still propagates; the caller decides what to do with it.
        let factory = self.factory_for(original)?;
        let bootstrap = factory()?;
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(original.to_string(), Arc::clone(&bootstrap));
        Ok(bootstrap)
    }

    fn invalidate(&self, specifier: &str) {
        self.cache
            .write()
            .expect("cache lock poisoned")
            .remove(specifier);
    }
}

/// Module host for native dynamic libraries.
///
/// The OS loader caches images by path, so re-evaluation needs more than a
/// new specifier string: a ticketed resolution shadow-copies the library
/// file under its token before loading, giving the OS a genuinely new image.
pub struct LibraryHost {
    scratch_dir: PathBuf,
    libraries: Mutex<HashMap<String, Arc<libloading::Library>>>,
}

impl LibraryHost {
    pub fn new(scratch_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        Ok(Self {
            scratch_dir: scratch_dir.to_path_buf(),
            libraries: Mutex::new(HashMap::new()),
        })
    }

    fn load_library(&self, resolution: &ModuleResolution) -> Result<Arc<libloading::Library>> {
        let original = strip_cache_token(&resolution.specifier);

        if !resolution.reload() {
            if let Some(cached) = self
                .libraries
                .lock()
                .expect("library lock poisoned")
                .get(original)
            {
                return Ok(Arc::clone(cached));
            }
        }

        let load_path = match &resolution.ticket {
            Some(ticket) => {
                let source = Path::new(original);
                let stem = source
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("module");
                let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("so");
                let shadow = self
                    .scratch_dir
                    .join(format!("{}.{}.{}", stem, ticket.token, ext));
                std::fs::copy(source, &shadow).map_err(|e| PortalError::ModuleResolution {
                    specifier: original.to_string(),
                    cause: format!("failed to shadow-copy library: {}", e),
                })?;
                shadow
            }
            None => PathBuf::from(original),
        };

        let library = unsafe {
            libloading::Library::new(&load_path).map_err(|e| PortalError::ModuleResolution {
                specifier: original.to_string(),
                cause: e.to_string(),
            })?
        };
        let library = Arc::new(library);
        self.libraries
            .lock()
            .expect("library lock poisoned")
            .insert(original.to_string(), Arc::clone(&library));
        Ok(library)
    }
}

#[async_trait::async_trait]
impl ModuleHost for LibraryHost {
    async fn resolve(&self, resolution: &ModuleResolution) -> Result<Arc<dyn PortalBootstrap>> {
        let library = self.load_library(resolution)?;
        Ok(Arc::new(LibraryBootstrap { library }))
    }

    fn invalidate(&self, specifier: &str) {
        // Live handles keep their own Arc; only the cache reference drops.
        self.libraries
            .lock()
            .expect("library lock poisoned")
            .remove(specifier);
    }
}

/// Result shape a native `portal_bootstrap` writes back
#[derive(Debug, Deserialize)]
struct NativeBootstrapResult {
    /// Names of services the library publishes through `portal_invoke`
    #[serde(default)]
    services: Vec<String>,
}

struct LibraryBootstrap {
    library: Arc<libloading::Library>,
}

#[async_trait::async_trait]
impl PortalBootstrap for LibraryBootstrap {
    async fn invoke(&self, args: BootstrapArgs) -> Result<BootstrapPayload> {
        let plugin = args.plugin_name.clone();
        let context_json = serde_json::to_string(&args.context.get_plugin_context())
            .map_err(|e| PortalError::Serialization(e.to_string()))?;

        let library = Arc::clone(&self.library);
        let raw = tokio::task::spawn_blocking(move || -> Result<String> {
            call_string_out(&library, BOOTSTRAP_SYMBOL, |bootstrap: libloading::Symbol<
                BootstrapFn,
            >,
                             out| unsafe {
                let input = std::ffi::CString::new(context_json.as_str())
                    .map_err(|e| PortalError::Serialization(e.to_string()))?;
                Ok(bootstrap(input.as_ptr(), out))
            })
        })
        .await
        .map_err(|e| PortalError::Runtime(format!("bootstrap task panicked: {}", e)))?
        .map_err(|e| PortalError::Initialization {
            plugin: plugin.clone(),
            cause: e.to_string(),
        })?;

        let parsed: NativeBootstrapResult =
            serde_json::from_str(&raw).map_err(|e| PortalError::Initialization {
                plugin: plugin.clone(),
                cause: format!("bootstrap result is not valid JSON: {}", e),
            })?;

        let services: Vec<(String, Arc<dyn PortalService>)> = parsed
            .services
            .into_iter()
            .map(|name| {
                let service: Arc<dyn PortalService> = Arc::new(LibraryService {
                    library: Arc::clone(&self.library),
                });
                (name, service)
            })
            .collect();

        // Teardown is optional in the ABI; absent symbol means nothing to do.
        let teardown_library = Arc::clone(&self.library);
        let has_teardown =
            unsafe { teardown_library.get::<TeardownFn>(TEARDOWN_SYMBOL).is_ok() };
        let teardown: Option<TeardownHook> = has_teardown.then(|| {
            let library = teardown_library;
            let hook: TeardownHook = Box::new(move || {
                Box::pin(async move {
                    tokio::task::spawn_blocking(move || -> Result<()> {
                        let code = unsafe {
                            let teardown: libloading::Symbol<TeardownFn> = library
                                .get(TEARDOWN_SYMBOL)
                                .map_err(|e| PortalError::Runtime(e.to_string()))?;
                            teardown()
                        };
                        if code != 0 {
                            return Err(PortalError::Runtime(format!(
                                "portal_teardown returned {}",
                                code
                            )));
                        }
                        Ok(())
                    })
                    .await
                    .map_err(|e| PortalError::Runtime(e.to_string()))?
                }) as BoxFuture<'static, Result<()>>
            });
            hook
        });

        Ok(BootstrapPayload {
            output: BootstrapOutput::Service { services },
            teardown,
        })
    }
}

/// Service backed by a library's `portal_invoke` entry point
struct LibraryService {
    library: Arc<libloading::Library>,
}

#[async_trait::async_trait]
impl PortalService for LibraryService {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let library = Arc::clone(&self.library);
        let method = method.to_string();
        let params_json =
            serde_json::to_string(&params).map_err(|e| PortalError::Serialization(e.to_string()))?;

        let raw = tokio::task::spawn_blocking(move || -> Result<String> {
            call_string_out(
                &library,
                INVOKE_SYMBOL,
                |invoke: libloading::Symbol<InvokeFn>, out| unsafe {
                    let method = std::ffi::CString::new(method.as_str())
                        .map_err(|e| PortalError::Serialization(e.to_string()))?;
                    let params = std::ffi::CString::new(params_json.as_str())
                        .map_err(|e| PortalError::Serialization(e.to_string()))?;
                    Ok(invoke(method.as_ptr(), params.as_ptr(), out))
                },
            )
        })
        .await
        .map_err(|e| PortalError::Runtime(format!("invoke task panicked: {}", e)))??;

        serde_json::from_str(&raw).map_err(|e| PortalError::Serialization(e.to_string()))
    }
}

/// Call a library entry point that writes a string result through an out
/// pointer, copying the result out and releasing it via `portal_free`.
fn call_string_out<T, F>(
    library: &libloading::Library,
    symbol: &[u8],
    call: F,
) -> Result<String>
where
    F: FnOnce(libloading::Symbol<T>, *mut *mut c_char) -> Result<c_int>,
{
    let mut out: *mut c_char = std::ptr::null_mut();
    let code = unsafe {
        let entry: libloading::Symbol<T> =
            library
                .get(symbol)
                .map_err(|e| PortalError::ModuleResolution {
                    specifier: String::from_utf8_lossy(symbol).into_owned(),
                    cause: format!("missing symbol: {}", e),
                })?;
        call(entry, &mut out)?
    };

    if code != 0 {
        release_string(library, out);
        return Err(PortalError::Runtime(format!(
            "{} returned {}",
            String::from_utf8_lossy(symbol),
            code
        )));
    }
    if out.is_null() {
        return Err(PortalError::Runtime(format!(
            "{} wrote no result",
            String::from_utf8_lossy(symbol)
        )));
    }

    let result = unsafe { std::ffi::CStr::from_ptr(out).to_string_lossy().into_owned() };
    release_string(library, out);
    Ok(result)
}

fn release_string(library: &libloading::Library, ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        if let Ok(free) = library.get::<FreeFn>(FREE_SYMBOL) {
            free(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hot_reload::HotReloadResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopBootstrap;

    #[async_trait::async_trait]
    impl PortalBootstrap for NoopBootstrap {
        async fn invoke(&self, _args: BootstrapArgs) -> Result<BootstrapPayload> {
            Ok(BootstrapPayload {
                output: BootstrapOutput::Service {
                    services: Vec::new(),
                },
                teardown: None,
            })
        }
    }

    fn plain(specifier: &str) -> ModuleResolution {
        ModuleResolution {
            specifier: specifier.to_string(),
            ticket: None,
        }
    }

    #[tokio::test]
    async fn test_factory_host_memoizes_without_ticket() {
        let host = FactoryHost::new();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluations);
        host.register_factory("/srv/portal/plugins/a/src/index", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopBootstrap) as Arc<dyn PortalBootstrap>)
        });

        host.resolve(&plain("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();
        host.resolve(&plain("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();

        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_host_reevaluates_on_ticket() {
        let host = FactoryHost::new();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluations);
        host.register_factory("/srv/portal/plugins/a/src/index", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopBootstrap) as Arc<dyn PortalBootstrap>)
        });

        let resolver = HotReloadResolver::new(true, Path::new("/srv/portal"));
        host.resolve(&resolver.resolve("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();
        host.resolve(&resolver.resolve("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();

        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_propagates_not_stale_fallback() {
        let host = FactoryHost::new();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluations);
        host.register_factory("/srv/portal/plugins/a/src/index", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Arc::new(NoopBootstrap) as Arc<dyn PortalBootstrap>)
            } else {
                Err(PortalError::ModuleResolution {
                    specifier: "/srv/portal/plugins/a/src/index".into(),
                    cause: "syntax error introduced by edit".into(),
                })
            }
        });

        let resolver = HotReloadResolver::new(true, Path::new("/srv/portal"));
        host.resolve(&resolver.resolve("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();

        // Second, ticketed resolution hits the broken factory; the cached
        // first instance must not paper over the failure.
        let err = host
            .resolve(&resolver.resolve("/srv/portal/plugins/a/src/index"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::ModuleResolution { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_evicts_cached_instance() {
        let host = FactoryHost::new();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluations);
        host.register_factory("/srv/portal/plugins/a/src/index", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopBootstrap) as Arc<dyn PortalBootstrap>)
        });

        // Un-ticketed resolutions normally memoize; invalidation forces the
        // next one back through the factory.
        host.resolve(&plain("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();
        host.invalidate("/srv/portal/plugins/a/src/index");
        host.resolve(&plain("/srv/portal/plugins/a/src/index"))
            .await
            .unwrap();

        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unregistered_module_fails() {
        let host = FactoryHost::new();
        let err = host
            .resolve(&plain("/srv/portal/ghost"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::ModuleResolution { .. }));
    }

    #[test]
    fn test_context_holder_observes_replacement() {
        let holder = PluginContextHolder::new(PluginContext {
            plugin_name: "search".into(),
            config: serde_json::json!({ "limit": 10 }),
            package_root: PathBuf::from("/srv/portal/plugins/search"),
            data_dir: PathBuf::from("/var/lib/portal/search"),
        });
        let observer = holder.clone();

        let mut updated = holder.get_plugin_context();
        updated.config = serde_json::json!({ "limit": 50 });
        holder.set_plugin_context(updated);

        assert_eq!(
            observer.get_plugin_context().config["limit"],
            serde_json::json!(50)
        );
    }
}
