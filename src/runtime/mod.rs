//! Plugin runtime
//!
//! The pipeline, front to back: descriptor ingestion ([`descriptor`]),
//! registry and lifecycle state ([`registry`]), dependency planning
//! ([`resolver`]), per-kind loading ([`dispatch`], [`handlers`]), module
//! evaluation ([`module_host`]) behind the hot-reload decorator
//! ([`hot_reload`]), remote discovery ([`scanner`]), and the orchestrator
//! that drives it all ([`manager`]).

pub mod descriptor;
pub mod dispatch;
pub mod handlers;
pub mod hot_reload;
pub mod manager;
pub mod module_host;
pub mod registry;
pub mod resolver;
pub mod scanner;

pub use descriptor::{PluginDescriptor, PluginKind};
pub use dispatch::{LoadedHandle, LoaderDispatch, PluginTypeHandler, PortalSurfaces};
pub use hot_reload::HotReloadResolver;
pub use manager::PluginRuntime;
pub use module_host::{FactoryHost, LibraryHost, ModuleHost, PortalBootstrap};
pub use registry::{EntrySnapshot, PluginRegistry, PluginStatus, RegisterOutcome};
pub use resolver::{compute_load_order, LoadPlan};
pub use scanner::{RemoteRegistryScanner, WatchEvent};
