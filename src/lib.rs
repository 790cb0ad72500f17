//! Portal plugin runtime
//!
//! A server-side runtime that turns a portal into a plugin platform:
//! plugins describe themselves through manifests, declare dependencies on
//! each other, and are loaded in dependency order by per-kind loaders.
//! Project-owned modules can be hot-reloaded without a restart, and remote
//! registries are polled for plugins advertised over HTTP.

pub mod api;
pub mod core;
pub mod runtime;

pub use core::config::Config;
pub use core::error::{PortalError, Result};
pub use runtime::{PluginRuntime, PluginStatus};
