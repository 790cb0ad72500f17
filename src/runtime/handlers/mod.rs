//! Built-in plugin type handlers
//!
//! One handler per kind the runtime ships with. Additional kinds arrive at
//! runtime through loader plugins; those handlers register into the same
//! dispatch map as these.

mod loader;
mod middleware;
mod portal_app;
mod service;
mod web_app;

pub use loader::PluginLoaderHandler;
pub use middleware::MiddlewareHandler;
pub use portal_app::PortalAppHandler;
pub use service::ServiceHandler;
pub use web_app::WebAppHandler;

use crate::runtime::dispatch::LoaderDispatch;
use std::sync::Arc;

/// Register the built-in handlers against a dispatcher's surfaces.
pub fn register_builtin(dispatch: &LoaderDispatch) {
    let surfaces = dispatch.surfaces().clone();
    dispatch.register_handler(Arc::new(WebAppHandler::new(Arc::clone(&surfaces.routes))));
    dispatch.register_handler(Arc::new(MiddlewareHandler::new(Arc::clone(
        &surfaces.middleware,
    ))));
    dispatch.register_handler(Arc::new(ServiceHandler::new(Arc::clone(&surfaces.services))));
    dispatch.register_handler(Arc::new(PortalAppHandler::new(Arc::clone(
        &surfaces.fragments,
    ))));
    dispatch.register_handler(Arc::new(PluginLoaderHandler::new(dispatch.handler_map())));
}

/// Error for a bootstrap whose output does not match the declared kind.
pub(crate) fn output_mismatch(
    plugin: &str,
    expected: &crate::runtime::descriptor::PluginKind,
    got: &'static str,
) -> crate::core::error::PortalError {
    crate::core::error::PortalError::Initialization {
        plugin: plugin.to_string(),
        cause: format!(
            "bootstrap produced a {} output for a {} plugin",
            got, expected
        ),
    }
}
