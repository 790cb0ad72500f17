//! HTTP layer: the admin API and the portal request surface

pub mod handlers;
pub mod server;

pub use server::ApiServer;
