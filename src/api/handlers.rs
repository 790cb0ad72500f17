//! Admin API handlers and the portal request surface
//!
//! The admin endpoints manage plugin lifecycle over HTTP; the portal
//! fallback serves every other request by consulting the dispatch-owned
//! surfaces at request time, so routes contributed by a plugin load become
//! servable without rebuilding the router.

use crate::core::error::{ErrorResponse, PortalError, Result};
use crate::runtime::descriptor;
use crate::runtime::module_host::PortalRequest;
use crate::runtime::registry::EntrySnapshot;
use crate::runtime::PluginRuntime;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<PluginRuntime>,
}

/// GET /api/plugins
pub async fn list_plugins(State(state): State<AppState>) -> Json<Vec<EntrySnapshot>> {
    Json(state.runtime.registry().all().await)
}

/// GET /api/plugins/:name
pub async fn get_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EntrySnapshot>> {
    state
        .runtime
        .registry()
        .get(&name)
        .await
        .map(Json)
        .ok_or(PortalError::PluginNotFound(name))
}

/// Body for POST /api/plugins: a package directory to ingest
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "packageRoot")]
    pub package_root: std::path::PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub registered: Vec<String>,
}

/// POST /api/plugins: ingest a plugin package's manifest and load it
pub async fn register_plugin(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let manifest =
        descriptor::find_manifest(&request.package_root)?.ok_or(PortalError::Descriptor {
            path: request.package_root.clone(),
            violations: vec!["no manifest found in package".into()],
        })?;

    let mut registered = Vec::new();
    for plugin in descriptor::load_manifest(&manifest)? {
        let name = plugin.name.clone();
        state.runtime.register(plugin).await?;
        registered.push(name);
    }
    Ok((StatusCode::CREATED, Json(RegisterResponse { registered })))
}

/// POST /api/plugins/:name/reload
pub async fn reload_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EntrySnapshot>> {
    state.runtime.reload(&name).await?;
    state
        .runtime
        .registry()
        .get(&name)
        .await
        .map(Json)
        .ok_or(PortalError::PluginNotFound(name))
}

/// DELETE /api/plugins/:name
pub async fn unregister_plugin(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.runtime.unregister(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/plugins/cycles: dependency cycles reported so far
pub async fn list_cycles(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cycles: Vec<serde_json::Value> = state
        .runtime
        .cycle_reports()
        .await
        .into_iter()
        .map(|c| json!({ "members": c.members }))
        .collect();
    Json(json!({ "cycles": cycles }))
}

/// GET /api/routes: routes currently installed by web-app plugins
pub async fn list_routes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let routes = state.runtime.dispatch().surfaces().routes.list().await;
    Json(json!({ "routes": routes }))
}

/// GET /api/services: service names currently published
pub async fn list_services(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.runtime.dispatch().surfaces().services.names().await;
    Json(json!({ "services": services }))
}

/// GET /api/fragments: mounted portal-app fragments
pub async fn list_fragments(State(state): State<AppState>) -> Json<serde_json::Value> {
    let fragments = state.runtime.dispatch().surfaces().fragments.list().await;
    Json(json!({ "fragments": fragments }))
}

/// Fallback for everything outside /api: the portal surface.
///
/// Runs the middleware chain, then dispatches against the live route table;
/// a GET that matches no route but matches a fragment's mount path returns
/// the fragment descriptor for the shell to render.
pub async fn portal_fallback(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();

    let body = match axum::body::to_bytes(request.into_body(), 1024 * 1024).await {
        Ok(bytes) if bytes.is_empty() => serde_json::Value::Null,
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
        Err(e) => {
            return PortalError::Network(format!("failed to read request body: {}", e))
                .into_response()
        }
    };

    let mut portal_request = PortalRequest {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    };

    let surfaces = state.runtime.dispatch().surfaces();
    if let Err(e) = surfaces.middleware.apply(&mut portal_request).await {
        return e.into_response();
    }

    if let Some(handler) = surfaces.routes.lookup(&method, &path).await {
        return match handler.handle(portal_request).await {
            Ok(response) => {
                let status = StatusCode::from_u16(response.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, Json(response.body)).into_response()
            }
            Err(e) => e.into_response(),
        };
    }

    if method == "GET" {
        if let Some(fragment) = surfaces.fragments.lookup_by_route(&path).await {
            return Json(json!({ "fragment": fragment })).into_response();
        }
    }

    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "NotFound".to_string(),
            format!("no plugin serves {} {}", method, path),
        )),
    )
        .into_response()
}
