//! Descriptor ingestion
//!
//! Reads a plugin package's manifest, validates it against a schema, and
//! normalizes it into `PluginDescriptor` values. Manifests come in four
//! syntaxes: JSON, YAML, TOML, or a programmatic manifest exported by a
//! dynamic library through the `portal_manifest` symbol. All of them
//! normalize to the same in-memory shape.
//!
//! Loading a manifest never executes a plugin's bootstrap code; side effects
//! are delayed until loader dispatch.

use crate::core::error::{PortalError, Result};
use serde::{Deserialize, Serialize};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

/// Manifest file names probed inside a plugin package, in priority order
pub const MANIFEST_CANDIDATES: &[&str] = &[
    "portal.json",
    "portal.yaml",
    "portal.yml",
    "portal.toml",
];

/// Symbol a programmatic (dynamic library) manifest must export.
///
/// Signature: `extern "C" fn() -> *const c_char` returning a NUL-terminated
/// JSON document with the same shape as `portal.json`. The pointer must stay
/// valid for the lifetime of the library.
pub const MANIFEST_SYMBOL: &[u8] = b"portal_manifest";

/// Plugin type
///
/// Each kind is routed to its own loader at dispatch time. The set is open:
/// a loader plugin may register a handler for a `Custom` kind at runtime, so
/// an unrecognized type string is not a descriptor error; it only becomes
/// one at dispatch time if no handler claims it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginKind {
    /// A web application contributing routes to the portal's route table
    WebApp,
    /// Request middleware installed into the portal's middleware chain
    Middleware,
    /// A backend service published into the service registry
    Service,
    /// A portal micro-frontend mounted as a fragment
    PortalApp,
    /// A loader plugin registering an additional plugin type handler
    PluginLoader,
    /// A kind served by a handler registered through a loader plugin
    Custom(String),
}

impl PluginKind {
    pub fn as_str(&self) -> &str {
        match self {
            PluginKind::WebApp => "web-app",
            PluginKind::Middleware => "middleware",
            PluginKind::Service => "service",
            PluginKind::PortalApp => "portal-app",
            PluginKind::PluginLoader => "plugin-loader",
            PluginKind::Custom(s) => s,
        }
    }
}

impl From<String> for PluginKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "web-app" => PluginKind::WebApp,
            "middleware" => PluginKind::Middleware,
            "service" => PluginKind::Service,
            "portal-app" => PluginKind::PortalApp,
            "plugin-loader" => PluginKind::PluginLoader,
            _ => PluginKind::Custom(s),
        }
    }
}

impl From<PluginKind> for String {
    fn from(kind: PluginKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized, validated in-memory representation of one plugin manifest entry
///
/// Identity is `name`, unique within a registry. A descriptor is immutable
/// once registered for a given load attempt; a new version replaces the old
/// entry entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin name
    pub name: String,
    /// Plugin type, used for loader dispatch
    pub kind: PluginKind,
    /// Bootstrap module path, relative to `package_root`
    pub bootstrap: String,
    /// Default configuration merged under the plugin's runtime config
    #[serde(default)]
    pub default_config: serde_json::Value,
    /// Names of plugins that must be loaded before this one
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Load-order tie-break within a dependency group (ascending)
    #[serde(default)]
    pub priority: i32,
    /// Root directory of the plugin package
    pub package_root: PathBuf,
}

/// Raw manifest shape shared by every accepted syntax
#[derive(Debug, Deserialize)]
struct ManifestFile {
    plugins: Vec<ManifestPlugin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestPlugin {
    name: String,
    #[serde(rename = "type")]
    kind: PluginKind,
    bootstrap: String,
    #[serde(default)]
    default_config: serde_json::Value,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: i32,
}

/// JSON Schema every manifest is validated against before deserialization
fn manifest_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["plugins"],
        "properties": {
            "plugins": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["name", "type", "bootstrap"],
                    "additionalProperties": false,
                    "properties": {
                        "name": { "type": "string", "minLength": 1 },
                        "type": { "type": "string", "minLength": 1 },
                        "bootstrap": { "type": "string", "minLength": 1 },
                        "defaultConfig": { "type": "object" },
                        "dependencies": {
                            "type": "array",
                            "items": { "type": "string", "minLength": 1 }
                        },
                        "priority": { "type": "integer" }
                    },
                    "allOf": [
                        {
                            "if": {
                                "properties": {
                                    "type": { "enum": ["web-app", "portal-app"] }
                                },
                                "required": ["type"]
                            },
                            "then": {
                                "required": ["defaultConfig"],
                                "properties": {
                                    "defaultConfig": {
                                        "type": "object",
                                        "required": ["routePath"]
                                    }
                                }
                            }
                        }
                    ]
                }
            }
        }
    })
}

/// Load and normalize a plugin manifest.
///
/// The syntax is chosen by file extension. Validation collects *all* schema
/// violations in one pass rather than failing on the first; the result is a
/// single `DescriptorError` carrying every violation.
pub fn load_manifest(manifest_path: &Path) -> Result<Vec<PluginDescriptor>> {
    let extension = manifest_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let raw: serde_json::Value = match extension.as_str() {
        "json" => {
            let content = std::fs::read_to_string(manifest_path)?;
            serde_json::from_str(&content).map_err(|e| parse_failure(manifest_path, e))?
        }
        "yaml" | "yml" => {
            let content = std::fs::read_to_string(manifest_path)?;
            serde_yaml::from_str(&content).map_err(|e| parse_failure(manifest_path, e))?
        }
        "toml" => {
            let content = std::fs::read_to_string(manifest_path)?;
            let parsed: toml::Value =
                toml::from_str(&content).map_err(|e| parse_failure(manifest_path, e))?;
            serde_json::to_value(parsed).map_err(|e| parse_failure(manifest_path, e))?
        }
        "so" | "dylib" | "dll" => read_programmatic_manifest(manifest_path)?,
        other => {
            return Err(PortalError::Descriptor {
                path: manifest_path.to_path_buf(),
                violations: vec![format!("unsupported manifest syntax: .{}", other)],
            })
        }
    };

    normalize(manifest_path, raw)
}

/// Locate the manifest file inside a plugin package directory.
///
/// Data-file manifests win over a programmatic one; a package that ships both
/// is ambiguous and rejected.
pub fn find_manifest(package_root: &Path) -> Result<Option<PathBuf>> {
    let mut found: Vec<PathBuf> = MANIFEST_CANDIDATES
        .iter()
        .map(|name| package_root.join(name))
        .filter(|p| p.is_file())
        .collect();

    let dylib = package_root.join(format!("portal_manifest.{}", dylib_extension()));
    if dylib.is_file() {
        found.push(dylib);
    }

    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(found.remove(0))),
        _ => Err(PortalError::Descriptor {
            path: package_root.to_path_buf(),
            violations: vec![format!(
                "ambiguous package: multiple manifests found ({})",
                found
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )],
        }),
    }
}

fn dylib_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// Read a programmatic manifest exported by a dynamic library.
///
/// Only the `portal_manifest` symbol is touched; no bootstrap entry point is
/// resolved or executed at this stage.
fn read_programmatic_manifest(library_path: &Path) -> Result<serde_json::Value> {
    let library = unsafe {
        libloading::Library::new(library_path).map_err(|e| PortalError::Descriptor {
            path: library_path.to_path_buf(),
            violations: vec![format!("failed to load manifest library: {}", e)],
        })?
    };

    let json = unsafe {
        let symbol: libloading::Symbol<unsafe extern "C" fn() -> *const c_char> = library
            .get(MANIFEST_SYMBOL)
            .map_err(|e| PortalError::Descriptor {
                path: library_path.to_path_buf(),
                violations: vec![format!("missing portal_manifest symbol: {}", e)],
            })?;

        let ptr = symbol();
        if ptr.is_null() {
            return Err(PortalError::Descriptor {
                path: library_path.to_path_buf(),
                violations: vec!["portal_manifest returned a null pointer".into()],
            });
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };

    serde_json::from_str(&json).map_err(|e| parse_failure(library_path, e))
}

fn parse_failure(path: &Path, err: impl std::fmt::Display) -> PortalError {
    PortalError::Descriptor {
        path: path.to_path_buf(),
        violations: vec![format!("manifest could not be parsed: {}", err)],
    }
}

/// Validate a raw manifest document and normalize it into descriptors.
///
/// `manifest_path` names the document's origin for error reporting and
/// supplies the package root (its parent directory). The remote scanner
/// feeds advertisement documents through here so remote plugins face the
/// same schema as local ones.
pub fn normalize(manifest_path: &Path, raw: serde_json::Value) -> Result<Vec<PluginDescriptor>> {
    let schema = manifest_schema();
    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|e| PortalError::Serialization(format!("manifest schema is invalid: {}", e)))?;

    // One pass, every violation collected.
    if let Err(errors) = compiled.validate(&raw) {
        let violations: Vec<String> = errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        return Err(PortalError::Descriptor {
            path: manifest_path.to_path_buf(),
            violations,
        });
    }

    let manifest: ManifestFile =
        serde_json::from_value(raw).map_err(|e| parse_failure(manifest_path, e))?;

    let package_root = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(manifest
        .plugins
        .into_iter()
        .map(|p| PluginDescriptor {
            name: p.name,
            kind: p.kind,
            bootstrap: p.bootstrap,
            default_config: p.default_config,
            dependencies: p.dependencies,
            priority: p.priority,
            package_root: package_root.clone(),
        })
        .collect())
}
