//! Hot-reload module resolution
//!
//! A decorator in front of the module host: it rewrites module specifiers,
//! and nothing else. Appending a fresh cache-busting token to a specifier
//! makes the host treat the module as never-before-seen, forcing a full
//! re-evaluation instead of returning a cached instance. Third-party modules
//! keep their plain identity so shared library state stays shared.
//!
//! The token counter is monotonic for the lifetime of the resolver; a token
//! is never reused even across plugins.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Separator between a specifier and its cache-busting token
const TOKEN_MARKER: &str = "#v";

/// Path segments that mark a module as third-party even under the server root
const VENDOR_PATTERN: &str = r"(^|[/\\])(target|node_modules|vendor|\.cargo|deps)([/\\]|$)";

/// Proof that a specifier was rewritten for re-evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotReloadTicket {
    /// The specifier as the plugin declared it
    pub original: String,
    /// The rewritten specifier the module host will evaluate
    pub cache_busted: String,
    /// Token appended to the specifier, unique per resolution
    pub token: u64,
    pub issued_at: DateTime<Utc>,
}

/// Outcome of resolving one module specifier
#[derive(Debug, Clone)]
pub struct ModuleResolution {
    /// The specifier the module host should evaluate. Equal to the original
    /// when no ticket was issued.
    pub specifier: String,
    /// Present when the module must be re-evaluated from source
    pub ticket: Option<HotReloadTicket>,
}

impl ModuleResolution {
    /// Whether the host must bypass its module cache for this resolution
    pub fn reload(&self) -> bool {
        self.ticket.is_some()
    }
}

/// Pure specifier rewrite. Same inputs, same output.
pub fn cache_busted_specifier(specifier: &str, token: u64) -> String {
    format!("{}{}{}", specifier, TOKEN_MARKER, token)
}

/// Strip a cache-busting token off a specifier, returning the original.
///
/// Hosts use this to map an effective specifier back to the file it names.
pub fn strip_cache_token(specifier: &str) -> &str {
    match specifier.rfind(TOKEN_MARKER) {
        Some(idx) if specifier[idx + TOKEN_MARKER.len()..].bytes().all(|b| b.is_ascii_digit())
            && idx + TOKEN_MARKER.len() < specifier.len() =>
        {
            &specifier[..idx]
        }
        _ => specifier,
    }
}

/// Decides, per module specifier, whether the module host gets the plain
/// specifier or a cache-busted one.
pub struct HotReloadResolver {
    enabled: bool,
    server_root: std::path::PathBuf,
    counter: AtomicU64,
    vendor: Regex,
}

impl HotReloadResolver {
    pub fn new(enabled: bool, server_root: &Path) -> Self {
        Self {
            enabled,
            server_root: server_root.to_path_buf(),
            counter: AtomicU64::new(0),
            vendor: Regex::new(VENDOR_PATTERN).expect("vendor pattern is valid"),
        }
    }

    /// Resolve one specifier.
    ///
    /// In hot mode a project-owned module gets a fresh ticket on *every*
    /// call. There is no change detection here; whether the file changed is
    /// irrelevant. Disabled mode and third-party modules pass through
    /// untouched.
    pub fn resolve(&self, specifier: &str) -> ModuleResolution {
        if !self.enabled || !self.is_project_owned(Path::new(specifier)) {
            return ModuleResolution {
                specifier: specifier.to_string(),
                ticket: None,
            };
        }

        let token = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cache_busted = cache_busted_specifier(specifier, token);
        tracing::debug!(
            original = %specifier,
            effective = %cache_busted,
            "Issued hot-reload ticket"
        );
        ModuleResolution {
            specifier: cache_busted.clone(),
            ticket: Some(HotReloadTicket {
                original: specifier.to_string(),
                cache_busted,
                token,
                issued_at: Utc::now(),
            }),
        }
    }

    /// A module is project-owned when it sits under the server root and no
    /// path segment names a vendored or build-output directory.
    pub fn is_project_owned(&self, path: &Path) -> bool {
        if !path.starts_with(&self.server_root) {
            return false;
        }
        match path.strip_prefix(&self.server_root) {
            Ok(relative) => !self.vendor.is_match(&relative.to_string_lossy()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(enabled: bool) -> HotReloadResolver {
        HotReloadResolver::new(enabled, Path::new("/srv/portal"))
    }

    #[test]
    fn test_same_module_gets_distinct_tokens() {
        let resolver = resolver(true);
        let first = resolver.resolve("/srv/portal/plugins/search/src/index");
        let second = resolver.resolve("/srv/portal/plugins/search/src/index");

        let a = first.ticket.unwrap();
        let b = second.ticket.unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.cache_busted, b.cache_busted);
        assert_eq!(a.original, b.original);
    }

    #[test]
    fn test_third_party_module_keeps_identity() {
        let resolver = resolver(true);
        let first = resolver.resolve("/srv/portal/node_modules/lodash/index");
        let second = resolver.resolve("/srv/portal/node_modules/lodash/index");

        assert!(first.ticket.is_none());
        assert!(second.ticket.is_none());
        assert_eq!(first.specifier, second.specifier);
    }

    #[test]
    fn test_outside_server_root_is_third_party() {
        let resolver = resolver(true);
        let resolution = resolver.resolve("/usr/lib/shared/mod");
        assert!(resolution.ticket.is_none());
    }

    #[test]
    fn test_disabled_mode_never_issues_tickets() {
        let resolver = resolver(false);
        let resolution = resolver.resolve("/srv/portal/plugins/search/src/index");
        assert!(resolution.ticket.is_none());
        assert_eq!(resolution.specifier, "/srv/portal/plugins/search/src/index");
    }

    #[test]
    fn test_vendor_segments_excluded() {
        let resolver = resolver(true);
        for path in [
            "/srv/portal/target/debug/libplugin.so",
            "/srv/portal/vendor/dep/mod",
            "/srv/portal/a/node_modules/b/mod",
            "/srv/portal/.cargo/registry/mod",
        ] {
            assert!(resolver.resolve(path).ticket.is_none(), "{}", path);
        }
        assert!(resolver
            .resolve("/srv/portal/plugins/targeting/src/index")
            .ticket
            .is_some());
    }

    #[test]
    fn test_cache_busted_specifier_is_pure() {
        assert_eq!(
            cache_busted_specifier("/srv/p/mod", 7),
            cache_busted_specifier("/srv/p/mod", 7)
        );
        assert_ne!(
            cache_busted_specifier("/srv/p/mod", 7),
            cache_busted_specifier("/srv/p/mod", 8)
        );
    }

    #[test]
    fn test_strip_cache_token_round_trip() {
        let busted = cache_busted_specifier("/srv/p/mod", 42);
        assert_eq!(strip_cache_token(&busted), "/srv/p/mod");
        assert_eq!(strip_cache_token("/srv/p/mod"), "/srv/p/mod");
        // A '#v' that is not followed by a pure number is part of the name.
        assert_eq!(strip_cache_token("/srv/p/mod#vnext"), "/srv/p/mod#vnext");
    }

    #[test]
    fn test_tokens_are_monotonic() {
        let resolver = resolver(true);
        let tokens: Vec<u64> = (0..5)
            .map(|_| {
                resolver
                    .resolve("/srv/portal/plugins/a/src/index")
                    .ticket
                    .unwrap()
                    .token
            })
            .collect();
        for pair in tokens.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
