//! Plugin runtime orchestration
//!
//! `PluginRuntime` drives the pipeline end to end: descriptors come in from
//! disk, the admin API, or the remote scanner; the resolver plans a
//! dependency-ordered load; loader dispatch executes it; the registry tracks
//! every transition. All planning passes run under one lock, so group
//! ordering is never interleaved between concurrent triggers. Loads within
//! a group still run concurrently.

use crate::core::error::{PortalError, Result};
use crate::runtime::descriptor::{self, PluginDescriptor};
use crate::runtime::dispatch::LoaderDispatch;
use crate::runtime::registry::{
    EntrySnapshot, PluginRegistry, PluginStatus, RegisterOutcome,
};
use crate::runtime::resolver::{compute_load_order, CycleReport, PlanNode};
use crate::runtime::scanner::WatchEvent;
use notify::Watcher;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct PluginRuntime {
    registry: Arc<PluginRegistry>,
    dispatch: Arc<LoaderDispatch>,
    /// Signatures of cycles already reported, so a cycle is logged once per
    /// membership no matter how many planning passes see it
    reported_cycles: Mutex<HashSet<String>>,
    cycles: Mutex<Vec<CycleReport>>,
    /// Serializes planning passes; group N+1 never starts before group N is
    /// done, even with concurrent registration triggers
    plan_lock: Mutex<()>,
}

impl PluginRuntime {
    pub fn new(dispatch: Arc<LoaderDispatch>) -> Self {
        Self {
            registry: Arc::new(PluginRegistry::new()),
            dispatch,
            reported_cycles: Mutex::new(HashSet::new()),
            cycles: Mutex::new(Vec::new()),
            plan_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn dispatch(&self) -> &LoaderDispatch {
        &self.dispatch
    }

    /// Cycles reported so far, for the admin API
    pub async fn cycle_reports(&self) -> Vec<CycleReport> {
        self.cycles.lock().await.clone()
    }

    /// Register one descriptor and bring the registry back in sync.
    ///
    /// A re-registration of a loaded plugin performs the staged-reload
    /// sequence: exactly one unload of the old handle, then one load of the
    /// new descriptor.
    pub async fn register(&self, descriptor: PluginDescriptor) -> Result<RegisterOutcome> {
        let name = descriptor.name.clone();
        // Registration announces new code behind the bootstrap specifier;
        // any memoized evaluation of it is stale from here on.
        self.dispatch.invalidate_module(&descriptor);
        let outcome = self.registry.register(descriptor).await?;
        if outcome == RegisterOutcome::StagedReload {
            // Hold the plan lock so the unload/load pair never interleaves
            // with loads of unrelated plugins.
            let _guard = self.plan_lock.lock().await;
            self.unload_sequence(&name).await?;
            self.load_one(&name).await;
        }
        self.synchronize().await;
        Ok(outcome)
    }

    /// Scan a directory of plugin packages, registering every manifest found.
    ///
    /// One bad package never aborts the scan. Returns the number of plugins
    /// registered.
    pub async fn discover(&self, plugin_dir: &Path) -> Result<usize> {
        if !plugin_dir.is_dir() {
            tracing::warn!(dir = %plugin_dir.display(), "Plugin directory does not exist; nothing to discover");
            return Ok(0);
        }

        let mut registered = 0;
        for entry in walkdir::WalkDir::new(plugin_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let package_root = entry.path();
            let manifest = match descriptor::find_manifest(package_root) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(package = %package_root.display(), error = %e, "Skipping package");
                    continue;
                }
            };

            match descriptor::load_manifest(&manifest) {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        let name = descriptor.name.clone();
                        match self.registry.register(descriptor).await {
                            Ok(_) => registered += 1,
                            Err(e) => {
                                tracing::warn!(plugin = %name, error = %e, "Registration failed during discovery")
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        manifest = %manifest.display(),
                        error = %e,
                        "Invalid manifest; skipping package"
                    );
                }
            }
        }

        tracing::info!(dir = %plugin_dir.display(), registered, "Plugin discovery finished");
        self.synchronize().await;
        Ok(registered)
    }

    /// Plan and execute loads until nothing more is loadable.
    ///
    /// Pending and missing-dependency entries are candidates every pass, so
    /// a dependency registered later picks its dependents back up without
    /// any timer. Errored entries stay down until an explicit reload.
    pub async fn synchronize(&self) {
        let _guard = self.plan_lock.lock().await;

        let snapshot = self.registry.all().await;
        let mut nodes = Vec::new();
        for entry in &snapshot {
            match entry.status {
                PluginStatus::Loaded => nodes.push(plan_node(entry, true)),
                PluginStatus::Pending | PluginStatus::MissingDependency => {
                    nodes.push(plan_node(entry, false))
                }
                // In-flight or errored entries are not part of the plan; a
                // dependent of an errored plugin ends up missing-dependency.
                PluginStatus::Loading | PluginStatus::Unloading | PluginStatus::Error => {}
            }
        }

        let plan = compute_load_order(&nodes);

        for missing in &plan.missing {
            if let Err(e) = self
                .registry
                .mark_missing_dependency(&missing.name, &missing.missing)
                .await
            {
                tracing::debug!(plugin = %missing.name, error = %e, "Could not mark missing dependency");
            }
        }

        // An entry the plan no longer reports missing sheds the stale status;
        // cycle members in particular go back to pending.
        let still_missing: HashSet<&str> =
            plan.missing.iter().map(|m| m.name.as_str()).collect();
        for entry in &snapshot {
            if entry.status == PluginStatus::MissingDependency
                && !still_missing.contains(entry.descriptor.name.as_str())
            {
                if let Err(e) = self.registry.mark_pending(&entry.descriptor.name).await {
                    tracing::debug!(plugin = %entry.descriptor.name, error = %e, "Could not reset stale status");
                }
            }
        }

        self.report_cycles(&plan.cycles).await;

        for group in &plan.groups {
            // A failure earlier in the plan invalidates dependents that were
            // planned assuming success; re-check before each group.
            let mut runnable = Vec::new();
            for name in group {
                match self.unloaded_dependencies(name).await {
                    Some(unresolved) if !unresolved.is_empty() => {
                        if let Err(e) = self
                            .registry
                            .mark_missing_dependency(name, &unresolved)
                            .await
                        {
                            tracing::debug!(plugin = %name, error = %e, "Could not mark missing dependency");
                        }
                    }
                    Some(_) => runnable.push(name.clone()),
                    None => {}
                }
            }

            futures::future::join_all(runnable.iter().map(|name| self.load_one(name))).await;
        }
    }

    /// Dependencies of `name` that are not `Loaded`, or `None` when the
    /// entry itself is no longer schedulable.
    async fn unloaded_dependencies(&self, name: &str) -> Option<Vec<String>> {
        let entry = self.registry.get(name).await?;
        if !matches!(
            entry.status,
            PluginStatus::Pending | PluginStatus::MissingDependency
        ) {
            return None;
        }
        let mut unresolved = Vec::new();
        for dep in &entry.descriptor.dependencies {
            match self.registry.get(dep).await {
                Some(dep_entry) if dep_entry.status == PluginStatus::Loaded => {}
                _ => unresolved.push(dep.clone()),
            }
        }
        Some(unresolved)
    }

    async fn report_cycles(&self, cycles: &[CycleReport]) {
        for cycle in cycles {
            let signature = cycle.signature();
            let mut reported = self.reported_cycles.lock().await;
            if !reported.insert(signature) {
                continue;
            }
            drop(reported);

            let error = PortalError::Cycle {
                members: cycle.members.clone(),
            };
            tracing::error!(members = ?cycle.members, "{}", error);
            for member in &cycle.members {
                if let Err(e) = self.registry.note_cycle(member, &cycle.members).await {
                    tracing::debug!(plugin = %member, error = %e, "Could not note cycle");
                }
            }
            self.cycles.lock().await.push(cycle.clone());
        }
    }

    /// Load one plugin through dispatch, recording the outcome.
    ///
    /// Failures are plugin-local: the entry moves to `Error` and siblings
    /// are untouched.
    async fn load_one(&self, name: &str) {
        let descriptor = match self.registry.mark_loading(name).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Load skipped");
                return;
            }
        };

        match self.dispatch.load(&descriptor).await {
            Ok(handle) => {
                if let Err(e) = self.registry.mark_loaded(name, handle).await {
                    tracing::error!(plugin = %name, error = %e, "Could not record load");
                }
            }
            Err(e) => {
                if let Err(mark) = self.registry.mark_error(name, &e).await {
                    tracing::error!(plugin = %name, error = %mark, "Could not record load failure");
                }
            }
        }
    }

    /// Unload a loaded plugin: dispatch teardown, then back to `Pending`
    /// (promoting a staged descriptor if one is waiting).
    async fn unload_sequence(&self, name: &str) -> Result<()> {
        let handle = self.registry.begin_unload(name).await?;
        let result = self.dispatch.unload(handle).await;
        self.registry.mark_unloaded(name).await?;
        result
    }

    /// Explicit reload: one unload (if loaded), one load, then a sync pass
    /// so dependents follow.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| PortalError::PluginNotFound(name.to_string()))?;

        self.dispatch.invalidate_module(&entry.descriptor);
        match entry.status {
            PluginStatus::Loaded => {
                let _guard = self.plan_lock.lock().await;
                self.unload_sequence(name).await?;
                // The dependency picture may have changed while this plugin
                // was loaded; never reload straight over a gap.
                match self.unloaded_dependencies(name).await {
                    Some(unresolved) if !unresolved.is_empty() => {
                        self.registry
                            .mark_missing_dependency(name, &unresolved)
                            .await?;
                    }
                    _ => self.load_one(name).await,
                }
            }
            PluginStatus::Error | PluginStatus::MissingDependency => {
                self.registry.mark_pending(name).await?;
            }
            PluginStatus::Pending => {}
            status @ (PluginStatus::Loading | PluginStatus::Unloading) => {
                return Err(PortalError::ConcurrentAccess {
                    plugin: name.to_string(),
                    status: status.to_string(),
                    attempted: "reload".to_string(),
                });
            }
        }
        self.synchronize().await;
        Ok(())
    }

    /// Unregister a plugin, unloading it first if needed. Dependents are
    /// re-planned and end up missing-dependency.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| PortalError::PluginNotFound(name.to_string()))?;

        if entry.status == PluginStatus::Loaded {
            self.unload_sequence(name).await?;
        }
        self.registry.remove(name).await?;
        self.synchronize().await;
        Ok(())
    }

    /// Apply one remote watch event.
    pub async fn apply_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added {
                identity,
                descriptor,
            }
            | WatchEvent::Updated {
                identity,
                descriptor,
            } => {
                tracing::info!(identity = %identity, plugin = %descriptor.name, "Applying remote plugin");
                if let Err(e) = self.register(descriptor).await {
                    tracing::warn!(identity = %identity, error = %e, "Remote plugin rejected");
                }
            }
            WatchEvent::Removed { identity, name } => {
                tracing::info!(identity = %identity, plugin = %name, "Remote plugin withdrawn");
                match self.unregister(&name).await {
                    Ok(()) | Err(PortalError::PluginNotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(plugin = %name, error = %e, "Could not unregister remote plugin")
                    }
                }
            }
        }
    }

    /// Unload every loaded plugin in reverse dependency order.
    pub async fn shutdown(&self) {
        let _guard = self.plan_lock.lock().await;

        let loaded = self
            .registry
            .query(|s| s.status == PluginStatus::Loaded)
            .await;
        let loaded_names: HashSet<&str> = loaded
            .iter()
            .map(|s| s.descriptor.name.as_str())
            .collect();

        // Plan the loaded set as if loading from scratch, then walk the
        // groups backwards.
        let nodes: Vec<PlanNode> = loaded
            .iter()
            .map(|entry| PlanNode {
                name: entry.descriptor.name.clone(),
                dependencies: entry
                    .descriptor
                    .dependencies
                    .iter()
                    .filter(|d| loaded_names.contains(d.as_str()))
                    .cloned()
                    .collect(),
                priority: entry.descriptor.priority,
                satisfied: false,
            })
            .collect();
        let plan = compute_load_order(&nodes);

        for group in plan.groups.iter().rev() {
            for name in group.iter().rev() {
                if let Err(e) = self.unload_sequence(name).await {
                    tracing::warn!(plugin = %name, error = %e, "Unload failed during shutdown");
                }
            }
        }
        tracing::info!("Plugin runtime shut down");
    }

    /// Watch the plugin directory and re-run discovery when it changes.
    ///
    /// The returned watcher must be kept alive for events to flow.
    pub fn spawn_plugin_dir_watcher(
        self: &Arc<Self>,
        plugin_dir: PathBuf,
    ) -> Result<(notify::RecommendedWatcher, tokio::task::JoinHandle<()>)> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                // A full channel already has a rescan queued.
                Ok(_) => {
                    let _ = tx.try_send(());
                }
                Err(e) => tracing::warn!(error = %e, "Plugin directory watch error"),
            }
        })
        .map_err(|e| PortalError::Runtime(format!("failed to create watcher: {}", e)))?;
        watcher
            .watch(&plugin_dir, notify::RecursiveMode::Recursive)
            .map_err(|e| PortalError::Runtime(format!("failed to watch plugin dir: {}", e)))?;

        tracing::info!(dir = %plugin_dir.display(), "Watching plugin directory");

        let runtime = Arc::clone(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Settle window for editors and build tools that write in
                // several steps.
                tokio::time::sleep(Duration::from_millis(500)).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = runtime.discover(&plugin_dir).await {
                    tracing::warn!(error = %e, "Rescan after directory change failed");
                }
            }
        });

        Ok((watcher, task))
    }
}

fn plan_node(entry: &EntrySnapshot, satisfied: bool) -> PlanNode {
    PlanNode {
        name: entry.descriptor.name.clone(),
        dependencies: entry.descriptor.dependencies.clone(),
        priority: entry.descriptor.priority,
        satisfied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::descriptor::PluginKind;
    use crate::runtime::handlers;
    use crate::runtime::hot_reload::HotReloadResolver;
    use crate::runtime::module_host::{
        BootstrapArgs, BootstrapOutput, BootstrapPayload, FactoryHost, PortalBootstrap,
        PortalService, TeardownHook,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const ROOT: &str = "/srv/portal";

    struct Recorder {
        loads: StdMutex<Vec<String>>,
        unloads: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                loads: StdMutex::new(Vec::new()),
                unloads: StdMutex::new(Vec::new()),
            })
        }

        fn loads(&self) -> Vec<String> {
            self.loads.lock().unwrap().clone()
        }

        fn unloads(&self) -> Vec<String> {
            self.unloads.lock().unwrap().clone()
        }
    }

    struct NullService;

    #[async_trait::async_trait]
    impl PortalService for NullService {
        async fn call(&self, _method: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
            Ok(json!(null))
        }
    }

    /// Bootstrap that records its invocation and returns a service output.
    struct RecordingBootstrap {
        recorder: Arc<Recorder>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl PortalBootstrap for RecordingBootstrap {
        async fn invoke(&self, args: BootstrapArgs) -> Result<BootstrapPayload> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(PortalError::Initialization {
                    plugin: args.plugin_name.clone(),
                    cause: "bootstrap rejected".into(),
                });
            }
            self.recorder
                .loads
                .lock()
                .unwrap()
                .push(args.plugin_name.clone());

            let recorder = Arc::clone(&self.recorder);
            let plugin = args.plugin_name.clone();
            let teardown: TeardownHook = Box::new(move || {
                Box::pin(async move {
                    recorder.unloads.lock().unwrap().push(plugin);
                    Ok(())
                })
            });
            Ok(BootstrapPayload {
                output: BootstrapOutput::Service {
                    services: vec![(
                        format!("{}-svc", args.plugin_name),
                        Arc::new(NullService) as Arc<dyn PortalService>,
                    )],
                },
                teardown: Some(teardown),
            })
        }
    }

    struct Fixture {
        runtime: Arc<PluginRuntime>,
        host: Arc<FactoryHost>,
        recorder: Arc<Recorder>,
    }

    fn fixture_with(hot_reload: bool, timeout: Duration) -> Fixture {
        let host = Arc::new(FactoryHost::new());
        let resolver = Arc::new(HotReloadResolver::new(hot_reload, Path::new(ROOT)));
        let dispatch = Arc::new(LoaderDispatch::new(
            Arc::clone(&host) as Arc<dyn crate::runtime::module_host::ModuleHost>,
            resolver,
            timeout,
            PathBuf::from("/tmp/portal-data"),
        ));
        handlers::register_builtin(&dispatch);
        Fixture {
            runtime: Arc::new(PluginRuntime::new(dispatch)),
            host,
            recorder: Recorder::new(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false, Duration::from_secs(5))
    }

    fn descriptor(name: &str, deps: &[&str], priority: i32) -> PluginDescriptor {
        PluginDescriptor {
            name: name.into(),
            kind: PluginKind::Service,
            bootstrap: "src/index".into(),
            default_config: json!({}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority,
            package_root: PathBuf::from(ROOT).join("plugins").join(name),
        }
    }

    fn specifier(name: &str) -> String {
        format!("{}/plugins/{}/src/index", ROOT, name)
    }

    impl Fixture {
        fn stage(&self, name: &str) {
            self.stage_with(name, false, None);
        }

        fn stage_with(&self, name: &str, fail: bool, delay: Option<Duration>) {
            let recorder = Arc::clone(&self.recorder);
            self.host.register_factory(&specifier(name), move || {
                Ok(Arc::new(RecordingBootstrap {
                    recorder: Arc::clone(&recorder),
                    fail,
                    delay,
                }) as Arc<dyn PortalBootstrap>)
            });
        }

        async fn status(&self, name: &str) -> PluginStatus {
            self.runtime.registry().get(name).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_dependency_loads_before_dependent() {
        let f = fixture();
        f.stage("svc");
        f.stage("app");

        // Dependent registered first; order must still be svc then app.
        f.runtime
            .register(descriptor("app", &["svc"], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();

        assert_eq!(f.status("app").await, PluginStatus::Loaded);
        assert_eq!(f.status("svc").await, PluginStatus::Loaded);
        assert_eq!(f.recorder.loads(), vec!["svc", "app"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_until_registered() {
        let f = fixture();
        f.stage("app");
        f.runtime
            .register(descriptor("app", &["svc"], 0))
            .await
            .unwrap();
        assert_eq!(f.status("app").await, PluginStatus::MissingDependency);

        // No timer involved: registering the dependency is the trigger.
        f.stage("svc");
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        assert_eq!(f.status("app").await, PluginStatus::Loaded);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent_until_reregister() {
        let f = fixture();
        f.stage_with("svc", true, None);
        f.stage("app");

        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("app", &["svc"], 0))
            .await
            .unwrap();

        assert_eq!(f.status("svc").await, PluginStatus::Error);
        assert_eq!(f.status("app").await, PluginStatus::MissingDependency);

        // A fixed version of svc arrives; app follows automatically.
        f.stage_with("svc", false, None);
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        assert_eq!(f.status("svc").await, PluginStatus::Loaded);
        assert_eq!(f.status("app").await, PluginStatus::Loaded);
    }

    #[tokio::test]
    async fn test_group_order_priority_then_name() {
        let f = fixture();
        for name in ["base", "zeta", "alpha", "late"] {
            f.stage(name);
        }
        f.runtime
            .register(descriptor("zeta", &["base"], 1))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("alpha", &["base"], 1))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("late", &["base"], 9))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("base", &[], 0))
            .await
            .unwrap();

        let loads = f.recorder.loads();
        assert_eq!(loads[0], "base");
        // Within the second group: ascending priority, then name.
        let group: Vec<&str> = loads[1..].iter().map(String::as_str).collect();
        assert_eq!(group, vec!["alpha", "zeta", "late"]);
    }

    #[tokio::test]
    async fn test_cycle_members_stay_pending_and_report_once() {
        let f = fixture();
        f.stage("a");
        f.stage("b");
        f.stage("standalone");

        f.runtime
            .register(descriptor("a", &["b"], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("b", &["a"], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("standalone", &[], 0))
            .await
            .unwrap();

        assert_eq!(f.status("a").await, PluginStatus::Pending);
        assert_eq!(f.status("b").await, PluginStatus::Pending);
        assert_eq!(f.status("standalone").await, PluginStatus::Loaded);

        // Repeated passes do not re-report the same membership.
        f.runtime.synchronize().await;
        f.runtime.synchronize().await;
        assert_eq!(f.runtime.cycle_reports().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_is_one_unload_then_one_load() {
        let f = fixture();
        f.stage("svc");
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        assert_eq!(f.recorder.loads().len(), 1);

        f.runtime.reload("svc").await.unwrap();

        assert_eq!(f.recorder.unloads(), vec!["svc"]);
        assert_eq!(f.recorder.loads(), vec!["svc", "svc"]);
        assert_eq!(f.status("svc").await, PluginStatus::Loaded);
    }

    #[tokio::test]
    async fn test_reregister_loaded_plugin_staged_reload() {
        let f = fixture();
        f.stage("svc");
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();

        let outcome = f
            .runtime
            .register(descriptor("svc", &[], 42))
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::StagedReload);

        assert_eq!(f.recorder.unloads().len(), 1);
        assert_eq!(f.recorder.loads().len(), 2);
        let entry = f.runtime.registry().get("svc").await.unwrap();
        assert_eq!(entry.status, PluginStatus::Loaded);
        assert_eq!(entry.descriptor.priority, 42);
    }

    #[tokio::test]
    async fn test_unregister_unloads_and_orphans_dependents() {
        let f = fixture();
        f.stage("svc");
        f.stage("app");
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("app", &["svc"], 0))
            .await
            .unwrap();

        f.runtime.unregister("svc").await.unwrap();

        assert_eq!(f.recorder.unloads(), vec!["svc"]);
        assert!(f.runtime.registry().get("svc").await.is_none());
        // Loaded dependents stay up; they only re-plan on their own reload.
        assert_eq!(f.status("app").await, PluginStatus::Loaded);

        f.runtime.reload("app").await.unwrap();
        assert_eq!(f.status("app").await, PluginStatus::MissingDependency);
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_marks_error() {
        let f = fixture_with(false, Duration::from_millis(20));
        f.stage_with("slow", false, Some(Duration::from_millis(200)));

        f.runtime
            .register(descriptor("slow", &[], 0))
            .await
            .unwrap();

        let entry = f.runtime.registry().get("slow").await.unwrap();
        assert_eq!(entry.status, PluginStatus::Error);
        assert!(entry.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_hot_reload_reevaluates_module_each_load() {
        let f = fixture_with(true, Duration::from_secs(5));
        let evaluations = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::clone(&f.recorder);
        let counter = Arc::clone(&evaluations);
        f.host.register_factory(&specifier("svc"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingBootstrap {
                recorder: Arc::clone(&recorder),
                fail: false,
                delay: None,
            }) as Arc<dyn PortalBootstrap>)
        });

        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        f.runtime.reload("svc").await.unwrap();

        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watch_events_drive_registry() {
        let f = fixture();
        f.stage("remote");
        let desc = descriptor("remote", &[], 0);

        f.runtime
            .apply_watch_event(WatchEvent::Added {
                identity: "http://ep#remote".into(),
                descriptor: desc.clone(),
            })
            .await;
        assert_eq!(f.status("remote").await, PluginStatus::Loaded);

        f.runtime
            .apply_watch_event(WatchEvent::Removed {
                identity: "http://ep#remote".into(),
                name: "remote".into(),
            })
            .await;
        assert!(f.runtime.registry().get("remote").await.is_none());

        // Removal of something never registered is a no-op.
        f.runtime
            .apply_watch_event(WatchEvent::Removed {
                identity: "http://ep#ghost".into(),
                name: "ghost".into(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_unloads_in_reverse_order() {
        let f = fixture();
        f.stage("svc");
        f.stage("app");
        f.runtime
            .register(descriptor("svc", &[], 0))
            .await
            .unwrap();
        f.runtime
            .register(descriptor("app", &["svc"], 0))
            .await
            .unwrap();

        f.runtime.shutdown().await;

        assert_eq!(f.recorder.unloads(), vec!["app", "svc"]);
        assert_eq!(f.status("svc").await, PluginStatus::Pending);
        assert_eq!(f.status("app").await, PluginStatus::Pending);
    }

    #[test]
    fn test_runtime_is_shareable_across_tasks() {
        // The runtime is handed to spawned tasks and axum handlers as
        // Arc<PluginRuntime>; that requires the whole ownership chain down
        // to stored teardown hooks to be Send + Sync.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PluginRuntime>();
        assert_send_sync::<crate::runtime::registry::PluginRegistry>();
        assert_send_sync::<crate::runtime::dispatch::LoadedHandle>();
    }

    #[tokio::test]
    async fn test_plugin_dir_watcher_starts_and_stops() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();

        let (watcher, task) = f
            .runtime
            .spawn_plugin_dir_watcher(dir.path().to_path_buf())
            .unwrap();

        // Dropping the watcher closes the event channel; the task drains out.
        drop(watcher);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_skips_bad_packages() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(
            good.join("portal.json"),
            r#"{ "plugins": [{ "name": "good", "type": "service", "bootstrap": "src/index" }] }"#,
        )
        .unwrap();

        let bad = dir.path().join("bad");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(bad.join("portal.json"), "{ not json").unwrap();

        // No manifest at all: silently skipped.
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let recorder = Arc::clone(&f.recorder);
        f.host.register_factory(
            &good.join("src/index").to_string_lossy(),
            move || {
                Ok(Arc::new(RecordingBootstrap {
                    recorder: Arc::clone(&recorder),
                    fail: false,
                    delay: None,
                }) as Arc<dyn PortalBootstrap>)
            },
        );

        let registered = f.runtime.discover(dir.path()).await.unwrap();
        assert_eq!(registered, 1);
        assert_eq!(f.status("good").await, PluginStatus::Loaded);
    }
}
