//! Plugin system with ordered, isolated event dispatch.
//!
//! Owns the set of loaded plugins, keyed by their declared name, and delivers
//! every [`ServerEvent`] to each of them in load order. A plugin that errors or
//! panics on one event is skipped for that event only and stays loaded.
//!
//! The module set sits behind a single async mutex. Loads, unloads and
//! dispatches are serialized against each other, which is what keeps delivery
//! ordered and makes load/unload all-or-nothing.

pub mod loader;

pub use loader::{platform_library_name, DylibLoader, PluginLoader, PluginModule};

use battle_events::{panic_to_error, EventVerdict, PluginError, ServerEvent};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// ============================================================================
// Plugin Manager
// ============================================================================

/// Manages loaded plugins and their lifecycles.
pub struct PluginManager {
    loader: Arc<dyn PluginLoader>,
    /// Loaded plugins in load order
    plugins: Mutex<Vec<LoadedPlugin>>,
}

/// A registered plugin with its bookkeeping.
struct LoadedPlugin {
    module: PluginModule,
    metadata: PluginMetadata,
    stats: PluginStats,
}

#[derive(Debug, Clone)]
struct PluginMetadata {
    name: String,
    version: String,
    path: PathBuf,
    loaded_at: SystemTime,
}

#[derive(Debug, Clone, Copy, Default)]
struct PluginStats {
    events_delivered: u64,
    events_failed: u64,
}

/// Result of delivering one event to every plugin.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Plugins that handled the event without error
    pub delivered: usize,
    /// Plugins that errored or panicked, with their error
    pub failed: Vec<(String, PluginError)>,
    /// First plugin that rejected a vetoable event, with its reason
    pub veto: Option<(String, String)>,
}

impl DispatchReport {
    pub fn is_vetoed(&self) -> bool {
        self.veto.is_some()
    }
}

/// Information about a loaded plugin
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub loaded_at: SystemTime,
    pub dynamic: bool,
    pub events_delivered: u64,
    pub events_failed: u64,
}

impl PluginManager {
    /// Create a manager resolving plugins through `loader`.
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            loader,
            plugins: Mutex::new(Vec::new()),
        }
    }

    /// Create a manager that loads shared libraries.
    pub fn with_dylib_loader() -> Self {
        Self::new(Arc::new(DylibLoader))
    }

    /// Load, initialize and register the plugin at `path`.
    ///
    /// Fails with [`PluginError::DuplicateName`] if a plugin with the declared
    /// name is already loaded, or [`PluginError::LoadError`] if the module
    /// cannot be resolved or its `on_load` hook fails. The loaded set is left
    /// untouched on failure.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<String, PluginError> {
        let path = path.as_ref();
        info!("Loading plugin from: {}", path.display());

        let mut plugins = self.plugins.lock().await;

        let mut module = self.loader.load(path)?;
        let name = module.plugin.name().to_string();
        let version = module.plugin.version().to_string();

        if plugins.iter().any(|p| p.metadata.name == name) {
            warn!("Refusing to load {}: a plugin with that name is already loaded", name);
            return Err(PluginError::DuplicateName(name));
        }

        let init = AssertUnwindSafe(module.plugin.on_load()).catch_unwind().await;
        match init {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Plugin {} initialization failed: {}", name, e);
                return Err(PluginError::LoadError(format!("{name}: {e}")));
            }
            Err(panic) => {
                let e = panic_to_error(panic);
                error!("Plugin {} panicked during initialization: {}", name, e);
                return Err(PluginError::LoadError(format!("{name}: {e}")));
            }
        }

        let metadata = PluginMetadata {
            name: name.clone(),
            version: version.clone(),
            path: path.to_path_buf(),
            loaded_at: SystemTime::now(),
        };
        plugins.push(LoadedPlugin {
            module,
            metadata,
            stats: PluginStats::default(),
        });

        info!("Plugin {} v{} loaded ({} total)", name, version, plugins.len());
        Ok(name)
    }

    /// Unload the plugin registered as `name`.
    ///
    /// The teardown hook runs first; its failure is logged and the plugin is
    /// released anyway.
    pub async fn unload(&self, name: &str) -> Result<(), PluginError> {
        let mut plugins = self.plugins.lock().await;

        let position = plugins
            .iter()
            .position(|p| p.metadata.name == name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let mut loaded = plugins.remove(position);
        drop(plugins);

        info!("Unloading plugin: {}", name);
        Self::teardown(&mut loaded).await;
        drop(loaded);

        info!("Plugin {} unloaded successfully", name);
        Ok(())
    }

    /// Deliver `event` to every loaded plugin, in load order.
    ///
    /// Returns once every plugin has seen the event. Errors and panics are
    /// contained per plugin. Only the first rejection of a vetoable event is
    /// recorded; later plugins still observe the event.
    pub async fn dispatch(&self, event: &ServerEvent) -> DispatchReport {
        let mut plugins = self.plugins.lock().await;
        let mut report = DispatchReport::default();

        for loaded in plugins.iter_mut() {
            let name = loaded.metadata.name.as_str();
            let outcome = AssertUnwindSafe(loaded.module.plugin.on_event(event))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(panic_to_error(panic)),
            };

            match result {
                Ok(EventVerdict::Continue) => {
                    loaded.stats.events_delivered += 1;
                    report.delivered += 1;
                }
                Ok(EventVerdict::Reject(reason)) => {
                    loaded.stats.events_delivered += 1;
                    report.delivered += 1;
                    if !event.is_vetoable() {
                        debug!(
                            "Plugin {} rejected non-vetoable event {}; ignoring",
                            name,
                            event.kind()
                        );
                    } else if report.veto.is_none() {
                        info!("Plugin {} rejected {}: {}", name, event.kind(), reason);
                        report.veto = Some((name.to_string(), reason));
                    }
                }
                Err(e) => {
                    loaded.stats.events_failed += 1;
                    warn!("Plugin {} failed handling {}: {}", name, event.kind(), e);
                    report.failed.push((name.to_string(), e));
                }
            }
        }

        report
    }

    /// Tear down every plugin, in load order.
    pub async fn shutdown_all(&self) {
        let mut plugins = self.plugins.lock().await;
        let drained: Vec<LoadedPlugin> = plugins.drain(..).collect();
        drop(plugins);

        info!("Shutting down {} plugins", drained.len());
        for mut loaded in drained {
            Self::teardown(&mut loaded).await;
        }
        info!("All plugins shut down");
    }

    /// Names of loaded plugins, in load order.
    pub async fn plugin_names(&self) -> Vec<String> {
        let plugins = self.plugins.lock().await;
        plugins.iter().map(|p| p.metadata.name.clone()).collect()
    }

    pub async fn plugin_count(&self) -> usize {
        self.plugins.lock().await.len()
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        let plugins = self.plugins.lock().await;
        plugins.iter().any(|p| p.metadata.name == name)
    }

    /// Get plugin information
    pub async fn plugin_info(&self, name: &str) -> Option<PluginInfo> {
        let plugins = self.plugins.lock().await;
        plugins
            .iter()
            .find(|p| p.metadata.name == name)
            .map(Self::info_of)
    }

    pub async fn all_plugin_info(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.lock().await;
        plugins.iter().map(Self::info_of).collect()
    }

    fn info_of(loaded: &LoadedPlugin) -> PluginInfo {
        PluginInfo {
            name: loaded.metadata.name.clone(),
            version: loaded.metadata.version.clone(),
            path: loaded.metadata.path.clone(),
            loaded_at: loaded.metadata.loaded_at,
            dynamic: loaded.module.is_dynamic(),
            events_delivered: loaded.stats.events_delivered,
            events_failed: loaded.stats.events_failed,
        }
    }

    async fn teardown(loaded: &mut LoadedPlugin) {
        let name = loaded.metadata.name.clone();
        let outcome = AssertUnwindSafe(loaded.module.plugin.on_unload())
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!("Plugin {} torn down", name),
            Ok(Err(e)) => error!("Error shutting down plugin {}: {}", name, e),
            Err(panic) => error!(
                "Plugin {} panicked during shutdown: {}",
                name,
                panic_to_error(panic)
            ),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
