//! Resolution of plugin modules from a path.
//!
//! The manager never touches dynamic libraries directly; it asks a
//! [`PluginLoader`] for a [`PluginModule`]. The production loader is
//! [`DylibLoader`], tests inject in-process fakes.

use battle_events::{Plugin, PluginError, PLUGIN_ENTRY_SYMBOL};
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A resolved, not yet registered plugin instance.
///
/// Field order matters: the plugin is dropped before the library that holds
/// its code.
pub struct PluginModule {
    pub plugin: Box<dyn Plugin>,
    library: Option<Library>,
    pub path: PathBuf,
}

impl PluginModule {
    /// Wraps an in-process plugin with no backing library.
    pub fn in_process(plugin: Box<dyn Plugin>, path: impl Into<PathBuf>) -> Self {
        Self {
            plugin,
            library: None,
            path: path.into(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

/// Resolves and instantiates a plugin from a location.
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<PluginModule, PluginError>;
}

/// Loads plugins from shared libraries exporting `create_plugin`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl PluginLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<PluginModule, PluginError> {
        debug!("Loading plugin library from: {}", path.display());

        let library = unsafe {
            Library::new(path).map_err(|e| {
                PluginError::LoadError(format!("Failed to load library {}: {}", path.display(), e))
            })?
        };

        let plugin = unsafe {
            let create_plugin: Symbol<unsafe extern "C" fn() -> *mut dyn Plugin> =
                library.get(PLUGIN_ENTRY_SYMBOL).map_err(|e| {
                    PluginError::LoadError(format!("Failed to find create_plugin function: {}", e))
                })?;

            let plugin_ptr = create_plugin();
            if plugin_ptr.is_null() {
                return Err(PluginError::LoadError(
                    "create_plugin returned null pointer".to_string(),
                ));
            }
            Box::from_raw(plugin_ptr)
        };

        Ok(PluginModule {
            plugin,
            library: Some(library),
            path: path.to_path_buf(),
        })
    }
}

/// Platform file name of a plugin library, e.g. `libladder.so` for `ladder`.
pub fn platform_library_name(plugin_name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", plugin_name)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", plugin_name)
    } else {
        format!("lib{}.so", plugin_name)
    }
}
