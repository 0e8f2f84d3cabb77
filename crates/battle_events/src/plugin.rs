//! The plugin contract and the export macro for dynamically loaded plugins.

use crate::events::ServerEvent;
use async_trait::async_trait;

/// Name of the constructor every plugin library must export.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"create_plugin";

/// A plugin's answer to an event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventVerdict {
    /// Let the server proceed
    #[default]
    Continue,
    /// Ask the server not to proceed. Honored only for vetoable events.
    Reject(String),
}

/// Errors that can occur during plugin operations.
///
/// The manager-level variants (`DuplicateName`, `LoadError`, `NotFound`) are
/// produced by the host; plugins themselves return the remaining ones.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A plugin with this name is already loaded
    #[error("Plugin already loaded: {0}")]
    DuplicateName(String),
    /// The module could not be resolved or instantiated
    #[error("Plugin load error: {0}")]
    LoadError(String),
    /// Requested plugin was not found
    #[error("Plugin not found: {0}")]
    NotFound(String),
    /// Plugin initialization failed during load
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    /// Error occurred while handling an event
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    /// Panic or other unexpected runtime condition
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}

/// Fixed capability interface of an extension module.
///
/// Every hook runs on the emitter's task; a plugin that needs long-running work
/// should spawn its own task from `on_load`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique, stable plugin name. Used as the registration key.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Called once before the plugin starts receiving events. An error aborts
    /// the load and leaves the server unchanged.
    async fn on_load(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called for every server event, in load order.
    async fn on_event(&mut self, event: &ServerEvent) -> Result<EventVerdict, PluginError>;

    /// Teardown hook, called before the plugin is released. Errors are logged
    /// by the host and never prevent the unload.
    async fn on_unload(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Turns a panic payload into a [`PluginError::Runtime`].
pub fn panic_to_error(panic_info: Box<dyn std::any::Any + Send>) -> PluginError {
    let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
        format!("Plugin panicked: {}", s)
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        format!("Plugin panicked: {}", s)
    } else {
        "Plugin panicked with unknown error".to_string()
    };

    PluginError::Runtime(message)
}

/// Exports a plugin type from a `cdylib` crate.
///
/// The type must implement [`Plugin`] and [`Default`]. The macro emits the
/// `create_plugin` constructor the host resolves, with panics caught at the
/// FFI boundary.
#[macro_export]
macro_rules! export_plugin {
    ($plugin_type:ty) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn create_plugin() -> *mut dyn $crate::Plugin {
            match ::std::panic::catch_unwind(|| {
                let plugin: Box<dyn $crate::Plugin> = Box::new(<$plugin_type>::default());
                plugin
            }) {
                Ok(plugin) => Box::into_raw(plugin),
                Err(_) => {
                    eprintln!("Plugin creation panicked: {}", stringify!($plugin_type));
                    ::std::ptr::null_mut::<$plugin_type>() as *mut dyn $crate::Plugin
                }
            }
        }
    };
}
