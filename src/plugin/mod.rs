//! Pod mutation plugins
//!
//! A plugin decides from pod annotations whether it applies and, if so,
//! produces the patch operations for the pod. The registry runs every
//! matching plugin in registration order and joins their operations into a
//! single patch document.

pub mod faketime;

use std::collections::BTreeMap;
use std::sync::Arc;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::Operation;
use thiserror::Error;
use tracing::debug;

use crate::config::FakeTimeConfig;
use crate::patch::PatchDocument;

/// Error raised by a plugin while building its patch
#[derive(Debug, Error)]
#[error("plugin {plugin} failed: {message}")]
pub struct PluginError {
    /// Name of the failing plugin
    pub plugin: String,
    /// What went wrong
    pub message: String,
}

impl PluginError {
    /// Create an error attributed to `plugin`
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Errors returned when registering a plugin
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The plugin reported an empty name
    #[error("plugin has an empty name")]
    EmptyName,
}

/// Capability contract of a mutation plugin
pub trait Plugin: Send + Sync {
    /// Unique, non-empty plugin name
    fn name(&self) -> &str;

    /// Whether the plugin applies to a pod with these annotations
    fn matches(&self, annotations: &BTreeMap<String, String>) -> bool;

    /// Build the patch operations for `pod`, in application order
    fn patch(&self, pod: &Pod, operation: &Operation) -> Result<Vec<PatchOperation>, PluginError>;
}

/// Ordered set of plugins consulted for every admitted pod
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin
    ///
    /// A plugin with the same name as an existing one replaces it in place.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let name = plugin.name().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        if let Some(slot) = self.plugins.iter_mut().find(|p| p.name() == name) {
            debug!(plugin = %name, "Replacing registered plugin");
            *slot = plugin;
        } else {
            debug!(plugin = %name, "Registered plugin");
            self.plugins.push(plugin);
        }
        Ok(())
    }

    /// Names of registered plugins in dispatch order
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every matching plugin against `pod`
    ///
    /// Returns `Ok(None)` when no plugin produced an operation. A plugin error
    /// aborts the dispatch. The document is left unserialized; encoding it is
    /// the caller's job.
    pub fn dispatch(
        &self,
        pod: &Pod,
        operation: &Operation,
    ) -> Result<Option<PatchDocument>, PluginError> {
        let empty = BTreeMap::new();
        let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);

        let mut document = PatchDocument::new();
        for plugin in &self.plugins {
            if !plugin.matches(annotations) {
                continue;
            }
            let ops = plugin.patch(pod, operation)?;
            debug!(plugin = %plugin.name(), ops = ops.len(), "Plugin produced patch operations");
            document.extend(ops);
        }

        if document.is_empty() {
            return Ok(None);
        }

        debug!(ops = document.len(), "Aggregated patch");
        Ok(Some(document))
    }
}

/// Registry holding the built-in plugins
pub fn builtin_registry(config: FakeTimeConfig) -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(faketime::FakeTimePlugin::new(config)))?;
    Ok(registry)
}
