//! Fake-time plugin
//!
//! Matches pods annotated with `cloudnativegame.io/fake-time` and, on
//! creation, patches them so their processes observe a shifted clock.
//!
//! # Modes
//!
//! - **Preload** (default): libfaketime is staged by an init container and
//!   injected through `LD_PRELOAD`/`FAKETIME` in every container.
//! - **Process**: selected by `cloudnativegame.io/process-name`. A sidecar
//!   holds the named process's clock back by a fixed delay. Only past times
//!   are supported.
//!
//! # Clustered Mode
//!
//! With clustered mode on, the first pod admitted in a namespace anchors the
//! annotation value in a [`NamespaceDelayCache`]. Until the anchor expires,
//! every pod in that namespace derives its time from the anchor, so the whole
//! namespace shares one fake clock origin.

mod cache;
mod patches;
mod timespec;

use std::collections::BTreeMap;

use chrono::Utc;
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::Operation;
use tracing::{debug, info};

use super::{Plugin, PluginError};
use crate::config::FakeTimeConfig;

pub use cache::{Anchor, NamespaceDelayCache, NamespaceDelayEntry};
pub use patches::{
    INIT_CONTAINER_NAME, LIBFAKETIME_MOUNT_PATH, LIBFAKETIME_PATH, MODIFY_SUB_PROCESS_ENV,
    SIDECAR_CONTAINER_NAME, VOLUME_NAME,
};
pub use timespec::{FakeTimeError, FakeTimeSpec, ProcessDelay, TIMESTAMP_FORMAT};

/// Registry name of the plugin
pub const PLUGIN_NAME: &str = "FaketimePlugin";

/// Annotation carrying the fake time; its presence activates the plugin
pub const FAKE_TIME_ANNOTATION: &str = "cloudnativegame.io/fake-time";

/// Annotation naming the process to adjust; its presence selects process mode
pub const PROCESS_NAME_ANNOTATION: &str = "cloudnativegame.io/process-name";

/// Plugin injecting fake-time tooling into annotated pods
pub struct FakeTimePlugin {
    config: FakeTimeConfig,
    cache: NamespaceDelayCache,
}

impl FakeTimePlugin {
    /// Create the plugin with an empty anchor cache
    pub fn new(config: FakeTimeConfig) -> Self {
        Self::with_cache(config, NamespaceDelayCache::new())
    }

    /// Create the plugin around an existing anchor cache
    pub fn with_cache(config: FakeTimeConfig, cache: NamespaceDelayCache) -> Self {
        Self { config, cache }
    }

    /// The namespace anchor cache
    pub fn cache(&self) -> &NamespaceDelayCache {
        &self.cache
    }

    /// Resolve the fake time for `pod`, anchoring its namespace if clustered
    ///
    /// The annotation is validated before anchoring so a malformed value never
    /// becomes the namespace origin.
    fn resolve(&self, pod: &Pod, annotated: &str) -> Result<FakeTimeSpec, FakeTimeError> {
        let own = FakeTimeSpec::parse(annotated)?;
        if !self.config.cluster_mode {
            return Ok(own);
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let anchor =
            self.cache
                .get_or_create(namespace, annotated, self.config.namespace_delay_timeout());

        match anchor {
            Anchor::Created(_) => Ok(own),
            Anchor::Existing(entry) => {
                let now = Utc::now();
                let resolved = entry.fake_time_at(now)?;
                info!(
                    namespace = %namespace,
                    anchored_at = %entry.created_at,
                    anchor = %entry.fake_time,
                    fake_time = %resolved,
                    "Using namespace fake time anchor"
                );
                Ok(resolved)
            }
        }
    }

    fn build(&self, pod: &Pod, annotated: &str) -> Result<Vec<PatchOperation>, PluginError> {
        let spec = self.resolve(pod, annotated).map_err(policy_error)?;
        let annotations = pod.metadata.annotations.as_ref();

        let ops = match annotations.and_then(|a| a.get(PROCESS_NAME_ANNOTATION)) {
            Some(process_name) => {
                let delay = spec.process_delay(Utc::now()).map_err(policy_error)?;
                debug!(
                    process = %process_name,
                    delay_second = delay.seconds,
                    delay_nanosecond = delay.nanoseconds,
                    "Injecting clock sidecar"
                );
                patches::process_control(pod, process_name, delay, &self.config.sidecar_image)
            }
            None => {
                debug!(fake_time = %spec, "Injecting libfaketime preload");
                patches::library_preload(pod, &spec, &self.config.libfaketime_image)
            }
        };

        ops.map_err(|e| PluginError::new(PLUGIN_NAME, format!("failed to encode patch: {}", e)))
    }
}

fn policy_error(e: FakeTimeError) -> PluginError {
    PluginError::new(PLUGIN_NAME, e.to_string())
}

impl Plugin for FakeTimePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        annotations
            .get(FAKE_TIME_ANNOTATION)
            .is_some_and(|v| !v.is_empty())
    }

    fn patch(&self, pod: &Pod, operation: &Operation) -> Result<Vec<PatchOperation>, PluginError> {
        if !matches!(operation, Operation::Create) {
            return Ok(Vec::new());
        }

        let Some(annotated) = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FAKE_TIME_ANNOTATION))
        else {
            return Ok(Vec::new());
        };

        self.build(pod, annotated)
    }
}
