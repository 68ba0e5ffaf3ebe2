//! faketime-injector - mutating admission webhook for fake pod clocks
//!
//! The API server calls this webhook on every pod admission. Pods annotated
//! with `cloudnativegame.io/fake-time` get a JSON Patch that makes their
//! processes observe a shifted system clock, either by preloading libfaketime
//! or by running a clock-adjusting sidecar next to the target process.
//!
//! # Request Flow
//!
//! 1. [`webhook`] decodes the `AdmissionReview` envelope
//! 2. [`plugin::PluginRegistry`] matches pod annotations against each plugin
//! 3. [`plugin::faketime`] builds the patch operations, consulting the
//!    per-namespace anchor cache when clustered mode is on
//! 4. [`patch::PatchDocument`] aggregates the operations
//! 5. The webhook encodes the response, always allowing the pod
//!
//! # Modules
//!
//! - [`config`] - Command line and environment configuration
//! - [`error`] - Error types for startup and bootstrap
//! - [`patch`] - RFC6902 patch document builder
//! - [`pki`] - Webhook serving certificates
//! - [`plugin`] - Plugin trait, registry, and the fake-time plugin
//! - [`webhook`] - Admission HTTP gateway and cluster registration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod patch;
pub mod pki;
pub mod plugin;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default HTTPS port of the webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 443;

/// Path the API server posts admission reviews to
pub const MUTATE_PATH: &str = "/mutate";

/// Name of the cluster-scoped MutatingWebhookConfiguration object
pub const WEBHOOK_CONFIGURATION_NAME: &str = "kubernetes-faketime-injector";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "faketime-injector";
