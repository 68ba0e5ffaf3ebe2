//! Error types for the webhook bootstrap
//!
//! Per-request failures never reach this type: the admission path fails open
//! and only logs. Everything here is fatal at startup.

use thiserror::Error;

use crate::pki::PkiError;
use crate::plugin::RegistryError;

/// Main error type for startup and bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// TLS material could not be loaded or generated
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Plugin registration failed
    #[error("plugin error: {0}")]
    Plugin(#[from] RegistryError),

    /// HTTPS server failed
    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Startup Failures
    // ==========================================================================
    //
    // Bootstrap errors stop the process before it serves a single request, so
    // the message is the only thing an operator sees in the pod logs.

    /// Story: A bad namespace delay timeout is reported with the offending value
    #[test]
    fn story_config_errors_name_the_bad_value() {
        let err = Error::config("Namespace_Delay_Timeout must be whole seconds, got 'abc'");
        assert!(err.to_string().contains("config error"));
        assert!(err.to_string().contains("'abc'"));

        match Error::config("any message") {
            Error::Config(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Config variant"),
        }
    }

    /// Story: PKI failures keep their category when wrapped
    #[test]
    fn story_pki_errors_are_wrapped() {
        let err: Error = PkiError::ParseError("failed to parse PEM".to_string()).into();
        assert!(err.to_string().starts_with("pki error"));
        assert!(err.to_string().contains("failed to parse PEM"));
    }

    /// Story: A plugin without a name stops startup
    #[test]
    fn story_registry_errors_are_wrapped() {
        let err: Error = RegistryError::EmptyName.into();
        assert!(matches!(err, Error::Plugin(RegistryError::EmptyName)));
        assert_eq!(err.to_string(), "plugin error: plugin has an empty name");
    }

    #[test]
    fn server_constructor_accepts_strings() {
        let err = Error::server("address in use");
        assert!(err.to_string().contains("server error: address in use"));
    }
}
