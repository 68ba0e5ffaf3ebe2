//! Command line and environment configuration
//!
//! Everything is read once at startup. Invalid values stop the process before
//! the server binds, rather than surfacing on the first admission request.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::{Error, Result, DEFAULT_WEBHOOK_PORT};

/// Default lifetime of a namespace anchor in clustered mode
pub const DEFAULT_NAMESPACE_DELAY_TIMEOUT_SECS: u64 = 40;

/// faketime-injector - mutating admission webhook for fake pod clocks
#[derive(Parser, Debug, Clone)]
#[command(name = "faketime-injector", version, about, long_about = None)]
pub struct Options {
    /// Webhook server and registration settings
    #[command(flatten)]
    pub webhook: WebhookOptions,

    /// Fake-time plugin settings
    #[command(flatten)]
    pub faketime: FakeTimeConfig,
}

/// Server, service, and certificate settings
#[derive(Args, Debug, Clone)]
pub struct WebhookOptions {
    /// HTTPS port the webhook listens on (also used in the service reference)
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub port: u16,

    /// Name of the Service fronting the webhook
    #[arg(long, env = "SERVICE_NAME", default_value = "kubernetes-faketime-injector")]
    pub service_name: String,

    /// Namespace of the Service fronting the webhook
    #[arg(long, env = "SERVICE_NAMESPACE", default_value = "kube-system")]
    pub service_namespace: String,

    /// Directory holding (or receiving) ca.crt, tls.crt and tls.key
    #[arg(
        long = "webhook-server-certs-dir",
        env = "WEBHOOK_SERVER_CERTS_DIR",
        default_value = "/run/secrets/tls/"
    )]
    pub cert_dir: PathBuf,
}

impl WebhookOptions {
    /// In-cluster DNS name of the webhook service, `<name>.<namespace>.svc`
    pub fn service_dns_name(&self) -> String {
        format!("{}.{}.svc", self.service_name, self.service_namespace)
    }

    /// Subject alternative names for the serving certificate
    pub fn certificate_sans(&self) -> Vec<String> {
        vec![
            self.service_name.clone(),
            format!("{}.{}", self.service_name, self.service_namespace),
            self.service_dns_name(),
            format!("{}.cluster.local", self.service_dns_name()),
        ]
    }
}

/// Settings consumed by the fake-time plugin
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct FakeTimeConfig {
    /// Image of the clock-adjusting sidecar (process mode)
    #[arg(long, env = "FAKETIME_PLUGIN_IMAGE")]
    pub sidecar_image: String,

    /// Image of the init container that stages libfaketime (preload mode)
    #[arg(long, env = "LIBFAKETIME_PLUGIN_IMAGE")]
    pub libfaketime_image: String,

    /// Share one fake clock origin across pods of the same namespace
    #[arg(
        long,
        env = "CLUSTER_MODE",
        default_value = "false",
        action = clap::ArgAction::Set,
        value_parser = parse_cluster_mode
    )]
    pub cluster_mode: bool,

    /// Seconds a namespace anchor lives before the next pod re-anchors
    #[arg(
        long = "namespace-delay-timeout",
        env = "Namespace_Delay_Timeout",
        default_value_t = DEFAULT_NAMESPACE_DELAY_TIMEOUT_SECS
    )]
    pub namespace_delay_timeout_secs: u64,
}

impl FakeTimeConfig {
    /// Config with clustered mode off
    pub fn new(sidecar_image: impl Into<String>, libfaketime_image: impl Into<String>) -> Self {
        Self {
            sidecar_image: sidecar_image.into(),
            libfaketime_image: libfaketime_image.into(),
            cluster_mode: false,
            namespace_delay_timeout_secs: DEFAULT_NAMESPACE_DELAY_TIMEOUT_SECS,
        }
    }

    /// Enable clustered mode with the given anchor lifetime
    pub fn with_cluster_mode(mut self, timeout_secs: u64) -> Self {
        self.cluster_mode = true;
        self.namespace_delay_timeout_secs = timeout_secs;
        self
    }

    /// Anchor lifetime as a duration
    pub fn namespace_delay_timeout(&self) -> Duration {
        Duration::from_secs(self.namespace_delay_timeout_secs)
    }

    /// Reject values clap accepts but the plugin cannot use
    pub fn validate(&self) -> Result<()> {
        if self.sidecar_image.trim().is_empty() {
            return Err(Error::config("FAKETIME_PLUGIN_IMAGE must not be empty"));
        }
        if self.libfaketime_image.trim().is_empty() {
            return Err(Error::config("LIBFAKETIME_PLUGIN_IMAGE must not be empty"));
        }
        if self.cluster_mode && self.namespace_delay_timeout_secs == 0 {
            return Err(Error::config(
                "Namespace_Delay_Timeout must be positive in cluster mode",
            ));
        }
        Ok(())
    }
}

/// Only the literal `true` turns clustered mode on
fn parse_cluster_mode(value: &str) -> std::result::Result<bool, String> {
    Ok(value == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let mut argv = vec![
            "faketime-injector",
            "--sidecar-image",
            "watchmaker:v1",
            "--libfaketime-image",
            "libfaketime:v1",
        ];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_deployment_manifest() {
        let opts = parse(&[]);
        assert_eq!(opts.webhook.port, 443);
        assert_eq!(opts.webhook.service_name, "kubernetes-faketime-injector");
        assert_eq!(opts.webhook.service_namespace, "kube-system");
        assert_eq!(opts.webhook.cert_dir, PathBuf::from("/run/secrets/tls/"));
        assert!(!opts.faketime.cluster_mode);
        assert_eq!(
            opts.faketime.namespace_delay_timeout(),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn service_dns_name_is_namespaced() {
        let opts = parse(&["--service-name", "injector", "--service-namespace", "tools"]);
        assert_eq!(opts.webhook.service_dns_name(), "injector.tools.svc");
        assert!(opts
            .webhook
            .certificate_sans()
            .contains(&"injector.tools.svc".to_string()));
    }

    #[test]
    fn cluster_mode_requires_literal_true() {
        assert!(parse(&["--cluster-mode", "true"]).faketime.cluster_mode);
        assert!(!parse(&["--cluster-mode", "yes"]).faketime.cluster_mode);
        assert!(!parse(&["--cluster-mode", "false"]).faketime.cluster_mode);
    }

    #[test]
    fn invalid_timeout_is_rejected_at_startup() {
        let result = Options::try_parse_from([
            "faketime-injector",
            "--sidecar-image",
            "a",
            "--libfaketime-image",
            "b",
            "--namespace-delay-timeout",
            "soon",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_images_fail_validation() {
        assert!(FakeTimeConfig::new("side", "lib").validate().is_ok());

        let err = FakeTimeConfig::new(" ", "lib").validate().unwrap_err();
        assert!(err.to_string().contains("FAKETIME_PLUGIN_IMAGE"));

        let err = FakeTimeConfig::new("side", "").validate().unwrap_err();
        assert!(err.to_string().contains("LIBFAKETIME_PLUGIN_IMAGE"));
    }

    #[test]
    fn zero_timeout_fails_validation_in_cluster_mode() {
        let cfg = FakeTimeConfig::new("side", "lib").with_cluster_mode(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_enables_cluster_mode() {
        let cfg = FakeTimeConfig::new("side", "lib").with_cluster_mode(5);
        assert!(cfg.cluster_mode);
        assert_eq!(cfg.namespace_delay_timeout(), Duration::from_secs(5));
    }
}
