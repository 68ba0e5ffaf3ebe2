//! MutatingWebhookConfiguration for pod injection
//!
//! The configuration routes pod CREATE/UPDATE/DELETE admissions to the
//! webhook service with our CA bundle. It is server-side applied with force on
//! every startup, so it is created when absent and overwritten when present.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::info;

use crate::config::WebhookOptions;
use crate::{Result, FIELD_MANAGER, MUTATE_PATH, WEBHOOK_CONFIGURATION_NAME};

/// Build the configuration pointing the API server at our service
pub fn webhook_configuration(
    opts: &WebhookOptions,
    ca_cert_pem: &str,
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CONFIGURATION_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: opts.service_dns_name(),
            admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
            side_effects: "None".to_string(),
            // Never block pod creation on the webhook being down
            failure_policy: Some("Ignore".to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec![
                    "CREATE".to_string(),
                    "UPDATE".to_string(),
                    "DELETE".to_string(),
                ]),
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: None,
            }]),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: opts.service_name.clone(),
                    namespace: opts.service_namespace.clone(),
                    path: Some(MUTATE_PATH.to_string()),
                    port: Some(i32::from(opts.port)),
                }),
                ca_bundle: Some(ByteString(ca_cert_pem.as_bytes().to_vec())),
                ..Default::default()
            },
            ..Default::default()
        }]),
    }
}

/// Create or overwrite the webhook configuration in the cluster
pub async fn ensure_webhook_configuration(
    client: &Client,
    opts: &WebhookOptions,
    ca_cert_pem: &str,
) -> Result<()> {
    let config = webhook_configuration(opts, ca_cert_pem);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    api.patch(WEBHOOK_CONFIGURATION_NAME, &params, &Patch::Apply(&config))
        .await?;

    info!(
        name = WEBHOOK_CONFIGURATION_NAME,
        service = %opts.service_dns_name(),
        "Webhook configuration installed"
    );
    Ok(())
}
