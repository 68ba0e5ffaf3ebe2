//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods. Create requests are run through
//! the plugin registry; everything else is admitted unchanged. The webhook
//! never denies a pod: any failure past envelope decoding is logged and the
//! pod is admitted unmodified.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
        TypeMeta,
    },
};
use tracing::{debug, error, info, warn};

use crate::plugin::PluginRegistry;

use super::WebhookState;

const JSON_CONTENT_TYPE: &str = "application/json";
const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_KIND: &str = "AdmissionReview";

/// Handle a mutating admission review for Pods
///
/// This handler:
/// 1. Rejects empty bodies (400) and non-JSON content types (415)
/// 2. Decodes the AdmissionReview, answering decode failures inside the
///    envelope
/// 3. Runs Create requests through the plugin registry
/// 4. Returns the response with the request UID echoed
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        error!("Empty admission request body");
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }

    if !is_json(&headers) {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        error!(content_type = ?content_type, "Unexpected Content-Type, expect application/json");
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid Content-Type, expect `application/json`",
        )
            .into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "Failed to decode admission review");
            return Json(invalid_review(e)).into_response();
        }
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(invalid_review(e)).into_response();
        }
    };

    let response = mutate_pod(&state.registry, &request);
    Json(response.into_review()).into_response()
}

/// Error review in the v1 envelope the API server sent us
fn invalid_review(reason: impl ToString) -> AdmissionReview<DynamicObject> {
    let mut response = AdmissionResponse::invalid(reason);
    response.types = TypeMeta {
        api_version: ADMISSION_API_VERSION.to_string(),
        kind: ADMISSION_KIND.to_string(),
    };
    response.into_review()
}

/// Whether the request declares a JSON body, ignoring media type parameters
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

/// Process a single pod admission request
///
/// Always allows the pod. A patch is attached only when a plugin produced one
/// for a Create request.
pub fn mutate_pod(
    registry: &PluginRegistry,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = &request.uid;
    let allow = || AdmissionResponse::from(request);

    if !matches!(request.operation, Operation::Create) {
        debug!(uid = %uid, operation = ?request.operation, "Not a create, allowing unchanged");
        return allow();
    }

    let obj = match &request.object {
        Some(obj) => obj,
        None => {
            debug!(uid = %uid, "No pod object in request, allowing unchanged");
            return allow();
        }
    };

    let mut pod: Pod = match serde_json::to_value(obj).and_then(serde_json::from_value) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Failed to decode pod, allowing unchanged");
            return allow();
        }
    };

    // Pods created without an explicit namespace only carry it on the request
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = request.namespace.clone();
    }

    let document = match registry.dispatch(&pod, &request.operation) {
        Ok(Some(document)) => document,
        Ok(None) => {
            debug!(uid = %uid, pod = %request.name, "No plugin matched, allowing unchanged");
            return allow();
        }
        Err(e) => {
            warn!(
                uid = %uid,
                pod = %request.name,
                namespace = ?request.namespace,
                error = %e,
                "Failed to build patch, allowing unchanged"
            );
            return allow();
        }
    };

    let patch_ops = document.len();
    match allow().with_patch(document.into_patch()) {
        Ok(response) => {
            info!(
                uid = %uid,
                pod = %request.name,
                namespace = ?request.namespace,
                patch_ops,
                "Patched pod"
            );
            response
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch, allowing unchanged");
            allow()
        }
    }
}
