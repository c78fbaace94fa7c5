//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods. The body is taken as raw JSON
//! so that a Pod we cannot decode is still answered with its uid under the
//! failure policy. The injector runs on the blocking pool under the request
//! deadline; a deadline miss or a crashed worker falls back to the failure
//! policy instead of leaving the API server waiting.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{error, warn};

use super::review::{decode_review, DecodedReview, ReviewResponse};
use super::WebhookState;
use crate::admission::FailurePolicy;

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<Value>,
) -> Json<ReviewResponse> {
    let DecodedReview {
        request,
        object_error,
    } = match decode_review(body) {
        Ok(decoded) => decoded,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into());
        }
    };

    let response = match object_error {
        None => admit_with_deadline(&state, request).await,
        Some(e) => state.injector.admit_undecodable(&request, e),
    };

    Json(response.into())
}

/// Run the injector for `request`, bounded by the state's deadline
async fn admit_with_deadline(
    state: &WebhookState,
    request: AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.clone();
    let fallback = AdmissionResponse::from(&request);
    let injector = Arc::clone(&state.injector);

    run_with_deadline(
        state.request_timeout,
        state.injector.failure_policy(),
        &uid,
        fallback,
        move || injector.admit(&request),
    )
    .await
}

/// Run `work` on the blocking pool; answer `fallback` under `policy` if it
/// misses `timeout` or panics
async fn run_with_deadline<F>(
    timeout: Duration,
    policy: FailurePolicy,
    uid: &str,
    fallback: AdmissionResponse,
    work: F,
) -> AdmissionResponse
where
    F: FnOnce() -> AdmissionResponse + Send + 'static,
{
    let worker = tokio::task::spawn_blocking(work);

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(uid = %uid, error = %e, "Admission worker failed");
            policy.fallback(fallback, "sidecar injection failed")
        }
        Err(_) => {
            warn!(uid = %uid, ?timeout, "Admission deadline exceeded");
            policy.fallback(fallback, "sidecar injection deadline exceeded")
        }
    }
}
