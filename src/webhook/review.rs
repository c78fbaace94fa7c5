//! AdmissionReview envelope codec
//!
//! Inbound, the envelope is decoded in two steps so that an object the API
//! server forwarded but we cannot read still yields a request with a uid to
//! answer. Outbound, the response is written with `patch` as standard base64,
//! which is what `admission.k8s.io/v1` expects for the `[]byte` field.

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, PatchType};
use kube::core::{DynamicObject, Status};
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;

/// API version of the review envelope
pub const REVIEW_API_VERSION: &str = "admission.k8s.io/v1";

/// Kind of the review envelope
pub const REVIEW_KIND: &str = "AdmissionReview";

/// A decoded request and, if its object did not decode, why
#[derive(Debug)]
pub struct DecodedReview {
    /// The request; `object` is `None` when it failed to decode
    pub request: AdmissionRequest<DynamicObject>,
    /// Decode failure of the request object
    pub object_error: Option<Error>,
}

/// Decode a raw AdmissionReview body
///
/// Fails only when the envelope itself is unusable. A request object that
/// does not decode is reported through [`DecodedReview::object_error`]; an
/// undecodable `oldObject` is dropped, since only CREATE is ever mutated.
pub fn decode_review(mut body: Value) -> Result<DecodedReview, Error> {
    let object = body.pointer_mut("/request/object").map(Value::take);
    let old_object = body.pointer_mut("/request/oldObject").map(Value::take);

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(body).map_err(|e| Error::invalid_review(e.to_string()))?;
    let mut request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
            Error::invalid_review(e.to_string())
        })?;

    request.old_object = old_object.and_then(|old| serde_json::from_value(old).ok());

    let object_error = match object.filter(|object| !object.is_null()) {
        None => None,
        Some(object) => match serde_json::from_value(object) {
            Ok(object) => {
                request.object = Some(object);
                None
            }
            Err(e) => Some(Error::Decode(e)),
        },
    };

    Ok(DecodedReview {
        request,
        object_error,
    })
}

/// AdmissionReview response as written to the API server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    /// Always [`REVIEW_API_VERSION`]
    pub api_version: &'static str,
    /// Always [`REVIEW_KIND`]
    pub kind: &'static str,
    /// The answer
    pub response: ResponseBody,
}

/// The `response` section of a [`ReviewResponse`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// Echo of the request uid
    pub uid: String,
    /// Whether the object is admitted
    pub allowed: bool,
    /// Result details, carrying the message on denial
    pub status: Status,
    /// Standard base64 of the JSON Patch document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Format of `patch`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
}

impl From<AdmissionResponse> for ReviewResponse {
    fn from(response: AdmissionResponse) -> Self {
        Self {
            api_version: REVIEW_API_VERSION,
            kind: REVIEW_KIND,
            response: ResponseBody {
                uid: response.uid,
                allowed: response.allowed,
                status: response.result,
                // kube-core keeps `patch_type` private; it sets it to JsonPatch
                // exactly when `patch` is set (via `with_patch`).
                patch_type: response.patch.as_ref().map(|_| PatchType::JsonPatch),
                patch: response.patch.map(|patch| STANDARD.encode(patch)),
            },
        }
    }
}
