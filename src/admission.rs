//! Admission decision engine
//!
//! Turns one AdmissionRequest into one admission decision:
//!
//! ```text
//! Received -> Decoded -> Mutated -> Responded
//! ```
//!
//! Any step that fails short-circuits to `Responded`. Under the default
//! [`FailurePolicy::Ignore`] the Pod is admitted unmutated; the API server is
//! never left waiting and Pod creation is never blocked by the injector.

use std::sync::Arc;

use json_patch::{Patch, PatchOperation};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::core::DynamicObject;
use tracing::{debug, error, info, warn};

use crate::config::SidecarConfig;
use crate::error::Error;
use crate::patch::{add_spec, append_to_list, containers_path, merge_annotations, volumes_path};

/// API group of the only supported resource (core)
pub const POD_GROUP: &str = "";

/// API version of the only supported resource
pub const POD_VERSION: &str = "v1";

/// Plural resource name of the only supported resource
pub const POD_RESOURCE: &str = "pods";

/// What to answer when mutation fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Admit the Pod unmutated and log the error
    #[default]
    Ignore,
    /// Reject the Pod with the error message
    Fail,
}

impl FailurePolicy {
    /// Apply the policy to an unmutated response
    pub fn fallback(self, response: AdmissionResponse, reason: &str) -> AdmissionResponse {
        match self {
            FailurePolicy::Ignore => response,
            FailurePolicy::Fail => response.deny(reason),
        }
    }
}

/// Resource kinds the injector knows how to mutate
#[derive(Debug, Clone)]
pub enum AdmissionTarget {
    /// A core/v1 Pod
    Pod(Box<Pod>),
}

impl AdmissionTarget {
    /// Decode the request object into a supported kind
    ///
    /// Returns `Ok(None)` for requests that are not this webhook's concern:
    /// other resources, sub-resources, non-CREATE operations, or no object.
    pub fn from_request(request: &AdmissionRequest<DynamicObject>) -> Result<Option<Self>, Error> {
        if !Self::applies_to(request) {
            return Ok(None);
        }

        let Some(object) = &request.object else {
            debug!(uid = %request.uid, "No object in request, allowing unchanged");
            return Ok(None);
        };

        let value = serde_json::to_value(object).map_err(Error::Decode)?;
        let pod: Pod = serde_json::from_value(value).map_err(Error::Decode)?;
        Ok(Some(AdmissionTarget::Pod(Box::new(pod))))
    }

    /// Whether `request` is a CREATE of a supported kind, regardless of its object
    pub fn applies_to(request: &AdmissionRequest<DynamicObject>) -> bool {
        if !is_pod_resource(request) {
            debug!(
                uid = %request.uid,
                group = %request.resource.group,
                version = %request.resource.version,
                resource = %request.resource.resource,
                sub_resource = ?request.sub_resource,
                "Not a pod, allowing unchanged"
            );
            return false;
        }

        // Container lists are immutable after creation
        if !matches!(request.operation, Operation::Create) {
            debug!(uid = %request.uid, operation = ?request.operation, "Not a create, allowing unchanged");
            return false;
        }

        true
    }
}

fn is_pod_resource(request: &AdmissionRequest<DynamicObject>) -> bool {
    request.resource.group == POD_GROUP
        && request.resource.version == POD_VERSION
        && request.resource.resource == POD_RESOURCE
        && request.sub_resource.is_none()
}

/// Outcome of a successful mutation attempt
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Nothing to do, admit unchanged
    Skip,
    /// Admit with this patch applied
    Patch(Patch),
}

/// Patch formats understood by the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 6902 JSON Patch
    JsonPatch,
}

/// Terminal result of one admission call
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    /// Whether the Pod is admitted
    pub allowed: bool,
    /// Operations to apply, in order (possibly empty)
    pub patch: Patch,
    /// Format of `patch`
    pub patch_type: PatchType,
    /// Rejection reason when not allowed
    pub message: Option<String>,
}

impl AdmissionDecision {
    /// Admit unchanged
    pub fn allow() -> Self {
        Self::with_patch(Patch(Vec::new()))
    }

    /// Admit with `patch` applied
    pub fn with_patch(patch: Patch) -> Self {
        Self {
            allowed: true,
            patch,
            patch_type: PatchType::JsonPatch,
            message: None,
        }
    }

    /// Reject with `message`
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            patch: Patch(Vec::new()),
            patch_type: PatchType::JsonPatch,
            message: Some(message.into()),
        }
    }

    /// Encode the decision as a response to `request`
    ///
    /// The response holds the patch as raw JSON bytes; an empty patch is left
    /// out of the response entirely.
    pub fn into_response(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Error> {
        let response = AdmissionResponse::from(request);

        if !self.allowed {
            return Ok(response.deny(self.message.unwrap_or_default()));
        }
        if self.patch.0.is_empty() {
            return Ok(response);
        }

        let operations = self.patch.0.len();
        match self.patch_type {
            PatchType::JsonPatch => response
                .with_patch(self.patch)
                .map_err(|e| Error::patch_serialization(operations, e)),
        }
    }
}

/// Computes sidecar injection patches for admitted Pods
///
/// Holds the shared, read-only config; cheap to share across requests.
#[derive(Debug, Clone)]
pub struct SidecarInjector {
    config: Arc<SidecarConfig>,
    failure_policy: FailurePolicy,
}

impl SidecarInjector {
    /// Create an injector for `config` with the default (allow-on-error) policy
    pub fn new(config: Arc<SidecarConfig>) -> Self {
        Self {
            config,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Use `policy` when mutation fails
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// The sidecar config this injector applies
    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// The policy applied when mutation fails
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Compute the mutation for `request`
    ///
    /// Errors are returned to the caller for logging; [`Self::review`] turns
    /// them into a decision.
    pub fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> Result<Mutation, Error> {
        let Some(target) = AdmissionTarget::from_request(request)? else {
            return Ok(Mutation::Skip);
        };

        let ops = match target {
            AdmissionTarget::Pod(pod) => self.patch_pod(&pod)?,
        };

        if ops.is_empty() {
            Ok(Mutation::Skip)
        } else {
            Ok(Mutation::Patch(Patch(ops)))
        }
    }

    /// Build the operations injecting the config into `pod`
    ///
    /// Order is containers, volumes, annotations.
    pub fn patch_pod(&self, pod: &Pod) -> Result<Vec<PatchOperation>, Error> {
        let mut ops = match &pod.spec {
            Some(spec) => {
                let mut ops =
                    append_to_list(&spec.containers, &self.config.containers, &containers_path())?;
                ops.extend(append_to_list(
                    spec.volumes.as_deref().unwrap_or_default(),
                    &self.config.volumes,
                    &volumes_path(),
                )?);
                ops
            }
            None => add_spec(&self.config.containers, &self.config.volumes)?
                .into_iter()
                .collect(),
        };

        ops.extend(merge_annotations(
            pod.metadata.annotations.as_ref(),
            &self.config.annotations,
        ));

        Ok(ops)
    }

    /// Decide the outcome for `request`, applying the failure policy
    pub fn review(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionDecision {
        match self.mutate(request) {
            Ok(Mutation::Skip) => AdmissionDecision::allow(),
            Ok(Mutation::Patch(patch)) => {
                info!(
                    uid = %request.uid,
                    pod = %request.name,
                    namespace = ?request.namespace,
                    patch_ops = patch.0.len(),
                    containers = ?self.config.container_names(),
                    "Injecting sidecars"
                );
                AdmissionDecision::with_patch(patch)
            }
            Err(e) => self.on_error(request, &e),
        }
    }

    /// Decide and encode the response for `request`
    pub fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        self.respond(request, self.review(request))
    }

    /// Answer a request whose object could not be decoded at all
    ///
    /// Requests this injector would never mutate are admitted unchanged;
    /// for the rest `error` goes through the failure policy like any other
    /// decode failure.
    pub fn admit_undecodable(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        error: Error,
    ) -> AdmissionResponse {
        if !AdmissionTarget::applies_to(request) {
            return AdmissionResponse::from(request);
        }
        self.respond(request, self.on_error(request, &error))
    }

    fn respond(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        decision: AdmissionDecision,
    ) -> AdmissionResponse {
        match decision.into_response(request) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                self.failure_policy
                    .fallback(AdmissionResponse::from(request), &e.to_string())
            }
        }
    }

    fn on_error(&self, request: &AdmissionRequest<DynamicObject>, error: &Error) -> AdmissionDecision {
        match self.failure_policy {
            FailurePolicy::Ignore => {
                warn!(
                    uid = %request.uid,
                    pod = %request.name,
                    namespace = ?request.namespace,
                    error = %error,
                    "Mutation failed, admitting pod unmutated"
                );
                AdmissionDecision::allow()
            }
            FailurePolicy::Fail => {
                error!(
                    uid = %request.uid,
                    pod = %request.name,
                    namespace = ?request.namespace,
                    error = %error,
                    "Mutation failed, rejecting pod"
                );
                AdmissionDecision::deny(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Volume};
    use kube::core::admission::AdmissionReview;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn sidecar_config() -> SidecarConfig {
        SidecarConfig {
            containers: vec![Container {
                name: "sidecar".to_string(),
                image: Some("nginx:1.19".to_string()),
                ..Default::default()
            }],
            volumes: vec![],
            annotations: BTreeMap::new(),
        }
    }

    fn injector(config: SidecarConfig) -> SidecarInjector {
        SidecarInjector::new(Arc::new(config))
    }

    fn request(resource: Value, operation: &str, object: Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": resource,
                "name": "web",
                "namespace": "default",
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn pods() -> Value {
        json!({ "group": "", "version": "v1", "resource": "pods" })
    }

    fn pod_create(object: Value) -> AdmissionRequest<DynamicObject> {
        request(pods(), "CREATE", object)
    }

    fn app_pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "containers": [{ "name": "app", "image": "app:v1" }] }
        })
    }

    fn expect_patch(mutation: Mutation) -> Vec<PatchOperation> {
        match mutation {
            Mutation::Patch(patch) => patch.0,
            Mutation::Skip => panic!("expected a patch, got skip"),
        }
    }

    // =========================================================================
    // Unit Tests
    // =========================================================================

    #[test]
    fn test_failure_policy_default_is_ignore() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Ignore);
        assert_eq!(
            injector(sidecar_config()).failure_policy(),
            FailurePolicy::Ignore
        );
    }

    #[test]
    fn test_decode_pod_target() {
        let req = pod_create(app_pod());
        let target = AdmissionTarget::from_request(&req).unwrap();

        match target {
            Some(AdmissionTarget::Pod(pod)) => {
                assert_eq!(pod.metadata.name.as_deref(), Some("web"));
                assert_eq!(pod.spec.unwrap().containers[0].name, "app");
            }
            None => panic!("expected a pod target"),
        }
    }

    #[test]
    fn test_configmap_is_skipped() {
        let req = request(
            json!({ "group": "", "version": "v1", "resource": "configmaps" }),
            "CREATE",
            json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm" }, "data": {} }),
        );

        let mutation = injector(sidecar_config()).mutate(&req).unwrap();
        assert!(matches!(mutation, Mutation::Skip));
    }

    #[test]
    fn test_other_group_is_skipped() {
        let req = request(
            json!({ "group": "apps", "version": "v1", "resource": "pods" }),
            "CREATE",
            app_pod(),
        );
        assert!(matches!(
            injector(sidecar_config()).mutate(&req).unwrap(),
            Mutation::Skip
        ));
    }

    #[test]
    fn test_update_is_skipped() {
        let req = request(pods(), "UPDATE", app_pod());
        assert!(matches!(
            injector(sidecar_config()).mutate(&req).unwrap(),
            Mutation::Skip
        ));
    }

    #[test]
    fn test_delete_is_skipped() {
        let req = request(pods(), "DELETE", Value::Null);
        assert!(matches!(
            injector(sidecar_config()).mutate(&req).unwrap(),
            Mutation::Skip
        ));
    }

    #[test]
    fn test_missing_object_is_skipped() {
        let req = request(pods(), "CREATE", Value::Null);
        assert!(matches!(
            injector(sidecar_config()).mutate(&req).unwrap(),
            Mutation::Skip
        ));
    }

    #[test]
    fn test_malformed_pod_surfaces_decode_error() {
        let req = pod_create(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bad" },
            "spec": { "containers": "not-a-list" }
        }));

        let err = injector(sidecar_config()).mutate(&req).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_empty_config_is_skip() {
        let req = pod_create(app_pod());
        let mutation = injector(SidecarConfig::default()).mutate(&req).unwrap();
        assert!(matches!(mutation, Mutation::Skip));
    }

    #[test]
    fn test_patch_order_containers_volumes_annotations() {
        let mut config = sidecar_config();
        config.volumes = vec![Volume {
            name: "shared".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];
        config
            .annotations
            .insert("sidecar.example.com/injected".to_string(), "true".to_string());

        let ops = expect_patch(injector(config).mutate(&pod_create(app_pod())).unwrap());

        let paths: Vec<String> = ops
            .iter()
            .map(|op| match op {
                PatchOperation::Add(a) => a.path.to_string(),
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            vec!["/spec/containers/-", "/spec/volumes", "/metadata/annotations"]
        );
    }

    #[test]
    fn test_pod_without_spec_gets_spec_created() {
        let req = pod_create(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bare" }
        }));

        let ops = expect_patch(injector(sidecar_config()).mutate(&req).unwrap());

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            PatchOperation::Add(a) => {
                assert_eq!(a.path.as_str(), "/spec");
                assert_eq!(a.value["containers"][0]["name"], "sidecar");
                assert!(a.value.get("volumes").is_none());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_fail_policy_denies_on_decode_error() {
        let req = pod_create(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bad" },
            "spec": { "containers": 42 }
        }));

        let decision = injector(sidecar_config())
            .with_failure_policy(FailurePolicy::Fail)
            .review(&req);

        assert!(!decision.allowed);
        assert!(decision
            .message
            .unwrap()
            .contains("failed to decode admission object"));
    }

    fn decode_error() -> Error {
        Error::Decode(serde_json::from_str::<Pod>("[]").unwrap_err())
    }

    #[test]
    fn test_undecodable_pod_follows_failure_policy() {
        let req = request(pods(), "CREATE", Value::Null);

        let response = injector(sidecar_config()).admit_undecodable(&req, decode_error());
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");

        let response = injector(sidecar_config())
            .with_failure_policy(FailurePolicy::Fail)
            .admit_undecodable(&req, decode_error());
        assert!(!response.allowed);
        let status = serde_json::to_value(&response.result).unwrap();
        assert!(status["message"]
            .as_str()
            .unwrap()
            .contains("failed to decode admission object"));
    }

    #[test]
    fn test_undecodable_other_resource_always_allowed() {
        let req = request(
            json!({ "group": "", "version": "v1", "resource": "configmaps" }),
            "CREATE",
            Value::Null,
        );

        let response = injector(sidecar_config())
            .with_failure_policy(FailurePolicy::Fail)
            .admit_undecodable(&req, decode_error());
        assert!(response.allowed);
    }

    #[test]
    fn test_fail_policy_fallback_denies() {
        let req = pod_create(app_pod());
        let response =
            FailurePolicy::Fail.fallback(AdmissionResponse::from(&req), "deadline exceeded");
        assert!(!response.allowed);

        let response =
            FailurePolicy::Ignore.fallback(AdmissionResponse::from(&req), "deadline exceeded");
        assert!(response.allowed);
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: the canonical sidecar is appended after the app container
    #[test]
    fn story_sidecar_appended_to_existing_container() {
        let ops = expect_patch(
            injector(sidecar_config())
                .mutate(&pod_create(app_pod()))
                .unwrap(),
        );

        assert_eq!(ops.len(), 1, "one container op, zero volume ops");
        match &ops[0] {
            PatchOperation::Add(a) => {
                assert_eq!(a.path.as_str(), "/spec/containers/-");
                assert_eq!(a.value, json!({ "name": "sidecar", "image": "nginx:1.19" }));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    /// Story: a misrouted ConfigMap is admitted untouched
    #[test]
    fn story_misrouted_resource_allowed_without_patch() {
        let req = request(
            json!({ "group": "", "version": "v1", "resource": "configmaps" }),
            "CREATE",
            json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm" } }),
        );

        let decision = injector(sidecar_config()).review(&req);

        assert!(decision.allowed);
        assert!(decision.patch.0.is_empty());
        assert!(decision.message.is_none());
    }

    /// Story: a garbled Pod is admitted unmutated rather than blocked
    #[test]
    fn story_malformed_pod_allowed_without_patch() {
        let req = pod_create(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bad" },
            "spec": { "containers": "not-a-list" }
        }));

        let injector = injector(sidecar_config());
        assert!(injector.mutate(&req).is_err(), "error is surfaced");

        let decision = injector.review(&req);
        assert!(decision.allowed);
        assert!(decision.patch.0.is_empty());

        let response = injector.admit(&req);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    /// Story: the response echoes the uid and carries the JSON patch bytes
    #[test]
    fn story_response_carries_patch() {
        let req = pod_create(app_pod());
        let response = injector(sidecar_config()).admit(&req);

        assert!(response.allowed);
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");

        let patch: Value = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        assert_eq!(
            patch,
            json!([{
                "op": "add",
                "path": "/spec/containers/-",
                "value": { "name": "sidecar", "image": "nginx:1.19" }
            }])
        );
    }

    /// Story: injecting into a Pod that already has annotations merges them
    #[test]
    fn story_annotations_merged_into_existing_map() {
        let mut config = SidecarConfig::default();
        config.annotations.insert("team".to_string(), "platform".to_string());
        config.annotations.insert("injected".to_string(), "true".to_string());

        let mut pod = app_pod();
        pod["metadata"]["annotations"] = json!({ "team": "payments" });

        let ops = expect_patch(injector(config).mutate(&pod_create(pod.clone())).unwrap());
        json_patch::patch(&mut pod, &ops).unwrap();

        assert_eq!(
            pod["metadata"]["annotations"],
            json!({ "team": "platform", "injected": "true" })
        );
    }
}
