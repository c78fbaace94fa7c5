//! JSON Patch builders
//!
//! Pure functions that compute RFC 6902 operations appending or merging
//! configured additions into an object without touching what is already
//! there. Every emitted path is valid against the original object plus the
//! operations emitted before it.

use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Reference token addressing the position past the last array element
pub const APPEND_TOKEN: &str = "-";

/// Pointer to a Pod's `spec`
pub fn spec_path() -> PointerBuf {
    PointerBuf::from_tokens(["spec"])
}

/// Pointer to a Pod's `spec.containers`
pub fn containers_path() -> PointerBuf {
    PointerBuf::from_tokens(["spec", "containers"])
}

/// Pointer to a Pod's `spec.volumes`
pub fn volumes_path() -> PointerBuf {
    PointerBuf::from_tokens(["spec", "volumes"])
}

/// Pointer to an object's `metadata.annotations`
pub fn annotations_path() -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "annotations"])
}

/// Append `additions` to the list at `target`
///
/// - No additions: no operations.
/// - `existing` empty: one `add` at `target` carrying the whole list. The
///   member may not exist yet, so appending with `-` would fail.
/// - Otherwise: one `add` at `target/-` per addition, in order.
///
/// Existing entries are never removed or reordered.
pub fn append_to_list<T: Serialize>(
    existing: &[T],
    additions: &[T],
    target: &PointerBuf,
) -> Result<Vec<PatchOperation>, Error> {
    if additions.is_empty() {
        return Ok(Vec::new());
    }

    if existing.is_empty() {
        return Ok(vec![PatchOperation::Add(AddOperation {
            path: target.clone(),
            value: to_patch_value(additions, additions.len())?,
        })]);
    }

    let mut append = target.clone();
    append.push_back(APPEND_TOKEN);

    additions
        .iter()
        .map(|item| {
            Ok(PatchOperation::Add(AddOperation {
                path: append.clone(),
                value: to_patch_value(item, additions.len())?,
            }))
        })
        .collect()
}

/// Create a missing `spec` carrying `containers` and `volumes` in one `add`
///
/// Empty lists are left out; with both empty there is nothing to add. A
/// serialization failure reports the number of append operations the entries
/// would have taken against an existing spec.
pub fn add_spec<C: Serialize, V: Serialize>(
    containers: &[C],
    volumes: &[V],
) -> Result<Option<PatchOperation>, Error> {
    let entries = containers.len() + volumes.len();
    let mut spec = Map::new();
    if !containers.is_empty() {
        spec.insert("containers".to_string(), to_patch_value(containers, entries)?);
    }
    if !volumes.is_empty() {
        spec.insert("volumes".to_string(), to_patch_value(volumes, entries)?);
    }

    if spec.is_empty() {
        return Ok(None);
    }
    Ok(Some(PatchOperation::Add(AddOperation {
        path: spec_path(),
        value: Value::Object(spec),
    })))
}

/// Merge `additions` into the annotations map
///
/// Keys are visited in lexicographic order.
///
/// - `existing` is `None` (no annotations member): a single `add` of the
///   whole map at `/metadata/annotations`. Emitting one single-key `add` per
///   key would make each one overwrite the previous.
/// - Key missing or mapped to `""`: `add` at `/metadata/annotations/<key>`.
/// - Key present with a value: `replace` at `/metadata/annotations/<key>`.
///
/// Keys are escaped as reference tokens, so `example.com/role` addresses a
/// single member rather than a nested path.
pub fn merge_annotations(
    existing: Option<&BTreeMap<String, String>>,
    additions: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    if additions.is_empty() {
        return Vec::new();
    }

    let Some(existing) = existing else {
        let map: Map<String, Value> = additions
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        return vec![PatchOperation::Add(AddOperation {
            path: annotations_path(),
            value: Value::Object(map),
        })];
    };

    additions
        .iter()
        .map(|(key, value)| {
            let mut path = annotations_path();
            path.push_back(key.as_str());
            let value = Value::String(value.clone());

            match existing.get(key) {
                Some(current) if !current.is_empty() => {
                    PatchOperation::Replace(ReplaceOperation { path, value })
                }
                _ => PatchOperation::Add(AddOperation { path, value }),
            }
        })
        .collect()
}

/// Serialize a patch value, reporting the size of the patch it belongs to on failure
fn to_patch_value<T: Serialize + ?Sized>(
    value: &T,
    operations: usize,
) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::patch_serialization(operations, e))
}
