//! RFC6902 patch document builder
//!
//! Plugins append operations in the order they must be applied. Paths are
//! fixed when the operation is built, so an append to a list that an earlier
//! operation created in the same document must already point at `/-`.

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use serde::Serialize;

/// Ordered list of JSON Patch operations for a single admission response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchDocument {
    ops: Vec<PatchOperation>,
}

impl PatchDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation
    pub fn push(&mut self, op: PatchOperation) {
        self.ops.push(op);
    }

    /// Append all operations from a plugin, preserving their order
    pub fn extend(&mut self, ops: impl IntoIterator<Item = PatchOperation>) {
        self.ops.extend(ops);
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the document has no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in application order
    pub fn operations(&self) -> &[PatchOperation] {
        &self.ops
    }

    /// Serialize the document to the bytes carried in the admission response
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.ops)
    }

    /// Convert into the patch type expected by `AdmissionResponse::with_patch`
    pub fn into_patch(self) -> Patch {
        Patch(self.ops)
    }
}

/// Build an `add` operation for a value at the pointer formed by `tokens`
pub fn add<T: Serialize>(
    tokens: &[&str],
    value: &T,
) -> Result<PatchOperation, serde_json::Error> {
    Ok(PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens.iter().copied()),
        value: serde_json::to_value(value)?,
    }))
}
