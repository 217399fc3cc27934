//! Resource model: versioned, owned, namespaced objects with opaque payloads
//!
//! A [`Resource`] is the unit of state managed by the runtime: metadata
//! (identity, version, owner, phase, finalizers, labels) plus an opaque,
//! kind-specific spec payload that the core never interprets.

mod metadata;
pub mod registry;

pub use metadata::{Kind, Metadata, Phase, Pointer, Version};
pub use registry::{KindDescriptor, Registered, Registry};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

// =============================================================================
// Spec Payload
// =============================================================================

/// Opaque, kind-specific resource payload.
///
/// Normally carried in decoded form; a remote adapter may pass through the
/// raw wire encoding when the caller declared it does not need the decoded
/// value (`skip_spec_decode`).
#[derive(Debug, Clone, PartialEq)]
pub enum SpecPayload {
    Decoded(serde_json::Value),
    Raw(Bytes),
}

impl SpecPayload {
    /// Empty payload.
    pub fn empty() -> Self {
        SpecPayload::Decoded(serde_json::Value::Null)
    }

    /// Whether this payload is still in raw wire form.
    pub fn is_raw(&self) -> bool {
        matches!(self, SpecPayload::Raw(_))
    }

    /// Encoded bytes of the payload, for the wire.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            SpecPayload::Decoded(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            SpecPayload::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

impl Default for SpecPayload {
    fn default() -> Self {
        SpecPayload::empty()
    }
}

impl From<serde_json::Value> for SpecPayload {
    fn from(value: serde_json::Value) -> Self {
        SpecPayload::Decoded(value)
    }
}

// =============================================================================
// Resource
// =============================================================================

/// A versioned, owned, namespaced+typed+identified object.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    metadata: Metadata,
    spec: SpecPayload,
}

impl Resource {
    /// New resource with an empty spec, ready for `create`.
    pub fn new(
        namespace: impl Into<String>,
        ty: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            metadata: Metadata::new(namespace, ty, id),
            spec: SpecPayload::empty(),
        }
    }

    /// New resource of the given kind.
    pub fn new_of(kind: &Kind, id: impl Into<String>) -> Self {
        Self::new(kind.namespace.clone(), kind.ty.clone(), id)
    }

    pub fn from_parts(metadata: Metadata, spec: SpecPayload) -> Self {
        Self { metadata, spec }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn spec(&self) -> &SpecPayload {
        &self.spec
    }

    pub fn set_spec_payload(&mut self, spec: SpecPayload) {
        self.spec = spec;
    }

    /// Serialize a typed spec into the payload.
    pub fn set_spec<T: Serialize>(&mut self, spec: &T) -> Result<()> {
        self.spec = SpecPayload::Decoded(serde_json::to_value(spec)?);
        Ok(())
    }

    /// Deserialize the payload into a typed spec.
    ///
    /// Works on both decoded and raw payloads.
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.spec {
            SpecPayload::Decoded(value) => Ok(serde_json::from_value(value.clone())?),
            SpecPayload::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.metadata)
    }
}
