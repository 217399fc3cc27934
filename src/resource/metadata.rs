//! Resource metadata: identity, versioning, ownership, lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Version
// =============================================================================

/// Opaque, totally ordered per-resource version.
///
/// Bumped on every successful mutation; used for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version assigned by `create`.
    pub fn first() -> Self {
        Version(1)
    }

    /// The version following this one.
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Coarse lifecycle phase of a resource.
///
/// Usable as an optimistic precondition on update (`expected_phase`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    TearingDown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::TearingDown => write!(f, "tearing-down"),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// A resource kind: namespace plus type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind {
    pub namespace: String,
    pub ty: String,
}

impl Kind {
    pub fn new(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ty: ty.into(),
        }
    }

    /// Pointer to a specific resource of this kind.
    pub fn pointer(&self, id: impl Into<String>) -> Pointer {
        Pointer::new(self.namespace.clone(), self.ty.clone(), id)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.ty)
    }
}

/// A fully qualified resource identity: (namespace, type, id).
///
/// Globally unique and immutable for the resource's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pointer {
    pub namespace: String,
    pub ty: String,
    pub id: String,
}

impl Pointer {
    pub fn new(
        namespace: impl Into<String>,
        ty: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            ty: ty.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        Kind::new(self.namespace.clone(), self.ty.clone())
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.ty, self.id)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Versioned, owned metadata attached to every resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    namespace: String,
    ty: String,
    id: String,
    version: Version,
    /// Identifier of the controller that created the resource; empty = unowned.
    owner: String,
    phase: Phase,
    finalizers: BTreeSet<String>,
    labels: BTreeMap<String, String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl Metadata {
    /// Create metadata for a new (not yet stored) resource.
    pub fn new(
        namespace: impl Into<String>,
        ty: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            ty: ty.into(),
            id: id.into(),
            version: Version::first(),
            owner: String::new(),
            phase: Phase::Running,
            finalizers: BTreeSet::new(),
            labels: BTreeMap::new(),
            created: now,
            updated: now,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pointer(&self) -> Pointer {
        Pointer::new(self.namespace.clone(), self.ty.clone(), self.id.clone())
    }

    pub fn kind(&self) -> Kind {
        Kind::new(self.namespace.clone(), self.ty.clone())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.next();
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    pub fn set_updated(&mut self, updated: DateTime<Utc>) {
        self.updated = updated;
    }

    pub fn set_created(&mut self, created: DateTime<Utc>) {
        self.created = created;
    }

    // =========================================================================
    // Finalizers
    // =========================================================================

    /// Opaque tokens blocking destruction while present.
    pub fn finalizers(&self) -> &BTreeSet<String> {
        &self.finalizers
    }

    /// Add a finalizer token. Returns false if it was already present.
    pub fn add_finalizer(&mut self, token: impl Into<String>) -> bool {
        self.finalizers.insert(token.into())
    }

    /// Remove a finalizer token. Returns false if it was not present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        self.finalizers.remove(token)
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.contains(token)
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn remove_label(&mut self, key: &str) {
        self.labels.remove(key);
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.namespace, self.ty, self.id, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v1 = Version::first();
        let v2 = v1.next();
        let v3 = v2.next();

        assert!(v1 < v2);
        assert!(v2 < v3);
        assert_eq!(v1.to_string(), "1");
        assert_eq!(v3.to_string(), "3");
    }

    #[test]
    fn test_metadata_bump() {
        let mut md = Metadata::new("default", "Widget", "w1");
        assert_eq!(md.version(), Version::first());

        md.bump_version();
        assert_eq!(md.version(), Version::first().next());
    }

    #[test]
    fn test_finalizer_set_semantics() {
        let mut md = Metadata::new("default", "Widget", "w1");
        assert!(md.finalizers().is_empty());

        assert!(md.add_finalizer("ctrl-a"));
        assert!(!md.add_finalizer("ctrl-a"));
        assert!(md.has_finalizer("ctrl-a"));

        assert!(md.remove_finalizer("ctrl-a"));
        assert!(!md.remove_finalizer("ctrl-a"));
        assert!(md.finalizers().is_empty());
    }

    #[test]
    fn test_pointer_display() {
        let ptr = Pointer::new("ns", "Widget", "w1");
        assert_eq!(ptr.to_string(), "ns/Widget/w1");
        assert_eq!(ptr.kind().to_string(), "ns/Widget");
    }
}
