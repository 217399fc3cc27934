//! State contract: CRUD over versioned resources plus watch streams
//!
//! [`State`] is the transport-agnostic store boundary. Mutations are
//! mediated by optimistic concurrency (version and phase compare-and-swap),
//! ownership checks, and finalizer-gated destruction. Every mutation
//! produces an [`Event`] fanned out to watch subscribers in mutation order.

mod inmem;
pub(crate) mod watch;

pub use inmem::InMemoryState;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::resource::{Kind, Metadata, Phase, Pointer, Resource, Version};

// =============================================================================
// Events
// =============================================================================

/// A change event observed through a watch subscription.
#[derive(Debug, Clone)]
pub enum Event {
    /// Resource came into existence (or entered the subscription's filter).
    Created(Resource),
    /// Resource was mutated; carries the previous state.
    Updated { old: Resource, new: Resource },
    /// Resource was destroyed (or left the subscription's filter).
    Destroyed(Resource),
    /// End of the initial snapshot replay for kind-level watches.
    Bootstrapped,
    /// Terminal failure of the subscription; no further events follow.
    Errored(Arc<Error>),
}

impl Event {
    /// The current resource carried by the event, if any.
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Event::Created(r) | Event::Destroyed(r) => Some(r),
            Event::Updated { new, .. } => Some(new),
            Event::Bootstrapped | Event::Errored(_) => None,
        }
    }

    /// The previous resource state, for `Updated` events.
    pub fn old(&self) -> Option<&Resource> {
        match self {
            Event::Updated { old, .. } => Some(old),
            _ => None,
        }
    }

    /// Whether this event ends the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Errored(_))
    }
}

// =============================================================================
// Filters
// =============================================================================

/// A single label requirement: key presence, or key equality.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LabelTerm {
    pub key: String,
    pub value: Option<String>,
}

impl LabelTerm {
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        match metadata.labels().get(&self.key) {
            Some(actual) => self.value.as_ref().map_or(true, |want| actual == want),
            None => false,
        }
    }
}

/// Restricts a list or kind-level watch by id set and/or label terms.
///
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceFilter {
    pub ids: Option<BTreeSet<String>>,
    pub labels: Vec<LabelTerm>,
}

impl ResourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    pub fn with_label(mut self, term: LabelTerm) -> Self {
        self.labels.push(term);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_none() && self.labels.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(metadata.id()) {
                return false;
            }
        }

        self.labels.iter().all(|term| term.matches(metadata))
    }
}

// =============================================================================
// Operation Options
// =============================================================================

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Leave the spec payload in raw wire form (remote states only).
    pub skip_spec_decode: bool,
}

/// Options for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: ResourceFilter,
    pub skip_spec_decode: bool,
}

impl ListOptions {
    pub fn filtered(filter: ResourceFilter) -> Self {
        Self {
            filter,
            skip_spec_decode: false,
        }
    }
}

/// Options for `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Controller identity to record as the resource owner.
    pub owner: Option<String>,
}

impl CreateOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
        }
    }
}

/// Options for `update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Compare-and-swap: fail with `VersionConflict` unless the stored
    /// version equals this one.
    pub expected_version: Option<Version>,
    /// Fail with `PhaseConflict` unless the stored phase equals this one.
    pub expected_phase: Option<Phase>,
    /// Caller identity for the ownership check.
    pub owner: Option<String>,
}

impl UpdateOptions {
    pub fn with_expected_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_expected_phase(mut self, phase: Phase) -> Self {
        self.expected_phase = Some(phase);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Options for `destroy`.
#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    pub owner: Option<String>,
}

impl DestroyOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
        }
    }
}

/// Options for a single-resource `watch`.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Replay the last N already-logged events for the identity instead of
    /// the synthetic current-state event.
    pub tail_events: usize,
    pub skip_spec_decode: bool,
    /// Cancels event delivery; delivery also stops when the sink closes.
    pub cancel: CancellationToken,
}

impl WatchOptions {
    pub fn with_tail_events(mut self, n: usize) -> Self {
        self.tail_events = n;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Options for a kind-level `watch_kind`.
#[derive(Debug, Clone, Default)]
pub struct WatchKindOptions {
    /// Replay a snapshot of existing resources as `Created` events,
    /// terminated by a `Bootstrapped` marker, before streaming live events.
    pub bootstrap: bool,
    pub tail_events: usize,
    pub filter: ResourceFilter,
    pub skip_spec_decode: bool,
    pub cancel: CancellationToken,
}

impl WatchKindOptions {
    pub fn bootstrapped() -> Self {
        Self {
            bootstrap: true,
            ..Default::default()
        }
    }

    pub fn with_tail_events(mut self, n: usize) -> Self {
        self.tail_events = n;
        self
    }

    pub fn with_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// =============================================================================
// State Contract
// =============================================================================

/// The store boundary: CRUD with optimistic concurrency plus watch streams.
///
/// Implementations must uphold, for every sequence of operations:
/// - strictly increasing per-resource versions,
/// - finalizer-gated destruction,
/// - owner-exclusive mutation,
/// - per-kind global mutation order on watch delivery.
#[async_trait]
pub trait State: Send + Sync {
    /// Fetch a resource by pointer.
    async fn get(&self, pointer: &Pointer, options: GetOptions) -> Result<Resource>;

    /// List resources of a kind, ordered by id.
    ///
    /// Never partially fails: any per-item error aborts the whole call.
    async fn list(&self, kind: &Kind, options: ListOptions) -> Result<Vec<Resource>>;

    /// Create a resource.
    ///
    /// Assigns the initial version and timestamps (and owner, if requested),
    /// copying them back onto `resource`.
    async fn create(&self, resource: &mut Resource, options: CreateOptions) -> Result<()>;

    /// Update a resource with compare-and-swap on version and phase.
    ///
    /// Bumps the version and `updated` timestamp on success, copying the
    /// assigned values back onto `resource`.
    async fn update(&self, resource: &mut Resource, options: UpdateOptions) -> Result<()>;

    /// Destroy a resource. Blocked by pending finalizers.
    async fn destroy(&self, pointer: &Pointer, options: DestroyOptions) -> Result<()>;

    /// Add a finalizer token to a resource. Bumps the version and emits
    /// `Updated`. Idempotent. No ownership check: finalizers belong to
    /// consumers of the resource, not its owner.
    async fn add_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()>;

    /// Remove a finalizer token from a resource. Bumps the version and
    /// emits `Updated`. Idempotent. Removing the last token unblocks
    /// `destroy`.
    async fn remove_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()>;

    /// Watch a single resource.
    ///
    /// Delivers a synthetic event reflecting the current state (`Created`)
    /// or absence (`Destroyed` with a tombstone), then every subsequent
    /// event for that identity in mutation order.
    async fn watch(
        &self,
        pointer: &Pointer,
        sink: mpsc::Sender<Event>,
        options: WatchOptions,
    ) -> Result<()>;

    /// Watch all resources of a kind in global mutation order.
    async fn watch_kind(
        &self,
        kind: &Kind,
        sink: mpsc::Sender<Event>,
        options: WatchKindOptions,
    ) -> Result<()>;
}

/// Read-modify-write helper: fetch, apply `modify`, update with version CAS.
///
/// Retries on version conflicts until `cancel` fires.
pub async fn modify<F>(
    state: &dyn State,
    pointer: &Pointer,
    owner: Option<&str>,
    cancel: &CancellationToken,
    mut modify: F,
) -> Result<Resource>
where
    F: FnMut(&mut Resource),
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        let mut resource = state.get(pointer, GetOptions::default()).await?;
        let expected = resource.metadata().version();
        modify(&mut resource);

        let mut options = UpdateOptions::default().with_expected_version(expected);
        if let Some(owner) = owner {
            options = options.with_owner(owner);
        }

        match state.update(&mut resource, options).await {
            Ok(()) => return Ok(resource),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_filter_matching() {
        let mut md = Metadata::new("default", "Widget", "w1");
        md.set_label("tier", "hot");
        md.set_label("zone", "a");

        assert!(ResourceFilter::all().matches(&md));
        assert!(ResourceFilter::all()
            .with_label(LabelTerm::exists("tier"))
            .matches(&md));
        assert!(ResourceFilter::all()
            .with_label(LabelTerm::equals("tier", "hot"))
            .matches(&md));
        assert!(!ResourceFilter::all()
            .with_label(LabelTerm::equals("tier", "cold"))
            .matches(&md));
        assert!(!ResourceFilter::all()
            .with_label(LabelTerm::exists("missing"))
            .matches(&md));
    }

    #[test]
    fn test_id_filter_matching() {
        let md = Metadata::new("default", "Widget", "w1");

        assert!(ResourceFilter::all().with_id("w1").matches(&md));
        assert!(!ResourceFilter::all().with_id("w2").matches(&md));
        assert!(ResourceFilter::all()
            .with_id("w1")
            .with_id("w2")
            .matches(&md));
    }
}
