//! In-memory state store
//!
//! Reference implementation of the [`State`] contract: per-kind resource
//! maps guarded by a mutex that also serializes event-log appends, so watch
//! snapshots are atomic with respect to the live event tail.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::resource::{Kind, Pointer, Resource};
use crate::state::watch::{KindLog, Scope, Subscription, DEFAULT_LOG_CAPACITY};
use crate::state::{
    CreateOptions, DestroyOptions, Event, GetOptions, ListOptions, State, UpdateOptions,
    WatchKindOptions, WatchOptions,
};

/// Per-kind storage slot.
///
/// The resource map mutex is held across log appends; this is what makes
/// bootstrap snapshots atomic against concurrent mutations.
struct KindSlot {
    resources: Mutex<BTreeMap<String, Resource>>,
    log: Arc<KindLog>,
}

impl KindSlot {
    fn new(log_capacity: usize) -> Self {
        Self {
            resources: Mutex::new(BTreeMap::new()),
            log: Arc::new(KindLog::new(log_capacity)),
        }
    }
}

/// In-memory implementation of the state contract.
pub struct InMemoryState {
    slots: DashMap<Kind, Arc<KindSlot>>,
    log_capacity: usize,
}

impl InMemoryState {
    /// Store with the default per-kind event log capacity.
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Store with an explicit per-kind event log capacity.
    ///
    /// A subscriber that falls more than `log_capacity` events behind
    /// receives a terminal `Errored` event and must resubscribe.
    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            log_capacity,
        }
    }

    fn slot(&self, kind: &Kind) -> Arc<KindSlot> {
        self.slots
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(KindSlot::new(self.log_capacity)))
            .clone()
    }

    /// Owner check shared by update and destroy: the caller identity must
    /// equal the stored owner exactly (empty matches empty).
    fn check_owner(stored: &Resource, caller: &Option<String>, pointer: &Pointer) -> Result<()> {
        let caller = caller.as_deref().unwrap_or("");
        if stored.metadata().owner() != caller {
            return Err(Error::OwnerConflict {
                pointer: pointer.clone(),
                owner: stored.metadata().owner().to_string(),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl State for InMemoryState {
    async fn get(&self, pointer: &Pointer, _options: GetOptions) -> Result<Resource> {
        let slot = self.slot(&pointer.kind());
        let resources = slot.resources.lock();

        resources
            .get(&pointer.id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                pointer: pointer.clone(),
            })
    }

    async fn list(&self, kind: &Kind, options: ListOptions) -> Result<Vec<Resource>> {
        let slot = self.slot(kind);
        let resources = slot.resources.lock();

        // BTreeMap iteration gives the ordered-by-id guarantee.
        Ok(resources
            .values()
            .filter(|r| options.filter.matches(r.metadata()))
            .cloned()
            .collect())
    }

    async fn create(&self, resource: &mut Resource, options: CreateOptions) -> Result<()> {
        let pointer = resource.metadata().pointer();
        let slot = self.slot(&pointer.kind());
        let mut resources = slot.resources.lock();

        if resources.contains_key(&pointer.id) {
            return Err(Error::AlreadyExists { pointer });
        }

        let now = Utc::now();
        let md = resource.metadata_mut();
        md.set_version(crate::resource::Version::first());
        md.set_created(now);
        md.set_updated(now);
        if let Some(owner) = &options.owner {
            md.set_owner(owner.clone());
        }

        resources.insert(pointer.id.clone(), resource.clone());
        slot.log.append(Event::Created(resource.clone()));

        debug!(resource = %resource, owner = %resource.metadata().owner(), "created resource");
        Ok(())
    }

    async fn update(&self, resource: &mut Resource, options: UpdateOptions) -> Result<()> {
        let pointer = resource.metadata().pointer();
        let slot = self.slot(&pointer.kind());
        let mut resources = slot.resources.lock();

        let stored = resources.get(&pointer.id).ok_or_else(|| Error::NotFound {
            pointer: pointer.clone(),
        })?;

        Self::check_owner(stored, &options.owner, &pointer)?;

        if let Some(expected) = options.expected_version {
            if stored.metadata().version() != expected {
                return Err(Error::VersionConflict {
                    pointer,
                    expected,
                    found: stored.metadata().version(),
                });
            }
        }

        if let Some(expected) = options.expected_phase {
            if stored.metadata().phase() != expected {
                return Err(Error::PhaseConflict {
                    pointer,
                    expected: Some(expected),
                });
            }
        }

        let old = stored.clone();

        // Version, timestamps, owner, and finalizers are store-controlled:
        // the caller's copies are overwritten, and finalizers only change
        // through add_finalizer/remove_finalizer.
        let md = resource.metadata_mut();
        md.set_version(old.metadata().version().next());
        md.set_updated(Utc::now());
        md.set_created(old.metadata().created());
        md.set_owner(old.metadata().owner());
        for token in old.metadata().finalizers() {
            md.add_finalizer(token.clone());
        }

        resources.insert(pointer.id.clone(), resource.clone());
        slot.log.append(Event::Updated {
            old,
            new: resource.clone(),
        });

        trace!(resource = %resource, "updated resource");
        Ok(())
    }

    async fn destroy(&self, pointer: &Pointer, options: DestroyOptions) -> Result<()> {
        let slot = self.slot(&pointer.kind());
        let mut resources = slot.resources.lock();

        let stored = resources.get(&pointer.id).ok_or_else(|| Error::NotFound {
            pointer: pointer.clone(),
        })?;

        Self::check_owner(stored, &options.owner, pointer)?;

        if !stored.metadata().finalizers().is_empty() {
            return Err(Error::PendingFinalizers {
                pointer: pointer.clone(),
                finalizers: stored.metadata().finalizers().iter().cloned().collect(),
            });
        }

        let removed = match resources.remove(&pointer.id) {
            Some(resource) => resource,
            None => {
                return Err(Error::NotFound {
                    pointer: pointer.clone(),
                })
            }
        };
        slot.log.append(Event::Destroyed(removed.clone()));

        debug!(resource = %removed, "destroyed resource");
        Ok(())
    }

    async fn add_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()> {
        let slot = self.slot(&pointer.kind());
        let mut resources = slot.resources.lock();

        let stored = resources
            .get_mut(&pointer.id)
            .ok_or_else(|| Error::NotFound {
                pointer: pointer.clone(),
            })?;

        let old = stored.clone();
        if !stored.metadata_mut().add_finalizer(token) {
            return Ok(());
        }

        stored.metadata_mut().bump_version();
        stored.metadata_mut().set_updated(Utc::now());

        let new = stored.clone();
        slot.log.append(Event::Updated { old, new });

        trace!(pointer = %pointer, token, "added finalizer");
        Ok(())
    }

    async fn remove_finalizer(&self, pointer: &Pointer, token: &str) -> Result<()> {
        let slot = self.slot(&pointer.kind());
        let mut resources = slot.resources.lock();

        let stored = resources
            .get_mut(&pointer.id)
            .ok_or_else(|| Error::NotFound {
                pointer: pointer.clone(),
            })?;

        let old = stored.clone();
        if !stored.metadata_mut().remove_finalizer(token) {
            return Ok(());
        }

        stored.metadata_mut().bump_version();
        stored.metadata_mut().set_updated(Utc::now());

        let new = stored.clone();
        slot.log.append(Event::Updated { old, new });

        trace!(pointer = %pointer, token, "removed finalizer");
        Ok(())
    }

    async fn watch(
        &self,
        pointer: &Pointer,
        sink: mpsc::Sender<Event>,
        options: WatchOptions,
    ) -> Result<()> {
        let slot = self.slot(&pointer.kind());
        let resources = slot.resources.lock();

        let (cursor, initial) = if options.tail_events > 0 {
            (slot.log.tail_cursor(options.tail_events), Vec::new())
        } else {
            // Synthetic event reflecting current state or absence.
            let initial = match resources.get(&pointer.id) {
                Some(r) => Event::Created(r.clone()),
                None => Event::Destroyed(Resource::new(
                    pointer.namespace.clone(),
                    pointer.ty.clone(),
                    pointer.id.clone(),
                )),
            };
            (slot.log.head(), vec![initial])
        };

        Subscription {
            log: slot.log.clone(),
            cursor,
            scope: Scope::Id(pointer.id.clone()),
            initial,
            sink,
            cancel: options.cancel,
        }
        .spawn();

        Ok(())
    }

    async fn watch_kind(
        &self,
        kind: &Kind,
        sink: mpsc::Sender<Event>,
        options: WatchKindOptions,
    ) -> Result<()> {
        let slot = self.slot(kind);
        let resources = slot.resources.lock();

        let mut initial = Vec::new();
        let cursor = if options.bootstrap {
            // Snapshot taken under the slot lock: atomic against the tail.
            for resource in resources.values() {
                if options.filter.matches(resource.metadata()) {
                    initial.push(Event::Created(resource.clone()));
                }
            }
            initial.push(Event::Bootstrapped);
            slot.log.head()
        } else if options.tail_events > 0 {
            slot.log.tail_cursor(options.tail_events)
        } else {
            slot.log.head()
        };

        Subscription {
            log: slot.log.clone(),
            cursor,
            scope: Scope::Kind(options.filter),
            initial,
            sink,
            cancel: options.cancel,
        }
        .spawn();

        Ok(())
    }
}
