//! Watch engine: ordered event logs and subscription delivery
//!
//! Every kind has a bounded event log; each subscription is a cursor over
//! that log plus a dedicated forwarder task. The forwarder blocks on the
//! subscriber's bounded channel (backpressure) and converts a cursor that
//! fell off the log into a single terminal `Errored` event.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::state::{Event, ResourceFilter};

/// Default per-kind event log capacity.
pub(crate) const DEFAULT_LOG_CAPACITY: usize = 1000;

// =============================================================================
// Kind Log
// =============================================================================

struct LogInner {
    /// Sequence number the next appended event will receive.
    next_seq: u64,
    /// Events with sequence numbers `[next_seq - len, next_seq)`.
    events: VecDeque<Event>,
}

/// Bounded, monotonically numbered event log for one resource kind.
pub(crate) struct KindLog {
    inner: Mutex<LogInner>,
    notify: Notify,
    capacity: usize,
}

/// Cursor fell behind the log start; the subscriber must resubscribe.
#[derive(Debug)]
pub(crate) struct Overrun;

impl KindLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                next_seq: 0,
                events: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append one event, evicting the oldest if the log is full.
    pub(crate) fn append(&self, event: Event) {
        {
            let mut inner = self.inner.lock();
            if inner.events.len() == self.capacity {
                inner.events.pop_front();
            }
            inner.events.push_back(event);
            inner.next_seq += 1;
        }
        self.notify.notify_waiters();
    }

    /// Sequence number of the next event to be appended.
    pub(crate) fn head(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Cursor position replaying the last `tail` events (clamped to the
    /// log start).
    pub(crate) fn tail_cursor(&self, tail: usize) -> u64 {
        let inner = self.inner.lock();
        let start = inner.next_seq - inner.events.len() as u64;
        inner.next_seq.saturating_sub(tail as u64).max(start)
    }

    /// Collect all events at or after `cursor`, returning the advanced
    /// cursor. Fails if `cursor` already fell off the log.
    fn collect_from(&self, cursor: u64) -> Result<(u64, Vec<Event>), Overrun> {
        let inner = self.inner.lock();
        let start = inner.next_seq - inner.events.len() as u64;

        if cursor < start {
            return Err(Overrun);
        }

        let offset = (cursor - start) as usize;
        let events = inner.events.iter().skip(offset).cloned().collect();
        Ok((inner.next_seq, events))
    }

    fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

// =============================================================================
// Subscription Scope
// =============================================================================

/// What a subscription is interested in.
pub(crate) enum Scope {
    /// Single identity; events keep their original type.
    Id(String),
    /// Whole kind restricted by a filter; resources entering or leaving the
    /// filter's match set surface as `Created`/`Destroyed`.
    Kind(ResourceFilter),
}

impl Scope {
    /// Project a logged event through this scope. `None` drops the event.
    fn project(&self, event: Event) -> Option<Event> {
        match self {
            Scope::Id(id) => match event.resource() {
                Some(r) if r.metadata().id() == id.as_str() => Some(event),
                _ => None,
            },
            Scope::Kind(filter) if filter.is_empty() => Some(event),
            Scope::Kind(filter) => match event {
                Event::Created(r) => filter.matches(r.metadata()).then_some(Event::Created(r)),
                Event::Destroyed(r) => {
                    filter.matches(r.metadata()).then_some(Event::Destroyed(r))
                }
                Event::Updated { old, new } => {
                    match (filter.matches(old.metadata()), filter.matches(new.metadata())) {
                        (true, true) => Some(Event::Updated { old, new }),
                        (false, true) => Some(Event::Created(new)),
                        (true, false) => Some(Event::Destroyed(new)),
                        (false, false) => None,
                    }
                }
                other => Some(other),
            },
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// One consumer's cursor over a kind log, driven by a forwarder task.
pub(crate) struct Subscription {
    pub(crate) log: Arc<KindLog>,
    pub(crate) cursor: u64,
    pub(crate) scope: Scope,
    /// Synthetic snapshot / bootstrap / tail events delivered before live
    /// tailing starts.
    pub(crate) initial: Vec<Event>,
    pub(crate) sink: mpsc::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

impl Subscription {
    /// Spawn the forwarder task for this subscription.
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        for event in std::mem::take(&mut self.initial) {
            if !self.deliver(event).await {
                return;
            }
        }

        loop {
            // Register for wakeup before reading, so an append between the
            // read and the await is not lost.
            let notified = self.log.notified();

            let (next_cursor, events) = match self.log.collect_from(self.cursor) {
                Ok(collected) => collected,
                Err(Overrun) => {
                    debug!("watch subscription overran the event log");
                    let _ = self
                        .deliver(Event::Errored(Arc::new(Error::WatchOverrun)))
                        .await;
                    return;
                }
            };
            self.cursor = next_cursor;

            for event in events {
                if let Some(event) = self.scope.project(event) {
                    if !self.deliver(event).await {
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.sink.closed() => return,
                _ = notified => {}
            }
        }
    }

    /// Blocking send bounded by cancellation and sink closure.
    /// Returns false when delivery must stop.
    async fn deliver(&self, event: Event) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.sink.send(event) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::state::LabelTerm;

    fn created(id: &str) -> Event {
        Event::Created(Resource::new("default", "Widget", id))
    }

    #[test]
    fn test_log_append_and_collect() {
        let log = KindLog::new(10);
        log.append(created("a"));
        log.append(created("b"));

        let (cursor, events) = log.collect_from(0).unwrap();
        assert_eq!(cursor, 2);
        assert_eq!(events.len(), 2);

        let (cursor, events) = log.collect_from(cursor).unwrap();
        assert_eq!(cursor, 2);
        assert!(events.is_empty());
    }

    #[test]
    fn test_log_overrun() {
        let log = KindLog::new(2);
        log.append(created("a"));
        log.append(created("b"));
        log.append(created("c"));

        // Sequence 0 was evicted.
        assert!(log.collect_from(0).is_err());

        let (cursor, events) = log.collect_from(1).unwrap();
        assert_eq!(cursor, 3);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_tail_cursor_clamped() {
        let log = KindLog::new(2);
        log.append(created("a"));
        log.append(created("b"));
        log.append(created("c"));

        assert_eq!(log.tail_cursor(1), 2);
        // Requesting more tail than the log retains clamps to the start.
        assert_eq!(log.tail_cursor(100), 1);
    }

    #[test]
    fn test_filter_transition_projection() {
        let filter = ResourceFilter::all().with_label(LabelTerm::equals("tier", "hot"));
        let scope = Scope::Kind(filter);

        let mut hot = Resource::new("default", "Widget", "w1");
        hot.metadata_mut().set_label("tier", "hot");
        let mut cold = Resource::new("default", "Widget", "w1");
        cold.metadata_mut().set_label("tier", "cold");

        // Entering the match set surfaces as Created.
        let projected = scope
            .project(Event::Updated {
                old: cold.clone(),
                new: hot.clone(),
            })
            .unwrap();
        assert!(matches!(projected, Event::Created(_)));

        // Leaving the match set surfaces as Destroyed.
        let projected = scope
            .project(Event::Updated {
                old: hot.clone(),
                new: cold.clone(),
            })
            .unwrap();
        assert!(matches!(projected, Event::Destroyed(_)));

        // Never matched: dropped.
        assert!(scope
            .project(Event::Updated {
                old: cold.clone(),
                new: cold,
            })
            .is_none());

        // Still matching: stays Updated.
        let projected = scope
            .project(Event::Updated {
                old: hot.clone(),
                new: hot,
            })
            .unwrap();
        assert!(matches!(projected, Event::Updated { .. }));
    }

    #[test]
    fn test_id_scope_projection() {
        let scope = Scope::Id("w1".into());

        assert!(scope.project(created("w1")).is_some());
        assert!(scope.project(created("w2")).is_none());
    }
}
