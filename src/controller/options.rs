//! Transform controller configuration

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::resource::Kind;
use crate::state::{ResourceFilter, State};

/// Default delay before a requeued transform pass runs again.
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// Callback invoked once when the controller's run loop exits.
pub type ShutdownCallback =
    Box<dyn FnOnce(Arc<dyn State>) -> BoxFuture<'static, ()> + Send + Sync>;

/// How the controller treats inputs in the tearing-down phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownPolicy {
    /// Tear down and destroy the matching output, without touching input
    /// finalizers.
    Destroy,
    /// Hold a finalizer on every active input; release it only after the
    /// matching output is gone.
    Finalizer,
    /// Treat tearing-down inputs as active.
    Ignore,
}

/// Configuration for a [`TransformController`](super::TransformController).
///
/// The finalizer and ignore-tearing-down policies are mutually exclusive;
/// requesting both is rejected when the controller is constructed.
pub struct TransformOptions {
    pub(crate) extra_inputs: Vec<Kind>,
    pub(crate) extra_outputs: Vec<Kind>,
    pub(crate) input_filter: ResourceFilter,
    pub(crate) input_finalizers: bool,
    pub(crate) ignore_tearing_down: bool,
    pub(crate) requeue_interval: Duration,
    pub(crate) wake: Option<mpsc::Receiver<()>>,
    pub(crate) shutdown: Option<ShutdownCallback>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            extra_inputs: Vec::new(),
            extra_outputs: Vec::new(),
            input_filter: ResourceFilter::all(),
            input_finalizers: false,
            ignore_tearing_down: false,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            wake: None,
            shutdown: None,
        }
    }
}

impl TransformOptions {
    /// Watch an additional kind as a reconciliation trigger. Extra inputs
    /// are not reconciled themselves; the transform reads them from the
    /// state directly.
    pub fn with_extra_input(mut self, kind: Kind) -> Self {
        self.extra_inputs.push(kind);
        self
    }

    /// Watch an additional kind the transform writes to, so changes to it
    /// (finalizer removal in particular) trigger reconciliation.
    pub fn with_extra_output(mut self, kind: Kind) -> Self {
        self.extra_outputs.push(kind);
        self
    }

    /// Restrict which input resources the controller reconciles.
    pub fn with_input_filter(mut self, filter: ResourceFilter) -> Self {
        self.input_filter = filter;
        self
    }

    /// Hold a finalizer on every active input, so inputs cannot disappear
    /// before their outputs are torn down.
    pub fn with_input_finalizers(mut self) -> Self {
        self.input_finalizers = true;
        self
    }

    /// Keep reconciling tearing-down inputs as if they were active.
    pub fn with_ignore_tearing_down_inputs(mut self) -> Self {
        self.ignore_tearing_down = true;
        self
    }

    /// Delay before a pass requeued via
    /// [`Error::RequeueRequested`](crate::error::Error::RequeueRequested)
    /// runs again, unless the error names its own delay.
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// External trigger: each message on the channel schedules a
    /// reconciliation pass.
    pub fn with_wake_channel(mut self, wake: mpsc::Receiver<()>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Callback invoked exactly once when the run loop exits, on any exit
    /// path.
    pub fn with_shutdown_callback(
        mut self,
        callback: impl FnOnce(Arc<dyn State>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.shutdown = Some(Box::new(callback));
        self
    }

    pub(crate) fn teardown_policy(&self) -> TeardownPolicy {
        if self.input_finalizers {
            TeardownPolicy::Finalizer
        } else if self.ignore_tearing_down {
            TeardownPolicy::Ignore
        } else {
            TeardownPolicy::Destroy
        }
    }
}
