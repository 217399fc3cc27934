//! Watch-driven transform reconciliation

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::options::{TeardownPolicy, TransformOptions};
use crate::error::{Error, Result};
use crate::resource::{Kind, Phase, Resource};
use crate::state::{
    CreateOptions, DestroyOptions, Event, ListOptions, State, UpdateOptions, WatchKindOptions,
};

/// Capacity of the trigger channel fed by the controller's subscriptions.
const EVENT_BUFFER: usize = 128;

// =============================================================================
// Transformer
// =============================================================================

/// Pure mapping from an input resource to its output.
///
/// The controller supplies `output` pre-populated with the stored output
/// when one exists, so transforms can preserve fields they do not own.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Id of the output produced for the given input.
    fn output_id(&self, input: &Resource) -> String {
        input.metadata().id().to_string()
    }

    /// Fill in the output for the input.
    ///
    /// Returning [`Error::RequeueRequested`] skips the write and schedules
    /// one retry pass; any other error is logged and left to the next
    /// trigger.
    async fn transform(&self, input: &Resource, output: &mut Resource) -> Result<()>;
}

// =============================================================================
// Controller
// =============================================================================

/// Reconciles one output resource per input resource of a kind.
///
/// The run loop subscribes to the input and output kinds and re-lists live
/// state on every trigger: events are coalesced into passes, never consumed
/// as data, so a lost trigger only delays convergence. Exactly one pass runs
/// at a time.
pub struct TransformController<T> {
    state: Arc<dyn State>,
    name: String,
    input_kind: Kind,
    output_kind: Kind,
    transformer: T,
    options: TransformOptions,
    policy: TeardownPolicy,
}

impl<T: Transformer> TransformController<T> {
    /// Build a controller, validating the configuration.
    ///
    /// `name` doubles as the controller's owner identity on outputs and as
    /// its finalizer token on inputs.
    pub fn new(
        state: Arc<dyn State>,
        name: impl Into<String>,
        input_kind: Kind,
        output_kind: Kind,
        transformer: T,
        options: TransformOptions,
    ) -> Result<Self> {
        if options.input_finalizers && options.ignore_tearing_down {
            return Err(Error::InvalidConfiguration(
                "input finalizers and ignore-tearing-down are mutually exclusive".into(),
            ));
        }

        let policy = options.teardown_policy();

        Ok(Self {
            state,
            name: name.into(),
            input_kind,
            output_kind,
            transformer,
            options,
            policy,
        })
    }

    /// Run the controller until `cancel` fires.
    ///
    /// The shutdown callback, when configured, runs exactly once on any
    /// exit path.
    pub async fn run(mut self, cancel: CancellationToken) {
        let shutdown = self.options.shutdown.take();
        let mut wake = self.options.wake.take();
        let mut wake_open = wake.is_some();

        info!(controller = %self.name, input = %self.input_kind, output = %self.output_kind, "starting");

        let mut events = match self.subscribe().await {
            Ok(events) => Some(events),
            Err(err) => {
                warn!(controller = %self.name, error = %err, "failed to subscribe");
                None
            }
        };

        let mut requeue_at: Option<Instant> = None;

        if let Some(events) = &mut events {
            self.pass(&mut requeue_at).await;

            loop {
                let deadline = requeue_at;
                let requeue_timer = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = events.recv() => {
                        let Some(event) = event else {
                            warn!(controller = %self.name, "trigger channel closed");
                            break;
                        };

                        // Triggers, not data: drain everything queued and
                        // run a single pass over live state.
                        let mut lost = event.is_terminal();
                        while let Ok(extra) = events.try_recv() {
                            lost |= extra.is_terminal();
                        }

                        if lost {
                            debug!(controller = %self.name, "watch subscription lost, resubscribing");
                            match self.subscribe().await {
                                Ok(fresh) => *events = fresh,
                                Err(err) => {
                                    warn!(controller = %self.name, error = %err, "failed to resubscribe");
                                    break;
                                }
                            }
                        }

                        self.pass(&mut requeue_at).await;
                    }

                    message = recv_wake(&mut wake), if wake_open => match message {
                        Some(()) => {
                            if let Some(wake) = wake.as_mut() {
                                while wake.try_recv().is_ok() {}
                            }
                            self.pass(&mut requeue_at).await;
                        }
                        None => wake_open = false,
                    },

                    _ = requeue_timer => {
                        requeue_at = None;
                        self.pass(&mut requeue_at).await;
                    }
                }
            }
        }

        info!(controller = %self.name, "stopping");

        if let Some(callback) = shutdown {
            callback(Arc::clone(&self.state)).await;
        }
    }

    /// Subscribe to every kind whose changes should trigger a pass.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut kinds = BTreeSet::new();
        kinds.insert(self.input_kind.clone());
        kinds.insert(self.output_kind.clone());
        kinds.extend(self.options.extra_inputs.iter().cloned());
        kinds.extend(self.options.extra_outputs.iter().cloned());

        for kind in kinds {
            self.state
                .watch_kind(&kind, tx.clone(), WatchKindOptions::default())
                .await?;
        }

        Ok(rx)
    }

    async fn pass(&self, requeue_at: &mut Option<Instant>) {
        match self.reconcile().await {
            Ok(None) => {}
            Ok(Some(after)) => {
                let at = Instant::now() + after;
                *requeue_at = Some(requeue_at.map_or(at, |existing| existing.min(at)));
            }
            Err(err) => {
                warn!(controller = %self.name, error = %err, "reconciliation pass failed");
            }
        }
    }

    /// One reconciliation pass over live state.
    ///
    /// Returns the shortest requested requeue delay, if any transform asked
    /// for one.
    async fn reconcile(&self) -> Result<Option<Duration>> {
        let inputs = self
            .state
            .list(
                &self.input_kind,
                ListOptions::filtered(self.options.input_filter.clone()),
            )
            .await?;
        let outputs = self
            .state
            .list(&self.output_kind, ListOptions::default())
            .await?;

        let mut owned: BTreeMap<String, Resource> = outputs
            .into_iter()
            .filter(|output| output.metadata().owner() == self.name)
            .map(|output| (output.metadata().id().to_string(), output))
            .collect();

        let mut requeue: Option<Duration> = None;

        for input in &inputs {
            let output_id = self.transformer.output_id(input);
            let existing = owned.remove(&output_id);

            let tearing_down = input.metadata().phase() == Phase::TearingDown
                && self.policy != TeardownPolicy::Ignore;

            if tearing_down {
                self.teardown_for(input, existing).await;
                continue;
            }

            if self.policy == TeardownPolicy::Finalizer
                && !input.metadata().has_finalizer(&self.name)
            {
                let pointer = input.metadata().pointer();
                if let Err(err) = self.state.add_finalizer(&pointer, &self.name).await {
                    if !err.is_not_found() {
                        warn!(controller = %self.name, resource = %pointer, error = %err, "failed to add finalizer");
                    }
                    continue;
                }
            }

            let mut output = match &existing {
                Some(existing) => existing.clone(),
                None => Resource::new_of(&self.output_kind, &output_id),
            };

            match self.transformer.transform(input, &mut output).await {
                Ok(()) => {
                    if let Err(err) = self.write_output(existing, output).await {
                        if err.is_conflict() {
                            debug!(controller = %self.name, input = %input.metadata(), error = %err, "output write conflicted, retrying on next trigger");
                        } else {
                            warn!(controller = %self.name, input = %input.metadata(), error = %err, "output write failed");
                        }
                    }
                }
                Err(Error::RequeueRequested { after }) => {
                    let delay = after.unwrap_or(self.options.requeue_interval);
                    requeue = Some(requeue.map_or(delay, |existing| existing.min(delay)));
                }
                Err(err) => {
                    warn!(controller = %self.name, input = %input.metadata(), error = %err, "transform failed");
                }
            }
        }

        // Owned outputs with no matching input are torn down and destroyed.
        for orphan in owned.into_values() {
            self.destroy_output(&orphan).await;
        }

        Ok(requeue)
    }

    /// Handle a tearing-down input: tear down its output, then release the
    /// controller's finalizer once the output is gone.
    async fn teardown_for(&self, input: &Resource, existing: Option<Resource>) {
        let gone = match existing {
            Some(output) => self.destroy_output(&output).await,
            None => true,
        };

        if gone && self.policy == TeardownPolicy::Finalizer {
            let pointer = input.metadata().pointer();
            if let Err(err) = self.state.remove_finalizer(&pointer, &self.name).await {
                if !err.is_not_found() {
                    warn!(controller = %self.name, resource = %pointer, error = %err, "failed to release finalizer");
                }
            }
        }
    }

    /// Tear down and destroy an owned output.
    ///
    /// Returns true once the output no longer exists. While consumers hold
    /// finalizers on it the output survives in the tearing-down phase;
    /// their removal events retrigger reconciliation.
    async fn destroy_output(&self, output: &Resource) -> bool {
        let pointer = output.metadata().pointer();

        let current = if output.metadata().phase() == Phase::TearingDown {
            output.clone()
        } else {
            let mut tearing = output.clone();
            tearing.metadata_mut().set_phase(Phase::TearingDown);

            let options = UpdateOptions::default()
                .with_expected_version(output.metadata().version())
                .with_owner(&self.name);

            match self.state.update(&mut tearing, options).await {
                Ok(()) => tearing,
                Err(err) if err.is_not_found() => return true,
                Err(err) => {
                    debug!(controller = %self.name, resource = %pointer, error = %err, "teardown deferred");
                    return false;
                }
            }
        };

        if !current.metadata().finalizers().is_empty() {
            return false;
        }

        match self
            .state
            .destroy(&pointer, DestroyOptions::owned_by(&self.name))
            .await
        {
            Ok(()) => {
                info!(controller = %self.name, resource = %pointer, "destroyed output");
                true
            }
            Err(err) if err.is_not_found() => true,
            Err(err) if err.is_conflict() => {
                debug!(controller = %self.name, resource = %pointer, error = %err, "destroy deferred");
                false
            }
            Err(err) => {
                warn!(controller = %self.name, resource = %pointer, error = %err, "destroy failed");
                false
            }
        }
    }

    /// Create or CAS-update the transformed output under the controller's
    /// identity.
    async fn write_output(&self, existing: Option<Resource>, mut output: Resource) -> Result<()> {
        match existing {
            Some(existing) => {
                // An input that came back while its output was mid-teardown
                // revives the output.
                output.metadata_mut().set_phase(Phase::Running);

                // Unchanged outputs are left alone so a pass does not
                // retrigger itself through the output watch.
                if output.spec() == existing.spec()
                    && output.metadata().labels() == existing.metadata().labels()
                    && existing.metadata().phase() == Phase::Running
                {
                    return Ok(());
                }

                let options = UpdateOptions::default()
                    .with_expected_version(existing.metadata().version())
                    .with_owner(&self.name);
                self.state.update(&mut output, options).await
            }
            None => {
                self.state
                    .create(&mut output, CreateOptions::owned_by(&self.name))
                    .await?;
                debug!(controller = %self.name, output = %output.metadata(), "created output");
                Ok(())
            }
        }
    }
}

async fn recv_wake(wake: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match wake {
        Some(wake) => wake.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{assert_no_resource, assert_resources};
    use crate::state::{GetOptions, InMemoryState};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Doubler {
        calls: Arc<AtomicUsize>,
        requeue_first: Arc<AtomicUsize>,
    }

    impl Doubler {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                requeue_first: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transformer for Doubler {
        async fn transform(&self, input: &Resource, output: &mut Resource) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self
                .requeue_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::RequeueRequested {
                    after: Some(Duration::from_millis(10)),
                });
            }

            let spec: serde_json::Value = input.spec_as()?;
            let n = spec["n"].as_u64().unwrap_or(0);
            output.set_spec(&json!({ "n": n * 2 }))
        }
    }

    fn kinds() -> (Kind, Kind) {
        (Kind::new("test", "Input"), Kind::new("test", "Output"))
    }

    async fn create_input(state: &Arc<dyn State>, id: &str, n: u64) -> Resource {
        let mut input = Resource::new("test", "Input", id);
        input.set_spec(&json!({ "n": n })).unwrap();
        state
            .create(&mut input, CreateOptions::default())
            .await
            .unwrap();
        input
    }

    fn spawn_controller(
        state: &Arc<dyn State>,
        transformer: Doubler,
        options: TransformOptions,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        crate::harness::init_logging();
        let (input_kind, output_kind) = kinds();
        let controller = TransformController::new(
            state.clone(),
            "doubler",
            input_kind,
            output_kind,
            transformer,
            options,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        (cancel, handle)
    }

    #[tokio::test]
    async fn test_transform_convergence() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (_, output_kind) = kinds();

        let (cancel, handle) =
            spawn_controller(&state, Doubler::new(), TransformOptions::default());

        create_input(&state, "a", 2).await;
        create_input(&state, "b", 5).await;

        assert_resources(&state, &output_kind, &["a", "b"], |output| {
            anyhow::ensure!(
                output.metadata().owner() == "doubler",
                "owner = {:?}",
                output.metadata().owner()
            );

            let spec: serde_json::Value = output.spec_as()?;
            let want = if output.metadata().id() == "a" { 4 } else { 10 };
            anyhow::ensure!(spec["n"] == want, "spec = {spec}");
            Ok(())
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_finalizer_gated_teardown() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();
        let input_pointer = input_kind.pointer("a");
        let output_pointer = output_kind.pointer("a");

        let (cancel, handle) = spawn_controller(
            &state,
            Doubler::new(),
            TransformOptions::default().with_input_finalizers(),
        );

        create_input(&state, "a", 1).await;
        assert_resources(&state, &output_kind, &["a"], |_| Ok(()))
            .await
            .unwrap();

        // An external consumer pins the output.
        state.add_finalizer(&output_pointer, "consumer").await.unwrap();

        // Request teardown of the input.
        let mut input = state.get(&input_pointer, GetOptions::default()).await.unwrap();
        input.metadata_mut().set_phase(Phase::TearingDown);
        state.update(&mut input, UpdateOptions::default()).await.unwrap();

        // The output flips to tearing-down but survives the consumer's
        // finalizer; the input stays pinned by the controller's.
        assert_resources(&state, &output_kind, &["a"], |output| {
            anyhow::ensure!(
                output.metadata().phase() == Phase::TearingDown,
                "phase = {}",
                output.metadata().phase()
            );
            Ok(())
        })
        .await
        .unwrap();

        let input = state.get(&input_pointer, GetOptions::default()).await.unwrap();
        assert!(input.metadata().has_finalizer("doubler"));

        // Consumer releases: output goes away, then the input unblocks.
        state
            .remove_finalizer(&output_pointer, "consumer")
            .await
            .unwrap();
        assert_no_resource(&state, &output_pointer).await.unwrap();

        assert_resources(&state, &input_kind, &["a"], |input| {
            anyhow::ensure!(
                input.metadata().finalizers().is_empty(),
                "finalizers = {:?}",
                input.metadata().finalizers()
            );
            Ok(())
        })
        .await
        .unwrap();

        state
            .destroy(&input_pointer, DestroyOptions::default())
            .await
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_orphan_output_cleanup() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();

        let (cancel, handle) =
            spawn_controller(&state, Doubler::new(), TransformOptions::default());

        create_input(&state, "a", 1).await;
        assert_resources(&state, &output_kind, &["a"], |_| Ok(()))
            .await
            .unwrap();

        state
            .destroy(&input_kind.pointer("a"), DestroyOptions::default())
            .await
            .unwrap();

        assert_no_resource(&state, &output_kind.pointer("a"))
            .await
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_revived_input_resets_output_phase() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();
        let input_pointer = input_kind.pointer("a");
        let output_pointer = output_kind.pointer("a");

        let (cancel, handle) =
            spawn_controller(&state, Doubler::new(), TransformOptions::default());

        create_input(&state, "a", 1).await;
        assert_resources(&state, &output_kind, &["a"], |_| Ok(()))
            .await
            .unwrap();

        // A consumer finalizer keeps the output alive through teardown.
        state.add_finalizer(&output_pointer, "consumer").await.unwrap();

        let mut input = state.get(&input_pointer, GetOptions::default()).await.unwrap();
        input.metadata_mut().set_phase(Phase::TearingDown);
        state.update(&mut input, UpdateOptions::default()).await.unwrap();

        assert_resources(&state, &output_kind, &["a"], |output| {
            anyhow::ensure!(
                output.metadata().phase() == Phase::TearingDown,
                "phase = {}",
                output.metadata().phase()
            );
            Ok(())
        })
        .await
        .unwrap();

        // The input comes back before the output is gone: the output must
        // return to the running phase instead of staying stuck.
        let mut input = state.get(&input_pointer, GetOptions::default()).await.unwrap();
        input.metadata_mut().set_phase(Phase::Running);
        state.update(&mut input, UpdateOptions::default()).await.unwrap();

        assert_resources(&state, &output_kind, &["a"], |output| {
            anyhow::ensure!(
                output.metadata().phase() == Phase::Running,
                "phase = {}",
                output.metadata().phase()
            );
            Ok(())
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_retries_transform() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (_, output_kind) = kinds();

        let transformer = Doubler::new();
        transformer.requeue_first.store(2, Ordering::SeqCst);
        let calls = transformer.calls.clone();

        let (cancel, handle) =
            spawn_controller(&state, transformer, TransformOptions::default());

        create_input(&state, "a", 3).await;

        assert_resources(&state, &output_kind, &["a"], |output| {
            let spec: serde_json::Value = output.spec_as()?;
            anyhow::ensure!(spec["n"] == 6, "spec = {spec}");
            Ok(())
        })
        .await
        .unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wake_channel_triggers_pass() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (_, output_kind) = kinds();

        let transformer = Doubler::new();
        let calls = transformer.calls.clone();

        let (wake_tx, wake_rx) = mpsc::channel(4);
        let (cancel, handle) = spawn_controller(
            &state,
            transformer,
            TransformOptions::default().with_wake_channel(wake_rx),
        );

        create_input(&state, "a", 1).await;
        assert_resources(&state, &output_kind, &["a"], |_| Ok(()))
            .await
            .unwrap();

        let before = calls.load(Ordering::SeqCst);
        wake_tx.send(()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) <= before {
            assert!(Instant::now() < deadline, "wake did not trigger a pass");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_future_is_spawnable() {
        fn assert_send<T: Send>(_: &T) {}

        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();

        // The shutdown callback must not cost the run future its Send
        // bound: spawning a configured controller has to keep compiling.
        let controller = TransformController::new(
            state,
            "doubler",
            input_kind,
            output_kind,
            Doubler::new(),
            TransformOptions::default()
                .with_shutdown_callback(|_| Box::pin(async {})),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let future = controller.run(cancel.clone());
        assert_send(&future);

        let handle = tokio::spawn(future);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_policies_rejected() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();

        let err = TransformController::new(
            state,
            "doubler",
            input_kind,
            output_kind,
            Doubler::new(),
            TransformOptions::default()
                .with_input_finalizers()
                .with_ignore_tearing_down_inputs(),
        )
        .err()
        .unwrap();

        assert_matches!(err, Error::InvalidConfiguration(_));
    }

    #[tokio::test]
    async fn test_ignore_tearing_down_inputs() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let (input_kind, output_kind) = kinds();

        let (cancel, handle) = spawn_controller(
            &state,
            Doubler::new(),
            TransformOptions::default().with_ignore_tearing_down_inputs(),
        );

        create_input(&state, "a", 1).await;
        assert_resources(&state, &output_kind, &["a"], |_| Ok(()))
            .await
            .unwrap();

        let pointer = input_kind.pointer("a");
        let mut input = state.get(&pointer, GetOptions::default()).await.unwrap();
        input.metadata_mut().set_phase(Phase::TearingDown);
        input.set_spec(&json!({ "n": 9 })).unwrap();
        state.update(&mut input, UpdateOptions::default()).await.unwrap();

        // Still reconciled: the new spec flows through.
        assert_resources(&state, &output_kind, &["a"], |output| {
            let spec: serde_json::Value = output.spec_as()?;
            anyhow::ensure!(spec["n"] == 18, "spec = {spec}");
            Ok(())
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_callback_runs_once() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());

        let options = TransformOptions::default().with_shutdown_callback(|state| {
            Box::pin(async move {
                let mut marker = Resource::new("test", "Marker", "shutdown");
                let _ = state.create(&mut marker, CreateOptions::default()).await;
            })
        });

        let (cancel, handle) = spawn_controller(&state, Doubler::new(), options);

        cancel.cancel();
        handle.await.unwrap();

        state
            .get(
                &Kind::new("test", "Marker").pointer("shutdown"),
                GetOptions::default(),
            )
            .await
            .unwrap();
    }
}
