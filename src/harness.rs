//! Watch-driven convergence assertions for tests
//!
//! Controllers converge asynchronously; these helpers subscribe first and
//! re-evaluate on every event, so assertions neither race the controller
//! nor poll blindly. Failures accumulate into one `anyhow` report naming
//! each unsatisfied id.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::resource::{Kind, Pointer, Resource};
use crate::state::{Event, GetOptions, ListOptions, State, WatchKindOptions, WatchOptions};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
const REPORT_TICK: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 128;

/// Assert that every id exists in the kind and satisfies `check`, waiting
/// for convergence up to a deadline.
pub async fn assert_resources<F>(
    state: &Arc<dyn State>,
    kind: &Kind,
    ids: &[&str],
    check: F,
) -> anyhow::Result<()>
where
    F: Fn(&Resource) -> anyhow::Result<()>,
{
    let mut events = subscribe(state, kind).await?;

    let deadline = Instant::now() + DEFAULT_DEADLINE;
    let mut report = tokio::time::interval(REPORT_TICK);

    loop {
        let failures = evaluate(state, kind, ids, &check).await?;
        if failures.is_empty() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                anyhow::bail!(
                    "{kind} not converged within {DEFAULT_DEADLINE:?}: {}",
                    failures.join("; ")
                );
            }

            _ = report.tick() => {
                debug!(kind = %kind, failures = ?failures, "still waiting");
            }

            event = events.recv() => match event {
                None => anyhow::bail!("watch channel closed"),
                Some(event) if event.is_terminal() => {
                    events = subscribe(state, kind).await?;
                }
                Some(_) => {}
            },
        }
    }
}

/// Assert that the resource does not exist, waiting for its destruction up
/// to a deadline.
pub async fn assert_no_resource(state: &Arc<dyn State>, pointer: &Pointer) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::channel(CHANNEL_CAPACITY);
    state.watch(pointer, tx, WatchOptions::default()).await?;

    let deadline = Instant::now() + DEFAULT_DEADLINE;

    loop {
        match state.get(pointer, GetOptions::default()).await {
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                anyhow::bail!("{pointer} still exists after {DEFAULT_DEADLINE:?}");
            }

            event = events.recv() => if event.is_none() {
                anyhow::bail!("watch channel closed");
            },
        }
    }
}

async fn subscribe(state: &Arc<dyn State>, kind: &Kind) -> anyhow::Result<mpsc::Receiver<Event>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    state
        .watch_kind(kind, tx, WatchKindOptions::bootstrapped())
        .await?;
    Ok(rx)
}

async fn evaluate<F>(
    state: &Arc<dyn State>,
    kind: &Kind,
    ids: &[&str],
    check: &F,
) -> anyhow::Result<Vec<String>>
where
    F: Fn(&Resource) -> anyhow::Result<()>,
{
    let resources = state.list(kind, ListOptions::default()).await?;

    let mut failures = Vec::new();
    for id in ids {
        match resources.iter().find(|r| r.metadata().id() == *id) {
            None => failures.push(format!("{id}: missing")),
            Some(resource) => {
                if let Err(err) = check(resource) {
                    failures.push(format!("{id}: {err:#}"));
                }
            }
        }
    }

    Ok(failures)
}

/// Initialize test logging once; later calls are no-ops.
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::state::{CreateOptions, DestroyOptions, InMemoryState};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_assert_resources_waits_for_creation() {
        init_logging();
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let kind = Kind::new("test", "Widget");

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut r = Resource::new("test", "Widget", "w1");
            writer.create(&mut r, CreateOptions::default()).await.unwrap();
        });

        assert_ok!(assert_resources(&state, &kind, &["w1"], |_| Ok(())).await);
    }

    #[tokio::test]
    async fn test_assert_no_resource_waits_for_destruction() {
        init_logging();
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let pointer = Kind::new("test", "Widget").pointer("w1");

        let mut r = Resource::new("test", "Widget", "w1");
        state.create(&mut r, CreateOptions::default()).await.unwrap();

        let writer = state.clone();
        let target = pointer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.destroy(&target, DestroyOptions::default()).await.unwrap();
        });

        assert_no_resource(&state, &pointer).await.unwrap();
    }

    #[tokio::test]
    async fn test_assert_resources_reports_each_failure() {
        let state: Arc<dyn State> = Arc::new(InMemoryState::new());
        let kind = Kind::new("test", "Widget");

        let mut r = Resource::new("test", "Widget", "w1");
        state.create(&mut r, CreateOptions::default()).await.unwrap();

        // Shrink the wait so the failure path is fast.
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            assert_resources(&state, &kind, &["w1", "w2"], |r| {
                anyhow::ensure!(r.metadata().id() != "w1", "rejected");
                Ok(())
            }),
        )
        .await;

        // Either the deadline inside the helper or the outer timeout fires;
        // in both cases the assertion must not have succeeded.
        match result {
            Ok(inner) => assert!(inner.is_err()),
            Err(_elapsed) => {}
        }
    }
}
