//! Collection strategies: one-shot enumeration and exit tracking.
//!
//! Both strategies share one template (prepare, collect, teardown) driven
//! by [`crate::collect::collect`], which also guarantees cleanup on every
//! exit path. The one-time strategy visits whatever isolates exist at
//! collection time; the exit-tracking strategy watches each isolate and
//! harvests it at its about-to-exit pause, the last moment its coverage
//! is observable.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::collect::CollectOptions;
use crate::hitmap::{normalize, ScriptCoverageEntry};
use crate::result::{CollectError, CollectResult};
use crate::retry::retry;
use crate::service::{IsolateEvent, IsolateRef, PauseState, VmService};

/// Poll interval for the wait-for-paused gate
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shared accumulator for normalized entries.
///
/// The mutex doubles as the collection gate: it is held across one whole
/// report-normalize-resume sequence, so two isolates can never be
/// collected concurrently within one collector instance.
pub type Accumulator = Arc<Mutex<Vec<ScriptCoverageEntry>>>;

/// One collection strategy's behavior inside the shared template
#[async_trait]
pub trait CollectStrategy: Send {
    /// Runs after connect, before any coverage is read
    async fn prepare(&mut self, service: &Arc<dyn VmService>) -> CollectResult<()>;

    /// Gather coverage from the observed process into the accumulator
    async fn collect(
        &mut self,
        service: &Arc<dyn VmService>,
        accumulator: &Accumulator,
    ) -> CollectResult<()>;

    /// Runs after collection, on success and failure alike
    async fn teardown(&mut self, service: &Arc<dyn VmService>) -> CollectResult<()>;
}

/// Fetch one isolate's report, normalize it, and optionally resume the
/// isolate, all under the accumulator gate.
async fn collect_from_isolate(
    service: &dyn VmService,
    isolate: &IsolateRef,
    resume: bool,
    accumulator: &Accumulator,
) -> CollectResult<()> {
    let mut entries = accumulator.lock().await;
    tracing::debug!(isolate = %isolate.id, "collecting source report");
    let report = service.source_report(isolate, true).await?;
    entries.extend(normalize(service, &report).await?);
    if resume {
        service.resume(isolate).await?;
    }
    Ok(())
}

// ============================================================================
// One-time strategy
// ============================================================================

/// Collect from every currently running isolate exactly once.
///
/// Optionally waits until all isolates are paused first, and optionally
/// resumes whatever is still paused during teardown. Isolates created
/// after enumeration are invisible to this pass.
#[derive(Debug)]
pub struct OnceCollector {
    wait_paused: bool,
    resume: bool,
    timeout: Option<Duration>,
}

impl OnceCollector {
    /// Build the strategy from collection options
    #[must_use]
    pub fn new(options: &CollectOptions) -> Self {
        Self {
            wait_paused: options.wait_paused,
            resume: options.resume,
            timeout: options.timeout,
        }
    }
}

#[async_trait]
impl CollectStrategy for OnceCollector {
    async fn prepare(&mut self, service: &Arc<dyn VmService>) -> CollectResult<()> {
        if !self.wait_paused {
            return Ok(());
        }
        retry(
            || async {
                let isolates = service.list_isolates().await?;
                let mut remaining = 0;
                for isolate in &isolates {
                    match service.isolate_state(isolate).await? {
                        Some(state) if state.is_paused() => {}
                        // An isolate that ended while we polled no longer
                        // needs to pause.
                        None => {}
                        Some(_) => remaining += 1,
                    }
                }
                if remaining > 0 {
                    Err(CollectError::UnpausedRemaining { remaining })
                } else {
                    Ok(())
                }
            },
            PAUSE_POLL_INTERVAL,
            self.timeout,
        )
        .await
    }

    async fn collect(
        &mut self,
        service: &Arc<dyn VmService>,
        accumulator: &Accumulator,
    ) -> CollectResult<()> {
        for isolate in service.list_isolates().await? {
            collect_from_isolate(&**service, &isolate, false, accumulator).await?;
        }
        Ok(())
    }

    async fn teardown(&mut self, service: &Arc<dyn VmService>) -> CollectResult<()> {
        if !self.resume {
            return Ok(());
        }
        for isolate in service.list_isolates().await? {
            match service.isolate_state(&isolate).await? {
                Some(state) if state.is_paused() => service.resume(&isolate).await?,
                Some(_) => {}
                None => {
                    tracing::debug!(isolate = %isolate.id, "isolate ended before resume");
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Exit-tracking strategy
// ============================================================================

/// Watch isolates and collect from each at its about-to-exit pause.
///
/// Isolates starting mid-collection are picked up through the service's
/// isolate-started stream. Collection finishes once every watched isolate
/// has been harvested and no watch remains outstanding.
#[derive(Debug)]
pub struct ExitCollector {
    resume: bool,
}

impl ExitCollector {
    /// Build the strategy from collection options
    #[must_use]
    pub fn new(options: &CollectOptions) -> Self {
        Self {
            resume: options.resume,
        }
    }
}

struct WatchEntry {
    claimed: bool,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WatchSet {
    entries: HashMap<String, WatchEntry>,
    /// Set once the watch set has been non-empty; the all-exited latch
    /// only fires after that.
    armed: bool,
    first_error: Option<CollectError>,
}

/// State shared between the strategy and its per-isolate event tasks
struct ExitShared {
    watches: Mutex<WatchSet>,
    all_exited: watch::Sender<bool>,
    accumulator: Accumulator,
    resume: bool,
}

impl ExitShared {
    async fn watch(&self, id: &str) {
        let mut set = self.watches.lock().await;
        set.armed = true;
        set.entries.insert(
            id.to_string(),
            WatchEntry {
                claimed: false,
                task: None,
            },
        );
    }

    async fn attach(&self, id: &str, task: JoinHandle<()>) {
        let mut set = self.watches.lock().await;
        match set.entries.get_mut(id) {
            Some(entry) => entry.task = Some(task),
            // Already finished; the task has nothing left to observe.
            None => task.abort(),
        }
    }

    /// Claim the isolate for collection. Exactly one caller wins, whether
    /// the claim comes from the start-time state check or a pause event.
    async fn claim(&self, id: &str) -> bool {
        let mut set = self.watches.lock().await;
        match set.entries.get_mut(id) {
            Some(entry) if !entry.claimed => {
                entry.claimed = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the isolate's watch and fire the latch when the set empties.
    async fn finish(&self, id: &str, result: CollectResult<()>) {
        let mut set = self.watches.lock().await;
        if let Some(entry) = set.entries.remove(id) {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        match result {
            Err(error) => {
                if set.first_error.is_none() {
                    set.first_error = Some(error);
                }
                let _ = self.all_exited.send(true);
            }
            Ok(()) => {
                if set.armed && set.entries.is_empty() {
                    let _ = self.all_exited.send(true);
                }
            }
        }
    }

    async fn fail(&self, error: CollectError) {
        let mut set = self.watches.lock().await;
        if set.first_error.is_none() {
            set.first_error = Some(error);
        }
        let _ = self.all_exited.send(true);
    }

    async fn done(&self) -> bool {
        let set = self.watches.lock().await;
        set.first_error.is_some() || (set.armed && set.entries.is_empty())
    }

    /// Tear down any leftover watches and surface the first stored error.
    async fn take_result(&self) -> CollectResult<()> {
        let mut set = self.watches.lock().await;
        for (_, entry) in set.entries.drain() {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        match set.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Start watching one isolate.
///
/// The pause subscription is created before the state check, so an exit
/// pause landing between the two arrives on the stream instead of being
/// lost; the claim set keeps the two paths from both collecting.
async fn watch_isolate(
    service: &Arc<dyn VmService>,
    shared: &Arc<ExitShared>,
    isolate: IsolateRef,
) -> CollectResult<()> {
    let mut events = service.subscribe_pause_events(&isolate).await?;
    shared.watch(&isolate.id).await;

    let task = tokio::spawn({
        let service = Arc::clone(service);
        let shared = Arc::clone(shared);
        let isolate = isolate.clone();
        async move {
            while let Some(event) = events.next().await {
                if event != IsolateEvent::Paused(PauseState::PauseExit) {
                    continue;
                }
                if shared.claim(&isolate.id).await {
                    let result =
                        collect_from_isolate(&*service, &isolate, shared.resume, &shared.accumulator)
                            .await;
                    shared.finish(&isolate.id, result).await;
                }
                break;
            }
        }
    });
    shared.attach(&isolate.id, task).await;

    match service.isolate_state(&isolate).await? {
        Some(PauseState::PauseExit) => {
            if shared.claim(&isolate.id).await {
                let result =
                    collect_from_isolate(&**service, &isolate, shared.resume, &shared.accumulator)
                        .await;
                shared.finish(&isolate.id, result).await;
            }
        }
        Some(_) => {}
        None => {
            tracing::debug!(isolate = %isolate.id, "isolate ended before it could be watched");
            shared.finish(&isolate.id, Ok(())).await;
        }
    }
    Ok(())
}

#[async_trait]
impl CollectStrategy for ExitCollector {
    /// Pausing discipline is entirely event-driven in this mode
    async fn prepare(&mut self, _service: &Arc<dyn VmService>) -> CollectResult<()> {
        Ok(())
    }

    async fn collect(
        &mut self,
        service: &Arc<dyn VmService>,
        accumulator: &Accumulator,
    ) -> CollectResult<()> {
        let (all_exited, mut exited) = watch::channel(false);
        let shared = Arc::new(ExitShared {
            watches: Mutex::new(WatchSet::default()),
            all_exited,
            accumulator: Arc::clone(accumulator),
            resume: self.resume,
        });

        for isolate in service.list_isolates().await? {
            watch_isolate(service, &shared, isolate).await?;
        }

        // Everything known was already exiting: done, and no reason to
        // wait on isolate starts that would never come.
        if shared.done().await {
            return shared.take_result().await;
        }

        let mut started = service.subscribe_isolate_started().await?;
        let watcher = tokio::spawn({
            let service = Arc::clone(service);
            let shared = Arc::clone(&shared);
            async move {
                while let Some(isolate) = started.next().await {
                    if let Err(error) = watch_isolate(&service, &shared, isolate).await {
                        shared.fail(error).await;
                        break;
                    }
                }
            }
        });

        while !*exited.borrow_and_update() {
            if exited.changed().await.is_err() {
                break;
            }
        }
        watcher.abort();
        shared.take_result().await
    }

    async fn teardown(&mut self, _service: &Arc<dyn VmService>) -> CollectResult<()> {
        Ok(())
    }
}
