//! Scriptable in-memory VM service.
//!
//! Exercises the collection engine without a live process: tests stage
//! isolates, scripts and reports, then drive pause and start events while
//! a collection runs. The mock records resumes, script loads, connect
//! attempts and a report/resume event log so tests can assert on the
//! engine's externally visible behavior.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::result::{CollectError, CollectResult};
use crate::service::{
    EventStream, IsolateEvent, IsolateRef, PauseState, RangeCoverage, Script, ScriptRef,
    SourceReport, SourceReportRange, VmConnector, VmService,
};

/// Single-range report over one script with the given hit and miss tokens
#[must_use]
pub fn simple_report(script: &ScriptRef, hits: &[u32], misses: &[u32]) -> SourceReport {
    SourceReport {
        scripts: vec![script.clone()],
        ranges: vec![SourceReportRange {
            script_index: 0,
            compiled: true,
            coverage: Some(RangeCoverage {
                hits: hits.to_vec(),
                misses: misses.to_vec(),
            }),
        }],
    }
}

#[derive(Debug)]
struct MockIsolate {
    isolate: IsolateRef,
    /// `None` once the isolate has vanished
    state: Option<PauseState>,
    report: SourceReport,
    pause_subscribers: Vec<UnboundedSender<IsolateEvent>>,
}

#[derive(Debug, Default)]
struct VmState {
    isolates: Vec<MockIsolate>,
    scripts: HashMap<String, Script>,
    connect_failures: usize,
    connect_attempts: usize,
    ping_delay: Option<Duration>,
    report_delay: Option<Duration>,
    vanish_after_report: HashSet<String>,
    resumed: Vec<String>,
    script_loads: HashMap<String, usize>,
    start_subscriptions: usize,
    started_subscribers: Vec<UnboundedSender<IsolateRef>>,
    event_log: Vec<String>,
    closed: bool,
}

/// Scriptable fake VM, reachable through its [`VmConnector`] impl.
///
/// Clones share state, so a test can keep one handle for staging events
/// while a collection owns another.
#[derive(Debug, Clone, Default)]
pub struct MockVm {
    state: Arc<Mutex<VmState>>,
}

impl MockVm {
    /// Create an empty fake VM
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().expect("mock VM state poisoned")
    }

    /// Stage an isolate with an initial pause state and its report
    pub fn add_isolate(&self, isolate: IsolateRef, state: PauseState, report: SourceReport) {
        self.lock().isolates.push(MockIsolate {
            isolate,
            state: Some(state),
            report,
            pause_subscribers: Vec::new(),
        });
    }

    /// Stage script metadata under a script reference id
    pub fn add_script(&self, id: &str, script: Script) {
        self.lock().scripts.insert(id.to_string(), script);
    }

    /// Refuse the next `attempts` connection attempts
    pub fn fail_connects(&self, attempts: usize) {
        self.lock().connect_failures = attempts;
    }

    /// Delay every liveness probe by `delay`; `None` answers immediately
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        self.lock().ping_delay = delay;
    }

    /// Delay every source report by `delay`; `None` answers immediately
    pub fn set_report_delay(&self, delay: Option<Duration>) {
        self.lock().report_delay = delay;
    }

    /// Make the isolate vanish right after its report is served, before
    /// any teardown re-enumeration can see it
    pub fn vanish_after_report(&self, id: &str) {
        self.lock().vanish_after_report.insert(id.to_string());
    }

    /// Overwrite an isolate's pause state without emitting an event
    pub fn set_state(&self, id: &str, state: PauseState) {
        if let Some(entry) = self.lock().isolates.iter_mut().find(|i| i.isolate.id == id) {
            entry.state = Some(state);
        }
    }

    /// Make the isolate vanish immediately
    pub fn vanish(&self, id: &str) {
        if let Some(entry) = self.lock().isolates.iter_mut().find(|i| i.isolate.id == id) {
            entry.state = None;
        }
    }

    /// Move the isolate to its exit pause and notify its subscribers
    pub fn fire_exit(&self, id: &str) {
        if let Some(entry) = self.lock().isolates.iter_mut().find(|i| i.isolate.id == id) {
            entry.state = Some(PauseState::PauseExit);
            entry
                .pause_subscribers
                .retain(|tx| tx.unbounded_send(IsolateEvent::Paused(PauseState::PauseExit)).is_ok());
        }
    }

    /// Add a new isolate mid-run and announce it on the started stream
    pub fn start_isolate(&self, isolate: IsolateRef, state: PauseState, report: SourceReport) {
        let mut vm = self.lock();
        vm.isolates.push(MockIsolate {
            isolate: isolate.clone(),
            state: Some(state),
            report,
            pause_subscribers: Vec::new(),
        });
        vm.started_subscribers
            .retain(|tx| tx.unbounded_send(isolate.clone()).is_ok());
    }

    /// Isolate ids resumed so far, in resume order
    #[must_use]
    pub fn resumed(&self) -> Vec<String> {
        self.lock().resumed.clone()
    }

    /// How often the script with this id was loaded
    #[must_use]
    pub fn script_loads(&self, id: &str) -> usize {
        self.lock().script_loads.get(id).copied().unwrap_or(0)
    }

    /// Number of connection attempts seen, refused ones included
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Number of isolate-started subscriptions opened
    #[must_use]
    pub fn start_subscriptions(&self) -> usize {
        self.lock().start_subscriptions
    }

    /// Chronological `report:<id>` / `resume:<id>` log
    #[must_use]
    pub fn event_log(&self) -> Vec<String> {
        self.lock().event_log.clone()
    }

    /// Whether the connection was closed
    #[must_use]
    pub fn closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl VmConnector for MockVm {
    async fn connect(&self, _ws_uri: &str) -> CollectResult<Arc<dyn VmService>> {
        let mut vm = self.lock();
        vm.connect_attempts += 1;
        if vm.connect_failures > 0 {
            vm.connect_failures -= 1;
            return Err(CollectError::Connection {
                message: "connection refused".to_string(),
            });
        }
        drop(vm);
        Ok(Arc::new(MockService {
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
struct MockService {
    state: Arc<Mutex<VmState>>,
}

impl MockService {
    fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().expect("mock VM state poisoned")
    }
}

#[async_trait]
impl VmService for MockService {
    async fn ping(&self) -> CollectResult<()> {
        let delay = self.lock().ping_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn list_isolates(&self) -> CollectResult<Vec<IsolateRef>> {
        Ok(self
            .lock()
            .isolates
            .iter()
            .filter(|entry| entry.state.is_some())
            .map(|entry| entry.isolate.clone())
            .collect())
    }

    async fn isolate_state(&self, isolate: &IsolateRef) -> CollectResult<Option<PauseState>> {
        Ok(self
            .lock()
            .isolates
            .iter()
            .find(|entry| entry.isolate.id == isolate.id)
            .and_then(|entry| entry.state))
    }

    async fn source_report(
        &self,
        isolate: &IsolateRef,
        _force_compile: bool,
    ) -> CollectResult<SourceReport> {
        let (report, delay) = {
            let mut guard = self.lock();
            let vm = &mut *guard;
            vm.event_log.push(format!("report:{}", isolate.id));
            let Some(entry) = vm
                .isolates
                .iter_mut()
                .find(|entry| entry.isolate.id == isolate.id)
            else {
                return Err(CollectError::Service {
                    message: format!("unknown isolate {}", isolate.id),
                });
            };
            let report = entry.report.clone();
            if vm.vanish_after_report.contains(&isolate.id) {
                entry.state = None;
            }
            (report, vm.report_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(report)
    }

    async fn resume(&self, isolate: &IsolateRef) -> CollectResult<()> {
        let mut guard = self.lock();
        let vm = &mut *guard;
        vm.event_log.push(format!("resume:{}", isolate.id));
        vm.resumed.push(isolate.id.clone());
        if let Some(entry) = vm
            .isolates
            .iter_mut()
            .find(|entry| entry.isolate.id == isolate.id)
        {
            if entry.state.is_some() {
                entry.state = Some(PauseState::Running);
            }
        }
        Ok(())
    }

    async fn load_script(&self, script: &ScriptRef) -> CollectResult<Script> {
        let mut vm = self.lock();
        *vm.script_loads.entry(script.id.clone()).or_insert(0) += 1;
        vm.scripts
            .get(&script.id)
            .cloned()
            .ok_or_else(|| CollectError::Service {
                message: format!("unknown script {}", script.id),
            })
    }

    async fn subscribe_isolate_started(&self) -> CollectResult<EventStream<IsolateRef>> {
        let (tx, rx) = unbounded();
        let mut vm = self.lock();
        vm.start_subscriptions += 1;
        vm.started_subscribers.push(tx);
        Ok(rx.boxed())
    }

    async fn subscribe_pause_events(
        &self,
        isolate: &IsolateRef,
    ) -> CollectResult<EventStream<IsolateEvent>> {
        let (tx, rx) = unbounded();
        let mut guard = self.lock();
        let vm = &mut *guard;
        let Some(entry) = vm
            .isolates
            .iter_mut()
            .find(|entry| entry.isolate.id == isolate.id)
        else {
            return Err(CollectError::Service {
                message: format!("unknown isolate {}", isolate.id),
            });
        };
        entry.pause_subscribers.push(tx);
        Ok(rx.boxed())
    }

    async fn close(&self) -> CollectResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}
