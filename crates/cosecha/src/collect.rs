//! Collection entry point and orchestration.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connect::connect;
use crate::hitmap::CoverageEnvelope;
use crate::result::CollectResult;
use crate::service::{VmConnector, VmService};
use crate::strategy::{Accumulator, CollectStrategy, ExitCollector, OnceCollector};

/// Options for one coverage collection, fixed for the whole call
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOptions {
    /// Resume paused isolates once their coverage is collected
    pub resume: bool,
    /// Wait until every isolate is paused before collecting (one-time mode)
    pub wait_paused: bool,
    /// Track isolates and collect each at its about-to-exit pause
    pub on_exit: bool,
    /// Overall deadline for connect and wait-for-paused; `None` retries forever
    pub timeout: Option<Duration>,
}

impl CollectOptions {
    /// Create options with defaults (one-time mode, no resume, no deadline)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume paused isolates after collection
    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Wait for every isolate to pause before the one-time pass
    #[must_use]
    pub const fn with_wait_paused(mut self, wait_paused: bool) -> Self {
        self.wait_paused = wait_paused;
        self
    }

    /// Select the exit-tracking strategy instead of the one-time pass
    #[must_use]
    pub const fn with_on_exit(mut self, on_exit: bool) -> Self {
        self.on_exit = on_exit;
        self
    }

    /// Bound connect and wait-for-paused by an overall deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Collect coverage from the process behind `endpoint`.
///
/// Orchestrates connect, prepare and collect, then always runs teardown
/// and closes the connection, whether the main phase succeeded or not.
/// The main phase's error wins over a teardown error, which wins over a
/// close error; teardown failures are surfaced, not swallowed. A failure
/// never yields a partial envelope.
///
/// # Errors
///
/// Propagates [`crate::CollectError`] from any phase; a connect failure
/// aborts before prepare and leaves nothing to tear down.
pub async fn collect(
    connector: &dyn VmConnector,
    endpoint: &str,
    options: CollectOptions,
) -> CollectResult<CoverageEnvelope> {
    let service = connect(connector, endpoint, options.timeout).await?;

    let mut strategy: Box<dyn CollectStrategy> = if options.on_exit {
        Box::new(ExitCollector::new(&options))
    } else {
        Box::new(OnceCollector::new(&options))
    };
    let accumulator: Accumulator = Arc::new(Mutex::new(Vec::new()));

    let phases = run_phases(strategy.as_mut(), &service, &accumulator).await;
    let teardown = strategy.teardown(&service).await;
    let closed = service.close().await;

    phases?;
    teardown?;
    closed?;

    let entries = std::mem::take(&mut *accumulator.lock().await);
    Ok(CoverageEnvelope::new(entries))
}

async fn run_phases(
    strategy: &mut dyn CollectStrategy,
    service: &Arc<dyn VmService>,
    accumulator: &Accumulator,
) -> CollectResult<()> {
    strategy.prepare(service).await?;
    strategy.collect(service, accumulator).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = CollectOptions::default();
        assert!(!options.resume);
        assert!(!options.wait_paused);
        assert!(!options.on_exit);
        assert!(options.timeout.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = CollectOptions::new()
            .with_resume(true)
            .with_on_exit(true)
            .with_timeout(Duration::from_secs(5));
        assert!(options.resume);
        assert!(options.on_exit);
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
    }
}
