use super::Feed;
use crate::error::SourceError;
use crate::telemetry::TelemetrySample;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MOCK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct MockInner {
    cache: Mutex<HashMap<String, VecDeque<(u64, TelemetrySample)>>>,
    sequence: AtomicU64,
    notify: Notify,
    shutdown: CancellationToken,
}

/// In-process stand-in for the server's push channel: a per-parameter cache
/// that subscribed feeds drain.
///
/// Samples published for a parameter nobody watches stay cached until a feed
/// for it starts.
#[derive(Debug, Clone, Default)]
pub struct MockContext {
    inner: Arc<MockInner>,
}

impl MockContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, sample: TelemetrySample) {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        self.cache()
            .entry(sample.name.clone())
            .or_default()
            .push_back((seq, sample));
        self.inner.notify.notify_waiters();
    }

    /// Samples waiting for `parameter`.
    pub fn pending(&self, parameter: &str) -> usize {
        self.cache().get(parameter).map(VecDeque::len).unwrap_or(0)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, VecDeque<(u64, TelemetrySample)>>> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Removes and returns everything cached for `parameters`, in publish order.
    fn take(&self, parameters: &BTreeSet<String>) -> Vec<TelemetrySample> {
        let mut cache = self.cache();
        let mut taken: Vec<(u64, TelemetrySample)> = Vec::new();
        for name in parameters {
            if let Some(queue) = cache.get_mut(name) {
                taken.extend(queue.drain(..));
            }
        }
        taken.sort_by_key(|(seq, _)| *seq);
        taken.into_iter().map(|(_, sample)| sample).collect()
    }

    /// Stops every feed running against this context.
    pub fn kill(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct MockClient {
    ctx: MockContext,
    delay: Duration,
}

impl MockClient {
    pub fn new(ctx: MockContext) -> Self {
        Self {
            ctx,
            delay: DEFAULT_MOCK_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn subscribe(&self, parameters: &BTreeSet<String>) -> Result<Feed, SourceError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SourceError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ctx = self.ctx.clone();
        let parameters = parameters.clone();
        let delay = self.delay;
        let token = cancel.clone();

        let task = handle.spawn(async move {
            let shutdown = ctx.inner.shutdown.clone();
            loop {
                // register interest before draining so a publish in between still wakes us
                let notified = ctx.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                for sample in ctx.take(&parameters) {
                    if tx.send(sample).is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!(parameters = parameters.len(), "mock feed stopped");
        });
        Ok(Feed::new(rx, cancel, task))
    }
}
