use crate::source::{Client, Feed, MockClient, MockContext, YamcsClient};
use crate::telemetry::TelemetrySample;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INSTANCE: &str = "viper";
pub const DEFAULT_PROCESSOR: &str = "realtime";

/// What a subscription needs in order to run. Partial configurations are legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub parameters: BTreeSet<String>,
    pub mock: bool,
    pub endpoint: Option<String>,
    /// `(instance, processor)`
    pub processor_path: Option<(String, String)>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            parameters: BTreeSet::new(),
            mock: false,
            endpoint: None,
            processor_path: Some((DEFAULT_INSTANCE.to_string(), DEFAULT_PROCESSOR.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Uninitialized,
    NeedParameters,
    NeedUrl,
    NeedProcessorPath,
    Subscribed,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SubscriptionStatus::Uninitialized => "uninitialized",
            SubscriptionStatus::NeedParameters => "need parameters",
            SubscriptionStatus::NeedUrl => "need server url",
            SubscriptionStatus::NeedProcessorPath => "need processor path",
            SubscriptionStatus::Subscribed => "successfully subscribed",
        };
        f.write_str(text)
    }
}

/// Picks the client a configuration calls for, or the status explaining what
/// is missing. Mock mode ignores endpoint and processor path.
pub fn derive_client(
    config: &SubscriptionConfig,
    mock_ctx: &MockContext,
) -> Result<Client, SubscriptionStatus> {
    if config.mock {
        return Ok(Client::Mock(MockClient::new(mock_ctx.clone())));
    }
    let endpoint = config.endpoint.as_deref().ok_or(SubscriptionStatus::NeedUrl)?;
    let (instance, processor) = config
        .processor_path
        .as_ref()
        .ok_or(SubscriptionStatus::NeedProcessorPath)?;
    YamcsClient::new(endpoint, (instance.as_str(), processor.as_str()))
        .map(Client::Yamcs)
        .map_err(|err| {
            tracing::warn!(error = %err, endpoint = %endpoint, "cannot build yamcs client");
            SubscriptionStatus::NeedUrl
        })
}

struct Poller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one feed: its configuration, the background task that moves arriving
/// samples into a queue, and the drain side used by the owner loop.
pub struct SubscriptionManager {
    name: String,
    config: SubscriptionConfig,
    mock_ctx: MockContext,
    mock_delay: Option<Duration>,
    reconnect_delay: Option<Duration>,
    client: Option<Client>,
    status: SubscriptionStatus,
    queue: Arc<Mutex<VecDeque<TelemetrySample>>>,
    drained: u64,
    poller: Option<Poller>,
}

impl SubscriptionManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SubscriptionConfig::default(),
            mock_ctx: MockContext::new(),
            mock_delay: None,
            reconnect_delay: None,
            client: None,
            status: SubscriptionStatus::Uninitialized,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            drained: 0,
            poller: None,
        }
    }

    /// Applies a whole configuration at once, reconnecting if anything changed.
    pub fn configure(&mut self, config: SubscriptionConfig) {
        if self.config == config && self.status != SubscriptionStatus::Uninitialized {
            return;
        }
        self.config = config;
        self.reconnect();
    }

    pub fn with_mock_delay(mut self, delay: Duration) -> Self {
        self.mock_delay = Some(delay);
        self
    }

    /// Pause between a dropped server connection and the next attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn set_parameters<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names == self.config.parameters && self.status != SubscriptionStatus::Uninitialized {
            return;
        }
        self.config.parameters = names;
        self.reconnect();
    }

    pub fn set_mock(&mut self, mock: bool) {
        if self.config.mock == mock && self.status != SubscriptionStatus::Uninitialized {
            return;
        }
        self.config.mock = mock;
        self.reconnect();
    }

    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        let endpoint = Some(endpoint.into());
        if self.config.endpoint == endpoint && self.status != SubscriptionStatus::Uninitialized {
            return;
        }
        self.config.endpoint = endpoint;
        self.reconnect();
    }

    pub fn set_processor_path(&mut self, instance: impl Into<String>, processor: impl Into<String>) {
        let path = Some((instance.into(), processor.into()));
        if self.config.processor_path == path && self.status != SubscriptionStatus::Uninitialized {
            return;
        }
        self.config.processor_path = path;
        self.reconnect();
    }

    pub fn initialization_status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn client_kind(&self) -> Option<&'static str> {
        self.client.as_ref().map(Client::kind)
    }

    /// The in-process feed used when `mock` is set.
    pub fn mock_context(&self) -> &MockContext {
        &self.mock_ctx
    }

    /// Signals the running poller and hands back its task. The task keeps
    /// moving samples its feed already sent into the queue before it exits.
    fn stop_poller(&mut self) -> Option<JoinHandle<()>> {
        self.poller.take().map(|poller| {
            poller.cancel.cancel();
            poller.task
        })
    }

    fn reconnect(&mut self) {
        let previous = self.stop_poller();
        let client = match derive_client(&self.config, &self.mock_ctx) {
            Ok(client) => self.tune(client),
            Err(status) => {
                self.client = None;
                self.status = status;
                tracing::info!(subscription = %self.name, status = %status, "subscription waiting on configuration");
                return;
            }
        };
        if self.config.parameters.is_empty() {
            self.client = Some(client);
            self.status = SubscriptionStatus::NeedParameters;
            return;
        }
        match client.subscribe(&self.config.parameters) {
            Ok(feed) => {
                self.poller = Some(spawn_poller(feed, self.queue.clone(), previous));
                self.status = SubscriptionStatus::Subscribed;
                tracing::info!(
                    subscription = %self.name,
                    client = client.kind(),
                    parameters = self.config.parameters.len(),
                    "subscribed"
                );
            }
            Err(err) => {
                tracing::warn!(subscription = %self.name, error = %err, "subscribe failed");
                self.status = SubscriptionStatus::Uninitialized;
            }
        }
        self.client = Some(client);
    }

    fn tune(&self, client: Client) -> Client {
        match client {
            Client::Mock(mock) => match self.mock_delay {
                Some(delay) => Client::Mock(mock.with_delay(delay)),
                None => Client::Mock(mock),
            },
            Client::Yamcs(yamcs) => match self.reconnect_delay {
                Some(delay) => Client::Yamcs(yamcs.with_reconnect_delay(delay)),
                None => Client::Yamcs(yamcs),
            },
        }
    }

    /// Takes everything buffered since the last call, in arrival order. Never blocks.
    pub fn poll(&mut self) -> Vec<TelemetrySample> {
        let drained: Vec<TelemetrySample> = lock_queue(&self.queue).drain(..).collect();
        self.drained += drained.len() as u64;
        drained
    }

    /// Total samples handed out by `poll`.
    pub fn count(&self) -> u64 {
        self.drained
    }

    /// Samples waiting for the next `poll`.
    pub fn buffered(&self) -> usize {
        lock_queue(&self.queue).len()
    }

    /// Stops the background task and shuts down the owned mock feed.
    pub fn close(&mut self) {
        let _ = self.stop_poller();
        self.mock_ctx.kill();
        self.mock_ctx = MockContext::new();
        self.client = None;
        self.status = SubscriptionStatus::Uninitialized;
        tracing::debug!(subscription = %self.name, "subscription closed");
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let _ = self.stop_poller();
        self.mock_ctx.kill();
    }
}

fn lock_queue(queue: &Mutex<VecDeque<TelemetrySample>>) -> MutexGuard<'_, VecDeque<TelemetrySample>> {
    queue.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("sample queue lock poisoned; recovering buffered samples");
        poisoned.into_inner()
    })
}

/// Moves samples from `feed` into `queue` until cancelled, then collects
/// whatever the feed had in flight. Starts only after `previous` finished so
/// a reconnect never interleaves two feeds' leftovers.
fn spawn_poller(
    mut feed: Feed,
    queue: Arc<Mutex<VecDeque<TelemetrySample>>>,
    previous: Option<JoinHandle<()>>,
) -> Poller {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        if let Some(previous) = previous {
            if let Err(err) = previous.await {
                tracing::warn!(error = %err, "previous subscription poller failed");
            }
        }
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = feed.recv() => match next {
                    Some(sample) => lock_queue(&queue).push_back(sample),
                    None => break,
                },
            }
        }
        let rest = feed.drain().await;
        if !rest.is_empty() {
            tracing::debug!(samples = rest.len(), "kept in-flight samples from closed feed");
            lock_queue(&queue).extend(rest);
        }
    });
    Poller { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Value;
    use chrono::{TimeZone, Utc};

    const PARAM: &str = "/ViperRover/LightsControl/state";

    fn sample(secs: i64) -> TelemetrySample {
        TelemetrySample::new(PARAM, Utc.timestamp_opt(secs, 0).unwrap(), Value::Int(secs))
    }

    async fn wait_for_buffered(manager: &SubscriptionManager, expected: usize) {
        for _ in 0..200 {
            if manager.buffered() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {expected} buffered samples");
    }

    #[test]
    fn derive_client_reports_missing_configuration() {
        let ctx = MockContext::new();
        let mut config = SubscriptionConfig::default();
        assert_eq!(
            derive_client(&config, &ctx).unwrap_err(),
            SubscriptionStatus::NeedUrl
        );

        config.endpoint = Some("localhost:8090".to_string());
        config.processor_path = None;
        assert_eq!(
            derive_client(&config, &ctx).unwrap_err(),
            SubscriptionStatus::NeedProcessorPath
        );

        config.processor_path = Some(("viper".to_string(), "realtime".to_string()));
        assert_eq!(derive_client(&config, &ctx).unwrap().kind(), "yamcs");

        config.mock = true;
        config.endpoint = None;
        assert_eq!(derive_client(&config, &ctx).unwrap().kind(), "mock");
    }

    #[tokio::test]
    async fn status_follows_configuration() {
        let mut manager = SubscriptionManager::new("lights");
        assert_eq!(manager.initialization_status(), SubscriptionStatus::Uninitialized);

        manager.set_parameters([PARAM]);
        assert_eq!(manager.initialization_status(), SubscriptionStatus::NeedUrl);
        assert_eq!(manager.initialization_status().to_string(), "need server url");

        manager.set_parameters(Vec::<String>::new());
        manager.set_mock(true);
        assert_eq!(manager.initialization_status(), SubscriptionStatus::NeedParameters);

        manager.set_parameters([PARAM]);
        assert_eq!(manager.initialization_status(), SubscriptionStatus::Subscribed);
        assert_eq!(manager.client_kind(), Some("mock"));
        manager.close();
        assert_eq!(manager.initialization_status(), SubscriptionStatus::Uninitialized);
    }

    #[tokio::test]
    async fn live_client_follows_endpoint_and_processor_path() {
        let mut manager = SubscriptionManager::new("images")
            .with_reconnect_delay(Duration::from_millis(50));
        manager.set_parameters([PARAM]);
        assert_eq!(manager.initialization_status(), SubscriptionStatus::NeedUrl);

        // nothing listens there; the feed keeps retrying in the background
        manager.set_endpoint("127.0.0.1:9");
        assert_eq!(manager.initialization_status(), SubscriptionStatus::Subscribed);
        assert_eq!(manager.client_kind(), Some("yamcs"));

        manager.set_processor_path("viper", "replay");
        assert_eq!(
            manager.config().processor_path,
            Some(("viper".to_string(), "replay".to_string()))
        );
        assert_eq!(manager.initialization_status(), SubscriptionStatus::Subscribed);
        assert!(manager.poll().is_empty());
        manager.close();
    }

    #[tokio::test]
    async fn poll_drains_everything_once_in_arrival_order() {
        let mut manager =
            SubscriptionManager::new("lights").with_mock_delay(Duration::from_millis(5));
        manager.set_mock(true);
        manager.set_parameters([PARAM]);
        assert!(manager.poll().is_empty());

        for secs in 1..=3 {
            manager.mock_context().add_event(sample(secs));
        }
        wait_for_buffered(&manager, 3).await;

        let drained: Vec<i64> = manager
            .poll()
            .into_iter()
            .map(|s| s.value.as_i64().unwrap())
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(manager.poll().is_empty());
        assert_eq!(manager.count(), 3);

        manager.mock_context().add_event(sample(4));
        wait_for_buffered(&manager, 1).await;
        assert_eq!(manager.poll().len(), 1);
        assert_eq!(manager.count(), 4);
        manager.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_while_publishing_neither_drop_nor_duplicate() {
        const PUBLISHED: i64 = 200;
        let mut manager =
            SubscriptionManager::new("lights").with_mock_delay(Duration::from_millis(1));
        manager.set_mock(true);
        manager.set_parameters([PARAM]);

        let ctx = manager.mock_context().clone();
        let publisher = tokio::spawn(async move {
            for secs in 0..PUBLISHED {
                ctx.add_event(sample(secs));
                if secs % 5 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        let mut toggles = 0;
        while !publisher.is_finished() {
            if toggles % 2 == 0 {
                manager.set_parameters([PARAM, "/ViperRover/Other"]);
            } else {
                manager.set_parameters([PARAM]);
            }
            toggles += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        publisher.await.unwrap();
        assert!(toggles > 1);

        wait_for_buffered(&manager, PUBLISHED as usize).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut drained: Vec<i64> = manager
            .poll()
            .into_iter()
            .map(|s| s.value.as_i64().unwrap())
            .collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..PUBLISHED).collect::<Vec<_>>());
        assert_eq!(manager.count(), PUBLISHED as u64);
        manager.close();
    }

    #[test]
    fn poisoned_queue_still_drains() {
        let mut manager = SubscriptionManager::new("lights");
        let queue = manager.queue.clone();
        let poisoner = std::thread::spawn(move || {
            let mut guard = queue.lock().unwrap();
            guard.push_back(sample(1));
            panic!("poisoning the sample queue");
        });
        assert!(poisoner.join().is_err());
        assert!(manager.queue.is_poisoned());

        assert_eq!(manager.buffered(), 1);
        assert_eq!(manager.poll().len(), 1);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn reconnect_keeps_buffered_samples() {
        let mut manager =
            SubscriptionManager::new("lights").with_mock_delay(Duration::from_millis(5));
        manager.set_mock(true);
        manager.set_parameters([PARAM]);
        manager.mock_context().add_event(sample(1));
        wait_for_buffered(&manager, 1).await;

        manager.set_parameters([PARAM, "/ViperRover/Other"]);
        assert_eq!(manager.buffered(), 1);
        assert_eq!(manager.poll().len(), 1);
        manager.close();
    }
}
