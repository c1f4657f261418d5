#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::dispatch::{Dispatcher, Event, Handler};
use crate::error::{HandlerError, ReplayError};
use crate::imaging::{ImageProcessor, Thumbnailer};
use crate::lights::{LightStateLog, LightStateTracker};
use crate::pipeline::{process_batch, BatchReport, PipelineStats};
use crate::replay::ReplaySimulator;
use crate::sink::{LightHistory, RecordSink};
use crate::source::MockContext;
use crate::subscription::{SubscriptionConfig, SubscriptionManager, SubscriptionStatus};
use crate::telemetry::TelemetrySample;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const IMAGE_WATCHER: &str = "image_watcher";
pub const LIGHT_WATCHER: &str = "light_watcher";

/// One subscription and the dispatcher its samples run through.
pub struct Watch {
    manager: SubscriptionManager,
    dispatcher: Dispatcher,
    subscription: SubscriptionConfig,
}

impl Watch {
    pub fn new(manager: SubscriptionManager, dispatcher: Dispatcher, subscription: SubscriptionConfig) -> Self {
        Self {
            manager,
            dispatcher,
            subscription,
        }
    }

    pub fn name(&self) -> &str {
        self.manager.name()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.manager.initialization_status()
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.dispatcher.handler_names()
    }
}

fn subscription_config(config: &Config, parameters: &[String]) -> SubscriptionConfig {
    SubscriptionConfig {
        parameters: parameters.iter().cloned().collect(),
        mock: config.mock,
        endpoint: config.yamcs_url.clone(),
        processor_path: Some(config.processor_path.clone()),
    }
}

/// Routes mock samples to every watch subscribed to their parameter.
#[derive(Debug, Clone, Default)]
pub struct MockRouter {
    targets: Vec<(BTreeSet<String>, MockContext)>,
}

impl MockRouter {
    /// Returns how many feeds received the sample.
    pub fn publish(&self, sample: TelemetrySample) -> usize {
        let mut delivered = 0;
        for (parameters, ctx) in &self.targets {
            if parameters.contains(&sample.name) {
                ctx.add_event(sample.clone());
                delivered += 1;
            }
        }
        if delivered == 0 {
            tracing::debug!(parameter = %sample.name, "no watch subscribed to replayed sample");
        }
        delivered
    }
}

/// Owner loop: polls every watch, dispatches what arrived and flushes the
/// resulting records to the sink.
pub struct Station {
    watches: Vec<Watch>,
    sink: Arc<dyn RecordSink>,
    stats: Arc<PipelineStats>,
    interval: Duration,
}

impl Station {
    pub fn new<S>(config: &Config, sink: Arc<S>) -> Self
    where
        S: RecordSink + LightHistory + 'static,
    {
        let history: Arc<dyn LightHistory> = sink.clone();

        let image_dispatcher = Dispatcher::new(vec![
            Handler::ImageCheck,
            Handler::ImageProcessor(Arc::new(ImageProcessor::new(config.product_dir.clone()))),
            Handler::Thumbnailer(Arc::new(Thumbnailer::new(
                Some(config.browse_dir.clone()),
                config.thumbnail_bounds(),
            ))),
        ]);

        let mut tracker = LightStateTracker::new(history, config.luminaires.clone());
        if let Some(path) = &config.light_log_path {
            tracker = tracker.with_log(LightStateLog::new(path.clone(), config.luminaires.clone()));
        }
        let light_dispatcher = Dispatcher::new(vec![Handler::LightState(tracker)]);

        let watches = vec![
            Watch::new(
                SubscriptionManager::new(IMAGE_WATCHER).with_reconnect_delay(config.reconnect_delay()),
                image_dispatcher,
                subscription_config(config, &config.image_parameters),
            ),
            Watch::new(
                SubscriptionManager::new(LIGHT_WATCHER).with_reconnect_delay(config.reconnect_delay()),
                light_dispatcher,
                subscription_config(config, &config.light_parameters),
            ),
        ];

        Self {
            watches,
            sink,
            stats: Arc::new(PipelineStats::new()),
            interval: config.update_interval(),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    pub fn statuses(&self) -> Vec<(&str, SubscriptionStatus)> {
        self.watches
            .iter()
            .map(|watch| (watch.name(), watch.status()))
            .collect()
    }

    /// Loads handler state from history, then opens every subscription.
    pub async fn initialize(&mut self) -> Result<(), HandlerError> {
        for watch in &mut self.watches {
            watch.dispatcher.initialize().await?;
            watch.manager.configure(watch.subscription.clone());
            tracing::info!(
                watch = %watch.manager.name(),
                status = %watch.status(),
                handlers = ?watch.handler_names(),
                "watch initialized"
            );
        }
        Ok(())
    }

    pub fn mock_router(&self) -> MockRouter {
        MockRouter {
            targets: self
                .watches
                .iter()
                .map(|watch| {
                    (
                        watch.manager.config().parameters.clone(),
                        watch.manager.mock_context().clone(),
                    )
                })
                .collect(),
        }
    }

    /// Drains every watch once and runs the samples through its dispatcher.
    /// A failed flush drops that watch's records; it is logged and counted.
    pub async fn tick(&mut self) -> BatchReport {
        let mut total = BatchReport::default();
        for watch in &mut self.watches {
            let samples = watch.manager.poll();
            if samples.is_empty() {
                continue;
            }
            self.stats
                .drained
                .fetch_add(samples.len() as u64, Ordering::Relaxed);
            let events = samples.into_iter().map(Event::Parameter).collect();
            match process_batch(&mut watch.dispatcher, events, &*self.sink, &self.stats).await {
                Ok(report) => {
                    total.dispatched += report.dispatched;
                    total.unmatched += report.unmatched;
                    total.failed += report.failed;
                    total.records += report.records;
                }
                Err(err) => {
                    tracing::warn!(watch = %watch.manager.name(), error = %err, "dropped record batch");
                }
            }
        }
        total
    }

    /// Ticks until `cancel` fires, then closes every watch.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.dispatched + report.unmatched + report.failed > 0 {
                        tracing::debug!(
                            dispatched = report.dispatched,
                            unmatched = report.unmatched,
                            failed = report.failed,
                            records = report.records,
                            "station tick"
                        );
                    }
                }
            }
        }
        self.close();
    }

    pub fn close(&mut self) {
        for watch in &mut self.watches {
            watch.manager.close();
        }
        let stats = self.stats.snapshot();
        tracing::info!(
            drained = stats.drained,
            dispatched = stats.dispatched,
            failed = stats.failed,
            records = stats.records_written,
            "station closed"
        );
    }
}

/// Serves replay rows into the mock feeds at a fixed cadence until the
/// simulator runs out of events or `cancel` fires.
pub fn spawn_replay_feeder(
    mut simulator: ReplaySimulator,
    router: MockRouter,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let overrides = BTreeMap::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match simulator.serve_one(None, &overrides) {
                    Ok(sample) => {
                        router.publish(sample);
                    }
                    Err(ReplayError::OutOfEvents) => {
                        tracing::info!(served = simulator.served().len(), "replay finished");
                        break;
                    }
                    Err(err) => {
                        let row = simulator.skip();
                        tracing::warn!(error = %err, row = ?row, "skipping replay row");
                    }
                },
            }
        }
    })
}
