mod mock;
mod yamcs;

pub use mock::{MockClient, MockContext, DEFAULT_MOCK_DELAY};
pub use yamcs::{normalize_endpoint, YamcsClient};

use crate::error::SourceError;
use crate::telemetry::TelemetrySample;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running subscription: samples arrive on `recv` until the feed is closed
/// or its source goes away.
#[derive(Debug)]
pub struct Feed {
    rx: mpsc::UnboundedReceiver<TelemetrySample>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Feed {
    fn new(
        rx: mpsc::UnboundedReceiver<TelemetrySample>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self { rx, cancel, task }
    }

    pub async fn recv(&mut self) -> Option<TelemetrySample> {
        self.rx.recv().await
    }

    /// Stops the producing task and collects everything it sent before
    /// exiting.
    pub async fn drain(mut self) -> Vec<TelemetrySample> {
        self.cancel.cancel();
        let mut rest = Vec::new();
        while let Some(sample) = self.rx.recv().await {
            rest.push(sample);
        }
        rest
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Telemetry source a subscription reads from.
#[derive(Debug, Clone)]
pub enum Client {
    Mock(MockClient),
    Yamcs(YamcsClient),
}

impl Client {
    pub fn kind(&self) -> &'static str {
        match self {
            Client::Mock(_) => "mock",
            Client::Yamcs(_) => "yamcs",
        }
    }

    pub fn subscribe(&self, parameters: &BTreeSet<String>) -> Result<Feed, SourceError> {
        match self {
            Client::Mock(client) => client.subscribe(parameters),
            Client::Yamcs(client) => client.subscribe(parameters),
        }
    }
}
