use crate::error::{HandlerError, ImageError, MatchError};
use crate::imaging::{ImageProcessor, Thumbnailer};
use crate::lights::LightStateTracker;
use crate::sink::Record;
use crate::telemetry::{TelemetrySample, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Unit of work routed through a dispatcher.
#[derive(Debug, Clone)]
pub enum Event {
    /// A sample drained from a subscription.
    Parameter(TelemetrySample),
    /// A sample recognized as a published image.
    ImagePublished(TelemetrySample),
    /// A full-resolution frame landed on disk.
    FileWritten(PathBuf),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Parameter(_) => "parameter",
            Event::ImagePublished(_) => "image_published",
            Event::FileWritten(_) => "file_written",
        }
    }
}

/// What a handler produced: records for the sink and events to dispatch next.
#[derive(Debug, Default)]
pub struct Effects {
    pub records: Vec<Record>,
    pub events: Vec<Event>,
}

impl Effects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            events: Vec::new(),
        }
    }

    pub fn event(event: Event) -> Self {
        Self {
            records: Vec::new(),
            events: vec![event],
        }
    }
}

pub enum Handler {
    /// Recognizes raw samples carrying an image header and payload.
    ImageCheck,
    LightState(LightStateTracker),
    ImageProcessor(Arc<ImageProcessor>),
    Thumbnailer(Arc<Thumbnailer>),
}

fn image_check(sample: &TelemetrySample) -> Result<(), MatchError> {
    let fields = sample
        .value
        .as_struct()
        .ok_or_else(|| MatchError::no_match("value is not a struct"))?;
    if !fields.contains_key("imageHeader") {
        return Err(MatchError::no_match("no imageHeader"));
    }
    match fields.get("imageData") {
        Some(Value::Bytes(_)) => Ok(()),
        Some(other) => Err(MatchError::Malformed(format!(
            "{}: imageData is not a byte string ({other:?})",
            sample.name
        ))),
        None => Err(MatchError::no_match("no imageData")),
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, ImageError>
where
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ImageError::Worker(err.to_string()))?
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::ImageCheck => "image_check",
            Handler::LightState(_) => "light_state",
            Handler::ImageProcessor(_) => "image_processor",
            Handler::Thumbnailer(_) => "thumbnailer",
        }
    }

    /// `Ok(())` when this handler takes the event.
    pub fn matches(&self, event: &Event) -> Result<(), MatchError> {
        match (self, event) {
            (Handler::ImageCheck, Event::Parameter(sample)) => image_check(sample),
            (Handler::LightState(_), Event::Parameter(sample)) => {
                if LightStateTracker::matches(sample) {
                    Ok(())
                } else {
                    Err(MatchError::no_match("not a light state parameter"))
                }
            }
            (Handler::ImageProcessor(_), Event::ImagePublished(_)) => Ok(()),
            (Handler::Thumbnailer(thumbnailer), Event::FileWritten(path)) => {
                if thumbnailer.accepts(path) {
                    Ok(())
                } else {
                    Err(MatchError::no_match("not a full-resolution frame"))
                }
            }
            _ => Err(MatchError::no_match(format!(
                "{} does not handle {} events",
                self.name(),
                event.kind()
            ))),
        }
    }

    pub async fn initialize(&mut self) -> Result<(), HandlerError> {
        if let Handler::LightState(tracker) = self {
            tracker.initialize_from_history().await?;
        }
        Ok(())
    }

    pub async fn execute(&mut self, event: Event) -> Result<Effects, HandlerError> {
        match (self, event) {
            (Handler::ImageCheck, Event::Parameter(sample)) => {
                Ok(Effects::event(Event::ImagePublished(sample)))
            }
            (Handler::LightState(tracker), Event::Parameter(sample)) => {
                let transitions = tracker.process(&sample).await?;
                Ok(Effects::records(
                    transitions.into_iter().map(Record::LightTransition).collect(),
                ))
            }
            (Handler::ImageProcessor(processor), Event::ImagePublished(sample)) => {
                let processor = processor.clone();
                let frame = run_blocking(move || processor.process(&sample)).await?;
                let written = frame.path.clone();
                tracing::info!(product_id = %frame.product_id, "frame written");
                Ok(Effects {
                    records: vec![Record::Frame(frame)],
                    events: vec![Event::FileWritten(written)],
                })
            }
            (Handler::Thumbnailer(thumbnailer), Event::FileWritten(path)) => {
                let thumbnailer = thumbnailer.clone();
                let previews = run_blocking(move || thumbnailer.write_previews(&path)).await?;
                tracing::debug!(
                    browse = %previews.browse.display(),
                    thumbnail = %previews.thumbnail.display(),
                    "previews written"
                );
                Ok(Effects::none())
            }
            _ => Err(HandlerError::Unexpected),
        }
    }
}

pub enum DispatchOutcome {
    Handled {
        handler: &'static str,
        effects: Effects,
    },
    Unmatched,
}

/// Ordered handler list; the first handler that matches an event executes it.
pub struct Dispatcher {
    handlers: Vec<Handler>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self { handlers }
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(Handler::name).collect()
    }

    pub async fn initialize(&mut self) -> Result<(), HandlerError> {
        for handler in &mut self.handlers {
            handler.initialize().await?;
        }
        Ok(())
    }

    pub async fn dispatch(&mut self, event: Event) -> Result<DispatchOutcome, HandlerError> {
        let mut chosen = None;
        for (ix, handler) in self.handlers.iter().enumerate() {
            match handler.matches(&event) {
                Ok(()) => {
                    chosen = Some(ix);
                    break;
                }
                Err(MatchError::NoMatch(_)) => {}
                Err(err) => {
                    tracing::warn!(handler = handler.name(), error = %err, "match failed");
                }
            }
        }
        let Some(ix) = chosen else {
            return Ok(DispatchOutcome::Unmatched);
        };
        let handler = &mut self.handlers[ix];
        let name = handler.name();
        let effects = handler.execute(event).await?;
        Ok(DispatchOutcome::Handled {
            handler: name,
            effects,
        })
    }
}
