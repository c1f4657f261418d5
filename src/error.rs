use std::path::PathBuf;
use thiserror::Error;

/// Result of a handler's `matches` check that did not produce `true`.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Expected shape mismatch; the dispatcher moves on to the next handler.
    #[error("no match: {0}")]
    NoMatch(String),
    /// Anything else that went wrong while inspecting the event.
    #[error("match failed: {0}")]
    Malformed(String),
}

impl MatchError {
    pub fn no_match(reason: impl Into<String>) -> Self {
        Self::NoMatch(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not an image payload: {0}")]
    NotAnImagePayload(String),
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write label: {0}")]
    Label(#[from] serde_json::Error),
    #[error("image worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("out of events")]
    OutOfEvents,
    #[error("row {0} is not pickable under the current parameter selection")]
    NotPickable(usize),
    #[error("unrecognized selection mode {0:?}")]
    UnknownMode(String),
    #[error("row {row}: {reason}")]
    BadRow { row: usize, reason: String },
    #[error("row {row}: no blob for channel {channel}")]
    MissingBlob { row: usize, channel: String },
    #[error("dataset io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset parse error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum LightStateError {
    #[error("luminaire {luminaire}: unrecognized measured state {state:?}")]
    BadMeasuredState { luminaire: String, state: String },
    #[error("light state value is not a struct")]
    NotAStruct,
    #[error("history lookup failed: {0}")]
    History(#[from] PersistenceError),
    #[error("failed to append light state log: {0}")]
    Log(#[from] csv::Error),
    #[error("light state log io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint {0:?}")]
    Endpoint(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    Response(String),
    #[error("no async runtime available to run the feed")]
    NoRuntime,
}

/// Per-event failure surfaced by a handler's `execute`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    LightState(#[from] LightStateError),
    #[error("handler received an event it does not handle")]
    Unexpected,
}
