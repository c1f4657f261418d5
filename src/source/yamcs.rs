use super::Feed;
use crate::error::SourceError;
use crate::telemetry::{TelemetrySample, Value};
use crate::time::parse_datetime;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ARCHIVE_PAGE_SIZE: u32 = 1000;
const SUBSCRIBE_CALL_ID: u32 = 1;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Adds `http://` to scheme-less endpoints and strips the trailing slash.
pub fn normalize_endpoint(raw: &str) -> Result<String, SourceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SourceError::Endpoint(raw.to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme).map_err(|_| SourceError::Endpoint(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(SourceError::Endpoint(raw.to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[derive(Debug, Serialize)]
struct ClientMessage<'a> {
    #[serde(rename = "type")]
    topic: &'static str,
    id: u32,
    options: SubscribeParametersRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeParametersRequest<'a> {
    instance: &'a str,
    processor: &'a str,
    id: Vec<NamedObjectId<'a>>,
    send_from_cache: bool,
    update_on_expiration: bool,
    abort_on_invalid: bool,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct NamedObjectId<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    topic: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscribeParametersData {
    #[serde(default)]
    mapping: HashMap<u32, ParameterIdWire>,
    #[serde(default)]
    values: Vec<ParameterValueWire>,
    #[serde(default)]
    invalid: Vec<ParameterIdWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveResponse {
    #[serde(default)]
    parameter: Vec<ParameterValueWire>,
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParameterIdWire {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParameterValueWire {
    id: Option<ParameterIdWire>,
    numeric_id: Option<u32>,
    raw_value: Option<ValueWire>,
    eng_value: Option<ValueWire>,
    generation_time: Option<String>,
    acquisition_time: Option<String>,
    acquisition_status: Option<String>,
    monitoring_result: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueWire {
    #[serde(rename = "type")]
    kind: String,
    float_value: Option<f64>,
    double_value: Option<f64>,
    sint32_value: Option<i64>,
    uint32_value: Option<i64>,
    // 64-bit integers arrive as JSON strings
    sint64_value: Option<serde_json::Value>,
    uint64_value: Option<serde_json::Value>,
    boolean_value: Option<bool>,
    string_value: Option<String>,
    binary_value: Option<String>,
    aggregate_value: Option<AggregateWire>,
    array_value: Option<Vec<ValueWire>>,
}

#[derive(Debug, Deserialize)]
struct AggregateWire {
    #[serde(default)]
    name: Vec<String>,
    #[serde(default)]
    value: Vec<ValueWire>,
}

fn wide_int(raw: Option<&serde_json::Value>) -> Value {
    match raw {
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .map(Value::Int)
            .or_else(|| number.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Some(serde_json::Value::String(text)) => text
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| text.parse::<f64>().map(Value::Float))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

impl ValueWire {
    fn into_value(self) -> Result<Value, SourceError> {
        let value = match self.kind.as_str() {
            "FLOAT" => self.float_value.map(Value::Float).unwrap_or(Value::Null),
            "DOUBLE" => self.double_value.map(Value::Float).unwrap_or(Value::Null),
            "SINT32" => self.sint32_value.map(Value::Int).unwrap_or(Value::Null),
            "UINT32" => self.uint32_value.map(Value::Int).unwrap_or(Value::Null),
            "SINT64" => wide_int(self.sint64_value.as_ref()),
            "UINT64" => wide_int(self.uint64_value.as_ref()),
            "BOOLEAN" => self.boolean_value.map(Value::Bool).unwrap_or(Value::Null),
            "STRING" | "ENUMERATED" => self.string_value.map(Value::Text).unwrap_or(Value::Null),
            "TIMESTAMP" => match self.string_value {
                Some(text) => parse_datetime(&text)
                    .map(Value::Time)
                    .unwrap_or(Value::Text(text)),
                None => Value::Null,
            },
            "BINARY" => match self.binary_value {
                Some(encoded) => Value::from(
                    BASE64
                        .decode(encoded.as_bytes())
                        .map_err(|err| SourceError::Response(format!("bad binary value: {err}")))?,
                ),
                None => Value::Null,
            },
            "AGGREGATE" => {
                let aggregate = self.aggregate_value.unwrap_or(AggregateWire {
                    name: Vec::new(),
                    value: Vec::new(),
                });
                let mut fields = BTreeMap::new();
                for (name, member) in aggregate.name.into_iter().zip(aggregate.value) {
                    fields.insert(name, member.into_value()?);
                }
                Value::Struct(fields)
            }
            "ARRAY" => {
                let mut fields = BTreeMap::new();
                for (ix, member) in self.array_value.unwrap_or_default().into_iter().enumerate() {
                    fields.insert(ix.to_string(), member.into_value()?);
                }
                Value::Struct(fields)
            }
            _ => Value::Null,
        };
        Ok(value)
    }
}

impl ParameterValueWire {
    fn into_sample(self, fallback_name: Option<&str>) -> Result<TelemetrySample, SourceError> {
        let name = self
            .id
            .map(|id| id.name)
            .or_else(|| fallback_name.map(str::to_string))
            .ok_or_else(|| SourceError::Response("parameter value without a name".to_string()))?;
        let generation_time = self
            .generation_time
            .as_deref()
            .and_then(parse_datetime)
            .ok_or_else(|| SourceError::Response(format!("{name}: missing generation time")))?;
        let value = match self.eng_value {
            Some(eng) => eng.into_value()?,
            None => Value::Null,
        };
        let mut sample = TelemetrySample::new(name, generation_time, value);
        sample.reception_time = self.acquisition_time.as_deref().and_then(parse_datetime);
        if let Some(raw) = self.raw_value {
            sample.raw_value = Some(raw.into_value()?);
        }
        if let Some(status) = self.acquisition_status {
            sample.fields.insert("acquisition_status".to_string(), Value::Text(status));
        }
        if let Some(result) = self.monitoring_result {
            sample.fields.insert("monitoring_result".to_string(), Value::Text(result));
        }
        Ok(sample)
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decodes one push-channel message into samples. `names` carries the
/// numeric id mapping the server announces once per connection.
fn decode_message(
    text: &str,
    names: &mut HashMap<u32, String>,
) -> Result<Vec<TelemetrySample>, SourceError> {
    let message: ServerMessage = serde_json::from_str(text)?;
    match message.topic.as_str() {
        "parameters" => {}
        "reply" => {
            if let Some(reason) = message.data.get("message").and_then(serde_json::Value::as_str) {
                return Err(SourceError::Response(format!(
                    "parameter subscription rejected: {reason}"
                )));
            }
            return Ok(Vec::new());
        }
        _ => return Ok(Vec::new()),
    }
    let data: SubscribeParametersData = serde_json::from_value(message.data)?;
    for invalid in &data.invalid {
        tracing::warn!(parameter = %invalid.name, "server does not know subscribed parameter");
    }
    names.extend(data.mapping.into_iter().map(|(id, parameter)| (id, parameter.name)));

    let mut samples = Vec::with_capacity(data.values.len());
    for value in data.values {
        let name = value.numeric_id.and_then(|id| names.get(&id)).cloned();
        match value.into_sample(name.as_deref()) {
            Ok(sample) => samples.push(sample),
            Err(err) => tracing::warn!(error = %err, "skipping malformed parameter value"),
        }
    }
    Ok(samples)
}

/// Sends `sample` unless `seen` already covers its generation time, and
/// records it in `latest`. Returns false once the receiver is gone.
fn forward(
    sample: TelemetrySample,
    seen: &HashMap<String, DateTime<Utc>>,
    latest: &mut HashMap<String, DateTime<Utc>>,
    tx: &mpsc::UnboundedSender<TelemetrySample>,
) -> bool {
    let repeated = seen
        .get(&sample.name)
        .map(|at| sample.generation_time <= *at)
        .unwrap_or(false);
    if repeated {
        return true;
    }
    let at = sample.generation_time;
    latest
        .entry(sample.name.clone())
        .and_modify(|prev| {
            if at > *prev {
                *prev = at;
            }
        })
        .or_insert(at);
    tx.send(sample).is_ok()
}

enum SessionEnd {
    Cancelled,
    ReceiverGone,
    Disconnected,
}

/// Client for a Yamcs server, scoped to one instance/processor pair.
#[derive(Debug, Clone)]
pub struct YamcsClient {
    http: reqwest::Client,
    base: String,
    instance: String,
    processor: String,
    reconnect_delay: Duration,
}

impl YamcsClient {
    pub fn new(endpoint: &str, processor_path: (&str, &str)) -> Result<Self, SourceError> {
        let base = normalize_endpoint(endpoint)?;
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            instance: processor_path.0.to_string(),
            processor: processor_path.1.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn websocket_url(&self) -> String {
        // http -> ws, https -> wss
        format!("{}/api/websocket", self.base.replacen("http", "ws", 1))
    }

    fn archive_url(&self, name: &str) -> String {
        format!("{}/api/archive/{}/parameters{}", self.base, self.instance, name)
    }

    /// Archived values of `name` with `start <= generation_time < stop`, oldest first.
    pub async fn get_range(
        &self,
        name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<TelemetrySample>, SourceError> {
        let mut samples = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("order", "asc".to_string()),
                ("limit", ARCHIVE_PAGE_SIZE.to_string()),
            ];
            if let Some(start) = start {
                query.push(("start", format_time(start)));
            }
            if let Some(stop) = stop {
                query.push(("stop", format_time(stop)));
            }
            if let Some(token) = &next {
                query.push(("next", token.clone()));
            }
            let body: ArchiveResponse = self
                .http
                .get(self.archive_url(name))
                .query(&query)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            for value in body.parameter {
                samples.push(value.into_sample(Some(name))?);
            }
            match body.continuation_token {
                Some(token) if !token.is_empty() => next = Some(token),
                _ => break,
            }
        }
        Ok(samples)
    }

    /// One connection to the push channel. Values missed while disconnected
    /// are read back from the archive before live values are forwarded.
    async fn run_session(
        &self,
        parameters: &BTreeSet<String>,
        latest: &mut HashMap<String, DateTime<Utc>>,
        tx: &mpsc::UnboundedSender<TelemetrySample>,
        token: &CancellationToken,
    ) -> Result<SessionEnd, SourceError> {
        let (socket, _) = tokio::select! {
            _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = connect_async(self.websocket_url()) => connected?,
        };
        let (mut write, mut read) = socket.split();
        let request = ClientMessage {
            topic: "parameters",
            id: SUBSCRIBE_CALL_ID,
            options: SubscribeParametersRequest {
                instance: &self.instance,
                processor: &self.processor,
                id: parameters.iter().map(|name| NamedObjectId { name }).collect(),
                send_from_cache: true,
                update_on_expiration: false,
                abort_on_invalid: false,
                action: "REPLACE",
            },
        };
        write.send(Message::Text(serde_json::to_string(&request)?)).await?;
        tracing::info!(
            endpoint = %self.base,
            parameters = parameters.len(),
            "yamcs parameter subscription opened"
        );

        // live values queue up on the socket while the gap is filled
        let before = latest.clone();
        for name in parameters {
            let Some(since) = before.get(name).copied() else {
                continue;
            };
            let missed = tokio::select! {
                _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
                missed = self.get_range(name, Some(since), None) => missed?,
            };
            if !missed.is_empty() {
                tracing::info!(parameter = %name, samples = missed.len(), "caught up from archive");
            }
            for sample in missed {
                if !forward(sample, &before, latest, tx) {
                    return Ok(SessionEnd::ReceiverGone);
                }
            }
        }
        let caught_up = latest.clone();

        let mut names = HashMap::new();
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
                message = read.next() => message,
            };
            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            };
            let samples = match decode_message(&text, &mut names) {
                Ok(samples) => samples,
                Err(err @ SourceError::Response(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed yamcs message");
                    continue;
                }
            };
            for sample in samples {
                if !forward(sample, &caught_up, latest, tx) {
                    return Ok(SessionEnd::ReceiverGone);
                }
            }
        }
    }

    /// Subscribes to `parameters` over the server's WebSocket push channel,
    /// reconnecting after `reconnect_delay` whenever the connection drops.
    pub fn subscribe(&self, parameters: &BTreeSet<String>) -> Result<Feed, SourceError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SourceError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let client = self.clone();
        let parameters = parameters.clone();

        let task = handle.spawn(async move {
            let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
            loop {
                match client.run_session(&parameters, &mut latest, &tx, &token).await {
                    Ok(SessionEnd::Cancelled | SessionEnd::ReceiverGone) => break,
                    Ok(SessionEnd::Disconnected) => {
                        tracing::info!(endpoint = %client.base, "yamcs closed the parameter subscription");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, endpoint = %client.base, "yamcs parameter subscription failed");
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(client.reconnect_delay) => {}
                }
            }
            tracing::debug!(endpoint = %client.base, "yamcs feed stopped");
        });
        Ok(Feed::new(rx, cancel, task))
    }
}
