mod log;
mod state;

#[cfg(test)]
mod tests;

pub use log::LightStateLog;
pub use state::LightState;

use crate::error::LightStateError;
use crate::sink::{LightHistory, LightTransitionRecord};
use crate::telemetry::{TelemetrySample, Value};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub const LIGHT_STATE_PARAMETER: &str = "/ViperRover/LightsControl/state";

pub const DEFAULT_LUMINAIRES: &[&str] = &[
    "navLight1",
    "navLight2",
    "hazLight1",
    "hazLight2",
    "hazLight3",
    "hazLight4",
    "hazLight5",
    "hazLight6",
];

/// Transitions kept in memory for resyncs that run before the sink has them.
const RECENT_TRANSITIONS: usize = 256;

/// Turns luminaire state samples into transition records.
///
/// Memory is empty until [`initialize_from_history`](Self::initialize_from_history)
/// runs; samples seen before that are ignored.
pub struct LightStateTracker {
    history: Arc<dyn LightHistory>,
    luminaires: Vec<String>,
    log: Option<LightStateLog>,
    memory: Option<LightState>,
    recent: VecDeque<LightTransitionRecord>,
}

impl LightStateTracker {
    pub fn new(history: Arc<dyn LightHistory>, luminaires: Vec<String>) -> Self {
        Self {
            history,
            luminaires,
            log: None,
            memory: None,
            recent: VecDeque::with_capacity(RECENT_TRANSITIONS),
        }
    }

    pub fn with_log(mut self, log: LightStateLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn memory(&self) -> Option<&LightState> {
        self.memory.as_ref()
    }

    pub fn matches(sample: &TelemetrySample) -> bool {
        sample.name == LIGHT_STATE_PARAMETER
    }

    pub async fn initialize_from_history(&mut self) -> Result<(), LightStateError> {
        let state = self.snapshot_before(None).await?;
        tracing::info!(
            luminaires = self.luminaires.len(),
            as_of = ?state.as_of(),
            "light state initialized from history"
        );
        self.memory = Some(state);
        Ok(())
    }

    /// Latest known state per luminaire strictly before `before`; luminaires
    /// without history are off.
    ///
    /// Transitions this tracker emitted recently count as history even when
    /// the sink has not stored them yet.
    async fn snapshot_before(
        &self,
        before: Option<DateTime<Utc>>,
    ) -> Result<LightState, LightStateError> {
        let mut state = LightState::default();
        for luminaire in &self.luminaires {
            let stored = self.history.latest_before(luminaire, before).await?;
            let pending = self.recent_before(luminaire, before);
            let latest = match (stored, pending) {
                (Some(stored), Some(pending)) if stored.at > pending.at => Some(stored),
                (_, Some(pending)) => Some(pending.clone()),
                (stored, None) => stored,
            };
            match latest {
                Some(record) => state.observe(luminaire, record.on, record.at),
                None => state.set(luminaire, false),
            }
        }
        Ok(state)
    }

    fn recent_before(
        &self,
        luminaire: &str,
        before: Option<DateTime<Utc>>,
    ) -> Option<&LightTransitionRecord> {
        self.recent
            .iter()
            .filter(|record| record.luminaire == luminaire)
            .filter(|record| before.map(|before| record.at < before).unwrap_or(true))
            .max_by_key(|record| record.at)
    }

    fn remember(&mut self, transitions: &[LightTransitionRecord]) {
        for record in transitions {
            if self.recent.len() == RECENT_TRANSITIONS {
                self.recent.pop_front();
            }
            self.recent.push_back(record.clone());
        }
    }

    pub async fn process(
        &mut self,
        sample: &TelemetrySample,
    ) -> Result<Vec<LightTransitionRecord>, LightStateError> {
        let Some(memory) = self.memory.as_ref() else {
            return Ok(Vec::new());
        };
        let measured = self.measured_states(&sample.value)?;
        let at = sample.generation_time;

        let stale = memory.is_stale_for(at);
        let baseline = if stale {
            tracing::debug!(
                at = %at,
                as_of = ?memory.as_of(),
                "out-of-order light state; resyncing from history"
            );
            self.snapshot_before(Some(at)).await?
        } else {
            memory.clone()
        };

        let mut current = baseline.clone();
        let mut transitions = Vec::new();
        for (luminaire, on) in &measured {
            if baseline.get(luminaire) != *on {
                transitions.push(LightTransitionRecord {
                    luminaire: luminaire.clone(),
                    at,
                    on: *on,
                });
            }
            current.set(luminaire, *on);
        }

        if !transitions.is_empty() {
            if let Some(log) = &self.log {
                log.append(at, &current)?;
            }
        }

        self.remember(&transitions);
        let memory = self.memory.get_or_insert_with(LightState::default);
        if stale {
            // the cached snapshot is newer than this sample
            memory.advance(at);
        } else {
            current.advance(at);
            *memory = current;
        }
        Ok(transitions)
    }

    /// Parses `value.<luminaire>.measuredState` for every known luminaire present.
    fn measured_states(&self, value: &Value) -> Result<BTreeMap<String, bool>, LightStateError> {
        let lights = value.as_struct().ok_or(LightStateError::NotAStruct)?;
        let mut measured = BTreeMap::new();
        for luminaire in &self.luminaires {
            let Some(state) = lights.get(luminaire).and_then(|l| l.get("measuredState")) else {
                continue;
            };
            let on = match state {
                Value::Bool(on) => *on,
                Value::Text(text) if text.eq_ignore_ascii_case("ON") => true,
                Value::Text(text) if text.eq_ignore_ascii_case("OFF") => false,
                other => {
                    return Err(LightStateError::BadMeasuredState {
                        luminaire: luminaire.clone(),
                        state: format!("{other:?}"),
                    })
                }
            };
            measured.insert(luminaire.clone(), on);
        }
        Ok(measured)
    }
}
