use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Last known on/off state per luminaire and the newest sample time it reflects.
///
/// A sample generated before `as_of` is stale: comparing it against this
/// snapshot would attribute later changes to it, so the tracker rebuilds the
/// comparison state from history instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightState {
    per_luminaire: BTreeMap<String, bool>,
    as_of: Option<DateTime<Utc>>,
}

impl LightState {
    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    /// Unknown luminaires read as off.
    pub fn get(&self, luminaire: &str) -> bool {
        self.per_luminaire.get(luminaire).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &bool)> {
        self.per_luminaire.iter()
    }

    pub fn is_stale_for(&self, at: DateTime<Utc>) -> bool {
        self.as_of.map(|as_of| at < as_of).unwrap_or(false)
    }

    pub(super) fn set(&mut self, luminaire: &str, on: bool) {
        self.per_luminaire.insert(luminaire.to_string(), on);
    }

    pub(super) fn observe(&mut self, luminaire: &str, on: bool, at: DateTime<Utc>) {
        self.set(luminaire, on);
        self.advance(at);
    }

    /// Never moves `as_of` backwards.
    pub(super) fn advance(&mut self, at: DateTime<Utc>) {
        if self.as_of.map(|prev| at > prev).unwrap_or(true) {
            self.as_of = Some(at);
        }
    }
}
