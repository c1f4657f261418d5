mod dataset;

pub use dataset::{parse_cell, ReplayDataset, ReplayRow, BLOBS_DIR, EVENTS_FILE};

use crate::error::ReplayError;
use crate::source::MockContext;
use crate::telemetry::{TelemetrySample, Value};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Table order, each row once.
    #[default]
    Sequential,
    /// Shuffled once, each row once.
    NoReplacement,
    /// Uniformly random on every call; rows may repeat.
    Replacement,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Sequential => "sequential",
            SelectionMode::NoReplacement => "no_replacement",
            SelectionMode::Replacement => "replacement",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = ReplayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(SelectionMode::Sequential),
            "no_replacement" => Ok(SelectionMode::NoReplacement),
            "replacement" => Ok(SelectionMode::Replacement),
            _ => Err(ReplayError::UnknownMode(raw.to_string())),
        }
    }
}

/// Serves recorded samples as if they were arriving from the rover.
pub struct ReplaySimulator {
    dataset: ReplayDataset,
    mode: SelectionMode,
    rng: StdRng,
    parameters: Option<BTreeSet<String>>,
    /// Remaining row indices; the next row to serve is at the end.
    pool: Vec<usize>,
    served: Vec<usize>,
}

impl ReplaySimulator {
    pub fn new(dataset: ReplayDataset, mode: SelectionMode, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut simulator = Self {
            dataset,
            mode,
            rng,
            parameters: None,
            pool: Vec::new(),
            served: Vec::new(),
        };
        simulator.reset_pool();
        simulator
    }

    /// Restricts pickable rows to `names` (`None` = every row) and refills the pool.
    pub fn set_parameters<I, S>(&mut self, names: Option<I>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = names.map(|names| names.into_iter().map(Into::into).collect());
        self.reset_pool();
    }

    fn is_selected(&self, row: &ReplayRow) -> bool {
        self.parameters
            .as_ref()
            .map(|names| names.contains(&row.name))
            .unwrap_or(true)
    }

    fn reset_pool(&mut self) {
        let mut pool: Vec<usize> = self
            .dataset
            .rows()
            .filter(|row| self.is_selected(row))
            .map(|row| row.index)
            .collect();
        match self.mode {
            SelectionMode::Sequential => pool.reverse(),
            SelectionMode::NoReplacement => pool.shuffle(&mut self.rng),
            SelectionMode::Replacement => {}
        }
        self.pool = pool;
    }

    /// Rows left to serve. Always the full selection under `Replacement`.
    pub fn remaining(&self) -> usize {
        self.pool.len()
    }

    /// Row indices served so far, in order.
    pub fn served(&self) -> &[usize] {
        &self.served
    }

    /// Chooses the row to serve without consuming it.
    fn pick(&mut self, row_index: Option<usize>) -> Result<usize, ReplayError> {
        if let Some(index) = row_index {
            let pickable = self
                .dataset
                .row(index)
                .map(|row| self.is_selected(row))
                .unwrap_or(false);
            return if pickable {
                Ok(index)
            } else {
                Err(ReplayError::NotPickable(index))
            };
        }
        match self.mode {
            SelectionMode::Sequential | SelectionMode::NoReplacement => {
                self.pool.last().copied().ok_or(ReplayError::OutOfEvents)
            }
            SelectionMode::Replacement => {
                if self.pool.is_empty() {
                    return Err(ReplayError::OutOfEvents);
                }
                let slot = self.rng.gen_range(0..self.pool.len());
                Ok(self.pool[slot])
            }
        }
    }

    /// Serves the row at `row_index`, or the next row under the selection
    /// mode. An explicit index does not consume the pool.
    ///
    /// A row whose sample fails to build stays next in line; call
    /// [`skip`](Self::skip) to move past it.
    pub fn serve_one(
        &mut self,
        row_index: Option<usize>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<TelemetrySample, ReplayError> {
        let index = self.pick(row_index)?;
        let row = self
            .dataset
            .row(index)
            .ok_or(ReplayError::NotPickable(index))?;
        let sample = self.dataset.build_sample(row, overrides)?;
        if row_index.is_none() && self.mode != SelectionMode::Replacement {
            self.pool.pop();
        }
        self.served.push(index);
        Ok(sample)
    }

    /// Drops the next pending row without serving it. Returns its index, or
    /// `None` when nothing is left or rows are drawn with replacement.
    pub fn skip(&mut self) -> Option<usize> {
        match self.mode {
            SelectionMode::Sequential | SelectionMode::NoReplacement => self.pool.pop(),
            SelectionMode::Replacement => None,
        }
    }

    /// Serves one sample into a mock feed and returns a copy of it.
    pub fn serve_to(
        &mut self,
        ctx: &MockContext,
        row_index: Option<usize>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<TelemetrySample, ReplayError> {
        let sample = self.serve_one(row_index, overrides)?;
        ctx.add_event(sample.clone());
        Ok(sample)
    }

    /// Rows named in `names` with `start <= generation_time < stop`, in
    /// table order. Ignores the selection pool.
    pub fn get_range<'a>(
        &'a self,
        names: &'a BTreeSet<String>,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = Result<TelemetrySample, ReplayError>> + 'a {
        let empty = BTreeMap::new();
        self.dataset
            .rows()
            .filter(move |row| names.contains(&row.name))
            .filter(move |row| start.map(|start| row.generation_time >= start).unwrap_or(true))
            .filter(move |row| stop.map(|stop| row.generation_time < stop).unwrap_or(true))
            .map(move |row| self.dataset.build_sample(row, &empty))
    }
}
