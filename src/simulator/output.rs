//! Simulation output: one row per observation, collected per subject and per
//! population.

use serde::{Deserialize, Serialize};

/// One observation record.
///
/// Beyond the requested output value, each row carries the full state
/// snapshot and the stochastic-process bookkeeping at that time, so survival
/// curves, occupancy traces, and event tallies come out of the same table as
/// the concentrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Observation time
    pub time: f64,
    /// Requested output equation
    pub outeq: usize,
    /// Value of that output equation
    pub value: f64,
    /// State vector at this time
    pub state: Vec<f64>,
    /// Survival probability per declared hazard process
    pub survival: Vec<f64>,
    /// Occupied discrete state, if a multistate process is declared
    pub occupancy: Option<usize>,
    /// Accumulated count per declared counting process
    pub counts: Vec<u64>,
}

/// How one subject's simulation ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Status {
    /// The full schedule was processed
    Completed,
    /// A terminal hazard fired or a terminal discrete state was entered
    Terminated { time: f64, process: String },
    /// A numerical failure local to this subject
    Failed { time: f64, reason: String },
    /// The run was cancelled while this subject was in flight
    Cancelled { time: f64 },
}

/// The complete output for one subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectResult {
    id: String,
    status: Status,
    etas: Vec<f64>,
    frailties: Vec<f64>,
    parameters: Vec<f64>,
    rows: Vec<Row>,
}

impl SubjectResult {
    pub(crate) fn new(
        id: String,
        status: Status,
        etas: Vec<f64>,
        frailties: Vec<f64>,
        parameters: Vec<f64>,
        rows: Vec<Row>,
    ) -> Self {
        SubjectResult {
            id,
            status,
            etas,
            frailties,
            parameters,
            rows,
        }
    }

    /// A result recording a recoverable per-subject failure
    pub(crate) fn failed(id: String, time: f64, reason: String) -> Self {
        SubjectResult {
            id,
            status: Status::Failed { time, reason },
            etas: Vec::new(),
            frailties: Vec::new(),
            parameters: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The realized eta vector for this subject
    pub fn etas(&self) -> &[f64] {
        &self.etas
    }

    /// The realized frailty values for this subject
    pub fn frailties(&self) -> &[f64] {
        &self.frailties
    }

    /// The individual parameter vector derived from the draws
    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// (time, value) pairs for one output equation
    pub fn observations(&self, outeq: usize) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter(|row| row.outeq == outeq)
            .map(|row| (row.time, row.value))
            .collect()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, Status::Failed { .. })
    }
}

/// The output of a population run, in dataset order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationResult {
    seed: u64,
    subjects: Vec<SubjectResult>,
}

impl PopulationResult {
    pub(crate) fn new(subjects: Vec<SubjectResult>, seed: u64) -> Self {
        PopulationResult { seed, subjects }
    }

    /// The master seed the run was performed with
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn subjects(&self) -> &[SubjectResult] {
        &self.subjects
    }

    pub fn get(&self, id: &str) -> Option<&SubjectResult> {
        self.subjects.iter().find(|subject| subject.id() == id)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Number of subjects that processed their full schedule
    pub fn completed(&self) -> usize {
        self.subjects
            .iter()
            .filter(|subject| *subject.status() == Status::Completed)
            .count()
    }

    /// Number of subjects that failed numerically
    pub fn failed(&self) -> usize {
        self.subjects.iter().filter(|s| s.is_failed()).count()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SubjectResult> {
        self.subjects.iter()
    }
}

impl<'a> IntoIterator for &'a PopulationResult {
    type Item = &'a SubjectResult;
    type IntoIter = std::slice::Iter<'a, SubjectResult>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}
