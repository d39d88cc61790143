use crate::{
    data::{covariate::Covariates, event::*},
    error::PharmsimError,
    simulator::{Fa, Lag, V},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The main container for a simulated population.
///
/// [Data] is an ordered collection of [Subject]s. The order is stable and
/// determines each subject's position in the random-number stream, so a run
/// over the same data with the same seed is bit-reproducible.
///
/// # Examples
///
/// ```
/// use pharmsim::*;
///
/// let subject = Subject::builder("patient_001")
///     .bolus(0.0, 100.0, 0)
///     .observation(1.0, 0)
///     .build();
///
/// let mut data = Data::new(vec![subject]);
/// data.add_subject(Subject::builder("patient_002").bolus(0.0, 120.0, 0).build());
/// assert_eq!(data.len(), 2);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Data {
    subjects: Vec<Subject>,
}

impl Data {
    /// Constructs a new [Data] object from a vector of [Subject]s
    pub fn new(subjects: Vec<Subject>) -> Self {
        Data { subjects }
    }

    /// Get a vector of references to all subjects in the dataset
    pub fn subjects(&self) -> Vec<&Subject> {
        self.subjects.iter().collect()
    }

    /// Add a subject to the dataset
    pub fn add_subject(&mut self, subject: Subject) {
        self.subjects.push(subject);
    }

    /// Get a specific subject by ID
    pub fn get_subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id() == id)
    }

    /// Expand the dataset by adding observation requests on a regular grid.
    ///
    /// Useful for dense simulation output. Observations are only added where
    /// no request already exists for that time/outeq pair; the grid extends
    /// to the last scheduled event time plus `tad`.
    ///
    /// # Arguments
    ///
    /// * `idelta` - Time interval between added observations
    /// * `tad` - Additional time appended after the last event
    pub fn expand(&self, idelta: f64, tad: f64) -> Data {
        if idelta <= 0.0 {
            return self.clone();
        }

        let last_time = self
            .subjects
            .iter()
            .flat_map(|subject| &subject.events)
            .map(|event| match event {
                Event::Infusion(infusion) => infusion.time() + infusion.duration(),
                other => other.time(),
            })
            .max_by(|a, b| a.partial_cmp(b).unwrap())
            .unwrap_or(0.0)
            + tad;

        let outeqs = {
            let mut outeqs: Vec<usize> = self
                .subjects
                .iter()
                .flat_map(|subject| subject.output_equations())
                .collect();
            outeqs.sort_unstable();
            outeqs.dedup();
            if outeqs.is_empty() {
                outeqs.push(0);
            }
            outeqs
        };

        let new_subjects = self
            .subjects
            .iter()
            .map(|subject| {
                let existing: std::collections::HashSet<(u64, usize)> = subject
                    .events
                    .iter()
                    .filter_map(|event| match event {
                        Event::Observation(obs) => {
                            Some(((obs.time() * 1e6).round() as u64, obs.outeq()))
                        }
                        _ => None,
                    })
                    .collect();

                let mut events = subject.events.clone();
                let mut time = 0.0;
                while time < last_time {
                    let time_key = (time * 1e6).round() as u64;
                    for &outeq in &outeqs {
                        if !existing.contains(&(time_key, outeq)) {
                            events.push(Event::Observation(Observation::new(time, outeq)));
                        }
                    }
                    time += idelta;
                    time = (time * 1e6).round() / 1e6;
                }

                let mut expanded = Subject::new(subject.id.clone(), events, subject.covariates.clone());
                expanded.sort();
                expanded
            })
            .collect();

        Data::new(new_subjects)
    }

    /// Get an iterator over all subjects
    pub fn iter(&'_ self) -> std::slice::Iter<'_, Subject> {
        self.subjects.iter()
    }

    /// Get the number of subjects in the dataset
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl IntoIterator for Data {
    type Item = Subject;
    type IntoIter = std::vec::IntoIter<Subject>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.into_iter()
    }
}

impl<'a> IntoIterator for &'a Data {
    type Item = &'a Subject;
    type IntoIter = std::slice::Iter<'a, Subject>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}

impl From<Vec<Subject>> for Data {
    fn from(subjects: Vec<Subject>) -> Data {
        Data::new(subjects)
    }
}

impl From<Subject> for Data {
    fn from(subject: Subject) -> Data {
        Data::new(vec![subject])
    }
}

/// One individual on a simulated timeline.
///
/// A [Subject] owns its identifier, a time-ordered event schedule, and its
/// covariates. Repeat patterns (`addl`/`ii`) are expanded into concrete
/// events at construction time by the builder, never at runtime.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Subject {
    id: String,
    events: Vec<Event>,
    covariates: Covariates,
}

impl Subject {
    pub(crate) fn new(id: String, events: Vec<Event>, covariates: Covariates) -> Self {
        let mut subject = Subject {
            id,
            events,
            covariates,
        };
        subject.sort();
        subject
    }

    /// Get the ID of the subject
    pub fn id(&self) -> &String {
        &self.id
    }

    /// Get a vector of references to the subject's events in schedule order
    pub fn events(&self) -> Vec<&Event> {
        self.events.iter().collect()
    }

    /// Get a reference to the subject's covariates
    pub fn covariates(&self) -> &Covariates {
        &self.covariates
    }

    /// Get a mutable reference to the subject's covariates
    pub fn covariates_mut(&mut self) -> &mut Covariates {
        &mut self.covariates
    }

    /// Unique output equation indices requested by this subject
    pub fn output_equations(&self) -> Vec<usize> {
        let mut outeqs: Vec<usize> = self
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Observation(obs) => Some(obs.outeq()),
                _ => None,
            })
            .collect();
        outeqs.sort_unstable();
        outeqs.dedup();
        outeqs
    }

    /// All infusions on the schedule, used both for rate forcing and for
    /// breaking integration at infusion boundaries
    pub(crate) fn infusions(&self) -> Vec<Infusion> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Infusion(infusion) => Some(infusion.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sort events by time, tie-broken by the fixed precedence
    /// Reset < Protocol < Bolus < Infusion < Observation.
    pub(crate) fn sort(&mut self) {
        self.events.sort_by(|a, b| {
            match a.time().partial_cmp(&b.time()) {
                Some(std::cmp::Ordering::Equal) => a.precedence().cmp(&b.precedence()),
                Some(ordering) => ordering,
                // NaN times are rejected by validation before simulation
                None => std::cmp::Ordering::Equal,
            }
        });
    }

    /// Process the schedule for one realized parameter vector: shift boluses
    /// by the model's absorption lag, scale amounts by bioavailability, and
    /// re-sort. The nominal schedule is left untouched.
    pub(crate) fn process_events(
        &self,
        lag: Option<(&Lag, &V, &Covariates)>,
        fa: Option<(&Fa, &V, &Covariates)>,
    ) -> Vec<Event> {
        let mut events = self.events.clone();

        if let Some((fn_lag, spp, covariates)) = lag {
            for event in events.iter_mut() {
                let time = event.time();
                if let Event::Bolus(bolus) = event {
                    let lagtime = fn_lag(spp, time, covariates);
                    if let Some(l) = lagtime.get(&bolus.input()) {
                        *bolus.mut_time() += l;
                    }
                }
            }
        }

        if let Some((fn_fa, spp, covariates)) = fa {
            for event in events.iter_mut() {
                let time = event.time();
                if let Event::Bolus(bolus) = event {
                    let fraction = fn_fa(spp, time, covariates);
                    if let Some(f) = fraction.get(&bolus.input()) {
                        bolus.set_amount(bolus.amount() * f);
                    }
                }
            }
        }

        events.sort_by(|a, b| match a.time().partial_cmp(&b.time()) {
            Some(std::cmp::Ordering::Equal) => a.precedence().cmp(&b.precedence()),
            Some(ordering) => ordering,
            None => std::cmp::Ordering::Equal,
        });
        events
    }

    /// Validate the nominal schedule against the model dimensions.
    ///
    /// Negative times and non-positive infusion durations are configuration
    /// errors; doses or resets into compartments outside `nstates` are model
    /// errors. Both abort the whole run.
    pub(crate) fn validate(
        &self,
        nstates: usize,
        nouteqs: usize,
        nprotocols: usize,
    ) -> Result<(), PharmsimError> {
        for event in &self.events {
            let time = event.time();
            if time.is_nan() || time < 0.0 {
                return Err(PharmsimError::NegativeEventTime {
                    id: self.id.clone(),
                    time,
                });
            }
            match event {
                Event::Bolus(bolus) if bolus.input() >= nstates => {
                    return Err(PharmsimError::UndeclaredCompartment {
                        input: bolus.input(),
                        nstates,
                    });
                }
                Event::Infusion(infusion) => {
                    if infusion.duration() <= 0.0 {
                        return Err(PharmsimError::InvalidInfusionDuration {
                            id: self.id.clone(),
                            time: infusion.time(),
                            duration: infusion.duration(),
                        });
                    }
                    if infusion.input() >= nstates {
                        return Err(PharmsimError::UndeclaredCompartment {
                            input: infusion.input(),
                            nstates,
                        });
                    }
                }
                Event::Reset(reset) => {
                    if let Some(cmts) = reset.compartments() {
                        if let Some(&bad) = cmts.iter().find(|&&cmt| cmt >= nstates) {
                            return Err(PharmsimError::UndeclaredCompartment {
                                input: bad,
                                nstates,
                            });
                        }
                    }
                }
                Event::Protocol(protocol) if protocol.action() >= nprotocols => {
                    return Err(PharmsimError::UndeclaredProtocol {
                        action: protocol.action(),
                    });
                }
                Event::Observation(obs) if obs.outeq() >= nouteqs => {
                    return Err(PharmsimError::UndeclaredOuteq {
                        outeq: obs.outeq(),
                        nouteqs,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Data Overview: {} subjects", self.subjects.len())?;
        for subject in &self.subjects {
            writeln!(f, "{}", subject)?;
        }
        Ok(())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Subject ID: {}", self.id)?;
        for event in &self.events {
            writeln!(f, "  {}", event)?;
        }
        if !self.covariates.is_empty() {
            writeln!(f, "  {}", self.covariates)?;
        }
        Ok(())
    }
}
