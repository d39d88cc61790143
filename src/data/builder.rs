use crate::data::*;

/// Extension trait providing `Subject::builder`
pub trait SubjectBuilderExt {
    fn builder(id: impl Into<String>) -> SubjectBuilder;
}

impl SubjectBuilderExt for Subject {
    /// Start building a subject with the given identifier
    fn builder(id: impl Into<String>) -> SubjectBuilder {
        SubjectBuilder {
            id: id.into(),
            events: Vec::new(),
            covariates: Covariates::new(),
        }
    }
}

/// Fluent builder for [Subject]s.
///
/// Repeat patterns expand into concrete events here, at schedule
/// construction, so the runtime sees a fully materialized timeline.
///
/// # Examples
///
/// ```
/// use pharmsim::*;
///
/// let subject = Subject::builder("patient_001")
///     .bolus(0.0, 100.0, 0)
///     .repeat(3, 12.0)                // three additional doses, 12 h apart
///     .observation_grid(0.0, 48.0, 1.0, 0)
///     .covariate("weight", 0.0, 70.0)
///     .build();
/// ```
pub struct SubjectBuilder {
    id: String,
    events: Vec<Event>,
    covariates: Covariates,
}

impl SubjectBuilder {
    /// Add a prebuilt event
    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    /// Add a bolus dose
    ///
    /// # Arguments
    ///
    /// * `time` - Nominal dose time
    /// * `amount` - Amount administered
    /// * `input` - Receiving compartment (zero-indexed)
    pub fn bolus(self, time: f64, amount: f64, input: usize) -> Self {
        self.event(Event::Bolus(Bolus::new(time, amount, input)))
    }

    /// Add a constant-rate infusion
    ///
    /// # Arguments
    ///
    /// * `time` - Start time
    /// * `amount` - Total amount administered
    /// * `input` - Receiving compartment (zero-indexed)
    /// * `duration` - Infusion length in time units
    pub fn infusion(self, time: f64, amount: f64, input: usize, duration: f64) -> Self {
        self.event(Event::Infusion(Infusion::new(time, amount, input, duration)))
    }

    /// Add an observation request for one output equation
    pub fn observation(self, time: f64, outeq: usize) -> Self {
        self.event(Event::Observation(Observation::new(time, outeq)))
    }

    /// Add observation requests on a regular grid over `[start, stop]`
    pub fn observation_grid(mut self, start: f64, stop: f64, step: f64, outeq: usize) -> Self {
        assert!(step > 0.0, "observation grid step must be positive");
        let mut time = start;
        while time <= stop + step * 1e-9 {
            self = self.observation((time * 1e9).round() / 1e9, outeq);
            time += step;
        }
        self
    }

    /// Add a reset event zeroing all compartments
    pub fn reset(self, time: f64) -> Self {
        self.event(Event::Reset(Reset::new(time, None)))
    }

    /// Add a reset event zeroing specific compartments
    pub fn reset_compartments(self, time: f64, compartments: Vec<usize>) -> Self {
        self.event(Event::Reset(Reset::new(time, Some(compartments))))
    }

    /// Add a protocol trigger invoking the model's registered callback
    pub fn protocol(self, time: f64, action: usize) -> Self {
        self.event(Event::Protocol(Protocol::new(time, action)))
    }

    /// Repeat the most recent event `n` additional times, `delta` apart.
    ///
    /// This is the `addl`/`ii` pattern: the expansion happens here, at
    /// schedule construction.
    pub fn repeat(mut self, n: usize, delta: f64) -> Self {
        let last_event = match self.events.last() {
            Some(event) => event.clone(),
            None => panic!("there is no event to repeat"),
        };
        for i in 1..=n {
            let mut event = last_event.clone();
            event.inc_time(delta * i as f64);
            self = self.event(event);
        }
        self
    }

    /// Add a covariate observation at a time point
    pub fn covariate(mut self, name: &str, time: f64, value: f64) -> Self {
        self.covariates.add_observation(name, time, value);
        self
    }

    /// Mark a covariate as fixed (carry-forward interpolation)
    pub fn fixed_covariate(mut self, name: &str) -> Self {
        self.covariates.set_covariate_fixed(name, true);
        self
    }

    /// Finish building; events are sorted by time and precedence
    pub fn build(self) -> Subject {
        Subject::new(self.id, self.events, self.covariates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builder() {
        let subject = Subject::builder("test")
            .bolus(0.0, 100.0, 0)
            .repeat(3, 12.0)
            .observation(1.0, 0)
            .infusion(48.0, 100.0, 0, 1.0)
            .build();

        assert_eq!(subject.id(), "test");
        // 4 boluses + 1 observation + 1 infusion
        assert_eq!(subject.events().len(), 6);

        let bolus_times: Vec<f64> = subject
            .events()
            .iter()
            .filter_map(|event| match event {
                Event::Bolus(bolus) => Some(bolus.time()),
                _ => None,
            })
            .collect();
        assert_eq!(bolus_times, vec![0.0, 12.0, 24.0, 36.0]);
    }

    #[test]
    fn test_observation_grid() {
        let subject = Subject::builder("grid")
            .observation_grid(0.0, 2.0, 0.5, 0)
            .build();
        assert_eq!(subject.events().len(), 5);
    }

    #[test]
    fn test_covariates_attach_to_subject() {
        let subject = Subject::builder("cov")
            .covariate("weight", 0.0, 70.0)
            .covariate("weight", 24.0, 72.0)
            .build();
        let weight = subject.covariates().get_covariate("weight").unwrap();
        assert_eq!(weight.interpolate(12.0), Some(71.0));
    }

    #[test]
    #[should_panic(expected = "there is no event to repeat")]
    fn test_repeat_without_event_panics() {
        let _ = Subject::builder("empty").repeat(2, 1.0);
    }
}
