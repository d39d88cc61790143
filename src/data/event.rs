use std::fmt;

use serde::{Deserialize, Serialize};

/// A discrete event on one subject's timeline.
///
/// Events interrupt the continuous ODE integration:
/// - [Reset] zeroes designated compartments (protocol reset)
/// - [Protocol] invokes a registered model callback (e.g. dose adjustment)
/// - [Bolus] adds an instantaneous amount to a compartment
/// - [Infusion] provides a constant input rate over a duration
/// - [Observation] requests a captured output record
///
/// Events are totally ordered by time. Ties are broken by a fixed precedence,
/// Reset < Protocol < Bolus < Infusion < Observation, so a dose scheduled at
/// the simulation start is applied before the first record at the same time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Event {
    /// Zero designated compartments (or all of them)
    Reset(Reset),
    /// Invoke a registered protocol callback
    Protocol(Protocol),
    /// An instantaneous dose into a compartment
    Bolus(Bolus),
    /// A constant-rate dose over a duration
    Infusion(Infusion),
    /// A capture request at a point in time
    Observation(Observation),
}

impl Event {
    /// Get the scheduled time of the event
    pub fn time(&self) -> f64 {
        match self {
            Event::Reset(reset) => reset.time,
            Event::Protocol(protocol) => protocol.time,
            Event::Bolus(bolus) => bolus.time,
            Event::Infusion(infusion) => infusion.time,
            Event::Observation(observation) => observation.time,
        }
    }

    /// Shift the event time by a delta
    pub(crate) fn inc_time(&mut self, dt: f64) {
        match self {
            Event::Reset(reset) => reset.time += dt,
            Event::Protocol(protocol) => protocol.time += dt,
            Event::Bolus(bolus) => bolus.time += dt,
            Event::Infusion(infusion) => infusion.time += dt,
            Event::Observation(observation) => observation.time += dt,
        }
    }

    /// Tie-break precedence for events at the same time
    #[inline]
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            Event::Reset(_) => 0,
            Event::Protocol(_) => 1,
            Event::Bolus(_) => 2,
            Event::Infusion(_) => 3,
            Event::Observation(_) => 4,
        }
    }
}

/// An instantaneous dose.
///
/// The amount is added to the target compartment at the event time, scaled by
/// the model's bioavailability fraction and shifted by its absorption lag at
/// schedule-processing time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bolus {
    time: f64,
    amount: f64,
    input: usize,
}

impl Bolus {
    /// Create a new bolus event
    ///
    /// # Arguments
    ///
    /// * `time` - Nominal time of the dose
    /// * `amount` - Amount administered
    /// * `input` - Receiving compartment (zero-indexed)
    pub(crate) fn new(time: f64, amount: f64, input: usize) -> Self {
        Bolus {
            time,
            amount,
            input,
        }
    }

    /// Get the dose amount
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the receiving compartment (zero-indexed)
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the time of administration
    pub fn time(&self) -> f64 {
        self.time
    }

    pub(crate) fn mut_time(&mut self) -> &mut f64 {
        &mut self.time
    }

    /// Set the dose amount
    pub fn set_amount(&mut self, amount: f64) {
        self.amount = amount;
    }
}

/// A constant-rate dose over a duration.
///
/// The infusion provides `amount / duration` per unit time into the target
/// compartment over `[time, time + duration)`. The start and the end of the
/// infusion both act as integration breakpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Infusion {
    time: f64,
    amount: f64,
    input: usize,
    duration: f64,
}

impl Infusion {
    /// Create a new infusion event
    ///
    /// # Arguments
    ///
    /// * `time` - Start time of the infusion
    /// * `amount` - Total amount administered over the infusion
    /// * `input` - Receiving compartment (zero-indexed)
    /// * `duration` - Length of the infusion in time units
    pub(crate) fn new(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Infusion {
            time,
            amount,
            input,
            duration,
        }
    }

    /// Get the total amount administered over the infusion
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the receiving compartment (zero-indexed)
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the infusion duration
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Get the start time; the infusion runs until `time + duration`
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Constant input rate while the infusion is active
    pub fn rate(&self) -> f64 {
        self.amount / self.duration
    }

    /// Whether the infusion is running at time `t` (half-open window)
    #[inline]
    pub fn active_at(&self, t: f64) -> bool {
        t >= self.time && t < self.time + self.duration
    }
}

/// A protocol reset event zeroing designated compartments.
///
/// `compartments: None` zeroes every state, including any cumulative hazard
/// accumulators.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reset {
    time: f64,
    compartments: Option<Vec<usize>>,
}

impl Reset {
    pub(crate) fn new(time: f64, compartments: Option<Vec<usize>>) -> Self {
        Reset { time, compartments }
    }

    /// Get the time of the reset
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Compartments to zero; `None` means all states
    pub fn compartments(&self) -> Option<&[usize]> {
        self.compartments.as_deref()
    }
}

/// A custom trigger invoking a registered model callback.
///
/// The callback may mutate the state vector and the individual's parameter
/// vector; dose-adjustment protocols are expressed this way so parameter
/// mutation is itself an event on the timeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Protocol {
    time: f64,
    action: usize,
}

impl Protocol {
    pub(crate) fn new(time: f64, action: usize) -> Self {
        Protocol { time, action }
    }

    /// Get the time of the trigger
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Index of the registered callback to invoke
    pub fn action(&self) -> usize {
        self.action
    }
}

/// A capture request: evaluate the output equations and append a record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Observation {
    time: f64,
    outeq: usize,
}

impl Observation {
    /// Create a new observation request
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the observation
    /// * `outeq` - Output equation number (zero-indexed) to record
    pub(crate) fn new(time: f64, outeq: usize) -> Self {
        Observation { time, outeq }
    }

    /// Get the time of the observation
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Get the output equation number (zero-indexed)
    pub fn outeq(&self) -> usize {
        self.outeq
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Reset(reset) => match reset.compartments() {
                Some(cmts) => write!(f, "Reset at time {:.2} of compartments {:?}", reset.time, cmts),
                None => write!(f, "Reset at time {:.2} of all compartments", reset.time),
            },
            Event::Protocol(protocol) => write!(
                f,
                "Protocol trigger at time {:.2} (action {})",
                protocol.time, protocol.action
            ),
            Event::Bolus(bolus) => write!(
                f,
                "Bolus at time {:.2} with amount {:.2} in compartment {}",
                bolus.time, bolus.amount, bolus.input
            ),
            Event::Infusion(infusion) => write!(
                f,
                "Infusion starting at {:.2} with amount {:.2} over {:.2} in compartment {}",
                infusion.time, infusion.amount, infusion.duration, infusion.input
            ),
            Event::Observation(observation) => write!(
                f,
                "Observation at time {:.2} (outeq {})",
                observation.time, observation.outeq
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bolus_creation() {
        let bolus = Bolus::new(2.5, 100.0, 1);
        assert_eq!(bolus.time(), 2.5);
        assert_eq!(bolus.amount(), 100.0);
        assert_eq!(bolus.input(), 1);
    }

    #[test]
    fn test_infusion_window() {
        let infusion = Infusion::new(1.0, 200.0, 0, 2.0);
        assert_eq!(infusion.rate(), 100.0);
        assert!(!infusion.active_at(0.5));
        assert!(infusion.active_at(1.0));
        assert!(infusion.active_at(2.9));
        // half-open window: the end time no longer contributes
        assert!(!infusion.active_at(3.0));
    }

    #[test]
    fn test_event_precedence() {
        let reset = Event::Reset(Reset::new(0.0, None));
        let protocol = Event::Protocol(Protocol::new(0.0, 0));
        let bolus = Event::Bolus(Bolus::new(0.0, 100.0, 0));
        let infusion = Event::Infusion(Infusion::new(0.0, 100.0, 0, 1.0));
        let observation = Event::Observation(Observation::new(0.0, 0));

        assert!(reset.precedence() < protocol.precedence());
        assert!(protocol.precedence() < bolus.precedence());
        assert!(bolus.precedence() < infusion.precedence());
        assert!(infusion.precedence() < observation.precedence());
    }

    #[test]
    fn test_event_time_operations() {
        let mut bolus_event = Event::Bolus(Bolus::new(1.0, 100.0, 1));
        let mut observation_event = Event::Observation(Observation::new(3.0, 0));

        assert_eq!(bolus_event.time(), 1.0);
        assert_eq!(observation_event.time(), 3.0);

        bolus_event.inc_time(0.5);
        observation_event.inc_time(0.5);

        assert_eq!(bolus_event.time(), 1.5);
        assert_eq!(observation_event.time(), 3.5);
    }
}
