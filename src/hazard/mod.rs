//! Hazard-driven stochastic events layered on top of the deterministic
//! system.
//!
//! A hazard process reads its cumulative hazard from a declared state of the
//! model, so the intensity is just another differential equation and
//! integrates with the same accuracy as the kinetics. Event timing compares
//! the cumulative hazard against an exponential threshold; counting processes
//! tally recurrent events interval by interval.

pub mod multistate;

use crate::error::PharmsimError;
use rand::Rng;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

/// Weibull intensity `lambda * gamma * t^(gamma - 1)`, with the time offset
/// away from zero so shape parameters below one never evaluate an illegal
/// power at the start of the timeline.
pub fn weibull_intensity(lambda: f64, gamma: f64, t: f64) -> f64 {
    let t = t.max(1e-12);
    lambda * gamma * t.powf(gamma - 1.0)
}

/// How the firing threshold is drawn for a hazard process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdPolicy {
    /// Draw one Exp(1) threshold per individual (per arming); the event fires
    /// when the cumulative hazard crosses it. This is exact inverse-transform
    /// sampling of the event time up to the evaluation grid.
    DrawOnce,
    /// Draw a fresh uniform each evaluation interval and fire with
    /// probability `1 - exp(-dH)`. Consumes more of the random stream but
    /// matches discrete-interval implementations.
    PerInterval,
}

/// Declaration of a hazard-driven event process.
///
/// `cmt` names the state holding the cumulative hazard; the model's
/// differential equations must integrate the intensity into that state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HazardProcess {
    name: String,
    cmt: usize,
    terminal: bool,
    recurrent: bool,
    policy: ThresholdPolicy,
}

impl HazardProcess {
    /// Declare a hazard process reading cumulative hazard from state `cmt`
    pub fn new(name: impl Into<String>, cmt: usize) -> Self {
        HazardProcess {
            name: name.into(),
            cmt,
            terminal: false,
            recurrent: false,
            policy: ThresholdPolicy::DrawOnce,
        }
    }

    /// Mark the process terminal; firing stops the individual's simulation
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Mark the process recurrent; after firing the hazard state is zeroed
    /// and the threshold redrawn
    pub fn recurrent(mut self) -> Self {
        self.recurrent = true;
        self
    }

    /// Override the threshold policy
    pub fn with_policy(mut self, policy: ThresholdPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State index holding the cumulative hazard
    pub fn cmt(&self) -> usize {
        self.cmt
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_recurrent(&self) -> bool {
        self.recurrent
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    /// Check the declared state index against the model dimension
    pub fn validate(&self, nstates: usize) -> Result<(), PharmsimError> {
        if self.cmt >= nstates {
            return Err(PharmsimError::UndeclaredHazardCompartment {
                name: self.name.clone(),
                cmt: self.cmt,
                nstates,
            });
        }
        Ok(())
    }
}

/// Runtime state of one hazard process for one individual
#[derive(Debug, Clone)]
pub struct HazardMonitor {
    threshold: f64,
    fired_at: Option<f64>,
    fires: u64,
    last_cumhaz: f64,
}

fn draw_threshold<R: Rng>(rng: &mut R) -> f64 {
    // 1 - U maps [0,1) onto (0,1], keeping the log finite
    -(1.0 - rng.random::<f64>()).ln()
}

impl HazardMonitor {
    /// Arm a monitor, drawing the initial threshold if the policy needs one
    pub fn new<R: Rng>(process: &HazardProcess, rng: &mut R) -> Self {
        let threshold = match process.policy() {
            ThresholdPolicy::DrawOnce => draw_threshold(rng),
            ThresholdPolicy::PerInterval => f64::INFINITY,
        };
        HazardMonitor {
            threshold,
            fired_at: None,
            fires: 0,
            last_cumhaz: 0.0,
        }
    }

    /// Survival probability implied by the cumulative hazard
    pub fn survival(&self, cumhaz: f64) -> f64 {
        (-cumhaz).exp()
    }

    /// Advance the monitor over the interval ending at `time` with the
    /// cumulative hazard now at `cumhaz`. Returns true if the event fired in
    /// this interval.
    ///
    /// A recurrent process rearms itself here; the caller is responsible for
    /// zeroing the hazard state and calling [HazardMonitor::resync].
    pub fn check<R: Rng>(
        &mut self,
        process: &HazardProcess,
        cumhaz: f64,
        time: f64,
        rng: &mut R,
    ) -> bool {
        if self.fired_at.is_some() && !process.is_recurrent() {
            self.last_cumhaz = cumhaz;
            return false;
        }
        let delta = (cumhaz - self.last_cumhaz).max(0.0);
        let fired = match process.policy() {
            ThresholdPolicy::DrawOnce => cumhaz >= self.threshold,
            ThresholdPolicy::PerInterval => {
                delta > 0.0 && rng.random::<f64>() < 1.0 - (-delta).exp()
            }
        };
        self.last_cumhaz = cumhaz;
        if fired {
            self.fired_at = Some(time);
            self.fires += 1;
            if process.is_recurrent() && process.policy() == ThresholdPolicy::DrawOnce {
                self.threshold = draw_threshold(rng);
            }
        }
        fired
    }

    /// Re-anchor the interval bookkeeping after the hazard state changed
    /// outside of integration (reset events, recurrent rearming)
    pub fn resync(&mut self, cumhaz: f64) {
        self.last_cumhaz = cumhaz;
    }

    /// Time of the most recent firing, if any
    pub fn fired_at(&self) -> Option<f64> {
        self.fired_at
    }

    /// Total number of firings so far
    pub fn fires(&self) -> u64 {
        self.fires
    }
}

/// Size of each jump of a counting process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Magnitude {
    /// Every accepted event counts one
    Unit,
    /// Each accepted event draws its count from Poisson(mean)
    Poisson { mean: f64 },
}

/// Declaration of a counting process driven by a cumulative-intensity state.
///
/// Unlike [HazardProcess], firing never interrupts the simulation; the tally
/// simply accumulates and is reported alongside the observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountingProcess {
    name: String,
    cmt: usize,
    magnitude: Magnitude,
}

impl CountingProcess {
    /// Declare a counting process reading cumulative intensity from `cmt`
    pub fn new(name: impl Into<String>, cmt: usize) -> Self {
        CountingProcess {
            name: name.into(),
            cmt,
            magnitude: Magnitude::Unit,
        }
    }

    /// Override the per-event magnitude
    pub fn with_magnitude(mut self, magnitude: Magnitude) -> Self {
        self.magnitude = magnitude;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State index holding the cumulative intensity
    pub fn cmt(&self) -> usize {
        self.cmt
    }

    /// Check the declared state index against the model dimension
    pub fn validate(&self, nstates: usize) -> Result<(), PharmsimError> {
        if self.cmt >= nstates {
            return Err(PharmsimError::UndeclaredHazardCompartment {
                name: self.name.clone(),
                cmt: self.cmt,
                nstates,
            });
        }
        Ok(())
    }
}

/// Runtime tally of one counting process for one individual
#[derive(Debug, Clone, Default)]
pub struct CountingTally {
    count: u64,
    last_cumhaz: f64,
}

impl CountingTally {
    pub fn new() -> Self {
        CountingTally::default()
    }

    /// Advance the tally over the interval with cumulative intensity now at
    /// `cumhaz`. Returns the increment added in this interval.
    ///
    /// The draw order within an interval is fixed: one uniform mapped to an
    /// Exp(1) waiting time, accepted if it fits inside the interval's
    /// intensity increment, then the magnitude draw only for accepted
    /// events. Intervals with zero increment consume nothing from the
    /// stream, so refining the observation grid over dead time does not
    /// shift downstream draws.
    pub fn step<R: Rng>(
        &mut self,
        process: &CountingProcess,
        cumhaz: f64,
        rng: &mut R,
    ) -> Result<u64, PharmsimError> {
        let delta = (cumhaz - self.last_cumhaz).max(0.0);
        self.last_cumhaz = cumhaz;
        if delta <= 0.0 {
            return Ok(0);
        }
        let wait = -(1.0 - rng.random::<f64>()).ln();
        if wait > delta {
            return Ok(0);
        }
        let increment = match process.magnitude {
            Magnitude::Unit => 1,
            Magnitude::Poisson { mean } => {
                let dist = rand_distr::Poisson::new(mean).map_err(|e| {
                    PharmsimError::InvalidDistribution {
                        name: process.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                dist.sample(rng) as u64
            }
        };
        self.count += increment;
        Ok(increment)
    }

    /// Re-anchor after the intensity state changed outside of integration
    pub fn resync(&mut self, cumhaz: f64) {
        self.last_cumhaz = cumhaz;
    }

    /// Accumulated count
    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_weibull_intensity_is_finite_at_zero() {
        // decreasing hazard (gamma < 1) diverges at t=0 without the guard
        let at_zero = weibull_intensity(0.1, 0.5, 0.0);
        assert!(at_zero.is_finite());
        assert_relative_eq!(weibull_intensity(0.1, 1.0, 7.0), 0.1);
        assert_relative_eq!(
            weibull_intensity(0.1, 2.0, 3.0),
            0.1 * 2.0 * 3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_state() {
        let process = HazardProcess::new("death", 5);
        assert!(process.validate(3).is_err());
        assert!(process.validate(6).is_ok());
    }

    #[test]
    fn test_draw_once_fires_at_threshold_crossing() {
        let process = HazardProcess::new("event", 0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut monitor = HazardMonitor::new(&process, &mut rng);
        let threshold = monitor.threshold;

        // below the threshold nothing fires
        assert!(!monitor.check(&process, threshold * 0.5, 1.0, &mut rng));
        assert!(monitor.fired_at().is_none());

        // first evaluation at or past the threshold fires
        assert!(monitor.check(&process, threshold * 1.1, 2.0, &mut rng));
        assert_eq!(monitor.fired_at(), Some(2.0));

        // non-recurrent processes fire once
        assert!(!monitor.check(&process, threshold * 2.0, 3.0, &mut rng));
        assert_eq!(monitor.fires(), 1);
    }

    #[test]
    fn test_recurrent_rearms() {
        let process = HazardProcess::new("seizure", 0).recurrent();
        let mut rng = StdRng::seed_from_u64(11);
        let mut monitor = HazardMonitor::new(&process, &mut rng);

        let mut fires = 0;
        let mut cumhaz = 0.0;
        for step in 1..=200 {
            cumhaz += 0.1;
            if monitor.check(&process, cumhaz, step as f64, &mut rng) {
                fires += 1;
                // engine zeroes the hazard state after a recurrent fire
                cumhaz = 0.0;
                monitor.resync(0.0);
            }
        }
        assert!(fires > 1);
        assert_eq!(monitor.fires(), fires);
    }

    #[test]
    fn test_per_interval_extremes() {
        let process = HazardProcess::new("event", 0).with_policy(ThresholdPolicy::PerInterval);
        let mut rng = StdRng::seed_from_u64(5);
        let mut monitor = HazardMonitor::new(&process, &mut rng);

        // zero increment can never fire and consumes no draws
        assert!(!monitor.check(&process, 0.0, 1.0, &mut rng));
        // an enormous increment fires almost surely
        assert!(monitor.check(&process, 1e6, 2.0, &mut rng));
    }

    #[test]
    fn test_survival_from_cumhaz() {
        let process = HazardProcess::new("event", 0);
        let mut rng = StdRng::seed_from_u64(1);
        let monitor = HazardMonitor::new(&process, &mut rng);
        assert_relative_eq!(monitor.survival(0.0), 1.0);
        assert_relative_eq!(monitor.survival(1.0), (-1.0f64).exp());
        assert!(monitor.survival(50.0) > 0.0);
    }

    #[test]
    fn test_counting_tally_rate() {
        // constant intensity 0.2 per interval over many intervals; the
        // acceptance probability per interval is 1 - exp(-0.2)
        let process = CountingProcess::new("episodes", 0);
        let mut rng = StdRng::seed_from_u64(42);
        let n = 50_000;
        let mut total = 0u64;
        for _ in 0..n {
            let mut tally = CountingTally::new();
            total += tally.step(&process, 0.2, &mut rng).unwrap();
        }
        let expected = 1.0 - (-0.2f64).exp();
        assert_relative_eq!(total as f64 / n as f64, expected, epsilon = 0.01);
    }

    #[test]
    fn test_counting_tally_dead_time_consumes_nothing() {
        let process = CountingProcess::new("episodes", 0);
        let mut rng = StdRng::seed_from_u64(7);
        let before: f64 = rng.random();
        let mut rng = StdRng::seed_from_u64(7);
        let mut tally = CountingTally::new();
        assert_eq!(tally.step(&process, 0.0, &mut rng).unwrap(), 0);
        assert_eq!(tally.step(&process, 0.0, &mut rng).unwrap(), 0);
        let after: f64 = rng.random();
        assert_eq!(before, after);
    }
}
