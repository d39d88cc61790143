//! Discrete state occupancy driven by transition intensities.
//!
//! Each individual occupies exactly one discrete state at a time (disease
//! stage, adherence status). Transitions between states happen with
//! intensities that may depend on parameters, the continuous system state,
//! time, and covariates, so the kinetics can drive the state process.

use crate::data::Covariates;
use crate::error::PharmsimError;
use crate::simulator::{T, V};
use rand::Rng;

/// Transition intensity as a function of parameters, continuous state, time,
/// and covariates
pub type Intensity = fn(&V, &V, T, &Covariates) -> f64;

/// Predicate on the previously occupied state, used to admit or block a
/// transition (for example, no relapse without a prior remission)
pub type TransitionGuard = fn(Option<usize>) -> bool;

/// One declared transition between discrete states
#[derive(Clone)]
pub struct Transition {
    from: usize,
    to: usize,
    intensity: Intensity,
    guard: Option<TransitionGuard>,
}

impl Transition {
    pub fn new(from: usize, to: usize, intensity: Intensity) -> Self {
        Transition {
            from,
            to,
            intensity,
            guard: None,
        }
    }

    /// Attach a guard on the previously occupied state
    pub fn with_guard(mut self, guard: TransitionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn from(&self) -> usize {
        self.from
    }

    pub fn to(&self) -> usize {
        self.to
    }
}

/// Declaration of a multistate process: the discrete state space, the initial
/// state, the admissible transitions, and which states are absorbing.
#[derive(Clone, Default)]
pub struct Multistate {
    nstates: usize,
    initial: usize,
    transitions: Vec<Transition>,
    terminal: Vec<usize>,
}

impl Multistate {
    pub fn new(nstates: usize, initial: usize) -> Self {
        Multistate {
            nstates,
            initial,
            transitions: Vec::new(),
            terminal: Vec::new(),
        }
    }

    /// Declare a transition with the given intensity
    pub fn transition(mut self, from: usize, to: usize, intensity: Intensity) -> Self {
        self.transitions.push(Transition::new(from, to, intensity));
        self
    }

    /// Declare a guarded transition
    pub fn guarded_transition(
        mut self,
        from: usize,
        to: usize,
        intensity: Intensity,
        guard: TransitionGuard,
    ) -> Self {
        self.transitions
            .push(Transition::new(from, to, intensity).with_guard(guard));
        self
    }

    /// Mark a state absorbing; entering it stops the individual's simulation
    pub fn terminal_state(mut self, state: usize) -> Self {
        self.terminal.push(state);
        self
    }

    pub fn nstates(&self) -> usize {
        self.nstates
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn is_terminal(&self, state: usize) -> bool {
        self.terminal.contains(&state)
    }

    /// Check every declared index against the state space
    pub fn validate(&self) -> Result<(), PharmsimError> {
        if self.nstates == 0 {
            return Err(PharmsimError::InvalidMultistate(
                "state space must have at least one state".to_string(),
            ));
        }
        if self.initial >= self.nstates {
            return Err(PharmsimError::InvalidMultistate(format!(
                "initial state {} out of range for {} states",
                self.initial, self.nstates
            )));
        }
        for transition in &self.transitions {
            if transition.from >= self.nstates || transition.to >= self.nstates {
                return Err(PharmsimError::InvalidMultistate(format!(
                    "transition {} -> {} out of range for {} states",
                    transition.from, transition.to, self.nstates
                )));
            }
            if transition.from == transition.to {
                return Err(PharmsimError::InvalidMultistate(format!(
                    "self transition declared on state {}",
                    transition.from
                )));
            }
        }
        for &state in &self.terminal {
            if state >= self.nstates {
                return Err(PharmsimError::InvalidMultistate(format!(
                    "terminal state {} out of range for {} states",
                    state, self.nstates
                )));
            }
        }
        Ok(())
    }

    /// Transition probabilities out of the occupied state over an interval of
    /// length `dt`, as (target, probability) pairs. `None` is the stay
    /// probability; entries always sum to one.
    ///
    /// The competing-risks split holds the intensities constant over the
    /// interval: with total rate Q, stay carries `exp(-Q dt)` and each
    /// admissible target its share `(1 - exp(-Q dt)) * r_i / Q`. Mass from
    /// guard-rejected transitions folds back into stay.
    pub fn boundaries(
        &self,
        occupancy: &Occupancy,
        params: &V,
        state: &V,
        time: T,
        dt: f64,
        covariates: &Covariates,
    ) -> Vec<(Option<usize>, f64)> {
        let mut rates = Vec::new();
        let mut total = 0.0;
        for transition in &self.transitions {
            if transition.from != occupancy.current() {
                continue;
            }
            let rate = (transition.intensity)(params, state, time, covariates).max(0.0);
            total += rate;
            let allowed = transition
                .guard
                .map(|guard| guard(occupancy.previous()))
                .unwrap_or(true);
            rates.push((transition.to, rate, allowed));
        }

        if total <= 0.0 || dt <= 0.0 {
            return vec![(None, 1.0)];
        }

        let move_mass = 1.0 - (-total * dt).exp();
        let mut stay = 1.0 - move_mass;
        let mut out = Vec::with_capacity(rates.len() + 1);
        for (to, rate, allowed) in rates {
            let share = move_mass * rate / total;
            if allowed {
                out.push((Some(to), share));
            } else {
                stay += share;
            }
        }
        out.insert(0, (None, stay));
        out
    }

    /// Advance the occupancy over one interval. A single uniform draw selects
    /// among the boundaries; returns the new state if a move happened.
    ///
    /// Terminal states are absorbing, so no draw is consumed once one is
    /// entered.
    pub fn step<R: Rng>(
        &self,
        occupancy: &mut Occupancy,
        params: &V,
        state: &V,
        time: T,
        dt: f64,
        covariates: &Covariates,
        rng: &mut R,
    ) -> Option<usize> {
        if self.is_terminal(occupancy.current()) {
            return None;
        }
        let boundaries = self.boundaries(occupancy, params, state, time, dt, covariates);
        if boundaries.len() == 1 {
            return None;
        }
        let u: f64 = rng.random();
        let mut cumulative = 0.0;
        for (target, probability) in boundaries {
            cumulative += probability;
            if u < cumulative {
                if let Some(to) = target {
                    occupancy.move_to(to, time + dt);
                    return Some(to);
                }
                return None;
            }
        }
        None
    }
}

/// Which discrete state an individual occupies, and since when
#[derive(Debug, Clone, PartialEq)]
pub struct Occupancy {
    current: usize,
    previous: Option<usize>,
    entered_at: f64,
}

impl Occupancy {
    pub fn new(initial: usize, time: f64) -> Self {
        Occupancy {
            current: initial,
            previous: None,
            entered_at: time,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn previous(&self) -> Option<usize> {
        self.previous
    }

    /// Time the current state was entered
    pub fn entered_at(&self) -> f64 {
        self.entered_at
    }

    /// Sojourn time in the current state as of `now`
    pub fn time_in_state(&self, now: f64) -> f64 {
        now - self.entered_at
    }

    pub fn move_to(&mut self, state: usize, time: f64) {
        self.previous = Some(self.current);
        self.current = state;
        self.entered_at = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn k12(_p: &V, _x: &V, _t: T, _cov: &Covariates) -> f64 {
        0.05
    }

    fn k13(_p: &V, _x: &V, _t: T, _cov: &Covariates) -> f64 {
        0.01
    }

    fn empty() -> (V, V, Covariates) {
        (V::zeros(0), V::zeros(0), Covariates::new())
    }

    #[test]
    fn test_boundaries_sum_to_one() {
        let multistate = Multistate::new(3, 0)
            .transition(0, 1, k12)
            .transition(0, 2, k13);
        multistate.validate().unwrap();

        let (p, x, cov) = empty();
        let occupancy = Occupancy::new(0, 0.0);
        let boundaries = multistate.boundaries(&occupancy, &p, &x, 0.0, 1.0, &cov);
        assert_eq!(boundaries.len(), 3);
        let total: f64 = boundaries.iter().map(|&(_, probability)| probability).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_competing_risks_shares() {
        let multistate = Multistate::new(3, 0)
            .transition(0, 1, k12)
            .transition(0, 2, k13);
        let (p, x, cov) = empty();
        let occupancy = Occupancy::new(0, 0.0);
        let dt = 2.0;
        let boundaries = multistate.boundaries(&occupancy, &p, &x, 0.0, dt, &cov);

        let q = 0.06;
        let stay = (-q * dt).exp();
        assert_relative_eq!(boundaries[0].1, stay, epsilon = 1e-12);
        assert_relative_eq!(boundaries[1].1, (1.0 - stay) * 0.05 / q, epsilon = 1e-12);
        assert_relative_eq!(boundaries[2].1, (1.0 - stay) * 0.01 / q, epsilon = 1e-12);
    }

    #[test]
    fn test_guard_folds_mass_into_stay() {
        fn requires_previous(previous: Option<usize>) -> bool {
            previous.is_some()
        }
        let multistate = Multistate::new(3, 0)
            .transition(0, 1, k12)
            .guarded_transition(0, 2, k13, requires_previous);
        let (p, x, cov) = empty();

        // fresh occupancy has no previous state, so 0 -> 2 is blocked
        let occupancy = Occupancy::new(0, 0.0);
        let boundaries = multistate.boundaries(&occupancy, &p, &x, 0.0, 1.0, &cov);
        assert_eq!(boundaries.len(), 2);
        // the blocked share raises stay, but the total rate still includes it
        let q = 0.06;
        let stay = (-q * 1.0f64).exp() + (1.0 - (-q * 1.0f64).exp()) * 0.01 / q;
        assert_relative_eq!(boundaries[0].1, stay, epsilon = 1e-12);
        let total: f64 = boundaries.iter().map(|&(_, probability)| probability).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_terminal_state_absorbs() {
        let multistate = Multistate::new(2, 0)
            .transition(0, 1, k12)
            .transition(1, 0, k12)
            .terminal_state(1);
        let (p, x, cov) = empty();
        let mut occupancy = Occupancy::new(1, 5.0);
        let mut rng = StdRng::seed_from_u64(1);
        let before: f64 = StdRng::seed_from_u64(1).random();
        assert_eq!(
            multistate.step(&mut occupancy, &p, &x, 5.0, 1.0, &cov, &mut rng),
            None
        );
        // no draw consumed
        assert_eq!(rng.random::<f64>(), before);
    }

    #[test]
    fn test_step_moves_eventually() {
        let multistate = Multistate::new(2, 0).transition(0, 1, k12);
        let (p, x, cov) = empty();
        let mut occupancy = Occupancy::new(0, 0.0);
        let mut rng = StdRng::seed_from_u64(21);
        let mut time = 0.0;
        let mut moved = None;
        for _ in 0..10_000 {
            moved = multistate.step(&mut occupancy, &p, &x, time, 1.0, &cov, &mut rng);
            if moved.is_some() {
                break;
            }
            time += 1.0;
        }
        assert_eq!(moved, Some(1));
        assert_eq!(occupancy.current(), 1);
        assert_eq!(occupancy.previous(), Some(0));
        assert_relative_eq!(occupancy.entered_at(), time + 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        assert!(Multistate::new(0, 0).validate().is_err());
        assert!(Multistate::new(2, 2).validate().is_err());
        assert!(Multistate::new(2, 0)
            .transition(0, 3, k12)
            .validate()
            .is_err());
        assert!(Multistate::new(2, 0)
            .terminal_state(5)
            .validate()
            .is_err());
    }
}
