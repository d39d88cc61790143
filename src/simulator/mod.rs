//! The simulation engine: model declaration, the ODE integrator, the
//! per-individual event-loop driver, and the parallel population runner.

pub mod individual;
pub mod ode;
pub mod output;
pub mod population;

use crate::data::{Covariates, Data};
use crate::error::PharmsimError;
use crate::hazard::{multistate::Multistate, CountingProcess, HazardProcess};
use crate::randeff::{Frailty, FrailtySpec, Omega, ParameterModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use output::{PopulationResult, Row, Status, SubjectResult};
pub use population::{simulate_population, simulate_population_with_cancel};

/// Simulation time
pub type T = f64;
/// State, parameter, and output vectors
pub type V = nalgebra::DVector<f64>;

/// The differential equations of the model
///
/// Called as `(x, p, t, dx, rateiv, cov)`: current state, individual
/// parameters, time, derivative accumulator, active infusion rates per
/// compartment, and the subject's covariates.
pub type DiffEq = fn(&V, &V, T, &mut V, &V, &Covariates);

/// Initial state of the system, written into the last argument
pub type Init = fn(&V, T, &Covariates, &mut V);

/// Output equations, written into the last argument
pub type Out = fn(&V, &V, T, &Covariates, &mut V);

/// Absorption lag per input compartment
pub type Lag = fn(&V, T, &Covariates) -> HashMap<usize, f64>;

/// Bioavailability fraction per input compartment
pub type Fa = fn(&V, T, &Covariates) -> HashMap<usize, f64>;

/// A protocol callback mutating parameters and/or state at a scheduled time,
/// called as `(p, x, t)`
pub type ProtocolFn = fn(&mut V, &mut V, T);

/// Number of states and number of output equations
pub type Neqs = (usize, usize);

/// A complete model declaration: equations, dimensions, the parameter
/// structure, and any stochastic processes layered on top.
///
/// # Examples
///
/// ```
/// use pharmsim::*;
///
/// fn diffeq(x: &V, p: &V, _t: T, dx: &mut V, rateiv: &V, _cov: &Covariates) {
///     fetch_params!(p, ke);
///     dx[0] = rateiv[0] - ke * x[0];
/// }
/// fn init(_p: &V, _t: T, _cov: &Covariates, _x: &mut V) {}
/// fn out(x: &V, p: &V, _t: T, _cov: &Covariates, y: &mut V) {
///     fetch_params!(p, _ke, v);
///     y[0] = x[0] / v;
/// }
///
/// let model = Model::new(diffeq, init, out, (1, 1))
///     .with_parameters(
///         ParameterModel::new().fixed("ke", 0.4).fixed("v", 15.0),
///     );
/// ```
#[derive(Clone)]
pub struct Model {
    diffeq: DiffEq,
    init: Init,
    out: Out,
    lag: Option<Lag>,
    fa: Option<Fa>,
    neqs: Neqs,
    parameters: ParameterModel,
    omega: Option<Omega>,
    frailties: Vec<FrailtySpec>,
    hazards: Vec<HazardProcess>,
    counting: Vec<CountingProcess>,
    multistate: Option<Multistate>,
    protocols: Vec<ProtocolFn>,
}

impl Model {
    /// Declare a model from its equations and dimensions
    pub fn new(diffeq: DiffEq, init: Init, out: Out, neqs: Neqs) -> Self {
        Model {
            diffeq,
            init,
            out,
            lag: None,
            fa: None,
            neqs,
            parameters: ParameterModel::new(),
            omega: None,
            frailties: Vec::new(),
            hazards: Vec::new(),
            counting: Vec::new(),
            multistate: None,
            protocols: Vec::new(),
        }
    }

    /// Attach the parameter structure
    pub fn with_parameters(mut self, parameters: ParameterModel) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach the random-effect covariance
    pub fn with_omega(mut self, omega: Omega) -> Self {
        self.omega = Some(omega);
        self
    }

    /// Attach a named frailty; parameters reference it by declaration index
    pub fn with_frailty(mut self, name: impl Into<String>, dist: Frailty) -> Self {
        self.frailties.push(FrailtySpec {
            name: name.into(),
            dist,
        });
        self
    }

    /// Attach an absorption lag function
    pub fn with_lag(mut self, lag: Lag) -> Self {
        self.lag = Some(lag);
        self
    }

    /// Attach a bioavailability function
    pub fn with_fa(mut self, fa: Fa) -> Self {
        self.fa = Some(fa);
        self
    }

    /// Attach a hazard-driven event process
    pub fn with_hazard(mut self, hazard: HazardProcess) -> Self {
        self.hazards.push(hazard);
        self
    }

    /// Attach a counting process
    pub fn with_counting_process(mut self, process: CountingProcess) -> Self {
        self.counting.push(process);
        self
    }

    /// Attach a multistate process
    pub fn with_multistate(mut self, multistate: Multistate) -> Self {
        self.multistate = Some(multistate);
        self
    }

    /// Register a protocol callback; [crate::data::Protocol] events reference
    /// it by registration index
    pub fn with_protocol(mut self, protocol: ProtocolFn) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Number of states
    pub fn nstates(&self) -> usize {
        self.neqs.0
    }

    /// Number of output equations
    pub fn nouteqs(&self) -> usize {
        self.neqs.1
    }

    pub fn parameters(&self) -> &ParameterModel {
        &self.parameters
    }

    pub fn omega(&self) -> Option<&Omega> {
        self.omega.as_ref()
    }

    /// Validate the declaration and a dataset against it.
    ///
    /// Every error raised here aborts the whole run; nothing in this check
    /// depends on random draws.
    pub fn validate(&self, data: &Data) -> Result<(), PharmsimError> {
        let eta_dim = self.omega.as_ref().map(|omega| omega.dim()).unwrap_or(0);
        self.parameters.validate(eta_dim, self.frailties.len())?;
        for hazard in &self.hazards {
            hazard.validate(self.nstates())?;
        }
        for process in &self.counting {
            process.validate(self.nstates())?;
        }
        if let Some(multistate) = &self.multistate {
            multistate.validate()?;
        }
        for subject in data.iter() {
            subject.validate(self.nstates(), self.nouteqs(), self.protocols.len())?;
        }
        Ok(())
    }

    /// Evaluate the initial state at `time`
    pub(crate) fn initial_state(&self, params: &V, time: T, covariates: &Covariates) -> V {
        let mut x = V::zeros(self.nstates());
        (self.init)(params, time, covariates, &mut x);
        x
    }

    /// Evaluate the output equations
    pub(crate) fn outputs(&self, x: &V, params: &V, time: T, covariates: &Covariates) -> V {
        let mut y = V::zeros(self.nouteqs());
        (self.out)(x, params, time, covariates, &mut y);
        y
    }
}

/// Numerical and reproducibility settings for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Master seed; each subject derives an independent stream from it
    pub seed: u64,
    /// Relative integration tolerance
    pub rtol: f64,
    /// Absolute integration tolerance
    pub atol: f64,
    /// Initial integration step size
    pub h0: f64,
    /// Maximum accepted steps per integration segment
    pub max_steps: usize,
    /// Force all etas to zero and frailties to their typical values,
    /// simulating the population-typical individual
    pub zero_etas: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            seed: 22,
            rtol: 1e-6,
            atol: 1e-9,
            h0: 1e-3,
            max_steps: 100_000,
            zero_etas: false,
        }
    }
}
