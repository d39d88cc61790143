//! Hybrid continuous/discrete-time simulation engine for pharmacometric
//! models.
//!
//! A model is a compartmental ODE system advanced through time, interrupted
//! by discrete dosing and observation events, with per-individual random
//! effects and, optionally, hazard-driven stochastic events (time-to-event,
//! recurrent and counting processes, multistate transitions) layered on top.
//! Populations are simulated in parallel with per-subject random streams, so
//! runs are bit-reproducible for a fixed seed and dataset order.
//!
//! # Example
//!
//! ```
//! use pharmsim::*;
//!
//! // one-compartment model with first-order absorption
//! fn diffeq(x: &V, p: &V, _t: T, dx: &mut V, rateiv: &V, _cov: &Covariates) {
//!     fetch_params!(p, ka, cl, v);
//!     dx[0] = -ka * x[0];
//!     dx[1] = rateiv[1] + ka * x[0] - cl / v * x[1];
//! }
//! fn init(_p: &V, _t: T, _cov: &Covariates, _x: &mut V) {}
//! fn out(x: &V, p: &V, _t: T, _cov: &Covariates, y: &mut V) {
//!     fetch_params!(p, _ka, _cl, v);
//!     y[0] = x[1] / v;
//! }
//!
//! let model = Model::new(diffeq, init, out, (2, 1))
//!     .with_parameters(
//!         ParameterModel::new()
//!             .fixed("ka", 0.6)
//!             .random("cl", 6.0, Transform::Exponential, 0)
//!             .random("v", 15.0, Transform::Exponential, 1),
//!     )
//!     .with_omega(Omega::diagonal(&[("eta_cl", 0.09), ("eta_v", 0.04)]).unwrap());
//!
//! let subject = Subject::builder("patient_001")
//!     .bolus(0.0, 100.0, 0)
//!     .observation_grid(0.0, 24.0, 1.0, 0)
//!     .build();
//!
//! let result = simulate_population(&model, &subject.into(), &Settings::default()).unwrap();
//! assert_eq!(result.len(), 1);
//! ```

pub mod data;
pub mod error;
pub mod hazard;
pub mod randeff;
pub mod simulator;

pub use data::{
    Bolus, Covariate, Covariates, Data, Event, Infusion, Observation, Protocol, Reset, Subject,
    SubjectBuilder, SubjectBuilderExt,
};
pub use error::PharmsimError;
pub use hazard::{
    multistate::{Intensity, Multistate, Occupancy, Transition, TransitionGuard},
    weibull_intensity, CountingProcess, HazardProcess, Magnitude, ThresholdPolicy,
};
pub use randeff::{Frailty, FrailtySpec, Omega, ParameterModel, ThetaSpec, Transform};
pub use simulator::{
    simulate_population, simulate_population_with_cancel, DiffEq, Fa, Init, Lag, Model, Neqs, Out,
    PopulationResult, ProtocolFn, Row, Settings, Status, SubjectResult, T, V,
};

/// Destructure the parameter vector into named locals, in declaration order.
///
/// ```
/// use pharmsim::*;
///
/// fn out(x: &V, p: &V, _t: T, _cov: &Covariates, y: &mut V) {
///     fetch_params!(p, _cl, v);
///     y[0] = x[0] / v;
/// }
/// ```
#[macro_export]
macro_rules! fetch_params {
    ($p:expr, $($name:ident),* $(,)?) => {
        let mut _pi = 0usize;
        $(
            let $name = $p[_pi];
            _pi += 1;
        )*
        let _ = _pi;
    };
}

/// Fetch interpolated covariate values by name at a time point.
///
/// Panics if a named covariate has no observations; covariates used by the
/// equations are part of the model contract.
#[macro_export]
macro_rules! fetch_cov {
    ($cov:expr, $t:expr, $($name:ident),* $(,)?) => {
        $(
            let $name = match $cov
                .get_covariate(stringify!($name))
                .and_then(|covariate| covariate.interpolate($t))
            {
                Some(value) => value,
                None => panic!("covariate '{}' has no observations", stringify!($name)),
            };
        )*
    };
}

/// Build the per-compartment map returned by a [Lag] function
///
/// ```
/// use pharmsim::*;
///
/// fn tlag(p: &V, _t: T, _cov: &Covariates) -> std::collections::HashMap<usize, f64> {
///     fetch_params!(p, tlag);
///     lag! {0 => tlag}
/// }
/// ```
#[macro_export]
macro_rules! lag {
    ($($cmt:expr => $value:expr),* $(,)?) => {
        ::std::collections::HashMap::from([$(($cmt, $value)),*])
    };
}

/// Build the per-compartment map returned by a [Fa] function
#[macro_export]
macro_rules! fa {
    ($($cmt:expr => $value:expr),* $(,)?) => {
        ::std::collections::HashMap::from([$(($cmt, $value)),*])
    };
}
