use thiserror::Error;

/// Error taxonomy for the simulation engine.
///
/// Errors fall into three classes with different propagation rules:
///
/// - **Configuration errors** (malformed declarations: negative event times,
///   non-positive-definite omega, bad distribution parameters) are detected
///   before any simulation starts and abort the whole run.
/// - **Model errors** (an event or declaration references an undeclared
///   compartment, eta, or protocol action) indicate a structural bug; every
///   individual would fail identically, so the whole run aborts.
/// - **Simulation errors** (integrator divergence, non-finite state) are
///   isolated to one individual; the population driver records the failure
///   and continues with the remaining individuals.
#[derive(Error, Debug, Clone)]
pub enum PharmsimError {
    // Configuration errors -- surfaced before any simulation starts.
    /// The omega (random-effect covariance) matrix is not symmetric.
    #[error("omega matrix is not symmetric")]
    AsymmetricOmega,

    /// Cholesky factorization of omega failed.
    #[error("omega matrix is not positive-definite")]
    NonPositiveDefiniteOmega,

    /// An event was scheduled before time zero.
    #[error("subject {id}: event scheduled at negative time {time}")]
    NegativeEventTime { id: String, time: f64 },

    /// An infusion with zero or negative duration cannot define a rate.
    #[error("subject {id}: infusion at t={time} has non-positive duration {duration}")]
    InvalidInfusionDuration {
        id: String,
        time: f64,
        duration: f64,
    },

    /// A declared distribution has invalid parameters (e.g. negative sigma).
    #[error("invalid distribution parameters for '{name}': {reason}")]
    InvalidDistribution { name: String, reason: String },

    /// The multistate declaration is internally inconsistent.
    #[error("invalid multistate declaration: {0}")]
    InvalidMultistate(String),

    // Model errors -- structural bugs, fatal for the whole run.
    /// A dose or reset event targets a compartment the model does not declare.
    #[error("event references undeclared compartment {input} (model has {nstates} states)")]
    UndeclaredCompartment { input: usize, nstates: usize },

    /// A parameter declaration references an eta index outside the omega block.
    #[error("parameter '{name}' references undeclared eta index {index}")]
    UndeclaredEta { name: String, index: usize },

    /// A protocol event references an action index with no registered callback.
    #[error("protocol event references unregistered action {action}")]
    UndeclaredProtocol { action: usize },

    /// An observation requests an output equation the model does not declare.
    #[error("observation references undeclared output equation {outeq} (model has {nouteqs})")]
    UndeclaredOuteq { outeq: usize, nouteqs: usize },

    /// A hazard or counting process accumulates into an undeclared state.
    #[error("process '{name}' references undeclared compartment {cmt} (model has {nstates} states)")]
    UndeclaredHazardCompartment {
        name: String,
        cmt: usize,
        nstates: usize,
    },

    // Simulation errors -- recoverable at the population level.
    /// The ODE integrator failed to advance the state.
    #[error("integration failed for subject {id} at t={time}: {reason}")]
    Integration { id: String, time: f64, reason: String },

    /// The state vector contains NaN or infinite values.
    #[error("non-finite state for subject {id} at t={time}")]
    NonFiniteState { id: String, time: f64 },
}

impl PharmsimError {
    /// Whether the population driver may skip the failing individual and
    /// continue. Configuration and model errors are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PharmsimError::Integration { .. } | PharmsimError::NonFiniteState { .. }
        )
    }
}
