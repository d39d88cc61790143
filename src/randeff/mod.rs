//! Per-individual random effects: omega covariance sampling, non-normal
//! frailty terms, and the structural parameter relations combining population
//! values with each individual's draws.

use crate::error::PharmsimError;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Declared covariance structure of the normal random-effect block.
///
/// Sampling draws a standard-normal vector and maps it through the Cholesky
/// factor, so diagonal, block, and fully correlated structures are all
/// expressed by the matrix itself. The factorization is computed once at
/// construction; a matrix that is not positive-definite is rejected there,
/// before any simulation starts.
#[derive(Debug, Clone)]
pub struct Omega {
    names: Vec<String>,
    matrix: DMatrix<f64>,
    lower: DMatrix<f64>,
}

impl Omega {
    /// Build a diagonal omega from (name, variance) pairs
    pub fn diagonal(entries: &[(&str, f64)]) -> Result<Self, PharmsimError> {
        let n = entries.len();
        let mut matrix = DMatrix::<f64>::zeros(n, n);
        for (i, &(_, variance)) in entries.iter().enumerate() {
            matrix[(i, i)] = variance;
        }
        let names = entries.iter().map(|&(name, _)| name.to_string()).collect();
        Omega::from_matrix(names, matrix)
    }

    /// Build an omega from a full covariance matrix.
    ///
    /// # Errors
    ///
    /// [PharmsimError::AsymmetricOmega] if the matrix is not symmetric,
    /// [PharmsimError::NonPositiveDefiniteOmega] if Cholesky factorization
    /// fails.
    pub fn from_matrix(names: Vec<String>, matrix: DMatrix<f64>) -> Result<Self, PharmsimError> {
        let n = matrix.nrows();
        if matrix.ncols() != n || names.len() != n {
            return Err(PharmsimError::AsymmetricOmega);
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if (matrix[(i, j)] - matrix[(j, i)]).abs() > 1e-12 {
                    return Err(PharmsimError::AsymmetricOmega);
                }
            }
        }
        let lower = matrix
            .clone()
            .cholesky()
            .ok_or(PharmsimError::NonPositiveDefiniteOmega)?
            .l();
        Ok(Omega {
            names,
            matrix,
            lower,
        })
    }

    /// Number of etas in the block
    pub fn dim(&self) -> usize {
        self.names.len()
    }

    /// Names of the etas, in declaration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The declared covariance matrix
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Draw one eta vector. Consumes exactly `dim()` values from the stream.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| rng.sample::<f64, _>(StandardNormal));
        &self.lower * z
    }

    /// The zeroed eta vector used for typical-value runs
    pub fn zeros(&self) -> DVector<f64> {
        DVector::zeros(self.dim())
    }
}

/// A non-normal multiplicative frailty term.
///
/// Frailties scale an individual parameter (most often a hazard rate) by a
/// positive draw; in zeroed mode the distribution mean is used instead so
/// typical-value runs stay deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frailty {
    /// Gamma-distributed frailty with the given shape and scale
    Gamma { shape: f64, scale: f64 },
    /// Log-normal frailty on the log scale
    LogNormal { mu: f64, sigma: f64 },
}

impl Frailty {
    /// Draw one frailty value
    pub fn sample<R: Rng>(&self, name: &str, rng: &mut R) -> Result<f64, PharmsimError> {
        match self {
            Frailty::Gamma { shape, scale } => {
                let dist = rand_distr::Gamma::new(*shape, *scale).map_err(|e| {
                    PharmsimError::InvalidDistribution {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(dist.sample(rng))
            }
            Frailty::LogNormal { mu, sigma } => {
                let dist = rand_distr::LogNormal::new(*mu, *sigma).map_err(|e| {
                    PharmsimError::InvalidDistribution {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(dist.sample(rng))
            }
        }
    }

    /// The value substituted in zeroed (typical-value) mode
    pub fn typical(&self) -> f64 {
        match self {
            Frailty::Gamma { shape, scale } => shape * scale,
            Frailty::LogNormal { mu, sigma } => (mu + sigma * sigma / 2.0).exp(),
        }
    }
}

/// A named frailty declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrailtySpec {
    pub name: String,
    pub dist: Frailty,
}

/// Structural relation combining a population theta with its eta
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// theta + eta
    Additive,
    /// theta * (1 + eta)
    Proportional,
    /// theta * exp(eta) (log-normal parameter)
    Exponential,
    /// inverse-logit(logit(theta) + eta), for parameters bounded in (0, 1)
    Logit,
}

impl Transform {
    /// Apply the relation to one theta/eta pair
    pub fn apply(&self, theta: f64, eta: f64) -> f64 {
        match self {
            Transform::Additive => theta + eta,
            Transform::Proportional => theta * (1.0 + eta),
            Transform::Exponential => theta * eta.exp(),
            Transform::Logit => {
                let logit = (theta / (1.0 - theta)).ln() + eta;
                1.0 / (1.0 + (-logit).exp())
            }
        }
    }
}

/// Declaration of one structural parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaSpec {
    name: String,
    value: f64,
    transform: Transform,
    eta: Option<usize>,
    frailty: Option<usize>,
}

impl ThetaSpec {
    /// A parameter with no interindividual variability
    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        ThetaSpec {
            name: name.into(),
            value,
            transform: Transform::Additive,
            eta: None,
            frailty: None,
        }
    }

    /// A parameter with an eta applied through the given transform
    pub fn with_eta(
        name: impl Into<String>,
        value: f64,
        transform: Transform,
        eta: usize,
    ) -> Self {
        ThetaSpec {
            name: name.into(),
            value,
            transform,
            eta: Some(eta),
            frailty: None,
        }
    }

    /// Attach a multiplicative frailty (by index into the model's frailties)
    pub fn with_frailty(mut self, frailty: usize) -> Self {
        self.frailty = Some(frailty);
        self
    }

    /// Get the parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the population value
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// The declared parameter structure: population thetas plus their relations
/// to the random-effect vector.
///
/// Parameter order here is the order of the `p` vector passed to the model's
/// closures, so `fetch_params!` destructures in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterModel {
    thetas: Vec<ThetaSpec>,
}

impl ParameterModel {
    /// Create an empty parameter model
    pub fn new() -> Self {
        ParameterModel { thetas: Vec::new() }
    }

    /// Add a declared parameter
    pub fn theta(mut self, spec: ThetaSpec) -> Self {
        self.thetas.push(spec);
        self
    }

    /// Add a parameter with no variability
    pub fn fixed(self, name: impl Into<String>, value: f64) -> Self {
        self.theta(ThetaSpec::fixed(name, value))
    }

    /// Add a parameter with an eta applied through `transform`
    pub fn random(
        self,
        name: impl Into<String>,
        value: f64,
        transform: Transform,
        eta: usize,
    ) -> Self {
        self.theta(ThetaSpec::with_eta(name, value, transform, eta))
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.thetas.len()
    }

    /// Whether no parameters are declared
    pub fn is_empty(&self) -> bool {
        self.thetas.is_empty()
    }

    /// Parameter names in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.thetas.iter().map(|spec| spec.name()).collect()
    }

    /// Check every eta/frailty reference against the declared dimensions
    pub fn validate(&self, eta_dim: usize, n_frailties: usize) -> Result<(), PharmsimError> {
        for spec in &self.thetas {
            if let Some(index) = spec.eta {
                if index >= eta_dim {
                    return Err(PharmsimError::UndeclaredEta {
                        name: spec.name.clone(),
                        index,
                    });
                }
            }
            if let Some(index) = spec.frailty {
                if index >= n_frailties {
                    return Err(PharmsimError::UndeclaredEta {
                        name: spec.name.clone(),
                        index,
                    });
                }
            }
            if spec.transform == Transform::Logit && !(spec.value > 0.0 && spec.value < 1.0) {
                return Err(PharmsimError::InvalidDistribution {
                    name: spec.name.clone(),
                    reason: format!("logit transform requires theta in (0,1), got {}", spec.value),
                });
            }
        }
        Ok(())
    }

    /// Derive one individual's parameter vector from its draws.
    ///
    /// Derived once per individual; only protocol events may mutate the
    /// resulting vector afterwards.
    pub fn individual(&self, etas: &DVector<f64>, frailties: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.thetas.len(),
            self.thetas.iter().map(|spec| {
                let eta = spec.eta.map(|i| etas[i]).unwrap_or(0.0);
                let mut value = spec.transform.apply(spec.value, eta);
                if let Some(i) = spec.frailty {
                    value *= frailties[i];
                }
                value
            }),
        )
    }

    /// The population-typical parameter vector (all etas zero, frailties at
    /// their typical values)
    pub fn typical(&self, frailty_typicals: &[f64]) -> DVector<f64> {
        let etas = DVector::zeros(
            self.thetas
                .iter()
                .filter_map(|spec| spec.eta)
                .max()
                .map(|max| max + 1)
                .unwrap_or(0),
        );
        self.individual(&etas, frailty_typicals)
    }
}
