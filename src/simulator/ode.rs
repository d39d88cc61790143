//! Adaptive Runge-Kutta integration of the model equations.
//!
//! Dormand-Prince 4(5) with embedded error estimation and step-size control.
//! Infusion rates enter as a constant forcing vector per integration
//! segment; the driver breaks integration at every infusion boundary, so the
//! active set cannot change inside a segment.

use super::{DiffEq, T, V};
use crate::data::{Covariates, Infusion};

/// Two time points closer than this are treated as coincident
pub(crate) const TIME_EPS: f64 = 1e-9;

const MIN_SCALE: f64 = 0.2;
const MAX_SCALE: f64 = 5.0;
const SAFETY: f64 = 0.9;

/// Integration failure local to one individual
#[derive(Debug, Clone)]
pub(crate) struct OdeError {
    pub time: f64,
    pub reason: String,
}

pub(crate) struct Integrator<'a> {
    diffeq: DiffEq,
    params: &'a V,
    covariates: &'a Covariates,
    infusions: &'a [Infusion],
    nstates: usize,
    rtol: f64,
    atol: f64,
    h0: f64,
    max_steps: usize,
}

impl<'a> Integrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        diffeq: DiffEq,
        params: &'a V,
        covariates: &'a Covariates,
        infusions: &'a [Infusion],
        nstates: usize,
        rtol: f64,
        atol: f64,
        h0: f64,
        max_steps: usize,
    ) -> Self {
        Integrator {
            diffeq,
            params,
            covariates,
            infusions,
            nstates,
            rtol,
            atol,
            h0,
            max_steps,
        }
    }

    /// Infusion forcing per compartment at `time`
    fn rateiv(&self, time: T) -> V {
        let mut rateiv = V::zeros(self.nstates);
        for infusion in self.infusions {
            if infusion.active_at(time) {
                rateiv[infusion.input()] += infusion.rate();
            }
        }
        rateiv
    }

    fn derivatives(&self, time: T, x: &V, rateiv: &V) -> V {
        let mut dx = V::zeros(self.nstates);
        (self.diffeq)(x, self.params, time, &mut dx, rateiv, self.covariates);
        dx
    }

    /// Advance `x` from `from` to `to` in place.
    ///
    /// The forcing vector is sampled once at the segment midpoint; endpoints
    /// may coincide with infusion boundaries, where the half-open activity
    /// window would be ambiguous. Step sizes adapt to the local error
    /// estimate; the final step is shortened to land exactly on `to` so
    /// event times are hit without interpolation.
    pub(crate) fn advance(&self, x: &mut V, from: T, to: T) -> Result<(), OdeError> {
        if to - from <= TIME_EPS {
            return Ok(());
        }
        let rateiv = self.rateiv(0.5 * (from + to));
        let mut t = from;
        let mut h = self.h0.min(to - from);
        let mut k1 = self.derivatives(t, x, &rateiv);
        let mut steps = 0usize;

        while to - t > TIME_EPS {
            if steps >= self.max_steps {
                return Err(OdeError {
                    time: t,
                    reason: format!("exceeded {} steps", self.max_steps),
                });
            }
            if h < f64::EPSILON * t.abs().max(1.0) {
                return Err(OdeError {
                    time: t,
                    reason: "step size underflow".to_string(),
                });
            }
            h = h.min(to - t);

            let k2 = self.derivatives(t + h / 5.0, &(&*x + &k1 * (h / 5.0)), &rateiv);
            let k3 = self.derivatives(
                t + 3.0 / 10.0 * h,
                &(&*x + &k1 * (3.0 / 40.0 * h) + &k2 * (9.0 / 40.0 * h)),
                &rateiv,
            );
            let k4 = self.derivatives(
                t + 4.0 / 5.0 * h,
                &(&*x + &k1 * (44.0 / 45.0 * h) - &k2 * (56.0 / 15.0 * h) + &k3 * (32.0 / 9.0 * h)),
                &rateiv,
            );
            let k5 = self.derivatives(
                t + 8.0 / 9.0 * h,
                &(&*x + &k1 * (19372.0 / 6561.0 * h) - &k2 * (25360.0 / 2187.0 * h)
                    + &k3 * (64448.0 / 6561.0 * h)
                    - &k4 * (212.0 / 729.0 * h)),
                &rateiv,
            );
            let k6 = self.derivatives(
                t + h,
                &(&*x + &k1 * (9017.0 / 3168.0 * h) - &k2 * (355.0 / 33.0 * h)
                    + &k3 * (46732.0 / 5247.0 * h)
                    + &k4 * (49.0 / 176.0 * h)
                    - &k5 * (5103.0 / 18656.0 * h)),
                &rateiv,
            );

            // fifth-order solution
            let proposal = &*x
                + &k1 * (35.0 / 384.0 * h)
                + &k3 * (500.0 / 1113.0 * h)
                + &k4 * (125.0 / 192.0 * h)
                - &k5 * (2187.0 / 6784.0 * h)
                + &k6 * (11.0 / 84.0 * h);
            let k7 = self.derivatives(t + h, &proposal, &rateiv);

            if proposal.iter().any(|value| !value.is_finite()) {
                return Err(OdeError {
                    time: t,
                    reason: "non-finite state during integration".to_string(),
                });
            }

            // embedded fourth-order difference
            let error_vec = &k1 * ((35.0 / 384.0 - 5179.0 / 57600.0) * h)
                + &k3 * ((500.0 / 1113.0 - 7571.0 / 16695.0) * h)
                + &k4 * ((125.0 / 192.0 - 393.0 / 640.0) * h)
                - &k5 * ((2187.0 / 6784.0 - 92097.0 / 339200.0) * h)
                + &k6 * ((11.0 / 84.0 - 187.0 / 2100.0) * h)
                - &k7 * (h / 40.0);

            let mut error = 0.0;
            for i in 0..self.nstates {
                let scale = self.atol + self.rtol * x[i].abs().max(proposal[i].abs());
                let ratio = error_vec[i] / scale;
                error += ratio * ratio;
            }
            error = (error / self.nstates.max(1) as f64).sqrt();

            if error <= 1.0 {
                t += h;
                *x = proposal;
                k1 = k7;
                steps += 1;
            }

            let scale = if error > 0.0 {
                (SAFETY * error.powf(-0.2)).clamp(MIN_SCALE, MAX_SCALE)
            } else {
                MAX_SCALE
            };
            h *= scale;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay(x: &V, p: &V, _t: T, dx: &mut V, rateiv: &V, _cov: &Covariates) {
        dx[0] = rateiv[0] - p[0] * x[0];
    }

    fn integrator<'a>(
        params: &'a V,
        covariates: &'a Covariates,
        infusions: &'a [Infusion],
    ) -> Integrator<'a> {
        Integrator::new(decay, params, covariates, infusions, 1, 1e-8, 1e-10, 1e-3, 100_000)
    }

    #[test]
    fn test_exponential_decay_matches_analytic() {
        let params = V::from_vec(vec![0.3]);
        let covariates = Covariates::new();
        let integrator = integrator(&params, &covariates, &[]);

        let mut x = V::from_vec(vec![100.0]);
        integrator.advance(&mut x, 0.0, 10.0).unwrap();
        assert_relative_eq!(x[0], 100.0 * (-3.0f64).exp(), epsilon = 1e-6);
    }

    #[test]
    fn test_infusion_forcing() {
        let params = V::from_vec(vec![0.0]);
        let covariates = Covariates::new();
        // 100 over 2 hours into compartment 0, no elimination
        let infusions = vec![Infusion::new(0.0, 100.0, 0, 2.0)];
        let integrator = integrator(&params, &covariates, &infusions);

        let mut x = V::from_vec(vec![0.0]);
        integrator.advance(&mut x, 0.0, 2.0).unwrap();
        assert_relative_eq!(x[0], 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_length_interval_is_noop() {
        let params = V::from_vec(vec![0.3]);
        let covariates = Covariates::new();
        let integrator = integrator(&params, &covariates, &[]);
        let mut x = V::from_vec(vec![5.0]);
        integrator.advance(&mut x, 1.0, 1.0).unwrap();
        assert_eq!(x[0], 5.0);
    }
}
