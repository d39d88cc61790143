//! The per-individual event-loop driver.
//!
//! One individual is simulated by walking its sorted event schedule:
//! integrate to the next event time, apply the event, evaluate outputs and
//! stochastic processes at observation times, and stop early when a terminal
//! event fires.
//!
//! All random draws for an individual come from its own stream in a fixed
//! order: etas, then frailties, then hazard-threshold arming in declaration
//! order, then the per-observation draws (hazards, counting processes,
//! multistate, each in declaration order). Changing the schedule of one
//! individual can never shift the draws of another.

use super::ode::{Integrator, OdeError, TIME_EPS};
use super::output::{Row, Status, SubjectResult};
use super::{Model, Settings, V};
use crate::data::{Event, Subject};
use crate::error::PharmsimError;
use crate::hazard::{multistate::Occupancy, CountingTally, HazardMonitor};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};

/// Integrate from `from` to `to`, breaking at every boundary in between so
/// the infusion forcing is smooth inside each segment. `boundaries` must be
/// sorted ascending.
fn advance_through(
    integrator: &Integrator,
    x: &mut V,
    from: f64,
    to: f64,
    boundaries: &[f64],
) -> Result<(), OdeError> {
    let mut t = from;
    for &boundary in boundaries {
        if boundary - t > TIME_EPS && to - boundary > TIME_EPS {
            integrator.advance(x, t, boundary)?;
            t = boundary;
        }
    }
    integrator.advance(x, t, to)
}

pub(crate) fn simulate_subject<R: Rng>(
    model: &Model,
    subject: &Subject,
    settings: &Settings,
    rng: &mut R,
    cancel: Option<&AtomicBool>,
) -> Result<SubjectResult, PharmsimError> {
    let covariates = subject.covariates();

    // individual draws, in fixed order
    let etas = match model.omega() {
        Some(omega) if !settings.zero_etas => omega.sample(rng),
        Some(omega) => omega.zeros(),
        None => V::zeros(0),
    };
    let frailties: Vec<f64> = model
        .frailties
        .iter()
        .map(|spec| {
            if settings.zero_etas {
                Ok(spec.dist.typical())
            } else {
                spec.dist.sample(&spec.name, rng)
            }
        })
        .collect::<Result<_, _>>()?;

    let mut params = model.parameters.individual(&etas, &frailties);
    let parameters_snapshot: Vec<f64> = params.iter().copied().collect();

    // realized schedule for this individual's lag and bioavailability
    let events = subject.process_events(
        model.lag.as_ref().map(|lag| (lag, &params, covariates)),
        model.fa.as_ref().map(|fa| (fa, &params, covariates)),
    );

    let infusions = subject.infusions();
    let mut breakpoints: Vec<f64> = infusions
        .iter()
        .map(|infusion| infusion.time() + infusion.duration())
        .collect();
    // NaN times are rejected by validation before simulation
    breakpoints.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let start = events.first().map(|event| event.time()).unwrap_or(0.0);
    let mut x = model.initial_state(&params, start, covariates);

    let mut monitors: Vec<HazardMonitor> = model
        .hazards
        .iter()
        .map(|process| HazardMonitor::new(process, rng))
        .collect();
    let mut tallies = vec![CountingTally::new(); model.counting.len()];
    let mut occupancy = model
        .multistate
        .as_ref()
        .map(|multistate| Occupancy::new(multistate.initial(), start));

    let mut time = start;
    let mut last_eval = start;
    let mut rows = Vec::new();
    let mut status = Status::Completed;

    'schedule: for event in &events {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                status = Status::Cancelled { time };
                break;
            }
        }

        let target = event.time();
        if target - time > TIME_EPS {
            let integrator = Integrator::new(
                model.diffeq,
                &params,
                covariates,
                &infusions,
                model.nstates(),
                settings.rtol,
                settings.atol,
                settings.h0,
                settings.max_steps,
            );
            advance_through(&integrator, &mut x, time, target, &breakpoints).map_err(
                |error| PharmsimError::Integration {
                    id: subject.id().clone(),
                    time: error.time,
                    reason: error.reason,
                },
            )?;
            time = target;
        }

        match event {
            Event::Reset(reset) => {
                match reset.compartments() {
                    Some(compartments) => {
                        for &cmt in compartments {
                            x[cmt] = 0.0;
                        }
                    }
                    None => x.fill(0.0),
                }
                // a reset is not integration; re-anchor the interval deltas
                for (process, monitor) in model.hazards.iter().zip(monitors.iter_mut()) {
                    monitor.resync(x[process.cmt()]);
                }
                for (process, tally) in model.counting.iter().zip(tallies.iter_mut()) {
                    tally.resync(x[process.cmt()]);
                }
            }
            Event::Protocol(protocol) => {
                (model.protocols[protocol.action()])(&mut params, &mut x, time);
            }
            Event::Bolus(bolus) => {
                x[bolus.input()] += bolus.amount();
            }
            Event::Infusion(_) => {
                // forcing is applied through the rate vector during
                // integration; nothing to do at the start time
            }
            Event::Observation(obs) => {
                if x.iter().any(|value| !value.is_finite()) {
                    return Err(PharmsimError::NonFiniteState {
                        id: subject.id().clone(),
                        time,
                    });
                }

                let mut survival = Vec::with_capacity(model.hazards.len());
                let mut terminated: Option<String> = None;
                for (process, monitor) in model.hazards.iter().zip(monitors.iter_mut()) {
                    let cumhaz = x[process.cmt()].max(0.0);
                    survival.push(monitor.survival(cumhaz));
                    if monitor.check(process, cumhaz, time, rng) {
                        if process.is_terminal() {
                            terminated = Some(process.name().to_string());
                        } else if process.is_recurrent() {
                            x[process.cmt()] = 0.0;
                            monitor.resync(0.0);
                        }
                    }
                }

                for (process, tally) in model.counting.iter().zip(tallies.iter_mut()) {
                    tally.step(process, x[process.cmt()].max(0.0), rng)?;
                }

                if let (Some(multistate), Some(occupancy)) =
                    (&model.multistate, occupancy.as_mut())
                {
                    let dt = time - last_eval;
                    if dt > 0.0 {
                        multistate.step(
                            occupancy, &params, &x, last_eval, dt, covariates, rng,
                        );
                    }
                    if multistate.is_terminal(occupancy.current()) && terminated.is_none() {
                        terminated = Some(format!("state {}", occupancy.current()));
                    }
                }

                let outputs = model.outputs(&x, &params, time, covariates);
                rows.push(Row {
                    time,
                    outeq: obs.outeq(),
                    value: outputs[obs.outeq()],
                    state: x.iter().copied().collect(),
                    survival,
                    occupancy: occupancy.as_ref().map(|occupancy| occupancy.current()),
                    counts: tallies.iter().map(|tally| tally.count()).collect(),
                });
                last_eval = time;

                if let Some(process) = terminated {
                    status = Status::Terminated { time, process };
                    break 'schedule;
                }
            }
        }
    }

    Ok(SubjectResult::new(
        subject.id().clone(),
        status,
        etas.iter().copied().collect(),
        frailties,
        parameters_snapshot,
        rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Covariates, SubjectBuilderExt};
    use crate::fetch_params;
    use crate::randeff::ParameterModel;
    use crate::simulator::T;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn one_compartment(x: &V, p: &V, _t: T, dx: &mut V, rateiv: &V, _cov: &Covariates) {
        fetch_params!(p, ke);
        dx[0] = rateiv[0] - ke * x[0];
    }

    fn no_init(_p: &V, _t: T, _cov: &Covariates, _x: &mut V) {}

    fn amount_out(x: &V, _p: &V, _t: T, _cov: &Covariates, y: &mut V) {
        y[0] = x[0];
    }

    fn model() -> Model {
        Model::new(one_compartment, no_init, amount_out, (1, 1))
            .with_parameters(ParameterModel::new().fixed("ke", 0.3))
    }

    fn run(model: &Model, subject: &Subject) -> SubjectResult {
        let settings = Settings {
            rtol: 1e-9,
            atol: 1e-11,
            ..Settings::default()
        };
        let mut rng = StdRng::seed_from_u64(settings.seed);
        simulate_subject(model, subject, &settings, &mut rng, None).unwrap()
    }

    #[test]
    fn test_bolus_decay_matches_analytic() {
        let subject = Subject::builder("one")
            .bolus(0.0, 100.0, 0)
            .observation(2.0, 0)
            .observation(5.0, 0)
            .build();
        let result = run(&model(), &subject);

        assert_eq!(*result.status(), Status::Completed);
        let observations = result.observations(0);
        assert_relative_eq!(observations[0].1, 100.0 * (-0.6f64).exp(), epsilon = 1e-5);
        assert_relative_eq!(observations[1].1, 100.0 * (-1.5f64).exp(), epsilon = 1e-5);
    }

    #[test]
    fn test_dose_applies_before_same_time_observation() {
        let subject = Subject::builder("tie")
            .observation(0.0, 0)
            .bolus(0.0, 100.0, 0)
            .build();
        let result = run(&model(), &subject);
        // precedence puts the bolus first, so the observation sees the dose
        assert_relative_eq!(result.rows()[0].value, 100.0);
    }

    #[test]
    fn test_infusion_breakpoint_is_respected() {
        let subject = Subject::builder("inf")
            .infusion(0.0, 100.0, 0, 2.0)
            .observation(1.0, 0)
            .observation(2.0, 0)
            .observation(6.0, 0)
            .build();
        let result = run(&model(), &subject);

        // during a constant-rate infusion: x(t) = R/ke (1 - exp(-ke t))
        let rate: f64 = 50.0;
        let ke: f64 = 0.3;
        let at = |t: f64| rate / ke * (1.0 - (-ke * t).exp());
        let observations = result.observations(0);
        assert_relative_eq!(observations[0].1, at(1.0), epsilon = 1e-4);
        assert_relative_eq!(observations[1].1, at(2.0), epsilon = 1e-4);
        assert_relative_eq!(
            observations[2].1,
            at(2.0) * (-ke * 4.0).exp(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_reset_zeroes_compartments() {
        let subject = Subject::builder("reset")
            .bolus(0.0, 100.0, 0)
            .reset(4.0)
            .observation(4.0, 0)
            .build();
        let result = run(&model(), &subject);
        assert_relative_eq!(result.rows()[0].value, 0.0);
    }

    #[test]
    fn test_protocol_changes_elimination() {
        fn stop_elimination(p: &mut V, _x: &mut V, _t: T) {
            p[0] = 0.0;
        }
        let model = model().with_protocol(stop_elimination);
        let subject = Subject::builder("protocol")
            .bolus(0.0, 100.0, 0)
            .observation(2.0, 0)
            .protocol(2.0, 0)
            .observation(10.0, 0)
            .build();
        let result = run(&model, &subject);

        let observations = result.observations(0);
        // no elimination after the protocol trigger at t=2
        assert_relative_eq!(observations[0].1, observations[1].1, epsilon = 1e-5);
        assert_relative_eq!(observations[0].1, 100.0 * (-0.6f64).exp(), epsilon = 1e-5);
    }

    #[test]
    fn test_lag_shifts_absorption() {
        use std::collections::HashMap;
        fn lag(_p: &V, _t: T, _cov: &Covariates) -> HashMap<usize, f64> {
            HashMap::from([(0, 1.0)])
        }
        let model = model().with_lag(lag);
        let subject = Subject::builder("lagged")
            .bolus(0.0, 100.0, 0)
            .observation(0.5, 0)
            .observation(1.5, 0)
            .build();
        let result = run(&model, &subject);

        let observations = result.observations(0);
        // before the lagged dose arrives, nothing is in the system
        assert_relative_eq!(observations[0].1, 0.0);
        assert_relative_eq!(observations[1].1, 100.0 * (-0.15f64).exp(), epsilon = 1e-5);
    }

    #[test]
    fn test_cancellation_stops_early() {
        let subject = Subject::builder("cancelled")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 0)
            .build();
        let flag = AtomicBool::new(true);
        let settings = Settings::default();
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let result =
            simulate_subject(&model(), &subject, &settings, &mut rng, Some(&flag)).unwrap();
        assert!(matches!(result.status(), Status::Cancelled { .. }));
        assert!(result.rows().is_empty());
    }
}
