//! Free-parameter fitting.
//!
//! Bounded parameters are searched in an angular coordinate
//! `θ = asin(2 (x - min) / (max - min) - 1)`, which maps the whole real
//! line back into `[min, max]`, so argmin's Nelder-Mead simplex can run
//! unconstrained.

use crate::simulator::Simulator;
use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error, Executor, IterState, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin::solver::neldermead::NelderMead;
use clamp_core::{AbortFlag, ClampError, PassOutcome, Result};
use clamp_markov::{FreeParameter, KineticModel};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::sync::mpsc::Sender;

/// Options for [`Simulator::optimize`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    pub max_iterations: usize,
    /// Stop once the standard deviation of the simplex costs falls below this
    pub tolerance: f64,
    /// Initial simplex step per angular coordinate
    pub initial_step: f64,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-8,
            initial_step: PI / 50.0,
        }
    }
}

/// Sent once per iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerProgress {
    pub iteration: usize,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub cost: f64,
    pub converged: bool,
    pub aborted: bool,
    /// Best value of every free parameter
    pub parameters: Vec<(String, f64)>,
    pub message: Option<String>,
}

fn bounds(min: Option<f64>, max: Option<f64>) -> Option<(f64, f64)> {
    match (min, max) {
        (Some(lo), Some(hi)) if hi > lo => Some((lo, hi)),
        _ => None,
    }
}

pub fn linear_to_angular(x: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    match bounds(min, max) {
        Some((lo, hi)) => (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0).asin(),
        None => x,
    }
}

pub fn angular_to_linear(theta: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    match bounds(min, max) {
        Some((lo, hi)) => lo + (hi - lo) * (theta.sin() + 1.0) / 2.0,
        None => theta,
    }
}

/// `start` and `start + step · e_i` for every coordinate
pub fn initial_simplex(start: &[f64], step: f64) -> Vec<Vec<f64>> {
    let mut vertices = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut v = start.to_vec();
        v[i] += step;
        vertices.push(v);
    }
    vertices
}

type SimplexState = IterState<Vec<f64>, (), (), (), (), f64>;

/// Nelder-Mead that also stops once the abort flag is raised
struct Abortable<'a> {
    inner: NelderMead<Vec<f64>, f64>,
    abort: &'a AbortFlag,
}

impl<O> Solver<O, SimplexState> for Abortable<'_>
where
    O: CostFunction<Param = Vec<f64>, Output = f64>,
{
    const NAME: &'static str = "Nelder-Mead";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        state: SimplexState,
    ) -> std::result::Result<(SimplexState, Option<KV>), Error> {
        self.inner.init(problem, state)
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        state: SimplexState,
    ) -> std::result::Result<(SimplexState, Option<KV>), Error> {
        self.inner.next_iter(problem, state)
    }

    fn terminate(&mut self, state: &SimplexState) -> TerminationStatus {
        if self.abort.is_aborted() {
            return TerminationStatus::Terminated(TerminationReason::SolverExit("aborted".to_string()));
        }
        <NelderMead<Vec<f64>, f64> as Solver<O, SimplexState>>::terminate(&mut self.inner, state)
    }
}

/// Forwards each iteration's best cost to the progress channel
struct ProgressSink {
    sender: Option<Sender<OptimizerProgress>>,
    iteration: usize,
}

impl Observe<SimplexState> for ProgressSink {
    fn observe_iter(&mut self, state: &SimplexState, _kv: &KV) -> std::result::Result<(), Error> {
        self.iteration += 1;
        let cost = state.get_best_cost();
        log::debug!("iteration {}: cost {:.6e}", self.iteration, cost);
        if let Some(tx) = &self.sender {
            let _ = tx.send(OptimizerProgress {
                iteration: self.iteration,
                cost,
            });
        }
        Ok(())
    }
}

fn into_clamp_error(error: Error) -> ClampError {
    match error.downcast::<ClampError>() {
        Ok(error) => error,
        Err(other) => ClampError::NumericalError(other.to_string()),
    }
}

/// Result of one simplex search
#[derive(Debug, Clone, PartialEq)]
pub struct SimplexOutcome {
    pub best: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimize `problem` from `start` with argmin's Nelder-Mead.
///
/// Ends on convergence, after `max_iterations`, or once `abort` is raised.
pub fn minimize<O>(
    problem: O,
    start: &[f64],
    options: &OptimizerOptions,
    abort: &AbortFlag,
    progress: Option<&Sender<OptimizerProgress>>,
) -> Result<SimplexOutcome>
where
    O: CostFunction<Param = Vec<f64>, Output = f64>,
{
    let inner = NelderMead::new(initial_simplex(start, options.initial_step))
        .with_sd_tolerance(options.tolerance)
        .map_err(into_clamp_error)?;
    let sink = ProgressSink {
        sender: progress.cloned(),
        iteration: 0,
    };

    let result = Executor::new(problem, Abortable { inner, abort })
        .configure(|state| state.max_iters(options.max_iterations as u64))
        .add_observer(sink, ObserverMode::Always)
        .run()
        .map_err(into_clamp_error)?;

    let state = result.state();
    Ok(SimplexOutcome {
        best: state.get_best_param().cloned().unwrap_or_else(|| start.to_vec()),
        cost: state.get_best_cost(),
        iterations: state.get_iter() as usize,
        converged: matches!(
            state.get_termination_status(),
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        ),
    })
}

fn to_linear(theta: &[f64], free: &[FreeParameter]) -> Vec<f64> {
    theta
        .iter()
        .zip(free)
        .map(|(&t, p)| angular_to_linear(t, p.min, p.max))
        .collect()
}

/// Simulation cost as a function of the angular coordinates
struct AngularCost<'a, M: KineticModel> {
    simulator: RefCell<&'a mut Simulator<M>>,
    free: &'a [FreeParameter],
    abort: &'a AbortFlag,
}

impl<M: KineticModel> CostFunction for AngularCost<'_, M> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> std::result::Result<Self::Output, Error> {
        if self.abort.is_aborted() {
            return Ok(f64::INFINITY);
        }
        let mut sim = self.simulator.borrow_mut();
        sim.model_mut().set_free_parameters(&to_linear(theta, self.free))?;
        let cost = match sim.simulate(self.abort)? {
            PassOutcome::Completed => sim.cost(),
            PassOutcome::Aborted => f64::INFINITY,
        };
        Ok(if cost.is_finite() { cost } else { f64::INFINITY })
    }
}

impl<M: KineticModel> Simulator<M> {
    /// Fit the model's free parameters to every reference in the protocols.
    ///
    /// Each candidate runs a full pass. On return the best point found is
    /// applied to the model; unless aborted it is also re-simulated so the
    /// protocols hold the traces the reported cost belongs to.
    pub fn optimize(
        &mut self,
        options: &OptimizerOptions,
        abort: &AbortFlag,
        progress: Option<&Sender<OptimizerProgress>>,
    ) -> Result<OptimizationReport> {
        let free = self.model().free_parameters();
        if free.is_empty() {
            return Err(ClampError::ConfigError("no free parameters to optimize".to_string()));
        }
        let start: Vec<f64> = free
            .iter()
            .map(|p| linear_to_angular(p.value, p.min, p.max))
            .collect();
        log::info!("optimizing {} free parameter(s)", free.len());

        let problem = AngularCost {
            simulator: RefCell::new(&mut *self),
            free: &free,
            abort,
        };
        let outcome = minimize(problem, &start, options, abort, progress)?;

        let values = to_linear(&outcome.best, &free);
        let aborted = abort.is_aborted();
        self.model_mut().set_free_parameters(&values)?;
        let cost = if aborted {
            outcome.cost
        } else {
            self.simulate(abort)?;
            self.cost()
        };

        let iterations = outcome.iterations;
        let converged = outcome.converged && !aborted;
        let message = if aborted {
            Some("optimization aborted".to_string())
        } else if !converged {
            log::warn!(
                "optimizer did not converge in {} iterations (cost {:.6e})",
                iterations,
                cost
            );
            Some(format!("no convergence after {} iterations", iterations))
        } else {
            None
        };
        log::info!("optimization finished after {} iterations, cost {:.6e}", iterations, cost);

        Ok(OptimizationReport {
            iterations,
            cost,
            converged,
            aborted,
            parameters: free.iter().map(|p| p.name.clone()).zip(values).collect(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic;

    impl CostFunction for Quadratic {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Self::Param) -> std::result::Result<f64, Error> {
            Ok((x[0] - 1.0).powi(2) + 10.0 * (x[1] + 2.0).powi(2))
        }
    }

    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Self::Param) -> std::result::Result<f64, Error> {
            Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
        }
    }

    struct Failing;

    impl CostFunction for Failing {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, _x: &Self::Param) -> std::result::Result<f64, Error> {
            Err(ClampError::ModelError("no rates".to_string()).into())
        }
    }

    fn options(tolerance: f64, max_iterations: usize, initial_step: f64) -> OptimizerOptions {
        OptimizerOptions {
            max_iterations,
            tolerance,
            initial_step,
        }
    }

    #[test]
    fn test_angular_round_trip() {
        for &x in &[1.0, 2.5, 7.0, 10.0] {
            let theta = linear_to_angular(x, Some(1.0), Some(10.0));
            assert!((angular_to_linear(theta, Some(1.0), Some(10.0)) - x).abs() < 1e-9);
        }
        assert_eq!(linear_to_angular(-3.0, None, Some(1.0)), -3.0);
        assert_eq!(angular_to_linear(42.0, None, None), 42.0);
    }

    #[test]
    fn test_angular_stays_in_bounds() {
        for i in -20..20 {
            let x = angular_to_linear(i as f64 * 0.7, Some(-2.0), Some(3.0));
            assert!((-2.0..=3.0).contains(&x));
        }
    }

    #[test]
    fn test_initial_simplex() {
        let simplex = initial_simplex(&[1.0, 2.0], 0.5);
        assert_eq!(simplex, vec![vec![1.0, 2.0], vec![1.5, 2.0], vec![1.0, 2.5]]);
    }

    #[test]
    fn test_minimize_quadratic() {
        let outcome = minimize(Quadratic, &[0.0, 0.0], &options(1e-14, 500, 0.5), &AbortFlag::new(), None).unwrap();
        assert!(outcome.converged);
        assert!((outcome.best[0] - 1.0).abs() < 1e-4);
        assert!((outcome.best[1] + 2.0).abs() < 1e-4);
        assert!(outcome.cost < 1e-8);
    }

    #[test]
    fn test_minimize_rosenbrock() {
        let outcome = minimize(Rosenbrock, &[-1.2, 1.0], &options(1e-16, 2000, 0.1), &AbortFlag::new(), None).unwrap();
        assert!((outcome.best[0] - 1.0).abs() < 1e-3);
        assert!((outcome.best[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_iteration_limit_and_progress() {
        let (tx, rx) = std::sync::mpsc::channel();
        let outcome = minimize(Rosenbrock, &[-1.2, 1.0], &options(0.0, 5, 0.1), &AbortFlag::new(), Some(&tx)).unwrap();
        drop(tx);
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 5);

        let updates: Vec<OptimizerProgress> = rx.iter().collect();
        assert_eq!(updates.len(), 5);
        assert_eq!(updates[4].iteration, 5);
        assert!(updates.windows(2).all(|w| w[1].cost <= w[0].cost));
    }

    #[test]
    fn test_raised_abort_stops_search() {
        let abort = AbortFlag::new();
        abort.abort();
        let outcome = minimize(Quadratic, &[0.0, 0.0], &options(0.0, 1000, 0.5), &abort, None).unwrap();
        assert!(!outcome.converged);
        assert!(outcome.iterations <= 1);
    }

    #[test]
    fn test_cost_error_is_propagated() {
        let result = minimize(Failing, &[0.0], &options(1e-8, 10, 0.1), &AbortFlag::new(), None);
        assert!(matches!(result, Err(ClampError::ModelError(_))));
    }

    #[test]
    fn test_options_defaults() {
        let options: OptimizerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.max_iterations, 500);
        assert!((options.initial_step - PI / 50.0).abs() < 1e-15);
    }
}
