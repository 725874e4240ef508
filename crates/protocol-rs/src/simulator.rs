//! Simulation passes over a set of protocols.
//!
//! A pass runs in three phases per parameter set, each dispatched to the
//! rayon pool and joined before the next:
//!
//! 1. every unique epoch queries the model and is solved
//! 2. every condition cell is simulated
//! 3. every cell's derived traces and summary points are evaluated
//!
//! Summary references are aligned once all parameter sets are done.

use crate::epoch::{EpochRegistry, UniqueEpoch};
use crate::monte_carlo::{probability_from_chains, simulate_chains};
use crate::protocol::{ConditionCell, Protocol, Waveform};
use crate::spectral::spectral_probability;
use crate::stimulus::SampleWindow;
use crate::summary::{Summary, TraceBindings};
use clamp_core::{AbortFlag, ClampError, Expression, PassOutcome, Result};
use clamp_markov::KineticModel;
use ndarray::{s, Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Name of the derived charge-current trace
pub const CHARGE_CURRENT: &str = "charge_current";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    #[default]
    Spectral,
    MonteCarlo,
}

impl std::fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverMethod::Spectral => write!(f, "spectral"),
            SolverMethod::MonteCarlo => write!(f, "monte carlo"),
        }
    }
}

/// Options for a simulation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    pub method: SolverMethod,
    /// Trajectories per condition and pass
    pub monte_carlo_runs: usize,
    /// Append new trajectories to those of earlier passes
    pub accumulate_runs: bool,
    /// Rebuild occupancy from trajectories right after simulating
    pub sample_runs: bool,
    pub seed: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            method: SolverMethod::Spectral,
            monte_carlo_runs: 1000,
            accumulate_runs: false,
            sample_runs: true,
            seed: 0,
        }
    }
}

/// Runs a kinetic model through a set of protocols
pub struct Simulator<M: KineticModel> {
    model: M,
    pub protocols: Vec<Protocol>,
    pub options: SimulationOptions,
    registry: EpochRegistry,
    state_names: Vec<String>,
}

impl<M: KineticModel> Simulator<M> {
    pub fn new(model: M, protocols: Vec<Protocol>, options: SimulationOptions) -> Self {
        Self {
            model,
            protocols,
            options,
            registry: EpochRegistry::new(),
            state_names: Vec::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn unique_epochs(&self) -> &[UniqueEpoch] {
        self.registry.as_slice()
    }

    pub fn get_protocol(&self, name: &str) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.name == name)
    }

    /// Rebuild condition cells and the unique-epoch registry
    pub fn init(&mut self) -> Result<()> {
        self.state_names = self.model.state_names();
        self.registry.clear();
        for (index, protocol) in self.protocols.iter_mut().enumerate() {
            protocol.init(&mut self.registry, index, &self.options)?;
        }
        Ok(())
    }

    /// `init` followed by `run`
    pub fn simulate(&mut self, abort: &AbortFlag) -> Result<PassOutcome> {
        self.init()?;
        self.run(abort)
    }

    /// Run one pass over every parameter set. Expects a prior `init`.
    pub fn run(&mut self, abort: &AbortFlag) -> Result<PassOutcome> {
        let started = Instant::now();
        let groups = self.group_indexes()?;

        for set in 0..self.model.num_parameter_sets() {
            let phase = Instant::now();
            if !self.registry.solve_all(&self.model, set, self.options.method, abort)? {
                return Ok(PassOutcome::Aborted);
            }
            log::debug!(
                "set {}: solved {} unique epochs in {:?}",
                set,
                self.registry.len(),
                phase.elapsed()
            );

            let phase = Instant::now();
            if self.simulate_cells(set, abort)?.is_aborted() {
                return Ok(PassOutcome::Aborted);
            }
            log::debug!("set {}: simulated conditions in {:?}", set, phase.elapsed());

            let context = TraceContext {
                set,
                state_names: &self.state_names,
                parameters: self.model.parameters(set),
                groups: &groups,
                unique: self.registry.as_slice(),
                abort,
            };
            for protocol in self.protocols.iter_mut() {
                if evaluate_protocol(protocol, &context)?.is_aborted() {
                    return Ok(PassOutcome::Aborted);
                }
            }
        }

        for protocol in self.protocols.iter_mut() {
            protocol.align_summary_references();
        }
        log::info!(
            "{} pass over {} protocol(s) finished in {:?}",
            self.options.method,
            self.protocols.len(),
            started.elapsed()
        );
        Ok(PassOutcome::Completed)
    }

    /// Sum of every protocol's cost
    pub fn cost(&self) -> f64 {
        self.protocols.iter().map(|p| p.cost(&self.state_names)).sum()
    }

    /// Largest deviation of an occupancy row sum from one
    pub fn max_probability_error(&self) -> f64 {
        self.protocols
            .iter()
            .flat_map(Protocol::cells)
            .map(ConditionCell::max_probability_error)
            .fold(0.0, f64::max)
    }

    fn group_indexes(&self) -> Result<Vec<(String, Vec<usize>)>> {
        self.model
            .state_groups()
            .into_iter()
            .map(|group| {
                let indexes = group
                    .states
                    .iter()
                    .map(|state| {
                        self.state_names.iter().position(|s| s == state).ok_or_else(|| {
                            ClampError::ModelError(format!(
                                "state group '{}' names unknown state '{}'",
                                group.name, state
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((group.name, indexes))
            })
            .collect()
    }

    fn simulate_cells(&mut self, set: usize, abort: &AbortFlag) -> Result<PassOutcome> {
        let unique = self.registry.as_slice();
        let options = &self.options;
        let mut jobs: Vec<(bool, &mut ConditionCell)> = self
            .protocols
            .iter_mut()
            .flat_map(|p| {
                let equilibrated = p.start_equilibrated;
                p.cells.iter_mut().flatten().map(move |cell| (equilibrated, cell))
            })
            .collect();

        jobs.par_iter_mut()
            .try_for_each(|(equilibrated, cell)| simulate_cell(cell, set, unique, options, *equilibrated, abort))?;

        Ok(if abort.is_aborted() {
            PassOutcome::Aborted
        } else {
            PassOutcome::Completed
        })
    }
}

fn simulate_cell(
    cell: &mut ConditionCell,
    set: usize,
    unique: &[UniqueEpoch],
    options: &SimulationOptions,
    start_equilibrated: bool,
    abort: &AbortFlag,
) -> Result<()> {
    let num_states = match cell.epochs.first() {
        Some(epoch) => unique[epoch.unique].num_states(),
        None => return Ok(()),
    };
    while cell.probability.len() <= set {
        cell.probability.push(Array2::zeros((0, 0)));
    }

    match options.method {
        SolverMethod::Spectral => {
            spectral_probability(
                &cell.time,
                &cell.epochs,
                unique,
                start_equilibrated,
                abort,
                &mut cell.probability[set],
            )?;
        }
        SolverMethod::MonteCarlo => {
            while cell.events.len() <= set {
                cell.events.push(Vec::new());
            }
            if !options.accumulate_runs {
                cell.events[set].clear();
            }
            let outcome = simulate_chains(
                &cell.time,
                cell.end_time,
                &cell.epochs,
                unique,
                start_equilibrated,
                options.monte_carlo_runs,
                &mut cell.rng,
                abort,
                &mut cell.events[set],
            )?;
            cell.probability[set] = Array2::zeros((0, 0));
            if outcome.is_completed() && options.sample_runs {
                if let Some(p) = probability_from_chains(&cell.time, cell.end_time, num_states, &cell.events[set], abort) {
                    cell.probability[set] = p;
                }
            }
        }
    }
    Ok(())
}

/// Read-only inputs of the trace evaluation phase
struct TraceContext<'a> {
    set: usize,
    state_names: &'a [String],
    parameters: Vec<(String, f64)>,
    groups: &'a [(String, Vec<usize>)],
    unique: &'a [UniqueEpoch],
    abort: &'a AbortFlag,
}

type SummaryPoint = (usize, usize, usize, (f64, f64));

fn evaluate_protocol(protocol: &mut Protocol, context: &TraceContext<'_>) -> Result<PassOutcome> {
    let rows = protocol.cells.len();
    let cols = protocol.cells.first().map_or(0, Vec::len);
    let Protocol {
        cells,
        waveforms,
        summaries,
        ..
    } = protocol;

    for summary in summaries.iter_mut().filter(|s| s.active) {
        summary.reset(context.set, rows, cols);
    }

    let points: Vec<Vec<SummaryPoint>> = {
        let waveforms: &[Waveform] = waveforms;
        let summaries: &[Summary] = summaries;
        cells
            .par_iter_mut()
            .flat_map(|row| row.par_iter_mut())
            .map(|cell| evaluate_cell(cell, waveforms, summaries, context))
            .collect::<Result<Vec<_>>>()?
    };
    if context.abort.is_aborted() {
        return Ok(PassOutcome::Aborted);
    }

    for (index, row, col, point) in points.into_iter().flatten() {
        summaries[index].store(context.set, row, col, point);
    }
    for summary in summaries.iter_mut().filter(|s| s.active) {
        summary.normalize(context.set);
    }
    Ok(PassOutcome::Completed)
}

/// Occupancy-weighted sum of a per-state quantity, epoch by epoch
fn state_weighted_trace<'a>(
    cell: &ConditionCell,
    probability: &Array2<f64>,
    per_state: impl Fn(&'a UniqueEpoch) -> Option<&'a Array1<f64>>,
    unique: &'a [UniqueEpoch],
) -> Array1<f64> {
    let mut trace = Array1::zeros(cell.num_pts());
    for epoch in &cell.epochs {
        if let Some(values) = per_state(&unique[epoch.unique]) {
            let range = epoch.first_pt..epoch.first_pt + epoch.num_pts;
            let block = probability.slice(s![range.clone(), ..]);
            trace.slice_mut(s![range]).assign(&block.dot(values));
        }
    }
    trace
}

fn evaluate_cell(
    cell: &mut ConditionCell,
    waveforms: &[Waveform],
    summaries: &[Summary],
    context: &TraceContext<'_>,
) -> Result<Vec<SummaryPoint>> {
    let set = context.set;
    let num_pts = cell.num_pts();
    let num_states = match cell.epochs.first() {
        Some(epoch) => context.unique[epoch.unique].num_states(),
        None => return Ok(Vec::new()),
    };

    // Occupancy from trajectories when it was not sampled after simulating
    let has_probability = cell
        .probability
        .get(set)
        .map_or(false, |p| p.dim() == (num_pts, num_states));
    if !has_probability {
        if let Some(chains) = cell.events.get(set) {
            match probability_from_chains(&cell.time, cell.end_time, num_states, chains, context.abort) {
                Some(p) => {
                    while cell.probability.len() <= set {
                        cell.probability.push(Array2::zeros((0, 0)));
                    }
                    cell.probability[set] = p;
                }
                None => return Ok(Vec::new()),
            }
        }
    }
    let probability = cell
        .probability
        .get(set)
        .filter(|p| p.dim() == (num_pts, num_states));

    let mut traces: BTreeMap<String, Array1<f64>> = BTreeMap::new();
    let mut bindings = TraceBindings::new();
    for (name, value) in &context.parameters {
        bindings.scalar(name, *value);
    }
    bindings.series("t", cell.time.clone());
    for (name, stimulus) in &cell.stimuli {
        bindings.series(name, stimulus.clone());
    }

    if let Some(probability) = probability {
        for (i, name) in context.state_names.iter().enumerate() {
            bindings.series(name, probability.column(i).to_owned());
        }

        let mut attribute_names: Vec<&String> = Vec::new();
        for epoch in &cell.epochs {
            for name in context.unique[epoch.unique].attributes.keys() {
                if !attribute_names.contains(&name) {
                    attribute_names.push(name);
                }
            }
        }
        for name in attribute_names {
            let trace = state_weighted_trace(cell, probability, |u| u.attributes.get(name), context.unique);
            traces.insert(name.clone(), trace);
        }

        let has_charges = cell.epochs.iter().any(|e| context.unique[e.unique].has_charges);
        if has_charges {
            let trace = state_weighted_trace(cell, probability, |u| Some(&u.charge_current), context.unique);
            traces.insert(CHARGE_CURRENT.to_string(), trace);
        }
        for (name, trace) in &traces {
            bindings.series(name, trace.clone());
        }

        for (name, indexes) in context.groups {
            let mut trace = Array1::<f64>::zeros(num_pts);
            for &i in indexes {
                trace += &probability.column(i);
            }
            bindings.series(name, trace.clone());
            traces.insert(name.clone(), trace);
        }
    }

    for waveform in waveforms.iter().filter(|w| w.active) {
        if context.abort.is_aborted() {
            return Ok(Vec::new());
        }
        let scope = bindings.scope(SampleWindow {
            first: 0,
            len: num_pts,
        });
        let trace = Expression::parse(&waveform.expr)?
            .eval(&scope)?
            .into_series(num_pts)
            .map_err(|e| {
                ClampError::ConfigError(format!("invalid dimensions for waveform '{}': {}", waveform.expr, e))
            })?;
        bindings.series(&waveform.name, trace.clone());
        traces.insert(waveform.name.clone(), trace);
    }

    let mut points = Vec::new();
    for (index, summary) in summaries.iter().enumerate() {
        if context.abort.is_aborted() {
            return Ok(Vec::new());
        }
        if !summary.active {
            continue;
        }
        let windows = cell.summary_windows.get(index).copied().unwrap_or_default();
        let point = summary.evaluate(&bindings, cell.row, cell.col, windows)?;
        points.push((index, cell.row, cell.col, point));
    }

    while cell.waveforms.len() <= set {
        cell.waveforms.push(BTreeMap::new());
    }
    cell.waveforms[set] = traces;
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::Stimulus;
    use clamp_markov::models;

    fn two_state_protocol() -> Protocol {
        Protocol::new("relax", 2.0, 0.01)
    }

    #[test]
    fn test_spectral_two_state() {
        let mut sim = Simulator::new(
            models::two_state(1.0, 2.0),
            vec![two_state_protocol()],
            SimulationOptions::default(),
        );
        assert!(sim.simulate(&AbortFlag::new()).unwrap().is_completed());

        let cell = sim.protocols[0].cell(0, 0).unwrap();
        let p = &cell.probability[0];
        for (k, &t) in cell.time.iter().enumerate() {
            let expected = 2.0 / 3.0 + (-3.0 * t).exp() / 3.0;
            assert!((p[[k, 0]] - expected).abs() < 1e-9);
        }
        assert!(sim.max_probability_error() < 1e-9);
    }

    #[test]
    fn test_attribute_and_waveform_traces() {
        let mut protocol = two_state_protocol();
        protocol.add_waveform(crate::protocol::Waveform::new("I", "k12 * open"));
        let mut sim = Simulator::new(models::two_state(1.0, 2.0), vec![protocol], SimulationOptions::default());
        sim.simulate(&AbortFlag::new()).unwrap();

        let cell = sim.protocols[0].cell(0, 0).unwrap();
        let open = &cell.waveforms[0]["open"];
        let current = &cell.waveforms[0]["I"];
        let p = &cell.probability[0];
        for k in [0, 50, 199] {
            assert!((open[k] - p[[k, 1]]).abs() < 1e-12);
            assert!((current[k] - open[k]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bad_waveform_fails_pass() {
        let mut protocol = two_state_protocol();
        protocol.add_waveform(crate::protocol::Waveform::new("bad", "sum(C)"));
        protocol.add_waveform(crate::protocol::Waveform::new("worse", "nope + 1"));
        let mut sim = Simulator::new(models::two_state(1.0, 2.0), vec![protocol], SimulationOptions::default());
        // A scalar broadcasts, an unknown variable does not
        assert!(sim.simulate(&AbortFlag::new()).is_err());
    }

    #[test]
    fn test_groups_and_charge_current() {
        let mut protocol = Protocol::new("gating", 0.05, 0.001);
        protocol.add_stimulus(Stimulus::pulse("V", 0.0, 1.0, -80.0));
        protocol.add_stimulus(Stimulus::pulse("V", 0.01, 0.02, 100.0));
        let mut sim = Simulator::new(models::three_state_gating(), vec![protocol], SimulationOptions::default());
        sim.simulate(&AbortFlag::new()).unwrap();

        let cell = sim.protocols[0].cell(0, 0).unwrap();
        let closed = &cell.waveforms[0]["closed"];
        let p = &cell.probability[0];
        assert!((closed[20] - (p[[20, 0]] + p[[20, 1]])).abs() < 1e-12);
        assert!(cell.waveforms[0].contains_key(CHARGE_CURRENT));
        assert_eq!(sim.unique_epochs().len(), 2);
    }

    #[test]
    fn test_monte_carlo_lazy_probability() {
        let options = SimulationOptions {
            method: SolverMethod::MonteCarlo,
            monte_carlo_runs: 200,
            sample_runs: false,
            seed: 7,
            ..SimulationOptions::default()
        };
        let mut sim = Simulator::new(models::two_state(1.0, 2.0), vec![two_state_protocol()], options);
        sim.simulate(&AbortFlag::new()).unwrap();

        let cell = sim.protocols[0].cell(0, 0).unwrap();
        assert_eq!(cell.events[0].len(), 200);
        assert_eq!(cell.probability[0].dim(), (201, 2));
        assert!(cell.waveforms[0].contains_key("open"));
        assert!(sim.max_probability_error() < 1e-9);
    }

    #[test]
    fn test_accumulated_runs() {
        let options = SimulationOptions {
            method: SolverMethod::MonteCarlo,
            monte_carlo_runs: 50,
            accumulate_runs: true,
            ..SimulationOptions::default()
        };
        let mut sim = Simulator::new(models::two_state(1.0, 2.0), vec![two_state_protocol()], options);
        sim.simulate(&AbortFlag::new()).unwrap();
        sim.simulate(&AbortFlag::new()).unwrap();
        assert_eq!(sim.protocols[0].cell(0, 0).unwrap().events[0].len(), 100);
    }

    #[test]
    fn test_aborted_pass() {
        let abort = AbortFlag::new();
        abort.abort();
        let mut sim = Simulator::new(
            models::two_state(1.0, 2.0),
            vec![two_state_protocol()],
            SimulationOptions::default(),
        );
        assert_eq!(sim.simulate(&abort).unwrap(), PassOutcome::Aborted);
    }

    #[test]
    fn test_options_from_json() {
        let options: SimulationOptions = serde_json::from_str(r#"{ "method": "monte_carlo", "seed": 3 }"#).unwrap();
        assert_eq!(options.method, SolverMethod::MonteCarlo);
        assert_eq!(options.monte_carlo_runs, 1000);
        assert!(options.sample_runs);
    }
}
