//! Stimulus clamp protocol.
//!
//! A protocol is a grid of experimental conditions. Every timing and stimulus
//! parameter is a [`Grid`]; all grids are padded to a common `rows × cols`
//! before a pass, and each cell gets its own sampled traces, epochs and
//! reference data.

use crate::epoch::{decompose, Epoch, EpochRegistry};
use crate::monte_carlo::EventChain;
use crate::reference::{AlignedReference, ReferenceData};
use crate::simulator::{SimulationOptions, SolverMethod};
use crate::stimulus::{SampleWindow, Stimulus};
use crate::summary::Summary;
use clamp_core::{ClampError, Grid, Result, Time};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Derived trace defined by an expression over the cell's other traces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub name: String,
    pub expr: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Waveform {
    pub fn new(name: &str, expr: &str) -> Self {
        Self {
            name: name.to_string(),
            expr: expr.to_string(),
            active: true,
        }
    }
}

fn default_active() -> bool {
    true
}

fn default_weight() -> Grid<f64> {
    Grid::scalar(1.0)
}

/// One experimental condition of a protocol
#[derive(Debug, Clone)]
pub struct ConditionCell {
    pub row: usize,
    pub col: usize,
    pub time: Array1<Time>,
    /// May lie past the last sample
    pub end_time: Time,
    pub weight: Array1<f64>,
    pub stimuli: BTreeMap<String, Array1<f64>>,
    /// `false` for masked samples
    pub mask: Vec<bool>,
    pub epochs: Vec<Epoch>,
    /// Occupancy per parameter set, `samples × states`
    pub probability: Vec<Array2<f64>>,
    /// Monte Carlo trajectories per parameter set
    pub events: Vec<Vec<EventChain>>,
    /// Derived traces per parameter set
    pub waveforms: Vec<BTreeMap<String, Array1<f64>>>,
    /// Aligned reference per parameter set, keyed by trace name
    pub reference: Vec<BTreeMap<String, AlignedReference>>,
    /// (X, Y) windows of each summary
    pub summary_windows: Vec<(SampleWindow, SampleWindow)>,
    pub rng: StdRng,
}

impl ConditionCell {
    pub fn num_pts(&self) -> usize {
        self.time.len()
    }

    /// Trace named `name` for parameter set `set`.
    ///
    /// State occupancy is searched first, then stimuli, then derived traces.
    pub fn trace(&self, name: &str, set: usize, state_names: &[String]) -> Option<ArrayView1<'_, f64>> {
        if let Some(index) = state_names.iter().position(|s| s == name) {
            return self
                .probability
                .get(set)
                .filter(|p| p.ncols() > index && p.nrows() == self.num_pts())
                .map(|p| p.column(index));
        }
        if let Some(stimulus) = self.stimuli.get(name) {
            return Some(stimulus.view());
        }
        self.waveforms
            .get(set)
            .and_then(|w| w.get(name))
            .map(|w| w.view())
    }

    /// Weighted squared residual against every aligned reference
    pub fn cost(&self, state_names: &[String]) -> f64 {
        let mut cost = 0.0;
        for (set, references) in self.reference.iter().enumerate() {
            for (name, aligned) in references {
                let trace = match self.trace(name, set, state_names) {
                    Some(trace) => trace,
                    None => continue,
                };
                let end = (aligned.first + aligned.len()).min(trace.len());
                let mut sum = 0.0;
                for (k, reference) in (aligned.first..end).zip(aligned.values.iter()) {
                    sum += (trace[k] - reference).powi(2) * self.weight[k];
                }
                cost += sum * aligned.weight;
            }
        }
        cost
    }

    /// Largest deviation of any occupancy row sum from one
    pub fn max_probability_error(&self) -> f64 {
        let mut error: f64 = 0.0;
        for p in &self.probability {
            for row in p.rows() {
                error = error.max((row.sum() - 1.0).abs());
            }
        }
        error
    }
}

/// Grid of stimulus clamp conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    #[serde(default)]
    pub start: Grid<f64>,
    #[serde(default)]
    pub duration: Grid<f64>,
    #[serde(default)]
    pub sample_interval: Grid<f64>,
    #[serde(default = "default_weight")]
    pub weight: Grid<f64>,
    #[serde(default)]
    pub start_equilibrated: bool,
    #[serde(default)]
    pub stimuli: Vec<Stimulus>,
    #[serde(default)]
    pub waveforms: Vec<Waveform>,
    #[serde(default)]
    pub summaries: Vec<Summary>,
    #[serde(default)]
    pub reference_data: Vec<ReferenceData>,

    /// Condition cells of the current pass, `[row][col]`
    #[serde(skip)]
    pub cells: Vec<Vec<ConditionCell>>,
}

impl Protocol {
    pub fn new(name: &str, duration: f64, sample_interval: f64) -> Self {
        Self {
            name: name.to_string(),
            start: Grid::default(),
            duration: Grid::scalar(duration),
            sample_interval: Grid::scalar(sample_interval),
            weight: default_weight(),
            start_equilibrated: false,
            stimuli: Vec::new(),
            waveforms: Vec::new(),
            summaries: Vec::new(),
            reference_data: Vec::new(),
            cells: Vec::new(),
        }
    }

    pub fn add_stimulus(&mut self, stimulus: Stimulus) {
        self.stimuli.push(stimulus);
    }

    pub fn add_waveform(&mut self, waveform: Waveform) {
        self.waveforms.push(waveform);
    }

    pub fn add_summary(&mut self, summary: Summary) {
        self.summaries.push(summary);
    }

    pub fn add_reference_data(&mut self, data: ReferenceData) {
        self.reference_data.push(data);
    }

    pub fn get_stimulus(&self, name: &str) -> Option<&Stimulus> {
        self.stimuli.iter().find(|s| s.name == name)
    }

    pub fn get_waveform(&self, name: &str) -> Option<&Waveform> {
        self.waveforms.iter().find(|w| w.name == name)
    }

    pub fn get_summary(&self, name: &str) -> Option<&Summary> {
        self.summaries.iter().find(|s| s.name == name)
    }

    pub fn get_reference_data(&self, name: &str) -> Option<&ReferenceData> {
        self.reference_data.iter().find(|r| r.name == name)
    }

    /// (rows, cols) of the condition grid, at least 1 × 1
    pub fn dims(&self) -> (usize, usize) {
        let mut dims = vec![
            (1, 1),
            self.start.dims(),
            self.duration.dims(),
            self.sample_interval.dims(),
            self.weight.dims(),
        ];
        dims.extend(self.stimuli.iter().filter(|s| s.active).map(Stimulus::dims));
        clamp_core::grid::max_dims(dims)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&ConditionCell> {
        self.cells.get(row).and_then(|r| r.get(col))
    }

    pub fn cells(&self) -> impl Iterator<Item = &ConditionCell> {
        self.cells.iter().flatten()
    }

    /// Rebuild every condition cell for a new pass.
    ///
    /// Samples, stimuli and epochs are regenerated and epochs registered in
    /// `registry`. Monte Carlo trajectories and generator state carry over
    /// from the previous pass when runs accumulate.
    pub fn init(
        &mut self,
        registry: &mut EpochRegistry,
        protocol_index: usize,
        options: &SimulationOptions,
    ) -> Result<()> {
        let (rows, cols) = self.dims();
        let starts = self.start.padded(rows, cols, &0.0);
        let durations = self.duration.padded(rows, cols, &0.0);
        let intervals = self.sample_interval.padded(rows, cols, &0.0);
        let weights = self.weight.padded(rows, cols, &1.0);
        for stimulus in self.stimuli.iter_mut().filter(|s| s.active) {
            *stimulus = stimulus.padded(rows, cols);
        }
        for summary in self.summaries.iter_mut().filter(|s| s.active) {
            summary.pad(rows, cols);
        }

        let carry_over = options.accumulate_runs && options.method == SolverMethod::MonteCarlo;
        let mut previous = std::mem::take(&mut self.cells);

        let mut cells = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut cells_row = Vec::with_capacity(cols);
            for col in 0..cols {
                let start = starts.at(row, col).copied().unwrap_or(0.0);
                let duration = durations.at(row, col).copied().unwrap_or(0.0);
                let interval = intervals.at(row, col).copied().unwrap_or(0.0);
                let weight = weights.at(row, col).copied().unwrap_or(1.0);
                if interval <= 0.0 || duration < 0.0 || !interval.is_finite() || !duration.is_finite() {
                    return Err(ClampError::ConfigError(format!(
                        "protocol '{}' condition ({}, {}): sample interval must be positive and duration non-negative",
                        self.name, row, col
                    )));
                }

                let num_steps = (duration / interval + 1e-9).floor() as usize;
                let time = Array1::from_shape_fn(num_steps + 1, |i| start + i as f64 * interval);
                let num_pts = time.len();

                let mut weight = Array1::from_elem(num_pts, weight);
                let mut mask_waveform = Array1::<f64>::zeros(num_pts);
                let mut stimuli: BTreeMap<String, Array1<f64>> = BTreeMap::new();
                for stimulus in self.stimuli.iter().filter(|s| s.active) {
                    let waveform = stimulus.pulse_train(row, col).render(&time);
                    match stimulus.name.to_lowercase().as_str() {
                        "weight" => weight += &waveform,
                        "mask" => mask_waveform += &waveform,
                        _ => match stimuli.get_mut(&stimulus.name) {
                            Some(existing) => *existing += &waveform,
                            None => {
                                stimuli.insert(stimulus.name.clone(), waveform);
                            }
                        },
                    }
                }
                let mask = mask_waveform.iter().map(|&m| m == 0.0).collect();

                let epochs = decompose(&time, start + duration, &stimuli, registry);
                let summary_windows = self.summaries.iter().map(|s| s.windows(&time, row, col)).collect();

                let seed = options
                    .seed
                    .wrapping_add(((protocol_index as u64) << 32) + (row * cols + col) as u64);
                let mut cell = ConditionCell {
                    row,
                    col,
                    time,
                    end_time: start + duration,
                    weight,
                    stimuli,
                    mask,
                    epochs,
                    probability: Vec::new(),
                    events: Vec::new(),
                    waveforms: Vec::new(),
                    reference: Vec::new(),
                    summary_windows,
                    rng: StdRng::seed_from_u64(seed),
                };
                if carry_over {
                    if let Some(old) = previous.get_mut(row).and_then(|r| r.get_mut(col)) {
                        cell.events = std::mem::take(&mut old.events);
                        cell.rng = old.rng.clone();
                    }
                }
                cells_row.push(cell);
            }
            cells.push(cells_row);
        }
        self.cells = cells;

        self.align_condition_references()?;
        log::debug!(
            "protocol '{}': {} × {} conditions, {} unique epochs so far",
            self.name,
            rows,
            cols,
            registry.len()
        );
        Ok(())
    }

    /// Align every non-summary reference entry onto its condition traces
    fn align_condition_references(&mut self) -> Result<()> {
        let summary_names: Vec<String> = self.summaries.iter().map(|s| s.name.clone()).collect();
        let rows = self.cells.len();
        let cols = self.cells.first().map_or(0, Vec::len);

        for data in self.reference_data.iter_mut() {
            data.load()?;
            if summary_names.contains(&data.name) || data.row >= rows {
                continue;
            }
            for (i, pair) in data.column_pairs().into_iter().enumerate() {
                let col = data.col + i;
                if col >= cols {
                    break;
                }
                let cell = &mut self.cells[data.row][col];
                let x = cell.time.to_vec();
                if let Some(aligned) = data.align(pair, &x) {
                    while cell.reference.len() <= data.set {
                        cell.reference.push(BTreeMap::new());
                    }
                    cell.reference[data.set].insert(data.name.clone(), aligned);
                }
            }
        }
        Ok(())
    }

    /// Align summary reference entries against the current summary X values
    pub fn align_summary_references(&mut self) {
        for data in &self.reference_data {
            for summary in self.summaries.iter_mut().filter(|s| s.active && s.name == data.name) {
                summary.align_reference(data);
            }
        }
    }

    /// Condition cost plus summary cost
    pub fn cost(&self, state_names: &[String]) -> f64 {
        let cells: f64 = self.cells().map(|c| c.cost(state_names)).sum();
        let summaries: f64 = self.summaries.iter().filter(|s| s.active).map(Summary::cost).sum();
        cells + summaries
    }
}
