//! Stimulus waveforms.
//!
//! A stimulus is a train of pulses rendered onto a condition's sample grid.
//! Each pulse is either square or shaped by onset/offset expressions of `t`,
//! the time elapsed since the pulse onset (or offset).

use clamp_core::{Expression, Grid, Scope, Time, SNAP_EPSILON};
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};

/// Contiguous run of sample indexes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleWindow {
    pub first: usize,
    pub len: usize,
}

impl SampleWindow {
    pub fn end(&self) -> usize {
        self.first + self.len
    }
}

/// Index of the sample nearest to `target`, advanced by one when that
/// sample lies more than [`SNAP_EPSILON`] before it.
pub fn snap_index(time: &Array1<Time>, target: Time) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, &t) in time.iter().enumerate() {
        let dist = (t - target).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    if time.get(best).map_or(false, |&t| t < target - SNAP_EPSILON) {
        best += 1;
    }
    best
}

/// Samples falling in `[start, stop)`
pub fn window_in_range(time: &Array1<Time>, start: Time, stop: Time) -> SampleWindow {
    let first = snap_index(time, start);
    if first >= time.len() {
        return SampleWindow { first, len: 0 };
    }
    let end = snap_index(time, stop);
    SampleWindow {
        first,
        len: end.saturating_sub(first),
    }
}

/// Named pulse train, every parameter a condition grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    pub name: String,
    #[serde(default)]
    pub start: Grid<f64>,
    #[serde(default)]
    pub duration: Grid<f64>,
    #[serde(default)]
    pub amplitude: Grid<f64>,
    #[serde(default = "default_repetitions")]
    pub repetitions: Grid<u32>,
    #[serde(default)]
    pub period: Grid<f64>,
    #[serde(default)]
    pub onset_expr: Grid<String>,
    #[serde(default)]
    pub offset_expr: Grid<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_repetitions() -> Grid<u32> {
    Grid::scalar(1)
}

fn default_active() -> bool {
    true
}

impl Stimulus {
    /// Single square pulse
    pub fn pulse(name: &str, start: f64, duration: f64, amplitude: f64) -> Self {
        Self {
            name: name.to_string(),
            start: Grid::scalar(start),
            duration: Grid::scalar(duration),
            amplitude: Grid::scalar(amplitude),
            repetitions: default_repetitions(),
            period: Grid::default(),
            onset_expr: Grid::default(),
            offset_expr: Grid::default(),
            active: true,
        }
    }

    /// Largest grid size over all parameters
    pub fn dims(&self) -> (usize, usize) {
        clamp_core::grid::max_dims([
            self.start.dims(),
            self.duration.dims(),
            self.amplitude.dims(),
            self.repetitions.dims(),
            self.period.dims(),
            self.onset_expr.dims(),
            self.offset_expr.dims(),
        ])
    }

    /// Copy with every grid padded to `rows × cols`
    pub fn padded(&self, rows: usize, cols: usize) -> Self {
        Self {
            name: self.name.clone(),
            start: self.start.padded(rows, cols, &0.0),
            duration: self.duration.padded(rows, cols, &0.0),
            amplitude: self.amplitude.padded(rows, cols, &0.0),
            repetitions: self.repetitions.padded(rows, cols, &1),
            period: self.period.padded(rows, cols, &0.0),
            onset_expr: self.onset_expr.padded(rows, cols, &String::new()),
            offset_expr: self.offset_expr.padded(rows, cols, &String::new()),
            active: self.active,
        }
    }

    /// Parameters of one condition; expects a padded stimulus
    pub fn pulse_train(&self, row: usize, col: usize) -> PulseTrain {
        PulseTrain {
            start: self.start.at(row, col).copied().unwrap_or(0.0),
            duration: self.duration.at(row, col).copied().unwrap_or(0.0),
            amplitude: self.amplitude.at(row, col).copied().unwrap_or(0.0),
            repetitions: self.repetitions.at(row, col).copied().unwrap_or(1),
            period: self.period.at(row, col).copied().unwrap_or(0.0),
            onset_expr: self.onset_expr.at(row, col).cloned().unwrap_or_default(),
            offset_expr: self.offset_expr.at(row, col).cloned().unwrap_or_default(),
        }
    }
}

/// Pulse parameters for a single condition
#[derive(Debug, Clone, PartialEq)]
pub struct PulseTrain {
    pub start: Time,
    pub duration: Time,
    pub amplitude: f64,
    pub repetitions: u32,
    pub period: Time,
    pub onset_expr: String,
    pub offset_expr: String,
}

impl PulseTrain {
    pub fn render(&self, time: &Array1<Time>) -> Array1<f64> {
        let n = time.len();
        let mut waveform = Array1::<f64>::zeros(n);
        if self.duration <= SNAP_EPSILON || self.amplitude.abs() <= SNAP_EPSILON {
            return waveform;
        }
        let shaped = !self.onset_expr.trim().is_empty() || !self.offset_expr.trim().is_empty();

        for rep in 0..self.repetitions {
            let onset = self.start + rep as f64 * self.period;
            let offset = onset + self.duration;
            let first_onset = snap_index(time, onset);
            if first_onset >= n {
                continue;
            }
            let first_offset = snap_index(time, offset).max(first_onset);

            if !shaped {
                waveform
                    .slice_mut(s![first_onset..first_offset])
                    .mapv_inplace(|v| v + self.amplitude);
                continue;
            }
            if first_offset > first_onset {
                self.add_shape(&mut waveform, time, &self.onset_expr, first_onset, first_offset, onset);
            }
            if first_offset < n {
                self.add_shape(&mut waveform, time, &self.offset_expr, first_offset, n, offset);
            }
        }
        waveform
    }

    fn add_shape(
        &self,
        waveform: &mut Array1<f64>,
        time: &Array1<Time>,
        source: &str,
        first: usize,
        end: usize,
        origin: Time,
    ) {
        if source.trim().is_empty() {
            return;
        }
        let elapsed = time.slice(s![first..end]).mapv(|t| t - origin);
        let len = elapsed.len();
        let mut scope = Scope::new();
        scope.bind("t", elapsed);

        let shape = Expression::parse(source)
            .and_then(|expr| expr.eval(&scope))
            .and_then(|value| value.into_series(len));
        match shape {
            Ok(shape) => {
                let mut window = waveform.slice_mut(s![first..end]);
                window.scaled_add(self.amplitude, &shape);
            }
            Err(e) => log::debug!("stimulus shape '{}' left at zero: {}", source, e),
        }
    }
}
