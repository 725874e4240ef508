//! Per-condition summaries.
//!
//! A summary reduces each condition cell to one (X, Y) point by evaluating a
//! pair of expressions over sample windows of the cell's traces. The points
//! form `rows × cols` matrices per parameter set; reference data whose name
//! matches the summary is aligned against each row's X values.

use crate::reference::{AlignedReference, ReferenceData};
use crate::stimulus::{window_in_range, SampleWindow};
use clamp_core::{ClampError, Expression, ExpressionError, Grid, Result, Scope, Time};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

/// Named scalars and traces visible to one cell's expressions.
///
/// Later bindings shadow earlier ones with the same name.
#[derive(Debug, Clone, Default)]
pub struct TraceBindings {
    scalars: Vec<(String, f64)>,
    series: Vec<(String, Array1<f64>)>,
}

impl TraceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&mut self, name: &str, value: f64) -> &mut Self {
        self.scalars.push((name.to_string(), value));
        self
    }

    pub fn series(&mut self, name: &str, values: Array1<f64>) -> &mut Self {
        self.series.push((name.to_string(), values));
        self
    }

    pub fn get_series(&self, name: &str) -> Option<&Array1<f64>> {
        self.series.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Scope with every trace restricted to `window`
    pub fn scope(&self, window: SampleWindow) -> Scope {
        let mut scope = Scope::new();
        for (name, value) in &self.scalars {
            scope.bind(name.as_str(), *value);
        }
        for (name, values) in &self.series {
            let end = window.end().min(values.len());
            let first = window.first.min(end);
            scope.bind(name.as_str(), values.slice(s![first..end]).to_owned());
        }
        scope
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryNormalization {
    #[default]
    None,
    PerRow,
    AllRows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub name: String,
    #[serde(default)]
    pub x_expr: Grid<String>,
    #[serde(default)]
    pub y_expr: Grid<String>,
    #[serde(default)]
    pub x_start: Grid<f64>,
    #[serde(default)]
    pub x_duration: Grid<f64>,
    #[serde(default)]
    pub y_start: Grid<f64>,
    #[serde(default)]
    pub y_duration: Grid<f64>,
    #[serde(default)]
    pub normalization: SummaryNormalization,
    #[serde(default = "default_active")]
    pub active: bool,

    /// X values per parameter set
    #[serde(skip)]
    pub data_x: Vec<Array2<f64>>,
    /// Y values per parameter set
    #[serde(skip)]
    pub data_y: Vec<Array2<f64>>,
    /// Aligned reference per parameter set and row
    #[serde(skip)]
    pub reference: Vec<Vec<Option<AlignedReference>>>,
}

fn default_active() -> bool {
    true
}

impl Summary {
    pub fn new(name: &str, x_expr: &str, y_expr: &str) -> Self {
        Self {
            name: name.to_string(),
            x_expr: Grid::scalar(x_expr.to_string()),
            y_expr: Grid::scalar(y_expr.to_string()),
            x_start: Grid::default(),
            x_duration: Grid::default(),
            y_start: Grid::default(),
            y_duration: Grid::default(),
            normalization: SummaryNormalization::None,
            active: true,
            data_x: Vec::new(),
            data_y: Vec::new(),
            reference: Vec::new(),
        }
    }

    /// Pad every grid to `rows × cols` in place
    pub fn pad(&mut self, rows: usize, cols: usize) {
        self.x_expr = self.x_expr.padded(rows, cols, &String::new());
        self.y_expr = self.y_expr.padded(rows, cols, &String::new());
        self.x_start = self.x_start.padded(rows, cols, &0.0);
        self.x_duration = self.x_duration.padded(rows, cols, &0.0);
        self.y_start = self.y_start.padded(rows, cols, &0.0);
        self.y_duration = self.y_duration.padded(rows, cols, &0.0);
    }

    /// X and Y sample windows of one cell; expects padded grids
    pub fn windows(&self, time: &Array1<Time>, row: usize, col: usize) -> (SampleWindow, SampleWindow) {
        let window = |start: &Grid<f64>, duration: &Grid<f64>| {
            let start = start.at(row, col).copied().unwrap_or(0.0);
            let duration = duration.at(row, col).copied().unwrap_or(0.0);
            if duration <= 0.0 {
                SampleWindow {
                    first: 0,
                    len: time.len(),
                }
            } else {
                window_in_range(time, start, start + duration)
            }
        };
        (
            window(&self.x_start, &self.x_duration),
            window(&self.y_start, &self.y_duration),
        )
    }

    /// Reset the X/Y matrices of `set` to `rows × cols` zeros
    pub fn reset(&mut self, set: usize, rows: usize, cols: usize) {
        while self.data_x.len() <= set {
            self.data_x.push(Array2::zeros((rows, cols)));
        }
        while self.data_y.len() <= set {
            self.data_y.push(Array2::zeros((rows, cols)));
        }
        self.data_x[set] = Array2::zeros((rows, cols));
        self.data_y[set] = Array2::zeros((rows, cols));
    }

    /// Evaluate the (X, Y) point of one cell
    pub fn evaluate(
        &self,
        bindings: &TraceBindings,
        row: usize,
        col: usize,
        windows: (SampleWindow, SampleWindow),
    ) -> Result<(f64, f64)> {
        let x_source = self.x_expr.at(row, col).map(String::as_str).unwrap_or("");
        let y_source = self.y_expr.at(row, col).map(String::as_str).unwrap_or("");
        let x = reduce(x_source, &bindings.scope(windows.0))?;
        let y = reduce(y_source, &bindings.scope(windows.1))?;
        Ok((x, y))
    }

    /// Store one cell's point for `set`
    pub fn store(&mut self, set: usize, row: usize, col: usize, point: (f64, f64)) {
        if let (Some(x), Some(y)) = (self.data_x.get_mut(set), self.data_y.get_mut(set)) {
            if let (Some(xv), Some(yv)) = (x.get_mut((row, col)), y.get_mut((row, col))) {
                *xv = point.0;
                *yv = point.1;
            }
        }
    }

    /// Divide Y of `set` by its largest magnitude, per row or overall
    pub fn normalize(&mut self, set: usize) {
        let data_y = match self.data_y.get_mut(set) {
            Some(y) => y,
            None => return,
        };
        match self.normalization {
            SummaryNormalization::None => {}
            SummaryNormalization::PerRow => {
                for mut row in data_y.rows_mut() {
                    let max = peak(row.iter());
                    if max > 0.0 {
                        row.mapv_inplace(|v| v / max);
                    }
                }
            }
            SummaryNormalization::AllRows => {
                let max = peak(data_y.iter());
                if max > 0.0 {
                    data_y.mapv_inplace(|v| v / max);
                }
            }
        }
    }

    /// Align a reference entry against the X values of consecutive rows.
    ///
    /// Pair `i` of the entry targets row `data.row + i`.
    pub fn align_reference(&mut self, data: &ReferenceData) {
        let set = data.set;
        let data_x = match self.data_x.get(set) {
            Some(x) => x,
            None => return,
        };
        let rows = data_x.nrows();
        while self.reference.len() <= set {
            self.reference.push(Vec::new());
        }
        self.reference[set].resize(rows, None);

        for (i, pair) in data.column_pairs().into_iter().enumerate() {
            let row = data.row + i;
            if row >= rows {
                break;
            }
            let x: Vec<f64> = data_x.row(row).to_vec();
            self.reference[set][row] = data.align(pair, &x);
        }
    }

    /// `Σ (Y − ref)² × weight` over every aligned row
    pub fn cost(&self) -> f64 {
        let mut cost = 0.0;
        for (set, rows) in self.reference.iter().enumerate() {
            let data_y = match self.data_y.get(set) {
                Some(y) => y,
                None => continue,
            };
            for (row, aligned) in rows.iter().enumerate() {
                let aligned = match aligned {
                    Some(a) if !a.is_empty() && row < data_y.nrows() => a,
                    _ => continue,
                };
                let end = (aligned.first + aligned.len()).min(data_y.ncols());
                let y = data_y.slice(s![row, aligned.first..end]);
                let sum: f64 = y
                    .iter()
                    .zip(aligned.values.iter())
                    .map(|(sim, reference)| (sim - reference).powi(2))
                    .sum();
                cost += sum * aligned.weight;
            }
        }
        cost
    }
}

fn peak<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    values.fold(0.0, |m, v| m.max(v.abs()))
}

/// Evaluate `source` to a single number
fn reduce(source: &str, scope: &Scope) -> Result<f64> {
    if source.trim().is_empty() {
        return Err(ExpressionError::Parse("summary expression is empty".to_string()).into());
    }
    let value = Expression::parse(source)?.eval(scope)?;
    value.as_scalar().ok_or_else(|| {
        ClampError::ConfigError(format!("summary '{}' does not reduce to a single value", source))
    })
}
