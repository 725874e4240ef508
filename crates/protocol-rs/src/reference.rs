//! Reference data alignment.
//!
//! Experimental traces are resampled onto a simulation's time grid (or a
//! summary's X values) by linear interpolation between the bounding
//! reference samples, then optionally normalized and scaled.

use clamp_core::{ClampError, Result, SNAP_EPSILON};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    None,
    /// Divide by the maximum
    ToMax,
    /// Divide by the minimum
    ToMin,
    /// Divide by whichever extremum has the larger magnitude
    ToAbsMinMax,
}

impl Normalization {
    pub fn apply(&self, values: &mut Array1<f64>) {
        if values.is_empty() {
            return;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let divisor = match self {
            Normalization::None => return,
            Normalization::ToMax => max,
            Normalization::ToMin => min,
            Normalization::ToAbsMinMax => {
                if max.abs() >= min.abs() {
                    max
                } else {
                    min
                }
            }
        };
        values.mapv_inplace(|v| v / divisor);
    }
}

/// Reference values aligned to a contiguous run of target samples
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedReference {
    /// First aligned target index
    pub first: usize,
    pub values: Array1<f64>,
    pub weight: f64,
}

impl AlignedReference {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Tabulated reference data attached to a protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    /// Waveform, state, stimulus or summary this data is compared with
    pub name: String,
    #[serde(default)]
    pub set: usize,
    #[serde(default)]
    pub row: usize,
    #[serde(default)]
    pub col: usize,
    /// Shift subtracted from the reference X axis
    #[serde(default)]
    pub x0: f64,
    #[serde(default = "unit")]
    pub scale: f64,
    #[serde(default = "unit")]
    pub weight: f64,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub columns: Vec<Vec<f64>>,
    /// Tab-delimited text file read when `columns` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn unit() -> f64 {
    1.0
}

impl ReferenceData {
    pub fn new(name: &str, titles: Vec<String>, columns: Vec<Vec<f64>>) -> Self {
        Self {
            name: name.to_string(),
            set: 0,
            row: 0,
            col: 0,
            x0: 0.0,
            scale: 1.0,
            weight: 1.0,
            normalization: Normalization::None,
            titles,
            columns,
            file: None,
        }
    }

    /// Fill `titles` and `columns` from `file` if no data is inline
    pub fn load(&mut self) -> Result<()> {
        if !self.columns.is_empty() {
            return Ok(());
        }
        if let Some(path) = &self.file {
            let text = std::fs::read_to_string(path)?;
            let parsed = Self::parse_text(&self.name, &text)?;
            self.titles = parsed.titles;
            self.columns = parsed.columns;
        }
        Ok(())
    }

    /// Load tab-delimited text: a title line, then numeric rows.
    ///
    /// Missing trailing fields read as zero.
    pub fn parse_text(name: &str, text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let titles: Vec<String> = lines
            .next()
            .unwrap_or_default()
            .split('\t')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let mut columns = vec![Vec::new(); titles.len()];

        for (line_no, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split([' ', '\t']).filter(|f| !f.is_empty()).collect();
            for (col, column) in columns.iter_mut().enumerate() {
                let value = match fields.get(col) {
                    Some(field) => field.parse::<f64>().map_err(|_| {
                        ClampError::ConfigError(format!(
                            "{}: non-numeric data '{}' on line {}",
                            name,
                            field,
                            line_no + 2
                        ))
                    })?,
                    None => 0.0,
                };
                column.push(value);
            }
        }
        Ok(Self::new(name, titles, columns))
    }

    /// (X, Y) column pairs: `XYXY...` or `XYY...`
    pub fn column_pairs(&self) -> Vec<(usize, usize)> {
        column_pairs(&self.titles, self.columns.len())
    }

    /// Align pair `pair` onto the target axis `x`
    pub fn align(&self, pair: (usize, usize), x: &[f64]) -> Option<AlignedReference> {
        let xref = self.columns.get(pair.0)?;
        let yref = self.columns.get(pair.1)?;
        let n = xref.len().min(yref.len());
        let (xref, yref) = (&xref[..n], &yref[..n]);

        let epsilon = alignment_epsilon(x, xref);
        let (y, first, count) = resample(xref, yref, x, self.x0, epsilon);
        if count == 0 {
            return None;
        }
        let mut values = Array1::from(y[first..first + count].to_vec());
        self.normalization.apply(&mut values);
        if self.scale != 1.0 {
            values.mapv_inplace(|v| v * self.scale);
        }
        Some(AlignedReference {
            first,
            values,
            weight: self.weight,
        })
    }
}

/// Pair columns as `XYXY...` when the column count is even, there are more
/// than two titles and title 0 equals title 2; otherwise column 0 is X for
/// every other column.
pub fn column_pairs(titles: &[String], num_columns: usize) -> Vec<(usize, usize)> {
    if num_columns == 0 {
        return Vec::new();
    }
    if num_columns % 2 == 0 && titles.len() > 2 && titles[0] == titles[2] {
        (0..num_columns / 2).map(|i| (2 * i, 2 * i + 1)).collect()
    } else {
        (1..num_columns).map(|i| (0, i)).collect()
    }
}

fn min_spacing(x: &[f64]) -> Option<f64> {
    x.windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.min(d))))
}

/// `1e-5` times the smallest sample spacing of either axis
pub fn alignment_epsilon(x: &[f64], xref: &[f64]) -> f64 {
    let eps = match (min_spacing(x), min_spacing(xref)) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return SNAP_EPSILON,
    } * 1e-5;
    if eps > 0.0 {
        eps
    } else {
        SNAP_EPSILON
    }
}

/// Resample `yref(xref - x0)` onto `x`.
///
/// Both axes must be monotone; either may decrease. Returns the full-length
/// output (unaligned samples are zero) with the first aligned index and the
/// length of the contiguous aligned run.
pub fn resample(xref: &[f64], yref: &[f64], x: &[f64], x0: f64, epsilon: f64) -> (Vec<f64>, usize, usize) {
    let n = x.len();
    let mut y = vec![0.0; n];

    let increasing = n < 2 || x[1] >= x[0];
    let ref_increasing = xref.len() < 2 || xref[1] >= xref[0];
    let target: Vec<usize> = if increasing { (0..n).collect() } else { (0..n).rev().collect() };
    let reference: Vec<(f64, f64)> = {
        let pairs = xref.iter().zip(yref).map(|(&xr, &yr)| (xr - x0, yr));
        if ref_increasing {
            pairs.collect()
        } else {
            pairs.rev().collect()
        }
    };

    let mut first: Option<usize> = None;
    let mut count = 0;
    let mut k = 0; // position in `target`
    let mut iref = 0;
    while k < target.len() && iref < reference.len() {
        let xi = x[target[k]];
        let (xr, yr) = reference[iref];
        if xi < xr - epsilon {
            // Before the reference starts
            k += 1;
            continue;
        }
        let value = if (xi - xr).abs() < epsilon {
            yr
        } else {
            match reference.get(iref + 1) {
                None => break,
                Some(&(xn, yn)) => {
                    if xi >= xn - epsilon {
                        iref += 1;
                        continue;
                    }
                    yr + (yn - yr) / (xn - xr) * (xi - xr)
                }
            }
        };
        y[target[k]] = value;
        if first.is_none() {
            first = Some(k);
        }
        count += 1;
        k += 1;
    }

    match first {
        None => (y, 0, 0),
        Some(start) if increasing => (y, start, count),
        Some(start) => (y, n - (start + count), count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_alignment() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|t| (3.0 * t).sin()).collect();
        let eps = alignment_epsilon(&x, &x);
        let (out, first, count) = resample(&x, &y, &x, 0.0, eps);
        assert_eq!((first, count), (0, 20));
        for (a, b) in out.iter().zip(&y) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_interpolation_onto_finer_grid() {
        let xref = [0.0, 1.0, 2.0];
        let yref = [0.0, 10.0, 0.0];
        let x: Vec<f64> = (0..9).map(|i| i as f64 * 0.25).collect();
        let (y, first, count) = resample(&xref, &yref, &x, 0.0, 1e-6);
        assert_eq!((first, count), (0, 9));
        assert!((y[1] - 2.5).abs() < 1e-12);
        assert!((y[4] - 10.0).abs() < 1e-12);
        assert!((y[6] - 5.0).abs() < 1e-12);
        assert!(y[8].abs() < 1e-12);
    }

    #[test]
    fn test_partial_overlap_window() {
        // x = [10, 20), reference shifted to [15, 25)
        let x: Vec<f64> = (10..20).map(|i| i as f64).collect();
        let xref: Vec<f64> = (15..25).map(|i| i as f64).collect();
        let yref: Vec<f64> = xref.iter().map(|v| v * 2.0).collect();
        let (y, first, count) = resample(&xref, &yref, &x, 0.0, 1e-6);
        assert_eq!((first, count), (5, 5));
        assert!((y[5] - 30.0).abs() < 1e-12);

        // Shift by x0 moves the reference to [0, 10)
        let (_, first, count) = resample(&xref, &yref, &x, 15.0, 1e-6);
        assert_eq!(count, 0);
        assert_eq!(first, 0);
    }

    #[test]
    fn test_reference_ends_early() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let xref = [0.0, 2.0, 4.0];
        let yref = [0.0, 2.0, 4.0];
        let (y, first, count) = resample(&xref, &yref, &x, 0.0, 1e-6);
        assert_eq!((first, count), (0, 5));
        assert!((y[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_decreasing_axes() {
        let x = [4.0, 3.0, 2.0, 1.0, 0.0];
        let xref = [0.0, 2.0];
        let yref = [0.0, 4.0];
        let (y, first, count) = resample(&xref, &yref, &x, 0.0, 1e-6);
        assert_eq!((first, count), (2, 3));
        assert!((y[3] - 2.0).abs() < 1e-12);

        let xref = [2.0, 0.0];
        let yref = [4.0, 0.0];
        let (y2, _, _) = resample(&xref, &yref, &x, 0.0, 1e-6);
        assert_eq!(y, y2);
    }

    #[test]
    fn test_normalization() {
        let mut v = Array1::from(vec![-4.0, 1.0, 2.0]);
        Normalization::ToAbsMinMax.apply(&mut v);
        assert!((v[0] - 1.0).abs() < 1e-12);
        assert!((v[2] + 0.5).abs() < 1e-12);

        let mut v = Array1::from(vec![1.0, 2.0, 4.0]);
        Normalization::ToMax.apply(&mut v);
        assert!((v[0] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_column_pairs() {
        let titles: Vec<String> = ["t", "I", "t", "I"].iter().map(|s| s.to_string()).collect();
        assert_eq!(column_pairs(&titles, 4), vec![(0, 1), (2, 3)]);

        let titles: Vec<String> = ["t", "I1", "I2", "I3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(column_pairs(&titles, 4), vec![(0, 1), (0, 2), (0, 3)]);
        assert!(column_pairs(&[], 0).is_empty());
    }

    #[test]
    fn test_parse_text_and_align() {
        let text = "t\tO\n0\t0\n0.5\t1\n1.0\t2\n";
        let mut data = ReferenceData::parse_text("O", text).unwrap();
        assert_eq!(data.columns.len(), 2);
        assert_eq!(data.column_pairs(), vec![(0, 1)]);

        data.scale = 2.0;
        let x = [0.0, 0.25, 0.5, 0.75, 1.0];
        let aligned = data.align((0, 1), &x).unwrap();
        assert_eq!(aligned.first, 0);
        assert_eq!(aligned.len(), 5);
        assert!((aligned.values[1] - 1.0).abs() < 1e-12);

        assert!(ReferenceData::parse_text("bad", "t\tO\n0\tx\n").is_err());
    }
}
