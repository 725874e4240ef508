//! Condition grids.
//!
//! Every per-condition parameter of a protocol is a [`Grid`]: a ragged list
//! of rows, padded to the protocol's full size before a simulation pass.
//!
//! Grids can be written as text:
//!
//! ```text
//! 0.1, 0.2; 0.3          two rows, the second with one column
//! -80:20:40              one row: -80 -60 -40 -20 0 20 40
//! exp(-t), 1-exp(-t)     text cells split on top-level commas
//! ```

use crate::{ClampError, Result};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Parser)]
#[grammar_inline = r#"
blank = _{ " " | "\t" | "\r" | "\n" }

number = @{
    ("+" | "-")?
    ~ (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
range = { number ~ ":" ~ number ~ (":" ~ number)? }
item = _{ range | number }
separator = _{ blank* ~ "," ~ blank* | blank+ }

row = { item ~ (separator ~ item)* }
grid = { SOI ~ blank* ~ row? ~ blank* ~ (";" ~ blank* ~ row? ~ blank*)* ~ EOI }
"#]
struct GridParser;

/// Row × column matrix of per-condition values
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    rows: Vec<Vec<T>>,
}

impl<T> Default for Grid<T> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<T: Clone> Grid<T> {
    /// Single-cell grid
    pub fn scalar(value: T) -> Self {
        Self {
            rows: vec![vec![value]],
        }
    }

    pub fn from_rows(rows: Vec<Vec<T>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<T>] {
        &self.rows
    }

    /// (row count, widest row)
    pub fn dims(&self) -> (usize, usize) {
        let cols = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        (self.rows.len(), cols)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(Vec::is_empty)
    }

    /// Rectangular copy of size `rows × cols`.
    ///
    /// Missing rows repeat the last row, missing columns repeat the row's
    /// last value, and an empty grid is filled with `default`.
    pub fn padded(&self, rows: usize, cols: usize, default: &T) -> Self {
        let mut out = Vec::with_capacity(rows);
        for r in 0..rows {
            let source = self
                .rows
                .get(r)
                .filter(|row| !row.is_empty())
                .or_else(|| self.rows.iter().rev().find(|row| !row.is_empty()));
            let row = (0..cols)
                .map(|c| match source {
                    Some(src) => src.get(c).or_else(|| src.last()).unwrap_or(default).clone(),
                    None => default.clone(),
                })
                .collect();
            out.push(row);
        }
        Self { rows: out }
    }

    pub fn at(&self, row: usize, col: usize) -> Option<&T> {
        self.rows.get(row).and_then(|r| r.get(col))
    }
}

/// Largest (rows, cols) over a set of grid dimensions
pub fn max_dims(dims: impl IntoIterator<Item = (usize, usize)>) -> (usize, usize) {
    dims.into_iter()
        .fold((0, 0), |(r, c), (rr, cc)| (r.max(rr), c.max(cc)))
}

/// Cell types that can be read from grid text
pub trait GridCell: Clone + Sized {
    fn parse_grid(text: &str) -> Result<Grid<Self>>;
}

impl GridCell for f64 {
    fn parse_grid(text: &str) -> Result<Grid<Self>> {
        let mut pairs = GridParser::parse(Rule::grid, text)
            .map_err(|e| ClampError::ConfigError(format!("bad grid '{}': {}", text, e)))?;
        let grid = pairs
            .next()
            .ok_or_else(|| ClampError::ConfigError(format!("bad grid '{}'", text)))?;

        let mut rows = Vec::new();
        for row in grid.into_inner().filter(|p| p.as_rule() == Rule::row) {
            let mut values = Vec::new();
            for item in row.into_inner() {
                match item.as_rule() {
                    Rule::number => values.push(parse_number(item.as_str())?),
                    Rule::range => {
                        let bounds = item
                            .into_inner()
                            .map(|p| parse_number(p.as_str()))
                            .collect::<Result<Vec<_>>>()?;
                        let (start, step, stop) = match bounds.as_slice() {
                            [start, stop] => (*start, 1.0, *stop),
                            [start, step, stop] => (*start, *step, *stop),
                            _ => return Err(ClampError::ConfigError(format!("bad range in '{}'", text))),
                        };
                        values.extend(expand_range(start, step, stop)?);
                    }
                    _ => {}
                }
            }
            rows.push(values);
        }
        Ok(Grid { rows })
    }
}

impl GridCell for u32 {
    fn parse_grid(text: &str) -> Result<Grid<Self>> {
        let numeric = f64::parse_grid(text)?;
        let rows = numeric
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&x| {
                        if x >= 0.0 && x.fract() == 0.0 && x <= u32::MAX as f64 {
                            Ok(x as u32)
                        } else {
                            Err(ClampError::ConfigError(format!(
                                "'{}' is not a non-negative integer in '{}'",
                                x, text
                            )))
                        }
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Grid { rows })
    }
}

impl GridCell for String {
    /// Split on `;` and `,` outside parentheses; cells are trimmed.
    fn parse_grid(text: &str) -> Result<Grid<Self>> {
        let mut rows = Vec::new();
        let mut row = Vec::new();
        let mut cell = String::new();
        let mut depth = 0i32;

        for ch in text.chars() {
            match ch {
                '(' => {
                    depth += 1;
                    cell.push(ch);
                }
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(ClampError::ConfigError(format!("unbalanced ')' in '{}'", text)));
                    }
                    cell.push(ch);
                }
                ',' if depth == 0 => row.push(std::mem::take(&mut cell).trim().to_string()),
                ';' if depth == 0 => {
                    row.push(std::mem::take(&mut cell).trim().to_string());
                    rows.push(std::mem::take(&mut row));
                }
                _ => cell.push(ch),
            }
        }
        if depth != 0 {
            return Err(ClampError::ConfigError(format!("unbalanced '(' in '{}'", text)));
        }
        row.push(cell.trim().to_string());
        rows.push(row);
        Ok(Grid { rows })
    }
}

fn parse_number(s: &str) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|e| ClampError::ConfigError(format!("bad number '{}': {}", s, e)))
}

fn expand_range(start: f64, step: f64, stop: f64) -> Result<Vec<f64>> {
    if step == 0.0 || !step.is_finite() {
        return Err(ClampError::ConfigError(format!(
            "range {}:{}:{} has a zero step",
            start, step, stop
        )));
    }
    let span = (stop - start) / step;
    if span < -1e-9 {
        return Ok(Vec::new());
    }
    let count = (span + 1e-9).floor() as usize + 1;
    Ok((0..count).map(|i| start + i as f64 * step).collect())
}

impl<T: Serialize> Serialize for Grid<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.rows.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Grid<T>
where
    T: GridCell + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum GridSource<U> {
            Rows(Vec<Vec<U>>),
            Row(Vec<U>),
            Text(String),
            Scalar(U),
        }

        Ok(match GridSource::<T>::deserialize(deserializer)? {
            GridSource::Rows(rows) => Grid { rows },
            GridSource::Row(row) => Grid { rows: vec![row] },
            GridSource::Text(text) => T::parse_grid(&text).map_err(<D::Error as serde::de::Error>::custom)?,
            GridSource::Scalar(value) => Grid::scalar(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_grid() {
        let grid = f64::parse_grid("0.1, 0.2; 0.3").unwrap();
        assert_eq!(grid.dims(), (2, 2));
        assert_eq!(grid.at(0, 1), Some(&0.2));
        assert_eq!(grid.at(1, 1), None);

        let grid = f64::parse_grid("1 2\t3").unwrap();
        assert_eq!(grid.rows(), &[vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_ranges() {
        let grid = f64::parse_grid("-80:20:40").unwrap();
        assert_eq!(grid.rows()[0], vec![-80.0, -60.0, -40.0, -20.0, 0.0, 20.0, 40.0]);

        let grid = f64::parse_grid("1:3, 10").unwrap();
        assert_eq!(grid.rows()[0], vec![1.0, 2.0, 3.0, 10.0]);

        let grid = f64::parse_grid("0:0.1:0.3").unwrap();
        assert_eq!(grid.rows()[0].len(), 4);

        assert!(f64::parse_grid("1:0:3").is_err());
    }

    #[test]
    fn test_integer_grid() {
        let grid = u32::parse_grid("1, 2; 3").unwrap();
        assert_eq!(grid.at(1, 0), Some(&3));
        assert!(u32::parse_grid("1.5").is_err());
        assert!(u32::parse_grid("-1").is_err());
    }

    #[test]
    fn test_text_grid() {
        let grid = String::parse_grid("min(a, b), exp(-t); 1-exp(-t)").unwrap();
        assert_eq!(grid.dims(), (2, 2));
        assert_eq!(grid.at(0, 0).unwrap(), "min(a, b)");
        assert_eq!(grid.at(0, 1).unwrap(), "exp(-t)");
        assert_eq!(grid.at(1, 0).unwrap(), "1-exp(-t)");
        assert!(String::parse_grid("exp(-t").is_err());
    }

    #[test]
    fn test_padding() {
        let grid = Grid::from_rows(vec![vec![1.0, 2.0], vec![3.0]]);
        let padded = grid.padded(3, 3, &0.0);
        assert_eq!(
            padded.rows(),
            &[vec![1.0, 2.0, 2.0], vec![3.0, 3.0, 3.0], vec![3.0, 3.0, 3.0]]
        );

        let empty: Grid<f64> = Grid::default();
        assert_eq!(empty.padded(1, 2, &7.0).rows(), &[vec![7.0, 7.0]]);
    }

    #[test]
    fn test_deserialize_forms() {
        let g: Grid<f64> = serde_json::from_str("0.5").unwrap();
        assert_eq!(g, Grid::scalar(0.5));
        let g: Grid<f64> = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(g.dims(), (1, 2));
        let g: Grid<f64> = serde_json::from_str("[[1], [2, 3]]").unwrap();
        assert_eq!(g.dims(), (2, 2));
        let g: Grid<f64> = serde_json::from_str("\"0:2; 5\"").unwrap();
        assert_eq!(g.rows(), &[vec![0.0, 1.0, 2.0], vec![5.0]]);
        let g: Grid<String> = serde_json::from_str("\"a, b\"").unwrap();
        assert_eq!(g.dims(), (1, 2));
    }
}
