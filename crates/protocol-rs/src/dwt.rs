//! Dwell-time (`.dwt`) export of Monte Carlo trajectories.
//!
//! ```text
//! Segment: 1 Dwells: 2 Sampling(ms): 1
//! 0	134
//! 1	27
//!
//! ```
//!
//! Durations are written in milliseconds, lines end in CRLF.

use crate::monte_carlo::EventChain;
use crate::protocol::Protocol;
use clamp_core::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Write one trajectory collection
pub fn write_dwt<W: Write>(out: &mut W, chains: &[EventChain]) -> std::io::Result<()> {
    for (segment, chain) in chains.iter().enumerate() {
        write!(
            out,
            "Segment: {} Dwells: {} Sampling(ms): 1\r\n",
            segment + 1,
            chain.len().saturating_sub(1)
        )?;
        for event in chain {
            write!(out, "{}\t{}\r\n", event.state, event.duration * 1000.0)?;
        }
        write!(out, "\r\n")?;
    }
    Ok(())
}

/// File for one (parameter set, row, col); a trailing `.dwt` on `base` is dropped
pub fn dwt_path(base: &Path, set: usize, row: usize, col: usize) -> PathBuf {
    let base = base.to_string_lossy();
    let stem = base.strip_suffix(".dwt").unwrap_or(&base);
    PathBuf::from(format!("{} ({},{},{}).dwt", stem, set, row, col))
}

/// Write every cell's trajectories; returns the files written
pub fn export(protocol: &Protocol, base: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for cell in protocol.cells() {
        for (set, chains) in cell.events.iter().enumerate() {
            let path = dwt_path(base, set, cell.row, cell.col);
            let mut out = BufWriter::new(File::create(&path)?);
            write_dwt(&mut out, chains)?;
            out.flush()?;
            written.push(path);
        }
    }
    log::info!("exported {} dwt file(s) for protocol '{}'", written.len(), protocol.name);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monte_carlo::Event;

    #[test]
    fn test_dwt_format() {
        let chains = vec![
            vec![Event { state: 0, duration: 0.125 }, Event { state: 1, duration: 0.25 }],
            vec![Event { state: 1, duration: 0.5 }],
        ];
        let mut out = Vec::new();
        write_dwt(&mut out, &chains).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Segment: 1 Dwells: 1 Sampling(ms): 1\r\n0\t125\r\n1\t250\r\n\r\n"));
        assert!(text.ends_with("Segment: 2 Dwells: 0 Sampling(ms): 1\r\n1\t500\r\n\r\n"));
    }

    #[test]
    fn test_dwt_path() {
        let path = dwt_path(Path::new("out/run.dwt"), 0, 1, 2);
        assert_eq!(path, PathBuf::from("out/run (0,1,2).dwt"));
        assert_eq!(dwt_path(Path::new("run"), 3, 0, 0), PathBuf::from("run (3,0,0).dwt"));
    }
}
