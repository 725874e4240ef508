//! # Clamp Protocol
//!
//! Stimulus clamp simulation of ion-channel kinetic models.
//!
//! ## Pipeline
//!
//! 1. **Protocol grid**: each (row, col) condition samples its stimuli on its
//!    own time grid
//! 2. **Epochs**: runs of constant stimulus, deduplicated across the whole pass
//! 3. **Solvers**: spectral expansion of each epoch's rate matrix, or Monte
//!    Carlo trajectories rebuilt into occupancy
//! 4. **Traces**: state attributes, state groups, charge current, user
//!    waveforms and per-condition summaries
//! 5. **Fitting**: weighted squared residuals against aligned reference data,
//!    minimized by a bounded Nelder-Mead search
//!
//! ## Example
//!
//! ```no_run
//! use clamp_core::AbortFlag;
//! use clamp_markov::models;
//! use clamp_protocol::{Protocol, SimulationOptions, Simulator, Stimulus};
//!
//! let mut protocol = Protocol::new("activation", 0.05, 1e-4);
//! protocol.add_stimulus(Stimulus::pulse("V", 0.0, 0.05, -80.0));
//! protocol.add_stimulus(Stimulus::pulse("V", 0.01, 0.02, 100.0));
//!
//! let mut sim = Simulator::new(models::three_state_gating(), vec![protocol], SimulationOptions::default());
//! sim.simulate(&AbortFlag::new()).unwrap();
//! ```

pub mod dwt;
pub mod epoch;
pub mod monte_carlo;
pub mod optimizer;
pub mod protocol;
pub mod reference;
pub mod simulator;
pub mod spectral;
pub mod stimulus;
pub mod summary;

pub use epoch::{Epoch, EpochRegistry, UniqueEpoch};
pub use monte_carlo::{Event, EventChain};
pub use optimizer::{OptimizationReport, OptimizerOptions, OptimizerProgress};
pub use protocol::{ConditionCell, Protocol, Waveform};
pub use reference::{Normalization, ReferenceData};
pub use simulator::{SimulationOptions, Simulator, SolverMethod};
pub use stimulus::Stimulus;
pub use summary::{Summary, SummaryNormalization};
