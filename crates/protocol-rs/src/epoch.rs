//! Epoch decomposition.
//!
//! A condition's sampled stimuli are cut into maximal runs of constant
//! stimulus values. Runs with equal values anywhere in the pass share one
//! [`UniqueEpoch`], so each rate matrix is built and solved once.

use crate::spectral::{spectral_expansion, Spectrum};
use crate::simulator::SolverMethod;
use clamp_core::{AbortFlag, ClampError, Result, StimulusSnapshot, Time, SNAP_EPSILON};
use clamp_markov::{EpochKinetics, KineticModel};
use ndarray::{Array1, Array2};
use rand_distr::Exp;
use std::collections::BTreeMap;

/// Elementary charge per second expressed in pA
pub const CHARGE_CURRENT_SCALE: f64 = 6.242e-6;

/// Interval of constant stimulus within one condition
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    pub start: Time,
    pub duration: Time,
    pub first_pt: usize,
    pub num_pts: usize,
    pub stimuli: StimulusSnapshot,
    /// Index into the pass's [`EpochRegistry`]
    pub unique: usize,
}

impl Epoch {
    pub fn end(&self) -> Time {
        self.start + self.duration
    }
}

/// Kinetics shared by every epoch with the same stimulus values
#[derive(Debug, Clone)]
pub struct UniqueEpoch {
    pub stimuli: StimulusSnapshot,
    pub rates: Array2<f64>,
    pub starting_probability: Array1<f64>,
    pub attributes: BTreeMap<String, Array1<f64>>,
    pub charges: Array2<f64>,
    /// Net charge current carried out of each state
    pub charge_current: Array1<f64>,
    pub has_charges: bool,
    pub spectrum: Option<Spectrum>,
    /// Dwell-time distribution per state, `None` for absorbing states
    pub lifetimes: Vec<Option<Exp<f64>>>,
}

impl UniqueEpoch {
    fn new(stimuli: StimulusSnapshot) -> Self {
        Self {
            stimuli,
            rates: Array2::zeros((0, 0)),
            starting_probability: Array1::zeros(0),
            attributes: BTreeMap::new(),
            charges: Array2::zeros((0, 0)),
            charge_current: Array1::zeros(0),
            has_charges: false,
            spectrum: None,
            lifetimes: Vec::new(),
        }
    }

    pub fn num_states(&self) -> usize {
        self.rates.nrows()
    }

    /// Net exit rate of a state
    pub fn exit_rate(&self, state: usize) -> f64 {
        -self.rates[[state, state]]
    }

    /// Query the model for one parameter set and prepare the chosen solver
    pub fn solve<M: KineticModel + ?Sized>(
        &mut self,
        model: &M,
        set: usize,
        method: SolverMethod,
    ) -> Result<()> {
        let EpochKinetics {
            rates,
            starting_probability,
            attributes,
            charges,
        } = model.kinetics(set, &self.stimuli)?;

        let n = rates.nrows();
        if n < 2 {
            return Err(ClampError::ModelError(
                "simulating fewer than two states does not make sense".to_string(),
            ));
        }

        self.has_charges = charges.iter().any(|&c| c != 0.0);
        self.charge_current = if self.has_charges {
            (&rates * &charges).sum_axis(ndarray::Axis(1)) * CHARGE_CURRENT_SCALE
        } else {
            Array1::zeros(n)
        };

        self.spectrum = None;
        self.lifetimes.clear();
        match method {
            SolverMethod::Spectral => self.spectrum = Some(spectral_expansion(&rates)?),
            SolverMethod::MonteCarlo => {
                self.lifetimes = (0..n)
                    .map(|i| {
                        let kout = -rates[[i, i]];
                        if kout < SNAP_EPSILON {
                            None
                        } else {
                            Exp::new(kout).ok()
                        }
                    })
                    .collect();
            }
        }

        self.rates = rates;
        self.starting_probability = starting_probability;
        self.attributes = attributes;
        self.charges = charges;
        Ok(())
    }
}

/// Unique epochs of one simulation pass
#[derive(Debug, Clone, Default)]
pub struct EpochRegistry {
    epochs: Vec<UniqueEpoch>,
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the unique epoch for `stimuli`, registering it if new
    pub fn register(&mut self, stimuli: &StimulusSnapshot) -> usize {
        if let Some(index) = self.epochs.iter().position(|e| &e.stimuli == stimuli) {
            return index;
        }
        self.epochs.push(UniqueEpoch::new(stimuli.clone()));
        self.epochs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn as_slice(&self) -> &[UniqueEpoch] {
        &self.epochs
    }

    pub fn as_mut_slice(&mut self) -> &mut [UniqueEpoch] {
        &mut self.epochs
    }

    pub fn clear(&mut self) {
        self.epochs.clear();
    }

    /// Solve every unique epoch for a parameter set on the worker pool.
    ///
    /// Returns `false` when the abort flag stopped the phase.
    pub fn solve_all<M: KineticModel>(
        &mut self,
        model: &M,
        set: usize,
        method: SolverMethod,
        abort: &AbortFlag,
    ) -> Result<bool> {
        use rayon::prelude::*;

        self.epochs.par_iter_mut().try_for_each(|epoch| {
            if abort.is_aborted() {
                return Ok(());
            }
            epoch.solve(model, set, method)
        })?;
        Ok(!abort.is_aborted())
    }
}

/// Cut a sampled condition into epochs, registering each one.
///
/// A new epoch starts wherever any stimulus changes between adjacent
/// samples; the last epoch ends at `end_time`.
pub fn decompose(
    time: &Array1<Time>,
    end_time: Time,
    stimuli: &BTreeMap<String, Array1<f64>>,
    registry: &mut EpochRegistry,
) -> Vec<Epoch> {
    let num_pts = time.len();
    let snapshot = |i: usize| -> StimulusSnapshot {
        stimuli
            .iter()
            .map(|(name, waveform)| (name.clone(), waveform[i]))
            .collect()
    };

    let mut epochs: Vec<Epoch> = Vec::new();
    if num_pts == 0 {
        return epochs;
    }

    let mut first = Epoch {
        start: time[0],
        duration: 0.0,
        first_pt: 0,
        num_pts: 0,
        stimuli: snapshot(0),
        unique: 0,
    };
    first.unique = registry.register(&first.stimuli);
    epochs.push(first);

    for i in 1..num_pts {
        let changed = stimuli.values().any(|w| w[i] != w[i - 1]);
        if !changed {
            continue;
        }
        if let Some(last) = epochs.last_mut() {
            last.duration = time[i] - last.start;
            last.num_pts = i - last.first_pt;
        }
        let values = snapshot(i);
        let unique = registry.register(&values);
        epochs.push(Epoch {
            start: time[i],
            duration: 0.0,
            first_pt: i,
            num_pts: 0,
            stimuli: values,
            unique,
        });
    }

    if let Some(last) = epochs.last_mut() {
        last.duration = end_time - last.start;
        last.num_pts = num_pts - last.first_pt;
    }
    epochs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_decompose_step() {
        let time = array![0.0, 0.1, 0.2, 0.3, 0.4];
        let mut stimuli = BTreeMap::new();
        stimuli.insert("V".to_string(), array![0.0, 0.0, 1.0, 1.0, 0.0]);

        let mut registry = EpochRegistry::new();
        let epochs = decompose(&time, 0.5, &stimuli, &mut registry);

        assert_eq!(epochs.len(), 3);
        assert_eq!((epochs[0].first_pt, epochs[0].num_pts), (0, 2));
        assert_eq!((epochs[1].first_pt, epochs[1].num_pts), (2, 2));
        assert_eq!((epochs[2].first_pt, epochs[2].num_pts), (4, 1));
        assert!((epochs[2].duration - 0.1).abs() < 1e-12);
        assert!((epochs[1].end() - 0.4).abs() < 1e-12);

        // First and last epochs hold the same stimulus
        assert_eq!(registry.len(), 2);
        assert_eq!(epochs[0].unique, epochs[2].unique);
    }

    #[test]
    fn test_decompose_without_stimuli() {
        let time = array![1.0, 1.5, 2.0];
        let mut registry = EpochRegistry::new();
        let epochs = decompose(&time, 2.0, &BTreeMap::new(), &mut registry);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].num_pts, 3);
        assert!((epochs[0].duration - 1.0).abs() < 1e-12);
        assert!(epochs[0].stimuli.is_empty());
    }

    #[test]
    fn test_registry_shared_across_cells() {
        let mut registry = EpochRegistry::new();
        let mut a = StimulusSnapshot::new();
        a.insert("V".to_string(), -80.0);
        let mut b = a.clone();
        b.insert("V".to_string(), 20.0);

        assert_eq!(registry.register(&a), 0);
        assert_eq!(registry.register(&b), 1);
        assert_eq!(registry.register(&a.clone()), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_solve_charge_current() {
        let mut model = clamp_markov::models::two_state(2.0, 1.0);
        model.transitions[0].charge = 1.0;

        let mut registry = EpochRegistry::new();
        registry.register(&StimulusSnapshot::new());
        registry
            .solve_all(&model, 0, SolverMethod::MonteCarlo, &AbortFlag::new())
            .unwrap();

        let epoch = &registry.as_slice()[0];
        assert!(epoch.has_charges);
        assert!((epoch.charge_current[0] - 2.0 * CHARGE_CURRENT_SCALE).abs() < 1e-18);
        assert_eq!(epoch.charge_current[1], 0.0);
        assert_eq!(epoch.lifetimes.len(), 2);
    }

    #[test]
    fn test_single_state_rejected() {
        let mut model = clamp_markov::MarkovModel::new("one");
        model.add_state(clamp_markov::State::new("C", 1.0));

        let mut registry = EpochRegistry::new();
        registry.register(&StimulusSnapshot::new());
        let err = registry.solve_all(&model, 0, SolverMethod::Spectral, &AbortFlag::new());
        assert!(err.is_err());
    }
}
