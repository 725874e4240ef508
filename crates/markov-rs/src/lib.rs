//! # Clamp Markov
//!
//! Kinetic models of ion channels as continuous-time Markov chains.
//!
//! The simulation engine only talks to models through [`KineticModel`]: for a
//! parameter set and the stimulus values of one epoch it asks for the rate
//! matrix, starting occupancy, state attributes and transition charges.
//!
//! [`MarkovModel`] is an expression-driven implementation: transition rates
//! are written as expressions over named parameters and stimuli.
//!
//! ```text
//!   C1 <--a--> C2 <--a--> O        a = a0 * exp(V / sa)
//!      <--b--    <--b--            b = b0 * exp(-V / sb)
//! ```

use clamp_core::{ClampError, Expression, Result, Scope, StimulusSnapshot};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// MODEL INTERFACE
// ============================================================================

/// Everything the solvers need for one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochKinetics {
    /// Generator matrix Q (rows sum to zero, off-diagonals are rates in 1/s)
    pub rates: Array2<f64>,
    /// Starting occupancy, sums to one
    pub starting_probability: Array1<f64>,
    /// Attribute name -> per-state values
    pub attributes: BTreeMap<String, Array1<f64>>,
    /// Charge moved by each transition (from, to)
    pub charges: Array2<f64>,
}

/// Named set of states whose occupancies are summed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateGroup {
    pub name: String,
    pub states: Vec<String>,
}

/// Adjustable parameter exposed to the optimizer
#[derive(Debug, Clone, PartialEq)]
pub struct FreeParameter {
    pub name: String,
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Interface between a kinetic model and the simulation engine
pub trait KineticModel: Send + Sync {
    /// State names in matrix order
    fn state_names(&self) -> Vec<String>;

    /// Number of alternative parameter sets simulated side by side
    fn num_parameter_sets(&self) -> usize {
        1
    }

    /// Kinetics of one epoch for a parameter set
    fn kinetics(&self, set: usize, stimuli: &StimulusSnapshot) -> Result<EpochKinetics>;

    /// Parameter values of a set, for binding into waveform expressions
    fn parameters(&self, set: usize) -> Vec<(String, f64)>;

    fn state_groups(&self) -> Vec<StateGroup> {
        Vec::new()
    }

    /// Free parameters in a fixed order
    fn free_parameters(&self) -> Vec<FreeParameter>;

    /// Apply values in the order of [`KineticModel::free_parameters`]
    fn set_free_parameters(&mut self, values: &[f64]) -> Result<()>;
}

// ============================================================================
// EXPRESSION-DRIVEN MARKOV MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    /// Relative starting occupancy
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

impl State {
    pub fn new(name: &str, probability: f64) -> Self {
        Self {
            name: name.to_string(),
            probability,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// Rate expression over parameters and stimuli
    pub rate: String,
    #[serde(default)]
    pub charge: f64,
}

impl Transition {
    pub fn new(from: &str, to: &str, rate: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            rate: rate.to_string(),
            charge: 0.0,
        }
    }

    pub fn with_charge(mut self, charge: f64) -> Self {
        self.charge = charge;
        self
    }
}

/// Named parameter with one value per parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub free: bool,
}

impl Parameter {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value],
            min: None,
            max: None,
            free: false,
        }
    }

    /// Mark as free within `[min, max]`
    pub fn free(mut self, min: f64, max: f64) -> Self {
        self.free = true;
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Value for a parameter set; shorter lists repeat their last value
    pub fn value(&self, set: usize) -> f64 {
        self.values
            .get(set)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovModel {
    pub name: String,
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub groups: Vec<StateGroup>,
}

impl MarkovModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: Vec::new(),
            transitions: Vec::new(),
            parameters: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn add_state(&mut self, state: State) {
        self.states.push(state);
    }

    pub fn add_transition(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn add_group(&mut self, name: &str, states: &[&str]) {
        self.groups.push(StateGroup {
            name: name.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
        });
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn get_parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    fn state_index(&self, name: &str) -> Result<usize> {
        self.states
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| ClampError::ModelError(format!("{}: no state named '{}'", self.name, name)))
    }

    /// Check names and rate expressions without evaluating them
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(ClampError::ModelError(format!("{}: model has no states", self.name)));
        }
        for (i, state) in self.states.iter().enumerate() {
            if self.states[..i].iter().any(|s| s.name == state.name) {
                return Err(ClampError::ModelError(format!(
                    "{}: duplicate state '{}'",
                    self.name, state.name
                )));
            }
        }
        for transition in &self.transitions {
            let from = self.state_index(&transition.from)?;
            let to = self.state_index(&transition.to)?;
            if from == to {
                return Err(ClampError::ModelError(format!(
                    "{}: self transition on '{}'",
                    self.name, transition.from
                )));
            }
            Expression::parse(&transition.rate)?;
        }
        for parameter in &self.parameters {
            if parameter.values.is_empty() {
                return Err(ClampError::ModelError(format!(
                    "{}: parameter '{}' has no value",
                    self.name, parameter.name
                )));
            }
        }
        for group in &self.groups {
            for state in &group.states {
                self.state_index(state)?;
            }
        }
        Ok(())
    }
}

impl KineticModel for MarkovModel {
    fn state_names(&self) -> Vec<String> {
        self.states.iter().map(|s| s.name.clone()).collect()
    }

    fn num_parameter_sets(&self) -> usize {
        self.parameters
            .iter()
            .map(|p| p.values.len())
            .max()
            .unwrap_or(1)
            .max(1)
    }

    fn kinetics(&self, set: usize, stimuli: &StimulusSnapshot) -> Result<EpochKinetics> {
        let n = self.states.len();

        let mut scope = Scope::new();
        for (name, value) in stimuli {
            scope.bind(name.as_str(), *value);
        }
        for parameter in &self.parameters {
            scope.bind(parameter.name.as_str(), parameter.value(set));
        }

        let mut rates = Array2::<f64>::zeros((n, n));
        let mut charges = Array2::<f64>::zeros((n, n));
        for transition in &self.transitions {
            let from = self.state_index(&transition.from)?;
            let to = self.state_index(&transition.to)?;
            let rate = Expression::parse(&transition.rate)?
                .eval(&scope)?
                .as_scalar()
                .ok_or_else(|| {
                    ClampError::ModelError(format!(
                        "{}: rate '{}' does not reduce to a single value",
                        self.name, transition.rate
                    ))
                })?;
            if !rate.is_finite() || rate < 0.0 {
                return Err(ClampError::ModelError(format!(
                    "{}: rate {} -> {} evaluates to {}",
                    self.name, transition.from, transition.to, rate
                )));
            }
            rates[[from, to]] += rate;
            charges[[from, to]] = transition.charge;
        }
        for i in 0..n {
            let exit: f64 = (0..n).filter(|&j| j != i).map(|j| rates[[i, j]]).sum();
            rates[[i, i]] = -exit;
        }

        let mut starting_probability: Array1<f64> = self.states.iter().map(|s| s.probability).collect();
        let total = starting_probability.sum();
        if !(total > 0.0) {
            return Err(ClampError::ModelError(format!(
                "{}: starting probabilities sum to {}",
                self.name, total
            )));
        }
        starting_probability /= total;

        let mut attributes = BTreeMap::new();
        for (i, state) in self.states.iter().enumerate() {
            for (name, value) in &state.attributes {
                attributes
                    .entry(name.clone())
                    .or_insert_with(|| Array1::<f64>::zeros(n))[i] = *value;
            }
        }

        Ok(EpochKinetics {
            rates,
            starting_probability,
            attributes,
            charges,
        })
    }

    fn parameters(&self, set: usize) -> Vec<(String, f64)> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.value(set)))
            .collect()
    }

    fn state_groups(&self) -> Vec<StateGroup> {
        self.groups.clone()
    }

    fn free_parameters(&self) -> Vec<FreeParameter> {
        let mut free = Vec::new();
        for parameter in self.parameters.iter().filter(|p| p.free) {
            if parameter.values.len() > 1 {
                for (set, value) in parameter.values.iter().enumerate() {
                    free.push(FreeParameter {
                        name: format!("{}[{}]", parameter.name, set),
                        value: *value,
                        min: parameter.min,
                        max: parameter.max,
                    });
                }
            } else {
                free.push(FreeParameter {
                    name: parameter.name.clone(),
                    value: parameter.value(0),
                    min: parameter.min,
                    max: parameter.max,
                });
            }
        }
        free
    }

    fn set_free_parameters(&mut self, values: &[f64]) -> Result<()> {
        let expected = self.free_parameters().len();
        if values.len() != expected {
            return Err(ClampError::ConfigError(format!(
                "{}: expected {} free parameter values, got {}",
                self.name,
                expected,
                values.len()
            )));
        }

        let mut remaining = values.iter();
        for parameter in self.parameters.iter_mut().filter(|p| p.free) {
            if parameter.values.is_empty() {
                parameter.values.push(0.0);
            }
            for slot in parameter.values.iter_mut() {
                if let Some(&value) = remaining.next() {
                    *slot = value;
                }
            }
        }
        log::debug!("{}: free parameters set to {:?}", self.name, values);
        Ok(())
    }
}

// ============================================================================
// STANDARD MODELS
// ============================================================================

pub mod models {
    use super::*;

    /// Names accepted by [`by_name`]
    pub const NAMES: &[&str] = &["two_state", "three_state_gating"];

    pub fn by_name(name: &str) -> Option<MarkovModel> {
        match name {
            "two_state" => Some(two_state(1.0, 2.0)),
            "three_state_gating" => Some(three_state_gating()),
            _ => None,
        }
    }

    /// Closed <-> open channel with constant rates, starting closed
    pub fn two_state(k12: f64, k21: f64) -> MarkovModel {
        let mut model = MarkovModel::new("TwoState");

        model.add_state(State::new("C", 1.0).with_attribute("open", 0.0));
        model.add_state(State::new("O", 0.0).with_attribute("open", 1.0));

        model.add_parameter(Parameter::new("k12", k12));
        model.add_parameter(Parameter::new("k21", k21));

        model.add_transition(Transition::new("C", "O", "k12"));
        model.add_transition(Transition::new("O", "C", "k21"));

        model
    }

    /// Sequential voltage-gated channel C1 <-> C2 <-> O driven by stimulus `V` (mV)
    pub fn three_state_gating() -> MarkovModel {
        let mut model = MarkovModel::new("ThreeStateGating");

        model.add_state(State::new("C1", 1.0).with_attribute("g", 0.0));
        model.add_state(State::new("C2", 0.0).with_attribute("g", 0.0));
        model.add_state(State::new("O", 0.0).with_attribute("g", 1.0));

        model.add_parameter(Parameter::new("a0", 200.0).free(1.0, 5000.0));
        model.add_parameter(Parameter::new("sa", 25.0));
        model.add_parameter(Parameter::new("b0", 50.0).free(1.0, 5000.0));
        model.add_parameter(Parameter::new("sb", 25.0));

        // Forward steps move gating charge outward
        let alpha = "a0 * exp(V / sa)";
        let beta = "b0 * exp(-V / sb)";
        model.add_transition(Transition::new("C1", "C2", alpha).with_charge(1.0));
        model.add_transition(Transition::new("C2", "C1", beta).with_charge(-1.0));
        model.add_transition(Transition::new("C2", "O", alpha).with_charge(1.0));
        model.add_transition(Transition::new("O", "C2", beta).with_charge(-1.0));

        model.add_group("closed", &["C1", "C2"]);

        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_state_kinetics() {
        let model = models::two_state(1.0, 2.0);
        model.validate().unwrap();

        let k = model.kinetics(0, &StimulusSnapshot::new()).unwrap();
        assert!((k.rates[[0, 1]] - 1.0).abs() < 1e-12);
        assert!((k.rates[[1, 0]] - 2.0).abs() < 1e-12);
        for row in k.rates.rows() {
            assert!(row.sum().abs() < 1e-12);
        }
        assert_eq!(k.starting_probability.to_vec(), vec![1.0, 0.0]);
        assert_eq!(k.attributes["open"].to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_voltage_dependence() {
        let model = models::three_state_gating();
        model.validate().unwrap();

        let mut stimuli = StimulusSnapshot::new();
        stimuli.insert("V".to_string(), 0.0);
        let rest = model.kinetics(0, &stimuli).unwrap();
        stimuli.insert("V".to_string(), 50.0);
        let depolarized = model.kinetics(0, &stimuli).unwrap();

        assert!((rest.rates[[0, 1]] - 200.0).abs() < 1e-9);
        assert!(depolarized.rates[[0, 1]] > rest.rates[[0, 1]]);
        assert!(depolarized.rates[[1, 0]] < rest.rates[[1, 0]]);
        assert!((depolarized.charges[[2, 1]] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_stimulus_is_error() {
        let model = models::three_state_gating();
        assert!(model.kinetics(0, &StimulusSnapshot::new()).is_err());
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut model = models::two_state(1.0, 2.0);
        model.get_parameter_mut("k12").unwrap().values = vec![-1.0];
        assert!(model.kinetics(0, &StimulusSnapshot::new()).is_err());
    }

    #[test]
    fn test_starting_probability_normalized() {
        let mut model = models::two_state(1.0, 2.0);
        model.states[0].probability = 3.0;
        model.states[1].probability = 1.0;
        let k = model.kinetics(0, &StimulusSnapshot::new()).unwrap();
        assert!((k.starting_probability[0] - 0.75).abs() < 1e-12);

        model.states[0].probability = 0.0;
        model.states[1].probability = 0.0;
        assert!(model.kinetics(0, &StimulusSnapshot::new()).is_err());
    }

    #[test]
    fn test_free_parameters_per_set() {
        let mut model = models::two_state(1.0, 2.0);
        {
            let k12 = model.get_parameter_mut("k12").unwrap();
            k12.values = vec![1.0, 3.0];
            k12.free = true;
            k12.min = Some(0.0);
            k12.max = Some(10.0);
        }
        assert_eq!(model.num_parameter_sets(), 2);

        let free = model.free_parameters();
        assert_eq!(free.len(), 2);
        assert_eq!(free[1].name, "k12[1]");

        model.set_free_parameters(&[4.0, 5.0]).unwrap();
        assert_eq!(model.get_parameter("k12").unwrap().values, vec![4.0, 5.0]);
        assert_eq!(model.parameters(1), vec![("k12".to_string(), 5.0), ("k21".to_string(), 2.0)]);

        assert!(model.set_free_parameters(&[1.0]).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_state() {
        let mut model = models::two_state(1.0, 2.0);
        model.add_transition(Transition::new("C", "X", "1"));
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let model = models::three_state_gating();
        let json = serde_json::to_string(&model).unwrap();
        let back: MarkovModel = serde_json::from_str(&json).unwrap();
        assert_eq!(model, back);
    }
}
