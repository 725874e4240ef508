//! Series expressions.
//!
//! A small arithmetic language over named scalars and time series, used for
//! stimulus shapes, derived waveforms, summaries and model rate expressions.
//!
//! ```text
//! 0.5 * (1 - exp(-t / tau))
//! max(P_open) - min(P_open)
//! k0 * exp(V / 25)
//! ```
//!
//! Operators `+ - * / ^` act elementwise; `.*`, `./` and `.^` are accepted as
//! aliases. A scalar combined with a series broadcasts over it; two series
//! must have equal length.

use ndarray::{Array1, Zip};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
identifier = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

add = { "+" }
sub = { "-" }
mul = { ".*" | "*" }
div = { "./" | "/" }
pow = { ".^" | "^" }
neg = { "-" }
pos = { "+" }

call = { identifier ~ "(" ~ (expr ~ ("," ~ expr)*)? ~ ")" }
primary = _{ number | call | identifier | "(" ~ expr ~ ")" }
power = { primary ~ (pow ~ unary)? }
unary = { (neg | pos)* ~ power }
product = { unary ~ ((mul | div) ~ unary)* }
expr = { product ~ ((add | sub) ~ product)* }

equation = { SOI ~ expr ~ EOI }
"#]
struct ExpressionParser;

/// Expression failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("cannot parse expression: {0}")]
    Parse(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("wrong number of arguments: {0}")]
    Arity(String),

    #[error("shape mismatch: {0}")]
    Shape(String),
}

type EvalResult<T> = std::result::Result<T, ExpressionError>;

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Series(Array1<f64>),
}

impl Value {
    /// The scalar, if this value reduces to one
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(x) => Some(*x),
            Value::Series(s) if s.len() == 1 => Some(s[0]),
            Value::Series(_) => None,
        }
    }

    /// Expand into a series of `len` points, broadcasting scalars.
    pub fn into_series(self, len: usize) -> EvalResult<Array1<f64>> {
        match self {
            Value::Scalar(x) => Ok(Array1::from_elem(len, x)),
            Value::Series(s) if s.len() == len => Ok(s),
            Value::Series(s) => Err(ExpressionError::Shape(format!(
                "expected {} points, found {}",
                len,
                s.len()
            ))),
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(x) => Value::Scalar(f(x)),
            Value::Series(s) => Value::Series(s.mapv(f)),
        }
    }

    fn zip_with(self, other: Value, f: impl Fn(f64, f64) -> f64) -> EvalResult<Value> {
        Ok(match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
            (Value::Series(a), Value::Scalar(b)) => Value::Series(a.mapv(|x| f(x, b))),
            (Value::Scalar(a), Value::Series(b)) => Value::Series(b.mapv(|y| f(a, y))),
            (Value::Series(a), Value::Series(b)) => {
                if a.len() != b.len() {
                    return Err(ExpressionError::Shape(format!(
                        "series of length {} and {}",
                        a.len(),
                        b.len()
                    )));
                }
                Value::Series(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
            }
        })
    }

    fn reduce(self, init: f64, f: impl Fn(f64, f64) -> f64) -> f64 {
        match self {
            Value::Scalar(x) => x,
            Value::Series(s) => s.iter().copied().fold(init, f),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<Array1<f64>> for Value {
    fn from(s: Array1<f64>) -> Self {
        Value::Series(s)
    }
}

/// Variable bindings for evaluation
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or rebind) a variable
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Variable(String),
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> EvalResult<Self> {
        let mut pairs = ExpressionParser::parse(Rule::equation, source)
            .map_err(|e| ExpressionError::Parse(e.to_string()))?;
        let equation = pairs
            .next()
            .ok_or_else(|| ExpressionError::Parse(source.to_string()))?;
        let expr = equation
            .into_inner()
            .next()
            .ok_or_else(|| ExpressionError::Parse(source.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            root: build(expr)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names referenced as variables, in order of first appearance
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_variables(&self.root, &mut names);
        names
    }

    pub fn eval(&self, scope: &Scope) -> EvalResult<Value> {
        eval(&self.root, scope)
    }
}

fn collect_variables(node: &Node, names: &mut Vec<String>) {
    match node {
        Node::Number(_) => {}
        Node::Variable(name) => {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        Node::Negate(inner) => collect_variables(inner, names),
        Node::Binary(_, lhs, rhs) => {
            collect_variables(lhs, names);
            collect_variables(rhs, names);
        }
        Node::Call(_, args) => args.iter().for_each(|a| collect_variables(a, names)),
    }
}

// ============================================================================
// PARSE TREE -> AST
// ============================================================================

fn missing(rule: &str) -> ExpressionError {
    ExpressionError::Parse(format!("malformed {}", rule))
}

fn build(pair: Pair<Rule>) -> EvalResult<Node> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(Node::Number)
            .map_err(|e| ExpressionError::Parse(e.to_string())),
        Rule::identifier => Ok(Node::Variable(pair.as_str().to_string())),
        Rule::call => {
            let mut inner = pair.into_inner();
            let name = inner.next().ok_or_else(|| missing("call"))?.as_str().to_string();
            let args = inner.map(build).collect::<EvalResult<Vec<_>>>()?;
            Ok(Node::Call(name, args))
        }
        Rule::expr | Rule::product => {
            let mut inner = pair.into_inner();
            let mut lhs = build(inner.next().ok_or_else(|| missing("operand"))?)?;
            while let Some(op) = inner.next() {
                let op = match op.as_rule() {
                    Rule::add => BinaryOp::Add,
                    Rule::sub => BinaryOp::Sub,
                    Rule::mul => BinaryOp::Mul,
                    _ => BinaryOp::Div,
                };
                let rhs = build(inner.next().ok_or_else(|| missing("operand"))?)?;
                lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
        Rule::unary => {
            let mut negations = 0usize;
            let mut operand = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::neg => negations += 1,
                    Rule::pos => {}
                    _ => operand = Some(build(p)?),
                }
            }
            let node = operand.ok_or_else(|| missing("unary"))?;
            Ok(if negations % 2 == 1 {
                Node::Negate(Box::new(node))
            } else {
                node
            })
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = build(inner.next().ok_or_else(|| missing("power"))?)?;
            match (inner.next(), inner.next()) {
                (Some(_), Some(exponent)) => Ok(Node::Binary(
                    BinaryOp::Pow,
                    Box::new(base),
                    Box::new(build(exponent)?),
                )),
                _ => Ok(base),
            }
        }
        other => Err(ExpressionError::Parse(format!("unexpected {:?}", other))),
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

fn eval(node: &Node, scope: &Scope) -> EvalResult<Value> {
    match node {
        Node::Number(x) => Ok(Value::Scalar(*x)),
        Node::Variable(name) => match scope.get(name) {
            Some(value) => Ok(value.clone()),
            None if name == "pi" => Ok(Value::Scalar(std::f64::consts::PI)),
            None => Err(ExpressionError::UnknownVariable(name.clone())),
        },
        Node::Negate(inner) => Ok(eval(inner, scope)?.map(|x| -x)),
        Node::Binary(op, lhs, rhs) => {
            let a = eval(lhs, scope)?;
            let b = eval(rhs, scope)?;
            match op {
                BinaryOp::Add => a.zip_with(b, |x, y| x + y),
                BinaryOp::Sub => a.zip_with(b, |x, y| x - y),
                BinaryOp::Mul => a.zip_with(b, |x, y| x * y),
                BinaryOp::Div => a.zip_with(b, |x, y| x / y),
                BinaryOp::Pow => a.zip_with(b, f64::powf),
            }
        }
        Node::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<EvalResult<Vec<_>>>()?;
            call(name, values)
        }
    }
}

fn expect_args(name: &str, values: &[Value], expected: usize) -> EvalResult<()> {
    if values.len() != expected {
        return Err(ExpressionError::Arity(format!(
            "{}() takes {} argument(s), found {}",
            name,
            expected,
            values.len()
        )));
    }
    Ok(())
}

fn call(name: &str, mut values: Vec<Value>) -> EvalResult<Value> {
    let elementwise: Option<fn(f64) -> f64> = match name {
        "exp" => Some(f64::exp),
        "log" => Some(f64::ln),
        "log10" => Some(f64::log10),
        "sqrt" => Some(f64::sqrt),
        "abs" => Some(f64::abs),
        "sin" => Some(f64::sin),
        "cos" => Some(f64::cos),
        "tan" => Some(f64::tan),
        "tanh" => Some(f64::tanh),
        "floor" => Some(f64::floor),
        "ceil" => Some(f64::ceil),
        "round" => Some(f64::round),
        _ => None,
    };
    if let Some(f) = elementwise {
        expect_args(name, &values, 1)?;
        return Ok(values.remove(0).map(f));
    }

    match name {
        "min" | "max" if values.len() == 2 => {
            let b = values.remove(1);
            let a = values.remove(0);
            if name == "min" {
                a.zip_with(b, f64::min)
            } else {
                a.zip_with(b, f64::max)
            }
        }
        "min" => {
            expect_args(name, &values, 1)?;
            Ok(Value::Scalar(values.remove(0).reduce(f64::INFINITY, f64::min)))
        }
        "max" => {
            expect_args(name, &values, 1)?;
            Ok(Value::Scalar(values.remove(0).reduce(f64::NEG_INFINITY, f64::max)))
        }
        "sum" => {
            expect_args(name, &values, 1)?;
            Ok(Value::Scalar(values.remove(0).reduce(0.0, |a, b| a + b)))
        }
        "mean" => {
            expect_args(name, &values, 1)?;
            Ok(Value::Scalar(match values.remove(0) {
                Value::Scalar(x) => x,
                Value::Series(s) => s.mean().unwrap_or(f64::NAN),
            }))
        }
        "numel" => {
            expect_args(name, &values, 1)?;
            Ok(Value::Scalar(match &values[0] {
                Value::Scalar(_) => 1.0,
                Value::Series(s) => s.len() as f64,
            }))
        }
        "first" | "last" => {
            expect_args(name, &values, 1)?;
            match values.remove(0) {
                Value::Scalar(x) => Ok(Value::Scalar(x)),
                Value::Series(s) => {
                    let picked = if name == "first" {
                        s.iter().next().copied()
                    } else {
                        s.iter().next_back().copied()
                    };
                    picked
                        .map(Value::Scalar)
                        .ok_or_else(|| ExpressionError::Shape(format!("{}() of an empty series", name)))
                }
            }
        }
        "pow" => {
            expect_args(name, &values, 2)?;
            let b = values.remove(1);
            values.remove(0).zip_with(b, f64::powf)
        }
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn scalar(src: &str, scope: &Scope) -> f64 {
        Expression::parse(src)
            .unwrap()
            .eval(scope)
            .unwrap()
            .as_scalar()
            .unwrap()
    }

    #[test]
    fn test_precedence() {
        let scope = Scope::new();
        assert!((scalar("1 + 2 * 3", &scope) - 7.0).abs() < 1e-12);
        assert!((scalar("2 ^ 3 ^ 2", &scope) - 512.0).abs() < 1e-9);
        assert!((scalar("-2 ^ 2", &scope) + 4.0).abs() < 1e-12);
        assert!((scalar("2 ^ -1", &scope) - 0.5).abs() < 1e-12);
        assert!((scalar("(1 + 2) * 3", &scope) - 9.0).abs() < 1e-12);
        assert!((scalar("10 - 4 - 3", &scope) - 3.0).abs() < 1e-12);
        assert!((scalar("1.5e2 ./ 3", &scope) - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_variables_and_constants() {
        let mut scope = Scope::new();
        scope.bind("tau", 2.0).bind("t", 2.0);
        let v = scalar("1 - exp(-t / tau)", &scope);
        assert!((v - (1.0 - (-1.0f64).exp())).abs() < 1e-12);
        assert!((scalar("cos(pi)", &scope) + 1.0).abs() < 1e-12);

        scope.bind("pi", 3.0);
        assert!((scalar("pi", &scope) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_series_broadcast() {
        let mut scope = Scope::new();
        scope.bind("t", array![0.0, 1.0, 2.0]);
        let v = Expression::parse("2 * t + 1").unwrap().eval(&scope).unwrap();
        assert_eq!(v, Value::Series(array![1.0, 3.0, 5.0]));

        let v = Expression::parse("t .* t").unwrap().eval(&scope).unwrap();
        assert_eq!(v, Value::Series(array![0.0, 1.0, 4.0]));
    }

    #[test]
    fn test_reductions() {
        let mut scope = Scope::new();
        scope.bind("x", array![3.0, -1.0, 4.0, 2.0]);
        assert!((scalar("max(x)", &scope) - 4.0).abs() < 1e-12);
        assert!((scalar("min(x)", &scope) + 1.0).abs() < 1e-12);
        assert!((scalar("mean(x)", &scope) - 2.0).abs() < 1e-12);
        assert!((scalar("sum(x)", &scope) - 8.0).abs() < 1e-12);
        assert!((scalar("numel(x)", &scope) - 4.0).abs() < 1e-12);
        assert!((scalar("last(x) - first(x)", &scope) + 1.0).abs() < 1e-12);

        let v = Expression::parse("max(x, 0)").unwrap().eval(&scope).unwrap();
        assert_eq!(v, Value::Series(array![3.0, 0.0, 4.0, 2.0]));
    }

    #[test]
    fn test_errors() {
        let scope = Scope::new();
        assert!(matches!(Expression::parse("1 +"), Err(ExpressionError::Parse(_))));
        assert!(matches!(
            Expression::parse("y").unwrap().eval(&scope),
            Err(ExpressionError::UnknownVariable(_))
        ));
        assert!(matches!(
            Expression::parse("foo(1)").unwrap().eval(&scope),
            Err(ExpressionError::UnknownFunction(_))
        ));
        assert!(matches!(
            Expression::parse("exp(1, 2)").unwrap().eval(&scope),
            Err(ExpressionError::Arity(_))
        ));

        let mut scope = Scope::new();
        scope.bind("a", array![1.0, 2.0]).bind("b", array![1.0, 2.0, 3.0]);
        assert!(matches!(
            Expression::parse("a + b").unwrap().eval(&scope),
            Err(ExpressionError::Shape(_))
        ));
    }

    #[test]
    fn test_variable_listing() {
        let expr = Expression::parse("k0 * exp(V / s) + k0").unwrap();
        assert_eq!(expr.variables(), vec!["k0", "V", "s"]);
    }

    #[test]
    fn test_into_series() {
        assert_eq!(Value::Scalar(2.0).into_series(3).unwrap(), array![2.0, 2.0, 2.0]);
        assert!(Value::Series(array![1.0]).into_series(2).is_err());
    }
}
