//! Feature values
//!
//! A feature is one tunable query parameter. Values are never changed in
//! place: factories always hand back fresh instances, so an experiment can be
//! cloned into the next generation without aliasing its parents.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::param_string::{ParamString, ParamStringList};

/// Render a number the way templates and request parameters expect it.
///
/// Integers drop the decimal point, very large or very small magnitudes use
/// scientific notation, values under 100 with a real fractional part keep
/// three decimals, everything else keeps one.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{}", v as i64);
    }
    let abs = v.abs();
    if abs > 10000.0 || abs < 0.001 {
        return format!("{:e}", v);
    }
    let frac = (v - v.trunc()).abs();
    if abs < 100.0 && frac > 0.001 {
        format!("{:.3}", v)
    } else {
        format!("{:.1}", v)
    }
}

/// Snap a value to what `format_number` would print, so that a rendered
/// instance parses back to exactly the same number.
pub fn snap_number(v: f64) -> f64 {
    let mut x = v;
    for _ in 0..4 {
        let y: f64 = format_number(x).parse().unwrap_or(x);
        if y == x {
            break;
        }
        x = y;
    }
    x
}

/// `field^weight`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedField {
    pub field: String,
    pub weight: f64,
}

impl WeightedField {
    pub fn new(field: impl Into<String>, weight: f64) -> Self {
        Self {
            field: field.into(),
            weight,
        }
    }

    /// Split a `name^weight` declaration. A bare name has no weight.
    pub fn parse_declaration(decl: &str) -> Result<(String, Option<f64>), ConfigError> {
        let decl = decl.trim();
        match decl.split_once('^') {
            None => {
                if decl.is_empty() {
                    return Err(ConfigError::Parse("empty field name".to_string()));
                }
                Ok((decl.to_string(), None))
            }
            Some((name, weight)) => {
                let weight: f64 = weight.trim().parse().map_err(|_| {
                    ConfigError::Parse(format!("bad weight in field declaration '{}'", decl))
                })?;
                if name.trim().is_empty() {
                    return Err(ConfigError::Parse(format!("empty field name in '{}'", decl)));
                }
                Ok((name.trim().to_string(), Some(weight)))
            }
        }
    }
}

impl fmt::Display for WeightedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{:?}", self.field, self.weight)
    }
}

/// Ordered list of weighted fields, at most one entry per field name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightedFields {
    pub fields: Vec<WeightedField>,
}

impl WeightedFields {
    pub fn new(fields: Vec<WeightedField>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&WeightedField> {
        self.fields.iter().find(|f| f.field == field)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.field.as_str())
    }
}

impl fmt::Display for WeightedFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.fields.iter().map(|w| w.to_string()).collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    And,
    Or,
    Unspecified,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::And => write!(f, "AND"),
            Operator::Or => write!(f, "OR"),
            Operator::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

/// Minimum-should-match for OR queries. Percentages are stored as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MinShouldMatch {
    None,
    Int(i64),
    Percent(f64),
}

impl MinShouldMatch {
    pub fn render(&self) -> Option<String> {
        match self {
            MinShouldMatch::None => None,
            MinShouldMatch::Int(n) => Some(n.to_string()),
            MinShouldMatch::Percent(p) => Some(format!("{}%", (p * 100.0).round() as i64)),
        }
    }

    /// Number of query terms that must match out of `terms`.
    pub fn required(&self, terms: usize) -> usize {
        let n = terms as i64;
        let required = match self {
            MinShouldMatch::None => 1,
            MinShouldMatch::Int(k) if *k < 0 => n + k,
            MinShouldMatch::Int(k) => *k,
            MinShouldMatch::Percent(p) if *p < 0.0 => n - (n as f64 * -p).floor() as i64,
            MinShouldMatch::Percent(p) => (n as f64 * p).floor() as i64,
        };
        required.clamp(1, n.max(1)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryOperator {
    pub operator: Operator,
    pub mm: MinShouldMatch,
}

impl QueryOperator {
    pub fn and() -> Self {
        Self {
            operator: Operator::And,
            mm: MinShouldMatch::None,
        }
    }

    pub fn or(mm: MinShouldMatch) -> Self {
        Self {
            operator: Operator::Or,
            mm,
        }
    }

    /// Terms required to match for a query of `terms` terms.
    pub fn required(&self, terms: usize) -> usize {
        match self.operator {
            Operator::And => terms.max(1),
            _ => self.mm.required(terms),
        }
    }
}

impl Default for QueryOperator {
    fn default() -> Self {
        Self {
            operator: Operator::Unspecified,
            mm: MinShouldMatch::None,
        }
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mm.render() {
            Some(mm) => write!(f, "{} mm={}", self.operator, mm),
            None => write!(f, "{}", self.operator),
        }
    }
}

/// A set of plain strings, e.g. boost queries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StringList {
    pub values: Vec<String>,
}

impl StringList {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

/// One materialized parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Feature {
    WeightedFields(WeightedFields),
    Float(f64),
    Int(i64),
    String(String),
    StringList(StringList),
    ParamString(ParamString),
    ParamStringList(ParamStringList),
    QueryOperator(QueryOperator),
}

impl Feature {
    /// Expand into request parameters. List-valued features repeat the key.
    pub fn to_params(&self, name: &str) -> Vec<(String, String)> {
        let one = |v: String| vec![(name.to_string(), v)];
        match self {
            Feature::WeightedFields(w) => w
                .fields
                .iter()
                .map(|f| (name.to_string(), f.to_string()))
                .collect(),
            Feature::Float(v) => one(format_number(*v)),
            Feature::Int(v) => one(v.to_string()),
            Feature::String(s) => one(s.clone()),
            Feature::StringList(l) => l
                .values
                .iter()
                .map(|v| (name.to_string(), v.clone()))
                .collect(),
            Feature::ParamString(p) => one(p.rendered().to_string()),
            Feature::ParamStringList(l) => l
                .entries
                .iter()
                .map(|p| (name.to_string(), p.rendered().to_string()))
                .collect(),
            Feature::QueryOperator(op) => {
                let mut params = Vec::new();
                if op.operator != Operator::Unspecified {
                    params.push(("q.op".to_string(), op.operator.to_string()));
                }
                if let Some(mm) = op.mm.render() {
                    params.push(("mm".to_string(), mm));
                }
                params
            }
        }
    }
}
