//! Game variables - named scalars with a type tag
//!
//! Variables are globally scoped unless their name is prefixed with an actor
//! or setting key (`guard.suspicion`). Names starting with the reserved `*`
//! marker survive a workflow reset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved marker: variables whose name starts with this survive reset.
pub const PRESERVED_PREFIX: char = '*';

/// A scalar variable value.
///
/// Comparisons coerce both sides to the declared (left-hand) type; missing
/// variables compare as the type default (false / 0 / "").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl VarValue {
    /// The default value for this value's type.
    pub fn type_default(&self) -> VarValue {
        match self {
            VarValue::Bool(_) => VarValue::Bool(false),
            VarValue::Number(_) => VarValue::Number(0.0),
            VarValue::Text(_) => VarValue::Text(String::new()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            VarValue::Bool(b) => *b,
            VarValue::Number(n) => *n != 0.0,
            VarValue::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }

    pub fn as_number(&self) -> f64 {
        match self {
            VarValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            VarValue::Number(n) => *n,
            VarValue::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            VarValue::Bool(b) => b.to_string(),
            VarValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            VarValue::Text(s) => s.clone(),
        }
    }

    /// Compare against another value, coercing `other` to this value's type.
    pub fn compare(&self, op: CompareOp, other: &VarValue) -> bool {
        match self {
            VarValue::Bool(lhs) => {
                let rhs = other.as_bool();
                match op {
                    CompareOp::Eq => *lhs == rhs,
                    CompareOp::Ne => *lhs != rhs,
                    // Ordering over booleans: false < true
                    CompareOp::Lt => !*lhs & rhs,
                    CompareOp::Gt => *lhs & !rhs,
                    CompareOp::Le => !*lhs | rhs,
                    CompareOp::Ge => *lhs | !rhs,
                    CompareOp::Contains | CompareOp::NotContains => false,
                }
            }
            VarValue::Number(lhs) => {
                let rhs = other.as_number();
                match op {
                    CompareOp::Eq => *lhs == rhs,
                    CompareOp::Ne => *lhs != rhs,
                    CompareOp::Lt => *lhs < rhs,
                    CompareOp::Gt => *lhs > rhs,
                    CompareOp::Le => *lhs <= rhs,
                    CompareOp::Ge => *lhs >= rhs,
                    CompareOp::Contains | CompareOp::NotContains => false,
                }
            }
            VarValue::Text(lhs) => {
                let rhs = other.as_text();
                let lhs_lower = lhs.to_lowercase();
                let rhs_lower = rhs.to_lowercase();
                match op {
                    CompareOp::Eq => *lhs == rhs,
                    CompareOp::Ne => *lhs != rhs,
                    CompareOp::Lt => *lhs < rhs,
                    CompareOp::Gt => *lhs > rhs,
                    CompareOp::Le => *lhs <= rhs,
                    CompareOp::Ge => *lhs >= rhs,
                    CompareOp::Contains => lhs_lower.contains(&rhs_lower),
                    CompareOp::NotContains => !lhs_lower.contains(&rhs_lower),
                }
            }
        }
    }
}

impl PartialEq for VarValue {
    fn eq(&self, other: &Self) -> bool {
        self.compare(CompareOp::Eq, other)
    }
}

/// Comparison operators for variable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    Contains,
    NotContains,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
            CompareOp::Contains => "contains",
            CompareOp::NotContains => "not_contains",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CompareOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" | "eq" => Ok(CompareOp::Eq),
            "!=" | "ne" => Ok(CompareOp::Ne),
            "<" | "lt" => Ok(CompareOp::Lt),
            ">" | "gt" => Ok(CompareOp::Gt),
            "<=" | "le" => Ok(CompareOp::Le),
            ">=" | "ge" => Ok(CompareOp::Ge),
            "contains" => Ok(CompareOp::Contains),
            "not_contains" => Ok(CompareOp::NotContains),
            _ => Err(()),
        }
    }
}

/// Ordered variable storage for one tab.
///
/// Backed by a BTreeMap so serialization order is stable across saves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableMap {
    entries: BTreeMap<String, VarValue>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.entries.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: VarValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<VarValue> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarValue)> {
        self.entries.iter()
    }

    /// Whether a variable name carries the reserved preserved marker.
    pub fn is_preserved_name(name: &str) -> bool {
        name.starts_with(PRESERVED_PREFIX)
    }

    /// Extract the entries that survive a workflow reset.
    pub fn preserved(&self) -> VariableMap {
        VariableMap {
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| Self::is_preserved_name(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    /// Merge `other` into self, overwriting on collision.
    pub fn merge(&mut self, other: VariableMap) {
        self.entries.extend(other.entries);
    }
}
