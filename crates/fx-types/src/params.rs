//! Concrete hyperparameter values and model parameter containers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// One concrete configuration: parameter name to value, in name order.
pub type HyperConfig = BTreeMap<String, ParameterValue>;

/// Model state exchanged with participants: tensor name to flattened values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub tensors: BTreeMap<String, Vec<f64>>,
}

impl ModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tensor(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.tensors.insert(name.into(), values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.tensors.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// True when both models carry the same tensor names with equal lengths.
    pub fn same_shape(&self, other: &ModelParams) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(other.tensors.iter())
                .all(|((na, va), (nb, vb))| na == nb && va.len() == vb.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_values_deserialize_by_shape() {
        let int: ParameterValue = serde_json::from_str("4").unwrap();
        assert_eq!(int, ParameterValue::Int(4));
        let float: ParameterValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(float, ParameterValue::Float(0.25));
        let text: ParameterValue = serde_json::from_str("\"sgd\"").unwrap();
        assert_eq!(text, ParameterValue::Json(serde_json::json!("sgd")));
        assert_eq!(text.as_f64(), None);
        assert_eq!(int.as_f64(), Some(4.0));
    }

    #[test]
    fn model_shape_comparison() {
        let a = ModelParams::new().with_tensor("w", vec![0.0; 3]);
        let b = ModelParams::new().with_tensor("w", vec![1.0; 3]);
        let c = ModelParams::new().with_tensor("w", vec![1.0; 2]);
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
        assert_eq!(b.get("w"), Some(&[1.0, 1.0, 1.0][..]));
    }
}
