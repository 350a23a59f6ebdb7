//! Search space definitions and expansion into finite action spaces.

use fx_types::{config_error, FedExConfig, FxError, FxResult, HyperConfig, ParameterValue};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name (e.g. "optimizer.lr").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Not searched; every configuration carries this value.
    Fixed { value: ParameterValue },
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    pub fn is_fixed(&self) -> bool {
        matches!(self, ParameterKind::Fixed { .. })
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fixed(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Fixed {
                value: value.into(),
            },
        });
        self
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Partition into the fixed values and the searchable remainder.
    pub fn split(&self) -> (HyperConfig, SearchSpace) {
        let mut fixed = HyperConfig::new();
        let mut searchable = SearchSpace::new();
        for param in &self.parameters {
            match &param.kind {
                ParameterKind::Fixed { value } => {
                    fixed.insert(param.name.clone(), value.clone());
                }
                _ => searchable.parameters.push(param.clone()),
            }
        }
        (fixed, searchable)
    }

    /// Check that every searchable parameter has at least one candidate.
    pub fn validate(&self) -> FxResult<()> {
        for param in &self.parameters {
            check_parameter(param)?;
        }
        Ok(())
    }
}

fn check_parameter(param: &ParameterDef) -> FxResult<()> {
    let invalid = |reason: String| {
        Err(FxError::InvalidSearchSpace(format!(
            "parameter '{}': {reason}",
            param.name
        )))
    };
    match &param.kind {
        ParameterKind::Fixed { .. } => Ok(()),
        ParameterKind::FloatRange { low, high } => {
            if !low.is_finite() || !high.is_finite() {
                invalid(format!("non-finite bounds [{low}, {high}]"))
            } else if low > high {
                invalid(format!("empty range [{low}, {high}]"))
            } else {
                Ok(())
            }
        }
        ParameterKind::IntRange { low, high } => {
            if low > high {
                invalid(format!("empty range [{low}, {high}]"))
            } else {
                Ok(())
            }
        }
        ParameterKind::LogUniform { low, high } => {
            if !low.is_finite() || !high.is_finite() || *low <= 0.0 {
                invalid(format!("log-uniform bounds must be positive, got [{low}, {high}]"))
            } else if low > high {
                invalid(format!("empty range [{low}, {high}]"))
            } else {
                Ok(())
            }
        }
        ParameterKind::Choice { values } => {
            if values.is_empty() {
                invalid("no choices".to_string())
            } else {
                Ok(())
            }
        }
    }
}

/// Evenly spaced candidates for one searchable parameter.
fn grid_values(param: &ParameterDef, float_steps: usize) -> Vec<ParameterValue> {
    let values: Vec<ParameterValue> = match &param.kind {
        ParameterKind::Fixed { value } => vec![value.clone()],
        ParameterKind::FloatRange { low, high } => {
            let steps = float_steps.max(2);
            (0..steps)
                .map(|i| {
                    let t = i as f64 / (steps - 1) as f64;
                    ParameterValue::Float(low + t * (high - low))
                })
                .collect()
        }
        ParameterKind::IntRange { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
        ParameterKind::LogUniform { low, high } => {
            let steps = float_steps.max(2);
            let log_low = low.ln();
            let log_high = high.ln();
            (0..steps)
                .map(|i| {
                    let t = i as f64 / (steps - 1) as f64;
                    ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                })
                .collect()
        }
        ParameterKind::Choice { values } => values
            .iter()
            .map(|v| ParameterValue::Json(v.clone()))
            .collect(),
    };
    dedup(values)
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> FxResult<Self> {
        space.validate()?;
        Ok(Self { space })
    }

    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R) -> HyperConfig {
        let mut params = HyperConfig::new();

        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::Fixed { value } => value.clone(),
                ParameterKind::FloatRange { low, high } => {
                    ParameterValue::Float(rng.random_range(*low..=*high))
                }
                ParameterKind::IntRange { low, high } => {
                    ParameterValue::Int(rng.random_range(*low..=*high))
                }
                ParameterKind::LogUniform { low, high } => {
                    let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                    ParameterValue::Float(log_val.exp())
                }
                ParameterKind::Choice { values } => {
                    let idx = rng.random_range(0..values.len());
                    ParameterValue::Json(values[idx].clone())
                }
            };
            params.insert(param.name.clone(), value);
        }

        params
    }

    pub fn suggest<R: Rng + ?Sized>(&self, rng: &mut R, count: usize) -> Vec<HyperConfig> {
        (0..count).map(|_| self.sample_one(rng)).collect()
    }
}

// ---------------------------------------------------------------------------
// Action space
// ---------------------------------------------------------------------------

/// Finite candidate lists, one per independently sampled aspect, plus the
/// fixed part of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpace {
    fixed: HyperConfig,
    aspects: Vec<Vec<HyperConfig>>,
}

impl ActionSpace {
    /// Build the action space the configuration asks for.
    pub fn build<R: Rng + ?Sized>(
        space: &SearchSpace,
        config: &FedExConfig,
        rng: &mut R,
    ) -> FxResult<Self> {
        let (fixed, searchable) = space.split();
        if searchable.parameters.is_empty() {
            return Err(FxError::InvalidSearchSpace(
                "search space has no searchable parameters".into(),
            ));
        }
        searchable.validate()?;

        let aspects = if config.flatten_search_space {
            if config.num_arms == 0 {
                return Err(config_error!("num_arms must be positive"));
            }
            let arms = dedup(RandomSearch::new(searchable)?.suggest(rng, config.num_arms));
            debug!(requested = config.num_arms, drawn = arms.len(), "flattened search space");
            vec![arms]
        } else {
            searchable
                .parameters
                .iter()
                .map(|param| {
                    grid_values(param, config.grid_steps)
                        .into_iter()
                        .map(|value| {
                            let mut cfg = HyperConfig::new();
                            cfg.insert(param.name.clone(), value);
                            cfg
                        })
                        .collect()
                })
                .collect()
        };

        let action_space = Self::from_candidates(fixed, aspects)?;
        info!(sizes = ?action_space.sizes(), "built action space");
        Ok(action_space)
    }

    /// Assemble an action space from explicit candidate lists.
    pub fn from_candidates(fixed: HyperConfig, aspects: Vec<Vec<HyperConfig>>) -> FxResult<Self> {
        if aspects.is_empty() {
            return Err(FxError::InvalidSearchSpace("no aspects".into()));
        }
        if let Some(i) = aspects.iter().position(Vec::is_empty) {
            return Err(FxError::InvalidSearchSpace(format!(
                "aspect {i} has no candidates"
            )));
        }
        Ok(Self { fixed, aspects })
    }

    pub fn fixed(&self) -> &HyperConfig {
        &self.fixed
    }

    pub fn aspects(&self) -> &[Vec<HyperConfig>] {
        &self.aspects
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.aspects.iter().map(Vec::len).collect()
    }

    /// Overlay sampled per-aspect configurations onto the fixed values.
    pub fn merge(&self, sampled: &[HyperConfig]) -> HyperConfig {
        let mut merged = self.fixed.clone();
        for cfg in sampled {
            merged.extend(cfg.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub(crate) fn into_aspects(self) -> Vec<Vec<HyperConfig>> {
        self.aspects
    }
}
