//! Model aggregation interface and a weighted-average reference implementation.

use fx_types::{validation_error, FxResult, ModelParams};

/// Merges participant models into the next global model.
pub trait Aggregator: Send {
    /// `updates` holds `(sample_size, model)` pairs ordered by participant id.
    fn aggregate(
        &mut self,
        updates: &[(f64, ModelParams)],
        current: &ModelParams,
    ) -> FxResult<ModelParams>;
}

/// Sample-size weighted average of participant models (FedAvg).
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverageAggregator;

impl Aggregator for WeightedAverageAggregator {
    fn aggregate(
        &mut self,
        updates: &[(f64, ModelParams)],
        current: &ModelParams,
    ) -> FxResult<ModelParams> {
        let Some((_, first)) = updates.first() else {
            return Ok(current.clone());
        };
        if !current.is_empty() && !current.same_shape(first) {
            return Err(validation_error!("participant model does not match the global model"));
        }
        if updates.iter().any(|(_, model)| !model.same_shape(first)) {
            return Err(validation_error!("participant models disagree in shape"));
        }
        let total: f64 = updates.iter().map(|(size, _)| *size).sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(validation_error!(
                "total sample size must be positive, got {total}"
            ));
        }

        let mut merged = ModelParams::new();
        for (name, values) in &first.tensors {
            let mut acc = vec![0.0; values.len()];
            for (size, model) in updates {
                let weight = size / total;
                for (a, v) in acc.iter_mut().zip(&model.tensors[name]) {
                    *a += weight * v;
                }
            }
            merged.tensors.insert(name.clone(), acc);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_by_sample_size() {
        let mut agg = WeightedAverageAggregator;
        let updates = vec![
            (3.0, ModelParams::new().with_tensor("w", vec![1.0, 0.0])),
            (1.0, ModelParams::new().with_tensor("w", vec![5.0, 4.0])),
        ];
        let merged = agg.aggregate(&updates, &ModelParams::new()).unwrap();
        assert_eq!(merged.get("w"), Some(&[2.0, 1.0][..]));
    }

    #[test]
    fn no_updates_keeps_current_model() {
        let mut agg = WeightedAverageAggregator;
        let current = ModelParams::new().with_tensor("b", vec![0.5]);
        assert_eq!(agg.aggregate(&[], &current).unwrap(), current);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let mut agg = WeightedAverageAggregator;
        let current = ModelParams::new().with_tensor("w", vec![0.0, 0.0]);
        let updates = vec![
            (1.0, ModelParams::new().with_tensor("w", vec![1.0, 1.0])),
            (1.0, ModelParams::new().with_tensor("w", vec![1.0])),
        ];
        assert!(agg.aggregate(&updates, &current).is_err());

        let wrong = vec![(1.0, ModelParams::new().with_tensor("v", vec![1.0, 1.0]))];
        assert!(agg.aggregate(&wrong, &current).is_err());
    }

    #[test]
    fn rejects_zero_total_weight() {
        let mut agg = WeightedAverageAggregator;
        let updates = vec![(0.0, ModelParams::new().with_tensor("w", vec![1.0]))];
        assert!(agg.aggregate(&updates, &ModelParams::new()).is_err());
    }
}
