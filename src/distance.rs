//! Pluggable metrics over indexed objects. Weighted forms reinterpret the
//! metric through a per-dimension weight vector that can change between
//! queries on the same tree; every weight change bumps `weights_epoch` so
//! the tree can tell when its stored radii no longer match the live metric.

use crate::error::{Error, Result};
use crate::object::FeatureVector;

/// A metric over `O`: non-negative, symmetric, `d(a, a) = 0`, triangle
/// inequality. Implementations count evaluations for query statistics and
/// must not mutate the compared objects.
pub trait DistanceFunction<O> {
    /// Evaluate the metric. Errors only on invariant breakage (e.g.
    /// mismatched dimensions).
    fn distance(&mut self, a: &O, b: &O) -> Result<f64>;

    /// Replace the weight vector. Weights must be non-empty, finite and
    /// non-negative; anything else would break the metric axioms the tree
    /// prunes with. Metrics without weights reject the call.
    fn set_weights(&mut self, _weights: Vec<f64>) -> Result<()> {
        Err(Error::Invariant(
            "this distance function does not support weights".into(),
        ))
    }

    /// Current weight vector, if the metric carries one.
    fn weights(&self) -> Option<&[f64]> {
        None
    }

    /// Bumped by every successful `set_weights`; 0 for weightless metrics.
    fn weights_epoch(&self) -> u64 {
        0
    }

    fn reset_statistics(&mut self);

    fn distance_count(&self) -> u64;
}

fn check_weights(weights: &[f64]) -> Result<()> {
    if weights.is_empty() {
        return Err(Error::Invariant("weight vector must not be empty".into()));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::Invariant(
            "weights must be finite and non-negative".into(),
        ));
    }
    Ok(())
}

fn check_dims(a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(Error::Invariant(format!(
            "feature vectors of dimension {} and {} are not comparable",
            a, b
        )));
    }
    Ok(())
}

/// Plain L2 distance.
#[derive(Debug, Default)]
pub struct EuclideanDistance {
    count: u64,
}

impl EuclideanDistance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distance_count(&self) -> u64 {
        self.count
    }

    pub fn reset_statistics(&mut self) {
        self.count = 0;
    }
}

impl<O: FeatureVector> DistanceFunction<O> for EuclideanDistance {
    fn distance(&mut self, a: &O, b: &O) -> Result<f64> {
        let (xs, ys) = (a.features(), b.features());
        check_dims(xs.len(), ys.len())?;
        let mut acc = 0.0;
        for (x, y) in xs.iter().zip(ys) {
            let diff = x - y;
            acc += diff * diff;
        }
        self.count += 1;
        Ok(acc.sqrt())
    }

    fn reset_statistics(&mut self) {
        EuclideanDistance::reset_statistics(self);
    }

    fn distance_count(&self) -> u64 {
        EuclideanDistance::distance_count(self)
    }
}

/// Weighted L2: `sqrt(sum_i w_i * (a_i - b_i)^2)`. An empty weight vector
/// means all ones.
#[derive(Debug, Default)]
pub struct WeightedEuclideanDistance {
    weights: Vec<f64>,
    epoch: u64,
    count: u64,
}

impl WeightedEuclideanDistance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the weight vector; rejects empty, negative or non-finite
    /// weights.
    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        check_weights(&weights)?;
        self.weights = weights;
        self.epoch += 1;
        Ok(())
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn distance_count(&self) -> u64 {
        self.count
    }

    pub fn reset_statistics(&mut self) {
        self.count = 0;
    }
}

impl<O: FeatureVector> DistanceFunction<O> for WeightedEuclideanDistance {
    fn distance(&mut self, a: &O, b: &O) -> Result<f64> {
        let (xs, ys) = (a.features(), b.features());
        check_dims(xs.len(), ys.len())?;
        if !self.weights.is_empty() {
            check_dims(xs.len(), self.weights.len())?;
        }
        let mut acc = 0.0;
        for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
            let w = self.weights.get(i).copied().unwrap_or(1.0);
            let diff = x - y;
            acc += w * diff * diff;
        }
        self.count += 1;
        Ok(acc.sqrt())
    }

    fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        WeightedEuclideanDistance::set_weights(self, weights)
    }

    fn weights(&self) -> Option<&[f64]> {
        Some(&self.weights)
    }

    fn weights_epoch(&self) -> u64 {
        self.epoch
    }

    fn reset_statistics(&mut self) {
        WeightedEuclideanDistance::reset_statistics(self);
    }

    fn distance_count(&self) -> u64 {
        WeightedEuclideanDistance::distance_count(self)
    }
}

/// Weighted L1: `sum_i w_i * |a_i - b_i|`. An empty weight vector means
/// all ones.
#[derive(Debug, Default)]
pub struct ManhattanDistance {
    weights: Vec<f64>,
    epoch: u64,
    count: u64,
}

impl ManhattanDistance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the weight vector; rejects empty, negative or non-finite
    /// weights.
    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        check_weights(&weights)?;
        self.weights = weights;
        self.epoch += 1;
        Ok(())
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn distance_count(&self) -> u64 {
        self.count
    }

    pub fn reset_statistics(&mut self) {
        self.count = 0;
    }
}

impl<O: FeatureVector> DistanceFunction<O> for ManhattanDistance {
    fn distance(&mut self, a: &O, b: &O) -> Result<f64> {
        let (xs, ys) = (a.features(), b.features());
        check_dims(xs.len(), ys.len())?;
        if !self.weights.is_empty() {
            check_dims(xs.len(), self.weights.len())?;
        }
        let mut acc = 0.0;
        for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
            let w = self.weights.get(i).copied().unwrap_or(1.0);
            acc += w * (x - y).abs();
        }
        self.count += 1;
        Ok(acc)
    }

    fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        ManhattanDistance::set_weights(self, weights)
    }

    fn weights(&self) -> Option<&[f64]> {
        Some(&self.weights)
    }

    fn weights_epoch(&self) -> u64 {
        self.epoch
    }

    fn reset_statistics(&mut self) {
        ManhattanDistance::reset_statistics(self);
    }

    fn distance_count(&self) -> u64 {
        ManhattanDistance::distance_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VectorObject;

    fn v(features: &[f64]) -> VectorObject {
        VectorObject::new(0, "", features.to_vec())
    }

    fn d<M: DistanceFunction<VectorObject>>(m: &mut M, a: &VectorObject, b: &VectorObject) -> f64 {
        m.distance(a, b).unwrap()
    }

    #[test]
    fn euclidean_values() {
        let mut m = EuclideanDistance::new();
        let a = v(&[0.0, 0.0]);
        let b = v(&[3.0, 4.0]);
        assert_eq!(d(&mut m, &a, &b), 5.0);
        assert_eq!(d(&mut m, &a, &a), 0.0);
        assert_eq!(m.distance_count(), 2);
        m.reset_statistics();
        assert_eq!(m.distance_count(), 0);
    }

    #[test]
    fn weighted_euclidean_defaults_to_ones() {
        let mut m = WeightedEuclideanDistance::new();
        let a = v(&[0.0, 0.0]);
        let b = v(&[3.0, 4.0]);
        assert_eq!(d(&mut m, &a, &b), 5.0);
    }

    #[test]
    fn weights_change_the_metric_and_epoch() {
        let mut m = WeightedEuclideanDistance::new();
        let a = v(&[1.0, 10.0]);
        let b = v(&[2.0, 10.0]);
        assert_eq!(DistanceFunction::<VectorObject>::weights_epoch(&m), 0);
        m.set_weights(vec![4.0, 0.0]).unwrap();
        assert_eq!(DistanceFunction::<VectorObject>::weights_epoch(&m), 1);
        assert_eq!(d(&mut m, &a, &b), 2.0);
        assert_eq!(m.weights(), &[4.0, 0.0]);
    }

    #[test]
    fn negative_weights_rejected() {
        let mut m = WeightedEuclideanDistance::new();
        assert!(m.set_weights(vec![1.0, -1.0]).is_err());
        assert!(m.set_weights(vec![]).is_err());
        assert_eq!(DistanceFunction::<VectorObject>::weights_epoch(&m), 0);
    }

    #[test]
    fn manhattan_values() {
        let mut m = ManhattanDistance::new();
        let a = v(&[1.0, 2.0]);
        let b = v(&[4.0, 0.0]);
        assert_eq!(d(&mut m, &a, &b), 5.0);
        m.set_weights(vec![2.0, 1.0]).unwrap();
        assert_eq!(d(&mut m, &a, &b), 8.0);
    }

    #[test]
    fn dimension_mismatch_is_invariant_error() {
        let mut m = EuclideanDistance::new();
        let a = v(&[1.0]);
        let b = v(&[1.0, 2.0]);
        assert!(matches!(m.distance(&a, &b), Err(Error::Invariant(_))));
    }

    #[test]
    fn weightless_metric_rejects_weights() {
        let mut m = EuclideanDistance::new();
        assert!(DistanceFunction::<VectorObject>::set_weights(&mut m, vec![1.0]).is_err());
        assert!(DistanceFunction::<VectorObject>::weights(&m).is_none());
    }
}
