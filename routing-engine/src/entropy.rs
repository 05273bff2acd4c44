//! Entropy scoring of liquidity distributions
//!
//! A node whose outgoing liquidity is spread evenly over many edges has high
//! entropy, which the path finder reads as congestion/unpredictability and
//! adds to the cost of leaving that node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cap applied to entropy when used as a cost penalty
pub const VOLATILITY_CAP: f64 = 3.0;

fn sanitize(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Shannon entropy in bits of the shares `v_i / Σv`
///
/// Negative and non-finite volumes count as zero. Empty or all-zero input
/// yields 0.
pub fn shannon_entropy<I>(volumes: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let volumes: Vec<f64> = volumes.into_iter().map(sanitize).collect();
    let total: f64 = volumes.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }

    let h: f64 = volumes
        .iter()
        .filter(|v| **v > 0.0)
        .map(|v| {
            let p = v / total;
            -p * p.log2()
        })
        .sum();
    // Guard against -0.0 and rounding below zero
    h.max(0.0)
}

/// Entropy divided by `log2(n)`, n = number of strictly positive entries
///
/// 0 when fewer than two entries are positive.
pub fn normalized_entropy<I>(volumes: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let volumes: Vec<f64> = volumes.into_iter().map(sanitize).collect();
    let positive = volumes.iter().filter(|v| **v > 0.0).count();
    if positive < 2 {
        return 0.0;
    }
    (shannon_entropy(volumes) / (positive as f64).log2()).clamp(0.0, 1.0)
}

/// `min(H, 3.0)`, used directly as an additive edge-cost penalty
pub fn volatility<I>(volumes: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    shannon_entropy(volumes).min(VOLATILITY_CAP)
}

/// Outgoing liquidity of one node, keyed by edge id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    volumes: BTreeMap<String, f64>,
}

impl Distribution {
    /// Empty distribution
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the volume for an edge
    pub fn insert(&mut self, edge: impl Into<String>, volume: f64) {
        self.volumes.insert(edge.into(), volume);
    }

    /// Number of entries (including zero ones)
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Shannon entropy in bits
    pub fn entropy(&self) -> f64 {
        shannon_entropy(self.volumes.values().copied())
    }

    /// Normalized entropy
    pub fn normalized(&self) -> f64 {
        normalized_entropy(self.volumes.values().copied())
    }

    /// Capped entropy penalty
    pub fn volatility(&self) -> f64 {
        volatility(self.volumes.values().copied())
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Distribution {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        let mut distribution = Self::new();
        for (edge, volume) in iter {
            distribution.insert(edge, volume);
        }
        distribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_single_nonzero_entry_is_zero() {
        let d: Distribution = [("e1", 100.0), ("e2", 0.0)].into_iter().collect();
        assert_eq!(d.entropy(), 0.0);
        assert_eq!(d.volatility(), 0.0);
        assert_eq!(d.normalized(), 0.0);
    }

    #[test]
    fn test_even_split_is_one_bit() {
        let d: Distribution = [("e1", 50.0), ("e2", 50.0)].into_iter().collect();
        assert!((d.entropy() - 1.0).abs() < EPS);
        assert!((d.normalized() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_uniform_is_log2_n() {
        for n in 1..=64usize {
            let h = shannon_entropy(std::iter::repeat(7.0).take(n));
            assert!((h - (n as f64).log2()).abs() < EPS, "n = {}", n);
        }
    }

    #[test]
    fn test_empty_and_degenerate() {
        assert_eq!(shannon_entropy(Vec::<f64>::new()), 0.0);
        assert_eq!(shannon_entropy(vec![0.0, 0.0]), 0.0);
        assert_eq!(shannon_entropy(vec![-5.0, 10.0]), 0.0);
        assert_eq!(shannon_entropy(vec![f64::NAN, 1.0]), 0.0);
        assert_eq!(normalized_entropy(vec![3.0]), 0.0);
    }

    #[test]
    fn test_volatility_is_capped() {
        let h = shannon_entropy(std::iter::repeat(1.0).take(32));
        assert!((h - 5.0).abs() < EPS);
        assert_eq!(volatility(std::iter::repeat(1.0).take(32)), VOLATILITY_CAP);
    }

    #[test]
    fn test_skewed_is_below_uniform() {
        let skewed = shannon_entropy(vec![90.0, 5.0, 5.0]);
        assert!(skewed > 0.0 && skewed < 3f64.log2());
    }
}
