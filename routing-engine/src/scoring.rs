//! Heuristic Settlement Score
//!
//! Weight of traversing `edge` into node `t`:
//!
//! ```text
//! w = cost · (fee_bps + latency_factor · latency_ms + volatility(source))
//!   + sovereignty · (1 − sovereignty(t)) · trust_scale
//!   + integrity   · (1 − integrity(t))   · trust_scale
//! ```
//!
//! All terms are non-negative, so path scores are additive and Dijkstra-safe.

use crate::mesh::Edge;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Weights of the composite edge cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Share of the cost term (fee, latency, volatility)
    pub cost: f64,
    /// Share of the sovereignty term
    pub sovereignty: f64,
    /// Share of the integrity term
    pub integrity: f64,
    /// Basis-point equivalent of one millisecond of latency
    pub latency_factor: f64,
    /// Scale of the trust terms relative to fees
    pub trust_scale: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cost: 0.8,
            sovereignty: 0.1,
            integrity: 0.1,
            latency_factor: 0.1,
            trust_scale: 100.0,
        }
    }
}

impl ScoringWeights {
    /// Weights must be non-negative and sum to 1
    pub fn validate(&self) -> Result<()> {
        let parts = [self.cost, self.sovereignty, self.integrity];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidConfig(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::InvalidConfig(format!(
                "scoring weights must sum to 1.0, got {:.4}",
                sum
            )));
        }
        if self.latency_factor < 0.0 || self.trust_scale < 0.0 {
            return Err(Error::InvalidConfig(
                "latency_factor and trust_scale must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Weight of `edge`, given its source's volatility and the trust signals
    /// of the node it enters
    pub fn edge_weight(
        &self,
        edge: &Edge,
        source_volatility: f64,
        target_sovereignty: f64,
        target_integrity: f64,
    ) -> f64 {
        let cost = f64::from(edge.base_fee_bps)
            + self.latency_factor * edge.latency_ms as f64
            + source_volatility.max(0.0);
        let distrust = |signal: f64| (1.0 - signal.clamp(0.0, 1.0)) * self.trust_scale;

        self.cost * cost
            + self.sovereignty * distrust(target_sovereignty)
            + self.integrity * distrust(target_integrity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(fee: u32, latency: u64) -> Edge {
        Edge::new("e", "A", "B", fee, latency, 1_000)
    }

    #[test]
    fn test_trusted_node_pays_cost_only() {
        let w = ScoringWeights::default();
        let weight = w.edge_weight(&edge(10, 20), 1.0, 1.0, 1.0);
        // 0.8 * (10 + 2 + 1)
        assert!((weight - 10.4).abs() < 1e-9);
    }

    #[test]
    fn test_distrust_terms() {
        let w = ScoringWeights::default();
        let weight = w.edge_weight(&edge(0, 0), 0.0, 0.5, 0.8);
        // 0.1 * 50 + 0.1 * 20
        assert!((weight - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate() {
        assert!(ScoringWeights::default().validate().is_ok());
        let skewed = ScoringWeights {
            cost: 0.9,
            ..Default::default()
        };
        assert!(skewed.validate().is_err());
    }
}
