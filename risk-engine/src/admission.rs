//! Admission control
//!
//! Sliding-window limits on outbound settlement attempts, per destination
//! node and globally. Lower priority tiers may only fill a window up to a
//! fraction of its limit, so the remaining headroom is always held for the
//! higher tiers. Under reported system load, low tiers are shed outright.

use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use protocol_core::{NodeId, Priority};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fraction of each window a tier may fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCeilings {
    /// Low priority
    pub low: f64,
    /// Normal priority
    pub normal: f64,
    /// High priority
    pub high: f64,
    /// Critical priority
    pub critical: f64,
}

impl Default for TierCeilings {
    fn default() -> Self {
        Self {
            low: 0.5,
            normal: 0.75,
            high: 0.9,
            critical: 1.0,
        }
    }
}

impl TierCeilings {
    fn for_priority(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Sliding window length (ms)
    pub window_ms: u64,
    /// Attempts per window toward one destination node
    pub per_node_limit: u32,
    /// Attempts per window across all destinations
    pub global_limit: u32,
    /// Per-tier window ceilings
    pub tier_ceilings: TierCeilings,
    /// Load at or above which low priority is shed
    pub shed_low_at: f64,
    /// Load at or above which normal priority is shed
    pub shed_normal_at: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            per_node_limit: 200,
            global_limit: 1_000,
            tier_ceilings: TierCeilings::default(),
            shed_low_at: 0.8,
            shed_normal_at: 0.95,
        }
    }
}

impl AdmissionConfig {
    /// Reject limits that would admit nothing or invert the tier order
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 || self.per_node_limit == 0 || self.global_limit == 0 {
            return Err(Error::InvalidConfig(
                "admission window and limits must be > 0".to_string(),
            ));
        }
        let c = &self.tier_ceilings;
        let ordered = 0.0 < c.low && c.low <= c.normal && c.normal <= c.high && c.high <= c.critical;
        if !ordered || c.critical > 1.0 {
            return Err(Error::InvalidConfig(
                "tier ceilings must satisfy 0 < low <= normal <= high <= critical <= 1".to_string(),
            ));
        }
        if self.shed_low_at > self.shed_normal_at {
            return Err(Error::InvalidConfig(
                "shed_low_at must not exceed shed_normal_at".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }
}

/// Per-node and global admission gate
pub struct AdmissionController {
    config: AdmissionConfig,
    global: Mutex<SlidingWindow>,
    per_node: DashMap<NodeId, SlidingWindow>,
    load_bits: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    /// Create a controller
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            global: Mutex::new(SlidingWindow::default()),
            per_node: DashMap::new(),
            load_bits: AtomicU64::new(0f64.to_bits()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Report current system load (0.0 - 1.0)
    pub fn set_load(&self, load: f64) {
        let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
    }

    /// Last reported system load
    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Attempts rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn ceiling(&self, limit: u32, priority: Priority) -> usize {
        let fraction = self.config.tier_ceilings.for_priority(priority);
        ((f64::from(limit) * fraction).floor() as usize).max(1)
    }

    fn reject(&self, scope: String, priority: Priority) -> Error {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(%scope, ?priority, "admission rejected");
        Error::RateLimited { scope, priority }
    }

    /// Admit one attempt toward `destination`, consuming window capacity
    pub fn admit(&self, destination: &NodeId, priority: Priority) -> Result<()> {
        let load = self.load();
        let shed = match priority {
            Priority::Low => load >= self.config.shed_low_at,
            Priority::Normal => load >= self.config.shed_normal_at,
            Priority::High | Priority::Critical => false,
        };
        if shed {
            return Err(self.reject(format!("load shedding at {:.2}", load), priority));
        }

        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);

        // Lock order: global, then node
        let mut global = self.global.lock();
        global.evict(now, window);
        if global.len() >= self.ceiling(self.config.global_limit, priority) {
            drop(global);
            return Err(self.reject("global window".to_string(), priority));
        }

        let mut node = self.per_node.entry(destination.clone()).or_default();
        node.evict(now, window);
        if node.len() >= self.ceiling(self.config.per_node_limit, priority) {
            drop(node);
            drop(global);
            return Err(self.reject(format!("node {} window", destination), priority));
        }

        node.timestamps.push_back(now);
        global.timestamps.push_back(now);
        debug!(%destination, ?priority, in_window = node.len(), "admitted");
        Ok(())
    }

    /// Attempts currently counted in `destination`'s window
    pub fn window_usage(&self, destination: &NodeId) -> usize {
        let window = Duration::from_millis(self.config.window_ms);
        self.per_node
            .get_mut(destination)
            .map(|mut w| {
                w.evict(Instant::now(), window);
                w.len()
            })
            .unwrap_or(0)
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller(per_node: u32, global: u32) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            window_ms: 60_000,
            per_node_limit: per_node,
            global_limit: global,
            ..Default::default()
        })
    }

    #[test]
    fn test_tiers_preserve_headroom() {
        let ctl = controller(10, 1_000);
        let d = NodeId::from("D");

        let low = (0..20).filter(|_| ctl.admit(&d, Priority::Low).is_ok()).count();
        assert_eq!(low, 5);

        let normal = (0..20).filter(|_| ctl.admit(&d, Priority::Normal).is_ok()).count();
        assert_eq!(normal, 2);

        let high = (0..20).filter(|_| ctl.admit(&d, Priority::High).is_ok()).count();
        assert_eq!(high, 2);

        let critical = (0..20).filter(|_| ctl.admit(&d, Priority::Critical).is_ok()).count();
        assert_eq!(critical, 1);

        assert_eq!(ctl.window_usage(&d), 10);
        assert!(matches!(
            ctl.admit(&d, Priority::Critical),
            Err(Error::RateLimited { .. })
        ));
    }

    #[test]
    fn test_per_node_windows_are_independent() {
        let ctl = controller(2, 1_000);
        assert!(ctl.admit(&"B".into(), Priority::Critical).is_ok());
        assert!(ctl.admit(&"B".into(), Priority::Critical).is_ok());
        assert!(ctl.admit(&"B".into(), Priority::Critical).is_err());
        assert!(ctl.admit(&"C".into(), Priority::Critical).is_ok());
    }

    #[test]
    fn test_global_limit() {
        let ctl = controller(100, 3);
        for node in ["B", "C", "D"] {
            assert!(ctl.admit(&node.into(), Priority::Critical).is_ok());
        }
        assert!(ctl.admit(&"E".into(), Priority::Critical).is_err());
        assert_eq!(ctl.rejected(), 1);
    }

    #[test]
    fn test_load_shedding() {
        let ctl = controller(100, 100);
        let d = NodeId::from("D");

        ctl.set_load(0.85);
        assert!(ctl.admit(&d, Priority::Low).is_err());
        assert!(ctl.admit(&d, Priority::Normal).is_ok());

        ctl.set_load(0.97);
        assert!(ctl.admit(&d, Priority::Normal).is_err());
        assert!(ctl.admit(&d, Priority::High).is_ok());
        assert!(ctl.admit(&d, Priority::Critical).is_ok());

        ctl.set_load(f64::NAN);
        assert_eq!(ctl.load(), 0.0);
    }

    #[test]
    fn test_window_slides() {
        let ctl = AdmissionController::new(AdmissionConfig {
            window_ms: 30,
            per_node_limit: 1,
            global_limit: 10,
            ..Default::default()
        });
        let d = NodeId::from("D");
        assert!(ctl.admit(&d, Priority::Critical).is_ok());
        assert!(ctl.admit(&d, Priority::Critical).is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(ctl.admit(&d, Priority::Critical).is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(AdmissionConfig::default().validate().is_ok());
        let inverted = AdmissionConfig {
            tier_ceilings: TierCeilings {
                low: 0.9,
                normal: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    fn priority() -> impl Strategy<Value = Priority> {
        prop::sample::select(Priority::ALL.to_vec())
    }

    proptest! {
        /// Property: a window never holds more than its limit
        #[test]
        fn admitted_never_exceeds_limit(
            limit in 1u32..50,
            priorities in prop::collection::vec(priority(), 0..200),
        ) {
            let ctl = controller(limit, 10_000);
            let d = NodeId::from("D");
            let admitted = priorities
                .iter()
                .filter(|p| ctl.admit(&d, **p).is_ok())
                .count();
            prop_assert!(admitted <= limit as usize);
            prop_assert_eq!(admitted, ctl.window_usage(&d));
        }
    }
}
