//! Circuit breaker registry (per mesh node)

use crate::{Error, Result};
use dashmap::DashMap;
use protocol_core::{CircuitState, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Time an open circuit rejects everything (ms)
    pub cool_down_ms: u64,
    /// Attempts slower than this trip the circuit (ms)
    pub latency_bound_ms: u64,
    /// Concurrent trial attempts allowed while half-open
    pub half_open_max_trials: u32,
    /// Trial successes that close a half-open circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            cool_down_ms: crate::DEFAULT_CB_COOL_DOWN_MS,
            latency_bound_ms: crate::DEFAULT_CB_LATENCY_BOUND_MS,
            half_open_max_trials: 3,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject values that would make the state machine degenerate
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "circuit failure_threshold must be > 0".to_string(),
            ));
        }
        if self.half_open_max_trials == 0 || self.success_threshold == 0 {
            return Err(Error::InvalidConfig(
                "half-open trial budget and success threshold must be > 0".to_string(),
            ));
        }
        if self.success_threshold > self.half_open_max_trials {
            return Err(Error::InvalidConfig(format!(
                "success_threshold {} exceeds half_open_max_trials {}",
                self.success_threshold, self.half_open_max_trials
            )));
        }
        Ok(())
    }

    fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    fn latency_bound(&self) -> Duration {
        Duration::from_millis(self.latency_bound_ms)
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    trials_in_flight: u32,
    generation: u64,
    opened_at: Option<Instant>,
    last_transition: Instant,
    successes: u64,
    failures: u64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_successes: 0,
            trials_in_flight: 0,
            generation: 0,
            opened_at: None,
            last_transition: Instant::now(),
            successes: 0,
            failures: 0,
        }
    }

    fn cool_down_remaining(&self, cool_down: Duration) -> Duration {
        self.opened_at
            .map(|at| cool_down.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
        self.last_transition = Instant::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.trial_successes = 0;
                self.trials_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                self.trial_successes = 0;
                self.trials_in_flight = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.trial_successes = 0;
                self.trials_in_flight = 0;
            }
        }
    }
}

/// Point-in-time view of one node's breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    /// Node
    pub node: NodeId,
    /// State
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Time since the last state change
    pub since_transition: Duration,
    /// Historical success rate
    pub integrity: f64,
}

/// Per-node circuit breakers, created lazily on first observation
///
/// Every transition happens under the node's map shard lock, so concurrent
/// outcomes for one node are applied one at a time.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<NodeId, CircuitBreaker>,
    config: CircuitBreakerConfig,
    trips: AtomicU64,
}

impl CircuitBreakerRegistry {
    /// Create a registry
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            trips: AtomicU64::new(0),
        }
    }

    /// Configuration in force
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate an outbound attempt to `node`
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and the
    /// attempt becomes one of its trials. The returned permit reports the
    /// attempt's result; dropping it unreported gives the trial slot back.
    pub fn try_acquire(&self, node: &NodeId) -> Result<TrialPermit<'_>> {
        let mut breaker = self
            .breakers
            .entry(node.clone())
            .or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::Closed => Ok(TrialPermit::new(self, node, None)),
            CircuitState::Open => {
                let remaining = breaker.cool_down_remaining(self.config.cool_down());
                if remaining.is_zero() {
                    info!(%node, "circuit half-opening");
                    breaker.transition(CircuitState::HalfOpen);
                    breaker.trials_in_flight = 1;
                    Ok(TrialPermit::new(self, node, Some(breaker.generation)))
                } else {
                    Err(Error::CircuitOpen {
                        node: node.clone(),
                        retry_in_ms: remaining.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trials_in_flight < self.config.half_open_max_trials {
                    breaker.trials_in_flight += 1;
                    Ok(TrialPermit::new(self, node, Some(breaker.generation)))
                } else {
                    Err(Error::CircuitOpen {
                        node: node.clone(),
                        retry_in_ms: 0,
                    })
                }
            }
        }
    }

    /// Record a confirmed attempt and its observed latency
    ///
    /// A success slower than the latency bound counts against the node.
    pub fn record_success(&self, node: &NodeId, latency: Duration) {
        if latency > self.config.latency_bound() {
            warn!(%node, latency_ms = latency.as_millis() as u64, "attempt exceeded latency bound");
            self.trip(node, "latency bound exceeded");
            return;
        }

        let mut breaker = self
            .breakers
            .entry(node.clone())
            .or_insert_with(CircuitBreaker::new);
        breaker.successes += 1;

        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
                breaker.trial_successes += 1;
                if breaker.trial_successes >= self.config.success_threshold {
                    info!(%node, "circuit closing");
                    breaker.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self, node: &NodeId) {
        let mut breaker = self
            .breakers
            .entry(node.clone())
            .or_insert_with(CircuitBreaker::new);
        breaker.failures += 1;

        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        %node,
                        failures = breaker.consecutive_failures,
                        "circuit opening"
                    );
                    breaker.transition(CircuitState::Open);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::HalfOpen => {
                warn!(%node, "trial failed, circuit re-opening");
                breaker.transition(CircuitState::Open);
                self.trips.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record an attempt that hit its call timeout
    ///
    /// A timed-out call has by definition exceeded the latency bound.
    pub fn record_timeout(&self, node: &NodeId) {
        self.trip(node, "call timed out");
    }

    /// Give back a half-open trial slot taken in `generation`
    ///
    /// A slot taken before the circuit last changed state no longer counts.
    fn release_trial(&self, node: &NodeId, generation: u64) {
        if let Some(mut breaker) = self.breakers.get_mut(node) {
            if breaker.state == CircuitState::HalfOpen && breaker.generation == generation {
                breaker.trials_in_flight = breaker.trials_in_flight.saturating_sub(1);
                debug!(%node, "trial slot released");
            }
        }
    }

    /// Record a heartbeat observation
    ///
    /// Heartbeats do not consume the half-open trial budget.
    pub fn record_heartbeat(&self, node: &NodeId, healthy: bool) {
        if !healthy {
            self.record_failure(node);
            return;
        }

        let mut breaker = self
            .breakers
            .entry(node.clone())
            .or_insert_with(CircuitBreaker::new);
        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                breaker.trial_successes += 1;
                if breaker.trial_successes >= self.config.success_threshold {
                    info!(%node, "circuit closing after healthy heartbeats");
                    breaker.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(%node, "heartbeat while open; waiting out cool-down");
            }
        }
    }

    /// Current state (closed for a node never observed)
    pub fn state(&self, node: &NodeId) -> CircuitState {
        self.breakers
            .get(node)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether the node is open and still inside its cool-down
    pub fn is_open(&self, node: &NodeId) -> bool {
        self.breakers
            .get(node)
            .map(|b| {
                b.state == CircuitState::Open
                    && !b.cool_down_remaining(self.config.cool_down()).is_zero()
            })
            .unwrap_or(false)
    }

    /// Historical success rate, 1.0 for a node with no history
    pub fn integrity(&self, node: &NodeId) -> f64 {
        self.breakers
            .get(node)
            .map(|b| {
                let total = b.successes + b.failures;
                if total == 0 {
                    1.0
                } else {
                    b.successes as f64 / total as f64
                }
            })
            .unwrap_or(1.0)
    }

    /// Open the circuit for `node` regardless of its counters
    pub fn force_open(&self, node: &NodeId) {
        self.trip(node, "forced open");
    }

    /// Manually close the circuit for `node`
    pub fn reset(&self, node: &NodeId) {
        info!(%node, "manually resetting circuit");
        if let Some(mut breaker) = self.breakers.get_mut(node) {
            breaker.transition(CircuitState::Closed);
        }
    }

    /// Number of closed/half-open → open transitions so far
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Snapshot of every observed node
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut nodes: Vec<NodeId> = self.breakers.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
            .into_iter()
            .filter_map(|node| {
                let integrity = self.integrity(&node);
                self.breakers.get(&node).map(|b| CircuitSnapshot {
                    node: node.clone(),
                    state: b.state,
                    consecutive_failures: b.consecutive_failures,
                    since_transition: b.last_transition.elapsed(),
                    integrity,
                })
            })
            .collect()
    }

    fn trip(&self, node: &NodeId, reason: &str) {
        let mut breaker = self
            .breakers
            .entry(node.clone())
            .or_insert_with(CircuitBreaker::new);
        breaker.failures += 1;
        if breaker.state != CircuitState::Open {
            warn!(%node, reason, "circuit opening");
            breaker.transition(CircuitState::Open);
            self.trips.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Admission of one outbound attempt through a node's circuit
///
/// Consumed by reporting the attempt's result. A permit dropped without a
/// report (cancelled call, abandoned deadline) frees its half-open trial
/// slot so the circuit can still be retried.
#[must_use = "report the attempt's result or drop the permit to abandon it"]
pub struct TrialPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    node: NodeId,
    trial: Option<u64>,
}

impl<'a> TrialPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, node: &NodeId, trial: Option<u64>) -> Self {
        Self {
            registry,
            node: node.clone(),
            trial,
        }
    }

    /// Node the permit was taken for
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Whether the attempt is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// The attempt was confirmed after `latency`
    pub fn succeeded(mut self, latency: Duration) {
        self.trial = None;
        self.registry.record_success(&self.node, latency);
    }

    /// The attempt failed
    pub fn failed(mut self) {
        self.trial = None;
        self.registry.record_failure(&self.node);
    }

    /// The attempt hit its call timeout
    pub fn timed_out(mut self) {
        self.trial = None;
        self.registry.record_timeout(&self.node);
    }

    /// The attempt's result will never be known
    pub fn abandon(self) {}
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial.take() {
            self.registry.release_trial(&self.node, generation);
        }
    }
}

impl std::fmt::Debug for TrialPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialPermit")
            .field("node", &self.node)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
