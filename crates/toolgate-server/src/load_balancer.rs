//! Load balancer: rate limiting, circuit breaking, bounded queueing.
//!
//! All three gates are process-level objects. The rate limit is a fixed
//! one-second window, global per proxy. Circuit breakers live per
//! `backend:method` key with per-entry locking only — no cross-backend
//! lock. The request queue bounds in-flight work and feeds the latency and
//! throughput metrics.
//!
//! The configured `strategy` is reserved: only "round-robin" exists, and
//! with a single upstream per name it degrades to identity.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use toolgate_types::config::{LoadBalancerConfig, QueueOverflow};
use toolgate_types::errors::GateError;

// ============================================================
// Circuit Breaker
// ============================================================

/// Circuit states for a backend/method key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Healthy — calls flowing normally.
    Closed,
    /// Broken — calls rejected until the recovery timeout elapses.
    Open,
    /// Testing — a single probe call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    trips: u64,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            trips: 0,
        }
    }
}

/// Snapshot of one breaker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    /// The `backend:method` key.
    pub key: String,
    /// Current state (with the timeout transition applied).
    pub state: CircuitState,
    /// Total recorded successes.
    pub total_successes: u64,
    /// Total recorded failures.
    pub total_failures: u64,
    /// Times the circuit tripped open.
    pub trips: u64,
}

// ============================================================
// Request Queue & Metrics
// ============================================================

/// Ordered record of one admitted request. Immutable after `finish`.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Session key the request arrived on.
    pub session: String,
    /// JSON-RPC method.
    pub method: String,
    /// Monotonic admission time.
    pub start: Instant,
    sequence: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    in_flight: VecDeque<u64>,
    next_sequence: u64,
    dropped: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    total: u64,
    ok: u64,
    err: u64,
    total_latency_ms: u64,
    rate_limited: u64,
    window_started: Option<Instant>,
    window_finished: u64,
    last_window_rate: f64,
}

/// Rolling load-balancer metrics.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerMetrics {
    /// Requests finished.
    pub total: u64,
    /// Requests finished successfully.
    pub ok: u64,
    /// Requests finished with an error.
    pub err: u64,
    /// Mean latency over finished requests, milliseconds.
    pub avg_latency_ms: f64,
    /// Requests finished in the last full one-second window.
    pub requests_per_sec: f64,
    /// Requests currently in flight.
    pub in_flight: usize,
    /// Requests denied by the rate limiter.
    pub rate_limited: u64,
    /// Requests dropped by queue overflow.
    pub queue_dropped: u64,
}

// ============================================================
// LoadBalancer
// ============================================================

/// Process-level admission control for inbound requests.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    /// Fixed window: (window start, admitted count).
    window: Mutex<(Instant, u32)>,
    breakers: DashMap<String, Breaker>,
    queue: Mutex<QueueState>,
    metrics: Mutex<MetricsState>,
}

fn lock<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LoadBalancer {
    /// Create a balancer with the given limits.
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            window: Mutex::new((Instant::now(), 0)),
            breakers: DashMap::new(),
            queue: Mutex::new(QueueState::default()),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    /// Admit one request: fixed-window rate limit, then the bounded queue.
    ///
    /// Returns the record to pass to [`LoadBalancer::finish`] when the
    /// request completes.
    pub fn admit(&self, session: &str, method: &str) -> Result<RequestRecord, GateError> {
        // Fixed-window rate limit, global per proxy.
        {
            let mut window = lock(&self.window);
            if window.0.elapsed() >= Duration::from_secs(1) {
                *window = (Instant::now(), 0);
            }
            if window.1 >= self.config.max_requests_per_second {
                lock(&self.metrics).rate_limited += 1;
                debug!(session = %session, method = %method, "rate limit exceeded");
                return Err(GateError::RateLimited(format!(
                    "rate limit of {} requests/second exceeded",
                    self.config.max_requests_per_second
                )));
            }
            window.1 += 1;
        }

        // Bounded FIFO queue of in-flight requests.
        let sequence = {
            let mut queue = lock(&self.queue);
            if queue.in_flight.len() >= self.config.queue_capacity {
                match self.config.queue_overflow {
                    QueueOverflow::Reject => {
                        return Err(GateError::QueueFull(format!(
                            "request queue at capacity {}",
                            self.config.queue_capacity
                        )));
                    }
                    QueueOverflow::DropOldest => {
                        queue.in_flight.pop_front();
                        queue.dropped += 1;
                        warn!("request queue overflow, dropped oldest record");
                    }
                }
            }
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.in_flight.push_back(sequence);
            sequence
        };

        Ok(RequestRecord {
            session: session.to_string(),
            method: method.to_string(),
            start: Instant::now(),
            sequence,
        })
    }

    /// Finish an admitted request, folding its latency into the metrics.
    pub fn finish(&self, record: RequestRecord, ok: bool) {
        let latency_ms = record.start.elapsed().as_millis() as u64;
        {
            let mut queue = lock(&self.queue);
            queue.in_flight.retain(|&seq| seq != record.sequence);
        }
        let mut metrics = lock(&self.metrics);
        metrics.total += 1;
        if ok {
            metrics.ok += 1;
        } else {
            metrics.err += 1;
        }
        metrics.total_latency_ms += latency_ms;

        // Throughput: count completions per full one-second window.
        let now = Instant::now();
        match metrics.window_started {
            Some(started) if now.duration_since(started) >= Duration::from_secs(1) => {
                metrics.last_window_rate = metrics.window_finished as f64
                    / now.duration_since(started).as_secs_f64();
                metrics.window_started = Some(now);
                metrics.window_finished = 1;
            }
            Some(_) => metrics.window_finished += 1,
            None => {
                metrics.window_started = Some(now);
                metrics.window_finished = 1;
            }
        }
    }

    /// Admit a call through the circuit breaker for `backend:method`.
    ///
    /// Closed admits; open rejects until the timeout elapses, then a
    /// single half-open probe is admitted.
    pub fn breaker_admit(&self, key: &str) -> Result<(), GateError> {
        let mut breaker = self.breakers.entry(key.to_string()).or_default();
        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.circuit_breaker_timeout_ms) {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_in_flight = true;
                    debug!(key = %key, "circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(GateError::CircuitOpen(format!(
                        "circuit open for '{key}'"
                    )))
                }
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    Err(GateError::CircuitOpen(format!(
                        "circuit half-open for '{key}', probe in flight"
                    )))
                } else {
                    breaker.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call for `backend:method`.
    pub fn breaker_success(&self, key: &str) {
        let mut breaker = self.breakers.entry(key.to_string()).or_default();
        breaker.total_successes += 1;
        breaker.consecutive_failures = 0;
        breaker.probe_in_flight = false;
        if breaker.state != CircuitState::Closed {
            debug!(key = %key, "circuit breaker recovered");
            breaker.state = CircuitState::Closed;
            breaker.opened_at = None;
        }
    }

    /// Record a failed call for `backend:method`.
    pub fn breaker_failure(&self, key: &str) {
        let mut breaker = self.breakers.entry(key.to_string()).or_default();
        breaker.total_failures += 1;
        match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.circuit_breaker_threshold {
                    warn!(
                        key = %key,
                        failures = breaker.consecutive_failures,
                        "circuit breaker tripped"
                    );
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                    breaker.trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                warn!(key = %key, "probe failed, circuit re-opened");
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.probe_in_flight = false;
                breaker.trips += 1;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a key, with the timeout transition applied.
    pub fn breaker_state(&self, key: &str) -> CircuitState {
        match self.breakers.get(key) {
            Some(breaker) => {
                if breaker.state == CircuitState::Open {
                    let elapsed = breaker
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= Duration::from_millis(self.config.circuit_breaker_timeout_ms) {
                        return CircuitState::HalfOpen;
                    }
                }
                breaker.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Snapshot every breaker's counters, sorted by key.
    pub fn breaker_metrics(&self) -> Vec<BreakerMetrics> {
        let mut snapshot: Vec<BreakerMetrics> = self
            .breakers
            .iter()
            .map(|entry| BreakerMetrics {
                key: entry.key().clone(),
                state: self.breaker_state(entry.key()),
                total_successes: entry.total_successes,
                total_failures: entry.total_failures,
                trips: entry.trips,
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Rolling metrics snapshot.
    pub fn metrics(&self) -> LoadBalancerMetrics {
        let (in_flight, dropped) = {
            let queue = lock(&self.queue);
            (queue.in_flight.len(), queue.dropped)
        };
        let metrics = lock(&self.metrics);
        LoadBalancerMetrics {
            total: metrics.total,
            ok: metrics.ok,
            err: metrics.err,
            avg_latency_ms: if metrics.total == 0 {
                0.0
            } else {
                metrics.total_latency_ms as f64 / metrics.total as f64
            },
            requests_per_sec: metrics.last_window_rate,
            in_flight,
            rate_limited: metrics.rate_limited,
            queue_dropped: dropped,
        }
    }
}
