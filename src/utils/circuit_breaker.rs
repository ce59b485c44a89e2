use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// One breaker per drain destination (relay worker) and one per broker
// producer. States:
// - Closed: calls pass through
// - Open: calls rejected without touching the destination
// - HalfOpen: probing; one failure reopens, `success_threshold` successes close
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long to stay open before probing
    pub timeout: Duration,
    /// Successes needed in half-open to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` unless the breaker is open.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and lets
    /// the call through as a probe.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    tracing::info!(breaker = %self.name, "Circuit breaker transitioning to HalfOpen");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                }
                elapsed
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(
                        breaker = %self.name,
                        successes = state.success_count,
                        "✅ Circuit breaker closed"
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = state.failure_count,
                    "Circuit breaker opening"
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "Failure during half-open, reopening circuit");
                state.state = CircuitState::Open;
                state.success_count = 0;
                state.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "billing",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, Duration::from_secs(1), 2);

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("503") }).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.get_state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let cb = breaker(2, Duration::from_millis(50), 1);

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("503") }).await;
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(1), 1);

        let _ = cb.call(async { Err::<(), _>("timeout") }).await;
        let _ = cb.call(async { Err::<(), _>("timeout") }).await;
        assert_eq!(cb.get_failure_count().await, 2);

        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(cb.get_failure_count().await, 0);
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }
}
