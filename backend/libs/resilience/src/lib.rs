/// Resilience patterns for the recommendation engine
///
/// This library provides the failure-isolation primitives the engine wraps
/// around its request path:
/// - **Circuit Breaker**: fails fast after consecutive failures, then admits a
///   single trial call once the cooldown has elapsed
/// - **Timeout**: bounds how long a request waits on CPU-bound recall work
///
/// # Example: guarding an engine call
///
/// ```rust,no_run
/// use resilience::{CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         // Your engine call here
///         Ok::<_, String>(())
///     }).await;
/// }
/// ```
///
/// # Example: bounding a recall fan-out
///
/// ```rust,no_run
/// use resilience::timeout::with_timeout;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_timeout(Duration::from_millis(250), async {
///         // join generator tasks here
///         42
///     })
///     .await;
/// }
/// ```

pub mod circuit_breaker;
pub mod timeout;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use timeout::{with_deadline, with_timeout, TimeoutError};
