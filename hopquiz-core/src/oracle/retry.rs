use super::{Oracle, OracleRequest};
use crate::config::RetryPolicy;
use crate::error::OracleError;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Wraps an oracle with bounded retries and a per-attempt hard timeout.
///
/// Non-retryable errors (bad request, missing key) fail immediately.
/// When every attempt fails the result is [`OracleError::Exhausted`].
pub struct RetryingOracle<O> {
    inner: O,
    policy: RetryPolicy,
}

impl<O: Oracle> RetryingOracle<O> {
    pub fn new(inner: O, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

#[async_trait]
impl<O: Oracle> Oracle for RetryingOracle<O> {
    async fn generate(&self, request: OracleRequest) -> Result<String, OracleError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            let call = self.inner.generate(request.clone());
            let error = match tokio::time::timeout(self.policy.timeout, call).await {
                Ok(Ok(text)) => {
                    if attempt > 1 {
                        debug!(purpose = %request.purpose, attempt, "oracle call recovered");
                    }
                    return Ok(text);
                }
                Ok(Err(e)) => e,
                Err(_) => OracleError::Timeout(self.policy.timeout),
            };

            if !error.is_retryable() {
                warn!(purpose = %request.purpose, error = %error, "oracle call failed permanently");
                return Err(error);
            }

            warn!(
                purpose = %request.purpose,
                model = %request.model,
                attempt,
                max_attempts,
                error = %error,
                "oracle call failed"
            );
            last = Some(error);

            if attempt < max_attempts {
                let delay = self.policy.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(OracleError::Exhausted {
            attempts: max_attempts,
            last: Box::new(last.unwrap_or(OracleError::Unavailable("no attempt made".into()))),
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
