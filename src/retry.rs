//! Per-request retry state machine with exponential backoff.
//!
//! A [`RetryController`] wraps delivery of one outbound request to a
//! cluster. Each attempt draws a fresh endpoint from the cluster balancer;
//! responses whose status is in the cluster's retry table are discarded and
//! the buffered request is replayed after a backoff, until the policy's
//! retry budget runs out.
//!
//! ```text
//! Init -> Attempt -> Success
//!                 -> RetryWait -> Attempt
//!                 -> Exhausted
//!                 -> NotRetryable
//! ```

use crate::cluster::ClusterDescriptor;
use crate::error::{ConfigError, ProxyError, Result};
use crate::mesh::RetryPolicyConfig;
use http::{Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status classes retried when `RetryOn` is not configured.
pub const DEFAULT_RETRY_ON: &str = "5xx";

/// Backoff base interval when none is configured.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the backoff multiplier.
const MAX_BACKOFF_FACTOR: u32 = 10;

const STATUS_TABLE_SIZE: usize = 1000;

/// Lookup table of retryable status codes.
#[derive(Clone, PartialEq, Eq)]
pub struct RetryOn {
    codes: Box<[bool]>,
}

impl std::fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes: Vec<usize> = self
            .codes
            .iter()
            .enumerate()
            .filter_map(|(code, retry)| retry.then_some(code))
            .collect();
        f.debug_struct("RetryOn").field("codes", &codes).finish()
    }
}

impl RetryOn {
    /// Parses a comma separated list of status codes (`503`) and status
    /// classes (`5xx`).
    pub fn parse(cluster: &str, spec: &str) -> std::result::Result<Self, ConfigError> {
        let mut codes = vec![false; STATUS_TABLE_SIZE];

        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let invalid = || ConfigError::InvalidRetryOn {
                cluster: cluster.to_string(),
                token: token.to_string(),
            };

            let lower = token.to_ascii_lowercase();
            if let Some(class) = lower.strip_suffix("xx") {
                let class: usize = match class.parse() {
                    Ok(digit @ 1..=9) => digit,
                    _ => return Err(invalid()),
                };
                codes[class * 100..class * 100 + 100].fill(true);
            } else {
                match lower.parse::<usize>() {
                    Ok(code @ 100..=999) => codes[code] = true,
                    _ => return Err(invalid()),
                }
            }
        }

        Ok(Self {
            codes: codes.into_boxed_slice(),
        })
    }

    /// Returns true if `status` should be retried.
    pub fn contains(&self, status: u16) -> bool {
        self.codes.get(usize::from(status)).copied().unwrap_or(false)
    }
}

/// Retry policy of one cluster.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    num_retries: u32,
    retry_on: RetryOn,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// Builds a policy from configuration, applying defaults.
    pub fn from_config(
        cluster: &str,
        config: Option<&RetryPolicyConfig>,
    ) -> std::result::Result<Self, ConfigError> {
        let num_retries = config.and_then(|c| c.num_retries).unwrap_or(0);
        let retry_on = RetryOn::parse(
            cluster,
            config
                .and_then(|c| c.retry_on.as_deref())
                .unwrap_or(DEFAULT_RETRY_ON),
        )?;
        let backoff_base = config
            .and_then(|c| c.retry_backoff_base_interval)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(DEFAULT_BACKOFF_BASE);

        Ok(Self {
            num_retries,
            retry_on,
            backoff_base,
        })
    }

    /// Returns true when retries are configured at all.
    pub fn is_enabled(&self) -> bool {
        self.num_retries > 0
    }

    /// Returns the maximum number of retries.
    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    /// Returns the backoff base interval.
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Returns true if `status` is in the retry table.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_on.contains(status)
    }

    /// Returns the delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base, attempt)
    }
}

/// Computes `base * min(10, 2^(attempt - 1))`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX)
        .min(MAX_BACKOFF_FACTOR);
    base.saturating_mul(factor)
}

/// Receives retry outcome events, keyed by cluster name.
pub trait RetryObserver: Send + Sync {
    /// A retry was scheduled.
    fn retry(&self, cluster: &str);
    /// A request succeeded after at least one retry.
    fn retry_success(&self, cluster: &str);
    /// A retryable failure arrived with no retries left.
    fn retry_limit_exceeded(&self, cluster: &str);
}

/// State of a [`RetryController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Policy captured, no attempt made yet.
    Init,
    /// Waiting for the response head of an attempt.
    Attempt,
    /// Backing off before the next attempt.
    RetryWait,
    /// A non-retryable response was forwarded.
    Success,
    /// The retry budget ran out; the last failure was forwarded.
    Exhausted,
    /// The cluster has no retry policy; the response was streamed through.
    NotRetryable,
}

/// What to do with the outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the response to the caller.
    Forward,
    /// Discard the outcome and replay after the delay.
    Retry(Duration),
    /// Forward the last outcome; no retries remain.
    Exhausted,
}

/// Retry state machine for one request against one cluster.
pub struct RetryController {
    cluster: Arc<ClusterDescriptor>,
    observer: Arc<dyn RetryObserver>,
    retries: u32,
    state: RetryState,
    last_status: Option<StatusCode>,
}

impl RetryController {
    /// Captures the cluster's policy with a zeroed attempt counter.
    pub fn new(cluster: Arc<ClusterDescriptor>, observer: Arc<dyn RetryObserver>) -> Self {
        Self {
            cluster,
            observer,
            retries: 0,
            state: RetryState::Init,
            last_status: None,
        }
    }

    /// Returns true if the request must be buffered for replay.
    pub fn requires_buffering(&self) -> bool {
        self.cluster.retry_policy().is_enabled()
    }

    /// Returns the current state.
    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Returns the number of retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the status of the last completed attempt.
    pub fn last_status(&self) -> Option<StatusCode> {
        self.last_status
    }

    /// Enters `Attempt` and draws the endpoint for it.
    pub fn begin_attempt(&mut self) -> Option<String> {
        self.state = RetryState::Attempt;
        self.cluster.next_endpoint().map(str::to_string)
    }

    /// Classifies a response head.
    pub fn on_response(&mut self, status: StatusCode) -> Verdict {
        self.last_status = Some(status);
        let policy = self.cluster.retry_policy();

        if !policy.is_enabled() {
            self.state = RetryState::NotRetryable;
            return Verdict::Forward;
        }

        if !policy.is_retryable(status.as_u16()) {
            if self.retries > 0 {
                self.observer.retry_success(self.cluster.name());
            }
            self.state = RetryState::Success;
            return Verdict::Forward;
        }

        self.schedule_retry()
    }

    /// Classifies a connection-level failure of the current attempt.
    pub fn on_transport_failure(&mut self) -> Verdict {
        self.last_status = None;
        if !self.cluster.retry_policy().is_enabled() {
            self.state = RetryState::NotRetryable;
            return Verdict::Exhausted;
        }
        self.schedule_retry()
    }

    fn schedule_retry(&mut self) -> Verdict {
        let policy = self.cluster.retry_policy();

        if self.retries < policy.num_retries() {
            self.observer.retry(self.cluster.name());
            self.retries += 1;
            self.state = RetryState::RetryWait;
            let delay = policy.backoff(self.retries);
            debug!(
                cluster = %self.cluster.name(),
                attempt = self.retries,
                max_retries = policy.num_retries(),
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            Verdict::Retry(delay)
        } else {
            self.observer.retry_limit_exceeded(self.cluster.name());
            self.state = RetryState::Exhausted;
            warn!(
                cluster = %self.cluster.name(),
                retries = self.retries,
                "retry limit exceeded"
            );
            Verdict::Exhausted
        }
    }

    /// Drives attempts through `send` until a response can be forwarded.
    ///
    /// `send` receives the cluster and the endpoint drawn for the attempt.
    /// Transport failures count as retryable failures while retries remain.
    pub async fn run<F, Fut, B>(mut self, mut send: F) -> Result<Response<B>>
    where
        F: FnMut(Arc<ClusterDescriptor>, String) -> Fut,
        Fut: Future<Output = Result<Response<B>>>,
    {
        loop {
            let endpoint = self.begin_attempt().ok_or_else(|| ProxyError::NoEndpoint {
                cluster: self.cluster.name().to_string(),
            })?;

            match send(Arc::clone(&self.cluster), endpoint.clone()).await {
                Ok(response) => match self.on_response(response.status()) {
                    Verdict::Retry(delay) => {
                        debug!(endpoint = %endpoint, status = %response.status(), "discarding retryable response");
                        drop(response);
                        tokio::time::sleep(delay).await;
                    }
                    Verdict::Forward | Verdict::Exhausted => return Ok(response),
                },
                Err(err) if err.is_transport_failure() => match self.on_transport_failure() {
                    Verdict::Retry(delay) => {
                        warn!(endpoint = %endpoint, error = %err, "upstream attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Verdict::Forward | Verdict::Exhausted => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

/// Returns true for 2xx and 3xx statuses.
pub fn is_delivered(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

/// Delivers a request to `primary`, then once to `failover` if the primary
/// delivery did not produce a 2xx/3xx response.
///
/// The failover cluster is consumed by the first failure whatever the
/// outcome of the failover delivery.
pub async fn deliver<F, Fut, B>(
    primary: Arc<ClusterDescriptor>,
    failover: Option<Arc<ClusterDescriptor>>,
    observer: Arc<dyn RetryObserver>,
    mut send: F,
) -> Result<Response<B>>
where
    F: FnMut(Arc<ClusterDescriptor>, String) -> Fut,
    Fut: Future<Output = Result<Response<B>>>,
{
    let result = RetryController::new(primary, Arc::clone(&observer))
        .run(&mut send)
        .await;

    let Some(failover) = failover else {
        return result;
    };

    let failed = match &result {
        Ok(response) => !is_delivered(response.status()),
        Err(_) => true,
    };
    if !failed {
        return result;
    }

    info!(cluster = %failover.name(), "primary delivery failed, using failover cluster");
    drop(result);
    RetryController::new(failover, observer).run(&mut send).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;

    #[derive(Default)]
    struct CountingObserver {
        counts: Mutex<HashMap<(&'static str, String), u32>>,
    }

    impl CountingObserver {
        fn get(&self, event: &'static str, cluster: &str) -> u32 {
            self.counts
                .lock()
                .get(&(event, cluster.to_string()))
                .copied()
                .unwrap_or(0)
        }

        fn bump(&self, event: &'static str, cluster: &str) {
            *self
                .counts
                .lock()
                .entry((event, cluster.to_string()))
                .or_insert(0) += 1;
        }
    }

    impl RetryObserver for CountingObserver {
        fn retry(&self, cluster: &str) {
            self.bump("retry", cluster);
        }
        fn retry_success(&self, cluster: &str) {
            self.bump("success", cluster);
        }
        fn retry_limit_exceeded(&self, cluster: &str) {
            self.bump("limit", cluster);
        }
    }

    fn cluster(name: &str, retries: Option<u32>, retry_on: Option<&str>) -> Arc<ClusterDescriptor> {
        let config = ClusterConfig::with_endpoints(["10.0.0.1:80", "10.0.0.2:80"])
            .with_retry_policy(RetryPolicyConfig {
                num_retries: retries,
                retry_on: retry_on.map(str::to_string),
                retry_backoff_base_interval: Some(1.0),
            });
        Arc::new(ClusterDescriptor::from_config(name, &config).unwrap())
    }

    fn response(status: u16) -> Result<Response<()>> {
        Ok(Response::builder().status(status).body(()).unwrap())
    }

    #[test]
    fn test_retry_on_default_is_5xx() {
        let policy = RetryPolicy::from_config("c1", None).unwrap();
        assert!(!policy.is_enabled());
        for status in 500..=599 {
            assert!(policy.is_retryable(status));
        }
        for status in [200, 204, 302, 404, 499, 600, 999] {
            assert!(!policy.is_retryable(status));
        }
        assert_eq!(policy.backoff_base(), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn test_retry_on_codes_and_classes() {
        let retry_on = RetryOn::parse("c1", " 429 , 5XX").unwrap();
        assert!(retry_on.contains(429));
        assert!(retry_on.contains(500));
        assert!(!retry_on.contains(428));
        assert!(!retry_on.contains(1200));
    }

    #[test]
    fn test_retry_on_rejects_garbage() {
        assert!(RetryOn::parse("c1", "5x").is_err());
        assert!(RetryOn::parse("c1", "0xx").is_err());
        assert!(RetryOn::parse("c1", "42").is_err());
    }

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        let expected = [1, 2, 4, 8, 10, 10, 10];
        for (n, secs) in expected.iter().enumerate() {
            assert_eq!(backoff_delay(base, n as u32 + 1), Duration::from_secs(*secs));
        }
        assert_eq!(backoff_delay(base, 64), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_saturates_on_huge_base() {
        let base = Duration::from_secs(u64::MAX / 4);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 5), Duration::MAX);

        let config = RetryPolicyConfig {
            num_retries: Some(1),
            retry_on: None,
            retry_backoff_base_interval: Some(1e19),
        };
        let policy = RetryPolicy::from_config("c1", Some(&config)).unwrap();
        assert_eq!(policy.backoff(4), Duration::MAX);
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let base = Duration::from_millis(250);
        let mut previous = Duration::ZERO;
        for n in 1..40 {
            let delay = backoff_delay(base, n);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_state_machine_exhaustion() {
        let observer = Arc::new(CountingObserver::default());
        let mut controller = RetryController::new(cluster("c1", Some(2), Some("503,5xx")), observer.clone());
        assert_eq!(controller.state(), RetryState::Init);
        assert!(controller.requires_buffering());

        controller.begin_attempt().unwrap();
        assert_eq!(controller.state(), RetryState::Attempt);
        assert_eq!(
            controller.on_response(StatusCode::SERVICE_UNAVAILABLE),
            Verdict::Retry(Duration::from_secs(1))
        );
        assert_eq!(controller.state(), RetryState::RetryWait);

        controller.begin_attempt().unwrap();
        assert_eq!(
            controller.on_response(StatusCode::SERVICE_UNAVAILABLE),
            Verdict::Retry(Duration::from_secs(2))
        );

        controller.begin_attempt().unwrap();
        assert_eq!(
            controller.on_response(StatusCode::SERVICE_UNAVAILABLE),
            Verdict::Exhausted
        );
        assert_eq!(controller.state(), RetryState::Exhausted);
        assert_eq!(controller.retries(), 2);
        assert_eq!(observer.get("retry", "c1"), 2);
        assert_eq!(observer.get("limit", "c1"), 1);
        assert_eq!(observer.get("success", "c1"), 0);
    }

    #[test]
    fn test_state_machine_success_after_retry() {
        let observer = Arc::new(CountingObserver::default());
        let mut controller = RetryController::new(cluster("c1", Some(3), None), observer.clone());

        controller.begin_attempt();
        assert!(matches!(
            controller.on_response(StatusCode::BAD_GATEWAY),
            Verdict::Retry(_)
        ));
        controller.begin_attempt();
        assert_eq!(controller.on_response(StatusCode::OK), Verdict::Forward);
        assert_eq!(controller.state(), RetryState::Success);
        assert_eq!(controller.last_status(), Some(StatusCode::OK));
        assert_eq!(observer.get("success", "c1"), 1);
    }

    #[test]
    fn test_first_attempt_success_not_counted() {
        let observer = Arc::new(CountingObserver::default());
        let mut controller = RetryController::new(cluster("c1", Some(3), None), observer.clone());
        controller.begin_attempt();
        assert_eq!(controller.on_response(StatusCode::NOT_FOUND), Verdict::Forward);
        assert_eq!(observer.get("success", "c1"), 0);
    }

    #[test]
    fn test_no_policy_is_not_retryable() {
        let observer = Arc::new(CountingObserver::default());
        let mut controller = RetryController::new(cluster("c1", None, None), observer.clone());
        assert!(!controller.requires_buffering());
        controller.begin_attempt();
        assert_eq!(
            controller.on_response(StatusCode::SERVICE_UNAVAILABLE),
            Verdict::Forward
        );
        assert_eq!(controller.state(), RetryState::NotRetryable);
        assert_eq!(observer.get("retry", "c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_replays_to_fresh_endpoints() {
        let observer = Arc::new(CountingObserver::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = tokio::time::Instant::now();

        let result = RetryController::new(cluster("c1", Some(2), Some("503,5xx")), observer.clone())
            .run({
                let seen = seen.clone();
                move |_cluster, endpoint| {
                    seen.lock().push(endpoint);
                    async { response(503) }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.status(), StatusCode::SERVICE_UNAVAILABLE);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_ne!(seen[0], seen[1]);
        assert_eq!(observer.get("retry", "c1"), 2);
        assert_eq!(observer.get("limit", "c1"), 1);
        // 1s + 2s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transport_failures() {
        let observer = Arc::new(CountingObserver::default());
        let calls = Arc::new(Mutex::new(0u32));

        let result = RetryController::new(cluster("c1", Some(1), None), observer.clone())
            .run({
                let calls = calls.clone();
                move |_cluster, endpoint| {
                    let mut calls = calls.lock();
                    *calls += 1;
                    let first = *calls == 1;
                    async move {
                        if first {
                            Err(ProxyError::UpstreamConnect {
                                addr: endpoint,
                                source: io::Error::from(io::ErrorKind::ConnectionRefused),
                            })
                        } else {
                            response(200)
                        }
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(*calls.lock(), 2);
        assert_eq!(observer.get("success", "c1"), 1);
    }

    #[tokio::test]
    async fn test_run_surfaces_transport_failure_without_policy() {
        let observer = Arc::new(CountingObserver::default());
        let result: Result<Response<()>> = RetryController::new(cluster("c1", None, None), observer)
            .run(|_cluster, endpoint| async move {
                Err(ProxyError::UpstreamConnect {
                    addr: endpoint,
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                })
            })
            .await;
        assert!(matches!(result, Err(ProxyError::UpstreamConnect { .. })));
    }

    #[tokio::test]
    async fn test_run_without_endpoints() {
        let observer = Arc::new(CountingObserver::default());
        let empty = Arc::new(ClusterDescriptor::from_config("empty", &ClusterConfig::default()).unwrap());
        let result: Result<Response<()>> = RetryController::new(empty, observer)
            .run(|_cluster, _endpoint| async { response(200) })
            .await;
        assert!(matches!(result, Err(ProxyError::NoEndpoint { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_fails_over_once() {
        let observer = Arc::new(CountingObserver::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = deliver(
            cluster("primary", None, None),
            Some(cluster("standby", None, None)),
            observer,
            {
                let seen = seen.clone();
                move |cluster: Arc<ClusterDescriptor>, _endpoint| {
                    seen.lock().push(cluster.name().to_string());
                    let status = if cluster.name() == "primary" { 503 } else { 200 };
                    async move { response(status) }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(*seen.lock(), vec!["primary", "standby"]);
    }

    #[tokio::test]
    async fn test_deliver_skips_failover_on_success() {
        let observer = Arc::new(CountingObserver::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = deliver(
            cluster("primary", None, None),
            Some(cluster("standby", None, None)),
            observer,
            {
                let seen = seen.clone();
                move |cluster: Arc<ClusterDescriptor>, _endpoint| {
                    seen.lock().push(cluster.name().to_string());
                    async { response(302) }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status(), StatusCode::FOUND);
        assert_eq!(*seen.lock(), vec!["primary"]);
    }

    #[tokio::test]
    async fn test_deliver_failover_consumed_even_if_failing() {
        let observer = Arc::new(CountingObserver::default());
        let seen = Arc::new(Mutex::new(0u32));

        let result = deliver(
            cluster("primary", None, None),
            Some(cluster("standby", None, None)),
            observer,
            {
                let seen = seen.clone();
                move |_cluster, _endpoint| {
                    *seen.lock() += 1;
                    async { response(500) }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*seen.lock(), 2);
    }
}
