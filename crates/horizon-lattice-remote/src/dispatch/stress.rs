//! Load generation.

use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream;

use super::{HttpRemote, elapsed_ms};
use crate::builder::HttpRequestBuilder;
use crate::cancellation::CancellationToken;
use crate::error::{RemoteError, Result};

/// Options for [`HttpRemote::stress_test_with`].
#[derive(Clone, Copy, Debug)]
pub struct StressTestOptions {
    /// Requests per round.
    pub requests: usize,
    /// Maximum requests in flight.
    pub parallelism: usize,
    /// Number of rounds.
    pub rounds: usize,
}

impl Default for StressTestOptions {
    fn default() -> Self {
        Self {
            requests: 100,
            parallelism: 100,
            rounds: 1,
        }
    }
}

/// Aggregate outcome of a stress test.
///
/// Response times are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StressTestResult {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_time_ms: u64,
    pub queries_per_second: f64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub average_response_time_ms: f64,
    pub p10_response_time_ms: u64,
    pub p25_response_time_ms: u64,
    pub p50_response_time_ms: u64,
    pub p75_response_time_ms: u64,
    pub p90_response_time_ms: u64,
    pub p99_response_time_ms: u64,
}

impl StressTestResult {
    fn from_samples(mut times: Vec<u64>, successful: usize, total_time_ms: u64) -> Self {
        times.sort_unstable();
        let total = times.len();
        let percentile = |p: usize| -> u64 {
            if times.is_empty() {
                return 0;
            }
            // Nearest rank.
            let rank = (p * total).div_ceil(100).max(1);
            times[rank - 1]
        };
        let sum: u64 = times.iter().sum();
        Self {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful,
            total_time_ms,
            queries_per_second: if total_time_ms == 0 {
                total as f64
            } else {
                total as f64 * 1000.0 / total_time_ms as f64
            },
            min_response_time_ms: times.first().copied().unwrap_or(0),
            max_response_time_ms: times.last().copied().unwrap_or(0),
            average_response_time_ms: if total == 0 {
                0.0
            } else {
                sum as f64 / total as f64
            },
            p10_response_time_ms: percentile(10),
            p25_response_time_ms: percentile(25),
            p50_response_time_ms: percentile(50),
            p75_response_time_ms: percentile(75),
            p90_response_time_ms: percentile(90),
            p99_response_time_ms: percentile(99),
        }
    }
}

impl HttpRemote {
    /// Send `requests` copies of `builder`, all in parallel, in one round.
    pub async fn stress_test(
        &self,
        builder: &HttpRequestBuilder,
        requests: usize,
    ) -> Result<StressTestResult> {
        let options = StressTestOptions {
            requests,
            parallelism: requests.max(1),
            rounds: 1,
        };
        self.stress_test_with(builder, options, None).await
    }

    /// Send `builder` `options.requests` times per round with at most
    /// `options.parallelism` in flight.
    ///
    /// A request counts as successful when it returns a 2xx response. Caller
    /// cancellation aborts the test.
    pub async fn stress_test_with(
        &self,
        builder: &HttpRequestBuilder,
        options: StressTestOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<StressTestResult> {
        if options.parallelism == 0 {
            return Err(RemoteError::invalid_argument(
                "parallelism",
                "must be greater than zero",
            ));
        }

        let started = Instant::now();
        let mut times = Vec::with_capacity(options.requests * options.rounds);
        let mut successful = 0;

        for round in 0..options.rounds {
            let mut results = stream::iter(0..options.requests)
                .map(|_| async move {
                    let sent = Instant::now();
                    let result = self.send(builder, cancel).await;
                    (elapsed_ms(sent), result)
                })
                .buffer_unordered(options.parallelism);

            while let Some((elapsed, result)) = results.next().await {
                match result {
                    Ok(dispatch) if dispatch.is_success() => successful += 1,
                    Ok(_) => {}
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        tracing::debug!(
                            target: "horizon_lattice_remote::stress",
                            round,
                            error = %err,
                            "Stress request failed"
                        );
                    }
                }
                times.push(elapsed);
            }
        }

        let result = StressTestResult::from_samples(times, successful, elapsed_ms(started));
        tracing::info!(
            target: "horizon_lattice_remote::stress",
            total = result.total_requests,
            failed = result.failed_requests,
            qps = result.queries_per_second,
            "Stress test finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let result = StressTestResult::from_samples((1..=100).rev().collect(), 98, 500);
        assert_eq!(result.total_requests, 100);
        assert_eq!(result.failed_requests, 2);
        assert_eq!(result.min_response_time_ms, 1);
        assert_eq!(result.max_response_time_ms, 100);
        assert_eq!(result.p10_response_time_ms, 10);
        assert_eq!(result.p50_response_time_ms, 50);
        assert_eq!(result.p99_response_time_ms, 99);
        assert!((result.average_response_time_ms - 50.5).abs() < f64::EPSILON);
        assert!((result.queries_per_second - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_samples() {
        let result = StressTestResult::from_samples(Vec::new(), 0, 0);
        assert_eq!(result.total_requests, 0);
        assert_eq!(result.p90_response_time_ms, 0);
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let remote = HttpRemote::default();
        let builder = HttpRequestBuilder::get("http://127.0.0.1:9/");
        let options = StressTestOptions {
            parallelism: 0,
            ..Default::default()
        };
        assert!(matches!(
            remote.stress_test_with(&builder, options, None).await,
            Err(RemoteError::InvalidArgument { name: "parallelism", .. })
        ));
    }
}
