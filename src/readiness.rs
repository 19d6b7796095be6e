//! Readiness gate: holds the wrapped command back until the proxy and any companion
//! services answer.
//!
//! The admin API is polled first (`GET /server_info` until the state is `LIVE`), then
//! every generic ready endpoint in order, each until it answers with a 2xx. Endpoints
//! are waited on one after another, so the worst case is the sum of their startup times.
//! An optional deadline bounds the whole phase.

use reqwest::Method;
use std::time::Duration;

use crate::config::Config;
use crate::endpoint::EndpointClient;
use crate::retry::{Backoff, RetryPolicy};

/// Result of waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// Everything configured reported ready
    Ready,
    /// Waiting was disabled by configuration
    Skipped,
    /// The deadline elapsed first; `abort` tells the caller to give up instead of starting
    TimedOut { abort: bool },
}

/// What to do when the readiness deadline elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExpiry {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessDeadline {
    pub timeout: Duration,
    pub on_expiry: OnExpiry,
}

impl ReadinessDeadline {
    /// `QUIT_WITHOUT_ENVOY_TIMEOUT` takes precedence over `WAIT_FOR_ENVOY_TIMEOUT`.
    pub fn from_config(config: &Config) -> Option<Self> {
        if !config.quit_without_ready_timeout().is_zero() {
            Some(Self {
                timeout: config.quit_without_ready_timeout(),
                on_expiry: OnExpiry::Abort,
            })
        } else if !config.wait_timeout().is_zero() {
            Some(Self {
                timeout: config.wait_timeout(),
                on_expiry: OnExpiry::Continue,
            })
        } else {
            None
        }
    }
}

pub struct ReadinessGate<'a> {
    config: &'a Config,
    client: EndpointClient,
    backoff: Backoff,
}

impl<'a> ReadinessGate<'a> {
    pub fn new(config: &'a Config, client: EndpointClient) -> Self {
        Self {
            config,
            client,
            backoff: Backoff::default(),
        }
    }

    /// Replaces the backoff curve used between polls.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Blocks until everything configured is ready, the deadline elapses, or waiting is
    /// disabled.
    pub async fn wait(&self) -> ReadinessOutcome {
        if self.config.start_without_waiting() {
            tracing::info!("START_WITHOUT_ENVOY is true, not waiting for readiness");
            return ReadinessOutcome::Skipped;
        }
        let admin_api = self.config.admin_api();
        if admin_api.is_empty() && self.config.generic_ready_endpoints().is_empty() {
            return ReadinessOutcome::Ready;
        }

        let deadline = ReadinessDeadline::from_config(self.config);
        let policy = RetryPolicy::new(self.backoff)
            .with_deadline(deadline.map(|d| d.timeout).unwrap_or_default());

        let polling = async {
            if !admin_api.is_empty() {
                self.wait_for_admin_api(&policy, admin_api).await;
            }
            self.wait_for_generic_endpoints(&policy).await;
        };
        match policy.within_deadline(polling).await {
            Ok(()) => {
                tracing::info!("Blocking finished, dependencies are ready");
                ReadinessOutcome::Ready
            }
            Err(e) => {
                let abort = deadline.is_some_and(|d| d.on_expiry == OnExpiry::Abort);
                tracing::warn!(abort, "Stopped waiting for readiness: {}", e);
                ReadinessOutcome::TimedOut { abort }
            }
        }
    }

    async fn wait_for_admin_api(&self, policy: &RetryPolicy, admin_api: &str) {
        tracing::info!("Blocking until Envoy starts");
        let url = format!("{}/server_info", admin_api.trim_end_matches('/'));
        let client = &self.client;
        let url = url.as_str();
        let (_, attempts) = policy
            .retry("Envoy admin API", move || async move {
                match client.server_info(url, None).await {
                    Ok(info) if info.is_live() => Ok(()),
                    Ok(info) => Err(format!("state is {:?}, not live yet", info.state)),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        tracing::info!(attempts, "Envoy is live");
    }

    async fn wait_for_generic_endpoints(&self, policy: &RetryPolicy) {
        for endpoint in self.config.generic_ready_endpoints() {
            let client = &self.client;
            let endpoint = endpoint.as_str();
            let (status, attempts) = policy
                .retry(endpoint, move || async move {
                    match client.call(Method::GET, endpoint, None).await {
                        Ok(status) if status.is_success() => Ok(status),
                        Ok(status) => Err(format!(
                            "endpoint '{}' replied with non-ok status code: {}",
                            endpoint,
                            status.as_u16()
                        )),
                        Err(e) => Err(e.to_string()),
                    }
                })
                .await;
            tracing::info!(
                attempts,
                "Sent GET to '{}', status code: {}",
                endpoint,
                status.as_u16()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_backoff() -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(10),
            multiplier: 1.5,
            max_interval: Duration::from_millis(50),
            randomization_factor: 0.0,
        }
    }

    fn live() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(r#"{"state": "LIVE"}"#)
    }

    async fn wait(config: &Config) -> ReadinessOutcome {
        ReadinessGate::new(config, EndpointClient::new())
            .with_backoff(fast_backoff())
            .wait()
            .await
    }

    #[tokio::test]
    async fn test_start_without_waiting_makes_no_calls() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(0)
            .mount(&mock_server)
            .await;

        let ready_url = format!("{}/ready", mock_server.uri());
        let config = Config::from_pairs(&[
            ("START_WITHOUT_ENVOY", "true"),
            ("ENVOY_ADMIN_API", &mock_server.uri()),
            ("GENERIC_READY_ENDPOINTS", &ready_url),
        ]);
        assert_eq!(wait(&config).await, ReadinessOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_nothing_configured_is_ready() {
        let config = Config::default();
        assert_eq!(wait(&config).await, ReadinessOutcome::Ready);
    }

    #[tokio::test]
    async fn test_live_admin_api() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server_info"))
            .respond_with(live())
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[("ENVOY_ADMIN_API", &mock_server.uri())]);
        assert_eq!(wait(&config).await, ReadinessOutcome::Ready);
    }

    #[tokio::test]
    async fn test_admin_api_eventually_live() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server_info"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/server_info"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"state": "PRE_INITIALIZING"}"#),
            )
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/server_info"))
            .respond_with(live())
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[("ENVOY_ADMIN_API", &mock_server.uri())]);
        assert_eq!(wait(&config).await, ReadinessOutcome::Ready);

        let requests = mock_server.received_requests().await.unwrap();
        assert!(requests.len() >= 6, "only {} polls", requests.len());
    }

    #[tokio::test]
    async fn test_abort_deadline_times_out_on_time() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[
            ("ENVOY_ADMIN_API", &mock_server.uri()),
            ("QUIT_WITHOUT_ENVOY_TIMEOUT", "300ms"),
        ]);
        let started = Instant::now();
        let outcome = wait(&config).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, ReadinessOutcome::TimedOut { abort: true });
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(900), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_wait_deadline_continues() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[
            ("ENVOY_ADMIN_API", &mock_server.uri()),
            ("WAIT_FOR_ENVOY_TIMEOUT", "200ms"),
        ]);
        assert_eq!(
            wait(&config).await,
            ReadinessOutcome::TimedOut { abort: false }
        );
    }

    #[tokio::test]
    async fn test_deadline_covers_generic_endpoints() {
        let admin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server_info"))
            .respond_with(live())
            .mount(&admin)
            .await;
        let generic = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&generic)
            .await;

        let config = Config::from_pairs(&[
            ("ENVOY_ADMIN_API", &admin.uri()),
            ("GENERIC_READY_ENDPOINTS", &generic.uri()),
            ("QUIT_WITHOUT_ENVOY_TIMEOUT", "200ms"),
        ]);
        assert_eq!(
            wait(&config).await,
            ReadinessOutcome::TimedOut { abort: true }
        );
    }

    #[tokio::test]
    async fn test_generic_ready_endpoints_polled_in_order() {
        let first = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ready"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&first)
            .await;
        Mock::given(method("GET"))
            .and(path("/ready"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&first)
            .await;
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&second)
            .await;

        let endpoints = format!("{}/ready, {}/healthz", first.uri(), second.uri());
        let config = Config::from_pairs(&[("GENERIC_READY_ENDPOINTS", &endpoints)]);
        assert_eq!(wait(&config).await, ReadinessOutcome::Ready);

        let first_requests = first.received_requests().await.unwrap();
        assert_eq!(first_requests.len(), 3);
    }

    #[test]
    fn test_deadline_precedence() {
        assert_eq!(ReadinessDeadline::from_config(&Config::default()), None);

        let config = Config::from_pairs(&[("WAIT_FOR_ENVOY_TIMEOUT", "5s")]);
        assert_eq!(
            ReadinessDeadline::from_config(&config),
            Some(ReadinessDeadline {
                timeout: Duration::from_secs(5),
                on_expiry: OnExpiry::Continue,
            })
        );

        let config = Config::from_pairs(&[
            ("WAIT_FOR_ENVOY_TIMEOUT", "5s"),
            ("QUIT_WITHOUT_ENVOY_TIMEOUT", "1s"),
        ]);
        assert_eq!(
            ReadinessDeadline::from_config(&config),
            Some(ReadinessDeadline {
                timeout: Duration::from_secs(1),
                on_expiry: OnExpiry::Abort,
            })
        );
    }
}
