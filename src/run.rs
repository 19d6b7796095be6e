//! Top-level driver: readiness gate, supervised command, proxy shutdown.

use clap::Parser;
use std::time::Duration;

use crate::config::{CliArgs, Config};
use crate::endpoint::EndpointClient;
use crate::readiness::{ReadinessGate, ReadinessOutcome};
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::util::Telemetry;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("proxy not ready after {0:?}, giving up")]
    ReadinessDeadline(Duration),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl RunError {
    /// Exit code for the coordinator process.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::ReadinessDeadline(_) => 1,
            RunError::Supervisor(e) => e.exit_code(),
        }
    }
}

/// Parses the command line, reads the environment and runs the whole lifecycle.
///
/// Returns the exit code of the wrapped command.
pub async fn run() -> Result<i32, RunError> {
    let args = CliArgs::parse();
    let _telemetry = Telemetry::new(Config::logging_enabled_from_env());
    let config = Config::from_env();
    run_with(&config, args.command).await
}

/// Runs the lifecycle for an already resolved configuration and command line.
pub async fn run_with(config: &Config, command: Vec<String>) -> Result<i32, RunError> {
    let client = EndpointClient::new();
    match ReadinessGate::new(config, client.clone()).wait().await {
        ReadinessOutcome::Ready | ReadinessOutcome::Skipped => {}
        ReadinessOutcome::TimedOut { abort: false } => {
            tracing::warn!("Proxy readiness not confirmed, starting anyway");
        }
        ReadinessOutcome::TimedOut { abort: true } => {
            return Err(RunError::ReadinessDeadline(
                config.quit_without_ready_timeout(),
            ));
        }
    }

    let Some(supervisor) = ProcessSupervisor::from_command(command) else {
        tracing::info!("No arguments received, exiting");
        return Ok(0);
    };
    let exit_code = supervisor.run().await?;

    let report = ShutdownCoordinator::new(config, client)
        .run(exit_code)
        .await;
    tracing::debug!(
        decision = ?report.decision,
        actions = report.actions.len(),
        "Shutdown sequence finished"
    );
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_no_command_exits_cleanly() {
        let config = Config::default();
        assert_eq!(run_with(&config, vec![]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abort_deadline_is_fatal() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[
            ("ENVOY_ADMIN_API", &mock_server.uri()),
            ("QUIT_WITHOUT_ENVOY_TIMEOUT", "200ms"),
        ]);
        let err = run_with(&config, vec!["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ReadinessDeadline(_)), "{err}");
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_missing_executable_skips_shutdown() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let config = Config::from_pairs(&[
            ("START_WITHOUT_ENVOY", "true"),
            ("ENVOY_ADMIN_API", "http://127.0.0.1:15000"),
            ("ISTIO_QUIT_API", &mock_server.uri()),
        ]);
        let err = run_with(&config, vec!["scuttle-no-such-binary-xyz".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 127);
    }
}
