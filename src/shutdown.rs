//! Stopping the mesh proxy once the wrapped command has exited.
//!
//! [`ShutdownCoordinator::decide`] evaluates an ordered list of guarded rules against the
//! configuration and the child's exit code; the first matching rule picks the branch.
//! [`ShutdownCoordinator::run`] then performs that branch. Nothing done here affects the
//! exit code of the coordinator: every failure is logged and the sequence moves on.

use reqwest::Method;
use std::net::IpAddr;
use url::{Host, Url};

use crate::config::Config;
use crate::endpoint::EndpointClient;

/// Which shutdown branch was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDecision {
    /// Only the generic quit endpoints are called
    GenericQuitOnly,
    /// No admin API configured, the proxy is left alone
    NoAdminApi,
    /// The proxy is not on this host, it is left alone
    NotLocal,
    /// Killing the proxy is disabled
    NeverKill,
    /// The child failed and killing the proxy on failure is disabled
    NeverKillOnFailure,
    /// No quit API, the kill command is the only way
    FallbackOnly,
    /// Quit API first, the kill command if that fails and fallback is enabled
    ApiThenMaybeFallback,
}

/// A side effect performed during shutdown and whether it worked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownAction {
    GenericQuit { url: String, succeeded: bool },
    QuitApi { url: String, succeeded: bool },
    KillCommand { succeeded: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub decision: ShutdownDecision,
    pub actions: Vec<ShutdownAction>,
}

/// External command that stops the proxy when its quit API cannot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for KillCommand {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "pkill -SIGINT pilot-agent".to_string()],
        }
    }
}

impl KillCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run(&self) -> bool {
        tracing::info!("Stopping Istio using {} {}", self.program, self.args.join(" "));
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                tracing::info!("Kill command finished");
                true
            }
            Ok(status) => {
                tracing::warn!("Kill command exited with {}", status);
                false
            }
            Err(e) => {
                tracing::warn!("Kill command failed to start: {}", e);
                false
            }
        }
    }
}

type Guard = fn(&Config, i32) -> bool;

/// Checked in order, first match wins. No match means [`ShutdownDecision::ApiThenMaybeFallback`].
const RULES: &[(Guard, ShutdownDecision)] = &[
    (generic_quit_only, ShutdownDecision::GenericQuitOnly),
    (no_admin_api, ShutdownDecision::NoAdminApi),
    (proxy_not_local, ShutdownDecision::NotLocal),
    (never_kill, ShutdownDecision::NeverKill),
    (
        never_kill_on_failure,
        ShutdownDecision::NeverKillOnFailure,
    ),
    (no_quit_api, ShutdownDecision::FallbackOnly),
];

fn generic_quit_only(config: &Config, _: i32) -> bool {
    config.generic_quit_only()
}

fn no_admin_api(config: &Config, _: i32) -> bool {
    config.admin_api().is_empty()
}

/// Judged on the quit URL, or on the admin URL when the quit URL is empty or does not parse.
fn proxy_not_local(config: &Config, _: i32) -> bool {
    let proxy_url = if Url::parse(config.quit_api()).is_ok() {
        config.quit_api()
    } else {
        config.admin_api()
    };
    !is_local_host(proxy_url)
}

fn never_kill(config: &Config, _: i32) -> bool {
    config.never_kill()
}

fn never_kill_on_failure(config: &Config, exit_code: i32) -> bool {
    config.never_kill_on_failure() && exit_code != 0
}

fn no_quit_api(config: &Config, _: i32) -> bool {
    config.quit_api().is_empty()
}

/// Whether `url` points at this host: `localhost` or a loopback address.
///
/// A URL that does not parse is not local.
pub fn is_local_host(url: &str) -> bool {
    let Ok(url) = Url::parse(url) else {
        return false;
    };
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

pub struct ShutdownCoordinator<'a> {
    config: &'a Config,
    client: EndpointClient,
    kill_command: KillCommand,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(config: &'a Config, client: EndpointClient) -> Self {
        Self {
            config,
            client,
            kill_command: KillCommand::default(),
        }
    }

    /// Replaces the command run when the proxy has to be killed.
    pub fn with_kill_command(mut self, kill_command: KillCommand) -> Self {
        self.kill_command = kill_command;
        self
    }

    /// Picks the shutdown branch for a child that exited with `exit_code`.
    pub fn decide(config: &Config, exit_code: i32) -> ShutdownDecision {
        RULES
            .iter()
            .find(|(guard, _)| guard(config, exit_code))
            .map(|(_, decision)| *decision)
            .unwrap_or(ShutdownDecision::ApiThenMaybeFallback)
    }

    /// Performs the branch picked by [`Self::decide`].
    pub async fn run(&self, exit_code: i32) -> ShutdownReport {
        let decision = Self::decide(self.config, exit_code);
        let mut actions = Vec::new();
        match decision {
            ShutdownDecision::GenericQuitOnly => {
                tracing::info!("GENERIC_QUIT_ONLY is set, only calling generic quit endpoints");
                self.call_generic_quit_endpoints(&mut actions).await;
            }
            ShutdownDecision::NoAdminApi => {
                tracing::info!("ENVOY_ADMIN_API not set, not stopping Istio");
            }
            ShutdownDecision::NotLocal => {
                tracing::info!("Istio endpoint is not on localhost, not stopping it");
            }
            ShutdownDecision::NeverKill => {
                tracing::info!("NEVER_KILL_ISTIO is true, not stopping Istio");
            }
            ShutdownDecision::NeverKillOnFailure => {
                tracing::info!(
                    exit_code,
                    "NEVER_KILL_ISTIO_ON_FAILURE is true and the command failed, not stopping Istio"
                );
            }
            ShutdownDecision::FallbackOnly => {
                self.call_generic_quit_endpoints(&mut actions).await;
                tracing::info!("No quit API resolved, falling back to the kill command");
                let succeeded = self.kill_command.run().await;
                actions.push(ShutdownAction::KillCommand { succeeded });
            }
            ShutdownDecision::ApiThenMaybeFallback => {
                self.call_generic_quit_endpoints(&mut actions).await;
                let succeeded = self.call_quit_api(&mut actions).await;
                if !succeeded && self.config.fallback_to_kill() {
                    tracing::info!("Quit API failed, ISTIO_FALLBACK_PKILL is set, killing Istio");
                    let succeeded = self.kill_command.run().await;
                    actions.push(ShutdownAction::KillCommand { succeeded });
                }
            }
        }
        ShutdownReport { decision, actions }
    }

    async fn call_generic_quit_endpoints(&self, actions: &mut Vec<ShutdownAction>) {
        let timeout = Some(self.config.quit_request_timeout());
        for endpoint in self.config.generic_quit_endpoints() {
            let succeeded = match self.client.call(Method::POST, endpoint, timeout).await {
                Ok(status) if status.is_success() => {
                    tracing::info!("Sent POST to '{}', status code: {}", endpoint, status.as_u16());
                    true
                }
                Ok(status) => {
                    tracing::warn!(
                        "Sent POST to '{}', non-ok status code: {}",
                        endpoint,
                        status.as_u16()
                    );
                    false
                }
                Err(e) => {
                    tracing::warn!("Sent POST to '{}', error: {}", endpoint, e);
                    false
                }
            };
            actions.push(ShutdownAction::GenericQuit {
                url: endpoint.clone(),
                succeeded,
            });
        }
    }

    async fn call_quit_api(&self, actions: &mut Vec<ShutdownAction>) -> bool {
        let url = format!("{}/quitquitquit", self.config.quit_api().trim_end_matches('/'));
        tracing::info!("Stopping Istio using Istio API '{}'", url);
        let timeout = Some(self.config.quit_request_timeout());
        let succeeded = match self.client.call(Method::POST, &url, timeout).await {
            Ok(status) if status.is_success() => {
                tracing::info!("Sent quitquitquit to Istio, status code: {}", status.as_u16());
                true
            }
            Ok(status) => {
                tracing::warn!("Istio quit API replied with status code: {}", status.as_u16());
                false
            }
            Err(e) => {
                tracing::warn!("Sent quitquitquit to Istio, error: {}", e);
                false
            }
        };
        actions.push(ShutdownAction::QuitApi { url, succeeded });
        succeeded
    }
}
