//! Configuration for the sidecar coordinator.
//!
//! All values come from environment variables and are read exactly once at startup.
//! A value that fails to parse is logged and replaced by its default, so a typo in a
//! pod spec never prevents the wrapped command from starting.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SCUTTLE_LOGGING` | `true` |
//! | `ENVOY_ADMIN_API` | empty (feature disabled) |
//! | `START_WITHOUT_ENVOY` | `false` |
//! | `WAIT_FOR_ENVOY_TIMEOUT` | `0` (wait forever) |
//! | `QUIT_WITHOUT_ENVOY_TIMEOUT` | `0` (never abort) |
//! | `ISTIO_QUIT_API` | derived from `ENVOY_ADMIN_API` |
//! | `NEVER_KILL_ISTIO` | `false` |
//! | `NEVER_KILL_ISTIO_ON_FAILURE` | `false` |
//! | `ISTIO_FALLBACK_PKILL` | `false` |
//! | `GENERIC_QUIT_ONLY` | `false` |
//! | `GENERIC_QUIT_ENDPOINTS` | empty |
//! | `GENERIC_READY_ENDPOINTS` | empty |
//! | `QUIT_REQUEST_TIMEOUT` | `5s` |

use std::env;
use std::time::Duration;
use url::Url;

/// Command line of the coordinator.
///
/// Everything after the binary name belongs to the wrapped command, including
/// anything that looks like a flag.
#[derive(clap::Parser, Debug)]
#[command(name = "scuttle")]
#[command(about = "Runs a command once the mesh proxy is ready, then stops the proxy")]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct CliArgs {
    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Coordinator configuration.
///
/// Built once by [`Config::from_env`] and handed by reference to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    admin_api: String,
    start_without_waiting: bool,
    wait_timeout: Duration,
    quit_without_ready_timeout: Duration,
    quit_api: String,
    never_kill: bool,
    never_kill_on_failure: bool,
    fallback_to_kill: bool,
    generic_quit_only: bool,
    generic_quit_endpoints: Vec<String>,
    generic_ready_endpoints: Vec<String>,
    quit_request_timeout: Duration,
}

pub mod config_defaults {
    use std::time::Duration;

    pub const DEFAULT_ADMIN_API_PORT: u16 = 15000;
    pub const DEFAULT_QUIT_API_PORT: u16 = 15020;
    pub const DEFAULT_QUIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_LOGGING_ENABLED: bool = true;
}

impl Default for Config {
    fn default() -> Self {
        Config::from_lookup(|_| None)
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let values = EnvValues { lookup: &lookup };
        let admin_api = values.string("ENVOY_ADMIN_API");
        let mut quit_api = values.string("ISTIO_QUIT_API");
        if quit_api.is_empty() {
            quit_api = replace_port(
                &admin_api,
                config_defaults::DEFAULT_ADMIN_API_PORT,
                config_defaults::DEFAULT_QUIT_API_PORT,
            );
        }
        Config {
            admin_api,
            start_without_waiting: values.bool("START_WITHOUT_ENVOY", false),
            wait_timeout: values.duration("WAIT_FOR_ENVOY_TIMEOUT", Duration::ZERO),
            quit_without_ready_timeout: values
                .duration("QUIT_WITHOUT_ENVOY_TIMEOUT", Duration::ZERO),
            quit_api,
            never_kill: values.bool("NEVER_KILL_ISTIO", false),
            never_kill_on_failure: values.bool("NEVER_KILL_ISTIO_ON_FAILURE", false),
            fallback_to_kill: values.bool("ISTIO_FALLBACK_PKILL", false),
            generic_quit_only: values.bool("GENERIC_QUIT_ONLY", false),
            generic_quit_endpoints: values.list("GENERIC_QUIT_ENDPOINTS"),
            generic_ready_endpoints: values.list("GENERIC_READY_ENDPOINTS"),
            quit_request_timeout: values.duration(
                "QUIT_REQUEST_TIMEOUT",
                config_defaults::DEFAULT_QUIT_REQUEST_TIMEOUT,
            ),
        }
    }

    /// Whether log output is enabled (`SCUTTLE_LOGGING`), read without logging anything.
    ///
    /// Read before the subscriber is installed, so it is not part of [`Config`].
    pub fn logging_enabled_from_env() -> bool {
        Self::logging_enabled_from_lookup(|name| env::var(name).ok())
    }

    pub fn logging_enabled_from_lookup<F>(lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("SCUTTLE_LOGGING")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(config_defaults::DEFAULT_LOGGING_ENABLED)
    }

    /// Base URL of the proxy admin API. Empty when the feature is disabled.
    pub fn admin_api(&self) -> &str {
        &self.admin_api
    }

    pub fn start_without_waiting(&self) -> bool {
        self.start_without_waiting
    }

    /// Readiness timeout after which the command starts anyway. Zero means wait forever.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Readiness timeout after which the coordinator gives up. Zero means never.
    pub fn quit_without_ready_timeout(&self) -> Duration {
        self.quit_without_ready_timeout
    }

    /// Base URL of the proxy quit API, explicit or derived. Empty when unresolvable.
    pub fn quit_api(&self) -> &str {
        &self.quit_api
    }

    pub fn never_kill(&self) -> bool {
        self.never_kill
    }

    pub fn never_kill_on_failure(&self) -> bool {
        self.never_kill_on_failure
    }

    pub fn fallback_to_kill(&self) -> bool {
        self.fallback_to_kill
    }

    pub fn generic_quit_only(&self) -> bool {
        self.generic_quit_only
    }

    pub fn generic_quit_endpoints(&self) -> &[String] {
        &self.generic_quit_endpoints
    }

    pub fn generic_ready_endpoints(&self) -> &[String] {
        &self.generic_ready_endpoints
    }

    /// Timeout applied to every request made while shutting the proxy down.
    pub fn quit_request_timeout(&self) -> Duration {
        self.quit_request_timeout
    }
}

#[cfg(test)]
impl Config {
    /// Builds a configuration from `(variable, value)` pairs.
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::from_lookup(|name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        })
    }
}

/// Typed access to raw environment values, logging each resolved value.
struct EnvValues<'a, F> {
    lookup: &'a F,
}

impl<F> EnvValues<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.is_empty())
    }

    fn string(&self, name: &str) -> String {
        let value = self.raw(name).unwrap_or_default();
        tracing::info!("{}: {}", name, value);
        value
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        let Some(raw) = self.raw(name) else {
            return default;
        };
        match parse_bool(&raw) {
            Some(value) => {
                tracing::info!("{}: {}", name, value);
                value
            }
            None => {
                tracing::warn!("{}: {} (invalid value will be ignored)", name, raw);
                default
            }
        }
    }

    fn duration(&self, name: &str, default: Duration) -> Duration {
        let Some(raw) = self.raw(name) else {
            return default;
        };
        match parse_duration(&raw) {
            Ok(value) => {
                tracing::info!("{}: {}", name, raw);
                value
            }
            Err(e) => {
                tracing::warn!("{}: {} (invalid value will be ignored: {})", name, raw, e);
                default
            }
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        let Some(raw) = self.raw(name) else {
            return Vec::new();
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Vec::new();
        }
        tracing::info!("{}: {}", name, raw);
        raw.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

/// Accepts exactly `true` or `false`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Returns `source_url` with its port replaced, but only when the URL parses and its
/// port is exactly `original`. Otherwise returns an empty string.
pub fn replace_port(source_url: &str, original: u16, replacement: u16) -> String {
    let Ok(mut url) = Url::parse(source_url) else {
        return String::new();
    };
    if url.port() != Some(original) || url.set_port(Some(replacement)).is_err() {
        return String::new();
    }
    let derived = url.to_string();
    let bare_root = url.path() == "/" && url.query().is_none() && url.fragment().is_none();
    if bare_root && !source_url.ends_with('/') {
        derived.trim_end_matches('/').to_string()
    } else {
        derived
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
}

/// Parses a duration such as `300ms`, `5s`, `1m30s` or `1.5h`.
///
/// Units: `ns`, `us` (`µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(DurationParseError::Invalid(input.to_string()));
    }
    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(DurationParseError::Invalid(input.to_string()));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let scale = match unit {
            "" => return Err(DurationParseError::MissingUnit(input.to_string())),
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => {
                return Err(DurationParseError::UnknownUnit {
                    unit: unit.to_string(),
                    input: input.to_string(),
                });
            }
        };
        total_nanos += value * scale;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
