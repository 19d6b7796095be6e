use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installed `tracing` subscriber.
///
/// With logging enabled, events are written by the `fmt` layer and filtered by `RUST_LOG`
/// (default `info`). With logging disabled, every event is dropped.
#[derive(Debug, Clone, Copy)]
pub struct Telemetry {
    logging_enabled: bool,
}

impl Telemetry {
    /// Registers the global subscriber. A subscriber that is already installed is kept.
    pub fn new(logging_enabled: bool) -> Self {
        let filter = if logging_enabled {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        } else {
            EnvFilter::default().add_directive(LevelFilter::OFF.into())
        };
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init();
        if let Err(err) = installed {
            eprintln!("scuttle: logging already initialized: {err}");
        }
        Self { logging_enabled }
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging_enabled
    }
}
