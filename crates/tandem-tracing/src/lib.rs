//! Subscriber setup for tandem networks and their tests.
//!
//! Both backends log layer binding and kernel compilation through `tracing`;
//! per-kernel timings go through [`perf_span!`] and are only recorded when
//! the active [`TracingConfig`] turns them on.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

#[doc(hidden)]
pub use tracing as __tracing;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Named presets for [`TracingConfig`], selected by `TANDEM_TRACING_PROFILE`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingProfile {
    /// Pretty coloured output; kernel timings only in debug builds.
    #[default]
    Local,
    /// JSON without colour, no kernel timings.
    Ci,
    /// JSON span-close events with the engine crates at `debug`, used to
    /// time kernel dispatch and `learn` steps.
    Performance,
}

impl TracingProfile {
    /// Unknown names map to [`TracingProfile::Local`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ci" => Self::Ci,
            "performance" | "perf" => Self::Performance,
            _ => Self::Local,
        }
    }
}

/// How the tandem subscriber filters and formats events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `tandem_core=debug,warn`. `None` defers to
    /// `RUST_LOG`, then to `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub include_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Gates every [`performance::PerformanceSpan`].
    pub enable_performance_tracing: bool,
    /// Kernel spans shorter than this many microseconds are not logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(TracingProfile::Local)
    }
}

impl TracingConfig {
    pub fn for_profile(profile: TracingProfile) -> Self {
        let base = Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            performance_threshold_us: None,
        };
        match profile {
            TracingProfile::Local => Self {
                ansi: true,
                output: TracingOutput::Pretty,
                enable_performance_tracing: cfg!(debug_assertions),
                ..base
            },
            TracingProfile::Ci => base,
            TracingProfile::Performance => Self {
                directives: Some("tandem_backends=debug,tandem_core=debug,info".to_string()),
                span_events: FmtSpan::CLOSE,
                enable_performance_tracing: true,
                ..base
            },
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(TracingProfile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(TracingProfile::Ci)
    }

    pub fn for_performance() -> Self {
        Self::for_profile(TracingProfile::Performance)
    }

    /// Profile preset plus overrides from the environment:
    ///
    /// - `TANDEM_TRACING_PROFILE`: `local`, `ci` or `performance`
    /// - `TANDEM_TRACING_DIRECTIVES`: filter directives
    /// - `TANDEM_TRACING_FORMAT`: `pretty`, `compact` or `json`
    /// - `TANDEM_PERF_TRACING`: `1`, `true` or `yes` turns kernel spans on
    /// - `TANDEM_PERF_THRESHOLD_US`: minimum logged kernel span
    pub fn from_env() -> Self {
        let profile = env::var("TANDEM_TRACING_PROFILE").map(|name| TracingProfile::parse(&name)).unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Some(directives) = env::var("TANDEM_TRACING_DIRECTIVES").ok().filter(|d| !d.trim().is_empty()) {
            config.directives = Some(directives);
        }
        if let Some(output) = env::var("TANDEM_TRACING_FORMAT").ok().and_then(|f| TracingOutput::parse(&f)) {
            config.output = output;
            config.ansi &= output != TracingOutput::Json;
        }
        if let Ok(flag) = env::var("TANDEM_PERF_TRACING") {
            config.enable_performance_tracing = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(threshold) = env::var("TANDEM_PERF_THRESHOLD_US").ok().and_then(|t| t.trim().parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }
        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Another subscriber already owns the process.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Registry with the configured filter and formatter attached.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.filter()?;
    let span_events = config.span_events.clone();
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };
    Ok(Registry::default().with(formatter).with(filter))
}

/// Used by the `learn_step` bench; also configures kernel span timing.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// `warn`-level subscriber on the test writer. Every network test calls
/// this; only the first call in a process installs anything.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
