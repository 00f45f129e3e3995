//! Shared tracing setup for the twinbuf workspace.
//!
//! Binaries, benches and tests install their subscriber through
//! [`init_global_tracing`] (or [`init_test_tracing`]) so filter resolution,
//! output format and the performance-span switch come from one place.
//!
//! # Environment Variables
//!
//! - `TWINBUF_TRACING_PROFILE` - `local` (default), `ci`, or `performance`
//! - `TWINBUF_TRACING_DIRECTIVES` - overrides tracing directives (else `RUST_LOG`)
//! - `TWINBUF_TRACING_FORMAT` - `pretty`, `compact`, or `json`
//! - `TWINBUF_PERF_TRACING` - `true`/`1`/`yes` enables performance spans
//! - `TWINBUF_PERF_THRESHOLD_US` - minimum span duration to log

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Starting points for a [`TracingConfig`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TracingProfile {
    /// Pretty, coloured output; performance spans in debug builds
    #[default]
    Local,
    /// JSON without colour for log collectors
    Ci,
    /// JSON with span close timings and debug-level device/buffer events
    Performance,
}

impl TracingProfile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "ci" => Some(Self::Ci),
            "performance" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// Output format of the formatter layer
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

#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `twinbuf_core=debug`; `RUST_LOG` when absent
    pub directives: Option<String>,
    /// Used when neither `directives` nor `RUST_LOG` is set
    pub default_directive: String,
    pub output: TracingOutput,
    pub ansi: bool,
    /// Emit an event with timings when a span closes
    pub close_spans: bool,
    pub enable_performance_tracing: bool,
    /// Minimum duration in microseconds before a performance span is logged
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
            output: TracingOutput::Json,
            ansi: false,
            close_spans: false,
            enable_performance_tracing: false,
            performance_threshold_us: None,
        };

        match profile {
            TracingProfile::Local => Self {
                output: TracingOutput::Pretty,
                ansi: true,
                enable_performance_tracing: cfg!(debug_assertions),
                ..base
            },
            TracingProfile::Ci => base,
            TracingProfile::Performance => Self {
                directives: Some("twinbuf_device=debug,twinbuf_core=debug".to_string()),
                close_spans: true,
                enable_performance_tracing: true,
                ..base
            },
        }
    }

    /// Profile from `TWINBUF_TRACING_PROFILE`, then the individual overrides.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let profile = env::var("TWINBUF_TRACING_PROFILE")
            .ok()
            .and_then(|value| TracingProfile::parse(&value))
            .unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Ok(directives) = env::var("TWINBUF_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Some(output) = env::var("TWINBUF_TRACING_FORMAT")
            .ok()
            .and_then(|value| TracingOutput::parse(&value))
        {
            config.output = output;
            config.ansi &= output != TracingOutput::Json;
        }

        if let Ok(flag) = env::var("TWINBUF_PERF_TRACING") {
            config.enable_performance_tracing = matches!(flag.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }

        if let Ok(threshold) = env::var("TWINBUF_PERF_THRESHOLD_US") {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
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

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.close_spans { FmtSpan::CLOSE } else { FmtSpan::NONE };
        let layer = tracing_fmt::layer().with_span_events(span_events);

        match self.output {
            TracingOutput::Compact => Box::new(layer.compact().with_ansi(self.ansi)),
            TracingOutput::Pretty => Box::new(layer.pretty().with_ansi(self.ansi)),
            TracingOutput::Json => Box::new(layer.json().with_ansi(false)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// Usually a subscriber is already installed
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[source] tracing_subscriber::util::TryInitError),
}

/// Install the configured subscriber as the process-wide default.
///
/// Also applies the performance-span settings from `config`.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    let filter = config.filter()?;
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);

    Registry::default()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a compact `warn`-level subscriber for tests; a second call is a no-op.
pub fn init_test_tracing() {
    let config = TracingConfig {
        default_directive: "warn".to_string(),
        output: TracingOutput::Compact,
        ansi: false,
        ..TracingConfig::from_env()
    };
    let _ = init_global_tracing(&config);
}
