//! Tracing setup shared by every clgrind crate, test and embedding tool.
//!
//! Simulator runs are noisy: thousands of work-items each emit memory and
//! instruction events. This crate keeps subscriber construction in one place
//! so that the core engine, the analysis plugins and the test suites agree on
//! filtering, output format and which fields get redacted (kernel argument
//! payloads can carry user data).

pub mod performance;

#[macro_use]
pub mod macros;

use std::collections::HashSet;
use std::env;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};

use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::{FmtSpan, Writer};
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the preset (`local`, `ci`, `profiling`).
pub const ENV_PROFILE: &str = "CLGRIND_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "CLGRIND_TRACING_DIRECTIVES";
/// Environment variable selecting `pretty`, `compact` or `json` output.
pub const ENV_FORMAT: &str = "CLGRIND_TRACING_FORMAT";
/// Comma-separated field names to redact.
pub const ENV_REDACT_FIELDS: &str = "CLGRIND_TRACING_REDACT_FIELDS";
/// Replacement text for redacted values.
pub const ENV_REDACT_TOKEN: &str = "CLGRIND_TRACING_REDACT_TOKEN";
/// Enables or disables performance spans.
pub const ENV_PERF_TRACING: &str = "CLGRIND_PERF_TRACING";
/// Minimum span duration (microseconds) worth logging.
pub const ENV_PERF_THRESHOLD_US: &str = "CLGRIND_PERF_THRESHOLD_US";
/// Filter directives for performance spans.
pub const ENV_PERF_DIRECTIVES: &str = "CLGRIND_PERF_DIRECTIVES";

/// How the shared subscriber should filter and format events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit filter directives (e.g. `clgrind_core=debug,info`). When
    /// absent, `RUST_LOG` is consulted and then [`Self::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves to a valid filter.
    pub default_directive: String,
    /// Show event targets (module paths).
    pub include_targets: bool,
    /// ANSI colour codes in text output.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter flavour.
    pub output: TracingOutput,
    /// Field names whose values are replaced before formatting.
    pub redacted_fields: Vec<String>,
    /// Replacement text for redacted values.
    pub redaction_text: String,
    /// When false, [`performance::PerformanceSpan`] guards skip logging.
    pub enable_performance_tracing: bool,
    /// Spans shorter than this (microseconds) are not logged.
    pub performance_threshold_us: Option<u64>,
    /// Separate directives for the performance target.
    pub performance_directives: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Human-oriented output for a developer terminal.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            redacted_fields: Vec::new(),
            redaction_text: "***REDACTED***".to_string(),
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
            performance_directives: None,
        }
    }

    /// Machine-readable JSON without colour, for CI log collection.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// JSON output with span timing for profiling the simulator itself.
    ///
    /// Turns on debug level for the engine and plugin crates and records
    /// span enter/exit/close so per-work-group timings can be reconstructed.
    pub fn for_profiling() -> Self {
        Self {
            directives: Some("clgrind_core=debug,clgrind_plugins=debug".to_string()),
            ansi: false,
            span_events: FmtSpan::ENTER | FmtSpan::EXIT | FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            performance_directives: Some("clgrind_core=trace".to_string()),
            ..Self::for_local()
        }
    }

    /// Build a configuration from `CLGRIND_*` environment variables.
    ///
    /// The preset is chosen by [`ENV_PROFILE`]; individual variables then
    /// override fields of that preset.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "profiling" | "performance" => Self::for_profiling(),
            _ => Self::for_local(),
        };

        if let Some(directives) = non_empty_var(ENV_DIRECTIVES) {
            config.directives = Some(directives);
        }

        if let Some(parsed) = env::var(ENV_FORMAT).ok().and_then(|v| TracingOutput::from_env_value(&v)) {
            config.output = parsed;
            if config.output == TracingOutput::Json {
                config.ansi = false;
            }
        }

        if let Ok(redacted) = env::var(ENV_REDACT_FIELDS) {
            let fields: Vec<String> = redacted
                .split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect();
            if !fields.is_empty() {
                config.redacted_fields = fields;
            }
        }

        if let Some(token) = non_empty_var(ENV_REDACT_TOKEN) {
            config.redaction_text = token;
        }

        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.enable_performance_tracing = parse_flag(&flag);
        }

        if let Some(threshold_us) = env::var(ENV_PERF_THRESHOLD_US).ok().and_then(|v| v.parse::<u64>().ok()) {
            config.performance_threshold_us = Some(threshold_us);
        }

        if let Some(directives) = non_empty_var(ENV_PERF_DIRECTIVES) {
            config.performance_directives = Some(directives);
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Interpret `1`, `true`, `yes` and `on` (any case) as enabled.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Errors raised while installing the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// A global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[source] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Filter and formatter layers for callers composing their own registry.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.resolve_filter()?;
    let redaction = (!config.redacted_fields.is_empty()).then(|| Redaction {
        fields: Arc::new(config.redacted_fields.iter().cloned().collect()),
        replacement: Arc::new(config.redaction_text.clone()),
    });

    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (&config.output, redaction) {
        (TracingOutput::Compact, None) => Box::new(base.with_ansi(config.ansi)),
        (TracingOutput::Compact, Some(r)) => Box::new(base.with_ansi(config.ansi).fmt_fields(r.text())),
        (TracingOutput::Pretty, None) => Box::new(base.pretty().with_ansi(config.ansi)),
        (TracingOutput::Pretty, Some(r)) => Box::new(base.pretty().with_ansi(config.ansi).fmt_fields(r.text())),
        (TracingOutput::Json, None) => Box::new(base.json().with_ansi(false)),
        (TracingOutput::Json, Some(r)) => Box::new(base.json().with_ansi(false).fmt_fields(r.json())),
    };

    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a subscriber from [`TracingConfig::from_env`], ignoring the error
/// raised when one is already present. Intended for tests and examples.
pub fn init_from_env() {
    let _ = init_global_tracing(&TracingConfig::from_env());
}

/// Output format choices for the formatter layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

// ================================================================================================
// Field redaction
// ================================================================================================

#[derive(Clone)]
struct Redaction {
    fields: Arc<HashSet<String>>,
    replacement: Arc<String>,
}

impl Redaction {
    fn text(self) -> RedactingFields {
        RedactingFields {
            redaction: self,
            style: FieldStyle::Text,
        }
    }

    fn json(self) -> RedactingFields {
        RedactingFields {
            redaction: self,
            style: FieldStyle::Json,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldStyle {
    Text,
    Json,
}

/// Field formatter that swaps configured values for the replacement token.
#[derive(Clone)]
struct RedactingFields {
    redaction: Redaction,
    style: FieldStyle,
}

impl<'writer> FormatFields<'writer> for RedactingFields {
    fn format_fields<R>(&self, mut writer: Writer<'writer>, fields: R) -> fmt::Result
    where
        R: RecordFields,
    {
        let mut collector = FieldCollector {
            entries: Vec::new(),
            redaction: &self.redaction,
        };
        fields.record(&mut collector);

        match self.style {
            FieldStyle::Text => {
                for (index, (key, value)) in collector.entries.into_iter().enumerate() {
                    if index > 0 {
                        writer.write_char(' ')?;
                    }
                    let rendered = match value {
                        JsonValue::String(s) => format!("{s:?}"),
                        other => other.to_string(),
                    };
                    write!(writer, "{key}={rendered}")?;
                }
                Ok(())
            }
            FieldStyle::Json => {
                let object: JsonMap<String, JsonValue> = collector.entries.into_iter().collect();
                let serialized = serde_json::to_string(&JsonValue::Object(object)).map_err(|_| fmt::Error)?;
                writer.write_str(&serialized)
            }
        }
    }
}

struct FieldCollector<'a> {
    entries: Vec<(String, JsonValue)>,
    redaction: &'a Redaction,
}

impl FieldCollector<'_> {
    fn push(&mut self, field: &Field, value: JsonValue) {
        let value = if self.redaction.fields.contains(field.name()) {
            JsonValue::String(self.redaction.replacement.to_string())
        } else {
            value
        };
        self.entries.push((field.name().to_string(), value));
    }
}

impl Visit for FieldCollector<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, JsonValue::String(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, JsonValue::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, JsonValue::Number(value.into()));
    }

    fn record_i128(&mut self, field: &Field, value: i128) {
        self.push(field, JsonValue::String(value.to_string()));
    }

    fn record_u128(&mut self, field: &Field, value: u128) {
        self.push(field, JsonValue::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, JsonValue::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let json = JsonNumber::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(value.to_string()));
        self.push(field, json);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, JsonValue::String(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        self.push(field, JsonValue::String(value.to_string()));
    }
}
