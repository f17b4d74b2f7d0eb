//! Plugin selection
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `CLGRIND_DATA_RACES` | enable the race detector |
//! | `CLGRIND_UNINITIALIZED` | enable uninitialized-value tracking |
//! | `CLGRIND_INST_COUNTS` | enable the instruction counter |
//! | `CLGRIND_CHECK_API` | enable buffer access checks (default on) |
//! | `CLGRIND_LOG` | log diagnostics through `tracing` (default on) |
//! | `CLGRIND_UNIFORM_WRITES` | `1` reports same-value write-write races |

use crate::{DiagnosticCollector, InstructionCounter, Logger, MemCheck, RaceDetector, Uninitialized};
use clgrind_core::{Context, Plugin};
use clgrind_tracing::parse_flag;
use std::sync::Arc;

pub const ENV_DATA_RACES: &str = "CLGRIND_DATA_RACES";
pub const ENV_UNINITIALIZED: &str = "CLGRIND_UNINITIALIZED";
pub const ENV_INST_COUNTS: &str = "CLGRIND_INST_COUNTS";
pub const ENV_CHECK_API: &str = "CLGRIND_CHECK_API";
pub const ENV_LOG: &str = "CLGRIND_LOG";
pub const ENV_UNIFORM_WRITES: &str = "CLGRIND_UNIFORM_WRITES";

/// Which analyses to attach to a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub data_races: bool,
    pub uninitialized: bool,
    pub instruction_counts: bool,
    pub mem_check: bool,
    pub log_diagnostics: bool,
    /// Two work-items writing the same value to a byte do not race
    pub uniform_writes_safe: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            data_races: false,
            uninitialized: false,
            instruction_counts: false,
            mem_check: true,
            log_diagnostics: true,
            uniform_writes_safe: true,
        }
    }
}

/// Handles to the plugins registered by [`PluginConfig::install`].
#[derive(Debug, Default, Clone)]
pub struct InstalledPlugins {
    pub mem_check: Option<Arc<MemCheck>>,
    pub uninitialized: Option<Arc<Uninitialized>>,
    pub race_detector: Option<Arc<RaceDetector>>,
    pub instruction_counter: Option<Arc<InstructionCounter>>,
    pub logger: Option<Arc<Logger>>,
}

impl InstalledPlugins {
    pub fn len(&self) -> usize {
        [
            self.mem_check.is_some(),
            self.uninitialized.is_some(),
            self.race_detector.is_some(),
            self.instruction_counter.is_some(),
            self.logger.is_some(),
        ]
        .into_iter()
        .filter(|on| *on)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn add<P: Plugin + 'static>(context: &mut Context, plugin: P) -> Arc<P> {
    let plugin = Arc::new(plugin);
    context.add_plugin(plugin.clone());
    plugin
}

impl PluginConfig {
    /// Every analysis enabled.
    pub fn all() -> Self {
        Self {
            data_races: true,
            uninitialized: true,
            instruction_counts: true,
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let flag = |name: &str| std::env::var(name).ok().map(|v| parse_flag(&v));

        if let Some(on) = flag(ENV_DATA_RACES) {
            config.data_races = on;
        }
        if let Some(on) = flag(ENV_UNINITIALIZED) {
            config.uninitialized = on;
        }
        if let Some(on) = flag(ENV_INST_COUNTS) {
            config.instruction_counts = on;
        }
        if let Some(on) = flag(ENV_CHECK_API) {
            config.mem_check = on;
        }
        if let Some(on) = flag(ENV_LOG) {
            config.log_diagnostics = on;
        }
        if let Some(report) = flag(ENV_UNIFORM_WRITES) {
            config.uniform_writes_safe = !report;
        }

        config
    }

    /// Register the selected plugins with `context`, in a fixed order.
    pub fn install(&self, context: &mut Context) -> InstalledPlugins {
        let sink = context.diagnostics().clone();
        let mut installed = InstalledPlugins::default();

        if self.mem_check {
            installed.mem_check = Some(add(context, MemCheck::new(sink.clone())));
        }
        if self.uninitialized {
            installed.uninitialized = Some(add(context, Uninitialized::new(sink.clone())));
        }
        if self.data_races {
            installed.race_detector = Some(add(context, RaceDetector::new(sink, self.uniform_writes_safe)));
        }
        if self.instruction_counts {
            installed.instruction_counter = Some(add(context, InstructionCounter::new()));
        }
        if self.log_diagnostics {
            installed.logger = Some(add(context, Logger::new()));
        }

        tracing::debug!(plugins = installed.len(), config = ?self, "plugins_installed");
        installed
    }

    /// Install the selected plugins plus a [`DiagnosticCollector`].
    pub fn install_with_collector(&self, context: &mut Context) -> (InstalledPlugins, Arc<DiagnosticCollector>) {
        let installed = self.install(context);
        let collector = add(context, DiagnosticCollector::new());
        (installed, collector)
    }
}
