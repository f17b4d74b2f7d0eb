//! Structured diagnostics
//!
//! Everything the simulator or an analysis wants to tell the user travels as
//! a [`Diagnostic`] through [`crate::Context::log`], which deduplicates and
//! forwards it to logging-capable plugins.

use crate::error::{ErrorClass, SimError};
use crate::ir::{DebugLoc, InstructionRef};
use crate::launch::Size3;
use crate::plugin::{Capabilities, Plugin, PluginRegistry};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    InvalidAccess,
    UndefinedBehaviour,
    UninitializedValue,
    DataRace,
    Divergence,
    Execution,
}

impl DiagnosticKind {
    pub const fn name(self) -> &'static str {
        match self {
            DiagnosticKind::InvalidAccess => "invalid-access",
            DiagnosticKind::UndefinedBehaviour => "undefined-behaviour",
            DiagnosticKind::UninitializedValue => "uninitialized-value",
            DiagnosticKind::DataRace => "data-race",
            DiagnosticKind::Divergence => "divergence",
            DiagnosticKind::Execution => "execution",
        }
    }
}

impl From<ErrorClass> for DiagnosticKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::InvalidAccess => DiagnosticKind::InvalidAccess,
            ErrorClass::UndefinedBehaviour => DiagnosticKind::UndefinedBehaviour,
            ErrorClass::Divergence => DiagnosticKind::Divergence,
            ErrorClass::Execution => DiagnosticKind::Execution,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coordinates of the entity a diagnostic is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityCoords {
    WorkItem { global: Size3, local: Size3, group: Size3 },
    WorkGroup { group: Size3 },
}

impl fmt::Display for EntityCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityCoords::WorkItem { global, local, group } => {
                write!(f, "work-item global{global} local{local} group{group}")
            }
            EntityCoords::WorkGroup { group } => write!(f, "work-group {group}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub kernel: Option<String>,
    pub entity: Option<EntityCoords>,
    pub instruction: Option<InstructionRef>,
    pub debug_loc: Option<DebugLoc>,
    /// Other instructions involved (the second access of a race)
    pub related: Vec<InstructionRef>,
}

/// Identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiagnosticKey {
    kind: DiagnosticKind,
    instruction: Option<InstructionRef>,
    related: Vec<InstructionRef>,
    entity: Option<EntityCoords>,
}

impl Diagnostic {
    pub fn new(severity: Severity, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            kernel: None,
            entity: None,
            instruction: None,
            debug_loc: None,
            related: Vec::new(),
        }
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, message)
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, message)
    }

    /// Error diagnostic describing a fatal [`SimError`].
    pub fn from_error(err: &SimError) -> Self {
        Self::error(err.class().into(), err.to_string())
    }

    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = Some(kernel.into());
        self
    }

    pub fn with_entity(mut self, entity: EntityCoords) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn at(mut self, instruction: InstructionRef, debug_loc: Option<DebugLoc>) -> Self {
        self.instruction = Some(instruction);
        self.debug_loc = debug_loc;
        self
    }

    pub fn with_related(mut self, instruction: InstructionRef) -> Self {
        self.related.push(instruction);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn key(&self) -> DiagnosticKey {
        DiagnosticKey {
            kind: self.kind,
            instruction: self.instruction,
            related: self.related.clone(),
            entity: self.entity,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.severity, self.kind, self.message)?;
        if let Some(kernel) = &self.kernel {
            write!(f, "\n  kernel: {kernel}")?;
        }
        if let Some(entity) = &self.entity {
            write!(f, "\n  entity: {entity}")?;
        }
        match (&self.debug_loc, &self.instruction) {
            (Some(loc), _) => write!(f, "\n  at {loc}")?,
            (None, Some(inst)) => write!(f, "\n  at {inst}")?,
            _ => {}
        }
        for related in &self.related {
            write!(f, "\n  and {related}")?;
        }
        Ok(())
    }
}

// ================================================================================================
// Sink
// ================================================================================================

#[derive(Debug, Default)]
struct SinkState {
    seen: HashSet<DiagnosticKey>,
    surfaced: usize,
    suppressed: usize,
    errors: usize,
}

struct SinkInner {
    max_errors: usize,
    state: Mutex<SinkState>,
    error_seen: AtomicBool,
    active_kernel: Mutex<Option<String>>,
    loggers: RwLock<PluginRegistry>,
}

/// Shared handle to a context's diagnostic stream.
///
/// Cloning is cheap; every clone feeds the same deduplication table, error
/// cap and logging plugins. Analyses keep a clone so they can report from
/// inside hooks that carry no context.
#[derive(Clone)]
pub struct DiagnosticSink {
    inner: Arc<SinkInner>,
}

impl DiagnosticSink {
    /// Sink surfacing at most `max_errors` distinct diagnostics.
    pub fn new(max_errors: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                max_errors,
                state: Mutex::new(SinkState::default()),
                error_seen: AtomicBool::new(false),
                active_kernel: Mutex::new(None),
                loggers: RwLock::new(PluginRegistry::new()),
            }),
        }
    }

    /// Forward surfaced diagnostics to `plugin` if it declares `LOG`.
    pub(crate) fn attach(&self, plugin: &Arc<dyn Plugin>) {
        if plugin.capabilities().contains(Capabilities::LOG) {
            self.inner.loggers.write().register(Arc::clone(plugin));
        }
    }

    pub(crate) fn detach(&self, plugin: &Arc<dyn Plugin>) {
        self.inner.loggers.write().unregister(plugin);
    }

    pub(crate) fn set_active_kernel(&self, name: Option<&str>) {
        *self.inner.active_kernel.lock() = name.map(str::to_string);
    }

    /// Name of the kernel currently executing, if any.
    pub fn active_kernel(&self) -> Option<String> {
        self.inner.active_kernel.lock().clone()
    }

    /// Deduplicate `diagnostic`, apply the error cap, and hand it to the
    /// logging plugins.
    pub fn log(&self, mut diagnostic: Diagnostic) {
        if diagnostic.kernel.is_none() {
            diagnostic.kernel = self.active_kernel();
        }

        let surface = {
            let mut state = self.inner.state.lock();
            if !state.seen.insert(diagnostic.key()) {
                return;
            }
            if diagnostic.is_error() {
                state.errors += 1;
                self.inner.error_seen.store(true, Ordering::Release);
            }
            if state.surfaced >= self.inner.max_errors {
                state.suppressed += 1;
                false
            } else {
                state.surfaced += 1;
                true
            }
        };

        clgrind_tracing::performance::record_diagnostic(diagnostic.kind.name(), !surface);
        if surface {
            self.inner.loggers.read().log(&diagnostic);
        }
    }

    /// Distinct diagnostics surfaced to plugins.
    pub fn surfaced(&self) -> usize {
        self.inner.state.lock().surfaced
    }

    /// Distinct diagnostics withheld by the error cap.
    pub fn suppressed(&self) -> usize {
        self.inner.state.lock().suppressed
    }

    /// Distinct error-severity diagnostics, surfaced or not.
    pub fn errors(&self) -> usize {
        self.inner.state.lock().errors
    }

    pub fn error_seen(&self) -> bool {
        self.inner.error_seen.load(Ordering::Acquire)
    }

    /// Forget previously seen diagnostics and counters.
    pub fn reset(&self) {
        *self.inner.state.lock() = SinkState::default();
        self.inner.error_seen.store(false, Ordering::Release);
    }
}

impl fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DiagnosticSink")
            .field("surfaced", &state.surfaced)
            .field("suppressed", &state.suppressed)
            .field("errors", &state.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockId, FunctionId};

    #[test]
    fn test_from_error() {
        let diag = Diagnostic::from_error(&SimError::DivisionByZero);
        assert_eq!(diag.kind, DiagnosticKind::UndefinedBehaviour);
        assert!(diag.is_error());
    }

    #[test]
    fn test_key_ignores_message() {
        let at = InstructionRef::new(FunctionId(0), BlockId(0), 3);
        let a = Diagnostic::warning(DiagnosticKind::UninitializedValue, "one").at(at, None);
        let b = Diagnostic::warning(DiagnosticKind::UninitializedValue, "two").at(at, None);
        assert_eq!(a.key(), b.key());
        let c = b.with_entity(EntityCoords::WorkGroup { group: Size3::ONE });
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_display_mentions_location() {
        let diag = Diagnostic::error(DiagnosticKind::DataRace, "write-read race")
            .with_kernel("k")
            .at(
                InstructionRef::new(FunctionId(0), BlockId(1), 2),
                Some(DebugLoc::new("k.cl", 4, 9)),
            );
        let text = diag.to_string();
        assert!(text.contains("data-race"));
        assert!(text.contains("k.cl:4:9"));
    }

    #[test]
    fn test_sink_clones_share_state() {
        let sink = DiagnosticSink::new(8);
        let other = sink.clone();
        sink.set_active_kernel(Some("k"));
        other.log(Diagnostic::error(DiagnosticKind::DataRace, "race"));
        sink.log(Diagnostic::error(DiagnosticKind::DataRace, "race again"));
        assert_eq!(sink.surfaced(), 1);
        assert_eq!(sink.errors(), 1);
        assert!(sink.error_seen());
        assert_eq!(sink.active_kernel().as_deref(), Some("k"));
        other.reset();
        assert_eq!(sink.surfaced(), 0);
    }
}
