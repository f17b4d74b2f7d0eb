//! In-memory diagnostic sink.

use clgrind_core::{Capabilities, Diagnostic, DiagnosticKind, Plugin};
use parking_lot::Mutex;

/// Keeps every surfaced diagnostic, in the order it was surfaced.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Number of collected diagnostics of `kind`.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.lock().iter().filter(|d| d.kind == kind).count()
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> Vec<Diagnostic> {
        self.diagnostics.lock().iter().filter(|d| d.kind == kind).cloned().collect()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn len(&self) -> usize {
        self.diagnostics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.lock().is_empty()
    }

    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }
}

impl Plugin for DiagnosticCollector {
    fn name(&self) -> &str {
        "collector"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOG
    }

    fn log(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}
