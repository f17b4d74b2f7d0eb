//! Diagnostic logging through `tracing`.

use clgrind_core::{Capabilities, Diagnostic, Plugin, Severity};

/// Emits every surfaced diagnostic as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct Logger;

impl Logger {
    pub fn new() -> Self {
        Self
    }
}

fn location(diagnostic: &Diagnostic) -> String {
    match (&diagnostic.debug_loc, &diagnostic.instruction) {
        (Some(loc), _) => loc.to_string(),
        (None, Some(at)) => at.to_string(),
        (None, None) => String::new(),
    }
}

impl Plugin for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOG
    }

    fn log(&self, diagnostic: &Diagnostic) {
        let kind = diagnostic.kind.name();
        let kernel = diagnostic.kernel.as_deref().unwrap_or("");
        let entity = diagnostic.entity.map(|e| e.to_string()).unwrap_or_default();
        let location = location(diagnostic);
        match diagnostic.severity {
            Severity::Error => {
                tracing::error!(kind, kernel, entity = %entity, location = %location, "{}", diagnostic.message)
            }
            Severity::Warning => {
                tracing::warn!(kind, kernel, entity = %entity, location = %location, "{}", diagnostic.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clgrind_core::ir::{BlockId, FunctionId, InstructionRef};
    use clgrind_core::DiagnosticKind;

    #[test]
    fn test_location_prefers_debug_info() {
        let at = InstructionRef::new(FunctionId(0), BlockId(1), 2);
        let diagnostic = Diagnostic::error(DiagnosticKind::DataRace, "race").at(at, None);
        assert_eq!(location(&diagnostic), at.to_string());
        assert_eq!(location(&Diagnostic::warning(DiagnosticKind::DataRace, "race")), "");
    }

    #[test]
    fn test_log_does_not_panic_without_subscriber() {
        Logger::new().log(&Diagnostic::warning(DiagnosticKind::UninitializedValue, "poisoned"));
    }
}
