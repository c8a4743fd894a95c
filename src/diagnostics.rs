// ABOUTME: Diagnostics accumulator for non-fatal warnings during a run.
// ABOUTME: Collects warnings that shouldn't fail a deployment but should be shown to users.

/// Collects non-fatal warnings during deployment operations.
#[derive(Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Check if any warnings were collected.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A non-fatal warning collected during a run.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// Create a report-write warning.
    pub fn report_write(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::ReportWrite,
            message: message.into(),
        }
    }

    /// Create a notification warning.
    pub fn notification(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Notification,
            message: message.into(),
        }
    }
}

/// Categories of warnings that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Failed to persist the run record or incident report.
    ReportWrite,
    /// Failed to deliver the outcome notification.
    Notification,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_warnings_in_order() {
        let mut diagnostics = Diagnostics::default();
        assert!(!diagnostics.has_warnings());

        diagnostics.warn(Warning::report_write("disk full"));
        diagnostics.warn(Warning::notification("webhook 500"));

        assert!(diagnostics.has_warnings());
        assert_eq!(diagnostics.warnings().len(), 2);
        assert_eq!(diagnostics.warnings()[0].kind, WarningKind::ReportWrite);
    }
}
