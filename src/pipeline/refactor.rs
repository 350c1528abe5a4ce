use crate::config::RefactorThresholds;
use crate::types::{FileMetrics, RefactorReason};

/// File-quality checks run on the implementation after VERIFY passes.
/// An empty result means no REFACTOR stage.
#[must_use]
pub fn refactor_reasons(metrics: &FileMetrics, thresholds: &RefactorThresholds) -> Vec<RefactorReason> {
    let mut reasons = Vec::new();

    if metrics.line_count > thresholds.hard_file_lines {
        reasons.push(RefactorReason::FileOverHardLimit {
            lines: metrics.line_count,
            limit: thresholds.hard_file_lines,
        });
    } else if metrics.line_count > thresholds.soft_file_lines {
        reasons.push(RefactorReason::FileOverSoftLimit {
            lines: metrics.line_count,
            limit: thresholds.soft_file_lines,
        });
    }

    reasons.extend(
        metrics
            .functions
            .iter()
            .filter(|(_, lines)| *lines > thresholds.max_function_lines)
            .map(|(name, lines)| RefactorReason::LongFunction {
                name: name.clone(),
                lines: *lines,
                limit: thresholds.max_function_lines,
            }),
    );
    reasons.extend(
        metrics
            .classes
            .iter()
            .filter(|(_, methods)| *methods > thresholds.max_class_methods)
            .map(|(name, methods)| RefactorReason::LargeClass {
                name: name.clone(),
                methods: *methods,
                limit: thresholds.max_class_methods,
            }),
    );

    reasons
}
