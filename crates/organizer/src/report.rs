use crate::executor::OrganizationResult;
use crate::plan::OrganizationPlan;
use std::fmt::Write as _;
use std::path::Path;

/// Markdown dry-run report: what would move where, grouped by category.
#[must_use]
pub fn render_plan(plan: &OrganizationPlan) -> String {
    let mut md = String::new();
    md.push_str("# Organization plan (dry run)\n\n");
    let _ = writeln!(md, "- Output root: `{}`", plan.output_root.display());
    let _ = writeln!(md, "- Mode: `{}`", plan.mode.as_str());
    let _ = writeln!(md, "- Operations: `{}`", plan.operations.len());
    let _ = writeln!(md, "- Conflicts: `{}`", plan.conflicts.len());
    let _ = writeln!(md, "- Already in place: `{}`\n", plan.unchanged.len());

    for (category, ops) in plan.by_category() {
        let _ = writeln!(
            md,
            "## {} ({})\n",
            category.as_deref().unwrap_or("(uncategorized)"),
            ops.len()
        );
        md.push_str("| source | destination | confidence | note |\n");
        md.push_str("|---|---|---:|---|\n");
        for op in ops {
            let note = match (&op.collision, op.replace) {
                (Some(c), _) => format!("renamed, `{}` taken", file_name(&c.requested)),
                (None, true) => "replaces existing".to_string(),
                (None, false) => String::new(),
            };
            let _ = writeln!(
                md,
                "| `{}` | `{}` | `{:.2}` | {} |",
                escape_cell(&op.source.display().to_string()),
                escape_cell(&relative(&op.destination, &plan.output_root)),
                op.confidence,
                note
            );
        }
        md.push('\n');
    }
    md
}

/// One-paragraph summary of an execute, undo or redo.
#[must_use]
pub fn render_result(result: &OrganizationResult) -> String {
    let mut out = format!(
        "{} succeeded, {} failed, {} renamed on collision, {} skipped in {} ms",
        result.success_count,
        result.failure_count,
        result.collision_count,
        result.skipped_count,
        result.duration_ms
    );
    if result.cancelled {
        out.push_str(" (cancelled)");
    }
    for failure in &result.failures {
        let _ = write!(
            out,
            "\n  {} [{}{}]: {}",
            failure.source.display(),
            failure.kind.as_str(),
            if failure.retryable { ", retryable" } else { "" },
            failure.reason
        );
    }
    out
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn escape_cell(raw: &str) -> String {
    raw.replace('|', "\\|")
}
