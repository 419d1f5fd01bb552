use anyhow::Result;
use serde::Serialize;
use sift_engine::{ClassifyReport, EngineError, EngineStats, RefineReport, SplitReport};
use sift_protocol::{serialize_json_pretty, ErrorEnvelope, NodeId};
use sift_scanner::ScanSummary;
use sift_taxonomy::{MergeSuggestion, SplitSuggestion, TaxonomyTree};
use std::fmt::Write as _;
use std::io::{self, Write};

pub fn print_stdout(text: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    print_stdout(&serialize_json_pretty(value)?)
}

/// Machine-readable form of a failed command.
pub fn error_envelope(err: &anyhow::Error) -> ErrorEnvelope {
    let Some(engine_err) = err.downcast_ref::<EngineError>() else {
        return ErrorEnvelope::new("internal", format!("{err:#}"));
    };
    let envelope = ErrorEnvelope::new(engine_err.code(), format!("{err:#}"));
    match engine_err.code() {
        "nothing_to_undo" => envelope.with_hint("run `sift organize` first"),
        "nothing_to_redo" => envelope.with_hint("only undone batches can be redone"),
        "busy" => envelope.with_hint("another sift process is organizing this output root"),
        "suggestion_not_found" => envelope.with_hint("list open suggestions with `sift taxonomy pending`"),
        "dimension_mismatch" => envelope.with_hint("state was written with another embedding dimension"),
        _ => envelope,
    }
}

#[derive(Debug, Serialize)]
pub struct ScanOutput<'a> {
    pub root: String,
    pub summary: &'a ScanSummary,
    pub files: Vec<String>,
}

pub fn render_scan(output: &ScanOutput<'_>) -> String {
    let mut out = String::new();
    for file in &output.files {
        let _ = writeln!(out, "{file}");
    }
    let s = output.summary;
    let _ = write!(
        out,
        "{} files under {} ({} too large, {} noise, {} errors)",
        s.files, output.root, s.skipped_large, s.skipped_noise, s.errors
    );
    out
}

pub fn render_classify(report: &ClassifyReport) -> String {
    let mut out = String::new();
    for decision in &report.decisions {
        let outcome = decision.outcome.map_or("memory", |o| o.as_str());
        let _ = writeln!(
            out,
            "{:>5.2}  {:<13}  {}  ->  {}",
            decision.confidence, outcome, decision.file_id, decision.category_path
        );
    }
    for failure in &report.failures {
        let _ = writeln!(out, "  !!   {}: {}", failure.url.display(), failure.reason);
    }
    let _ = write!(
        out,
        "{} placed ({} remembered, {} grouped into themes), {} failed in {}ms",
        report.assignments.len(),
        report.memory_hits,
        report.clustered,
        report.failures.len(),
        report.duration_ms
    );
    out
}

#[derive(Debug, Serialize)]
pub struct CategoryView {
    pub path: String,
    pub files: usize,
    pub user_edited: bool,
}

pub fn category_views(tree: &TaxonomyTree) -> Vec<CategoryView> {
    tree.categories()
        .into_iter()
        .map(|(id, path)| CategoryView {
            path,
            files: tree.files_in(id).len(),
            user_edited: !tree.can_auto_modify(id),
        })
        .collect()
}

pub fn render_tree(tree: &TaxonomyTree) -> String {
    let mut out = String::new();
    let root = tree.root();
    let _ = writeln!(
        out,
        "{} ({} unsorted)",
        tree.root_name(),
        tree.files_in(root).len()
    );
    if let Some(node) = tree.node(root) {
        for child in &node.children {
            render_node(tree, *child, 1, &mut out);
        }
    }
    let stats = tree.statistics();
    let _ = write!(
        out,
        "{} categories, {} files, depth {}",
        stats.category_count, stats.total_files, stats.max_depth
    );
    out
}

fn render_node(tree: &TaxonomyTree, id: NodeId, depth: usize, out: &mut String) {
    let Some(node) = tree.node(id) else {
        return;
    };
    let marker = if node.is_user_edited() { " *" } else { "" };
    let _ = writeln!(
        out,
        "{}{} [{}]{marker}",
        "  ".repeat(depth),
        node.name,
        tree.subtree_file_count(id)
    );
    for child in &node.children {
        render_node(tree, *child, depth + 1, out);
    }
}

pub fn render_stats(stats: &EngineStats) -> String {
    let scorer = &stats.scorer;
    let counts = &scorer.outcome_counts;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "taxonomy:    {} categories, {} files ({} unsorted), depth {}",
        stats.taxonomy.category_count,
        stats.taxonomy.total_files,
        stats.taxonomy.root_files,
        stats.taxonomy.max_depth
    );
    let _ = writeln!(
        out,
        "learning:    {} prototypes, {} patterns, {} queued updates",
        stats.prototypes, stats.patterns, stats.pending_updates
    );
    let _ = writeln!(
        out,
        "decisions:   {} auto-place, {} review, {} deep-analysis",
        counts.auto_place, counts.review, counts.deep_analysis
    );
    let _ = writeln!(
        out,
        "precision:   {:.2} overall ({} of {}), {:.2} auto-place ({} of {})",
        scorer.overall_precision,
        scorer.correct,
        scorer.total,
        scorer.auto_place_precision,
        scorer.auto_place_correct,
        scorer.auto_place_total
    );
    let _ = write!(
        out,
        "suggestions: {} merges, {} splits pending",
        stats.pending_merges, stats.pending_splits
    );
    out
}

#[derive(Debug, Serialize)]
pub struct PendingView {
    pub merges: Vec<MergeView>,
    pub splits: Vec<SplitView>,
}

#[derive(Debug, Serialize)]
pub struct MergeView {
    pub id: u64,
    pub sources: Vec<String>,
    pub target: String,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct SplitView {
    pub id: u64,
    pub category: String,
    pub subcategories: Vec<String>,
    pub confidence: f32,
    pub reason: String,
}

fn display_path(tree: &TaxonomyTree, id: NodeId) -> String {
    tree.path_of(id).unwrap_or_else(|_| id.to_string())
}

pub fn pending_view(
    tree: &TaxonomyTree,
    merges: &[MergeSuggestion],
    splits: &[SplitSuggestion],
) -> PendingView {
    PendingView {
        merges: merges
            .iter()
            .map(|m| MergeView {
                id: m.id,
                sources: m.sources.iter().map(|s| display_path(tree, *s)).collect(),
                target: display_path(tree, m.target),
                confidence: m.confidence,
                reason: m.reason.clone(),
            })
            .collect(),
        splits: splits
            .iter()
            .map(|s| SplitView {
                id: s.id,
                category: display_path(tree, s.node),
                subcategories: s.proposed_subcategories.clone(),
                confidence: s.confidence,
                reason: s.reason.clone(),
            })
            .collect(),
    }
}

pub fn render_pending(view: &PendingView) -> String {
    if view.merges.is_empty() && view.splits.is_empty() {
        return "No pending suggestions".to_string();
    }
    let mut out = String::new();
    for merge in &view.merges {
        let _ = writeln!(
            out,
            "merge #{}: {} -> {} ({:.2}) {}",
            merge.id,
            merge.sources.join(", "),
            merge.target,
            merge.confidence,
            merge.reason
        );
    }
    for split in &view.splits {
        let _ = writeln!(
            out,
            "split #{}: {} -> {} ({:.2}) {}",
            split.id,
            split.category,
            split.subcategories.join(", "),
            split.confidence,
            split.reason
        );
    }
    out.trim_end().to_string()
}

pub fn render_refine(report: &RefineReport) -> String {
    format!(
        "Queued {} merge and {} split suggestions",
        report.merges.len(),
        report.splits.len()
    )
}

pub fn render_split(report: &SplitReport) -> String {
    format!(
        "Created {}; {} files moved, {} kept",
        report.created_paths.join(", "),
        report.reassigned,
        report.kept
    )
}
