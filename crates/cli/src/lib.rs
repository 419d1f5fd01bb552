use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sift_engine::{Engine, EngineConfig, DEFAULT_ROOT_NAME};
use sift_organizer::{
    render_plan, render_result, CancellationFlag, OrganizationResult, OrganizeMode, Phase,
    Progress, ProgressCallback,
};
use sift_protocol::{serialize_json_pretty, FileId, ScannedFile};
use sift_scanner::{FileScanner, ScanOptions, ScanSummary};
use sift_vector_store::paths::state_dir_for_root;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod output;

use output::{
    category_views, error_envelope, pending_view, print_json, print_stdout, render_classify,
    render_pending, render_refine, render_scan, render_split, render_stats, render_tree,
    ScanOutput,
};

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Learns a folder taxonomy from your files and organizes them safely", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Print JSON on stdout (implies --quiet)
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: <root>/.sift/sift.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files sift would consider under a directory
    Scan(ScanArgs),

    /// Classify files into the learned taxonomy without touching them
    Classify(ScanArgs),

    /// Classify, plan and then move/copy/link files into category folders
    Organize(OrganizeArgs),

    /// Reverse the most recent organize batch
    Undo(HistoryArgs),

    /// Reapply the most recently undone batch
    Redo(HistoryArgs),

    /// List undoable batches for an output directory
    History(HistoryArgs),

    /// Tell sift where a file really belongs
    Feedback(FeedbackArgs),

    /// Show learning and taxonomy statistics
    Stats(RootArgs),

    /// Inspect and edit the taxonomy
    #[command(subcommand)]
    Taxonomy(TaxonomyCommand),
}

#[derive(Args)]
struct RootArgs {
    /// Directory whose files sift learns from
    #[arg(default_value = ".")]
    path: PathBuf,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    root: RootArgs,

    /// Include dot-files and dot-directories
    #[arg(long)]
    include_hidden: bool,

    /// Ignore .gitignore rules
    #[arg(long)]
    no_gitignore: bool,

    /// Do not descend more than this many directories
    #[arg(long)]
    max_depth: Option<usize>,
}

#[derive(Args)]
struct OrganizeArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Directory the category folders are created in
    #[arg(short, long)]
    output: PathBuf,

    /// Print the plan without touching any file
    #[arg(long)]
    dry_run: bool,

    /// move | copy | symlink (default from config)
    #[arg(long)]
    mode: Option<OrganizeMode>,
}

#[derive(Args)]
struct HistoryArgs {
    #[command(flatten)]
    root: RootArgs,

    /// Output directory of the organize run
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct FeedbackArgs {
    #[command(flatten)]
    root: RootArgs,

    /// File path (or file id) to correct
    #[arg(long)]
    file: String,

    /// Category path the file belongs in, e.g. "Finance/Invoices"
    #[arg(long)]
    category: String,
}

#[derive(Subcommand)]
enum TaxonomyCommand {
    /// Print the category tree
    Show(RootArgs),

    /// Rebuild the tree from themes found in the files
    Build(BuildArgs),

    /// Queue merge/split suggestions for over- or under-used categories
    Suggest(RootArgs),

    /// List suggestions awaiting approval
    Pending(RootArgs),

    /// Apply a queued merge
    #[command(name = "approve-merge")]
    ApproveMerge(SuggestionArgs),

    /// Apply a queued split
    #[command(name = "approve-split")]
    ApproveSplit(SuggestionArgs),

    /// Drop a queued merge
    #[command(name = "reject-merge")]
    RejectMerge(SuggestionArgs),

    /// Drop a queued split
    #[command(name = "reject-split")]
    RejectSplit(SuggestionArgs),

    /// Create a category (and any missing parents)
    Add(CategoryArgs),

    /// Rename the last segment of a category
    Rename(RenameArgs),

    /// Remove a category; its files move to the parent
    Remove(CategoryArgs),
}

#[derive(Args)]
struct BuildArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Number of top-level themes (0 = pick from the file count)
    #[arg(long, default_value_t = 0)]
    categories: usize,

    /// Name of the root category
    #[arg(long, default_value = DEFAULT_ROOT_NAME)]
    name: String,
}

#[derive(Args)]
struct SuggestionArgs {
    id: u64,

    #[command(flatten)]
    root: RootArgs,
}

#[derive(Args)]
struct CategoryArgs {
    /// Category path, e.g. "Finance/Invoices"
    category: String,

    #[command(flatten)]
    root: RootArgs,
}

#[derive(Args)]
struct RenameArgs {
    category: String,

    new_name: String,

    #[command(flatten)]
    root: RootArgs,
}

impl ScanArgs {
    fn options(&self) -> ScanOptions {
        ScanOptions {
            include_hidden: self.include_hidden,
            respect_gitignore: !self.no_gitignore,
            max_depth: self.max_depth,
            ..ScanOptions::default()
        }
    }

    fn scanner(&self) -> FileScanner {
        let root = &self.root.path;
        FileScanner::new(root)
            .with_options(self.options())
            .exclude(state_dir_for_root(root))
    }
}

struct Context {
    json: bool,
    quiet: bool,
    config: Option<PathBuf>,
}

impl Context {
    fn config_for(&self, root: &Path) -> Result<EngineConfig> {
        Ok(EngineConfig::load(self.config.as_deref(), Some(root))?)
    }

    async fn engine(&self, root: &Path) -> Result<Engine> {
        let config = self.config_for(root)?;
        Engine::open(root, config)
            .await
            .with_context(|| format!("Failed to open sift state under {}", root.display()))
    }

    fn emit<T: serde::Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            print_json(value)
        } else {
            print_stdout(&text(value))
        }
    }
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();
    if cli.json {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let ctx = Context {
        json: cli.json,
        quiet: cli.quiet,
        config: cli.config,
    };

    match run(&ctx, cli.command).await {
        Ok(()) => Ok(()),
        Err(err) if ctx.json => {
            log::debug!("{err:?}");
            print_stdout(&serialize_json_pretty(&error_envelope(&err))?)?;
            std::process::exit(1);
        }
        Err(err) => Err(err),
    }
}

async fn run(ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Scan(args) => run_scan(ctx, &args).await,
        Commands::Classify(args) => run_classify(ctx, &args).await,
        Commands::Organize(args) => run_organize(ctx, &args).await,
        Commands::Undo(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let result = engine.undo_last_operation(&args.output).await?;
            engine.save().await?;
            emit_result(ctx, &result)
        }
        Commands::Redo(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let result = engine.redo(&args.output).await?;
            engine.save().await?;
            emit_result(ctx, &result)
        }
        Commands::History(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let batches = engine.history(&args.output).await?;
            ctx.emit(&batches, |batches| {
                if batches.is_empty() {
                    return "Nothing to undo".to_string();
                }
                batches
                    .iter()
                    .map(|b| {
                        format!(
                            "{}  {}  {} operations",
                            b.batch_id,
                            b.started_at.format("%Y-%m-%d %H:%M:%S"),
                            b.operations
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Feedback(args) => run_feedback(ctx, &args).await,
        Commands::Stats(args) => {
            let engine = ctx.engine(&args.path).await?;
            let stats = engine.stats().await;
            ctx.emit(&stats, render_stats)
        }
        Commands::Taxonomy(command) => run_taxonomy(ctx, command).await,
    }
}

async fn scan(args: &ScanArgs) -> Result<(Vec<ScannedFile>, ScanSummary)> {
    let scanner = args.scanner();
    let root = args.root.path.clone();
    tokio::task::spawn_blocking(move || scanner.scan_with_summary())
        .await
        .context("scan task failed")?
        .with_context(|| format!("Failed to scan {}", root.display()))
}

async fn run_scan(ctx: &Context, args: &ScanArgs) -> Result<()> {
    let (files, summary) = scan(args).await?;
    let output = ScanOutput {
        root: args.root.path.display().to_string(),
        summary: &summary,
        files: files.iter().map(|f| f.url.display().to_string()).collect(),
    };
    ctx.emit(&output, render_scan)
}

async fn run_classify(ctx: &Context, args: &ScanArgs) -> Result<()> {
    let (files, _) = scan(args).await?;
    let engine = ctx.engine(&args.root.path).await?;
    let report = engine.classify_detailed(&files).await?;
    engine.save().await?;
    ctx.emit(&report, render_classify)
}

async fn run_organize(ctx: &Context, args: &OrganizeArgs) -> Result<()> {
    let root = &args.scan.root.path;
    let scanner = args.scan.scanner().exclude(&args.output);
    let (files, _) = tokio::task::spawn_blocking(move || scanner.scan_with_summary())
        .await
        .context("scan task failed")??;

    let mut config = ctx.config_for(root)?;
    if let Some(mode) = args.mode {
        config.organizer.mode = mode;
    }
    let engine = Engine::open(root, config).await?;
    let report = engine.classify_detailed(&files).await?;
    for failure in &report.failures {
        log::warn!("Not organizing {}: {}", failure.url.display(), failure.reason);
    }
    let plan = engine
        .plan_organization(&files, &report.assignments, &args.output)
        .await?;

    if args.dry_run {
        engine.save().await?;
        return ctx.emit(&plan, render_plan);
    }
    if plan.is_empty() {
        engine.save().await?;
        return ctx.emit(&plan, render_plan);
    }

    let cancel = CancellationFlag::new();
    let on_ctrl_c = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; finishing in-flight operations");
            on_ctrl_c.cancel();
        }
    });

    let bar = progress_bar(ctx, plan.operations.len() as u64);
    let callback: ProgressCallback = {
        let bar = bar.clone();
        Arc::new(move |progress: Progress| update_bar(&bar, &progress))
    };
    let outcome = engine.execute(&plan, Some(callback), &cancel).await;
    bar.finish_and_clear();
    signal.abort();

    let result = outcome?;
    engine.save().await?;
    emit_result(ctx, &result)
}

fn progress_bar(ctx: &Context, total: u64) -> ProgressBar {
    if ctx.quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("{bar:30} {pos}/{len} {wide_msg}") {
        bar.set_style(style);
    }
    bar
}

fn update_bar(bar: &ProgressBar, progress: &Progress) {
    bar.set_length(progress.total as u64);
    bar.set_position(progress.completed as u64);
    match progress.phase {
        Phase::Finished | Phase::Cancelled => bar.set_message(""),
        _ => bar.set_message(progress.current_file.display().to_string()),
    }
}

fn emit_result(ctx: &Context, result: &OrganizationResult) -> Result<()> {
    ctx.emit(result, render_result)
}

async fn run_feedback(ctx: &Context, args: &FeedbackArgs) -> Result<()> {
    let root = &args.root.path;
    let engine = ctx.engine(root).await?;
    let file_id = resolve_file_id(root, &args.file);
    let outcome = engine.record_feedback(&file_id, &args.category).await?;
    engine.save().await?;
    ctx.emit(&outcome, |o| {
        if o.was_correct {
            format!("Confirmed {}", o.category_path)
        } else {
            format!(
                "Moved to {} (was {})",
                o.category_path,
                o.previous_path.as_deref().unwrap_or("unsorted")
            )
        }
    })
}

/// File ids are the path seen at scan time under the canonical root. The file
/// may have been moved since, so a missing path is resolved against the root.
fn resolve_file_id(root: &Path, raw: &str) -> FileId {
    let candidate = Path::new(raw);
    if let Ok(path) = std::fs::canonicalize(candidate) {
        return ScannedFile::from_path(path).file_id();
    }
    if candidate.is_absolute() {
        return FileId::new(raw);
    }
    match std::fs::canonicalize(root) {
        Ok(root) => ScannedFile::from_path(root.join(candidate)).file_id(),
        Err(_) => FileId::new(raw),
    }
}

async fn run_taxonomy(ctx: &Context, command: TaxonomyCommand) -> Result<()> {
    match command {
        TaxonomyCommand::Show(args) => {
            let engine = ctx.engine(&args.path).await?;
            let tree = engine.taxonomy().await;
            if ctx.json {
                print_json(&category_views(&tree))
            } else {
                print_stdout(&render_tree(&tree))
            }
        }
        TaxonomyCommand::Build(args) => {
            let (files, _) = scan(&args.scan).await?;
            let engine = ctx.engine(&args.scan.root.path).await?;
            let tree = engine
                .build_taxonomy(&files, args.categories, &args.name)
                .await?;
            engine.save().await?;
            if ctx.json {
                print_json(&category_views(&tree))
            } else {
                print_stdout(&render_tree(&tree))
            }
        }
        TaxonomyCommand::Suggest(args) => {
            let engine = ctx.engine(&args.path).await?;
            let report = engine.suggest_refinements().await?;
            engine.save().await?;
            ctx.emit(&report, render_refine)
        }
        TaxonomyCommand::Pending(args) => {
            let engine = ctx.engine(&args.path).await?;
            let tree = engine.taxonomy().await;
            let view = pending_view(
                &tree,
                &engine.pending_merges().await,
                &engine.pending_splits().await,
            );
            ctx.emit(&view, render_pending)
        }
        TaxonomyCommand::ApproveMerge(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let report = engine.approve_merge(args.id).await?;
            engine.save().await?;
            ctx.emit(&report, |r| {
                format!(
                    "Merged {} categories; {} files moved",
                    r.removed_nodes.len(),
                    r.moved_files
                )
            })
        }
        TaxonomyCommand::ApproveSplit(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let report = engine.approve_split(args.id).await?;
            engine.save().await?;
            ctx.emit(&report, render_split)
        }
        TaxonomyCommand::RejectMerge(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            engine.reject_merge(args.id).await?;
            engine.save().await?;
            ctx.emit(&args.id, |id| format!("Rejected merge #{id}"))
        }
        TaxonomyCommand::RejectSplit(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            engine.reject_split(args.id).await?;
            engine.save().await?;
            ctx.emit(&args.id, |id| format!("Rejected split #{id}"))
        }
        TaxonomyCommand::Add(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            engine.add_category(&args.category).await?;
            engine.save().await?;
            ctx.emit(&args.category, |path| format!("Added {path}"))
        }
        TaxonomyCommand::Rename(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let renamed = engine
                .rename_category(&args.category, &args.new_name)
                .await?;
            engine.save().await?;
            ctx.emit(&renamed, |path| format!("Renamed to {path}"))
        }
        TaxonomyCommand::Remove(args) => {
            let engine = ctx.engine(&args.root.path).await?;
            let report = engine.remove_category(&args.category).await?;
            engine.save().await?;
            ctx.emit(&report, |r| {
                format!("Removed {}; {} files moved up", args.category, r.moved_files)
            })
        }
    }
}
