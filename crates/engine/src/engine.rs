//! The exposed engine: classification, taxonomy construction and governance,
//! and reversible organization on top of the sift component crates.
//!
//! Lock order, outermost first: gatekeeper, taxonomy, prototypes, patterns,
//! scorer. No method holds a later lock while acquiring an earlier one.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::queue::{PrototypeUpdate, UpdateQueue};
use crate::refiner::{RefineReport, TaxonomyRefiner};
use crate::store::{JsonFileStore, MemoryStore, Store, Table, WriteOp};
use crate::types::{
    ClassifyDecision, ClassifyFailure, ClassifyReport, EngineStats, FeedbackOutcome,
    ProcessingRecord, SplitReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_classifier::{
    keyword_tokens, suggested_k, theme_name, ClusterNode, Clusterer, ClusteringConfig,
    ConfidenceScorer, FileKind, Outcome, ScoredCategory, ScorerStats, ScoringInput,
    SemanticTheme, ThemeClustering, ThemeItem,
};
use sift_organizer::{
    BatchSummary, CancellationFlag, OrganizationPlan, OrganizationResult, ProgressCallback,
    SafeFileOrganizer,
};
use sift_protocol::{AssignmentSource, FileAssignment, FileId, NodeId, ScannedFile};
use sift_taxonomy::{
    parse_category_path, DepthPolicy, EditOrigin, MergeReport, MergeSplitGatekeeper,
    MergeSuggestion, SharedTaxonomy, SplitSuggestion, TaxonomyError, TaxonomyTree,
};
use sift_vector_store::paths::{state_dir_for_root, taxonomy_path_for_root};
use sift_vector_store::{
    category_path_key, content_checksum, current_unix_ms, ensure_dimension, normalized,
    read_versioned_json, write_versioned_json, CategoryPrototype, Embedder, HashEmbedder,
    LearnedPattern, PatternMemory, PrototypeMatch, PrototypeStore, VectorStoreError,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

pub const DEFAULT_ROOT_NAME: &str = "Root";
const ENGINE_STATE_FILE_NAME: &str = "engine.json";
const ENGINE_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedEngineState {
    scorer_stats: ScorerStats,
    gatekeeper: MergeSplitGatekeeper,
}

/// Owned inputs for one theme-clustering run on the blocking pool.
struct ThemeEntry {
    filename: String,
    extension: Option<String>,
    embedding: Vec<f32>,
}

fn theme_items(entries: &[ThemeEntry]) -> Vec<ThemeItem<'_>> {
    entries
        .iter()
        .map(|entry| ThemeItem {
            filename: &entry.filename,
            extension: entry.extension.as_deref(),
            embedding: &entry.embedding,
        })
        .collect()
}

/// A category decision waiting to be written into the tree.
struct Placement {
    index: usize,
    category_path: String,
    confidence: f32,
    source: AssignmentSource,
    outcome: Option<Outcome>,
    needs_deep_analysis: bool,
    clustered: bool,
    explanation: String,
}

type Embedded = std::result::Result<Vec<f32>, String>;

pub struct Engine {
    config: EngineConfig,
    root: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Store>,
    prototypes: Arc<RwLock<PrototypeStore>>,
    patterns: Mutex<PatternMemory>,
    scorer: Arc<RwLock<ConfidenceScorer>>,
    clusterer: Clusterer,
    refiner: TaxonomyRefiner,
    taxonomy: SharedTaxonomy,
    gatekeeper: Mutex<MergeSplitGatekeeper>,
    updates: UpdateQueue,
    organizers: Mutex<HashMap<PathBuf, Arc<SafeFileOrganizer>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("embedder", &self.embedder.model_id())
            .field("dimension", &self.config.embedding.dimension)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Volatile engine with the hashing embedder and an in-memory store.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let embedder = Arc::new(HashEmbedder::new(config.embedding.dimension));
        Self::with_parts(config, embedder, Arc::new(MemoryStore::new()), None)
    }

    pub fn with_parts(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn Store>,
        root: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let dimension = config.embedding.dimension;
        if embedder.dimension() != dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: dimension,
                actual: embedder.dimension(),
            }
            .into());
        }
        let prototypes = PrototypeStore::new(dimension, config.prototypes.ema_alpha)?;
        let scorer = ConfidenceScorer::new(config.confidence_config()?)?;
        let clusterer = Clusterer::new(config.clustering.clone())?;
        let refiner = TaxonomyRefiner::new(config.refiner.clone())?;
        let tree = TaxonomyTree::with_policy(DEFAULT_ROOT_NAME, config.taxonomy.clone())?;
        Ok(Self {
            root,
            embedder,
            store,
            prototypes: Arc::new(RwLock::new(prototypes)),
            patterns: Mutex::new(PatternMemory::new(dimension)),
            scorer: Arc::new(RwLock::new(scorer)),
            clusterer,
            refiner,
            taxonomy: SharedTaxonomy::new(tree),
            gatekeeper: Mutex::new(MergeSplitGatekeeper::new()),
            updates: UpdateQueue::new(),
            organizers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Engine whose state lives in `<root>/.sift/`, reloaded from disk.
    pub async fn open(root: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let root = root.into();
        let store = JsonFileStore::open(state_dir_for_root(&root)).await?;
        let embedder = Arc::new(HashEmbedder::new(config.embedding.dimension));
        let engine = Self::with_parts(config, embedder, Arc::new(store), Some(root))?;
        engine.load().await?;
        Ok(engine)
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    #[must_use]
    pub const fn shared_taxonomy(&self) -> &SharedTaxonomy {
        &self.taxonomy
    }

    /// Copy of the current tree.
    pub async fn taxonomy(&self) -> TaxonomyTree {
        self.taxonomy.snapshot().await
    }

    // ---- persistence -------------------------------------------------------

    /// Restores prototypes, patterns, the tree and engine state. Unreadable
    /// rows are skipped with a warning.
    pub async fn load(&self) -> Result<()> {
        let prototype_rows = self.store.scan(Table::Prototypes).await?;
        let pattern_rows = self.store.scan(Table::Patterns).await?;

        let tree = match &self.root {
            Some(root) => {
                let path = taxonomy_path_for_root(root);
                if path.exists() {
                    let mut tree = TaxonomyTree::load(&path).await?;
                    tree.set_policy(self.config.taxonomy.clone())?;
                    Some(tree)
                } else {
                    None
                }
            }
            None => None,
        };
        let state = match &self.root {
            Some(root) => {
                let path = state_dir_for_root(root).join(ENGINE_STATE_FILE_NAME);
                if path.exists() {
                    Some(
                        read_versioned_json::<PersistedEngineState>(
                            &path,
                            "engine state",
                            ENGINE_STATE_SCHEMA_VERSION,
                        )
                        .await?,
                    )
                } else {
                    None
                }
            }
            None => None,
        };

        let mut gatekeeper = self.gatekeeper.lock().await;
        if let Some(tree) = &tree {
            self.taxonomy.replace(tree.clone()).await;
        }
        let current = self.taxonomy.snapshot().await;
        if let Some(state) = &state {
            *gatekeeper = state.gatekeeper.clone();
        }
        let pruned = gatekeeper.prune_stale(&current);
        if pruned > 0 {
            log::warn!("Dropped {pruned} suggestions referencing missing categories");
        }
        drop(gatekeeper);

        let mut restored_prototypes = 0usize;
        {
            let mut prototypes = self.prototypes.write().await;
            for (key, row) in prototype_rows {
                let restored = serde_json::from_value::<CategoryPrototype>(row)
                    .map_err(EngineError::from)
                    .and_then(|p| prototypes.insert(p).map_err(EngineError::from));
                match restored {
                    Ok(()) => restored_prototypes += 1,
                    Err(err) => log::warn!("Skipping prototype row {key}: {err}"),
                }
            }
        }
        let mut restored_patterns = 0usize;
        {
            let mut patterns = self.patterns.lock().await;
            for (key, row) in pattern_rows {
                let restored = serde_json::from_value::<LearnedPattern>(row)
                    .map_err(EngineError::from)
                    .and_then(|p| patterns.insert(p).map_err(EngineError::from));
                match restored {
                    Ok(()) => restored_patterns += 1,
                    Err(err) => log::warn!("Skipping pattern row {key}: {err}"),
                }
            }
        }
        {
            let mut scorer = self.scorer.write().await;
            if let Some(state) = state {
                scorer.restore_stats(state.scorer_stats);
            }
            for assignment in current.assignments() {
                let Some(ext) = extension_of(&assignment.filename) else {
                    continue;
                };
                if let Ok(path) = current.path_of(assignment.category_id) {
                    if !path.is_empty() {
                        scorer.observe_extension(&path, &ext);
                    }
                }
            }
        }
        log::info!(
            "Loaded {restored_prototypes} prototypes, {restored_patterns} patterns, {} categories",
            current.categories().len()
        );
        Ok(())
    }

    /// Writes prototypes and patterns in one store transaction, then the tree
    /// and engine state when the engine has a root.
    pub async fn save(&self) -> Result<()> {
        let stored_prototypes: BTreeSet<String> = self
            .store
            .scan(Table::Prototypes)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let stored_patterns: BTreeSet<String> = self
            .store
            .scan(Table::Patterns)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let prototype_rows: Vec<(String, Value)> = {
            let prototypes = self.prototypes.read().await;
            prototypes
                .iter()
                .map(|p| Ok((category_path_key(&p.category_path), serde_json::to_value(p)?)))
                .collect::<Result<_>>()?
        };
        let pattern_rows: Vec<(String, Value)> = {
            let patterns = self.patterns.lock().await;
            patterns
                .iter()
                .map(|p| Ok((p.checksum.clone(), serde_json::to_value(p)?)))
                .collect::<Result<_>>()?
        };

        let live_prototypes: HashSet<&str> = prototype_rows.iter().map(|(k, _)| k.as_str()).collect();
        let live_patterns: HashSet<&str> = pattern_rows.iter().map(|(k, _)| k.as_str()).collect();
        // Deletes first: a prototype delete cascades to its patterns, which
        // the puts below then restore if they are still live.
        let mut ops: Vec<WriteOp> = stored_prototypes
            .iter()
            .filter(|key| !live_prototypes.contains(key.as_str()))
            .map(|key| WriteOp::delete(Table::Prototypes, key.clone()))
            .chain(
                stored_patterns
                    .iter()
                    .filter(|key| !live_patterns.contains(key.as_str()))
                    .map(|key| WriteOp::delete(Table::Patterns, key.clone())),
            )
            .collect();
        let (prototype_count, pattern_count) = (prototype_rows.len(), pattern_rows.len());
        ops.extend(
            prototype_rows
                .into_iter()
                .map(|(key, value)| WriteOp::put(Table::Prototypes, key, value)),
        );
        ops.extend(
            pattern_rows
                .into_iter()
                .map(|(key, value)| WriteOp::put(Table::Patterns, key, value)),
        );
        self.store.transaction(ops).await?;

        if let Some(root) = &self.root {
            let tree = self.taxonomy.snapshot().await;
            tree.save(taxonomy_path_for_root(root)).await?;
            let state = PersistedEngineState {
                scorer_stats: self.scorer.read().await.stats(),
                gatekeeper: self.gatekeeper.lock().await.clone(),
            };
            write_versioned_json(
                &state_dir_for_root(root).join(ENGINE_STATE_FILE_NAME),
                ENGINE_STATE_SCHEMA_VERSION,
                &state,
            )
            .await?;
        }
        log::info!("Saved {prototype_count} prototypes and {pattern_count} patterns");
        Ok(())
    }

    // ---- classification ----------------------------------------------------

    pub async fn classify(&self, files: &[ScannedFile]) -> Result<Vec<FileAssignment>> {
        Ok(self.classify_detailed(files).await?.assignments)
    }

    /// Places every file it can and reports the rest; one bad file never
    /// fails the batch.
    ///
    /// Learned patterns are consulted first, then prototypes are scored with
    /// bounded concurrency. Files no prototype claims with enough confidence
    /// are grouped into semantic themes and placed under the theme names.
    pub async fn classify_detailed(&self, files: &[ScannedFile]) -> Result<ClassifyReport> {
        let started = Instant::now();
        let mut report = ClassifyReport::default();
        if files.is_empty() {
            return Ok(report);
        }
        log::info!("Classifying {} files", files.len());

        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(files.len());
        for (file, embedded) in files.iter().zip(self.embed_texts(&names).await) {
            match embedded {
                Ok(vector) => embeddings.push(Some(vector)),
                Err(reason) => {
                    report.failures.push(failure_for(file, reason));
                    embeddings.push(None);
                }
            }
        }
        let checksums = self.checksums(files).await;

        let review_threshold = self.scorer.read().await.config().review_threshold;
        let mut placements: Vec<Placement> = Vec::new();
        let mut to_score = Vec::new();
        {
            let mut patterns = self.patterns.lock().await;
            for (index, file) in files.iter().enumerate() {
                if embeddings[index].is_none() {
                    continue;
                }
                let hit = checksums[index]
                    .as_deref()
                    .and_then(|checksum| patterns.lookup(checksum, review_threshold));
                match hit {
                    Some(pattern) => placements.push(Placement {
                        index,
                        explanation: format!(
                            "'{}' -> {}: learned pattern (seen {} times)",
                            file.filename, pattern.label, pattern.hit_count
                        ),
                        category_path: pattern.label,
                        confidence: pattern.confidence,
                        source: AssignmentSource::Memory,
                        outcome: None,
                        needs_deep_analysis: false,
                        clustered: false,
                    }),
                    None => to_score.push(index),
                }
            }
        }
        report.memory_hits = placements.len();

        let mut outcomes = Vec::new();
        let mut leftovers: Vec<(usize, String)> = Vec::new();
        let mut leftover_entries = Vec::new();
        for (index, scored) in self.score_all(files, &embeddings, &to_score).await? {
            let file = &files[index];
            let scored = match scored {
                Ok(scored) => scored,
                Err(reason) => {
                    report.failures.push(failure_for(file, reason));
                    continue;
                }
            };
            outcomes.push(scored.outcome);
            match (scored.outcome, scored.category_path) {
                (Outcome::AutoPlace | Outcome::Review, Some(path)) => placements.push(Placement {
                    index,
                    category_path: path,
                    confidence: scored.confidence,
                    source: AssignmentSource::Filename,
                    outcome: Some(scored.outcome),
                    needs_deep_analysis: false,
                    clustered: false,
                    explanation: scored.explanation,
                }),
                _ => {
                    if let Some(embedding) = embeddings[index].clone() {
                        leftover_entries.push(ThemeEntry {
                            filename: file.filename.clone(),
                            extension: file.extension.clone(),
                            embedding,
                        });
                        leftovers.push((index, scored.explanation));
                    }
                }
            }
        }

        if !leftovers.is_empty() {
            let clustered = self.cluster_leftovers(&leftovers, leftover_entries).await;
            match clustered {
                Ok(mut clustered) => {
                    let covered: HashSet<usize> = clustered.iter().map(|p| p.index).collect();
                    for (index, _) in &leftovers {
                        if !covered.contains(index) {
                            report.failures.push(failure_for(
                                &files[*index],
                                "not claimed by any theme".to_string(),
                            ));
                        }
                    }
                    report.clustered = clustered.len();
                    placements.append(&mut clustered);
                }
                Err(err) => {
                    log::warn!("Clustering {} unplaced files failed: {err}", leftovers.len());
                    for (index, _) in &leftovers {
                        report
                            .failures
                            .push(failure_for(&files[*index], format!("clustering failed: {err}")));
                    }
                }
            }
        }

        let (assigned, rejected) = self
            .taxonomy
            .mutate(|tree| {
                let mut assigned = Vec::new();
                let mut rejected = Vec::new();
                for (slot, placement) in placements.iter().enumerate() {
                    let file = &files[placement.index];
                    let placed = tree.add_category(&placement.category_path).and_then(|id| {
                        let mut assignment = FileAssignment::for_file(
                            file,
                            id,
                            placement.confidence,
                            placement.source,
                        );
                        assignment.needs_deep_analysis = placement.needs_deep_analysis;
                        tree.assign(assignment.clone())?;
                        Ok((slot, tree.path_of(id)?, assignment))
                    });
                    match placed {
                        Ok(entry) => assigned.push(entry),
                        Err(err) => rejected.push((placement.index, err.to_string())),
                    }
                }
                Ok((assigned, rejected))
            })
            .await?;
        for (index, reason) in rejected {
            report.failures.push(failure_for(&files[index], reason));
        }

        let mut updates = Vec::new();
        let mut rows = Vec::new();
        {
            let mut patterns = self.patterns.lock().await;
            for (slot, path, _) in &assigned {
                let placement = &placements[*slot];
                let (Some(checksum), Some(embedding)) = (
                    checksums[placement.index].as_deref(),
                    embeddings[placement.index].as_deref(),
                ) else {
                    continue;
                };
                if placement.source == AssignmentSource::Memory {
                    continue;
                }
                if let Err(err) = patterns.record(checksum, embedding, path, placement.confidence) {
                    log::warn!("Could not remember pattern for {}: {err}", files[placement.index].filename);
                }
            }
        }
        {
            let mut scorer = self.scorer.write().await;
            for outcome in &outcomes {
                scorer.record_decision(*outcome);
            }
            for (slot, path, _) in &assigned {
                let placement = &placements[*slot];
                let file = &files[placement.index];
                if let Some(ext) = file.extension.as_deref() {
                    scorer.observe_extension(path, ext);
                }
                let learns = placement.clustered || placement.outcome == Some(Outcome::AutoPlace);
                if learns {
                    if let Some(embedding) = embeddings[placement.index].clone() {
                        updates.push(PrototypeUpdate::new(path.clone(), embedding));
                    }
                }
            }
        }
        let now = current_unix_ms();
        for (slot, path, assignment) in assigned {
            let placement = &placements[slot];
            let record = ProcessingRecord {
                file_id: assignment.file_id.clone(),
                url: assignment.url.clone(),
                category_path: path.clone(),
                confidence: assignment.confidence,
                outcome: placement.outcome,
                source: placement.source,
                checksum: checksums[placement.index].clone(),
                processed_at_unix_ms: now,
            };
            rows.push(WriteOp::put(
                Table::Processing,
                assignment.file_id.as_str(),
                serde_json::to_value(&record)?,
            ));
            report.decisions.push(ClassifyDecision {
                file_id: assignment.file_id.clone(),
                category_path: path,
                confidence: assignment.confidence,
                outcome: placement.outcome,
                source: placement.source,
                clustered: placement.clustered,
                explanation: placement.explanation.clone(),
            });
            report.assignments.push(assignment);
        }
        if !rows.is_empty() {
            if let Err(err) = self.store.transaction(rows).await {
                log::warn!("Could not record processing rows: {err}");
            }
        }
        self.updates.extend(updates).await;
        if self.config.prototypes.auto_flush {
            self.flush_updates().await;
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log::info!(
            "Classified {} of {} files ({} remembered, {} clustered, {} failed) in {}ms",
            report.assignments.len(),
            files.len(),
            report.memory_hits,
            report.clustered,
            report.failures.len(),
            report.duration_ms
        );
        Ok(report)
    }

    async fn embed_texts(&self, texts: &[&str]) -> Vec<Embedded> {
        let dimension = self.embedder.dimension();
        match self.embedder.embed_batch(texts.to_vec()).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors
                .into_iter()
                .map(|v| checked_embedding(v, dimension))
                .collect(),
            Ok(vectors) => {
                log::warn!(
                    "Embedder returned {} vectors for {} texts; retrying one by one",
                    vectors.len(),
                    texts.len()
                );
                self.embed_one_by_one(texts, dimension).await
            }
            Err(err) => {
                log::warn!("Batch embedding failed, retrying one by one: {err}");
                self.embed_one_by_one(texts, dimension).await
            }
        }
    }

    async fn embed_one_by_one(&self, texts: &[&str], dimension: usize) -> Vec<Embedded> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(match self.embedder.embed(text).await {
                Ok(v) => checked_embedding(v, dimension),
                Err(err) => Err(format!("embedding failed: {err}")),
            });
        }
        out
    }

    async fn checksums(&self, files: &[ScannedFile]) -> Vec<Option<String>> {
        if !self.config.worker.content_checksum {
            return vec![None; files.len()];
        }
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            match content_checksum(&file.url, file.size, &file.filename).await {
                Ok(checksum) => out.push(Some(checksum)),
                Err(err) => {
                    log::debug!("No checksum for {}: {err}", file.url.display());
                    out.push(None);
                }
            }
        }
        out
    }

    /// Scores `indices` against the prototypes with at most
    /// `classify_concurrency` files in flight.
    async fn score_all(
        &self,
        files: &[ScannedFile],
        embeddings: &[Option<Vec<f32>>],
        indices: &[usize],
    ) -> Result<Vec<(usize, std::result::Result<ScoredCategory, String>)>> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker.classify_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for &index in indices {
            let Some(embedding) = embeddings[index].clone() else {
                continue;
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Other("classification worker pool closed".to_string()))?;
            let file = &files[index];
            let filename = file.filename.clone();
            let extension = file.extension.clone();
            let folder = file.parent_folder();
            let prototypes = self.prototypes.clone();
            let scorer = self.scorer.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let prototypes = prototypes.read().await;
                let scorer = scorer.read().await;
                let input = ScoringInput::new(&embedding, &filename)
                    .parent_folder(folder.as_deref())
                    .extension(extension.as_deref());
                let scored = scorer
                    .calculate_confidence(&prototypes, &input)
                    .map_err(|err| err.to_string());
                (index, scored)
            });
        }

        let mut out = Vec::with_capacity(indices.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(scored) => out.push(scored),
                Err(err) => log::warn!("Scoring task failed: {err}"),
            }
        }
        let seen: HashSet<usize> = out.iter().map(|(index, _)| *index).collect();
        for &index in indices {
            if embeddings[index].is_some() && !seen.contains(&index) {
                out.push((index, Err("scoring task did not complete".to_string())));
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    async fn cluster_leftovers(
        &self,
        leftovers: &[(usize, String)],
        entries: Vec<ThemeEntry>,
    ) -> Result<Vec<Placement>> {
        let policy = self.taxonomy.read(|tree| tree.policy().clone()).await;
        let k = suggested_k(entries.len());
        let clustering = self
            .run_themes(entries, k, self.clusterer.config().separate_file_types)
            .await?;
        let mut placements = Vec::new();
        for theme in &clustering.themes {
            for (member, path) in theme_placements(theme, &policy) {
                let Some((index, explanation)) = leftovers.get(member) else {
                    continue;
                };
                placements.push(Placement {
                    index: *index,
                    category_path: path,
                    confidence: theme.coherence,
                    source: AssignmentSource::Filename,
                    outcome: Some(Outcome::DeepAnalysis),
                    needs_deep_analysis: true,
                    clustered: true,
                    explanation: format!("{explanation}; grouped into theme '{}'", theme.name),
                });
            }
        }
        Ok(placements)
    }

    async fn run_themes(
        &self,
        entries: Vec<ThemeEntry>,
        k: usize,
        separate_file_types: bool,
    ) -> Result<ThemeClustering> {
        let config = ClusteringConfig {
            separate_file_types,
            ..self.clusterer.config().with_k(k)
        };
        let clustering = tokio::task::spawn_blocking(move || {
            let items = theme_items(&entries);
            Clusterer::new(config)?.themes(&items)
        })
        .await
        .map_err(|err| EngineError::Other(format!("join clustering task: {err}")))??;
        log::debug!(
            "{} themes via {:?} in {}ms",
            clustering.themes.len(),
            clustering.strategy,
            clustering.elapsed_ms
        );
        Ok(clustering)
    }

    /// Re-clusters a theme's members into at most `levels` nested sub-themes.
    async fn sub_theme_placements(
        &self,
        theme: &SemanticTheme,
        vectors: &[Vec<f32>],
        filenames: &[String],
        levels: usize,
        policy: &DepthPolicy,
    ) -> Result<Vec<(usize, String)>> {
        let config = ClusteringConfig {
            max_depth: levels,
            ..self
                .clusterer
                .config()
                .with_k(suggested_k(theme.members.len()).max(2))
        };
        let subset: Vec<Vec<f32>> = theme.members.iter().map(|m| vectors[*m].clone()).collect();
        let root = tokio::task::spawn_blocking(move || Clusterer::new(config)?.hierarchy(&subset))
            .await
            .map_err(|err| EngineError::Other(format!("join hierarchy task: {err}")))??;

        let member_tokens: Vec<BTreeSet<String>> = theme
            .members
            .iter()
            .map(|m| keyword_tokens(&filenames[*m]))
            .collect();
        let shared: BTreeSet<String> = member_tokens
            .iter()
            .skip(1)
            .fold(member_tokens.first().cloned().unwrap_or_default(), |acc, tokens| {
                acc.intersection(tokens).cloned().collect()
            });
        let leaves = root.flatten(&mut |node: &ClusterNode| {
            let tokens: Vec<&BTreeSet<String>> =
                node.members.iter().map(|local| &member_tokens[*local]).collect();
            let kinds: Vec<FileKind> = node
                .members
                .iter()
                .map(|local| {
                    let name = &filenames[theme.members[*local]];
                    FileKind::from_extension(extension_of(name).as_deref())
                })
                .collect();
            sub_theme_name(&tokens, &shared, &kinds)
        });
        log::debug!("theme '{}' split into {} sub-themes", theme.name, leaves.len());
        Ok(leaves
            .into_iter()
            .flat_map(|(segments, members)| {
                let path = policy.snap_path(
                    &std::iter::once(theme.name.as_str())
                        .chain(segments.iter().map(String::as_str))
                        .collect::<Vec<_>>()
                        .join("/"),
                );
                members
                    .into_iter()
                    .map(move |local| (theme.members[local], path.clone()))
            })
            .collect())
    }

    /// Best prototype for `embedding` above the configured floor.
    pub async fn match_prototype(&self, embedding: &[f32]) -> Result<Option<PrototypeMatch>> {
        let prototypes = self.prototypes.read().await;
        Ok(prototypes.classify(embedding, self.config.prototypes.min_confidence)?)
    }

    /// Applies queued prototype updates under the write lock.
    pub async fn flush_updates(&self) -> usize {
        let updates = self.updates.drain().await;
        if updates.is_empty() {
            return 0;
        }
        let mut prototypes = self.prototypes.write().await;
        let mut applied = 0usize;
        for update in updates {
            match prototypes.update_prototype(&update.category_path, &update.embedding) {
                Ok(_) => applied += 1,
                Err(err) => log::warn!(
                    "Dropping prototype update for '{}': {err}",
                    update.category_path
                ),
            }
        }
        log::debug!("Applied {applied} prototype updates");
        applied
    }

    /// Drops low-confidence learned patterns that never matched again.
    pub async fn prune_patterns(&self, min_confidence: f32) -> usize {
        self.patterns.lock().await.prune(min_confidence)
    }

    // ---- taxonomy construction ---------------------------------------------

    /// Rebuilds the taxonomy from semantic themes of `files` and reseeds the
    /// prototypes from the result. `target_count == 0` picks a cluster count
    /// from the batch size.
    ///
    /// Pending suggestions and queued updates refer to the old tree and are
    /// discarded. Learned patterns survive when their category still exists.
    pub async fn build_taxonomy(
        &self,
        files: &[ScannedFile],
        target_count: usize,
        root_name: &str,
    ) -> Result<TaxonomyTree> {
        log::info!("Building taxonomy from {} files", files.len());
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        let mut entries = Vec::new();
        let mut indices = Vec::new();
        for (index, (file, embedded)) in files.iter().zip(self.embed_texts(&names).await).enumerate() {
            match embedded {
                Ok(embedding) => {
                    indices.push(index);
                    entries.push(ThemeEntry {
                        filename: file.filename.clone(),
                        extension: file.extension.clone(),
                        embedding,
                    });
                }
                Err(reason) => log::warn!("{} stays unsorted: {reason}", file.filename),
            }
        }

        let policy = self.config.taxonomy.clone();
        let mut tree = TaxonomyTree::with_policy(root_name, policy.clone())?;
        let mut prototypes =
            PrototypeStore::new(self.config.embedding.dimension, self.config.prototypes.ema_alpha)?;
        let mut placed = HashSet::new();
        if !entries.is_empty() {
            let k = if target_count == 0 {
                suggested_k(entries.len())
            } else {
                target_count.clamp(1, entries.len())
            };
            let vectors: Vec<Vec<f32>> = entries.iter().map(|e| e.embedding.clone()).collect();
            let filenames: Vec<String> = entries.iter().map(|e| e.filename.clone()).collect();
            let clustering = self
                .run_themes(entries, k, self.clusterer.config().separate_file_types)
                .await?;
            let sub_levels = policy
                .max_depth
                .saturating_sub(1)
                .min(self.clusterer.config().max_depth);
            for theme in &clustering.themes {
                let splittable = sub_levels > 0
                    && theme.file_type_groups.len() < 2
                    && theme.members.len() > self.clusterer.config().min_cluster_size;
                let placements = if splittable {
                    self.sub_theme_placements(theme, &vectors, &filenames, sub_levels, &policy)
                        .await?
                } else {
                    theme_placements(theme, &policy)
                };
                for (member, path) in placements {
                    let Some(&index) = indices.get(member) else {
                        continue;
                    };
                    let id = tree.add_category(&path)?;
                    tree.assign(FileAssignment::for_file(
                        &files[index],
                        id,
                        theme.coherence,
                        AssignmentSource::Filename,
                    ))?;
                    prototypes.update_prototype(&tree.path_of(id)?, &vectors[member])?;
                    placed.insert(index);
                }
            }
        }
        for (index, file) in files.iter().enumerate() {
            if placed.contains(&index) {
                continue;
            }
            let mut assignment =
                FileAssignment::for_file(file, tree.root(), 0.0, AssignmentSource::Filename);
            assignment.needs_deep_analysis = true;
            tree.assign(assignment)?;
        }
        tree.verify_integrity()?;

        {
            let mut gatekeeper = self.gatekeeper.lock().await;
            self.taxonomy.replace(tree.clone()).await;
            *gatekeeper = MergeSplitGatekeeper::new();
        }
        let discarded = self.updates.drain().await.len();
        if discarded > 0 {
            log::debug!("Discarded {discarded} queued updates for the old taxonomy");
        }
        *self.prototypes.write().await = prototypes;
        {
            let mut patterns = self.patterns.lock().await;
            let stale: BTreeSet<String> = patterns
                .iter()
                .map(|p| p.label.clone())
                .filter(|label| !matches!(tree.find(label), Ok(Some(_))))
                .collect();
            for label in stale {
                patterns.remove_label(&label);
            }
        }
        {
            let mut scorer = self.scorer.write().await;
            let mut fresh = ConfidenceScorer::new(scorer.config().clone())?;
            fresh.restore_stats(scorer.stats());
            for assignment in tree.assignments() {
                let Some(ext) = extension_of(&assignment.filename) else {
                    continue;
                };
                if let Ok(path) = tree.path_of(assignment.category_id) {
                    if !path.is_empty() {
                        fresh.observe_extension(&path, &ext);
                    }
                }
            }
            *scorer = fresh;
        }

        let now = current_unix_ms();
        let mut rows = Vec::new();
        for assignment in tree.assignments() {
            let record = ProcessingRecord {
                file_id: assignment.file_id.clone(),
                url: assignment.url.clone(),
                category_path: tree.path_of(assignment.category_id)?,
                confidence: assignment.confidence,
                outcome: None,
                source: assignment.source,
                checksum: None,
                processed_at_unix_ms: now,
            };
            rows.push(WriteOp::put(
                Table::Processing,
                assignment.file_id.as_str(),
                serde_json::to_value(&record)?,
            ));
        }
        if !rows.is_empty() {
            if let Err(err) = self.store.transaction(rows).await {
                log::warn!("Could not record processing rows: {err}");
            }
        }
        let stats = tree.statistics();
        log::info!(
            "Built taxonomy '{root_name}': {} categories, {} files ({} unsorted)",
            stats.category_count,
            stats.total_files,
            stats.root_files
        );
        Ok(tree)
    }

    // ---- organization ------------------------------------------------------

    /// Plans against a snapshot of the current tree. Nothing is touched on disk.
    pub async fn plan_organization(
        &self,
        files: &[ScannedFile],
        assignments: &[FileAssignment],
        output_root: &Path,
    ) -> Result<OrganizationPlan> {
        let tree = self.taxonomy.snapshot().await;
        Ok(sift_organizer::plan_organization(
            files,
            assignments,
            &tree,
            output_root,
            &self.config.organizer,
        )?)
    }

    /// Plans every assignment the tree currently holds.
    pub async fn plan_current(
        &self,
        files: &[ScannedFile],
        output_root: &Path,
    ) -> Result<OrganizationPlan> {
        let tree = self.taxonomy.snapshot().await;
        let assignments = tree.assignments();
        Ok(sift_organizer::plan_organization(
            files,
            &assignments,
            &tree,
            output_root,
            &self.config.organizer,
        )?)
    }

    async fn organizer_for(&self, output_root: &Path) -> Result<Arc<SafeFileOrganizer>> {
        let mut organizers = self.organizers.lock().await;
        if let Some(existing) = organizers.get(output_root) {
            return Ok(existing.clone());
        }
        let config = self.config.organizer.clone();
        let organizer = if self.root.is_some() {
            SafeFileOrganizer::open(output_root, config).await?
        } else {
            SafeFileOrganizer::in_memory(output_root, config)?
        };
        let organizer = Arc::new(organizer);
        organizers.insert(output_root.to_path_buf(), organizer.clone());
        Ok(organizer)
    }

    pub async fn execute(
        &self,
        plan: &OrganizationPlan,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationFlag,
    ) -> Result<OrganizationResult> {
        let organizer = self.organizer_for(&plan.output_root).await?;
        let result = organizer.execute(plan, on_progress, cancel).await?;
        self.after_batch(&organizer, &result).await;
        Ok(result)
    }

    pub async fn undo_last_operation(&self, output_root: &Path) -> Result<OrganizationResult> {
        let organizer = self.organizer_for(output_root).await?;
        let result = organizer.undo_last_operation().await?;
        self.after_batch(&organizer, &result).await;
        Ok(result)
    }

    pub async fn redo(&self, output_root: &Path) -> Result<OrganizationResult> {
        let organizer = self.organizer_for(output_root).await?;
        let result = organizer.redo().await?;
        self.after_batch(&organizer, &result).await;
        Ok(result)
    }

    /// Undoable batches for `output_root`, newest first.
    pub async fn history(&self, output_root: &Path) -> Result<Vec<BatchSummary>> {
        Ok(self.organizer_for(output_root).await?.history().await)
    }

    pub async fn can_undo(&self, output_root: &Path) -> Result<bool> {
        Ok(self.organizer_for(output_root).await?.can_undo().await)
    }

    async fn after_batch(&self, organizer: &SafeFileOrganizer, result: &OrganizationResult) {
        let Some(batch_id) = result.batch_id.filter(|_| result.logged) else {
            return;
        };
        if let Err(err) = self.sync_movement_rows(organizer, batch_id).await {
            log::warn!("Could not mirror movement log batch {batch_id}: {err}");
        }
    }

    /// Mirrors the operations of `batch_id` still in effect into the
    /// `movement_log` table, keyed by operation id.
    async fn sync_movement_rows(&self, organizer: &SafeFileOrganizer, batch_id: Uuid) -> Result<()> {
        let current: Vec<(String, Value)> = {
            let history = organizer.movement_log();
            let log = history.lock().await;
            log.entries()
                .filter(|entry| entry.batch_id == batch_id)
                .map(|entry| Ok((entry.operation_id.to_string(), serde_json::to_value(entry)?)))
                .collect::<Result<_>>()?
        };
        let batch_key = batch_id.to_string();
        let keep: HashSet<String> = current.iter().map(|(key, _)| key.clone()).collect();
        let mut ops: Vec<WriteOp> = self
            .store
            .scan(Table::MovementLog)
            .await?
            .into_iter()
            .filter(|(key, row)| {
                row.get("batch_id").and_then(Value::as_str) == Some(batch_key.as_str())
                    && !keep.contains(key)
            })
            .map(|(key, _)| WriteOp::delete(Table::MovementLog, key))
            .collect();
        ops.extend(
            current
                .into_iter()
                .map(|(key, value)| WriteOp::put(Table::MovementLog, key, value)),
        );
        if ops.is_empty() {
            return Ok(());
        }
        self.store.transaction(ops).await
    }

    // ---- governance --------------------------------------------------------

    pub async fn suggest_merge(
        &self,
        sources: &[&str],
        target: &str,
        reason: &str,
        confidence: f32,
    ) -> Result<u64> {
        let (source_ids, target_id) = self
            .taxonomy
            .read(|tree| -> sift_taxonomy::Result<(Vec<NodeId>, NodeId)> {
                let ids = sources
                    .iter()
                    .map(|path| tree.resolve(path))
                    .collect::<sift_taxonomy::Result<Vec<_>>>()?;
                Ok((ids, tree.resolve(target)?))
            })
            .await?;
        if source_ids.is_empty() || source_ids.contains(&target_id) {
            return Err(TaxonomyError::InvalidOperation(
                "a merge needs sources distinct from its target".to_string(),
            )
            .into());
        }
        Ok(self
            .gatekeeper
            .lock()
            .await
            .suggest_merge(source_ids, target_id, reason, confidence))
    }

    pub async fn suggest_split(
        &self,
        path: &str,
        names: Vec<String>,
        reason: &str,
        confidence: f32,
    ) -> Result<u64> {
        let node = self.taxonomy.read(|tree| tree.resolve(path)).await?;
        Ok(self
            .gatekeeper
            .lock()
            .await
            .suggest_split(node, names, reason, confidence))
    }

    /// Runs the refiner over the current tree and queues what it proposes.
    /// User-edited categories are never proposed.
    pub async fn suggest_refinements(&self) -> Result<RefineReport> {
        let tree = self.taxonomy.snapshot().await;
        let merges = {
            let prototypes = self.prototypes.read().await;
            self.refiner.merge_candidates(&tree, &prototypes)?
        };
        let mut splits = Vec::new();
        for node in self.refiner.oversized(&tree) {
            if !tree.can_auto_modify(node) {
                continue;
            }
            let files = tree.files_in(node);
            let names: Vec<&str> = files.iter().map(|a| a.filename.as_str()).collect();
            let entries: Vec<ThemeEntry> = files
                .iter()
                .zip(self.embed_texts(&names).await)
                .filter_map(|(assignment, embedded)| {
                    embedded.ok().map(|embedding| ThemeEntry {
                        filename: assignment.filename.clone(),
                        extension: extension_of(&assignment.filename),
                        embedding,
                    })
                })
                .collect();
            let refiner = self.refiner.clone();
            let clustering = self.clusterer.config().clone();
            let candidate = tokio::task::spawn_blocking(move || {
                refiner.split_candidate(node, &theme_items(&entries), &clustering)
            })
            .await
            .map_err(|err| EngineError::Other(format!("join split task: {err}")))??;
            splits.extend(candidate);
        }

        let mut gatekeeper = self.gatekeeper.lock().await;
        let mut report = RefineReport::default();
        for merge in merges {
            let protected = merge
                .sources
                .iter()
                .chain(std::iter::once(&merge.target))
                .any(|id| !tree.can_auto_modify(*id));
            if protected {
                continue;
            }
            report.merges.push(gatekeeper.suggest_merge(
                merge.sources,
                merge.target,
                merge.reason,
                merge.similarity,
            ));
        }
        for split in splits {
            report.splits.push(gatekeeper.suggest_split(
                split.node,
                split.names,
                split.reason,
                split.confidence,
            ));
        }
        log::info!(
            "Queued {} merge and {} split suggestions",
            report.merges.len(),
            report.splits.len()
        );
        Ok(report)
    }

    pub async fn pending_merges(&self) -> Vec<MergeSuggestion> {
        self.gatekeeper.lock().await.pending_merges()
    }

    pub async fn pending_splits(&self) -> Vec<SplitSuggestion> {
        self.gatekeeper.lock().await.pending_splits()
    }

    pub async fn reject_merge(&self, id: u64) -> Result<()> {
        Ok(self.gatekeeper.lock().await.reject_merge(id)?)
    }

    pub async fn reject_split(&self, id: u64) -> Result<()> {
        Ok(self.gatekeeper.lock().await.reject_split(id)?)
    }

    /// Applies a pending merge and carries prototypes, patterns and extension
    /// history over to the surviving paths.
    pub async fn approve_merge(&self, id: u64) -> Result<MergeReport> {
        let mut gatekeeper = self.gatekeeper.lock().await;
        let (report, renames) = self
            .taxonomy
            .mutate(|tree| {
                let before = gatekeeper
                    .merge(id)
                    .map(|s| paths_under(tree, &s.sources))
                    .unwrap_or_default();
                let report = gatekeeper.approve_merge(id, tree)?;
                let target_path = tree.path_of(report.target)?;
                let renames = remapped_paths(tree, before, &target_path);
                Ok((report, renames))
            })
            .await?;
        drop(gatekeeper);
        self.apply_path_renames(&renames).await;
        log::info!(
            "Applied merge {id}: {} files moved, {} categories removed",
            report.moved_files,
            report.removed_nodes.len()
        );
        Ok(report)
    }

    /// Creates the proposed children, then moves the node's files into the
    /// child each one scores best against. Files no child claims stay put.
    pub async fn approve_split(&self, id: u64) -> Result<SplitReport> {
        let mut gatekeeper = self.gatekeeper.lock().await;
        let (node, created) = self
            .taxonomy
            .mutate(|tree| {
                let node = gatekeeper
                    .split(id)
                    .map(|s| s.node)
                    .ok_or(TaxonomyError::SuggestionNotFound(id))?;
                let created = gatekeeper.approve_split(id, tree)?;
                Ok((node, created))
            })
            .await?;
        drop(gatekeeper);
        let report = self.reclassify_into_children(node, created).await?;
        log::info!(
            "Applied split {id}: {} subcategories, {} files reassigned, {} kept",
            report.created.len(),
            report.reassigned,
            report.kept
        );
        Ok(report)
    }

    async fn reclassify_into_children(
        &self,
        node: NodeId,
        children: Vec<NodeId>,
    ) -> Result<SplitReport> {
        let (files, child_paths) = self
            .taxonomy
            .read(|tree| {
                let paths: Vec<(NodeId, String)> = children
                    .iter()
                    .filter_map(|child| tree.path_of(*child).ok().map(|path| (*child, path)))
                    .collect();
                (tree.files_in(node).to_vec(), paths)
            })
            .await;
        let mut report = SplitReport {
            node,
            created: children,
            created_paths: child_paths.iter().map(|(_, path)| path.clone()).collect(),
            reassigned: 0,
            kept: files.len(),
        };
        if files.is_empty() || child_paths.is_empty() {
            return Ok(report);
        }

        let names: Vec<&str> = files.iter().map(|a| a.filename.as_str()).collect();
        let usable: Vec<(usize, Vec<f32>)> = self
            .embed_texts(&names)
            .await
            .into_iter()
            .enumerate()
            .filter_map(|(index, embedded)| match embedded {
                Ok(embedding) => Some((index, embedding)),
                Err(reason) => {
                    log::warn!("{} stays in place: {reason}", files[index].filename);
                    None
                }
            })
            .collect();

        // Seed one local prototype per child from the theme that carries its name.
        let mut local =
            PrototypeStore::new(self.config.embedding.dimension, self.config.prototypes.ema_alpha)?;
        let entries: Vec<ThemeEntry> = usable
            .iter()
            .map(|(index, embedding)| ThemeEntry {
                filename: files[*index].filename.clone(),
                extension: extension_of(&files[*index].filename),
                embedding: embedding.clone(),
            })
            .collect();
        match self.run_themes(entries, child_paths.len(), false).await {
            Ok(clustering) => {
                for theme in &clustering.themes {
                    let Some((_, path)) = child_paths
                        .iter()
                        .find(|(_, path)| leaf_of(path).eq_ignore_ascii_case(&theme.name))
                    else {
                        continue;
                    };
                    for member in &theme.members {
                        if let Some((_, embedding)) = usable.get(*member) {
                            local.update_prototype(path, embedding)?;
                        }
                    }
                }
            }
            Err(err) => log::warn!("Theme pass for split of {node} failed: {err}"),
        }
        for (_, path) in &child_paths {
            if local.get(path).is_none() {
                let seed = self.embedder.embed(leaf_of(path)).await?;
                ensure_dimension(&seed, self.config.embedding.dimension)?;
                local.update_prototype(path, &seed)?;
            }
        }

        let moves: Vec<(usize, String, f32)> = {
            let scorer = self.scorer.read().await;
            usable
                .iter()
                .filter_map(|(index, embedding)| {
                    let assignment = &files[*index];
                    let extension = extension_of(&assignment.filename);
                    let input = ScoringInput::new(embedding, &assignment.filename)
                        .extension(extension.as_deref());
                    match scorer.calculate_confidence(&local, &input) {
                        Ok(scored) if scored.outcome != Outcome::DeepAnalysis => scored
                            .category_path
                            .map(|path| (*index, path, scored.confidence)),
                        Ok(_) => None,
                        Err(err) => {
                            log::warn!("Could not score {}: {err}", assignment.filename);
                            None
                        }
                    }
                })
                .collect()
        };

        let moved = self
            .taxonomy
            .mutate(|tree| {
                let mut moved = Vec::new();
                for (index, path, confidence) in &moves {
                    let Some(child) = tree.find(path)? else {
                        continue;
                    };
                    let current = &files[*index];
                    let still_here = tree
                        .assignment(&current.file_id)
                        .is_some_and(|a| a.category_id == node);
                    if !still_here {
                        continue;
                    }
                    let mut assignment = current.clone();
                    assignment.category_id = child;
                    assignment.confidence = confidence.clamp(0.0, 1.0);
                    assignment.source = AssignmentSource::Filename;
                    assignment.needs_deep_analysis = false;
                    tree.assign(assignment)?;
                    moved.push(*index);
                }
                Ok(moved)
            })
            .await?;

        let embeddings: HashMap<usize, &Vec<f32>> =
            usable.iter().map(|(index, embedding)| (*index, embedding)).collect();
        let updates: Vec<PrototypeUpdate> = moves
            .iter()
            .filter(|(index, _, _)| moved.contains(index))
            .filter_map(|(index, path, _)| {
                embeddings
                    .get(index)
                    .map(|embedding| PrototypeUpdate::new(path.clone(), (*embedding).clone()))
            })
            .collect();
        self.updates.extend(updates).await;
        if self.config.prototypes.auto_flush {
            self.flush_updates().await;
        }

        report.reassigned = moved.len();
        report.kept = files.len() - moved.len();
        Ok(report)
    }

    // ---- user edits --------------------------------------------------------

    /// Creates `path` as a user category; existing paths are returned as-is.
    pub async fn add_category(&self, path: &str) -> Result<NodeId> {
        Ok(self
            .taxonomy
            .mutate(|tree| tree.add_user_category(path))
            .await?)
    }

    /// Removes a category; its files and subcategories move to the parent.
    pub async fn remove_category(&self, path: &str) -> Result<MergeReport> {
        let mut gatekeeper = self.gatekeeper.lock().await;
        let (report, renames) = self
            .taxonomy
            .mutate(|tree| {
                let id = tree.resolve(path)?;
                let before = paths_under(tree, &[id]);
                let report = tree.remove_category(path)?;
                let parent_path = tree.path_of(report.target)?;
                gatekeeper.prune_stale(tree);
                Ok((report, remapped_paths(tree, before, &parent_path)))
            })
            .await?;
        drop(gatekeeper);
        self.apply_path_renames(&renames).await;
        Ok(report)
    }

    /// Renames the category at `path` as a user edit and returns its new path.
    pub async fn rename_category(&self, path: &str, new_name: &str) -> Result<String> {
        let (new_path, renames) = self
            .taxonomy
            .mutate(|tree| {
                let id = tree.resolve(path)?;
                let before = paths_under(tree, &[id]);
                tree.rename(path, new_name, EditOrigin::User)?;
                let new_path = tree.path_of(id)?;
                let renames = remapped_paths(tree, before, &new_path);
                Ok((new_path, renames))
            })
            .await?;
        self.apply_path_renames(&renames).await;
        Ok(new_path)
    }

    /// Carries path-keyed state from old category paths to new ones. An empty
    /// new path means the category folded into the root.
    async fn apply_path_renames(&self, renames: &[(String, String)]) {
        if renames.is_empty() {
            return;
        }
        for (old, _) in renames {
            self.updates.discard_category(old).await;
        }
        {
            let mut prototypes = self.prototypes.write().await;
            for (old, new) in renames {
                if let Err(err) = prototypes.rename_prefix(old, new) {
                    log::warn!("Could not move prototype '{old}' to '{new}': {err}");
                }
            }
        }
        {
            let mut patterns = self.patterns.lock().await;
            for (old, new) in renames {
                patterns.relabel_prefix(old, new);
            }
        }
        let mut scorer = self.scorer.write().await;
        for (old, new) in renames {
            if new.is_empty() {
                scorer.forget_category(old);
            } else {
                scorer.merge_extension_history(old, new);
            }
        }
    }

    /// Records whether the file's current category was right and, if not,
    /// moves it to `correct_path` as a user decision.
    pub async fn record_feedback(
        &self,
        file_id: &FileId,
        correct_path: &str,
    ) -> Result<FeedbackOutcome> {
        let segments = parse_category_path(correct_path)?;
        if segments.is_empty() {
            return Err(TaxonomyError::InvalidOperation(
                "feedback needs a category path below the root".to_string(),
            )
            .into());
        }
        let correct = segments.join("/");
        let record: Option<ProcessingRecord> =
            match self.store.read(Table::Processing, file_id.as_str()).await? {
                Some(row) => Some(serde_json::from_value(row)?),
                None => None,
            };
        let current = self
            .taxonomy
            .read(|tree| {
                tree.assignment(file_id)
                    .map(|a| (a.url.clone(), tree.path_of(a.category_id).ok()))
            })
            .await;
        let url = current
            .as_ref()
            .map(|(url, _)| url.clone())
            .or_else(|| record.as_ref().map(|r| r.url.clone()))
            .ok_or_else(|| EngineError::UnknownFile(file_id.to_string()))?;
        let previous_path = current
            .and_then(|(_, path)| path)
            .or_else(|| record.as_ref().map(|r| r.category_path.clone()));
        let was_correct = previous_path
            .as_deref()
            .is_some_and(|path| path.to_lowercase() == correct.to_lowercase());
        let was_auto = record.as_ref().and_then(|r| r.outcome) == Some(Outcome::AutoPlace);
        self.scorer.write().await.record_outcome(was_correct, was_auto);

        let file = ScannedFile::from_path(&url);
        let (created_category, category_path) = self
            .taxonomy
            .mutate(|tree| {
                let existing = tree.find(&correct)?;
                let id = match existing {
                    Some(id) => {
                        if !was_correct {
                            tree.mark_user_edited(id)?;
                        }
                        id
                    }
                    None => tree.add_user_category(&correct)?,
                };
                let mut assignment = FileAssignment::for_file(&file, id, 1.0, AssignmentSource::User);
                assignment.file_id = file_id.clone();
                tree.assign(assignment)?;
                Ok((existing.is_none(), tree.path_of(id)?))
            })
            .await?;

        let embedding = self.embedder.embed(&file.filename).await?;
        ensure_dimension(&embedding, self.config.embedding.dimension)?;
        let embedding = normalized(embedding);
        self.updates
            .push(PrototypeUpdate::new(category_path.clone(), embedding.clone()))
            .await;
        let checksum = record.as_ref().and_then(|r| r.checksum.clone());
        if let Some(checksum) = &checksum {
            let mut patterns = self.patterns.lock().await;
            let learned = if patterns.get(checksum).is_some() {
                patterns.correct(checksum, &category_path)
            } else {
                patterns
                    .record(checksum, &embedding, &category_path, 1.0)
                    .map(|_| ())
            };
            if let Err(err) = learned {
                log::warn!("Could not update learned pattern for {file_id}: {err}");
            }
        }
        if !was_correct {
            if let Some(ext) = file.extension.as_deref() {
                self.scorer.write().await.observe_extension(&category_path, ext);
            }
        }
        let updated = ProcessingRecord {
            file_id: file_id.clone(),
            url,
            category_path: category_path.clone(),
            confidence: 1.0,
            outcome: record.as_ref().and_then(|r| r.outcome),
            source: AssignmentSource::User,
            checksum,
            processed_at_unix_ms: current_unix_ms(),
        };
        self.store
            .write(Table::Processing, file_id.as_str(), serde_json::to_value(&updated)?)
            .await?;
        if self.config.prototypes.auto_flush {
            self.flush_updates().await;
        }
        log::info!(
            "Feedback for {file_id}: {} -> {category_path} ({})",
            previous_path.as_deref().unwrap_or("<none>"),
            if was_correct { "confirmed" } else { "corrected" }
        );
        Ok(FeedbackOutcome {
            was_correct,
            previous_path,
            category_path,
            created_category,
        })
    }

    pub async fn stats(&self) -> EngineStats {
        let (pending_merges, pending_splits) = {
            let gatekeeper = self.gatekeeper.lock().await;
            (
                gatekeeper.pending_merges().len(),
                gatekeeper.pending_splits().len(),
            )
        };
        EngineStats {
            scorer: self.scorer.read().await.stats(),
            taxonomy: self.taxonomy.read(TaxonomyTree::statistics).await,
            prototypes: self.prototypes.read().await.len(),
            patterns: self.patterns.lock().await.len(),
            pending_updates: self.updates.len().await,
            pending_merges,
            pending_splits,
        }
    }
}

fn checked_embedding(vector: Vec<f32>, dimension: usize) -> Embedded {
    ensure_dimension(&vector, dimension).map_err(|err| err.to_string())?;
    Ok(normalized(vector))
}

fn failure_for(file: &ScannedFile, reason: String) -> ClassifyFailure {
    log::warn!("{}: {reason}", file.url.display());
    ClassifyFailure {
        file_id: file.file_id(),
        url: file.url.clone(),
        reason,
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn leaf_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Category path for each member of `theme`. Themes that mix file kinds get
/// one subcategory per kind.
fn theme_placements(theme: &SemanticTheme, policy: &DepthPolicy) -> Vec<(usize, String)> {
    if theme.file_type_groups.len() < 2 {
        let path = policy.snap_path(&theme.name);
        return theme.members.iter().map(|m| (*m, path.clone())).collect();
    }
    theme
        .file_type_groups
        .iter()
        .flat_map(|group| {
            let path = policy.snap_path(&format!("{}/{}", theme.name, group.kind.label()));
            group.members.iter().map(move |m| (*m, path.clone()))
        })
        .collect()
}

/// Most frequent keywords of a sub-theme, skipping those every file of the
/// parent theme carries.
fn sub_theme_name(
    member_tokens: &[&BTreeSet<String>],
    shared: &BTreeSet<String>,
    kinds: &[FileKind],
) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for token in member_tokens.iter().flat_map(|tokens| tokens.iter()) {
        if !shared.contains(token) {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
    }
    let floor = if member_tokens.len() < 3 { 1 } else { 2 };
    let mut ranked: Vec<(&str, usize)> =
        counts.into_iter().filter(|(_, count)| *count >= floor).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let keywords: Vec<String> = ranked
        .into_iter()
        .take(2)
        .map(|(token, _)| token.to_string())
        .collect();
    theme_name(&keywords, kinds)
}

/// `roots` and everything below them, with their current paths.
fn paths_under(tree: &TaxonomyTree, roots: &[NodeId]) -> Vec<(NodeId, String)> {
    roots
        .iter()
        .flat_map(|root| std::iter::once(*root).chain(tree.descendants(*root)))
        .filter_map(|id| tree.path_of(id).ok().map(|path| (id, path)))
        .collect()
}

/// Old and new path of every node in `before` whose path changed. Nodes that
/// no longer exist map to `fallback`.
fn remapped_paths(
    tree: &TaxonomyTree,
    before: Vec<(NodeId, String)>,
    fallback: &str,
) -> Vec<(String, String)> {
    before
        .into_iter()
        .filter_map(|(id, old)| {
            let new = if tree.contains(id) {
                tree.path_of(id).unwrap_or_else(|_| fallback.to_string())
            } else {
                fallback.to_string()
            };
            (old != new).then_some((old, new))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn remapped_paths_follow_surviving_nodes() {
        let mut tree = TaxonomyTree::new("Root");
        let work = tree.add_category("Work").unwrap();
        let reports = tree.add_category("Work/Reports").unwrap();
        let before = paths_under(&tree, &[work]);
        assert_eq!(before.len(), 2);
        tree.rename("Work", "Jobs", EditOrigin::User).unwrap();
        let renames = remapped_paths(&tree, before, "Jobs");
        assert_eq!(
            renames,
            vec![
                ("Work".to_string(), "Jobs".to_string()),
                ("Work/Reports".to_string(), "Jobs/Reports".to_string()),
            ]
        );
        assert!(tree.contains(reports));
    }

    #[test]
    fn removed_nodes_fall_back_to_the_parent() {
        let mut tree = TaxonomyTree::new("Root");
        let misc = tree.add_category("Misc").unwrap();
        let before = paths_under(&tree, &[misc]);
        tree.remove_category("Misc").unwrap();
        assert_eq!(
            remapped_paths(&tree, before, ""),
            vec![("Misc".to_string(), String::new())]
        );
    }

    #[test]
    fn single_kind_themes_use_the_theme_name() {
        let theme = SemanticTheme {
            name: "Invoice Acme".to_string(),
            keywords: vec!["invoice".to_string(), "acme".to_string()],
            members: vec![0, 2],
            file_type_groups: Vec::new(),
            centroid: vec![1.0, 0.0],
            coherence: 0.9,
        };
        let placements = theme_placements(&theme, &DepthPolicy::default());
        assert_eq!(
            placements,
            vec![(0, "Invoice Acme".to_string()), (2, "Invoice Acme".to_string())]
        );
    }

    #[test]
    fn leaf_and_extension_helpers() {
        assert_eq!(leaf_of("Work/Reports"), "Reports");
        assert_eq!(leaf_of("Work"), "Work");
        assert_eq!(extension_of("a.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension_of("Makefile"), None);
    }
}
