//! Semantic themes: clusters named from the keywords their filenames share.

use crate::error::{ClassifierError, Result};
use crate::file_types::FileKind;
use crate::kmeans::{coherence, KMeansConfig, SphericalKMeans};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sift_vector_store::{cosine_of, normalized, tokenize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "from", "this", "that", "are", "was", "you", "your",
        "our", "new", "old", "copy", "final", "draft", "untitled", "file", "files", "img",
        "image", "dsc", "scan", "screenshot", "document", "doc", "version", "rev", "tmp",
        "temp", "misc", "backup", "export", "edited", "part",
    ]
    .into_iter()
    .collect()
});

/// Tokens that carry no topic: numbers, dates, hashes, version tags.
static NOISE_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:\d+|v\d+|[0-9a-f]{8,}|\d{1,4}x\d{1,4}|(?:jan|feb|mar|apr|jun|jul|aug|sep|sept|oct|nov|dec))$").ok()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub kmeans: KMeansConfig,
    pub separate_file_types: bool,
    pub time_budget_ms: u64,
    /// Above this many items, a single greedy pass replaces k-means.
    pub single_pass_threshold: usize,
    /// Minimum similarity to join an existing group in the single pass.
    pub single_pass_similarity: f32,
    pub max_keywords: usize,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            kmeans: KMeansConfig::default(),
            separate_file_types: true,
            time_budget_ms: 2_000,
            single_pass_threshold: 2_000,
            single_pass_similarity: 0.5,
            max_keywords: 5,
        }
    }
}

impl ThemeConfig {
    pub fn validate(&self) -> Result<()> {
        self.kmeans.validate()?;
        if !(0.0..=1.0).contains(&self.single_pass_similarity) {
            return Err(ClassifierError::InvalidConfig(format!(
                "single_pass_similarity must be in [0, 1], got {}",
                self.single_pass_similarity
            )));
        }
        if self.time_budget_ms == 0 {
            return Err(ClassifierError::InvalidConfig(
                "time_budget_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ThemeItem<'a> {
    pub filename: &'a str,
    pub extension: Option<&'a str>,
    pub embedding: &'a [f32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTypeGroup {
    pub kind: FileKind,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticTheme {
    pub name: String,
    pub keywords: Vec<String>,
    pub members: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_type_groups: Vec<FileTypeGroup>,
    pub centroid: Vec<f32>,
    pub coherence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeStrategy {
    KMeans,
    SinglePass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeClustering {
    pub themes: Vec<SemanticTheme>,
    pub strategy: ThemeStrategy,
    pub elapsed_ms: u64,
    pub within_budget: bool,
}

/// Groups `items` by embedding and names each group from filename keywords.
pub fn cluster_themes(items: &[ThemeItem<'_>], config: &ThemeConfig) -> Result<ThemeClustering> {
    config.validate()?;
    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.time_budget_ms);

    let (groups, centroids, strategy) = if items.len() > config.single_pass_threshold {
        let (groups, centroids) = single_pass(items, config)?;
        (groups, centroids, ThemeStrategy::SinglePass)
    } else {
        let vectors: Vec<Vec<f32>> = items.iter().map(|i| i.embedding.to_vec()).collect();
        let kmeans = SphericalKMeans::new(config.kmeans.clone())?;
        let result = kmeans.fit_until(&vectors, Some(deadline))?;
        let centroids = result.centroids.clone();
        (result.members(), centroids, ThemeStrategy::KMeans)
    };

    let tokens: Vec<BTreeSet<String>> = items.iter().map(|i| keyword_tokens(i.filename)).collect();
    let global_df = document_frequency(tokens.iter());

    let mut used_names: HashMap<String, usize> = HashMap::new();
    let mut themes = Vec::new();
    for (members, centroid) in groups.into_iter().zip(centroids) {
        if members.is_empty() {
            continue;
        }
        let keywords = rank_keywords(&members, &tokens, &global_df, items.len(), config.max_keywords);
        let kinds: Vec<FileKind> = members
            .iter()
            .map(|i| FileKind::from_extension(items[*i].extension))
            .collect();
        let name = unique_name(theme_name(&keywords, &kinds), &mut used_names);
        let member_vectors: Vec<&[f32]> = members.iter().map(|i| items[*i].embedding).collect();
        let file_type_groups = if config.separate_file_types {
            file_type_groups(&members, &kinds)
        } else {
            Vec::new()
        };
        themes.push(SemanticTheme {
            name,
            keywords,
            coherence: coherence(&member_vectors),
            members,
            file_type_groups,
            centroid,
        });
    }

    let elapsed = started.elapsed();
    let within_budget = elapsed <= Duration::from_millis(config.time_budget_ms);
    if !within_budget {
        log::warn!(
            "theme clustering of {} items took {}ms (budget {}ms)",
            items.len(),
            elapsed.as_millis(),
            config.time_budget_ms
        );
    }
    Ok(ThemeClustering {
        themes,
        strategy,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        within_budget,
    })
}

/// Greedy leader clustering: one pass, at most `k` groups.
fn single_pass(items: &[ThemeItem<'_>], config: &ThemeConfig) -> Result<(Vec<Vec<usize>>, Vec<Vec<f32>>)> {
    let dim = items.first().map_or(0, |i| i.embedding.len());
    let mut leaders: Vec<Vec<f32>> = Vec::new();
    let mut sums: Vec<Vec<f32>> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if item.embedding.len() != dim {
            return Err(ClassifierError::InvalidDimension {
                expected: dim,
                actual: item.embedding.len(),
            });
        }
        let best = leaders
            .iter()
            .enumerate()
            .map(|(g, leader)| (g, cosine_of(item.embedding, leader)))
            .fold(None::<(usize, f32)>, |best, next| match best {
                Some(b) if b.1 >= next.1 => Some(b),
                _ => Some(next),
            });
        let target = match best {
            Some((g, sim)) if sim >= config.single_pass_similarity || leaders.len() >= config.kmeans.k => g,
            _ => {
                leaders.push(normalized(item.embedding.to_vec()));
                sums.push(vec![0.0; dim]);
                groups.push(Vec::new());
                leaders.len() - 1
            }
        };
        groups[target].push(idx);
        for (slot, value) in sums[target].iter_mut().zip(item.embedding) {
            *slot += value;
        }
    }
    let centroids = sums.into_iter().map(normalized).collect();
    Ok((groups, centroids))
}

/// Topic-bearing tokens of a filename, extension removed.
#[must_use]
pub fn keyword_tokens(filename: &str) -> BTreeSet<String> {
    let stem = match filename.rfind('.') {
        Some(dot) if dot > 0 => &filename[..dot],
        _ => filename,
    };
    tokenize(stem)
        .into_iter()
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !STOPWORDS.contains(t.as_str()))
        .filter(|t| NOISE_TOKEN.as_ref().map_or(true, |re| !re.is_match(t)))
        .collect()
}

fn document_frequency<'a>(docs: impl Iterator<Item = &'a BTreeSet<String>>) -> HashMap<String, usize> {
    let mut df = HashMap::new();
    for doc in docs {
        for token in doc {
            *df.entry(token.clone()).or_insert(0) += 1;
        }
    }
    df
}

fn rank_keywords(
    members: &[usize],
    tokens: &[BTreeSet<String>],
    global_df: &HashMap<String, usize>,
    corpus_size: usize,
    max_keywords: usize,
) -> Vec<String> {
    let local_df = document_frequency(members.iter().map(|i| &tokens[*i]));
    #[allow(clippy::cast_precision_loss)]
    let mut scored: Vec<(String, f32, usize)> = local_df
        .into_iter()
        .filter(|(_, count)| members.len() < 3 || *count >= 2)
        .map(|(token, count)| {
            let global = global_df.get(&token).copied().unwrap_or(count).max(1);
            let coverage = count as f32 / members.len() as f32;
            let idf = (1.0 + corpus_size as f32 / global as f32).ln();
            (token, coverage * idf, count)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
        .into_iter()
        .take(max_keywords)
        .map(|(token, _, _)| token)
        .collect()
}

/// Title-cased keyword name, falling back to the dominant file kind.
#[must_use]
pub fn theme_name(keywords: &[String], kinds: &[FileKind]) -> String {
    match keywords {
        [first, second, ..] => format!("{} {}", title_case(first), title_case(second)),
        [only] => title_case(only),
        [] => dominant_kind(kinds).label().to_string(),
    }
}

fn dominant_kind(kinds: &[FileKind]) -> FileKind {
    let mut counts: BTreeMap<FileKind, usize> = BTreeMap::new();
    for kind in kinds {
        *counts.entry(*kind).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map_or(FileKind::Other, |(kind, _)| kind)
}

fn file_type_groups(members: &[usize], kinds: &[FileKind]) -> Vec<FileTypeGroup> {
    let mut by_kind: BTreeMap<FileKind, Vec<usize>> = BTreeMap::new();
    for (member, kind) in members.iter().zip(kinds) {
        by_kind.entry(*kind).or_default().push(*member);
    }
    if by_kind.len() < 2 {
        return Vec::new();
    }
    by_kind
        .into_iter()
        .map(|(kind, members)| FileTypeGroup { kind, members })
        .collect()
}

fn unique_name(base: String, used: &mut HashMap<String, usize>) -> String {
    let count = used.entry(base.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        base
    } else {
        format!("{base} {count}")
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
