//! Maps classified files onto destinations under an output root.

use crate::collision::{Collision, CollisionReason, CollisionResolver};
use crate::config::{OrganizeMode, OrganizerConfig};
use crate::error::{OrganizerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_protocol::{FileAssignment, FileId, ScannedFile};
use sift_taxonomy::TaxonomyTree;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One file operation. Immutable once it reaches the movement log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeOrganizationOperation {
    pub file_id: FileId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: OrganizeMode,
    /// Category path the destination mirrors; `None` for the uncategorized folder.
    pub category: Option<String>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision: Option<Collision>,
    /// Overwrite whatever sits at `destination`.
    #[serde(default)]
    pub replace: bool,
}

/// A destination that was occupied at planning time or claimed twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConflict {
    pub file_id: FileId,
    pub requested: PathBuf,
    pub reason: CollisionReason,
    /// Where the file goes instead; `None` when the existing file will be replaced.
    pub resolved: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationPlan {
    pub output_root: PathBuf,
    pub mode: OrganizeMode,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<SafeOrganizationOperation>,
    pub conflicts: Vec<PlanConflict>,
    /// Files already sitting at their destination.
    #[serde(default)]
    pub unchanged: Vec<FileId>,
}

impl OrganizationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn collision_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.collision.is_some())
            .count()
    }

    /// Operations grouped by category path, uncategorized under `None`.
    #[must_use]
    pub fn by_category(&self) -> Vec<(Option<String>, Vec<&SafeOrganizationOperation>)> {
        let mut groups: Vec<(Option<String>, Vec<&SafeOrganizationOperation>)> = Vec::new();
        for op in &self.operations {
            match groups.iter_mut().find(|(cat, _)| *cat == op.category) {
                Some((_, ops)) => ops.push(op),
                None => groups.push((op.category.clone(), vec![op])),
            }
        }
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups
    }
}

#[derive(Debug, Clone)]
pub struct OrganizationPlanner {
    config: OrganizerConfig,
    now: DateTime<Utc>,
}

impl OrganizationPlanner {
    pub fn new(config: OrganizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            now: Utc::now(),
        })
    }

    /// Pins the clock used for timestamped collision names.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Plans against the live filesystem using read-only existence checks.
    pub fn plan(
        &self,
        files: &[ScannedFile],
        assignments: &[FileAssignment],
        tree: &TaxonomyTree,
        output_root: &Path,
    ) -> Result<OrganizationPlan> {
        self.plan_with_lookup(files, assignments, tree, output_root, |path| {
            path.symlink_metadata().is_ok()
        })
    }

    /// Plans with a caller-supplied notion of which destinations already exist.
    pub fn plan_with_lookup(
        &self,
        files: &[ScannedFile],
        assignments: &[FileAssignment],
        tree: &TaxonomyTree,
        output_root: &Path,
        exists: impl Fn(&Path) -> bool,
    ) -> Result<OrganizationPlan> {
        let by_file: HashMap<&FileId, &FileAssignment> =
            assignments.iter().map(|a| (&a.file_id, a)).collect();
        let resolver = CollisionResolver::new(self.config.collision_style, self.now);
        let sources: HashSet<&Path> = files.iter().map(|f| f.url.as_path()).collect();

        let mut seen = HashSet::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut plan = OrganizationPlan {
            output_root: output_root.to_path_buf(),
            mode: self.config.mode,
            created_at: self.now,
            operations: Vec::with_capacity(files.len()),
            conflicts: Vec::new(),
            unchanged: Vec::new(),
        };

        for file in files {
            let file_id = file.file_id();
            if !seen.insert(file_id.clone()) {
                log::warn!("{} listed twice; planning it once", file.url.display());
                continue;
            }
            let assignment = by_file
                .get(&file_id)
                .copied()
                .or_else(|| tree.assignment(&file_id));
            let (category, confidence) = match assignment {
                Some(a) => (self.category_path(tree, a), a.confidence),
                None => (None, 0.0),
            };
            let folder = match &category {
                Some(path) => path.split('/').fold(output_root.to_path_buf(), |acc, seg| {
                    acc.join(sanitize_segment(seg))
                }),
                None => output_root.join(sanitize_segment(&self.config.uncategorized_folder)),
            };
            let requested = folder.join(sanitize_segment(&file.filename));
            if requested == file.url {
                plan.unchanged.push(file_id);
                continue;
            }

            // Sources of this plan count as occupied regardless of ordering.
            let occupied = |path: &Path| -> Option<CollisionReason> {
                if claimed.contains(path) {
                    Some(CollisionReason::PlannedTwice)
                } else if sources.contains(path) || (!self.config.replace_existing && exists(path)) {
                    Some(CollisionReason::ExistingFile)
                } else {
                    None
                }
            };
            let Some((destination, collision)) = resolver.resolve(&requested, occupied) else {
                return Err(OrganizerError::InvalidOperation(format!(
                    "no free name for {} after exhausting collision candidates",
                    requested.display()
                )));
            };
            let replace = self.config.replace_existing
                && collision.is_none()
                && exists(&destination);

            if let Some(c) = &collision {
                plan.conflicts.push(PlanConflict {
                    file_id: file_id.clone(),
                    requested: c.requested.clone(),
                    reason: c.reason,
                    resolved: Some(c.resolved.clone()),
                });
            } else if replace {
                plan.conflicts.push(PlanConflict {
                    file_id: file_id.clone(),
                    requested: destination.clone(),
                    reason: CollisionReason::ExistingFile,
                    resolved: None,
                });
            }

            claimed.insert(destination.clone());
            plan.operations.push(SafeOrganizationOperation {
                file_id,
                source: file.url.clone(),
                destination,
                mode: self.config.mode,
                category,
                confidence,
                collision,
                replace,
            });
        }

        log::info!(
            "planned {} operations ({} conflicts, {} already in place) under {}",
            plan.operations.len(),
            plan.conflicts.len(),
            plan.unchanged.len(),
            output_root.display()
        );
        Ok(plan)
    }

    fn category_path(&self, tree: &TaxonomyTree, assignment: &FileAssignment) -> Option<String> {
        match tree.path_of(assignment.category_id) {
            Ok(path) if !path.is_empty() => Some(path),
            Ok(_) => None,
            Err(err) => {
                log::warn!(
                    "{} points at a missing category ({err}); routing to uncategorized",
                    assignment.filename
                );
                None
            }
        }
    }
}

/// Plans with the default planner clock and live existence checks.
pub fn plan_organization(
    files: &[ScannedFile],
    assignments: &[FileAssignment],
    tree: &TaxonomyTree,
    output_root: &Path,
    config: &OrganizerConfig,
) -> Result<OrganizationPlan> {
    OrganizationPlanner::new(config.clone())?.plan(files, assignments, tree, output_root)
}

/// Makes a category or file name safe to use as one path component.
#[must_use]
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim_end_matches([' ', '.']);
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollisionStyle;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use sift_protocol::AssignmentSource;

    fn planner(config: OrganizerConfig) -> OrganizationPlanner {
        OrganizationPlanner::new(config)
            .unwrap()
            .at(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
    }

    fn assign(tree: &mut TaxonomyTree, file: &ScannedFile, path: &str) -> FileAssignment {
        let node = tree.add_category(path).unwrap();
        FileAssignment::for_file(file, node, 0.9, AssignmentSource::Content)
    }

    #[test]
    fn duplicate_destinations_get_macos_suffix() {
        let mut tree = TaxonomyTree::new("Root");
        let a = ScannedFile::from_path("/inbox/a/report.pdf");
        let b = ScannedFile::from_path("/inbox/b/report.pdf");
        let assignments = vec![assign(&mut tree, &a, "Work"), assign(&mut tree, &b, "Work")];
        let plan = planner(OrganizerConfig::default())
            .plan_with_lookup(&[a, b], &assignments, &tree, Path::new("/out"), |_| false)
            .unwrap();
        assert_eq!(plan.operations[0].destination, PathBuf::from("/out/Work/report.pdf"));
        assert_eq!(
            plan.operations[1].destination,
            PathBuf::from("/out/Work/report (1).pdf")
        );
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].reason, CollisionReason::PlannedTwice);
    }

    #[test]
    fn unassigned_files_route_to_uncategorized() {
        let tree = TaxonomyTree::new("Root");
        let file = ScannedFile::from_path("/inbox/mystery.bin");
        let config = OrganizerConfig {
            uncategorized_folder: "Unsorted".to_string(),
            ..OrganizerConfig::default()
        };
        let plan = planner(config)
            .plan_with_lookup(&[file], &[], &tree, Path::new("/out"), |_| false)
            .unwrap();
        assert_eq!(plan.operations[0].destination, PathBuf::from("/out/Unsorted/mystery.bin"));
        assert_eq!(plan.operations[0].category, None);
    }

    #[test]
    fn existing_destination_is_renamed_unless_replacing() {
        let mut tree = TaxonomyTree::new("Root");
        let file = ScannedFile::from_path("/inbox/notes.txt");
        let assignments = vec![assign(&mut tree, &file, "Docs/Notes")];
        let taken = PathBuf::from("/out/Docs/Notes/notes.txt");
        let config = OrganizerConfig {
            collision_style: CollisionStyle::Numbered,
            ..OrganizerConfig::default()
        };
        let plan = planner(config.clone())
            .plan_with_lookup(&[file.clone()], &assignments, &tree, Path::new("/out"), |p| {
                p == taken
            })
            .unwrap();
        assert_eq!(
            plan.operations[0].destination,
            PathBuf::from("/out/Docs/Notes/notes-1.txt")
        );
        assert!(!plan.operations[0].replace);

        let replacing = OrganizerConfig {
            replace_existing: true,
            ..config
        };
        let plan = planner(replacing)
            .plan_with_lookup(&[file], &assignments, &tree, Path::new("/out"), |p| p == taken)
            .unwrap();
        assert_eq!(plan.operations[0].destination, taken);
        assert!(plan.operations[0].replace);
        assert_eq!(plan.conflicts[0].resolved, None);
    }

    #[test]
    fn file_already_in_place_is_left_alone() {
        let mut tree = TaxonomyTree::new("Root");
        let file = ScannedFile::from_path("/out/Work/plan.md");
        let assignments = vec![assign(&mut tree, &file, "Work")];
        let plan = planner(OrganizerConfig::default())
            .plan_with_lookup(&[file], &assignments, &tree, Path::new("/out"), |_| true)
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 1);
    }

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(sanitize_segment("a/b"), "a_b");
        assert_eq!(sanitize_segment(".."), "_");
        assert_eq!(sanitize_segment("Report. "), "Report");
        assert_eq!(sanitize_segment(".hidden"), ".hidden");
    }
}
