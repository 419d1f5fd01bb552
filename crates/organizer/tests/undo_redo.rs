use pretty_assertions::assert_eq;
use sift_organizer::{
    acquire_organize_lock, CancellationFlag, OrganizationPlanner, OrganizerConfig, OrganizerError,
    SafeFileOrganizer,
};
use sift_protocol::{AssignmentSource, FileAssignment, ScannedFile};
use sift_taxonomy::TaxonomyTree;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    inbox: PathBuf,
    out: PathBuf,
    files: Vec<ScannedFile>,
    assignments: Vec<FileAssignment>,
    tree: TaxonomyTree,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let inbox = tmp.path().join("inbox");
    let out = tmp.path().join("out");
    std::fs::create_dir_all(inbox.join("a")).unwrap();
    std::fs::create_dir_all(inbox.join("b")).unwrap();
    std::fs::create_dir_all(out.join("Work")).unwrap();
    std::fs::write(out.join("Work/report.pdf"), b"already here").unwrap();

    let mut tree = TaxonomyTree::new("Root");
    let work = tree.add_category("Work").unwrap();
    let photos = tree.add_category("Media/Photos").unwrap();
    let mut files = Vec::new();
    let mut assignments = Vec::new();
    for (rel, body, node) in [
        ("a/report.pdf", "first report", work),
        ("b/report.pdf", "second report", work),
        ("a/beach.jpg", "jpeg", photos),
    ] {
        let path = inbox.join(rel);
        std::fs::write(&path, body).unwrap();
        let file = ScannedFile::from_path(&path).with_metadata(body.len() as u64, 0);
        assignments.push(FileAssignment::for_file(&file, node, 0.9, AssignmentSource::Content));
        files.push(file);
    }
    let loose = inbox.join("notes.bin");
    std::fs::write(&loose, b"??").unwrap();
    files.push(ScannedFile::from_path(&loose));

    Fixture {
        _tmp: tmp,
        inbox,
        out,
        files,
        assignments,
        tree,
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn execute_never_overwrites_and_undo_restores_exact_paths() {
    let fx = fixture();
    let config = OrganizerConfig::default();
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&fx.files, &fx.assignments, &fx.tree, &fx.out)
        .unwrap();
    let destinations: Vec<_> = plan.operations.iter().map(|op| &op.destination).collect();
    let unique: std::collections::HashSet<_> = destinations.iter().collect();
    assert_eq!(unique.len(), destinations.len());

    let organizer = SafeFileOrganizer::open(&fx.out, config).await.unwrap();
    let result = organizer
        .execute(&plan, None, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(result.success_count, 4);
    assert_eq!(result.collision_count, 2);
    assert!(result.is_complete());

    assert_eq!(read(&fx.out.join("Work/report.pdf")), "already here");
    assert_eq!(read(&fx.out.join("Work/report (1).pdf")), "first report");
    assert_eq!(read(&fx.out.join("Work/report (2).pdf")), "second report");
    assert_eq!(read(&fx.out.join("Media/Photos/beach.jpg")), "jpeg");
    assert!(fx.out.join("Uncategorized/notes.bin").exists());
    assert!(!fx.inbox.join("a/report.pdf").exists());

    let undone = organizer.undo_last_operation().await.unwrap();
    assert_eq!(undone.success_count, 4);
    assert_eq!(read(&fx.inbox.join("a/report.pdf")), "first report");
    assert_eq!(read(&fx.inbox.join("b/report.pdf")), "second report");
    assert!(fx.inbox.join("notes.bin").exists());
    assert!(!fx.out.join("Media").exists());
    assert!(!fx.out.join("Uncategorized").exists());
    assert_eq!(read(&fx.out.join("Work/report.pdf")), "already here");
    assert_eq!(organizer.movement_log().lock().await.entries().count(), 0);

    assert!(matches!(
        organizer.undo_last_operation().await,
        Err(OrganizerError::NothingToUndo)
    ));
}

#[tokio::test]
async fn redo_reapplies_and_history_survives_restart() {
    let fx = fixture();
    let config = OrganizerConfig::default();
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&fx.files, &fx.assignments, &fx.tree, &fx.out)
        .unwrap();
    {
        let organizer = SafeFileOrganizer::open(&fx.out, config.clone()).await.unwrap();
        organizer
            .execute(&plan, None, &CancellationFlag::new())
            .await
            .unwrap();
        organizer.undo_last_operation().await.unwrap();
        assert!(organizer.can_redo().await);
        let redone = organizer.redo().await.unwrap();
        assert_eq!(redone.success_count, 4);
        assert_eq!(read(&fx.out.join("Work/report (1).pdf")), "first report");
    }

    let reopened = SafeFileOrganizer::open(&fx.out, config).await.unwrap();
    assert_eq!(reopened.history().await.len(), 1);
    assert!(matches!(reopened.redo().await, Err(OrganizerError::NothingToRedo)));
    reopened.undo_last_operation().await.unwrap();
    assert_eq!(read(&fx.inbox.join("b/report.pdf")), "second report");
    assert!(!fx.out.join("Work/report (2).pdf").exists());
}

#[tokio::test]
async fn copy_mode_undo_removes_copies_only() {
    let fx = fixture();
    let config = OrganizerConfig {
        mode: "copy".parse().unwrap(),
        ..OrganizerConfig::default()
    };
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&fx.files, &fx.assignments, &fx.tree, &fx.out)
        .unwrap();
    let organizer = SafeFileOrganizer::in_memory(&fx.out, config).unwrap();
    organizer
        .execute(&plan, None, &CancellationFlag::new())
        .await
        .unwrap();
    assert!(fx.inbox.join("a/report.pdf").exists());
    assert!(fx.out.join("Media/Photos/beach.jpg").exists());

    organizer.undo_last_operation().await.unwrap();
    assert!(fx.inbox.join("a/report.pdf").exists());
    assert!(!fx.out.join("Media/Photos/beach.jpg").exists());
    assert_eq!(read(&fx.out.join("Work/report.pdf")), "already here");
}

#[tokio::test]
async fn undo_is_refused_when_logging_was_disabled() {
    let fx = fixture();
    let config = OrganizerConfig {
        enable_undo: false,
        ..OrganizerConfig::default()
    };
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&fx.files, &fx.assignments, &fx.tree, &fx.out)
        .unwrap();
    let organizer = SafeFileOrganizer::in_memory(&fx.out, config).unwrap();
    let result = organizer
        .execute(&plan, None, &CancellationFlag::new())
        .await
        .unwrap();
    assert!(!result.logged);
    assert!(matches!(
        organizer.undo_last_operation().await,
        Err(OrganizerError::UndoNotEnabled)
    ));

    organizer.set_undo_enabled(true);
    assert!(matches!(
        organizer.undo_last_operation().await,
        Err(OrganizerError::UndoNotEnabled)
    ));
}

#[tokio::test]
async fn another_holder_of_the_output_root_makes_execute_busy() {
    let fx = fixture();
    let config = OrganizerConfig::default();
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&fx.files, &fx.assignments, &fx.tree, &fx.out)
        .unwrap();
    let organizer = SafeFileOrganizer::in_memory(&fx.out, config)
        .unwrap()
        .with_lock_wait(Duration::from_millis(50));

    let held = acquire_organize_lock(&fx.out, Duration::ZERO).await.unwrap();
    let busy = organizer.execute(&plan, None, &CancellationFlag::new()).await;
    assert!(matches!(busy, Err(OrganizerError::Busy(_))));
    assert!(fx.inbox.join("a/report.pdf").exists());

    drop(held);
    let result = organizer
        .execute(&plan, None, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(result.success_count, 4);
}

#[tokio::test]
async fn tight_deadlines_leave_nothing_on_disk_that_undo_cannot_see() {
    let tmp = TempDir::new().unwrap();
    let inbox = tmp.path().join("inbox");
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&inbox).unwrap();
    let mut tree = TaxonomyTree::new("Root");
    let bulk = tree.add_category("Bulk").unwrap();
    let body = vec![7u8; 4 * 1024 * 1024];
    let mut files = Vec::new();
    let mut assignments = Vec::new();
    for i in 0..6 {
        let path = inbox.join(format!("blob{i}.bin"));
        std::fs::write(&path, &body).unwrap();
        let file = ScannedFile::from_path(&path).with_metadata(body.len() as u64, 0);
        assignments.push(FileAssignment::for_file(&file, bulk, 0.9, AssignmentSource::Content));
        files.push(file);
    }
    let config = OrganizerConfig {
        mode: "copy".parse().unwrap(),
        op_timeout_ms: 1,
        ..OrganizerConfig::default()
    };
    let plan = OrganizationPlanner::new(config.clone())
        .unwrap()
        .plan(&files, &assignments, &tree, &out)
        .unwrap();
    let organizer = SafeFileOrganizer::in_memory(&out, config).unwrap();
    let result = organizer
        .execute(&plan, None, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(result.success_count + result.failure_count, 6);

    let logged = organizer.movement_log().lock().await.entries().count();
    let on_disk = std::fs::read_dir(out.join("Bulk"))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(logged, result.success_count);
    assert_eq!(on_disk, logged);

    if logged > 0 {
        organizer.undo_last_operation().await.unwrap();
    }
    let leftovers = std::fs::read_dir(out.join("Bulk"))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
    for file in &files {
        assert_eq!(std::fs::metadata(&file.url).unwrap().len(), body.len() as u64);
    }
}
