use proptest::prelude::*;
use sift_protocol::{AssignmentSource, FileAssignment, ScannedFile};
use sift_taxonomy::{EditOrigin, TaxonomyTree};
use tempfile::TempDir;

const PATHS: &[&str] = &[
    "Docs",
    "Docs/Invoices",
    "Docs/Invoices/2023",
    "Docs/Contracts",
    "Photos",
    "Photos/2023",
    "Photos/Travel",
    "Music",
];

#[derive(Debug, Clone)]
enum Op {
    Merge(usize, usize),
    Split(usize, String),
    Remove(usize),
    Move(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PATHS.len(), 0..PATHS.len()).prop_map(|(a, b)| Op::Merge(a, b)),
        (0..PATHS.len(), "[A-Z][a-z]{2,6}").prop_map(|(a, name)| Op::Split(a, name)),
        (0..PATHS.len()).prop_map(Op::Remove),
        (0..PATHS.len(), 0..PATHS.len()).prop_map(|(a, b)| Op::Move(a, b)),
    ]
}

fn seeded_tree(files_per_category: usize) -> TaxonomyTree {
    let mut tree = TaxonomyTree::new("Root");
    for (i, path) in PATHS.iter().enumerate() {
        let node = tree.add_category(path).unwrap();
        for j in 0..files_per_category {
            let scanned = ScannedFile::from_path(format!("/inbox/{i}-{j}.bin"));
            tree.assign(FileAssignment::for_file(
                &scanned,
                node,
                0.8,
                AssignmentSource::Content,
            ))
            .unwrap();
        }
    }
    tree
}

proptest! {
    #[test]
    fn structural_edits_never_lose_files(files in 0usize..4, ops in proptest::collection::vec(op(), 1..12)) {
        let mut tree = seeded_tree(files);
        let before = tree.total_file_count();
        for op in ops {
            // Paths may have vanished after earlier edits; refusals are fine.
            let _ = match op {
                Op::Merge(a, b) => match (tree.find(PATHS[a]).ok().flatten(), tree.find(PATHS[b]).ok().flatten()) {
                    (Some(a), Some(b)) => tree.merge_categories(&[a], b, EditOrigin::Automatic).map(|_| ()),
                    _ => Ok(()),
                },
                Op::Split(a, name) => match tree.find(PATHS[a]).ok().flatten() {
                    Some(a) => tree.split_category(a, &[name], EditOrigin::Automatic).map(|_| ()),
                    None => Ok(()),
                },
                Op::Remove(a) => tree.remove_category(PATHS[a]).map(|_| ()),
                Op::Move(a, b) => match (tree.find(PATHS[a]).ok().flatten(), tree.find(PATHS[b]).ok().flatten()) {
                    (Some(a), Some(b)) => tree.move_category(a, b, EditOrigin::User),
                    _ => Ok(()),
                },
            };
            prop_assert_eq!(tree.total_file_count(), before);
            prop_assert!(tree.verify_integrity().is_ok());
        }
    }
}

#[tokio::test]
async fn save_and_load_preserves_structure_and_protection() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".sift").join("taxonomy.json");
    let mut tree = seeded_tree(2);
    let docs = tree.resolve("Docs").unwrap();
    tree.rename("Docs", "Paperwork", EditOrigin::User).unwrap();
    tree.save(&path).await.unwrap();

    let loaded = TaxonomyTree::load(&path).await.unwrap();
    assert_eq!(loaded.total_file_count(), tree.total_file_count());
    assert_eq!(loaded.path_of(docs).unwrap(), "Paperwork");
    assert!(!loaded.can_auto_modify(docs));
    assert_eq!(loaded.statistics(), tree.statistics());
    let mut loaded = loaded;
    let next = loaded.add_category("Fresh").unwrap();
    assert!(next.0 > docs.0);
}
