use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const FILES: &[&str] = &["invoice_2024_03.pdf", "invoice_2024_04.pdf", "beach_photo.jpg"];

fn sift() -> Command {
    let mut cmd = Command::cargo_bin("sift").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn inbox() -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in FILES {
        fs::write(dir.path().join(name), format!("contents of {name}")).unwrap();
    }
    dir
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn files_under(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().is_some_and(|n| n == ".sift") {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Some(name) = path.file_name() {
                names.push(name.to_string_lossy().to_string());
            }
        }
    }
    names.sort();
    names
}

fn sorted_files() -> Vec<String> {
    let mut names: Vec<String> = FILES.iter().map(|s| s.to_string()).collect();
    names.sort();
    names
}

#[test]
fn scan_lists_every_file_as_json() {
    let dir = inbox();
    let value = json_stdout(sift().args(["scan", "--json"]).arg(dir.path()));

    let files = value["files"].as_array().unwrap();
    assert_eq!(files.len(), FILES.len());
    assert_eq!(value["summary"]["files"], FILES.len());
    assert!(files
        .iter()
        .any(|f| f.as_str().unwrap().ends_with("beach_photo.jpg")));
}

#[test]
fn classify_places_every_file() {
    let dir = inbox();
    let value = json_stdout(sift().args(["classify", "--json"]).arg(dir.path()));

    assert_eq!(value["assignments"].as_array().unwrap().len(), FILES.len());
    assert!(value["failures"].as_array().unwrap().is_empty());
    assert!(dir.path().join(".sift").is_dir());
}

#[test]
fn dry_run_plans_without_touching_files() {
    let dir = inbox();
    let out = TempDir::new().unwrap();
    let value = json_stdout(
        sift()
            .args(["organize", "--json", "--dry-run", "--output"])
            .arg(out.path())
            .arg(dir.path()),
    );

    assert_eq!(value["operations"].as_array().unwrap().len(), FILES.len());
    assert_eq!(files_under(dir.path()), sorted_files());
    assert!(files_under(out.path()).is_empty());
}

#[test]
fn organize_then_undo_restores_the_inbox() {
    let dir = inbox();
    let out = TempDir::new().unwrap();

    let organized = json_stdout(
        sift()
            .args(["organize", "--json", "--mode", "move", "--output"])
            .arg(out.path())
            .arg(dir.path()),
    );
    assert_eq!(organized["success_count"], FILES.len());
    assert!(files_under(dir.path()).is_empty());
    assert_eq!(files_under(out.path()), sorted_files());

    json_stdout(
        sift()
            .args(["undo", "--json", "--output"])
            .arg(out.path())
            .arg(dir.path()),
    );
    assert_eq!(files_under(dir.path()), sorted_files());
    assert!(files_under(out.path()).is_empty());
}

#[test]
fn copy_mode_leaves_the_sources_in_place() {
    let dir = inbox();
    let out = TempDir::new().unwrap();

    sift()
        .args(["organize", "--quiet", "--mode", "copy", "--output"])
        .arg(out.path())
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("3 succeeded"));

    assert_eq!(files_under(dir.path()), sorted_files());
    assert_eq!(files_under(out.path()), sorted_files());
}

#[test]
fn undo_without_history_reports_an_error_code() {
    let dir = inbox();
    let out = TempDir::new().unwrap();
    let output = sift()
        .args(["undo", "--json", "--output"])
        .arg(out.path())
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["code"], "nothing_to_undo");
}

#[test]
fn unknown_suggestion_is_reported_as_json() {
    let dir = inbox();
    let output = sift()
        .args(["taxonomy", "approve-merge", "42", "--json"])
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["code"], "suggestion_not_found");
    assert!(value["hint"].as_str().unwrap().contains("pending"));
}

#[test]
fn user_categories_survive_and_show_in_the_tree() {
    let dir = inbox();
    sift()
        .args(["taxonomy", "add", "--quiet"])
        .arg(dir.path())
        .arg("Finance/Invoices")
        .assert()
        .success();
    sift()
        .args(["taxonomy", "rename", "--quiet"])
        .arg(dir.path())
        .args(["Finance", "Money"])
        .assert()
        .success()
        .stdout(contains("Money"));

    let tree = json_stdout(sift().args(["taxonomy", "show", "--json"]).arg(dir.path()));
    let paths: Vec<&str> = tree
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"Money/Invoices"));
    assert!(tree
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["user_edited"] == true));
}

#[test]
fn feedback_moves_a_classified_file() {
    let dir = inbox();
    json_stdout(sift().args(["classify", "--json"]).arg(dir.path()));

    let outcome = json_stdout(
        sift()
            .args(["feedback", "--json", "--category", "Travel/Photos", "--file"])
            .arg(dir.path().join("beach_photo.jpg"))
            .arg(dir.path()),
    );
    assert_eq!(outcome["category_path"], "Travel/Photos");

    let stats = json_stdout(sift().args(["stats", "--json"]).arg(dir.path()));
    assert_eq!(stats["taxonomy"]["total_files"], FILES.len());
}
