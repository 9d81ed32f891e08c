//! Architecture gate: order status is only ever written through the
//! validated transition method, never assigned directly.

use std::fs;
use std::path::{Path, PathBuf};

const ALLOWED_STATUS_WRITERS: &[&str] = &["src/domain/order.rs"];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

#[test]
fn status_assignments_are_limited_to_the_transition_method() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let src_root = repo_root.join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if ALLOWED_STATUS_WRITERS.iter().any(|allowed| *allowed == rel) {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains(".status = ") && !trimmed.contains("==") {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "order status written outside the transition method:\n{}",
        offenders.join("\n")
    );
}
