//! Property-based testing for snapheap
//!
//! Uses proptest to check invariants over randomly generated trees.

use ::snapheap::filesystem::coerce_root_path;
use ::snapheap::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Generate relative file names: 0-3 directory levels and a `.txt` file
///
/// Directory components never contain a dot, so a file name can never be a
/// directory prefix of another.
fn name_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z]{1,6}", 0..=3),
        "[a-z0-9_]{1,8}\\.txt",
    )
        .prop_map(|(dirs, file)| {
            let mut parts = dirs;
            parts.push(file);
            parts.join("/")
        })
}

/// Small contents drawn from a tiny alphabet so duplicates are common
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'\n']), 0..64)
}

fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(name_strategy(), content_strategy(), 1..24)
}

fn write_tree(root: &Path, tree: &BTreeMap<String, Vec<u8>>) {
    for (name, content) in tree {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn manager_for(temp_dir: &TempDir, workers: usize) -> SnapshotManager {
    let root = coerce_root_path(temp_dir.path());
    SnapshotManager::builder()
        .lister_workers(workers)
        .ingest_workers(workers)
        .build(
            &format!("{}/data", root),
            &format!("{}/snaps", root),
            &format!("{}/heap", root),
        )
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_listing_is_independent_of_worker_count(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        write_tree(temp_dir.path(), &tree);
        let root = coerce_root_path(temp_dir.path());
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());

        for workers in [1, 4, 16] {
            let entries = ParallelTreeLister::new(Arc::clone(&fs))
                .with_workers(workers)
                .list(&root, &CancelToken::new())
                .unwrap();
            let names: Vec<String> = entries
                .iter()
                .map(|e| e.path[root.len() + 1..].to_string())
                .collect();
            let unique: BTreeSet<&String> = names.iter().collect();

            prop_assert_eq!(names.len(), tree.len());
            prop_assert_eq!(unique.len(), tree.len());
            prop_assert!(tree.keys().all(|name| unique.contains(name)));
        }
    }

    #[test]
    fn prop_self_diff_is_all_equal(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        write_tree(&temp_dir.path().join("data"), &tree);
        let manager = manager_for(&temp_dir, 4);

        let (manifest, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();
        let table = manager.diff(&manifest, &manifest);

        prop_assert_eq!(table.len(), tree.len());
        prop_assert!(table.rows().iter().all(|row| row.status == DiffStatus::Equal));
    }

    #[test]
    fn prop_identical_content_is_stored_once(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        write_tree(&temp_dir.path().join("data"), &tree);
        let manager = manager_for(&temp_dir, 4);

        let (manifest, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();

        let distinct: HashSet<&Vec<u8>> = tree.values().collect();
        prop_assert_eq!(manager.heap().len(), distinct.len());

        // Equal bytes always map to equal checksums
        for (a_name, a_content) in &tree {
            for (b_name, b_content) in &tree {
                let a = &manifest.get(a_name).unwrap().checksum;
                let b = &manifest.get(b_name).unwrap().checksum;
                prop_assert_eq!(a_content == b_content, a == b);
            }
        }
    }

    #[test]
    fn prop_restore_round_trip(
        before in tree_strategy(),
        after in tree_strategy(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let data = temp_dir.path().join("data");
        write_tree(&data, &before);
        let manager = manager_for(&temp_dir, 4);
        let (target, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();

        // Replace the tree wholesale
        fs::remove_dir_all(&data).unwrap();
        fs::create_dir_all(&data).unwrap();
        write_tree(&data, &after);

        manager.restore(&target, &RestoreOptions::default()).unwrap();
        let options = SnapshotOptions { persist: false, ..Default::default() };
        let (restored, _) = manager.make_snapshot(&options).unwrap();

        prop_assert!(!manager.diff(&target, &restored).stats().has_changes());
        for (name, content) in &before {
            prop_assert_eq!(&fs::read(data.join(name)).unwrap(), content);
        }
    }
}
