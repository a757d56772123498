//! Main test module for snapheap
//!
//! This module includes all test suites:
//! - Integration tests for complex scenarios
//! - Chaos tests for resilience
//! - Property-based tests for invariants
//! - Edge cases around names and tree shapes
//! - Stress tests for concurrent use

pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::integration::SnapTestHarness;
    use ::snapheap::*;
    use std::fs;

    #[test]
    fn test_empty_directories_are_not_recorded() {
        let harness = SnapTestHarness::new();
        fs::create_dir_all(harness.data().join("a/b/c")).unwrap();
        fs::create_dir_all(harness.data().join("empty")).unwrap();

        let (manifest, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let harness = SnapTestHarness::new();
        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "file{with}braces.txt",
            "file*star?.txt",
        ];

        let mut created = Vec::new();
        for name in &special_names {
            // Skip names the OS refuses
            if fs::write(harness.data().join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }

        let (snapshot, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();
        assert_eq!(snapshot.len(), created.len());

        for name in &created {
            fs::remove_file(harness.data().join(name)).unwrap();
        }
        harness
            .manager
            .restore(&snapshot, &RestoreOptions::default())
            .unwrap();

        for name in &created {
            let content = fs::read_to_string(harness.data().join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let harness = SnapTestHarness::new();
        let unicode_names = vec![
            "файл.txt",
            "文件.txt",
            "ファイル.txt",
            "αρχείο.txt",
            "🚀🌟💾.txt",
        ];

        let mut created = Vec::new();
        for name in &unicode_names {
            if fs::write(harness.data().join(name), format!("Unicode content: {}", name)).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            return;
        }

        let (snapshot, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();

        // Names survive the manifest round trip through disk
        let persisted = harness
            .manager
            .read_snapshot(&SnapshotSelector::Latest)
            .unwrap();
        assert_eq!(persisted, snapshot);

        for name in &created {
            fs::remove_file(harness.data().join(name)).unwrap();
        }
        harness
            .manager
            .restore(&persisted, &RestoreOptions::default())
            .unwrap();

        for name in &created {
            let content = fs::read_to_string(harness.data().join(name)).unwrap();
            assert_eq!(content, format!("Unicode content: {}", name));
        }
    }

    #[test]
    fn test_empty_and_large_files() {
        let harness = SnapTestHarness::with_builder(
            SnapshotManager::builder().block_size(4096).ingest_workers(2),
        );
        let large: Vec<u8> = (0..3 * 4096 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(harness.data().join("empty.bin"), b"").unwrap();
        fs::write(harness.data().join("large.bin"), &large).unwrap();

        let (snapshot, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();
        assert_eq!(
            snapshot.get("empty.bin").unwrap().checksum.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(
            snapshot.get("large.bin").unwrap().checksum,
            Some(heap::compute_checksum(&large))
        );

        fs::write(harness.data().join("large.bin"), b"truncated").unwrap();
        harness
            .manager
            .restore(&snapshot, &RestoreOptions::default())
            .unwrap();
        assert_eq!(fs::read(harness.data().join("large.bin")).unwrap(), large);
    }

    #[test]
    fn test_restore_creates_missing_directories() {
        let harness = SnapTestHarness::new();
        fs::create_dir_all(harness.data().join("deep/er/still")).unwrap();
        fs::write(harness.data().join("deep/er/still/leaf.txt"), "leaf").unwrap();

        let (snapshot, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();
        fs::remove_dir_all(harness.data().join("deep")).unwrap();

        let result = harness
            .manager
            .restore(&snapshot, &RestoreOptions::default())
            .unwrap();
        assert_eq!(result.files_restored, 1);
        assert_eq!(
            fs::read_to_string(harness.data().join("deep/er/still/leaf.txt")).unwrap(),
            "leaf"
        );
    }

    #[test]
    fn test_symlinks_are_skipped() {
        #[cfg(unix)]
        {
            let harness = SnapTestHarness::new();
            fs::write(harness.data().join("target.txt"), "Target content").unwrap();
            std::os::unix::fs::symlink(
                harness.data().join("target.txt"),
                harness.data().join("link.txt"),
            )
            .unwrap();

            let (snapshot, _) = harness
                .manager
                .make_snapshot(&SnapshotOptions::default())
                .unwrap();
            assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["target.txt"]);
        }
    }
}

#[cfg(test)]
mod stress_tests {
    use crate::integration::{ProjectConfig, SnapTestHarness};
    use ::snapheap::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_snapshots_share_one_manager() {
        let mut harness = SnapTestHarness::new();
        let files = harness.generate_project(&ProjectConfig {
            max_depth: 2,
            dirs_per_level: 3,
            files_per_dir: 10,
            ..Default::default()
        });
        let manager = Arc::new(harness.manager);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let options = SnapshotOptions {
                        persist: false,
                        ..Default::default()
                    };
                    manager.make_snapshot(&options).unwrap().0
                })
            })
            .collect();

        let manifests: Vec<Manifest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for manifest in &manifests {
            assert_eq!(manifest.len(), files.len());
            assert_eq!(manifest, &manifests[0]);
        }
    }

    #[test]
    fn test_many_small_files() {
        let harness = SnapTestHarness::with_builder(
            SnapshotManager::builder().lister_workers(16).ingest_workers(8),
        );
        for dir in 0..20 {
            let dir_path = harness.data().join(format!("d{:02}", dir));
            std::fs::create_dir_all(&dir_path).unwrap();
            for file in 0..50 {
                std::fs::write(dir_path.join(format!("f{:02}", file)), format!("{}", file)).unwrap();
            }
        }

        let (manifest, _) = harness
            .manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap();
        assert_eq!(manifest.len(), 1000);
        // 50 distinct contents repeated across directories
        assert_eq!(harness.manager.heap().len(), 50);
    }
}
