//! Chaos testing for snapheap
//!
//! Injects listing and read failures, cancellation in the middle of
//! ingestion, heap corruption and concurrent writers sharing one heap, then
//! checks that the heap never holds a partial or mislabelled blob.

use ::snapheap::filesystem::coerce_root_path;
use ::snapheap::heap::compute_checksum;
use ::snapheap::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

/// Local file system with switchable failures
///
/// - directories named `broken` fail to list
/// - directories named `exploding` panic when listed
/// - files whose name contains `unreadable` fail to open
/// - with a trip token set, every read cancels it after delivering a block
#[derive(Debug)]
pub struct ChaosFileSystem {
    inner: LocalFileSystem,
    enabled: AtomicBool,
    trip: Option<CancelToken>,
}

impl ChaosFileSystem {
    pub fn new() -> Self {
        Self {
            inner: LocalFileSystem::new(),
            enabled: AtomicBool::new(true),
            trip: None,
        }
    }

    /// Cancel `token` as soon as any file content is read
    pub fn tripping(token: CancelToken) -> Self {
        Self {
            trip: Some(token),
            ..Self::new()
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Reader that cancels a token after its first non-empty read
struct TrippingReader {
    inner: Box<dyn Read + Send>,
    token: CancelToken,
}

impl Read for TrippingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.token.cancel();
        }
        Ok(n)
    }
}

impl FileSystem for ChaosFileSystem {
    fn backend(&self) -> &str {
        self.inner.backend()
    }

    fn list(&self, dir: &str) -> io::Result<Vec<DirEntry>> {
        if self.active() && dir.ends_with("/broken") {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected list failure"));
        }
        if self.active() && dir.ends_with("/exploding") {
            panic!("injected list panic in {}", dir);
        }
        self.inner.list(dir)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        if self.active() && path.contains("unreadable") {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected read failure"));
        }
        let reader = self.inner.open_read(path)?;
        match (&self.trip, self.active()) {
            (Some(token), true) => Ok(Box::new(TrippingReader {
                inner: reader,
                token: token.clone(),
            })),
            _ => Ok(reader),
        }
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        self.inner.open_write(path)
    }

    fn mkdirs(&self, path: &str) -> io::Result<()> {
        self.inner.mkdirs(path)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn rename(&self, src: &str, dst: &str) -> io::Result<()> {
        self.inner.rename(src, dst)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.glob(pattern)
    }
}

/// Chaos scenario: a data tree, a snapshot root and a heap under one temp dir
pub struct ChaosEnv {
    pub temp_dir: TempDir,
    pub root: String,
}

impl ChaosEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("data")).unwrap();
        let root = coerce_root_path(temp_dir.path());
        Self { temp_dir, root }
    }

    pub fn data(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn heap_dir(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("heap")
    }

    pub fn manager(&self, builder: SnapshotManagerBuilder) -> SnapshotManager {
        builder
            .build(
                &format!("{}/data", self.root),
                &format!("{}/snaps", self.root),
                &format!("{}/heap", self.root),
            )
            .unwrap()
    }

    pub fn write(&self, name: &str, content: &[u8]) {
        let path = self.data().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Assert every blob decompresses to content hashing to its own name and
/// that no temp file was left behind; returns the number of blobs
pub fn assert_heap_consistent(heap_dir: &Path) -> usize {
    let temp = heap_dir.join("temp");
    if temp.exists() {
        let leftovers: Vec<_> = fs::read_dir(&temp).unwrap().collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    let mut blobs = 0;
    for entry in walkdir::WalkDir::new(heap_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let checksum = file_name.trim_end_matches(".gz");

        let mut content = Vec::new();
        GzDecoder::new(fs::File::open(entry.path()).unwrap())
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(compute_checksum(&content), checksum, "blob {} is corrupt", file_name);
        blobs += 1;
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_ingestion_leaves_no_partial_blob() {
        let env = ChaosEnv::new();
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..8 {
            let mut content = vec![0u8; 4096 + i * 512];
            rng.fill(&mut content[..]);
            env.write(&format!("blob_{}.bin", i), &content);
        }

        let token = CancelToken::new();
        let chaos = Arc::new(ChaosFileSystem::tripping(token.clone()));
        let manager = env.manager(
            SnapshotManager::builder()
                .file_system(Arc::clone(&chaos) as Arc<dyn FileSystem>)
                .cancel_token(token.clone())
                .block_size(256)
                .ingest_workers(4),
        );

        let err = manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(manager.list_snapshot_paths().unwrap().is_empty());
        assert_heap_consistent(&env.heap_dir());

        // A fresh manager over the same heap finishes the job
        chaos.set_enabled(false);
        let retry = env.manager(
            SnapshotManager::builder()
                .file_system(chaos as Arc<dyn FileSystem>)
                .ingest_workers(4),
        );
        let (manifest, _) = retry.make_snapshot(&SnapshotOptions::default()).unwrap();
        assert_eq!(manifest.len(), 8);
        assert_eq!(assert_heap_consistent(&env.heap_dir()), 8);
    }

    #[test]
    fn test_ingestion_failure_is_aggregated_and_retryable() {
        let env = ChaosEnv::new();
        env.write("good1.txt", b"first");
        env.write("nested/good2.txt", b"second");
        env.write("nested/unreadable.txt", b"third");

        let chaos = Arc::new(ChaosFileSystem::new());
        let manager = env.manager(
            SnapshotManager::builder()
                .file_system(Arc::clone(&chaos) as Arc<dyn FileSystem>)
                .ingest_workers(3),
        );

        let err = manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::Ingestion(_)));
        assert!(err.is_recoverable());
        assert_eq!(err.failures().len(), 1);
        assert!(err.to_string().contains("nested/unreadable.txt"));

        // Content of the readable files is kept
        assert_eq!(manager.heap().len(), 2);
        assert!(manager.list_snapshot_paths().unwrap().is_empty());

        chaos.set_enabled(false);
        let (manifest, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manager.heap().len(), 3);
        info!("Recovered after injected read failure");
    }

    #[test]
    fn test_listing_failure_is_aggregated() {
        let env = ChaosEnv::new();
        env.write("ok/a.txt", b"a");
        env.write("broken/b.txt", b"b");
        env.write("other/broken/c.txt", b"c");

        let chaos = Arc::new(ChaosFileSystem::new());
        let manager = env.manager(
            SnapshotManager::builder()
                .file_system(Arc::clone(&chaos) as Arc<dyn FileSystem>)
                .lister_workers(3),
        );

        let err = manager
            .make_snapshot(&SnapshotOptions::default())
            .unwrap_err();
        assert!(matches!(err, SnapError::Listing(_)));
        assert_eq!(err.failures().len(), 2);
        assert!(err
            .failures()
            .iter()
            .all(|f| matches!(f, SnapError::ListDirectory { .. })));

        chaos.set_enabled(false);
        let (manifest, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();
        assert_eq!(manifest.len(), 3);
    }

    #[test]
    fn test_cancelled_listing_is_interrupted() {
        let env = ChaosEnv::new();
        env.write("a/b/c.txt", b"c");

        let token = CancelToken::new();
        token.cancel();
        let lister = ParallelTreeLister::new(Arc::new(LocalFileSystem::new())).with_workers(4);
        let result = lister.list(&format!("{}/data", env.root), &token);
        assert!(matches!(result, Err(SnapError::Interrupted)));
    }

    #[test]
    fn test_panicking_listing_worker_does_not_hang() {
        let env = ChaosEnv::new();
        env.write("ok/a.txt", b"a");
        env.write("exploding/b.txt", b"b");

        let root = format!("{}/data", env.root);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let lister = ParallelTreeLister::new(Arc::new(ChaosFileSystem::new())).with_workers(2);
            let _ = tx.send(lister.list(&root, &CancelToken::new()).is_ok());
        });

        // The panic surfaces to the caller instead of leaving join waiting
        let outcome = rx.recv_timeout(Duration::from_secs(30));
        assert!(
            !matches!(outcome, Err(mpsc::RecvTimeoutError::Timeout)),
            "listing did not finish after a worker panicked"
        );
        assert!(handle.join().is_err());
    }

    #[test]
    fn test_corrupted_blob_is_detected_on_verified_restore() {
        let env = ChaosEnv::new();
        env.write("doc.txt", b"original content");
        let manager = env.manager(SnapshotManager::builder().ingest_workers(2));
        let (snapshot, _) = manager.make_snapshot(&SnapshotOptions::default()).unwrap();

        // Replace the blob with valid gzip of other bytes
        let checksum = snapshot.get("doc.txt").unwrap().checksum.clone().unwrap();
        let blob_path = manager.heap().object_path(&checksum);
        let mut encoder = GzEncoder::new(fs::File::create(&blob_path).unwrap(), Compression::default());
        encoder.write_all(b"tampered").unwrap();
        encoder.finish().unwrap();

        env.write("doc.txt", b"edited");
        let options = RestoreOptions {
            persist_safety_snapshot: false,
            verify_hashes: true,
            ..Default::default()
        };
        let err = manager.restore(&snapshot, &options).unwrap_err();
        assert!(matches!(err, SnapError::Restore(_)));
        match &err.failures()[0] {
            SnapError::RestoreFile { name, source } => {
                assert_eq!(name, "doc.txt");
                assert!(matches!(**source, SnapError::ChecksumMismatch { .. }));
            }
            other => panic!("unexpected failure: {}", other),
        }

        // The file on disk is left as it was
        assert_eq!(fs::read_to_string(env.data().join("doc.txt")).unwrap(), "edited");
        assert!(!env.data().join("doc.txt.partial").exists());
    }

    #[test]
    fn test_concurrent_managers_share_one_heap() {
        let temp_dir = TempDir::new().unwrap();
        let root = coerce_root_path(temp_dir.path());
        let mut rng = StdRng::seed_from_u64(99);

        // Both trees draw from the same pool of contents
        let pool: Vec<Vec<u8>> = (0..12)
            .map(|i| {
                let mut content = vec![0u8; 100 + i * 37];
                rng.fill(&mut content[..]);
                content
            })
            .collect();
        for tree in ["left", "right"] {
            for i in 0..30 {
                let path = temp_dir.path().join(tree).join(format!("f{}.bin", i));
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, &pool[rng.random_range(0..pool.len())]).unwrap();
            }
        }

        // Heaps are opened up front; only the snapshots race
        let managers: Vec<SnapshotManager> = ["left", "right"]
            .into_iter()
            .map(|tree| {
                SnapshotManager::builder()
                    .ingest_workers(4)
                    .build(
                        &format!("{}/{}", root, tree),
                        &format!("{}/snaps_{}", root, tree),
                        &format!("{}/heap", root),
                    )
                    .unwrap()
            })
            .collect();
        let handles: Vec<_> = managers
            .into_iter()
            .map(|manager| {
                thread::spawn(move || manager.make_snapshot(&SnapshotOptions::default()).unwrap().0)
            })
            .collect();
        let manifests: Vec<Manifest> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let blobs = assert_heap_consistent(&temp_dir.path().join("heap"));
        assert!(blobs <= pool.len());

        let heap = Heap::open_dir(
            Arc::new(LocalFileSystem::new()),
            &format!("{}/heap", root),
            4,
            &CancelToken::new(),
        )
        .unwrap();
        for manifest in &manifests {
            for record in manifest {
                assert!(heap.contains(record.checksum.as_deref().unwrap()));
            }
        }
    }
}
