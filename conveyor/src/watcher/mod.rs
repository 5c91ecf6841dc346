//! Directory watcher.
//!
//! Polls the watch directory for newly completed dataset files and emits
//! exactly one [`DatasetArrived`] trigger per file. Partially-written
//! files are suppressed by requiring a (size, mtime) signature to hold
//! across two successive polls; already-processed files are suppressed by
//! a path + content-hash index. Scan failures are logged and backed off,
//! never propagated as pipeline failures.

use crate::config::PipelineConfig;
use crate::core::DatasetArrived;
use crate::errors::ConveyorError;
use crate::utils::sha256_file;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cap on the backoff applied after repeated scan failures.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Shared index of already-processed datasets, path → content digest.
///
/// Cheaply cloneable; the orchestrator holds a handle so a `clear`
/// operation can also forget processed files.
#[derive(Debug, Clone, Default)]
pub struct ProcessedIndex {
    inner: Arc<DashMap<PathBuf, String>>,
}

impl ProcessedIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the path was already processed with this digest.
    #[must_use]
    pub fn contains(&self, path: &Path, digest: &str) -> bool {
        self.inner.get(path).is_some_and(|d| d.value() == digest)
    }

    /// Records a processed path with its content digest.
    pub fn record(&self, path: PathBuf, digest: String) {
        self.inner.insert(path, digest);
    }

    /// Forgets everything, so existing files may trigger again.
    pub fn forget_all(&self) {
        self.inner.clear();
    }

    /// Returns the number of recorded paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Size/mtime pair used for the two-poll stability gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignature {
    len: u64,
    modified: Option<SystemTime>,
}

/// Polls a directory and feeds triggers to the orchestrator inbox.
#[derive(Debug)]
pub struct Watcher {
    watch_dir: PathBuf,
    accepted_extensions: Vec<String>,
    poll_interval: Duration,
    tx: mpsc::Sender<DatasetArrived>,
    processed: ProcessedIndex,
    /// Files seen once, awaiting a second stable observation.
    pending: HashMap<PathBuf, FileSignature>,
    /// Files already decided on, with the signature they had then.
    resolved: HashMap<PathBuf, FileSignature>,
}

impl Watcher {
    /// Creates a watcher feeding the given trigger channel.
    #[must_use]
    pub fn new(config: &PipelineConfig, tx: mpsc::Sender<DatasetArrived>) -> Self {
        Self {
            watch_dir: config.watch_dir.clone(),
            accepted_extensions: config.accepted_extensions.clone(),
            poll_interval: config.poll_interval,
            tx,
            processed: ProcessedIndex::new(),
            pending: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Returns a handle to the processed-file index.
    #[must_use]
    pub fn processed_index(&self) -> ProcessedIndex {
        self.processed.clone()
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_lowercase();
                self.accepted_extensions.iter().any(|a| a == &ext)
            })
    }

    /// Performs one poll and emits triggers for files that became stable.
    ///
    /// Returns the number of triggers emitted. Separated from the polling
    /// loop so tests can drive scans deterministically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the watch directory cannot be read, and
    /// [`ConveyorError::ChannelClosed`] when the orchestrator inbox is
    /// gone.
    pub async fn scan_once(&mut self) -> Result<usize, ConveyorError> {
        let mut entries = tokio::fs::read_dir(&self.watch_dir).await?;
        let mut current: HashMap<PathBuf, FileSignature> = HashMap::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                // File vanished between listing and stat.
                continue;
            };
            if !metadata.is_file() || !self.accepts(&path) {
                continue;
            }
            current.insert(
                path,
                FileSignature {
                    len: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }

        let mut emitted = 0;
        for (path, sig) in &current {
            if self.resolved.get(path) == Some(sig) {
                continue;
            }
            if self.pending.get(path) == Some(sig) {
                // Stable across two polls: the upload is complete.
                self.pending.remove(path);
                let digest = match sha256_file(path) {
                    Ok(digest) => digest,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to hash candidate dataset");
                        continue;
                    }
                };
                if self.processed.contains(path, &digest) {
                    debug!(path = %path.display(), "Dataset already processed; not retriggering");
                } else {
                    self.processed.record(path.clone(), digest);
                    self.tx
                        .send(DatasetArrived::new(path.clone()))
                        .await
                        .map_err(|_| ConveyorError::ChannelClosed)?;
                    debug!(path = %path.display(), "Dataset arrived");
                    emitted += 1;
                }
                self.resolved.insert(path.clone(), *sig);
            } else {
                // First sighting, or the file changed since last poll.
                self.resolved.remove(path);
                self.pending.insert(path.clone(), *sig);
            }
        }

        // Forget bookkeeping for files that disappeared.
        self.pending.retain(|p, _| current.contains_key(p));
        self.resolved.retain(|p, _| current.contains_key(p));

        Ok(emitted)
    }

    /// Runs the polling loop until the orchestrator inbox closes.
    pub async fn run(mut self) {
        let mut consecutive_errors: u32 = 0;
        loop {
            match self.scan_once().await {
                Ok(_) => {
                    consecutive_errors = 0;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(ConveyorError::ChannelClosed) => {
                    debug!("Trigger channel closed; watcher stopping");
                    return;
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = error_backoff(self.poll_interval, consecutive_errors);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Watch directory scan failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Spawns the polling loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Bounded exponential backoff for scan failures.
fn error_backoff(base: Duration, consecutive_errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_errors.min(6).saturating_sub(1));
    base.saturating_mul(factor).min(MAX_ERROR_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        file.sync_all().unwrap();
        path
    }

    fn test_watcher(dir: &Path) -> (Watcher, mpsc::Receiver<DatasetArrived>) {
        let config = PipelineConfig::new(dir, dir.join("out"));
        let (tx, rx) = mpsc::channel(8);
        (Watcher::new(&config, tx), rx)
    }

    #[tokio::test]
    async fn test_trigger_requires_two_stable_polls() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = test_watcher(dir.path());

        let path = write_file(dir.path(), "sales_jan.csv", b"a,b\n1,2\n");

        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.scan_once().await.unwrap(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, path);
    }

    #[tokio::test]
    async fn test_growing_file_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _rx) = test_watcher(dir.path());

        let path = write_file(dir.path(), "big.csv", b"partial");
        assert_eq!(watcher.scan_once().await.unwrap(), 0);

        // Upload still in progress: the signature changed, so the
        // stability clock restarts.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" more data").unwrap();
        file.sync_all().unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 0);

        // Now stable.
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processed_file_does_not_retrigger() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = test_watcher(dir.path());

        write_file(dir.path(), "sales.csv", b"a,b\n");
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        rx.recv().await.unwrap();

        // Re-scans of the unchanged file stay quiet.
        for _ in 0..3 {
            assert_eq!(watcher.scan_once().await.unwrap(), 0);
        }

        // Even re-uploading identical content does not retrigger.
        std::fs::remove_file(dir.path().join("sales.csv")).unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        write_file(dir.path(), "sales.csv", b"a,b\n");
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_changed_content_retriggers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = test_watcher(dir.path());

        write_file(dir.path(), "sales.csv", b"january");
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        rx.recv().await.unwrap();

        write_file(dir.path(), "sales.csv", b"february dataset");
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, dir.path().join("sales.csv"));
    }

    #[tokio::test]
    async fn test_unaccepted_extension_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _rx) = test_watcher(dir.path());

        write_file(dir.path(), "notes.txt", b"not a dataset");
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let config = PipelineConfig::new(&missing, dir.path());
        let (tx, _rx) = mpsc::channel(8);
        let mut watcher = Watcher::new(&config, tx);

        assert!(matches!(
            watcher.scan_once().await,
            Err(ConveyorError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_forget_all_allows_retrigger() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = test_watcher(dir.path());
        let index = watcher.processed_index();

        write_file(dir.path(), "sales.csv", b"a,b\n");
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        rx.recv().await.unwrap();
        assert_eq!(index.len(), 1);

        index.forget_all();
        // The resolved signature is still cached, so force a fresh file.
        std::fs::remove_file(dir.path().join("sales.csv")).unwrap();
        watcher.scan_once().await.unwrap();
        write_file(dir.path(), "sales.csv", b"a,b\n");
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
    }

    #[test]
    fn test_error_backoff_grows_and_caps() {
        let base = Duration::from_secs(2);
        assert_eq!(error_backoff(base, 1), Duration::from_secs(2));
        assert_eq!(error_backoff(base, 2), Duration::from_secs(4));
        assert_eq!(error_backoff(base, 3), Duration::from_secs(8));
        assert_eq!(error_backoff(base, 20), MAX_ERROR_BACKOFF);
    }
}
