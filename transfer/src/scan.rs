//! Pre-flight sizing walk.
//!
//! The scan produces an estimate used for progress percentages and to decide
//! whether a symlink-remapping policy must be negotiated. It is best-effort:
//! read and stat failures degrade the estimate instead of aborting, and the
//! walk never mutates the filesystem, so aborting it requires no cleanup.

use async_recursion::async_recursion;
use tracing::instrument;

/// Aggregate counts for one scanned source item.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanResult {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    /// Symlinks whose resolved target lies inside the tree being scanned.
    pub internal_symlinks: u64,
}

impl std::ops::Add for ScanResult {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files: self.files + other.files,
            dirs: self.dirs + other.dirs,
            bytes: self.bytes + other.bytes,
            internal_symlinks: self.internal_symlinks + other.internal_symlinks,
        }
    }
}

impl std::fmt::Display for ScanResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} files, {} directories, {}",
            self.files,
            self.dirs,
            bytesize::ByteSize(self.bytes)
        )
    }
}

/// Returned by the observer on every directory entered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    /// Stop the walk; the caller keeps whatever totals were accumulated.
    Abort,
}

/// Progress callback for the scan. Invoked once per directory entered with
/// the running totals; returning [`ScanControl::Abort`] stops the walk.
#[allow(async_fn_in_trait)]
pub trait ScanObserver {
    async fn enter_dir(&self, current: &std::path::Path, totals: &ScanResult) -> ScanControl;
}

/// Observer that never aborts, for callers that only want the totals.
pub struct NoScanProgress;

impl ScanObserver for NoScanProgress {
    async fn enter_dir(&self, _: &std::path::Path, _: &ScanResult) -> ScanControl {
        ScanControl::Continue
    }
}

/// Whether `link`'s resolved target lies inside `root`.
///
/// Dangling links resolve to nothing and are never internal.
pub(crate) async fn is_internal_symlink(link: &std::path::Path, root: &std::path::Path) -> bool {
    match tokio::fs::canonicalize(link).await {
        Ok(resolved) => resolved.starts_with(root),
        Err(_) => false,
    }
}

/// Walk `path` recursively and accumulate sizing totals.
///
/// A symlink counts as one file (tagged internal when its target resolves
/// inside the scanned root); sockets, FIFOs and device nodes are skipped
/// since they cannot be faithfully copied.
#[instrument(skip(observer))]
pub async fn scan<O: ScanObserver>(path: &std::path::Path, observer: &O) -> ScanResult {
    let mut totals = ScanResult::default();
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::debug!("scan: failed reading metadata from {:?}: {}", path, &error);
            return totals;
        }
    };
    if metadata.is_symlink() {
        totals.files = 1;
        // a single symlink cannot contain its own target, but links back into
        // the path itself still count as internal
        if is_internal_symlink(path, path).await {
            totals.internal_symlinks = 1;
        }
        return totals;
    }
    if metadata.is_file() {
        totals.files = 1;
        totals.bytes = metadata.len();
        return totals;
    }
    if !metadata.is_dir() {
        tracing::debug!("scan: skipping special file {:?}", path);
        return totals;
    }
    let root = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf());
    walk(&root, path, &mut totals, observer).await;
    totals
}

/// Returns false when the observer aborted the walk.
#[async_recursion(?Send)]
async fn walk<O: ScanObserver>(
    root: &std::path::Path,
    dir: &std::path::Path,
    totals: &mut ScanResult,
    observer: &O,
) -> bool {
    if observer.enter_dir(dir, totals).await == ScanControl::Abort {
        tracing::debug!("scan: aborted at {:?}", dir);
        return false;
    }
    totals.dirs += 1;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            tracing::debug!("scan: cannot open directory {:?}: {}", dir, &error);
            return true;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                tracing::debug!("scan: failed traversing {:?}: {}", dir, &error);
                break;
            }
        };
        let entry_path = entry.path();
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(error) => {
                tracing::debug!("scan: failed to stat {:?}: {}", &entry_path, &error);
                continue;
            }
        };
        if file_type.is_symlink() {
            totals.files += 1;
            if is_internal_symlink(&entry_path, root).await {
                totals.internal_symlinks += 1;
            }
        } else if file_type.is_dir() {
            if !walk(root, &entry_path, totals, observer).await {
                return false;
            }
        } else if file_type.is_file() {
            totals.files += 1;
            totals.bytes += match entry.metadata().await {
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            };
        }
        // sockets, FIFOs and device nodes are silently skipped
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn scan_counts_the_fixture_tree() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let totals = scan(&tmp_dir.join("foo"), &NoScanProgress).await;
        // 5 regular files of 1 byte each plus 2 symlinks
        assert_eq!(totals.files, 7);
        assert_eq!(totals.dirs, 3);
        assert_eq!(totals.bytes, 5);
        // 5.txt and 6.txt both point back into foo
        assert_eq!(totals.internal_symlinks, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn scan_single_file() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let totals = scan(&tmp_dir.join("foo").join("0.txt"), &NoScanProgress).await;
        assert_eq!(
            totals,
            ScanResult {
                files: 1,
                dirs: 0,
                bytes: 1,
                internal_symlinks: 0
            }
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn scan_single_symlink_counts_as_file() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let totals = scan(&tmp_dir.join("foo").join("baz").join("5.txt"), &NoScanProgress).await;
        assert_eq!(totals.files, 1);
        assert_eq!(totals.bytes, 0);
        // resolves to ../bar/2.txt which is outside the scanned path
        assert_eq!(totals.internal_symlinks, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_path_degrades_to_zero() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let totals = scan(&tmp_dir.join("nope"), &NoScanProgress).await;
        assert_eq!(totals, ScanResult::default());
        Ok(())
    }

    struct AbortAfter {
        remaining: std::cell::Cell<u64>,
    }

    impl ScanObserver for AbortAfter {
        async fn enter_dir(&self, _: &std::path::Path, _: &ScanResult) -> ScanControl {
            if self.remaining.get() == 0 {
                return ScanControl::Abort;
            }
            self.remaining.set(self.remaining.get() - 1);
            ScanControl::Continue
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn abort_keeps_partial_totals() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let observer = AbortAfter {
            remaining: std::cell::Cell::new(1),
        };
        let totals = scan(&tmp_dir.join("foo"), &observer).await;
        // only the root directory was entered before the abort
        assert_eq!(totals.dirs, 1);
        assert!(totals.files < 7);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn totals_add_per_source() {
        let a = ScanResult {
            files: 1,
            dirs: 2,
            bytes: 3,
            internal_symlinks: 0,
        };
        let b = ScanResult {
            files: 10,
            dirs: 20,
            bytes: 30,
            internal_symlinks: 1,
        };
        assert_eq!(
            a + b,
            ScanResult {
                files: 11,
                dirs: 22,
                bytes: 33,
                internal_symlinks: 1
            }
        );
    }
}
