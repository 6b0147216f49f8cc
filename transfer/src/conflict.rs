//! Destination-conflict resolution contract.
//!
//! Collisions are not errors: they are routed through this contract so the
//! host can ask the user. The controller mediates "remembered" choices; the
//! engine only ever sees the reduced [`ConflictAction`].

/// What the host answered for a colliding destination path.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OverwriteChoice {
    Overwrite,
    Skip,
    /// Use the carried file name instead (context-specific, never remembered).
    Rename(String),
    /// Accept the suggested "name (n).ext" candidate.
    RenameN,
    /// Append the source contents to the existing destination file.
    Append,
    /// Keep whichever of source/destination is larger.
    KeepLargest,
    /// Keep whichever of source/destination is newer.
    KeepNewest,
    Cancel,
}

impl OverwriteChoice {
    /// Whether this choice may be applied automatically to subsequent
    /// conflicts in the same transfer.
    #[must_use]
    pub fn rememberable(&self) -> bool {
        !matches!(self, OverwriteChoice::Rename(_) | OverwriteChoice::Cancel)
    }
}

/// Host reply to an overwrite prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverwriteReply {
    pub choice: OverwriteChoice,
    /// Resolve subsequent conflicts in this transfer the same way without
    /// prompting.
    pub remember: bool,
}

impl OverwriteReply {
    #[must_use]
    pub fn once(choice: OverwriteChoice) -> Self {
        Self {
            choice,
            remember: false,
        }
    }
}

/// Conflict resolution as consumed by the engine, after the controller has
/// applied remembered choices and folded the metadata-comparing variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictAction {
    Overwrite,
    Skip,
    /// Substitute this file name under the same destination directory.
    Rename(std::ffi::OsString),
    /// Mark append mode; applies to file copies only.
    Append,
    Cancel,
}

/// Smallest `n >= 1` such that `"stem (n).ext"` does not exist next to
/// `dst` at call time.
pub async fn compute_rename_n(dst: &std::path::Path) -> std::path::PathBuf {
    let stem = dst
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = dst.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = dst.parent().unwrap_or_else(|| std::path::Path::new(""));
    let mut n: u64 = 1;
    loop {
        let name = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(name);
        // symlink_metadata so a dangling link still counts as taken
        if tokio::fs::symlink_metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn rename_candidate_starts_at_one() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.join("foo").join("0.txt");
        let candidate = compute_rename_n(&dst).await;
        assert_eq!(candidate, tmp_dir.join("foo").join("0 (1).txt"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rename_candidate_skips_taken_names() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.join("foo").join("0.txt");
        tokio::fs::write(tmp_dir.join("foo").join("0 (1).txt"), "x").await?;
        tokio::fs::write(tmp_dir.join("foo").join("0 (2).txt"), "x").await?;
        let candidate = compute_rename_n(&dst).await;
        assert_eq!(candidate, tmp_dir.join("foo").join("0 (3).txt"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rename_candidate_without_extension() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.join("foo").join("bar");
        let candidate = compute_rename_n(&dst).await;
        assert_eq!(candidate, tmp_dir.join("foo").join("bar (1)"));
        Ok(())
    }

    #[test]
    fn rename_and_cancel_are_never_remembered() {
        assert!(!OverwriteChoice::Rename("x".into()).rememberable());
        assert!(!OverwriteChoice::Cancel.rememberable());
        assert!(OverwriteChoice::Overwrite.rememberable());
        assert!(OverwriteChoice::RenameN.rememberable());
        assert!(OverwriteChoice::KeepNewest.rememberable());
    }
}
