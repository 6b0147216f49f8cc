//! The per-item transfer state machine.
//!
//! One engine invocation transfers one source item (file, directory tree or
//! symlink) to a destination. Every filesystem failure funnels through the
//! host's error callback (retry/skip/cancel/navigate); interactive decisions
//! and cancellation are cooperative suspension points. Atomicity is per item:
//! a source is never deleted before its destination write fully succeeded.

use async_recursion::async_recursion;
use std::os::unix::fs::MetadataExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::conflict::ConflictAction;
use crate::error::{ErrorAction, Gate, Interrupt, TransferError};
use crate::speed::SpeedTracker;
use crate::symlink::{self, LinkRewrite, SymlinkPolicy};

/// Chunk size for the streaming copy path. Small enough that the pause gate
/// stays responsive.
pub const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Copy,
    Move,
}

/// Batch-wide policy for colliding destination paths.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    Overwrite,
    Skip,
    #[default]
    Ask,
}

/// Decisions the engine needs from its host during one transfer.
///
/// The controller implements this on top of the UI-facing
/// [`Host`](crate::controller::Host) contract, adding remembered-choice and
/// progress-aggregation mediation.
#[allow(async_fn_in_trait)]
pub trait EngineHooks {
    /// Announce the next file or symlink being transferred.
    async fn file_progress(&self, src: &std::path::Path, dst: &std::path::Path) -> Gate;
    /// Incremental byte progress during a streaming copy; the reply doubles
    /// as the pause/resume gate.
    async fn byte_progress(&self, copied: u64, total: u64) -> Gate;
    /// A filesystem operation failed; decide how to proceed.
    async fn on_error(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        error: &TransferError,
    ) -> ErrorAction;
    /// Resolve a destination collision. Only invoked when the batch policy
    /// is [`OverwritePolicy::Ask`].
    async fn ask_overwrite(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> ConflictAction;
    /// Per-symlink remapping decision, only when the session policy is
    /// [`SymlinkPolicy::Ask`]. `None` cancels the transfer.
    async fn ask_symlink_target(
        &self,
        link: &std::path::Path,
        target: &std::path::Path,
    ) -> Option<LinkRewrite>;
}

/// Per-item operation counts, summed by the controller across the batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub files_skipped: usize,
    /// Whole items moved via an atomic rename.
    pub items_moved: usize,
    /// Source files/links/directories deleted after a copy+delete move.
    pub sources_removed: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            files_skipped: self.files_skipped + other.files_skipped,
            items_moved: self.items_moved + other.items_moved,
            sources_removed: self.sources_removed + other.sources_removed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            symlinks created: {}\n\
            directories created: {}\n\
            files skipped: {}\n\
            items moved: {}\n\
            sources removed: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.symlinks_created,
            self.directories_created,
            self.files_skipped,
            self.items_moved,
            self.sources_removed,
        )
    }
}

/// Outcome of one item (or one child during directory recursion).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ItemStatus {
    Done,
    Skipped,
}

enum Step<T> {
    Continue(T),
    Skip,
}

enum Recovery {
    Retry,
    Skip,
}

pub struct Engine<'a, H: EngineHooks> {
    hooks: &'a H,
    speed: &'a mut SpeedTracker,
    mode: TransferMode,
    overwrite_policy: OverwritePolicy,
    symlink_policy: SymlinkPolicy,
    summary: Summary,
    // roots of the whole item transfer, carried through the recursion so
    // symlink "internal" status is computed against the original trees
    src_root: std::path::PathBuf,
    dst_root: std::path::PathBuf,
    // failure injection for the move paths, which cannot be reached
    // naturally on a single filesystem
    #[cfg(test)]
    forced_rename_errno: Option<i32>,
    #[cfg(test)]
    forced_unlink_errno: Option<i32>,
}

impl<'a, H: EngineHooks> Engine<'a, H> {
    pub fn new(
        hooks: &'a H,
        speed: &'a mut SpeedTracker,
        mode: TransferMode,
        overwrite_policy: OverwritePolicy,
        symlink_policy: SymlinkPolicy,
    ) -> Self {
        Self {
            hooks,
            speed,
            mode,
            overwrite_policy,
            symlink_policy,
            summary: Summary::default(),
            src_root: std::path::PathBuf::new(),
            dst_root: std::path::PathBuf::new(),
            #[cfg(test)]
            forced_rename_errno: None,
            #[cfg(test)]
            forced_unlink_errno: None,
        }
    }

    /// Counts accumulated so far; valid both after success and after an
    /// interrupt.
    #[must_use]
    pub fn summary(&self) -> Summary {
        self.summary
    }

    /// Transfer one source item into `dst` (a destination directory, or the
    /// explicit destination path when no directory exists there).
    #[instrument(skip(self))]
    pub async fn transfer_one(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<ItemStatus, Interrupt> {
        tracing::debug!("transfer {:?} -> {:?}", src, dst);
        let src_md = match self
            .retry_io(src, dst, || async move {
                tokio::fs::symlink_metadata(src)
                    .await
                    .map_err(|error| TransferError::io("failed reading metadata from", src, error))
            })
            .await?
        {
            Step::Continue(md) => md,
            Step::Skip => return Ok(self.skip()),
        };
        // copying into an existing directory targets dst/basename(src)
        let dst = match tokio::fs::metadata(dst).await {
            Ok(dst_md) if dst_md.is_dir() => match src.file_name() {
                Some(name) => dst.join(name),
                None => {
                    let error = TransferError::io(
                        "source path has no file name",
                        src,
                        std::io::Error::from(std::io::ErrorKind::InvalidInput),
                    );
                    return match self.recover(src, dst, &error).await? {
                        // retrying cannot produce a name either
                        Recovery::Retry | Recovery::Skip => Ok(self.skip()),
                    };
                }
            },
            _ => dst.to_path_buf(),
        };
        // self-copy check: same file by device+inode. reported, not ignored,
        // and retry is offered even though it will fail again unchanged.
        loop {
            let same = match tokio::fs::symlink_metadata(&dst).await {
                Ok(dst_md) => dst_md.dev() == src_md.dev() && dst_md.ino() == src_md.ino(),
                Err(_) => false,
            };
            if !same {
                break;
            }
            let error = TransferError::SelfCopy {
                path: src.to_path_buf(),
            };
            match self.recover(src, &dst, &error).await? {
                Recovery::Retry => continue,
                Recovery::Skip => return Ok(self.skip()),
            }
        }
        // a directory must not be copied into itself (symlinks to
        // directories are copied as links and cannot recurse)
        if src_md.is_dir() {
            loop {
                let src_canon = tokio::fs::canonicalize(src)
                    .await
                    .unwrap_or_else(|_| src.to_path_buf());
                let dst_canon = match dst.parent() {
                    Some(parent) => match tokio::fs::canonicalize(parent).await {
                        Ok(parent) => match dst.file_name() {
                            Some(name) => parent.join(name),
                            None => parent,
                        },
                        Err(_) => dst.clone(),
                    },
                    None => dst.clone(),
                };
                if !dst_canon.starts_with(&src_canon) {
                    break;
                }
                let error = TransferError::DirectoryIntoItself {
                    src: src.to_path_buf(),
                    dst: dst.clone(),
                };
                match self.recover(src, &dst, &error).await? {
                    Recovery::Retry => continue,
                    Recovery::Skip => return Ok(self.skip()),
                }
            }
        }
        self.src_root = if src_md.is_dir() {
            tokio::fs::canonicalize(src)
                .await
                .unwrap_or_else(|_| src.to_path_buf())
        } else {
            src.to_path_buf()
        };
        self.dst_root = dst.clone();
        self.transfer_node(src, &dst, true).await
    }

    /// Steps 5-7 of the per-item state machine, applied to the item itself
    /// and to every child during directory recursion.
    #[async_recursion(?Send)]
    async fn transfer_node(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        attempt_rename: bool,
    ) -> Result<ItemStatus, Interrupt> {
        let src_md = match self
            .retry_io(src, dst, || async move {
                tokio::fs::symlink_metadata(src)
                    .await
                    .map_err(|error| TransferError::io("failed reading metadata from", src, error))
            })
            .await?
        {
            Step::Continue(md) => md,
            Step::Skip => return Ok(self.skip()),
        };
        // conflict check
        let mut dst = dst.to_path_buf();
        let mut overwrite = false;
        let mut append = false;
        let mut dst_exists = tokio::fs::symlink_metadata(&dst).await.is_ok();
        while dst_exists {
            match self.overwrite_policy {
                OverwritePolicy::Overwrite => {
                    overwrite = true;
                    break;
                }
                OverwritePolicy::Skip => {
                    tracing::debug!("destination {:?} exists, skipping", &dst);
                    return Ok(self.skip());
                }
                OverwritePolicy::Ask => match self.hooks.ask_overwrite(src, &dst).await {
                    ConflictAction::Overwrite => {
                        overwrite = true;
                        break;
                    }
                    ConflictAction::Skip => return Ok(self.skip()),
                    ConflictAction::Rename(name) => {
                        let parent = dst
                            .parent()
                            .map(std::path::Path::to_path_buf)
                            .unwrap_or_default();
                        dst = parent.join(name);
                        // the substituted name may collide as well
                        dst_exists = tokio::fs::symlink_metadata(&dst).await.is_ok();
                        continue;
                    }
                    ConflictAction::Append => {
                        append = true;
                        break;
                    }
                    ConflictAction::Cancel => return Err(Interrupt::Cancelled),
                },
            }
        }
        // move fast path: a rename ends the operation with no delete step.
        // renames cannot merge into an existing directory, and append mode
        // must write into the existing destination.
        if attempt_rename
            && self.mode == TransferMode::Move
            && !append
            && !(src_md.is_dir() && dst_exists)
        {
            loop {
                match self.rename(src, &dst).await {
                    Ok(()) => {
                        tracing::debug!("renamed {:?} -> {:?}", src, &dst);
                        self.summary.items_moved += 1;
                        return Ok(ItemStatus::Done);
                    }
                    Err(error) if error.raw_os_error() == Some(libc::EXDEV) => {
                        // different devices: fall through to copy+delete
                        tracing::debug!("rename {:?} crosses devices, copying", src);
                        break;
                    }
                    Err(error) => {
                        let error = TransferError::io("failed renaming", src, error);
                        match self.recover(src, &dst, &error).await? {
                            Recovery::Retry => continue,
                            Recovery::Skip => return Ok(self.skip()),
                        }
                    }
                }
            }
        }
        if src_md.is_symlink() {
            self.copy_symlink(src, &dst, overwrite).await
        } else if src_md.is_dir() {
            self.copy_dir(src, &dst, overwrite || append).await
        } else if src_md.is_file() {
            self.copy_file(src, &dst, src_md.len(), overwrite, append).await
        } else {
            // sockets, FIFOs and device nodes cannot be faithfully copied
            tracing::debug!("skipping special file {:?}", src);
            Ok(ItemStatus::Skipped)
        }
    }

    async fn copy_symlink(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        overwrite: bool,
    ) -> Result<ItemStatus, Interrupt> {
        if let Step::Skip = self.make_parent_dirs(src, dst).await? {
            return Ok(self.skip());
        }
        match self.hooks.file_progress(src, dst).await {
            Gate::Continue | Gate::Retry => {}
            Gate::Skip => return Ok(self.skip()),
            Gate::Navigate(path) => return Err(Interrupt::Navigate(path)),
            Gate::Cancel => return Err(Interrupt::Cancelled),
        }
        let link_value = match self
            .retry_io(src, dst, || async move {
                tokio::fs::read_link(src)
                    .await
                    .map_err(|error| TransferError::io("failed reading symlink", src, error))
            })
            .await?
        {
            Step::Continue(value) => value,
            Step::Skip => return Ok(self.skip()),
        };
        let resolved_target = match tokio::fs::canonicalize(src).await {
            Ok(resolved) => resolved,
            // dangling link: resolve lexically so remapping still works
            Err(_) => symlink::lexical_resolve(src, &link_value),
        };
        let is_internal = resolved_target.starts_with(&self.src_root);
        let rewrite = match self.symlink_policy.as_rewrite() {
            Some(rewrite) => rewrite,
            None => match self.hooks.ask_symlink_target(src, &link_value).await {
                Some(rewrite) => rewrite,
                None => return Err(Interrupt::Cancelled),
            },
        };
        let link_dir = dst.parent().unwrap_or(&self.dst_root).to_path_buf();
        let same_device = match (
            tokio::fs::metadata(&resolved_target).await,
            tokio::fs::metadata(&link_dir).await,
        ) {
            (Ok(target_md), Ok(dest_md)) => target_md.dev() == dest_md.dev(),
            // unknown (e.g. dangling target): keep the relative form
            _ => true,
        };
        let new_value = symlink::resolve_link(
            rewrite,
            &link_value,
            &resolved_target,
            is_internal,
            &self.src_root,
            &self.dst_root,
            dst,
            same_device,
        );
        loop {
            match tokio::fs::symlink(&new_value, dst).await {
                Ok(()) => break,
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists && overwrite => {
                    match self
                        .retry_io(src, dst, || async move {
                            remove_existing(dst).await
                        })
                        .await?
                    {
                        Step::Continue(()) => continue,
                        Step::Skip => return Ok(self.skip()),
                    }
                }
                Err(error) => {
                    let error = TransferError::io("failed creating symlink", dst, error);
                    match self.recover(src, dst, &error).await? {
                        Recovery::Retry => continue,
                        Recovery::Skip => return Ok(self.skip()),
                    }
                }
            }
        }
        self.summary.symlinks_created += 1;
        if self.mode == TransferMode::Move {
            if let Step::Continue(()) = self
                .retry_io(src, dst, || async move {
                    tokio::fs::remove_file(src)
                        .await
                        .map_err(|error| TransferError::io("failed removing source link", src, error))
                })
                .await?
            {
                self.summary.sources_removed += 1;
            }
        }
        Ok(ItemStatus::Done)
    }

    async fn copy_dir(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        overwrite: bool,
    ) -> Result<ItemStatus, Interrupt> {
        // directories are created before any file beneath them is written
        loop {
            match tokio::fs::symlink_metadata(dst).await {
                // merge into the existing directory
                Ok(dst_md) if dst_md.is_dir() => break,
                Ok(_) if overwrite => {
                    // a file or symlink in the way of a directory
                    match self
                        .retry_io(src, dst, || async move { remove_existing(dst).await })
                        .await?
                    {
                        Step::Continue(()) => continue,
                        Step::Skip => return Ok(self.skip()),
                    }
                }
                _ => {}
            }
            match tokio::fs::create_dir_all(dst).await {
                Ok(()) => {
                    self.summary.directories_created += 1;
                    break;
                }
                Err(error) => {
                    let error = TransferError::io("cannot create directory", dst, error);
                    match self.recover(src, dst, &error).await? {
                        Recovery::Retry => continue,
                        Recovery::Skip => return Ok(self.skip()),
                    }
                }
            }
        }
        let mut entries = match self
            .retry_io(src, dst, || async move {
                tokio::fs::read_dir(src)
                    .await
                    .map_err(|error| TransferError::io("cannot open directory for reading", src, error))
            })
            .await?
        {
            Step::Continue(entries) => entries,
            Step::Skip => return Ok(self.skip()),
        };
        // children are processed in filesystem enumeration order, one at a
        // time; the source directory may only be deleted when every child
        // made it over
        let mut all_moved = true;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    let error = TransferError::io("failed traversing directory", src, error);
                    match self.recover(src, dst, &error).await? {
                        Recovery::Retry => continue,
                        Recovery::Skip => {
                            all_moved = false;
                            break;
                        }
                    }
                }
            };
            let entry_path = entry.path();
            let child_dst = dst.join(entry.file_name());
            match self.transfer_node(&entry_path, &child_dst, false).await? {
                ItemStatus::Done => {}
                ItemStatus::Skipped => all_moved = false,
            }
        }
        drop(entries);
        if self.mode == TransferMode::Move {
            if !all_moved {
                // a child stayed behind, so this directory and every
                // ancestor keep their source, with no removal attempted
                return Ok(ItemStatus::Skipped);
            }
            match self
                .retry_io(src, dst, || async move {
                    tokio::fs::remove_dir(src)
                        .await
                        .map_err(|error| {
                            TransferError::io("failed removing source directory", src, error)
                        })
                })
                .await?
            {
                Step::Continue(()) => self.summary.sources_removed += 1,
                Step::Skip => return Ok(ItemStatus::Skipped),
            }
        }
        Ok(ItemStatus::Done)
    }

    async fn copy_file(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        len: u64,
        overwrite: bool,
        append: bool,
    ) -> Result<ItemStatus, Interrupt> {
        if let Step::Skip = self.make_parent_dirs(src, dst).await? {
            return Ok(self.skip());
        }
        match self.hooks.file_progress(src, dst).await {
            Gate::Continue | Gate::Retry => {}
            Gate::Skip => return Ok(self.skip()),
            Gate::Navigate(path) => return Err(Interrupt::Navigate(path)),
            Gate::Cancel => return Err(Interrupt::Cancelled),
        }
        // overwriting a directory or symlink with a file needs an explicit
        // removal; plain files are truncated by the copy itself
        if overwrite && !append {
            if let Ok(dst_md) = tokio::fs::symlink_metadata(dst).await {
                if !dst_md.is_file() {
                    match self
                        .retry_io(src, dst, || async move { remove_existing(dst).await })
                        .await?
                    {
                        Step::Continue(()) => {}
                        Step::Skip => return Ok(self.skip()),
                    }
                }
            }
        }
        let status = if append {
            self.stream_file(src, dst, len, true).await?
        } else if self.speed.should_stream(len) {
            self.stream_file(src, dst, len, false).await?
        } else {
            self.fast_copy(src, dst).await?
        };
        if status == ItemStatus::Skipped {
            return Ok(status);
        }
        if self.mode == TransferMode::Move {
            // the destination write fully succeeded; only now may the
            // source go away
            let engine = &*self;
            if let Step::Continue(()) = engine
                .retry_io(src, dst, || async move { engine.remove_source_file(src).await })
                .await?
            {
                self.summary.sources_removed += 1;
            }
        }
        Ok(ItemStatus::Done)
    }

    /// Single whole-file copy for files small enough that chunking overhead
    /// is not worth it; completion is reported as one 100% progress event.
    async fn fast_copy(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<ItemStatus, Interrupt> {
        loop {
            let start = std::time::Instant::now();
            match tokio::fs::copy(src, dst).await {
                Ok(copied) => {
                    self.speed.record(copied, start.elapsed());
                    self.summary.files_copied += 1;
                    self.summary.bytes_copied += copied;
                    return match self.hooks.byte_progress(copied, copied).await {
                        // the file is already complete; retry and skip have
                        // nothing left to apply to
                        Gate::Continue | Gate::Retry | Gate::Skip => Ok(ItemStatus::Done),
                        Gate::Navigate(path) => Err(Interrupt::Navigate(path)),
                        Gate::Cancel => Err(Interrupt::Cancelled),
                    };
                }
                Err(error) => {
                    let error = TransferError::io("failed copying", src, error);
                    match self.recover(src, dst, &error).await? {
                        Recovery::Retry => continue,
                        Recovery::Skip => {
                            discard_partial(dst, false, 0).await;
                            return Ok(self.skip());
                        }
                    }
                }
            }
        }
    }

    /// Chunked copy reporting byte progress after every chunk. In append
    /// mode the destination is never truncated; a failed or skipped append
    /// rolls the destination back to its original length.
    async fn stream_file(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        total: u64,
        append: bool,
    ) -> Result<ItemStatus, Interrupt> {
        let original_len = if append {
            match tokio::fs::symlink_metadata(dst).await {
                Ok(dst_md) => dst_md.len(),
                Err(_) => 0,
            }
        } else {
            0
        };
        'attempt: loop {
            let start = std::time::Instant::now();
            let mut reader = match self
                .retry_io(src, dst, || async move {
                    tokio::fs::File::open(src)
                        .await
                        .map_err(|error| TransferError::io("failed opening for reading", src, error))
                })
                .await?
            {
                Step::Continue(reader) => reader,
                Step::Skip => return Ok(self.skip()),
            };
            let mut writer = match self
                .retry_io(src, dst, || async move {
                    let mut options = tokio::fs::OpenOptions::new();
                    options.write(true).create(true);
                    if append {
                        options.append(true);
                    } else {
                        options.truncate(true);
                    }
                    options
                        .open(dst)
                        .await
                        .map_err(|error| TransferError::io("failed opening for writing", dst, error))
                })
                .await?
            {
                Step::Continue(writer) => writer,
                Step::Skip => return Ok(self.skip()),
            };
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut copied: u64 = 0;
            loop {
                let read = match reader.read(&mut buffer).await {
                    Ok(read) => read,
                    Err(error) => {
                        let error = TransferError::io("failed reading", src, error);
                        match self.recover(src, dst, &error).await? {
                            Recovery::Retry => {
                                drop(reader);
                                drop(writer);
                                discard_partial(dst, append, original_len).await;
                                continue 'attempt;
                            }
                            Recovery::Skip => {
                                drop(reader);
                                drop(writer);
                                discard_partial(dst, append, original_len).await;
                                return Ok(self.skip());
                            }
                        }
                    }
                };
                if read == 0 {
                    break;
                }
                if let Err(error) = writer.write_all(&buffer[..read]).await {
                    let error = TransferError::io("failed writing", dst, error);
                    match self.recover(src, dst, &error).await? {
                        Recovery::Retry => {
                            drop(reader);
                            drop(writer);
                            discard_partial(dst, append, original_len).await;
                            continue 'attempt;
                        }
                        Recovery::Skip => {
                            drop(reader);
                            drop(writer);
                            discard_partial(dst, append, original_len).await;
                            return Ok(self.skip());
                        }
                    }
                }
                copied += read as u64;
                // strictly ordered, monotonically increasing progress; also
                // the pause/resume suspension point
                match self.hooks.byte_progress(copied, total).await {
                    Gate::Continue => {}
                    Gate::Retry => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        continue 'attempt;
                    }
                    Gate::Skip => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        return Ok(self.skip());
                    }
                    Gate::Navigate(path) => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        return Err(Interrupt::Navigate(path));
                    }
                    Gate::Cancel => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        return Err(Interrupt::Cancelled);
                    }
                }
            }
            if let Err(error) = writer.flush().await {
                let error = TransferError::io("failed writing", dst, error);
                match self.recover(src, dst, &error).await? {
                    Recovery::Retry => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        continue 'attempt;
                    }
                    Recovery::Skip => {
                        drop(reader);
                        drop(writer);
                        discard_partial(dst, append, original_len).await;
                        return Ok(self.skip());
                    }
                }
            }
            self.speed.record(copied, start.elapsed());
            self.summary.files_copied += 1;
            self.summary.bytes_copied += copied;
            return Ok(ItemStatus::Done);
        }
    }

    async fn make_parent_dirs(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<Step<()>, Interrupt> {
        let Some(parent) = dst.parent() else {
            return Ok(Step::Continue(()));
        };
        if parent.as_os_str().is_empty() {
            return Ok(Step::Continue(()));
        }
        self.retry_io(src, dst, || async move {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| TransferError::io("cannot create directory", parent, error))
        })
        .await
    }

    async fn rename(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(errno) = self.forced_rename_errno {
            return Err(std::io::Error::from_raw_os_error(errno));
        }
        tokio::fs::rename(src, dst).await
    }

    async fn remove_source_file(&self, src: &std::path::Path) -> Result<(), TransferError> {
        #[cfg(test)]
        if let Some(errno) = self.forced_unlink_errno {
            return Err(TransferError::io(
                "failed removing source file",
                src,
                std::io::Error::from_raw_os_error(errno),
            ));
        }
        tokio::fs::remove_file(src)
            .await
            .map_err(|error| TransferError::io("failed removing source file", src, error))
    }

    /// Run `op`, funneling failures through the host error callback until it
    /// succeeds, is skipped, or aborts the transfer.
    async fn retry_io<T, Fut, Op>(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        mut op: Op,
    ) -> Result<Step<T>, Interrupt>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransferError>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(Step::Continue(value)),
                Err(error) => match self.recover(src, dst, &error).await? {
                    Recovery::Retry => continue,
                    Recovery::Skip => return Ok(Step::Skip),
                },
            }
        }
    }

    async fn recover(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        error: &TransferError,
    ) -> Result<Recovery, Interrupt> {
        tracing::debug!("transfer {:?} -> {:?} failed: {:#}", src, dst, &error);
        match self.hooks.on_error(src, dst, error).await {
            ErrorAction::Retry => Ok(Recovery::Retry),
            ErrorAction::Skip => Ok(Recovery::Skip),
            ErrorAction::Cancel => Err(Interrupt::Cancelled),
            ErrorAction::Navigate(path) => Err(Interrupt::Navigate(path)),
        }
    }

    fn skip(&mut self) -> ItemStatus {
        self.summary.files_skipped += 1;
        ItemStatus::Skipped
    }
}

/// Remove whatever sits at `path`, directory trees included.
async fn remove_existing(path: &std::path::Path) -> Result<(), TransferError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        // already gone
        Err(_) => return Ok(()),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|error| TransferError::io("failed removing", path, error))
    } else {
        tokio::fs::remove_file(path)
            .await
            .map_err(|error| TransferError::io("failed removing", path, error))
    }
}

/// Best-effort cleanup of a half-written destination.
async fn discard_partial(dst: &std::path::Path, append: bool, original_len: u64) {
    if append {
        if let Ok(file) = tokio::fs::OpenOptions::new().write(true).open(dst).await {
            if let Err(error) = file.set_len(original_len).await {
                tracing::debug!("failed rolling back append to {:?}: {}", dst, &error);
            }
        }
    } else if let Err(error) = tokio::fs::remove_file(dst).await {
        tracing::debug!("failed removing partial {:?}: {}", dst, &error);
    }
}
