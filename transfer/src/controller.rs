//! Batch orchestration on top of the engine.
//!
//! The controller runs one transfer session end to end: the pre-flight scan,
//! the (optional) symlink-policy negotiation, and one engine invocation per
//! top-level source. It owns the session state the engine must not know
//! about: aggregate progress, the redraw throttle, the remembered overwrite
//! choice and the shared speed tracker.

use std::cell::{Cell, RefCell};

use crate::conflict::{self, ConflictAction, OverwriteChoice, OverwriteReply};
use crate::engine::{
    Engine, EngineHooks, ItemStatus, OverwritePolicy, Summary, TransferMode,
};
use crate::error::{ErrorAction, Gate, Interrupt, TransferError};
use crate::scan::{self, ScanControl, ScanObserver, ScanResult};
use crate::speed::SpeedTracker;
use crate::symlink::{LinkRewrite, SymlinkPolicy};

/// Progress redraws are throttled to at most one per interval.
pub const REDRAW_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// One batch of items to transfer, as assembled by the panes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TransferRequest {
    pub mode: TransferMode,
    /// Selected items; relative paths are resolved against `source_cwd`.
    pub sources: Vec<std::path::PathBuf>,
    /// Working directory of the pane the selection came from.
    pub source_cwd: std::path::PathBuf,
    /// Destination directory (or explicit destination path for a single
    /// source when no directory exists there).
    pub target_path: std::path::PathBuf,
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,
}

/// Aggregate progress snapshot handed to the host on (throttled) redraws.
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    /// Source path of the item currently being transferred.
    pub current: Option<std::path::PathBuf>,
    /// Fully processed files; the file in flight is not counted.
    pub files_done: u64,
    /// Scanned total; an aborted scan makes this an undercount.
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Session-average throughput, once any bytes have moved.
    pub bytes_per_sec: Option<f64>,
}

/// Everything the host needs to render an overwrite dialog.
#[derive(Clone, Debug)]
pub struct OverwritePrompt {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
    pub src_size: Option<u64>,
    pub src_mtime: Option<std::time::SystemTime>,
    pub dst_size: Option<u64>,
    pub dst_mtime: Option<std::time::SystemTime>,
    /// Precomputed "name (n).ext" suggestion for [`OverwriteChoice::RenameN`].
    pub rename_candidate: std::path::PathBuf,
}

impl OverwritePrompt {
    /// Stat both sides and compute the rename suggestion. Stat failures leave
    /// the corresponding fields empty rather than failing the prompt.
    pub async fn probe(src: &std::path::Path, dst: &std::path::Path) -> Self {
        let src_md = tokio::fs::metadata(src).await.ok();
        let dst_md = tokio::fs::metadata(dst).await.ok();
        Self {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            src_size: src_md.as_ref().map(std::fs::Metadata::len),
            src_mtime: src_md.as_ref().and_then(|md| md.modified().ok()),
            dst_size: dst_md.as_ref().map(std::fs::Metadata::len),
            dst_mtime: dst_md.as_ref().and_then(|md| md.modified().ok()),
            rename_candidate: conflict::compute_rename_n(dst).await,
        }
    }
}

/// How one session ended. Every variant carries the counts accumulated up to
/// that point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(Summary),
    Cancelled(Summary),
    /// Aborted with a request to relocate the UI cursor to the carried path.
    Navigate(std::path::PathBuf, Summary),
}

impl TransferOutcome {
    #[must_use]
    pub fn summary(&self) -> Summary {
        match self {
            TransferOutcome::Completed(summary)
            | TransferOutcome::Cancelled(summary)
            | TransferOutcome::Navigate(_, summary) => *summary,
        }
    }
}

/// Everything the controller needs from the surrounding UI.
///
/// All methods are suspension points: the controller does not proceed until
/// the host resolves the pending decision.
#[allow(async_fn_in_trait)]
pub trait Host {
    /// Polled on every directory the scan enters; `true` aborts the scan
    /// (only the scan - the transfer proceeds with partial totals).
    fn scan_cancel_requested(&self) -> bool;
    /// Throttled scan-phase redraw with running aggregate totals.
    async fn scan_progress(&self, current: &std::path::Path, totals: &ScanResult);
    /// Throttled transfer-phase redraw.
    async fn progress(&self, update: &ProgressUpdate);
    /// Checked on every progress callback; anything but
    /// [`Gate::Continue`] interrupts the current file or the transfer.
    async fn pause_gate(&self) -> Gate;
    async fn report_error(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        error: &TransferError,
    ) -> ErrorAction;
    async fn ask_overwrite(&self, prompt: &OverwritePrompt) -> OverwriteReply;
    /// Session-wide symlink policy, asked once when the scan found internal
    /// symlinks. `None` cancels the whole transfer before any mutation.
    async fn ask_symlink_policy(&self) -> Option<SymlinkPolicy>;
    /// Per-symlink decision under [`SymlinkPolicy::Ask`]. `None` cancels.
    async fn ask_symlink_target(
        &self,
        link: &std::path::Path,
        target: &std::path::Path,
    ) -> Option<LinkRewrite>;
    /// The session is over: refresh both panes, or relocate the cursor for
    /// [`TransferOutcome::Navigate`].
    async fn transfer_done(&self, outcome: &TransferOutcome);
}

/// Scan-phase observer: aggregates totals across sources, throttles redraws
/// and polls the host's cancel flag.
struct ScanThrottle<'a, H: Host> {
    host: &'a H,
    aggregated: Cell<ScanResult>,
    last_redraw: Cell<std::time::Instant>,
}

impl<H: Host> ScanObserver for ScanThrottle<'_, H> {
    async fn enter_dir(&self, current: &std::path::Path, totals: &ScanResult) -> ScanControl {
        if self.host.scan_cancel_requested() {
            return ScanControl::Abort;
        }
        let now = std::time::Instant::now();
        if now.duration_since(self.last_redraw.get()) >= REDRAW_INTERVAL {
            self.last_redraw.set(now);
            let aggregate = self.aggregated.get() + *totals;
            self.host.scan_progress(current, &aggregate).await;
        }
        ScanControl::Continue
    }
}

/// Transfer-phase session state, bridging [`EngineHooks`] onto [`Host`].
struct Session<'a, H: Host> {
    host: &'a H,
    totals: ScanResult,
    started: std::time::Instant,
    files_done: Cell<u64>,
    /// Bytes of all fully processed files.
    bytes_base: Cell<u64>,
    /// (copied, total) of the file currently streaming.
    current_file: Cell<(u64, u64)>,
    /// Whether a file has been announced and not yet folded into the counts.
    in_flight: Cell<bool>,
    current_path: RefCell<Option<std::path::PathBuf>>,
    last_redraw: Cell<std::time::Instant>,
    remembered: RefCell<Option<OverwriteChoice>>,
}

impl<'a, H: Host> Session<'a, H> {
    fn new(host: &'a H, totals: ScanResult) -> Self {
        let now = std::time::Instant::now();
        Self {
            host,
            totals,
            started: now,
            files_done: Cell::new(0),
            bytes_base: Cell::new(0),
            current_file: Cell::new((0, 0)),
            in_flight: Cell::new(false),
            current_path: RefCell::new(None),
            last_redraw: Cell::new(now - REDRAW_INTERVAL),
            remembered: RefCell::new(None),
        }
    }

    async fn redraw(&self) {
        let now = std::time::Instant::now();
        if now.duration_since(self.last_redraw.get()) < REDRAW_INTERVAL {
            return;
        }
        self.last_redraw.set(now);
        let (copied, _) = self.current_file.get();
        let bytes_done = self.bytes_base.get() + copied;
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_sec = if bytes_done > 0 && elapsed > 0.0 {
            Some(bytes_done as f64 / elapsed)
        } else {
            None
        };
        let update = ProgressUpdate {
            current: self.current_path.borrow().clone(),
            files_done: self.files_done.get(),
            files_total: self.totals.files,
            bytes_done,
            bytes_total: self.totals.bytes,
            bytes_per_sec,
        };
        self.host.progress(&update).await;
    }

    /// The announced file is over (completed or skipped); fold it into the
    /// aggregate counts.
    fn finish_file(&self) {
        if self.in_flight.replace(false) {
            self.files_done.set(self.files_done.get() + 1);
            let (copied, _) = self.current_file.replace((0, 0));
            self.bytes_base.set(self.bytes_base.get() + copied);
        }
    }

    /// Reduce one host choice to the action the engine consumes, statting as
    /// needed for the metadata-comparing variants.
    async fn resolve_choice(
        &self,
        choice: OverwriteChoice,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> ConflictAction {
        match choice {
            OverwriteChoice::Overwrite => ConflictAction::Overwrite,
            OverwriteChoice::Skip => ConflictAction::Skip,
            OverwriteChoice::Rename(name) => ConflictAction::Rename(name.into()),
            OverwriteChoice::RenameN => {
                let candidate = conflict::compute_rename_n(dst).await;
                match candidate.file_name() {
                    Some(name) => ConflictAction::Rename(name.to_os_string()),
                    None => ConflictAction::Skip,
                }
            }
            OverwriteChoice::Append => ConflictAction::Append,
            OverwriteChoice::KeepLargest => {
                match (tokio::fs::metadata(src).await, tokio::fs::metadata(dst).await) {
                    (Ok(src_md), Ok(dst_md)) if src_md.len() > dst_md.len() => {
                        ConflictAction::Overwrite
                    }
                    // ties and stat failures keep the destination
                    _ => ConflictAction::Skip,
                }
            }
            OverwriteChoice::KeepNewest => {
                let newer = match (
                    tokio::fs::metadata(src).await,
                    tokio::fs::metadata(dst).await,
                ) {
                    (Ok(src_md), Ok(dst_md)) => match (src_md.modified(), dst_md.modified()) {
                        (Ok(src_mtime), Ok(dst_mtime)) => src_mtime > dst_mtime,
                        _ => false,
                    },
                    _ => false,
                };
                if newer {
                    ConflictAction::Overwrite
                } else {
                    ConflictAction::Skip
                }
            }
            OverwriteChoice::Cancel => ConflictAction::Cancel,
        }
    }
}

impl<H: Host> EngineHooks for Session<'_, H> {
    async fn file_progress(&self, src: &std::path::Path, _dst: &std::path::Path) -> Gate {
        // the previous file is finished once the next one is announced
        self.finish_file();
        self.in_flight.set(true);
        *self.current_path.borrow_mut() = Some(src.to_path_buf());
        self.redraw().await;
        self.host.pause_gate().await
    }

    async fn byte_progress(&self, copied: u64, total: u64) -> Gate {
        self.current_file.set((copied, total));
        self.redraw().await;
        self.host.pause_gate().await
    }

    async fn on_error(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        error: &TransferError,
    ) -> ErrorAction {
        self.host.report_error(src, dst, error).await
    }

    async fn ask_overwrite(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> ConflictAction {
        let remembered = self.remembered.borrow().clone();
        let choice = match remembered {
            Some(choice) => choice,
            None => {
                let prompt = OverwritePrompt::probe(src, dst).await;
                let reply = self.host.ask_overwrite(&prompt).await;
                if reply.remember && reply.choice.rememberable() {
                    *self.remembered.borrow_mut() = Some(reply.choice.clone());
                }
                reply.choice
            }
        };
        self.resolve_choice(choice, src, dst).await
    }

    async fn ask_symlink_target(
        &self,
        link: &std::path::Path,
        target: &std::path::Path,
    ) -> Option<LinkRewrite> {
        self.host.ask_symlink_target(link, target).await
    }
}

/// Runs transfer sessions; owns the cross-session speed tracker.
#[derive(Debug, Default)]
pub struct Controller {
    speed: SpeedTracker,
}

impl Controller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one session to completion (or early return on cancel/navigate).
    ///
    /// Phases, strictly ordered: scan every source for totals (abortable,
    /// best-effort), negotiate the symlink policy if the scan found internal
    /// symlinks, then transfer the sources in order.
    pub async fn execute<H: Host>(
        &mut self,
        request: &TransferRequest,
        host: &H,
    ) -> TransferOutcome {
        let sources: Vec<std::path::PathBuf> = request
            .sources
            .iter()
            .map(|source| {
                if source.is_absolute() {
                    source.clone()
                } else {
                    request.source_cwd.join(source)
                }
            })
            .collect();
        // phase 1: sizing scan
        let observer = ScanThrottle {
            host,
            aggregated: Cell::new(ScanResult::default()),
            last_redraw: Cell::new(std::time::Instant::now() - REDRAW_INTERVAL),
        };
        for source in &sources {
            let totals = scan::scan(source, &observer).await;
            observer.aggregated.set(observer.aggregated.get() + totals);
        }
        let totals = observer.aggregated.get();
        tracing::info!(
            "scan done: {} across {} source(s)",
            &totals,
            sources.len()
        );
        // phase 2: symlink policy, only when there is something to remap
        let symlink_policy = if totals.internal_symlinks > 0 {
            match host.ask_symlink_policy().await {
                Some(policy) => policy,
                None => {
                    let outcome = TransferOutcome::Cancelled(Summary::default());
                    host.transfer_done(&outcome).await;
                    return outcome;
                }
            }
        } else {
            SymlinkPolicy::default()
        };
        // phase 3: one engine invocation per source, in order
        let session = Session::new(host, totals);
        let mut summary = Summary::default();
        for source in &sources {
            let mut engine = Engine::new(
                &session,
                &mut self.speed,
                request.mode,
                request.overwrite_policy,
                symlink_policy,
            );
            let result = engine.transfer_one(source, &request.target_path).await;
            summary = summary + engine.summary();
            match result {
                Ok(ItemStatus::Done | ItemStatus::Skipped) => session.finish_file(),
                Err(Interrupt::Cancelled) => {
                    tracing::info!("transfer cancelled; {}", &summary);
                    let outcome = TransferOutcome::Cancelled(summary);
                    host.transfer_done(&outcome).await;
                    return outcome;
                }
                Err(Interrupt::Navigate(path)) => {
                    let outcome = TransferOutcome::Navigate(path, summary);
                    host.transfer_done(&outcome).await;
                    return outcome;
                }
            }
        }
        tracing::info!("transfer done; {}", &summary);
        let outcome = TransferOutcome::Completed(summary);
        host.transfer_done(&outcome).await;
        outcome
    }
}
