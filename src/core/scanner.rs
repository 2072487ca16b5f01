//! Multi-threaded tree walker.
//!
//! A scan enumerates its root on the coordinator thread, then fans out one
//! job per immediate subdirectory to a small set of workers. Each job is a
//! depth-first walk driven by an explicit stack. Nothing here touches the
//! tree: every observation leaves as an update record on the queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::config::settings::MAX_SCAN_THREADS;
use crate::error::ScanError;
use crate::models::node::{NodeId, ScanState};
use crate::models::tree_store::IdAllocator;

use super::admission::{StopToken, VolumeAdmissionScheduler, VolumeKey};
use super::events::{FileEntry, PendingUpdate, Remainder, UpdateKind};
use super::progress::ProgressTracker;
use super::queue::UpdateQueue;
use super::reader::DirectoryReader;
use super::top_k::TopK;

/// Parameters of one scan attempt.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub root_path: PathBuf,
    /// Node the walk is rooted at: `NodeId::ROOT` for a full scan, any
    /// directory for a refresh.
    pub root_id: NodeId,
    pub generation: u64,
    pub top_k: usize,
    pub thread_count: usize,
    pub volume: VolumeKey,
}

pub struct Scanner {
    reader: Arc<dyn DirectoryReader>,
    queue: Arc<UpdateQueue>,
    admission: Arc<VolumeAdmissionScheduler>,
    ids: IdAllocator,
}

impl Scanner {
    pub fn new(
        reader: Arc<dyn DirectoryReader>,
        queue: Arc<UpdateQueue>,
        admission: Arc<VolumeAdmissionScheduler>,
        ids: IdAllocator,
    ) -> Self {
        Self {
            reader,
            queue,
            admission,
            ids,
        }
    }

    /// Start the scan on a background coordinator thread.
    pub fn spawn(&self, request: ScanRequest, stop: StopToken) -> Result<ScanHandle, ScanError> {
        let progress = Arc::new(ProgressTracker::new());
        let generation = request.generation;
        let ctx = self.context(&request, stop.clone(), Arc::clone(&progress));
        let admission = Arc::clone(&self.admission);

        let thread = thread::Builder::new()
            .name(format!("scan-{}", generation))
            .spawn(move || run_scan(&ctx, &admission, &request))
            .map_err(ScanError::Spawn)?;

        Ok(ScanHandle {
            thread: Some(thread),
            stop,
            progress,
            generation,
        })
    }

    /// Run the scan on the calling thread. Returns the root's byte total.
    pub fn run(&self, request: &ScanRequest, stop: StopToken) -> Result<u64, ScanError> {
        let ctx = self.context(request, stop, Arc::new(ProgressTracker::new()));
        run_scan(&ctx, &self.admission, request)
    }

    fn context(
        &self,
        request: &ScanRequest,
        stop: StopToken,
        progress: Arc<ProgressTracker>,
    ) -> ScanContext {
        ScanContext {
            reader: Arc::clone(&self.reader),
            queue: Arc::clone(&self.queue),
            ids: self.ids.clone(),
            progress,
            stop,
            generation: request.generation,
            top_k: request.top_k,
        }
    }
}

/// Owner-side handle to a running scan.
pub struct ScanHandle {
    thread: Option<JoinHandle<Result<u64, ScanError>>>,
    stop: StopToken,
    progress: Arc<ProgressTracker>,
    generation: u64,
}

impl ScanHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the coordinator (and therefore all its workers) exits.
    pub fn join(&mut self) -> Option<Result<u64, ScanError>> {
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::error!(generation = self.generation, "scan thread panicked");
                None
            }
        }
    }
}

struct ScanContext {
    reader: Arc<dyn DirectoryReader>,
    queue: Arc<UpdateQueue>,
    ids: IdAllocator,
    progress: Arc<ProgressTracker>,
    stop: StopToken,
    generation: u64,
    top_k: usize,
}

impl ScanContext {
    fn emit(&self, kind: UpdateKind) {
        self.queue.post(PendingUpdate::new(self.generation, kind));
    }

    fn emit_state(&self, id: NodeId, state: ScanState) {
        self.emit(UpdateKind::UpdateState { id, state });
    }

    fn emit_size(&self, id: NodeId, total_bytes: u64) {
        self.emit(UpdateKind::UpdateSize { id, total_bytes });
    }

    fn emit_progress(&self) {
        if let Some(record) = self.progress.throttled_record() {
            self.emit(record);
        }
    }

    fn check_stop(&self) -> Result<(), ScanError> {
        if self.stop.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A directory still to be walked.
#[derive(Debug, Clone)]
struct Job {
    id: NodeId,
    path: PathBuf,
}

/// One level of the explicit depth-first stack.
struct Frame {
    id: NodeId,
    subdirs: Vec<Job>,
    next: usize,
    /// Own files plus every finished subdirectory.
    bytes: u64,
}

enum Opened {
    Ready(Frame),
    /// Enumeration failed; carries the bytes of files seen before it did.
    Failed { bytes: u64 },
}

fn run_scan(
    ctx: &ScanContext,
    admission: &Arc<VolumeAdmissionScheduler>,
    request: &ScanRequest,
) -> Result<u64, ScanError> {
    let root = request.root_id;
    ctx.emit_state(root, ScanState::Queued);
    let permit = match admission.acquire(&request.volume, &ctx.stop) {
        Ok(permit) => permit,
        Err(e) => {
            tracing::info!(root = %request.root_path.display(), "scan not admitted: {}", e);
            ctx.emit_state(root, ScanState::Canceled);
            return Err(e);
        }
    };
    tracing::info!(
        root = %request.root_path.display(),
        generation = request.generation,
        threads = request.thread_count,
        top_k = request.top_k,
        "scan started"
    );

    let frame = match open_directory(ctx, root, &request.root_path) {
        Ok(Opened::Ready(frame)) => frame,
        Ok(Opened::Failed { bytes }) => return Ok(bytes),
        Err(e) => {
            ctx.emit_state(root, ScanState::Canceled);
            return Err(e);
        }
    };

    let total = Mutex::new(frame.bytes);
    let jobs = Mutex::new(VecDeque::from(frame.subdirs));
    let helpers = request
        .thread_count
        .clamp(1, MAX_SCAN_THREADS)
        .saturating_sub(1)
        .min(jobs.lock().unwrap_or_else(PoisonError::into_inner).len());

    thread::scope(|scope| {
        for index in 0..helpers {
            let spawned = thread::Builder::new()
                .name(format!("scan-{}-worker-{}", request.generation, index))
                .spawn_scoped(scope, || drain_jobs(ctx, &jobs, &total, root));
            if let Err(e) = spawned {
                tracing::warn!("failed to spawn scan worker: {}", e);
                break;
            }
        }
        drain_jobs(ctx, &jobs, &total, root);
    });
    drop(permit);

    if ctx.stop.is_cancelled() {
        tracing::info!(root = %request.root_path.display(), "scan cancelled");
        ctx.emit_state(root, ScanState::Canceled);
        return Err(ScanError::Cancelled);
    }

    let total = *total.lock().unwrap_or_else(PoisonError::into_inner);
    ctx.emit_size(root, total);
    ctx.emit_state(root, ScanState::Done);
    ctx.emit(ctx.progress.record());
    let snapshot = ctx.progress.snapshot();
    tracing::info!(
        root = %request.root_path.display(),
        files = snapshot.files_scanned,
        dirs = snapshot.dirs_scanned,
        errors = snapshot.errors_count,
        bytes = total,
        elapsed_ms = snapshot.elapsed.as_millis() as u64,
        "scan completed"
    );
    Ok(total)
}

/// Pull subtree jobs until the list is empty or the scan is stopped.
fn drain_jobs(ctx: &ScanContext, jobs: &Mutex<VecDeque<Job>>, total: &Mutex<u64>, root: NodeId) {
    loop {
        if ctx.stop.is_cancelled() {
            return;
        }
        let job = jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(job) = job else {
            return;
        };
        match walk_subtree(ctx, job) {
            Ok(bytes) => {
                // Post under the lock so the root's running total only grows.
                let mut running = total.lock().unwrap_or_else(PoisonError::into_inner);
                *running += bytes;
                ctx.emit_size(root, *running);
            }
            Err(_) => return,
        }
    }
}

/// Depth-first walk of one subtree with an explicit stack, so the thread's
/// call depth does not grow with path depth.
fn walk_subtree(ctx: &ScanContext, job: Job) -> Result<u64, ScanError> {
    let mut stack = match open_directory(ctx, job.id, &job.path)? {
        Opened::Ready(frame) => vec![frame],
        Opened::Failed { bytes } => return Ok(bytes),
    };

    loop {
        ctx.check_stop()?;
        let Some(top) = stack.last_mut() else {
            return Ok(0);
        };

        if top.next < top.subdirs.len() {
            let child = top.subdirs[top.next].clone();
            top.next += 1;
            match open_directory(ctx, child.id, &child.path)? {
                Opened::Ready(frame) => stack.push(frame),
                Opened::Failed { bytes } => {
                    if let Some(parent) = stack.last_mut() {
                        parent.bytes += bytes;
                        ctx.emit_size(parent.id, parent.bytes);
                    }
                }
            }
            continue;
        }

        let Some(finished) = stack.pop() else {
            return Ok(0);
        };
        ctx.emit_size(finished.id, finished.bytes);
        ctx.emit_state(finished.id, ScanState::Done);
        ctx.emit_progress();

        match stack.last_mut() {
            Some(parent) => {
                parent.bytes += finished.bytes;
                ctx.emit_size(parent.id, parent.bytes);
            }
            None => return Ok(finished.bytes),
        }
    }
}

/// Enumerate one directory: fold its files through the top-K selector, emit
/// the files summary, then register its subdirectories as children.
fn open_directory(ctx: &ScanContext, id: NodeId, path: &Path) -> Result<Opened, ScanError> {
    ctx.check_stop()?;
    ctx.emit_state(id, ScanState::Scanning);
    ctx.progress.increment_dirs();

    let listing = match ctx.reader.list_directory(path) {
        Ok(listing) => listing,
        Err(e) => return Ok(fail_directory(ctx, id, path, e, 0)),
    };

    let mut files: TopK<CompactString, ()> = TopK::new(ctx.top_k);
    let mut subdirs: Vec<CompactString> = Vec::new();
    let mut bytes = 0u64;
    let mut failure = None;

    for entry in listing {
        ctx.check_stop()?;
        match entry {
            Ok(info) if info.is_directory && !info.is_reparse_point => subdirs.push(info.name),
            Ok(info) => {
                bytes += info.size;
                ctx.progress.increment_files();
                ctx.progress.add_size(info.size);
                files.push(info.size, info.name, ());
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    emit_files_summary(ctx, id, files);

    if let Some(e) = failure {
        return Ok(fail_directory(ctx, id, path, e, bytes));
    }

    let subdirs = subdirs
        .into_iter()
        .map(|name| {
            let child = ctx.ids.next();
            let child_path = path.join(name.as_str());
            ctx.emit(UpdateKind::AddChild {
                parent: id,
                id: child,
                name,
                is_directory: true,
                bytes: 0,
            });
            ctx.emit_state(child, ScanState::Queued);
            Job {
                id: child,
                path: child_path,
            }
        })
        .collect();

    Ok(Opened::Ready(Frame {
        id,
        subdirs,
        next: 0,
        bytes,
    }))
}

fn emit_files_summary(ctx: &ScanContext, parent: NodeId, files: TopK<CompactString, ()>) {
    let (retained, folded) = files.into_sorted();
    if retained.is_empty() && folded.count == 0 {
        return;
    }
    let first = ctx.ids.reserve(retained.len() as u32);
    let files: SmallVec<[FileEntry; 8]> = retained
        .into_iter()
        .enumerate()
        .map(|(offset, (bytes, name, ()))| FileEntry {
            id: NodeId(first.0 + offset as u32),
            name,
            bytes,
        })
        .collect();
    ctx.emit(UpdateKind::DirectoryFilesSummary {
        parent,
        files,
        other: Remainder {
            bytes: folded.weight,
            files: folded.count,
        },
    });
}

fn fail_directory(
    ctx: &ScanContext,
    id: NodeId,
    path: &Path,
    error: std::io::Error,
    bytes: u64,
) -> Opened {
    let error = ScanError::Enumeration {
        path: path.to_path_buf(),
        source: error,
    };
    tracing::warn!("{}", error);
    ctx.progress.increment_errors();
    ctx.emit_size(id, bytes);
    ctx.emit_state(id, ScanState::Error);
    Opened::Failed { bytes }
}
