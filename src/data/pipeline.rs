//! Compression and write pipeline for data blocks and fragments.
//!
//! Jobs carry a sequence number assigned by the producer. Compression may
//! finish in any order, but results are applied to the output strictly in
//! sequence order by a single owner of [`OutputState`], so every file's
//! blocks land contiguously and in append order.
//!
//! Two flavours share that state machine:
//!
//! - inline: compress and apply on the calling thread
//! - threaded: a pool of compression workers fed through a
//!   [`BoundedWorkQueue`], plus one writer thread that reorders results

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::hash::Hasher;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use twox_hash::XxHash64;

use super::queue::BoundedWorkQueue;
use super::report::{BlockReport, FragmentEntry, FragmentTable};
use crate::compress::{CompressedBlock, Compressor};
use crate::error::{ImageError, Result};

/// How data blocks are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// Compress and write on the ingesting thread.
    SingleThreaded,
    /// Compress on `n` worker threads with a queue of `n` pending jobs.
    Workers(usize),
}

impl Default for Threading {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Threading::Workers(2 + cpus)
    }
}

/// Content checksum used to find dedup candidates. Matches are always
/// confirmed byte for byte.
pub(crate) type Digest = u64;

pub(crate) fn checksum(bytes: &[u8]) -> Digest {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobKind {
    /// One data block of file `inode`.
    Block { inode: u32 },
    /// Fragment block number `index`.
    Fragment { index: u32 },
    /// All blocks of `inode` are written; alias them if identical content
    /// already exists.
    Dedup { inode: u32, digest: Digest },
}

#[derive(Debug)]
pub(crate) struct Job {
    pub seq: u64,
    pub kind: JobKind,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct Completed {
    pub seq: u64,
    pub kind: JobKind,
    pub block: CompressedBlock,
}

fn compress_job(compressor: &dyn Compressor, job: Job) -> Result<Completed> {
    if let JobKind::Dedup { .. } = job.kind {
        return Ok(passthrough(job));
    }
    let block = compressor.compress(job.payload)?;
    Ok(Completed {
        seq: job.seq,
        kind: job.kind,
        block,
    })
}

fn passthrough(job: Job) -> Completed {
    Completed {
        seq: job.seq,
        kind: job.kind,
        block: CompressedBlock::stored(Vec::new()),
    }
}

/// Counters gathered while writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataStats {
    pub blocks_written: u64,
    pub fragments_written: u64,
    pub deduplicated_files: u64,
    pub deduplicated_fragments: u64,
    pub bytes_reclaimed: u64,
}

/// The output file and everything recorded about what was written to it.
#[derive(Debug)]
pub(crate) struct OutputState {
    file: File,
    cursor: u64,
    reports: HashMap<u32, BlockReport>,
    fragments: Arc<FragmentTable>,
    block_index: HashMap<Digest, Vec<u32>>,
    stats: DataStats,
}

impl OutputState {
    pub fn new(file: File, cursor: u64, fragments: Arc<FragmentTable>) -> Self {
        Self {
            file,
            cursor,
            reports: HashMap::new(),
            fragments,
            block_index: HashMap::new(),
            stats: DataStats::default(),
        }
    }

    pub fn apply(&mut self, done: Completed) -> Result<()> {
        match done.kind {
            JobKind::Block { inode } => {
                let start = self.write(&done.block.bytes)?;
                self.reports
                    .entry(inode)
                    .or_default()
                    .push(start, done.block.data_size_field());
                self.stats.blocks_written += 1;
            }
            JobKind::Fragment { index } => {
                let start = self.write(&done.block.bytes)?;
                let pushed = self.fragments.push(FragmentEntry {
                    start_block: start,
                    size: done.block.data_size_field(),
                });
                debug_assert_eq!(pushed, index, "fragments applied out of order");
                log::debug!(
                    "fragment {} written at {} ({} bytes)",
                    index,
                    start,
                    done.block.len()
                );
                self.stats.fragments_written += 1;
            }
            JobKind::Dedup { inode, digest } => self.dedup(inode, digest)?,
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<u64> {
        let start = self.cursor;
        self.file.write_all_at(bytes, start)?;
        self.cursor += bytes.len() as u64;
        Ok(start)
    }

    fn dedup(&mut self, inode: u32, digest: Digest) -> Result<()> {
        let Some(report) = self.reports.get(&inode).cloned() else {
            return Ok(());
        };

        let candidates = self.block_index.get(&digest).cloned().unwrap_or_default();
        for candidate in candidates {
            let Some(earlier) = self.reports.get(&candidate).cloned() else {
                continue;
            };
            if !earlier.same_shape(&report) {
                continue;
            }
            let len = report.range_len();
            if !self.range_equal(earlier.start_block, report.start_block, len)? {
                continue;
            }

            // The file's blocks are the last bytes written, so dropping them
            // is a truncate back to where they started.
            debug_assert_eq!(report.start_block + len, self.cursor);
            self.file.set_len(report.start_block)?;
            self.cursor = report.start_block;
            self.reports.insert(inode, earlier);
            self.stats.blocks_written -= report.sizes.len() as u64;
            self.stats.deduplicated_files += 1;
            self.stats.bytes_reclaimed += len;
            log::debug!(
                "inode {} duplicates inode {} ({} bytes reclaimed)",
                inode,
                candidate,
                len
            );
            return Ok(());
        }

        self.block_index.entry(digest).or_default().push(inode);
        Ok(())
    }

    fn range_equal(&self, a: u64, b: u64, len: u64) -> Result<bool> {
        const CHUNK: u64 = 64 * 1024;
        let mut left = vec![0u8; CHUNK.min(len) as usize];
        let mut right = vec![0u8; left.len()];
        let mut done = 0;
        while done < len {
            let n = CHUNK.min(len - done) as usize;
            self.file.read_exact_at(&mut left[..n], a + done)?;
            self.file.read_exact_at(&mut right[..n], b + done)?;
            if left[..n] != right[..n] {
                return Ok(false);
            }
            done += n as u64;
        }
        Ok(true)
    }

    pub fn into_parts(self) -> (File, u64, HashMap<u32, BlockReport>, DataStats) {
        (self.file, self.cursor, self.reports, self.stats)
    }
}

/// First failure seen by any pipeline thread.
#[derive(Debug, Default)]
pub(crate) struct FailureFlag {
    set: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FailureFlag {
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn set(&self, msg: String) {
        let mut slot = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(msg);
        }
        self.set.store(true, Ordering::Release);
    }

    pub fn message(&self) -> Option<String> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn error(&self) -> ImageError {
        ImageError::WorkerFailed(
            self.message()
                .unwrap_or_else(|| "write pipeline stopped".to_string()),
        )
    }
}

pub(crate) enum Pipeline {
    Inline(InlinePipeline),
    Threaded(ThreadedPipeline),
}

impl Pipeline {
    pub fn start(
        threading: Threading,
        compressor: Arc<dyn Compressor>,
        state: OutputState,
    ) -> Result<Self> {
        match threading {
            Threading::SingleThreaded | Threading::Workers(0) => {
                Ok(Pipeline::Inline(InlinePipeline { compressor, state }))
            }
            Threading::Workers(n) => Ok(Pipeline::Threaded(ThreadedPipeline::spawn(
                n, compressor, state,
            )?)),
        }
    }

    /// Queue a job for compression and writing.
    pub fn submit(&mut self, job: Job) -> Result<()> {
        match self {
            Pipeline::Inline(p) => p.submit(job),
            Pipeline::Threaded(p) => p.submit(job),
        }
    }

    /// Drain every outstanding job and hand back the output.
    pub fn finish(self) -> Result<OutputState> {
        match self {
            Pipeline::Inline(p) => Ok(p.state),
            Pipeline::Threaded(p) => p.finish(),
        }
    }
}

pub(crate) struct InlinePipeline {
    compressor: Arc<dyn Compressor>,
    state: OutputState,
}

impl InlinePipeline {
    fn submit(&mut self, job: Job) -> Result<()> {
        let done = compress_job(self.compressor.as_ref(), job)?;
        self.state.apply(done)
    }
}

pub(crate) struct ThreadedPipeline {
    queue: Arc<BoundedWorkQueue<Job>>,
    results: Option<Sender<Completed>>,
    failure: Arc<FailureFlag>,
    fragments: Arc<FragmentTable>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<OutputState>>>,
}

impl ThreadedPipeline {
    fn spawn(workers: usize, compressor: Arc<dyn Compressor>, state: OutputState) -> Result<Self> {
        let queue = Arc::new(BoundedWorkQueue::new(workers));
        let failure = Arc::new(FailureFlag::default());
        let fragments = Arc::clone(&state.fragments);
        let (tx, rx) = mpsc::channel();

        let mut pipeline = Self {
            queue: Arc::clone(&queue),
            results: Some(tx.clone()),
            failure: Arc::clone(&failure),
            fragments: Arc::clone(&fragments),
            workers: Vec::with_capacity(workers),
            writer: None,
        };

        for i in 0..workers {
            let queue = Arc::clone(&queue);
            let failure = Arc::clone(&failure);
            let fragments = Arc::clone(&fragments);
            let compressor = Arc::clone(&compressor);
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("sqfs-compress-{i}"))
                .spawn(move || worker_loop(&queue, &failure, &fragments, compressor.as_ref(), &tx))?;
            pipeline.workers.push(handle);
        }
        drop(tx);

        let writer_queue = Arc::clone(&queue);
        let writer_failure = Arc::clone(&failure);
        let handle = thread::Builder::new()
            .name("sqfs-writer".to_string())
            .spawn(move || writer_loop(rx, state, &writer_queue, &writer_failure))?;
        pipeline.writer = Some(handle);

        Ok(pipeline)
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        if self.failure.is_set() {
            return Err(self.failure.error());
        }
        if let JobKind::Dedup { .. } = job.kind {
            // Nothing to compress; hand straight to the writer.
            let done = passthrough(job);
            return match &self.results {
                Some(tx) => tx.send(done).map_err(|_| self.failure.error()),
                None => Err(self.failure.error()),
            };
        }
        self.queue.push(job).map_err(|_| self.failure.error())
    }

    fn finish(mut self) -> Result<OutputState> {
        self.shutdown();
        let mut panicked = false;
        for worker in self.workers.drain(..) {
            panicked |= worker.join().is_err();
        }
        let state = match self.writer.take().map(JoinHandle::join) {
            Some(Ok(result)) => result?,
            Some(Err(_)) | None => {
                return Err(ImageError::WorkerFailed("writer thread panicked".to_string()))
            }
        };
        if panicked {
            return Err(ImageError::WorkerFailed(
                "compression worker panicked".to_string(),
            ));
        }
        Ok(state)
    }

    fn shutdown(&mut self) {
        self.queue.finish();
        self.results = None;
    }
}

impl Drop for ThreadedPipeline {
    fn drop(&mut self) {
        if self.writer.is_none() && self.workers.is_empty() {
            return;
        }
        // Abandoned mid-build: stop everything and wait so no thread keeps
        // writing to a file the caller is about to delete.
        self.failure.set("image writer abandoned".to_string());
        self.fragments.fail("image writer abandoned");
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn worker_loop(
    queue: &BoundedWorkQueue<Job>,
    failure: &FailureFlag,
    fragments: &FragmentTable,
    compressor: &dyn Compressor,
    tx: &Sender<Completed>,
) {
    while let Some(job) = queue.pop() {
        if failure.is_set() {
            continue;
        }
        match compress_job(compressor, job) {
            Ok(done) => {
                if tx.send(done).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("compression failed: {}", e);
                failure.set(e.to_string());
                fragments.fail(&e.to_string());
                queue.finish();
            }
        }
    }
}

fn writer_loop(
    rx: Receiver<Completed>,
    mut state: OutputState,
    queue: &BoundedWorkQueue<Job>,
    failure: &FailureFlag,
) -> Result<OutputState> {
    let mut next = 0u64;
    let mut pending: BTreeMap<u64, Completed> = BTreeMap::new();
    let mut first_error: Option<ImageError> = None;

    for done in rx {
        if first_error.is_some() || failure.is_set() {
            continue;
        }
        pending.insert(done.seq, done);
        while let Some(done) = pending.remove(&next) {
            if let Err(e) = state.apply(done) {
                log::error!("writing data failed: {}", e);
                failure.set(e.to_string());
                state.fragments.fail(&e.to_string());
                queue.finish();
                first_error = Some(e);
                break;
            }
            next += 1;
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if failure.is_set() {
        return Err(failure.error());
    }
    if !pending.is_empty() {
        return Err(ImageError::WorkerFailed(format!(
            "{} data jobs never completed (next expected #{})",
            pending.len(),
            next
        )));
    }
    Ok(state)
}
