//! pcapng writer.
//!
//! A [`Writer`] owns one output file and a dedicated worker thread. Capture
//! sources push records into a bounded queue; the worker drains it in bursts
//! and appends blocks to the file.
//!
//! Descriptor blocks (SHB, IDB) are queued by the control path when a source
//! attaches, before the source becomes visible to the hot path. Since the
//! queue is FIFO, an interface is always described before its first packet.
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::pcapng;
use crate::pool::PacketPool;
use crate::{Error, IntfKey, Result, DEFAULT_FILE_SIZE, MIN_FILE_SIZE};

const USERAPPL: &str = concat!("ndn-pdump ", env!("CARGO_PKG_VERSION"));

/// Records written per queue wakeup.
const BURST_SIZE: usize = 64;

/// How long the worker waits on an empty queue before checking for stop.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Hot path retries on pool or queue exhaustion before dropping a record.
const HOT_RETRIES: usize = 4;
const HOT_BACKOFF: Duration = Duration::from_micros(100);

/// Backoff for descriptor blocks, which are retried until queued.
const CONTROL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriterConfig {
    pub filename: PathBuf,
    /// Stop writing packets once the file reaches this size.
    pub max_size: u64,
    pub queue_capacity: usize,
    /// Buffers in the writer's own pool. Ignored by `Writer::with_pool`.
    pub pool_capacity: usize,
    /// How long `close()` waits for attached sources to go away.
    #[serde(skip)]
    pub close_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::new(),
            max_size: DEFAULT_FILE_SIZE,
            queue_capacity: 4096,
            pool_capacity: 8192,
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl WriterConfig {
    #[must_use]
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.filename.as_os_str().is_empty() {
            return Err(Error::FilenameMissing);
        }
        if self.max_size < MIN_FILE_SIZE {
            return Err(Error::SizeTooSmall(self.max_size));
        }
        Ok(())
    }
}

/// Queue element: a fully built descriptor block, or packet bytes to be
/// framed as an Enhanced Packet Block.
pub(crate) struct Record {
    block_type: u32,
    intf: u32,
    timestamp_us: u64,
    buf: BytesMut,
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    dropped: AtomicU64,
    bytes: AtomicU64,
}

/// Snapshot of writer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// Enhanced Packet Blocks written.
    pub packets: u64,
    /// Packets not written: file full, buffers exhausted, or writer gone.
    pub dropped: u64,
    /// Bytes written to the file, all block kinds.
    pub bytes: u64,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

/// Hot path handle for pushing packets to a writer.
#[derive(Clone)]
pub(crate) struct Mirror {
    tx: Sender<Record>,
    pool: Arc<PacketPool>,
    counters: Arc<Counters>,
    /// Set once the worker is draining for close, or has failed.
    stop: Arc<AtomicBool>,
}

impl Mirror {
    /// Copy `header` followed by `pkt` into a pool buffer and queue it.
    ///
    /// Exhaustion is retried with a short backoff; only after that is the
    /// record dropped, with a warning.
    pub(crate) fn enqueue(&self, intf: u32, header: &[u8], pkt: &[u8]) -> bool {
        if self.stop.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let timestamp_us = now_us();
        let Some(mut buf) = self.alloc() else {
            warn!("mirror: packet pool exhausted, dropping packet for interface {intf}");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        buf.extend_from_slice(header);
        buf.extend_from_slice(pkt);
        self.push(Record {
            block_type: pcapng::BLOCK_EPB,
            intf,
            timestamp_us,
            buf,
        })
    }

    fn alloc(&self) -> Option<BytesMut> {
        for attempt in 0..=HOT_RETRIES {
            if let Some(mut bufs) = self.pool.alloc(1) {
                return bufs.pop();
            }
            if attempt < HOT_RETRIES {
                warn!("mirror: packet pool empty, retry {}", attempt + 1);
                std::thread::sleep(HOT_BACKOFF);
            }
        }
        None
    }

    fn push(&self, mut rec: Record) -> bool {
        for attempt in 0..=HOT_RETRIES {
            match self.tx.try_send(rec) {
                Ok(()) => return true,
                Err(TrySendError::Full(r)) => {
                    rec = r;
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if attempt < HOT_RETRIES {
                        warn!("mirror: queue full, retry {}", attempt + 1);
                        std::thread::sleep(HOT_BACKOFF);
                    }
                }
                Err(TrySendError::Disconnected(r)) => {
                    rec = r;
                    break;
                }
            }
        }
        warn!("mirror: dropping packet for interface {}", rec.intf);
        self.pool.free(rec.buf);
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }
}

#[derive(Default)]
struct Control {
    intfs: HashMap<IntfKey, u32>,
    section_written: bool,
    sources: usize,
    closed: bool,
}

struct Inner {
    filename: PathBuf,
    close_timeout: Duration,
    mirror: Mirror,
    control: Mutex<Control>,
    detached: Condvar,
    worker: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().map(Option::take).unwrap_or(None);
        if let Some(worker) = worker {
            self.mirror.stop.store(true, Ordering::Release);
            match worker.join() {
                Ok(Err(e)) => error!("writer {}: {e}", self.filename.display()),
                Err(_) => error!("writer {}: worker panicked", self.filename.display()),
                Ok(Ok(())) => {}
            }
        }
    }
}

/// A pcapng output file and its worker thread.
///
/// Cheap to clone; all clones refer to the same file.
#[derive(Clone)]
pub struct Writer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("filename", &self.inner.filename)
            .finish()
    }
}

impl Writer {
    /// Create the output file and start the worker.
    ///
    /// An existing file is truncated. Nothing is started if the file cannot
    /// be opened.
    pub fn new(cfg: WriterConfig) -> Result<Self> {
        let pool = Arc::new(PacketPool::new(cfg.pool_capacity));
        Self::with_pool(cfg, pool)
    }

    /// Like `new()`, taking packet buffers from a shared pool.
    pub fn with_pool(cfg: WriterConfig, pool: Arc<PacketPool>) -> Result<Self> {
        let (writer, worker) = Self::build(cfg, pool)?;
        writer.start(worker)?;
        Ok(writer)
    }

    /// Open the file and set up the queue, without starting the worker.
    fn build(cfg: WriterConfig, pool: Arc<PacketPool>) -> Result<(Self, Worker)> {
        cfg.validate()?;
        let f = BufWriter::new(
            std::fs::File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&cfg.filename)?,
        );
        let (tx, rx) = crossbeam::channel::bounded(cfg.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            f,
            rx,
            pool: pool.clone(),
            counters: counters.clone(),
            stop: stop.clone(),
            max_size: cfg.max_size,
            size: 0,
        };
        let writer = Self {
            inner: Arc::new(Inner {
                filename: cfg.filename,
                close_timeout: cfg.close_timeout,
                mirror: Mirror {
                    tx,
                    pool,
                    counters,
                    stop,
                },
                control: Mutex::new(Control::default()),
                detached: Condvar::new(),
                worker: Mutex::new(None),
            }),
        };
        Ok((writer, worker))
    }

    fn start(&self, worker: Worker) -> Result<()> {
        let max_size = worker.max_size;
        let handle = std::thread::Builder::new()
            .name("pdump-writer".to_string())
            .spawn(move || worker.run())?;
        *self.inner.worker.lock().unwrap() = Some(handle);
        info!(
            "writer {}: started, max size {max_size} bytes",
            self.inner.filename.display()
        );
        Ok(())
    }

    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.inner.filename
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        let c = &self.inner.mirror.counters;
        WriterStats {
            packets: c.packets.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.inner.mirror.pool
    }

    /// Number of sources attached and not yet reclaimed.
    #[must_use]
    pub fn active_sources(&self) -> usize {
        self.inner.control.lock().unwrap().sources
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.control.lock().unwrap().closed
    }

    /// Describe an interface, returning its pcapng interface id.
    ///
    /// Idempotent per key. The first interface also emits the section header.
    /// Blocks are queued, retrying while the queue is full.
    pub fn add_interface(&self, key: IntfKey, linktype: u16, description: &str) -> Result<u32> {
        let mut ctrl = self.inner.control.lock().unwrap();
        if ctrl.closed {
            return Err(Error::WriterClosed);
        }
        if let Some(&id) = ctrl.intfs.get(&key) {
            return Ok(id);
        }
        if !ctrl.section_written {
            self.push_block(pcapng::BLOCK_SHB, pcapng::section_header(USERAPPL))?;
            ctrl.section_written = true;
        }
        let id = u32::try_from(ctrl.intfs.len()).expect("more than 2^32 interfaces");
        self.push_block(
            pcapng::BLOCK_IDB,
            pcapng::interface_description(linktype, &key.to_string(), description),
        )?;
        ctrl.intfs.insert(key, id);
        debug!(
            "writer {}: interface {id} is {key} ({description})",
            self.inner.filename.display()
        );
        Ok(id)
    }

    fn push_block(&self, block_type: u32, block: Vec<u8>) -> Result<()> {
        let mut rec = Record {
            block_type,
            intf: 0,
            timestamp_us: 0,
            buf: BytesMut::from(&block[..]),
        };
        let mut retries = 0usize;
        loop {
            match self.inner.mirror.tx.try_send(rec) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(r)) => {
                    rec = r;
                    retries += 1;
                    warn!(
                        "writer {}: queue full for block {block_type:#x}, retry {retries}",
                        self.inner.filename.display()
                    );
                    std::thread::sleep(CONTROL_BACKOFF);
                }
                Err(TrySendError::Disconnected(_)) => return Err(Error::WriterClosed),
            }
        }
    }

    /// Count a new source, returning the handle its hot path pushes through.
    pub(crate) fn acquire(&self) -> Result<Mirror> {
        let mut ctrl = self.inner.control.lock().unwrap();
        if ctrl.closed {
            return Err(Error::WriterClosed);
        }
        ctrl.sources += 1;
        Ok(self.inner.mirror.clone())
    }

    /// Uncount a source, once it can no longer push.
    pub(crate) fn release(&self) {
        let mut ctrl = self.inner.control.lock().unwrap();
        assert!(ctrl.sources > 0, "writer source count underflow");
        ctrl.sources -= 1;
        self.inner.detached.notify_all();
    }

    /// Stop accepting sources, wait for attached ones to detach, then write
    /// whatever is still queued and close the file.
    ///
    /// Sources still attached after `close_timeout` have their packets
    /// dropped from then on; the drain covers only what was queued when the
    /// worker was told to stop.
    ///
    /// Closing an already closed writer is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let mut ctrl = self.inner.control.lock().unwrap();
            ctrl.closed = true;
            let deadline = Instant::now() + self.inner.close_timeout;
            while ctrl.sources > 0 {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        "writer {}: closing with {} sources still attached",
                        self.inner.filename.display(),
                        ctrl.sources
                    );
                    break;
                }
                ctrl = self
                    .inner
                    .detached
                    .wait_timeout(ctrl, deadline - now)
                    .unwrap()
                    .0;
            }
        }
        // Held across the join, so a concurrent close() returns only once
        // the file is complete.
        let mut worker = self.inner.worker.lock().unwrap();
        let Some(handle) = worker.take() else {
            return Ok(());
        };
        self.inner.mirror.stop.store(true, Ordering::Release);
        let res = match handle.join() {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        drop(worker);
        let stats = self.stats();
        info!(
            "writer {}: closed, {} packets, {} dropped, {} bytes",
            self.inner.filename.display(),
            stats.packets,
            stats.dropped,
            stats.bytes
        );
        Ok(res?)
    }
}

struct Worker {
    f: BufWriter<std::fs::File>,
    rx: Receiver<Record>,
    pool: Arc<PacketPool>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    max_size: u64,
    size: u64,
}

impl Worker {
    fn run(mut self) -> std::io::Result<()> {
        let res = self.serve();
        if let Err(e) = &res {
            error!("writer: {e}");
        }
        // Producers see `stop` and give up, so this is bounded by what they
        // already had in flight.
        self.stop.store(true, Ordering::Release);
        self.discard();
        debug!("writer: worker exiting after {} bytes", self.size);
        res
    }

    fn serve(&mut self) -> std::io::Result<()> {
        let mut burst = Vec::with_capacity(BURST_SIZE);
        while !self.stop.load(Ordering::Acquire) {
            match self.rx.recv_timeout(IDLE_POLL) {
                Ok(rec) => {
                    burst.push(rec);
                    burst.extend(self.rx.try_iter().take(BURST_SIZE - 1));
                    self.write_burst(&mut burst)?;
                }
                Err(RecvTimeoutError::Timeout) => self.f.flush()?,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Final drain: only what is queued now, so producers that keep
        // pushing can't hold up close.
        let pending = self.rx.len();
        burst.extend(self.rx.try_iter().take(pending));
        self.write_burst(&mut burst)?;
        self.f.flush()
    }

    /// Return buffers of records that will never be written to the pool.
    fn discard(&mut self) {
        let limit = self.rx.capacity().unwrap_or(0);
        let mut n = 0u64;
        for rec in self.rx.try_iter().take(limit) {
            if rec.block_type == pcapng::BLOCK_EPB {
                self.pool.free(rec.buf);
                n += 1;
            }
        }
        if n > 0 {
            self.counters.dropped.fetch_add(n, Ordering::Relaxed);
            warn!("writer: discarded {n} queued packets");
        }
    }

    /// Write and release every record. Buffers go back to the pool even if
    /// writing fails part way.
    fn write_burst(&mut self, burst: &mut Vec<Record>) -> std::io::Result<()> {
        let mut res = Ok(());
        for rec in burst.drain(..) {
            if res.is_ok() {
                res = self.write_record(&rec);
            }
            if rec.block_type == pcapng::BLOCK_EPB {
                self.pool.free(rec.buf);
            }
        }
        res
    }

    fn write_record(&mut self, rec: &Record) -> std::io::Result<()> {
        let n = if rec.block_type == pcapng::BLOCK_EPB {
            // Checked per block: one that starts below the cap is written
            // whole.
            if self.size >= self.max_size {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            let n = pcapng::write_enhanced_packet(&mut self.f, rec.intf, rec.timestamp_us, &rec.buf)?;
            self.counters.packets.fetch_add(1, Ordering::Relaxed);
            n
        } else {
            self.f.write_all(&rec.buf)?;
            rec.buf.len()
        };
        self.size += n as u64;
        self.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }
}
