//! Pack driver: phases, worker boundary, locks and the file swap.
//!
//! `Packer::pack` snapshots the live file length under the main lock,
//! then a worker thread scans the snapshot, garbage collects and
//! writes `<path>.pack`. Back on the calling thread, the transactions
//! committed while the worker ran are merged under the commit lock and
//! the files are swapped. Only that last part blocks writers, and the
//! lock is dropped around every tail transaction copy to keep the
//! blocked stretches short.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};
use crate::gc;
use crate::index::Index;
use crate::reader::LogReader;
use crate::references::{
    FileReferences, MemoryReferences, ReferenceStore, DEFAULT_CACHE_SIZE, DEFAULT_ENTRY_SIZE,
};
use crate::types::{Oid, Tid, TimeStamp};

pub(crate) mod copy;
pub(crate) mod scan;

use copy::PackOutput;

/// Builds a sibling path like `<path>.pack`.
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Locks shared between the host storage and the packer.
///
/// The main lock serializes storage state transitions; the commit lock
/// serializes writers against the live file tail. The packer only
/// borrows them: every acquisition is scoped, so they are released on
/// all paths, errors included.
#[derive(Default)]
pub struct StoreLocks {
    main: Mutex<()>,
    commit: Mutex<()>,
    packing: AtomicBool,
}

impl StoreLocks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn main(&self) -> MutexGuard<'_, ()> {
        self.main.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn commit(&self) -> MutexGuard<'_, ()> {
        self.commit.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn packing(&self) -> bool {
        self.packing.load(Ordering::SeqCst)
    }

    fn begin_pack(&self) -> bool {
        !self.packing.swap(true, Ordering::SeqCst)
    }

    fn end_pack(&self) {
        self.packing.store(false, Ordering::SeqCst);
    }
}

struct PackingGuard<'a>(&'a StoreLocks);

impl<'a> Drop for PackingGuard<'a> {
    fn drop(&mut self) {
        self.0.end_pack();
    }
}

pub type ReferencesFn = Box<dyn Fn(&[u8]) -> anyhow::Result<Vec<Oid>> + Send + Sync>;
pub type TransformFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;
pub type BlobCheckFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Callables injected by the host storage.
///
/// Payloads are opaque to the packer; `references` parses one into the
/// object ids it points at. `transform`/`untransform` optionally
/// re-encode payloads while they are rewritten (pack-time records
/// only; the tail keeps its original encoding). `blob_is_record`
/// enables the `<path>.removed` sideband listing dropped blob records.
#[derive(Default)]
pub struct PackHooks {
    pub references: Option<ReferencesFn>,
    pub transform: Option<TransformFn>,
    pub untransform: Option<TransformFn>,
    pub blob_is_record: Option<BlobCheckFn>,
}

impl PackHooks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn references<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> anyhow::Result<Vec<Oid>> + Send + Sync + 'static,
    {
        self.references = Some(Box::new(f));
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(f));
        self
    }

    pub fn untransform<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.untransform = Some(Box::new(f));
        self
    }

    pub fn blob_is_record<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.blob_is_record = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackOptions {
    /// Collect unreachable objects. Needs a `references` hook; without
    /// one only superseded revisions are dropped.
    pub gc: bool,
    /// Sleep `iteration time * multiplier` after each transaction to
    /// cap the I/O load. 0 disables the throttle.
    pub sleep_multiplier: f64,
    /// Spill the reference graph to `<path>.refs/` instead of keeping
    /// it in memory.
    pub spill_references: bool,
    /// Object ids per spilled bucket.
    pub reference_entry_size: u64,
    /// Resident buckets in the spill cache.
    pub reference_cache_size: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            gc: true,
            sleep_multiplier: 0.0,
            spill_references: false,
            reference_entry_size: DEFAULT_ENTRY_SIZE,
            reference_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl PackOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn gc(mut self, value: bool) -> Self {
        self.gc = value;
        self
    }

    pub fn sleep_multiplier(mut self, value: f64) -> Self {
        self.sleep_multiplier = value;
        self
    }

    pub fn spill_references(mut self, value: bool) -> Self {
        self.spill_references = value;
        self
    }

    /// Read options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Throttle {
    multiplier: f64,
}

impl Throttle {
    pub(crate) fn new(multiplier: f64) -> Self {
        Throttle { multiplier }
    }

    /// Sleep in proportion to the time the caller just spent working.
    pub(crate) fn pace(&self, started: Instant) {
        if self.multiplier > 0.0 {
            std::thread::sleep(started.elapsed().mul_f64(self.multiplier));
        }
    }
}

/// Timed audit log written to `<path>.packlog`, kept after the run.
pub(crate) struct PackLog {
    file: Option<File>,
}

impl PackLog {
    fn create(path: &Path) -> Self {
        let file = match File::create(path) {
            Ok(file) => Some(file),
            Err(err) => {
                log::warn!("unable to open pack log {:?} - {}", path, err);
                None
            }
        };
        PackLog { file }
    }

    pub(crate) fn note(&mut self, msg: &str) {
        log::info!("{}", msg);
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{} {}", TimeStamp::now(), msg);
        }
    }

    pub(crate) fn note_memory(&mut self) {
        if let Some(vm) = vm_usage() {
            self.note(&vm);
        }
    }
}

// Memory figures of this process, for the pack log.
fn vm_usage() -> Option<String> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut parts = Vec::new();
    for line in status.lines() {
        if line.starts_with("VmSize:") || line.starts_with("VmRSS:") {
            parts.push(
                line.split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// What the worker hands back after writing `<path>.pack`.
pub(crate) struct PackOutcome {
    pub(crate) index: Index,
    pub(crate) output_end: u64,
    pub(crate) snapshot_end: u64,
}

/// Runs the snapshot phases against a private read handle.
pub(crate) struct PackProcess {
    path: PathBuf,
    stop: Tid,
    reader: LogReader,
    gc: bool,
    refs: Box<dyn ReferenceStore>,
    hooks: Arc<PackHooks>,
    throttle: Throttle,
    log: PackLog,
    ltid: Tid,
}

impl PackProcess {
    pub(crate) fn new(
        path: &Path,
        stop: Tid,
        file_end: u64,
        options: &PackOptions,
        hooks: Arc<PackHooks>,
        gc: bool,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let refs: Box<dyn ReferenceStore> = if gc && options.spill_references {
            Box::new(FileReferences::new(
                sidecar(path, "refs"),
                options.reference_entry_size,
                options.reference_cache_size,
            )?)
        } else {
            Box::new(MemoryReferences::new())
        };
        Ok(PackProcess {
            path: path.to_owned(),
            stop,
            reader: LogReader::with_end(file, file_end),
            gc,
            refs,
            hooks,
            throttle: Throttle::new(options.sleep_multiplier),
            log: PackLog::create(&sidecar(path, "packlog")),
            ltid: Tid::ZERO,
        })
    }

    fn run(&mut self) -> Result<Option<PackOutcome>> {
        self.log.note(&format!(
            "packing up to {}, gc {}",
            self.stop,
            if self.gc { "enabled" } else { "disabled" }
        ));

        let scan::ScanOutcome {
            packed,
            index,
            cutoff_pos,
        } = self.build_pack_index()?;
        self.log.note(&format!(
            "scanned the packing range, {} current objects",
            index.len()
        ));
        self.log.note_memory();

        if packed {
            self.log
                .note("everything before the pack time is already packed - nothing to do");
            return Ok(None);
        }

        let index = if self.gc {
            self.update_references(cutoff_pos)?;
            self.log.note("merged references from newer transactions");
            let reachable = gc::mark(&index, self.refs.as_mut())?;
            self.log.note(&format!(
                "garbage collection done, {} reachable objects",
                reachable.len()
            ));
            self.log.note_memory();
            reachable
        } else {
            index
        };

        let pack_path = sidecar(&self.path, "pack");
        let mut out = PackOutput::create(&pack_path)?;
        let (mut new_index, new_pos) = self.copy_to_packtime(cutoff_pos, &index, &mut out)?;
        if new_pos == cutoff_pos {
            // Nothing was freed; keep the storage as it is.
            drop(out);
            std::fs::remove_file(&pack_path)?;
            self.log.note("pack would not free any space - aborted");
            return Ok(None);
        }
        self.log.note(&format!(
            "copied up to the pack time, {} -> {} bytes",
            cutoff_pos, new_pos
        ));

        self.copy_from_packtime(cutoff_pos, &mut out, &mut new_index)?;
        let output_end = out.finish()?;
        self.log.note(&format!(
            "copied the transactions after the pack time, {} bytes total",
            output_end
        ));

        Ok(Some(PackOutcome {
            index: new_index,
            output_end,
            snapshot_end: self.reader.file_end(),
        }))
    }
}

/// Packs a storage file in place while its writer stays live.
pub struct Packer {
    path: PathBuf,
    locks: Arc<StoreLocks>,
    options: PackOptions,
    hooks: Arc<PackHooks>,
    read_only: bool,
}

impl Packer {
    pub fn new<P: Into<PathBuf>>(path: P, locks: Arc<StoreLocks>) -> Self {
        Packer {
            path: path.into(),
            locks,
            options: PackOptions::default(),
            hooks: Arc::new(PackHooks::default()),
            read_only: false,
        }
    }

    pub fn options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    pub fn hooks(mut self, hooks: PackHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Pack away everything not reachable as of the `stop` transaction
    /// id. Returns the new file length, or `None` when there was
    /// nothing to gain. The live file is replaced atomically; on any
    /// error it stays untouched and the temporaries are discarded.
    pub fn pack(&self, stop: Tid) -> Result<Option<u64>> {
        if self.read_only {
            return Err(PackError::ReadOnly);
        }
        if stop.is_zero() {
            return Err(PackError::InvalidPackTime);
        }

        let _packing;
        let file_end;
        {
            let _main = self.locks.main();
            if !self.locks.begin_pack() {
                return Err(PackError::AlreadyPacking);
            }
            _packing = PackingGuard(&self.locks);
            file_end = std::fs::metadata(&self.path)?.len();
        }

        let result = self.pack_inner(stop, file_end);
        if result.is_err() {
            let _ = std::fs::remove_file(sidecar(&self.path, "pack"));
        }
        result
    }

    fn pack_inner(&self, stop: Tid, file_end: u64) -> Result<Option<u64>> {
        // GC needs a reference extractor, and the operator can veto it
        // with a marker file next to the storage.
        let gc_enabled = self.options.gc
            && self.hooks.references.is_some()
            && !sidecar(&self.path, "packnogc").exists();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let path = self.path.clone();
        let options = self.options.clone();
        let hooks = self.hooks.clone();
        let handle = std::thread::Builder::new()
            .name("pack".to_string())
            .spawn(move || {
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        PackProcess::new(&path, stop, file_end, &options, hooks, gc_enabled)?
                            .run()
                    }))
                    .unwrap_or_else(|panic| Err(PackError::Worker(panic_message(&panic))));
                let _ = tx.send(result);
            })?;

        let result = rx
            .recv()
            .unwrap_or_else(|_| Err(PackError::Worker("worker exited without a result".into())));
        let _ = handle.join();

        let outcome = match result? {
            Some(outcome) => outcome,
            None => return Ok(None),
        };
        let PackOutcome {
            mut index,
            output_end: _,
            snapshot_end,
        } = outcome;

        // Tail merge: a fresh handle (pread only, nothing buffered)
        // because the live file kept growing while the worker ran.
        let pack_path = sidecar(&self.path, "pack");
        let mut reader = LogReader::open(&self.path)?;
        let mut out = PackOutput::open_end(&pack_path)?;
        let guard = copy::copy_rest(&mut reader, snapshot_end, &mut out, &mut index, &self.locks)?;
        let new_len = out.finish()?;

        // Swap the files with the commit lock still held. The main
        // lock is taken as well: no storage state transition may
        // observe the swap half done.
        let old_path = sidecar(&self.path, "old");
        let main_guard = self.locks.main();
        remove_stale(&old_path)?;
        std::fs::rename(&self.path, &old_path)?;
        if let Err(err) = std::fs::rename(&pack_path, &self.path) {
            // Put the original back; the pack is lost but the storage
            // keeps working.
            let _ = std::fs::rename(&old_path, &self.path);
            return Err(err.into());
        }
        index.save(sidecar(&self.path, "index"))?;
        drop(main_guard);
        drop(guard);

        log::info!(
            "packed {:?}: {} -> {} bytes",
            self.path,
            file_end,
            new_len
        );
        Ok(Some(new_len))
    }
}

// Unlink a leftover file, retrying once; a missing file is fine.
fn remove_stale(path: &Path) -> Result<()> {
    for last in &[false, true] {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if *last => return Err(err.into()),
            Err(_) => {}
        }
    }
    unreachable!()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}
