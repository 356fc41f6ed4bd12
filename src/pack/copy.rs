//! Rewrite phases: copy to the pack time, copy the tail, merge the
//! transactions that arrived while packing ran.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use std::time::Instant;

use crate::error::{PackError, Result};
use crate::format::{DataHeader, TxnHeader, METADATA_SIZE, STATUS_PACKED, TXN_HDR_LEN};
use crate::index::Index;
use crate::reader::LogReader;
use crate::types::{Oid, Tid};

use super::{sidecar, PackProcess, StoreLocks};

/// Buffered writer for the pack output that tracks its own position
/// and can back-patch transaction lengths.
pub(crate) struct PackOutput {
    w: BufWriter<File>,
    pos: u64,
}

impl PackOutput {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        Ok(PackOutput {
            w: BufWriter::new(File::create(path)?),
            pos: 0,
        })
    }

    /// Re-open an existing output positioned at its end; the tail
    /// merge continues where the worker stopped.
    pub(crate) fn open_end(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let pos = file.seek(SeekFrom::End(0))?;
        Ok(PackOutput {
            w: BufWriter::new(file),
            pos,
        })
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.w.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub(crate) fn write_num(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    /// Overwrite 8 bytes at `at` and return to the append position.
    pub(crate) fn patch_num(&mut self, at: u64, value: u64) -> Result<()> {
        self.w.seek(SeekFrom::Start(at))?;
        self.w.write_all(&value.to_be_bytes())?;
        self.w.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<u64> {
        self.w.flush()?;
        Ok(self.pos)
    }
}

/// Append one data record. `None` (or an empty payload) stands for a
/// deletion and is written as a zero backpointer.
pub(crate) fn write_data_record(
    out: &mut PackOutput,
    oid: Oid,
    tid: Tid,
    prev: u64,
    tloc: u64,
    data: Option<&[u8]>,
) -> Result<u64> {
    let data = data.filter(|data| !data.is_empty());
    let rpos = out.pos();
    let dh = DataHeader {
        oid,
        tid,
        prev,
        tloc,
        vlen: 0,
        plen: data.map_or(0, |data| data.len() as u64),
        back: 0,
    };
    out.write(&dh.encode())?;
    match data {
        Some(data) => out.write(data)?,
        None => out.write(&[0u8; 8])?,
    }
    Ok(rpos)
}

/// Sideband list of dropped blob records, `<path>.removed`. One hex
/// oid+tid pair per line; the blob garbage collector unlinks the
/// matching files.
struct RemovedLog {
    path: PathBuf,
    file: Option<File>,
}

impl RemovedLog {
    fn create(path: PathBuf, enabled: bool) -> Result<Self> {
        let file = if enabled {
            Some(File::create(&path)?)
        } else {
            None
        };
        Ok(RemovedLog { path, file })
    }

    fn enabled(&self) -> bool {
        self.file.is_some()
    }

    fn append(&mut self, oid: Oid, tid: Tid) -> Result<()> {
        if let Some(file) = &mut self.file {
            writeln!(file, "{}{}", oid.hex(), tid.hex()).map_err(|err| {
                PackError::Io(std::io::Error::new(
                    err.kind(),
                    format!("unable to extend {:?} - {}", self.path, err),
                ))
            })?;
        }
        Ok(())
    }
}

impl PackProcess {
    /// Copy `[metadata, cutoff)` keeping only the records the index
    /// points at. Surviving transactions are stamped packed, payloads
    /// are inlined (no record written here keeps a backpointer or a
    /// previous-revision position) and the optional transform hook is
    /// applied.
    pub(crate) fn copy_to_packtime(
        &mut self,
        cutoff_pos: u64,
        index: &Index,
        out: &mut PackOutput,
    ) -> Result<(Index, u64)> {
        out.write(&self.reader.read_metadata()?)?;
        let mut removed = RemovedLog::create(
            sidecar(&self.path, "removed"),
            self.hooks.blob_is_record.is_some(),
        )?;
        let mut new_index = Index::new();
        let mut pos = METADATA_SIZE;

        while pos < cutoff_pos {
            let started = Instant::now();
            let th = self.reader.read_txn_header(pos)?;
            let meta = self
                .reader
                .read_bytes(pos + TXN_HDR_LEN, th.header_len() - TXN_HDR_LEN)?;
            let tend = pos + th.tlen;
            let mut new_tpos = 0u64;
            pos += th.header_len();

            while pos < tend {
                let dh = self.reader.read_data_header(pos)?;
                let rlen = dh.record_len();
                if index.get(&dh.oid) != Some(pos) {
                    // Superseded or unreachable. Note dropped blob
                    // records so their files can be unlinked.
                    if removed.enabled() && dh.plen > 0 {
                        let data = self.reader.read_payload(pos, dh.plen)?;
                        if (self.hooks.blob_is_record.as_ref().unwrap())(&data) {
                            removed.append(dh.oid, dh.tid)?;
                        }
                    }
                    pos += rlen;
                    continue;
                }

                // The transaction header goes out lazily, only once a
                // record of this transaction survives.
                if new_tpos == 0 {
                    let mut packed = th.clone();
                    packed.status = STATUS_PACKED;
                    new_tpos = out.pos();
                    out.write(&packed.encode())?;
                    out.write(&meta)?;
                }

                let data = self.reader.resolve_payload(pos, &dh)?;
                let data = data.map(|data| self.transform_payload(data));
                let rpos = write_data_record(out, dh.oid, dh.tid, 0, new_tpos, data.as_deref())?;
                new_index.insert(dh.oid, rpos);
                pos += rlen;
            }

            if new_tpos != 0 {
                let tlen = out.pos() - new_tpos;
                out.write_num(tlen)?;
                if tlen != th.tlen {
                    out.patch_num(new_tpos + 8, tlen)?;
                }
            }
            pos += 8;
            self.reader.advise_scanned(pos);
            self.throttle.pace(started);
        }

        Ok((new_index, out.pos()))
    }

    fn transform_payload(&self, data: Vec<u8>) -> Vec<u8> {
        let data = match &self.hooks.untransform {
            Some(untransform) => untransform(&data),
            None => data,
        };
        match &self.hooks.transform {
            Some(transform) => transform(&data),
            None => data,
        }
    }

    /// Copy the tail the worker can still see, `[cutoff, file_end)`.
    /// Statuses and payload encodings stay as they are; only the
    /// record linkage is rewritten against the output file.
    pub(crate) fn copy_from_packtime(
        &mut self,
        mut pos: u64,
        out: &mut PackOutput,
        index: &mut Index,
    ) -> Result<u64> {
        while pos < self.reader.file_end() {
            let started = Instant::now();
            let th = self.reader.read_txn_header(pos)?;
            pos = copy_transaction(&self.reader, pos, &th, out, index)?;
            self.reader.advise_scanned(pos);
            self.throttle.pace(started);
        }
        Ok(out.pos())
    }
}

/// Copy one whole transaction, resolving backpointers so the output
/// never depends on the old file. Returns the input position of the
/// next transaction.
pub(crate) fn copy_transaction(
    reader: &LogReader,
    input_pos: u64,
    th: &TxnHeader,
    out: &mut PackOutput,
    index: &mut Index,
) -> Result<u64> {
    let meta = reader.read_bytes(input_pos + TXN_HDR_LEN, th.header_len() - TXN_HDR_LEN)?;
    let out_tpos = out.pos();
    out.write(&th.encode())?;
    out.write(&meta)?;

    let tend = input_pos + th.tlen;
    let mut pos = input_pos + th.header_len();
    while pos < tend {
        let dh = reader.read_data_header(pos)?;
        let data = reader.resolve_payload(pos, &dh)?;
        let prev = index.get(&dh.oid).unwrap_or(0);
        let rpos = write_data_record(out, dh.oid, dh.tid, prev, out_tpos, data.as_deref())?;
        index.insert(dh.oid, rpos);
        pos += dh.record_len();
    }

    let tlen = out.pos() - out_tpos;
    out.write_num(tlen)?;
    if tlen != th.tlen {
        out.patch_num(out_tpos + 8, tlen)?;
    }
    Ok(input_pos + th.tlen + 8)
}

/// Merge the transactions committed since the worker snapshot into the
/// output, then hand the commit lock back to the caller still held so
/// the file swap happens before any further write.
///
/// The loop cannot assume a stable end of file: the lock is dropped
/// around each transaction copy to let writers through, so it keeps
/// reading until a read fails exactly at the current end. A read
/// failing anywhere else is real corruption.
pub(crate) fn copy_rest<'a>(
    reader: &mut LogReader,
    mut pos: u64,
    out: &mut PackOutput,
    index: &mut Index,
    locks: &'a StoreLocks,
) -> Result<MutexGuard<'a, ()>> {
    let mut guard = locks.commit();
    loop {
        reader.refresh_end()?;
        let th = match reader.read_txn_header(pos) {
            Ok(th) => th,
            Err(err) => {
                if let PackError::CorruptedData { pos: err_pos, .. } = &err {
                    if *err_pos == reader.refresh_end()? {
                        break;
                    }
                }
                return Err(err);
            }
        };
        // Writers may proceed while this transaction is copied.
        drop(guard);
        pos = copy_transaction(reader, pos, &th, out, index)?;
        guard = locks.commit();
    }
    Ok(guard)
}
