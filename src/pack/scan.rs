//! First pass over the file: current-object index and reference graph.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::error::{corrupted, Result};
use crate::format::{DataHeader, TxnHeader, METADATA_SIZE, STATUS_PACKED};
use crate::index::Index;
use crate::references::Refs;

use super::PackProcess;

pub(crate) struct ScanOutcome {
    /// Every transaction in range already carried the packed status.
    pub(crate) packed: bool,
    pub(crate) index: Index,
    /// Position of the first transaction after the pack time.
    pub(crate) cutoff_pos: u64,
}

impl PackProcess {
    /// Scan `[metadata, file_end)` up to the pack time, recording the
    /// newest record position of every object.
    ///
    /// Deletion markers stay in the index: if the object turns out to
    /// be referenced from somewhere live, its tombstone has to survive
    /// the pack.
    pub(crate) fn build_pack_index(&mut self) -> Result<ScanOutcome> {
        let mut pos = METADATA_SIZE;
        let mut packed = true;
        let mut index = Index::new();

        while pos < self.reader.file_end() {
            let started = Instant::now();
            let th = self.reader.read_txn_header(pos)?;
            if th.tid > self.stop {
                break;
            }
            self.check_txn(&th, pos)?;
            if th.status != STATUS_PACKED {
                packed = false;
            }

            let tpos = pos;
            let tend = pos + th.tlen;
            pos += th.header_len();
            while pos < tend {
                let dh = self.reader.read_data_header(pos)?;
                self.check_data(&th, tpos, &dh, pos)?;
                index.insert(dh.oid, pos);
                if self.gc {
                    self.record_references(pos, &dh, false)?;
                }
                pos += dh.record_len();
            }

            self.check_trailer(pos, &th)?;
            pos += 8;
            self.reader.advise_scanned(pos);
            self.throttle.pace(started);
        }

        Ok(ScanOutcome {
            packed,
            index,
            cutoff_pos: pos,
        })
    }

    /// Merge the references made after the pack time into the graph.
    ///
    /// Objects created back then are not indexed - they are copied
    /// wholesale later - but their references can keep pre-pack-time
    /// objects alive, so they have to take part in the mark phase.
    pub(crate) fn update_references(&mut self, mut pos: u64) -> Result<()> {
        while pos < self.reader.file_end() {
            let started = Instant::now();
            let th = self.reader.read_txn_header(pos)?;
            self.check_txn(&th, pos)?;

            let tpos = pos;
            let tend = pos + th.tlen;
            pos += th.header_len();
            while pos < tend {
                let dh = self.reader.read_data_header(pos)?;
                self.check_data(&th, tpos, &dh, pos)?;
                self.record_references(pos, &dh, true)?;
                pos += dh.record_len();
            }

            self.check_trailer(pos, &th)?;
            pos += 8;
            self.reader.advise_scanned(pos);
            self.throttle.pace(started);
        }
        Ok(())
    }

    /// Store what the record's payload references, merged with the
    /// already-known references when `merge` is set.
    ///
    /// A record that resolves to no payload contributes nothing: the
    /// existing entry stays (or goes away if there is none), matching
    /// how a deletion hides the object without forgetting who pointed
    /// at it.
    fn record_references(&mut self, pos: u64, dh: &DataHeader, merge: bool) -> Result<()> {
        let ioid = dh.oid.as_int();
        let initial = if merge { self.refs.get(ioid)? } else { None };

        let refs = match self.reader.resolve_payload(pos, dh)? {
            None => initial,
            Some(data) => {
                let data = match &self.hooks.untransform {
                    Some(untransform) => untransform(&data),
                    None => data,
                };
                let extract = match &self.hooks.references {
                    Some(extract) => extract,
                    None => return Ok(()),
                };
                let targets = extract(&data).map_err(|err| {
                    corrupted(pos, format!("reference extraction failed - {}", err))
                })?;
                if targets.is_empty() {
                    initial
                } else {
                    let mut set: BTreeSet<u64> =
                        targets.iter().map(|oid| oid.as_int()).collect();
                    if let Some(initial) = initial {
                        set.extend(initial.to_vec());
                    }
                    Refs::from_set(set)
                }
            }
        };

        match refs {
            Some(refs) => self.refs.set(ioid, refs),
            None => self.refs.remove(ioid),
        }
    }

    fn check_txn(&mut self, th: &TxnHeader, pos: u64) -> Result<()> {
        if th.tid < self.ltid {
            return Err(corrupted(
                pos,
                format!("transaction id {} went backwards (after {})", th.tid, self.ltid),
            ));
        }
        self.ltid = th.tid;
        Ok(())
    }

    fn check_data(&self, th: &TxnHeader, tpos: u64, dh: &DataHeader, pos: u64) -> Result<()> {
        if dh.tloc != tpos {
            return Err(corrupted(
                pos,
                format!(
                    "data record claims transaction position {} instead of {}",
                    dh.tloc, tpos
                ),
            ));
        }
        if dh.tid != th.tid {
            return Err(corrupted(
                pos,
                format!(
                    "data record id {} does not match its transaction {}",
                    dh.tid, th.tid
                ),
            ));
        }
        Ok(())
    }

    fn check_trailer(&self, pos: u64, th: &TxnHeader) -> Result<()> {
        let tlen = self.reader.read_num(pos)?;
        if tlen != th.tlen {
            return Err(corrupted(
                pos,
                format!(
                    "redundant transaction length {} does not match initial transaction length {}",
                    tlen, th.tlen
                ),
            ));
        }
        Ok(())
    }
}
