//! Positional access to a storage file.
//!
//! All reads go through `pread`, so a `LogReader` has no seek state of
//! its own and never sees stale buffered data. That matters for the
//! tail merge, which re-reads a file another thread keeps appending to.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{corrupted, PackError, Result};
use crate::format::{
    DataHeader, TxnHeader, DATA_HDR_LEN, METADATA_SIZE, STATUS_CHECKPOINT, STATUS_COMMITTED,
    STATUS_PACKED, TXN_HDR_LEN,
};
use crate::types::{Oid, Tid};

// Re-advise only after the scan advanced this far.
const ADVISE_STEP: u64 = 50 * 1024 * 1024;
// Pages this close behind the scan position stay cached.
const ADVISE_KEEP: u64 = 8 * 1024 * 1024;

/// Tells the kernel that already-scanned pages won't be needed again.
///
/// Best effort only: errors are ignored and non-Linux builds compile
/// the call away.
struct CacheAdvisor {
    last: u64,
}

impl CacheAdvisor {
    fn new() -> Self {
        CacheAdvisor { last: 0 }
    }

    fn scanned(&mut self, file: &File, pos: u64) {
        if pos < self.last + ADVISE_STEP {
            return;
        }
        self.last = pos;
        let len = pos.saturating_sub(ADVISE_KEEP);
        if len == 0 {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let _ = nix::fcntl::posix_fadvise(
                file.as_raw_fd(),
                0,
                len as libc::off_t,
                nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
            );
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (file, len);
        }
    }
}

pub struct LogReader {
    file: File,
    file_end: u64,
    advisor: CacheAdvisor,
}

impl LogReader {
    /// Open a private read handle; the end position is taken from the
    /// current file size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let file_end = file.metadata()?.len();
        Ok(LogReader {
            file,
            file_end,
            advisor: CacheAdvisor::new(),
        })
    }

    /// Wrap an open handle, trusting `file_end` as the scan limit even
    /// if the file has grown past it.
    pub fn with_end(file: File, file_end: u64) -> Self {
        LogReader {
            file,
            file_end,
            advisor: CacheAdvisor::new(),
        }
    }

    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// Re-read the file size; the tail merge calls this while the live
    /// file keeps growing.
    pub fn refresh_end(&mut self) -> Result<u64> {
        self.file_end = self.file.metadata()?.len();
        Ok(self.file_end)
    }

    fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, pos).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                corrupted(pos, "read past end of file")
            } else {
                PackError::Io(err)
            }
        })
    }

    pub fn read_bytes(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_exact_at(&mut buf, pos)?;
        Ok(buf)
    }

    /// Raw 8-byte big-endian read, used for the redundant transaction
    /// trailer.
    pub fn read_num(&self, pos: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(&mut buf, pos)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// The verbatim-copied file prefix.
    pub fn read_metadata(&self) -> Result<Vec<u8>> {
        self.read_bytes(0, METADATA_SIZE)
    }

    pub fn read_txn_header(&self, pos: u64) -> Result<TxnHeader> {
        let mut buf = [0u8; TXN_HDR_LEN as usize];
        self.read_exact_at(&mut buf, pos)?;
        let th = TxnHeader::decode(&buf);
        if th.tid.is_zero() {
            return Err(corrupted(pos, "transaction id is zero"));
        }
        if th.status == STATUS_CHECKPOINT {
            return Err(corrupted(pos, "transaction is still in progress"));
        }
        if th.status != STATUS_COMMITTED && th.status != STATUS_PACKED {
            return Err(corrupted(
                pos,
                format!("invalid transaction status {:?}", th.status as char),
            ));
        }
        if th.tlen < th.header_len() {
            return Err(corrupted(
                pos,
                format!("transaction length {} shorter than its header", th.tlen),
            ));
        }
        let end = pos
            .checked_add(th.tlen)
            .and_then(|end| end.checked_add(8));
        if end.map_or(true, |end| end > self.file_end) {
            return Err(corrupted(
                pos,
                format!(
                    "transaction length {} runs past the end of the file",
                    th.tlen
                ),
            ));
        }
        Ok(th)
    }

    pub fn read_data_header(&self, pos: u64) -> Result<DataHeader> {
        let mut buf = [0u8; DATA_HDR_LEN as usize];
        self.read_exact_at(&mut buf, pos)?;
        let mut dh = DataHeader::decode(&buf);
        if dh.vlen != 0 {
            return Err(PackError::VersionsUnsupported { pos });
        }
        let end = pos.checked_add(dh.record_len());
        if end.map_or(true, |end| end > self.file_end) {
            return Err(corrupted(pos, "data record runs past the end of the file"));
        }
        if dh.tloc >= pos || dh.prev >= pos {
            return Err(corrupted(pos, "data record points forward"));
        }
        if dh.plen == 0 {
            dh.back = self.read_num(pos + DATA_HDR_LEN)?;
            if dh.back >= pos {
                return Err(corrupted(pos, "backpointer points forward"));
            }
        }
        Ok(dh)
    }

    pub fn read_payload(&self, record_pos: u64, plen: u64) -> Result<Vec<u8>> {
        self.read_bytes(record_pos + DATA_HDR_LEN, plen)
    }

    /// Follow a backpointer chain until a concrete payload shows up.
    /// `Ok(None)` means the chain ends in a deletion.
    pub fn load_back(&self, oid: Oid, mut back: u64) -> Result<Option<(Vec<u8>, Tid)>> {
        loop {
            if back == 0 {
                return Ok(None);
            }
            let dh = self.read_data_header(back)?;
            if dh.oid != oid {
                return Err(corrupted(
                    back,
                    format!("backpointer leads to {} instead of {}", dh.oid, oid),
                ));
            }
            if dh.plen > 0 {
                return Ok(Some((self.read_payload(back, dh.plen)?, dh.tid)));
            }
            back = dh.back;
        }
    }

    /// The payload a record stands for: either stored inline or found
    /// at the end of its backpointer chain. `Ok(None)` for deletions.
    pub fn resolve_payload(&self, pos: u64, dh: &DataHeader) -> Result<Option<Vec<u8>>> {
        if dh.plen > 0 {
            Ok(Some(self.read_payload(pos, dh.plen)?))
        } else {
            Ok(self.load_back(dh.oid, dh.back)?.map(|(data, _)| data))
        }
    }

    pub fn advise_scanned(&mut self, pos: u64) {
        self.advisor.scanned(&self.file, pos);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::FILE_MAGIC;
    use std::io::Write;

    fn reader_over(name: &str, body: &[u8]) -> LogReader {
        let dir =
            std::env::temp_dir().join(format!("filepack-reader-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("storage.fs");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&FILE_MAGIC).unwrap();
        file.write_all(body).unwrap();
        LogReader::open(&path).unwrap()
    }

    fn header_bytes(tid: u64, tlen: u64, status: u8) -> Vec<u8> {
        let th = TxnHeader {
            tid: Tid::from_int(tid),
            tlen,
            status,
            ulen: 0,
            dlen: 0,
            elen: 0,
        };
        th.encode().to_vec()
    }

    fn corrupted_at(result: crate::error::Result<TxnHeader>) -> u64 {
        match result {
            Err(PackError::CorruptedData { pos, .. }) => pos,
            other => panic!("expected corruption, got {:?}", other.map(|th| th.tlen)),
        }
    }

    #[test]
    fn reading_past_the_end_reports_the_end_position() {
        let reader = reader_over("eof", &[]);
        let end = reader.file_end();
        assert_eq!(corrupted_at(reader.read_txn_header(end)), end);
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let mut body = header_bytes(0, 100, STATUS_COMMITTED);
        body.extend_from_slice(&[0u8; 200]);
        let reader = reader_over("zero-tid", &body);
        assert_eq!(corrupted_at(reader.read_txn_header(4)), 4);

        let mut body = header_bytes(9, 100, STATUS_CHECKPOINT);
        body.extend_from_slice(&[0u8; 200]);
        let reader = reader_over("in-progress", &body);
        assert_eq!(corrupted_at(reader.read_txn_header(4)), 4);

        // Length running past the end of the file.
        let body = header_bytes(9, 5000, STATUS_COMMITTED);
        let reader = reader_over("overlong", &body);
        assert_eq!(corrupted_at(reader.read_txn_header(4)), 4);
    }

    #[test]
    fn versioned_records_are_refused() {
        let mut dh = DataHeader {
            oid: Oid::from_int(1),
            tid: Tid::from_int(9),
            prev: 0,
            tloc: 0,
            vlen: 7,
            plen: 3,
            back: 0,
        };
        let mut body = dh.encode().to_vec();
        body.extend_from_slice(b"abc");
        let reader = reader_over("versioned", &body);
        assert!(matches!(
            reader.read_data_header(4),
            Err(PackError::VersionsUnsupported { pos: 4 })
        ));

        dh.vlen = 0;
        let mut body = dh.encode().to_vec();
        body.extend_from_slice(b"abc");
        let reader = reader_over("plain", &body);
        let decoded = reader.read_data_header(4).unwrap();
        assert_eq!(decoded.plen, 3);
        assert_eq!(reader.read_payload(4, decoded.plen).unwrap(), b"abc");
    }
}
