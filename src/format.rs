//! Bit-exact layout of the storage file.
//!
//! The file starts with a fixed 4-byte magic, followed by transaction
//! records back to back. A transaction is
//!
//! ```text
//! tid(8) tlen(8) status(1) ulen(2) dlen(2) elen(2) user desc ext
//! <data records> tlen(8)
//! ```
//!
//! where `tlen` covers everything up to, but excluding, the redundant
//! trailer copy (the trailer enables reverse scans). A data record is
//!
//! ```text
//! oid(8) tid(8) prev(8) tloc(8) vlen(2) plen(8) <payload>
//! ```
//!
//! with an 8-byte backpointer in place of the payload when `plen` is
//! zero. A zero backpointer marks the deletion of the object. All
//! integers are big-endian.

use crate::types::{Oid, Tid};

pub const FILE_MAGIC: [u8; 4] = *b"FPK1";

/// Size of the verbatim-copied file prefix.
pub const METADATA_SIZE: u64 = 4;

/// Fixed part of a transaction header.
pub const TXN_HDR_LEN: u64 = 23;

/// Fixed part of a data record header.
pub const DATA_HDR_LEN: u64 = 42;

pub const STATUS_COMMITTED: u8 = b' ';
pub const STATUS_PACKED: u8 = b'p';
pub const STATUS_CHECKPOINT: u8 = b'c';

#[derive(Debug, Clone)]
pub struct TxnHeader {
    pub tid: Tid,
    /// Transaction length excluding the 8-byte trailer.
    pub tlen: u64,
    pub status: u8,
    pub ulen: u16,
    pub dlen: u16,
    pub elen: u16,
}

impl TxnHeader {
    pub fn decode(buf: &[u8; TXN_HDR_LEN as usize]) -> Self {
        TxnHeader {
            tid: Tid([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            tlen: u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            status: buf[16],
            ulen: u16::from_be_bytes([buf[17], buf[18]]),
            dlen: u16::from_be_bytes([buf[19], buf[20]]),
            elen: u16::from_be_bytes([buf[21], buf[22]]),
        }
    }

    pub fn encode(&self) -> [u8; TXN_HDR_LEN as usize] {
        let mut buf = [0u8; TXN_HDR_LEN as usize];
        buf[..8].copy_from_slice(self.tid.as_bytes());
        buf[8..16].copy_from_slice(&self.tlen.to_be_bytes());
        buf[16] = self.status;
        buf[17..19].copy_from_slice(&self.ulen.to_be_bytes());
        buf[19..21].copy_from_slice(&self.dlen.to_be_bytes());
        buf[21..23].copy_from_slice(&self.elen.to_be_bytes());
        buf
    }

    /// Header length including the variable user/desc/ext metadata.
    pub fn header_len(&self) -> u64 {
        TXN_HDR_LEN + u64::from(self.ulen) + u64::from(self.dlen) + u64::from(self.elen)
    }
}

#[derive(Debug, Clone)]
pub struct DataHeader {
    pub oid: Oid,
    pub tid: Tid,
    /// Position of the previous revision of the same object, 0 if none.
    pub prev: u64,
    /// Position of the enclosing transaction header.
    pub tloc: u64,
    pub vlen: u16,
    pub plen: u64,
    /// Backpointer, only meaningful when `plen` is zero.
    pub back: u64,
}

impl DataHeader {
    pub fn decode(buf: &[u8; DATA_HDR_LEN as usize]) -> Self {
        DataHeader {
            oid: Oid([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            tid: Tid([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            prev: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            tloc: u64::from_be_bytes([
                buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
            ]),
            vlen: u16::from_be_bytes([buf[32], buf[33]]),
            plen: u64::from_be_bytes([
                buf[34], buf[35], buf[36], buf[37], buf[38], buf[39], buf[40], buf[41],
            ]),
            back: 0,
        }
    }

    pub fn encode(&self) -> [u8; DATA_HDR_LEN as usize] {
        let mut buf = [0u8; DATA_HDR_LEN as usize];
        buf[..8].copy_from_slice(self.oid.as_bytes());
        buf[8..16].copy_from_slice(self.tid.as_bytes());
        buf[16..24].copy_from_slice(&self.prev.to_be_bytes());
        buf[24..32].copy_from_slice(&self.tloc.to_be_bytes());
        buf[32..34].copy_from_slice(&self.vlen.to_be_bytes());
        buf[34..42].copy_from_slice(&self.plen.to_be_bytes());
        buf
    }

    /// Bytes the record occupies in the file, header included.
    pub fn record_len(&self) -> u64 {
        DATA_HDR_LEN.saturating_add(if self.plen == 0 { 8 } else { self.plen })
    }

    /// A record with neither payload nor backpointer marks a deletion.
    pub fn is_deletion(&self) -> bool {
        self.plen == 0 && self.back == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txn_header_round_trip() {
        let th = TxnHeader {
            tid: Tid::from_int(42),
            tlen: 1234,
            status: STATUS_COMMITTED,
            ulen: 3,
            dlen: 0,
            elen: 17,
        };
        let decoded = TxnHeader::decode(&th.encode());
        assert_eq!(decoded.tid, th.tid);
        assert_eq!(decoded.tlen, 1234);
        assert_eq!(decoded.status, STATUS_COMMITTED);
        assert_eq!(decoded.header_len(), TXN_HDR_LEN + 3 + 17);
    }

    #[test]
    fn data_header_round_trip() {
        let dh = DataHeader {
            oid: Oid::from_int(7),
            tid: Tid::from_int(42),
            prev: 100,
            tloc: 4,
            vlen: 0,
            plen: 11,
            back: 0,
        };
        let decoded = DataHeader::decode(&dh.encode());
        assert_eq!(decoded.oid, dh.oid);
        assert_eq!(decoded.prev, 100);
        assert_eq!(decoded.plen, 11);
        assert_eq!(decoded.record_len(), DATA_HDR_LEN + 11);
    }

    #[test]
    fn backpointer_records_reserve_eight_bytes() {
        let mut dh = DataHeader {
            oid: Oid::from_int(7),
            tid: Tid::from_int(42),
            prev: 0,
            tloc: 4,
            vlen: 0,
            plen: 0,
            back: 0,
        };
        assert_eq!(dh.record_len(), DATA_HDR_LEN + 8);
        assert!(dh.is_deletion());
        dh.back = 99;
        assert!(!dh.is_deletion());
    }
}
