//! Offline packer for append-only transactional file storages.
//!
//! A storage file is a fixed metadata prefix followed by a log of
//! transactions, each carrying data records keyed by 8-byte object ids.
//! Packing produces a new, smaller file containing only the data still
//! reachable as of a cutoff transaction id, while the original file
//! keeps accepting writes. The tail written during the pack is merged
//! under the host's commit lock before the files are swapped.
//!
//! See [`pack::Packer`] for the entry point and [`format`] for the
//! record layout.

pub mod error;
pub mod types;
pub mod format;
pub mod tools;
pub mod reader;
pub mod mru;
pub mod references;
pub mod index;
pub mod gc;
pub mod pack;
pub mod snapshot;

pub use error::PackError;
pub use index::Index;
pub use pack::{PackHooks, PackOptions, Packer, StoreLocks};
pub use types::{Oid, Tid, TimeStamp};
