//! Point-in-time snapshot of a storage file.
//!
//! Writes a new file containing just the current records as of a given
//! time, suitable as the basis of a demo or staging copy. Nothing is
//! garbage collected and the tail is not copied, so the result is the
//! storage exactly as a reader would have seen it back then.

use std::path::Path;
use std::sync::Arc;

use crate::error::{PackError, Result};
use crate::pack::copy::PackOutput;
use crate::pack::{PackHooks, PackOptions, PackProcess};
use crate::types::Tid;

/// Copy the records current at `stop` from `path` into `out_path`.
/// Returns the size of the snapshot file.
pub fn snapshot_in_time<P: AsRef<Path>, Q: AsRef<Path>>(
    path: P,
    stop: Tid,
    out_path: Q,
) -> Result<u64> {
    if stop.is_zero() {
        return Err(PackError::InvalidPackTime);
    }
    let path = path.as_ref();
    let file_end = std::fs::metadata(path)?.len();

    let options = PackOptions::new().gc(false);
    let mut process = PackProcess::new(
        path,
        stop,
        file_end,
        &options,
        Arc::new(PackHooks::default()),
        false,
    )?;
    let scan = process.build_pack_index()?;
    let mut out = PackOutput::create(out_path.as_ref())?;
    process.copy_to_packtime(scan.cutoff_pos, &scan.index, &mut out)?;
    out.finish()
}
