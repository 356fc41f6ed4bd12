//! Small filesystem helpers shared by the packer.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use nix::sys::stat;
use nix::unistd;

// Unlinks the temporary unless the rename went through.
struct PendingFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = unistd::unlink(&self.path);
        }
    }
}

fn sys_err(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

/// Write `data` to `path` atomically.
///
/// The data goes to a mkstemp sibling first and is renamed over the
/// target, so readers either see the old or the new content. When the
/// target already exists its permissions carry over to the new file;
/// the index sidecar keeps the storage's modes across packs that way.
/// mkstemp is used because it stays safe across processes and threads
/// sharing the directory.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();

    let mode = match stat::stat(path) {
        Ok(st) => stat::Mode::from_bits_truncate(st.st_mode),
        Err(_) => {
            stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
        }
    };

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = unistd::mkstemp(&template)
        .map_err(|err| sys_err(format!("mkstemp {:?} failed: {}", template, err)))?;
    let mut pending = PendingFile {
        path: tmp_path,
        committed: false,
    };

    stat::fchmod(fd, mode)
        .map_err(|err| sys_err(format!("fchmod {:?} failed: {}", pending.path, err)))?;

    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(data)?;
    drop(file);

    std::fs::rename(&pending.path, path)?;
    pending.committed = true;

    Ok(())
}
