//! Object-reference storage for the garbage collector.
//!
//! The graph maps the integer form of an object id to the objects its
//! current payload references. Most objects reference exactly one
//! other object, so that case is stored unboxed. Two interchangeable
//! back ends exist: a purely in-memory one, and one spilling fixed
//! binary buckets to a scratch directory for databases whose graph
//! does not fit in memory.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::mru::Mru;

/// Outbound references of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refs {
    One(u64),
    Many(Vec<u64>),
}

impl Refs {
    /// Build from a de-duplicated set; `None` when the set is empty.
    pub fn from_set(set: BTreeSet<u64>) -> Option<Refs> {
        match set.len() {
            0 => None,
            1 => set.into_iter().next().map(Refs::One),
            _ => Some(Refs::Many(set.into_iter().collect())),
        }
    }

    pub fn to_vec(&self) -> Vec<u64> {
        match self {
            Refs::One(ioid) => vec![*ioid],
            Refs::Many(v) => v.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Refs::One(_) => 1,
            Refs::Many(v) => v.len(),
        }
    }
}

pub trait ReferenceStore: Send {
    fn get(&mut self, ioid: u64) -> Result<Option<Refs>>;
    fn set(&mut self, ioid: u64, refs: Refs) -> Result<()>;
    fn remove(&mut self, ioid: u64) -> Result<()>;

    /// Fetch and remove in one step; the mark phase consumes entries
    /// as it walks them.
    fn take(&mut self, ioid: u64) -> Result<Option<Refs>> {
        let refs = self.get(ioid)?;
        if refs.is_some() {
            self.remove(ioid)?;
        }
        Ok(refs)
    }

    /// Drop everything, including any on-disk scratch state.
    fn clear(&mut self) -> Result<()>;
}

// Object ids are split at 2^31 into a bucket number and a 31-bit
// remainder so the per-bucket tables get away with 32-bit keys.
const BUCKET_SHIFT: u32 = 31;
const SUB_MASK: u64 = (1 << BUCKET_SHIFT) - 1;

#[derive(Default)]
struct MemoryBucket {
    single: HashMap<u32, u64>,
    general: HashMap<u32, Vec<u64>>,
}

/// In-process reference store.
#[derive(Default)]
pub struct MemoryReferences {
    buckets: HashMap<u32, MemoryBucket>,
}

impl MemoryReferences {
    pub fn new() -> Self {
        Default::default()
    }

    fn split(ioid: u64) -> (u32, u32) {
        ((ioid >> BUCKET_SHIFT) as u32, (ioid & SUB_MASK) as u32)
    }
}

impl ReferenceStore for MemoryReferences {
    fn get(&mut self, ioid: u64) -> Result<Option<Refs>> {
        let (bucket, sub) = Self::split(ioid);
        let bucket = match self.buckets.get(&bucket) {
            Some(bucket) => bucket,
            None => return Ok(None),
        };
        if let Some(single) = bucket.single.get(&sub) {
            return Ok(Some(Refs::One(*single)));
        }
        Ok(bucket.general.get(&sub).map(|v| Refs::Many(v.clone())))
    }

    fn set(&mut self, ioid: u64, refs: Refs) -> Result<()> {
        let (bucket, sub) = Self::split(ioid);
        let bucket = self.buckets.entry(bucket).or_default();
        match refs {
            Refs::One(target) => {
                bucket.general.remove(&sub);
                bucket.single.insert(sub, target);
            }
            Refs::Many(targets) => {
                bucket.single.remove(&sub);
                bucket.general.insert(sub, targets);
            }
        }
        Ok(())
    }

    fn remove(&mut self, ioid: u64) -> Result<()> {
        let (bucket, sub) = Self::split(ioid);
        if let Some(bucket) = self.buckets.get_mut(&bucket) {
            bucket.single.remove(&sub);
            bucket.general.remove(&sub);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.buckets.clear();
        Ok(())
    }
}

pub const DEFAULT_ENTRY_SIZE: u64 = 256;
pub const DEFAULT_CACHE_SIZE: usize = 999;

#[derive(Default)]
struct RefBucket {
    entries: HashMap<u64, Refs>,
    dirty: bool,
}

// Scratch format, per entry: ioid(8) n(4) n * target(8), big-endian.
// The files live only for the duration of one pack, so there is no
// compatibility requirement.
fn write_bucket(path: &Path, bucket: &RefBucket) -> std::io::Result<()> {
    let mut buf = Vec::new();
    for (ioid, refs) in &bucket.entries {
        buf.extend_from_slice(&ioid.to_be_bytes());
        let targets = refs.to_vec();
        buf.extend_from_slice(&(targets.len() as u32).to_be_bytes());
        for target in targets {
            buf.extend_from_slice(&target.to_be_bytes());
        }
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)
}

fn read_bucket(path: &Path) -> std::io::Result<RefBucket> {
    let mut raw = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let mut entries = HashMap::new();
    let mut pos = 0;
    let num = |raw: &[u8], pos: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[pos..pos + 8]);
        u64::from_be_bytes(buf)
    };
    while pos < raw.len() {
        let ioid = num(&raw, pos);
        let count = u32::from_be_bytes([raw[pos + 8], raw[pos + 9], raw[pos + 10], raw[pos + 11]]);
        pos += 12;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(num(&raw, pos));
            pos += 8;
        }
        if let Some(refs) = Refs::from_set(set) {
            entries.insert(ioid, refs);
        }
    }
    Ok(RefBucket {
        entries,
        dirty: false,
    })
}

/// Disk-spilling reference store.
///
/// Entries are grouped into buckets of `entry_size` object ids; a
/// bounded MRU cache keeps the hot buckets resident and flushes dirty
/// ones to `<dir>/<hex-key>` on eviction.
pub struct FileReferences {
    dir: PathBuf,
    entry_size: u64,
    cache: Mru<u64, RefBucket>,
}

impl FileReferences {
    pub fn new(dir: PathBuf, entry_size: u64, cache_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let flush_dir = dir.clone();
        let cache = Mru::new(
            cache_size,
            Box::new(move |key: &u64, bucket: RefBucket| {
                if !bucket.dirty {
                    return;
                }
                let path = flush_dir.join(format!("{:x}", key));
                if let Err(err) = write_bucket(&path, &bucket) {
                    // Losing spilled references would corrupt the
                    // reachability result, so give up on the pack.
                    panic!("unable to write reference bucket {:?} - {}", path, err);
                }
            }),
        );
        Ok(FileReferences {
            dir,
            entry_size,
            cache,
        })
    }

    fn bucket_path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{:x}", key))
    }

    fn resident(&mut self, key: u64) -> Result<&mut RefBucket> {
        if self.cache.get(&key).is_none() {
            let bucket = read_bucket(&self.bucket_path(key))?;
            self.cache.insert(key, bucket);
        }
        Ok(self.cache.get_mut(&key).unwrap())
    }
}

impl ReferenceStore for FileReferences {
    fn get(&mut self, ioid: u64) -> Result<Option<Refs>> {
        let key = ioid / self.entry_size;
        let bucket = self.resident(key)?;
        Ok(bucket.entries.get(&ioid).cloned())
    }

    fn set(&mut self, ioid: u64, refs: Refs) -> Result<()> {
        let key = ioid / self.entry_size;
        let bucket = self.resident(key)?;
        bucket.entries.insert(ioid, refs);
        bucket.dirty = true;
        Ok(())
    }

    fn remove(&mut self, ioid: u64) -> Result<()> {
        let key = ioid / self.entry_size;
        let bucket = self.resident(key)?;
        if bucket.entries.remove(&ioid).is_some() {
            bucket.dirty = true;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        // No point flushing buckets that are about to be unlinked.
        self.cache.reset();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for FileReferences {
    fn drop(&mut self) {
        let _ = self.clear();
    }
}
