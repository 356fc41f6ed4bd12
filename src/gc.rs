//! Mark-phase reachability over the object graph.

use crate::error::Result;
use crate::index::Index;
use crate::references::{Refs, ReferenceStore};
use crate::types::Oid;

/// Walk the reference graph from the root object and return the index
/// restricted to reached objects.
///
/// Objects referenced only by post-cutoff revisions have no entry in
/// `index`; they are recorded with position 0 so the copy passes know
/// they are wanted even though no pre-cutoff record exists. The store
/// is consumed: entries are popped as they are marked and the rest is
/// cleared (which also removes any scratch directory).
pub fn mark(index: &Index, references: &mut dyn ReferenceStore) -> Result<Index> {
    let mut to_do: Vec<u64> = vec![0];
    let mut reachable = Index::new();

    while let Some(ioid) = to_do.pop() {
        let oid = Oid::from_int(ioid);
        if reachable.contains(&oid) {
            continue;
        }
        reachable.insert(oid, index.get(&oid).unwrap_or(0));

        match references.take(ioid)? {
            Some(Refs::One(target)) => to_do.push(target),
            Some(Refs::Many(targets)) => to_do.extend(targets),
            None => {}
        }
    }

    references.clear()?;
    Ok(reachable)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::references::MemoryReferences;

    fn set(store: &mut MemoryReferences, ioid: u64, targets: &[u64]) {
        let refs = match targets {
            [one] => Refs::One(*one),
            many => Refs::Many(many.to_vec()),
        };
        store.set(ioid, refs).unwrap();
    }

    #[test]
    fn unreferenced_objects_are_dropped() {
        let mut index = Index::new();
        for i in 0..5u64 {
            index.insert(Oid::from_int(i), 100 + i);
        }
        let mut refs = MemoryReferences::new();
        set(&mut refs, 0, &[1, 2]);
        set(&mut refs, 2, &[3]);
        // 4 is referenced by nothing, 3 is a leaf.
        set(&mut refs, 4, &[1]);

        let reachable = mark(&index, &mut refs).unwrap();
        assert_eq!(reachable.len(), 4);
        assert!(reachable.contains(&Oid::from_int(0)));
        assert!(reachable.contains(&Oid::from_int(3)));
        assert!(!reachable.contains(&Oid::from_int(4)));
        assert_eq!(reachable.get(&Oid::from_int(3)), Some(103));
    }

    #[test]
    fn cycles_terminate() {
        let mut index = Index::new();
        for i in 0..3u64 {
            index.insert(Oid::from_int(i), 100 + i);
        }
        let mut refs = MemoryReferences::new();
        set(&mut refs, 0, &[1]);
        set(&mut refs, 1, &[2]);
        set(&mut refs, 2, &[0, 1]);

        let reachable = mark(&index, &mut refs).unwrap();
        assert_eq!(reachable.len(), 3);
    }

    #[test]
    fn unindexed_targets_get_position_zero() {
        let mut index = Index::new();
        index.insert(Oid::ZERO, 4);
        let mut refs = MemoryReferences::new();
        // The root references an object only created after the cutoff.
        set(&mut refs, 0, &[9]);

        let reachable = mark(&index, &mut refs).unwrap();
        assert_eq!(reachable.get(&Oid::from_int(9)), Some(0));
    }
}
