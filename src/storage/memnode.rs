//! In-memory mirror of a leaf used by split and reorganization: objects
//! deserialized and kept sorted ascending by distance to the
//! representative, with byte-footprint accounting that simulates the
//! physical page occupation.

use crate::error::{Error, Result};
use crate::object::Object;

use super::node::{LeafNode, LEAF_ENTRY_LEN};

struct MemEntry<O> {
    object: O,
    distance: f64,
}

/// Transient leaf mirror. `maximum_size` caps the simulated footprint;
/// `used_size` tracks entry overhead plus serialized object bytes.
pub struct MemoryLeafNode<O> {
    entries: Vec<MemEntry<O>>,
    maximum_size: usize,
    used_size: usize,
}

impl<O: Object> MemoryLeafNode<O> {
    pub fn new(maximum_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            maximum_size,
            used_size: 0,
        }
    }

    /// Build a mirror by draining a leaf: every object is deserialized and
    /// inserted in ascending distance order; the source leaf is emptied.
    pub fn from_leaf(leaf: &mut LeafNode<'_>, maximum_size: usize) -> Result<Self> {
        let mut node = Self::new(maximum_size);
        for idx in 0..leaf.num_entries() {
            let object = O::from_bytes(leaf.object(idx))?;
            let distance = leaf.entry(idx).distance;
            if !node.add(object, distance) {
                return Err(Error::Invariant(
                    "leaf contents exceed memory node capacity".into(),
                ));
            }
        }
        leaf.remove_all();
        Ok(node)
    }

    /// True when the object's footprint still fits.
    pub fn can_add(&self, object: &O) -> bool {
        self.used_size + LEAF_ENTRY_LEN + object.serialized_size() <= self.maximum_size
    }

    /// Insert in sorted position. Returns false (no side effect) when the
    /// simulated footprint would overflow.
    pub fn add(&mut self, object: O, distance: f64) -> bool {
        if !self.can_add(&object) {
            return false;
        }
        self.used_size += LEAF_ENTRY_LEN + object.serialized_size();
        let at = self.entries.partition_point(|e| e.distance <= distance);
        self.entries.insert(at, MemEntry { object, distance });
        true
    }

    pub fn remove(&mut self, idx: usize) -> (O, f64) {
        let e = self.entries.remove(idx);
        self.used_size -= LEAF_ENTRY_LEN + e.object.serialized_size();
        (e.object, e.distance)
    }

    /// Remove and return the entry farthest from the representative.
    pub fn pop_last(&mut self) -> Option<(O, f64)> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove(self.entries.len() - 1))
    }

    pub fn object_at(&self, idx: usize) -> &O {
        &self.entries[idx].object
    }

    pub fn distance_at(&self, idx: usize) -> f64 {
        self.entries[idx].distance
    }

    /// The representative (smallest distance).
    pub fn rep_object(&self) -> Option<&O> {
        self.entries.first().map(|e| &e.object)
    }

    /// The object farthest from the representative.
    pub fn last_object(&self) -> Option<&O> {
        self.entries.last().map(|e| &e.object)
    }

    /// Distance of the last entry: the covering radius of the mirrored
    /// leaf.
    pub fn minimum_radius(&self) -> f64 {
        self.entries.last().map_or(0.0, |e| e.distance)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn free_size(&self) -> usize {
        self.maximum_size - self.used_size
    }

    /// Write all entries back into a leaf in ascending distance order,
    /// consuming the mirror. The target leaf is cleared first.
    pub fn release_into(self, leaf: &mut LeafNode<'_>) -> Result<()> {
        leaf.remove_all();
        for e in self.entries {
            if leaf.add_entry(&e.object.to_bytes(), e.distance).is_none() {
                return Err(Error::Invariant(
                    "rebuilt leaf does not fit its page".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VectorObject;
    use crate::storage::page::Page;

    fn obj(oid: u32, x: f64) -> VectorObject {
        VectorObject::new(oid, "", vec![x])
    }

    #[test]
    fn add_keeps_sorted_and_tracks_size() {
        let mut m = MemoryLeafNode::new(4096);
        assert!(m.add(obj(1, 1.0), 3.0));
        assert!(m.add(obj(2, 2.0), 1.0));
        assert!(m.add(obj(3, 3.0), 2.0));
        assert_eq!(m.len(), 3);
        assert_eq!(m.distance_at(0), 1.0);
        assert_eq!(m.distance_at(2), 3.0);
        assert_eq!(m.rep_object().unwrap().oid(), Some(2));
        assert_eq!(m.last_object().unwrap().oid(), Some(1));
        assert_eq!(m.minimum_radius(), 3.0);
        let per = LEAF_ENTRY_LEN + obj(1, 1.0).serialized_size();
        assert_eq!(m.used_size(), 3 * per);
    }

    #[test]
    fn add_refuses_overflow() {
        let size = obj(0, 0.0).serialized_size();
        let mut m = MemoryLeafNode::new(2 * (LEAF_ENTRY_LEN + size));
        assert!(m.add(obj(1, 0.0), 0.0));
        assert!(m.add(obj(2, 0.0), 1.0));
        assert!(!m.can_add(&obj(3, 0.0)));
        assert!(!m.add(obj(3, 0.0), 2.0));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn pop_last_removes_farthest() {
        let mut m = MemoryLeafNode::new(4096);
        m.add(obj(1, 0.0), 0.0);
        m.add(obj(2, 0.0), 5.0);
        let (o, d) = m.pop_last().unwrap();
        assert_eq!(o.oid(), Some(2));
        assert_eq!(d, 5.0);
        assert_eq!(m.minimum_radius(), 0.0);
    }

    #[test]
    fn drain_and_release_roundtrip() {
        let mut page = Page::new(2, 512);
        let mut leaf = LeafNode::create(&mut page);
        for (i, d) in [(1u32, 0.0), (2, 2.0), (3, 1.0)] {
            leaf.add_entry(&obj(i, i as f64).to_bytes(), d).unwrap();
        }
        let m: MemoryLeafNode<VectorObject> =
            MemoryLeafNode::from_leaf(&mut leaf, 512).unwrap();
        assert_eq!(leaf.num_entries(), 0);
        assert_eq!(m.len(), 3);
        assert_eq!(m.distance_at(0), 0.0);
        assert_eq!(m.distance_at(1), 1.0);
        assert_eq!(m.distance_at(2), 2.0);
        m.release_into(&mut leaf).unwrap();
        assert_eq!(leaf.num_entries(), 3);
        assert_eq!(leaf.entry(0).distance, 0.0);
        assert_eq!(leaf.entry(1).distance, 1.0);
        assert_eq!(leaf.entry(2).distance, 2.0);
        let back = VectorObject::from_bytes(leaf.object(0)).unwrap();
        assert_eq!(back.oid(), Some(1));
    }
}
