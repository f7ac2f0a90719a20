// ============================================================================
// Identities and field bookkeeping
// ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_DETACHED_KEY: AtomicU64 = AtomicU64::new(1);

/// Arena handle of a state manager inside one persistence context.
///
/// Handles are never reused within a context, so a stale handle can only
/// miss, never alias another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm_{}", self.0)
    }
}

/// Token identifying one detached instance for the length of an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetachedKey(pub u64);

impl DetachedKey {
    pub fn new() -> Self {
        DetachedKey(NEXT_DETACHED_KEY.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for DetachedKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DetachedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detached_{}", self.0)
    }
}

/// Object identity. `Temp` ids stand in for instances whose permanent id
/// has not been assigned by the store yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectId {
    Long(i64),
    Text(String),
    Temp(Uuid),
}

impl ObjectId {
    pub fn temporary() -> Self {
        ObjectId::Temp(Uuid::new_v4())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectId::Temp(_))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Long(v) => write!(f, "{}", v),
            ObjectId::Text(v) => write!(f, "'{}'", v),
            ObjectId::Temp(v) => write!(f, "tmp:{}", v),
        }
    }
}

impl From<i64> for ObjectId {
    fn from(value: i64) -> Self {
        ObjectId::Long(value)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId::Text(value.to_string())
    }
}

/// Optimistic version token. Contexts compare tokens through the store's
/// `compare_version`, never directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Growable bitset over field indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    words: Vec<u64>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Set with every index in `0..len` present.
    pub fn full(len: usize) -> Self {
        let mut set = Self::new();
        for i in 0..len {
            set.insert(i);
        }
        set
    }

    pub fn insert(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .map(|word| word & (1 << (index % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &FieldSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    pub fn difference_with(&mut self, other: &FieldSet) {
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine &= !theirs;
        }
    }

    /// Indexes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| w * 64 + bit)
        })
    }
}

impl FromIterator<usize> for FieldSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = FieldSet::new();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_set_basic_ops() {
        let mut set = FieldSet::new();
        set.insert(3);
        set.insert(70);
        assert!(set.contains(3));
        assert!(set.contains(70));
        assert!(!set.contains(4));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 70]);

        set.remove(70);
        assert!(!set.contains(70));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_field_set_union_and_difference() {
        let mut a: FieldSet = [0, 1, 2].into_iter().collect();
        let b: FieldSet = [2, 100].into_iter().collect();
        a.union_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 1, 2, 100]);
        a.difference_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_object_id_temporary() {
        let tmp = ObjectId::temporary();
        assert!(tmp.is_temporary());
        assert!(!ObjectId::Long(1).is_temporary());
        assert_ne!(ObjectId::temporary(), ObjectId::temporary());
    }
}
