//! Device-global receiver-index table
//!
//! Every in-flight handshake and installed keypair owns a random 32-bit
//! local index; the peer embeds it in wire messages so the device can
//! route them without touching peer state. Indices are drawn from the OS
//! RNG and redrawn on collision.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::RngCore;

/// What a local index currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPurpose {
    Handshake,
    Keypair,
}

/// Map from local index to `(purpose, owner)`.
pub struct IndexTable<T> {
    entries: RwLock<HashMap<u32, (IndexPurpose, T)>>,
}

impl<T: Clone> Default for IndexTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IndexTable<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh index for `owner`.
    pub fn assign(&self, purpose: IndexPurpose, owner: T) -> u32 {
        let mut entries = self.entries.write();
        loop {
            let candidate = rand::rngs::OsRng.next_u32();
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(candidate) {
                slot.insert((purpose, owner));
                return candidate;
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<(IndexPurpose, T)> {
        self.entries.read().get(&index).cloned()
    }

    /// A completed handshake keeps its index; only the purpose changes.
    pub fn set_purpose(&self, index: u32, purpose: IndexPurpose) {
        if let Some(entry) = self.entries.write().get_mut(&index) {
            entry.0 = purpose;
        }
    }

    pub fn remove(&self, index: u32) {
        self.entries.write().remove(&index);
    }

    pub fn remove_all(&self, indices: impl IntoIterator<Item = u32>) {
        let mut entries = self.entries.write();
        for index in indices {
            entries.remove(&index);
        }
    }

    /// Drop every entry whose owner matches.
    pub fn retain(&self, keep: impl Fn(&T) -> bool) {
        self.entries.write().retain(|_, (_, owner)| keep(owner));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
