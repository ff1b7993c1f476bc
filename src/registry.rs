//! Packet type registry: maps wire keys to constructors.

use std::any::type_name;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{NetError, Result};
use crate::packet::Packet;

#[derive(Clone, Copy)]
struct Entry {
    type_name: &'static str,
    construct: fn() -> Box<dyn Packet>,
}

fn construct<P: Packet + Default>() -> Box<dyn Packet> {
    Box::new(P::default())
}

/// Table of packet types known to one side of a link.
///
/// Usually built once at startup and shared as `Arc<PacketRegistry>` by every
/// connection; registering later is still safe and immediately visible to
/// receive threads.
#[derive(Default)]
pub struct PacketRegistry {
    entries: RwLock<HashMap<u32, Entry>>,
}

impl PacketRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `P` under the key its default instance reports.
    ///
    /// Fails with [`NetError::DuplicateKey`] if the key is taken, naming both
    /// the registered and the rejected type.
    pub fn register<P: Packet + Default>(&self) -> Result<&Self> {
        let key = P::default().key();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            return Err(NetError::DuplicateKey {
                key,
                existing: existing.type_name,
                attempted: type_name::<P>(),
            });
        }
        entries.insert(key, Entry { type_name: type_name::<P>(), construct: construct::<P> });
        log::trace!("registered packet {} under key {key}", type_name::<P>());
        Ok(self)
    }

    /// Builds a default instance of the type registered under `key`.
    pub fn construct(&self, key: u32) -> Option<Box<dyn Packet>> {
        let construct = self.entries.read().get(&key).map(|e| e.construct)?;
        Some(construct())
    }

    /// Some type is registered under `key`.
    pub fn contains(&self, key: u32) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// Rust type name registered under `key`, for logs.
    pub fn type_name(&self, key: u32) -> Option<&'static str> {
        self.entries.read().get(&key).map(|e| e.type_name)
    }

    /// Registered keys in ascending order.
    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.entries.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Nothing registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read();
        f.debug_map().entries(entries.iter().map(|(k, e)| (k, e.type_name))).finish()
    }
}
