//! Prepared-statement bookkeeping per client connection. Entries exist
//! exactly for statements the backend acknowledged with a prepare OK; the
//! reserved direct-execute id resolves to the most recent prepare.

use crate::buffer::BufChain;
use crate::hint::Hint;
use crate::protocol::mysql::constants::PS_DIRECT_EXEC_ID;

use byteorder::{ByteOrder, LittleEndian};

#[derive(Debug, Clone, Default)]
pub struct PsEntry {
    pub params: u16,
    pub columns: u16,
    /// Hints the filter chain carries over to every execution of this
    /// statement.
    pub hints: Vec<Hint>,
}

#[derive(Debug, Default)]
pub struct PsRegistry {
    entries: hashbrown::HashMap<u32, PsEntry>,
    last_prepare_id: u32,
}

impl PsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful prepare. Failed prepares never get here.
    pub fn register(&mut self, id: u32, params: u16, columns: u16) {
        self.entries.insert(
            id,
            PsEntry {
                params,
                columns,
                hints: Vec::new(),
            },
        );
        self.last_prepare_id = id;
    }

    /// Resolves a wire statement id to a concrete one. The reserved
    /// direct-execute id maps to the most recent prepare; `None` when there
    /// is nothing to resolve to or the id is unknown.
    pub fn resolve(&self, wire_id: u32) -> Option<u32> {
        let id = if wire_id == PS_DIRECT_EXEC_ID {
            if self.last_prepare_id == 0 {
                return None;
            }
            self.last_prepare_id
        } else {
            wire_id
        };
        self.entries.contains_key(&id).then_some(id)
    }

    pub fn get(&self, id: u32) -> Option<&PsEntry> {
        self.entries.get(&id)
    }

    pub fn set_hints(&mut self, id: u32, hints: Vec<Hint>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.hints = hints;
        }
    }

    pub fn close(&mut self, id: u32) {
        self.entries.remove(&id);
        if self.last_prepare_id == id {
            self.last_prepare_id = 0;
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Statement id at offset 1 of a PS command payload.
pub fn extract_ps_id(packet: &BufChain) -> Option<u32> {
    let bytes = packet.copy_to_vec(1, 4);
    (bytes.len() == 4).then(|| LittleEndian::read_u32(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = PsRegistry::new();
        registry.register(7, 1, 2);
        assert_eq!(registry.resolve(7), Some(7));
        assert_eq!(registry.resolve(PS_DIRECT_EXEC_ID), Some(7));
        assert_eq!(registry.resolve(99), None);
    }

    #[test]
    fn test_direct_exec_without_prepare_is_none() {
        let registry = PsRegistry::new();
        assert_eq!(registry.resolve(PS_DIRECT_EXEC_ID), None);
    }

    #[test]
    fn test_close_erases_entry_and_last_id() {
        let mut registry = PsRegistry::new();
        registry.register(3, 0, 1);
        registry.close(3);
        assert!(!registry.contains(3));
        assert_eq!(registry.resolve(PS_DIRECT_EXEC_ID), None);
    }

    #[test]
    fn test_extract_ps_id_from_execute_payload() {
        let mut payload = vec![0x17u8];
        payload.extend_from_slice(&0x0000_0007u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&1u32.to_le_bytes());
        let chain = BufChain::from_vec(payload);
        assert_eq!(extract_ps_id(&chain), Some(7));

        let short = BufChain::from_vec(vec![0x17, 0x01]);
        assert_eq!(extract_ps_id(&short), None);
    }
}
