//! Deterministic per-user port blocks.
//!
//! Every sandbox publishes ten consecutive host ports. The block a user gets
//! is derived from their id so repeated sessions land on the same ports:
//!
//! - numeric ids: the last 8 digits modulo 100
//! - anything else: a SHA-256 of the id, modulo 100
//!
//! The slot is multiplied by 10 and added to [`PORT_FLOOR`]. When the slot is
//! held by someone else, the first free slot in `0..100` is used instead, so
//! at most 100 sandboxes can be live at once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// First port of the sandbox range.
pub const PORT_FLOOR: u16 = 5000;
/// Ports published per sandbox.
pub const PORTS_PER_BLOCK: u16 = 10;
/// Number of blocks in the range.
pub const PORT_SLOTS: u16 = 100;

/// Ten consecutive ports starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortBlock {
    base: u16,
}

impl PortBlock {
    fn for_slot(slot: u16) -> Self {
        Self {
            base: PORT_FLOOR + slot * PORTS_PER_BLOCK,
        }
    }

    /// First port of the block.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Last port of the block.
    pub fn last(&self) -> u16 {
        self.base + PORTS_PER_BLOCK - 1
    }

    /// All ports in the block, ascending.
    pub fn ports(&self) -> Vec<u16> {
        (self.base..=self.last()).collect()
    }
}

impl fmt::Display for PortBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

/// Slot a user id hashes to, before collision handling.
pub fn preferred_slot(user_id: &str) -> u16 {
    let is_numeric = !user_id.is_empty() && user_id.bytes().all(|b| b.is_ascii_digit());
    let value = if is_numeric {
        let tail = &user_id[user_id.len().saturating_sub(8)..];
        // At most 8 ASCII digits, always fits.
        tail.parse::<u64>().unwrap_or(0)
    } else {
        let digest = Sha256::digest(user_id.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    };
    (value % u64::from(PORT_SLOTS)) as u16
}

/// Block a user id hashes to, before collision handling.
pub fn preferred_block(user_id: &str) -> PortBlock {
    PortBlock::for_slot(preferred_slot(user_id))
}

/// Process-wide set of reserved port blocks, keyed by base port.
///
/// A base port is reserved from allocation until [`release`](Self::release),
/// and records which user owns it so that a repeat allocation for the same
/// user returns the same block.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a block for `user_id`.
    ///
    /// Returns `None` when all 100 slots are held by other users.
    pub fn allocate(&self, user_id: &str) -> Option<PortBlock> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((&base, _)) = reserved.iter().find(|(_, owner)| owner.as_str() == user_id) {
            return Some(PortBlock { base });
        }

        let preferred = preferred_block(user_id);
        if !reserved.contains_key(&preferred.base) {
            reserved.insert(preferred.base, user_id.to_string());
            return Some(preferred);
        }

        let fallback = (0..PORT_SLOTS)
            .map(PortBlock::for_slot)
            .find(|block| !reserved.contains_key(&block.base))?;
        tracing::info!(
            user_id,
            preferred = %preferred,
            fallback = %fallback,
            "Port collision, using fallback block"
        );
        reserved.insert(fallback.base, user_id.to_string());
        Some(fallback)
    }

    /// Give a block back. Releasing an unreserved block is a no-op.
    pub fn release(&self, block: PortBlock) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&block.base);
    }

    /// Whether the block starting at `base` is currently reserved.
    pub fn is_reserved(&self, base: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&base)
    }

    /// Number of reserved blocks.
    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_user_block() {
        let block = preferred_block("123456");
        assert_eq!(block.base(), 5560);
        assert_eq!(block.ports(), (5560..=5569).collect::<Vec<_>>());
        assert_eq!(block.to_string(), "5560-5569");
    }

    #[test]
    fn test_numeric_uses_last_eight_digits() {
        // 1234567890 -> 34567890 % 100 = 90
        assert_eq!(preferred_block("1234567890").base(), 5900);
        assert_eq!(preferred_block("1").base(), 5010);
        assert_eq!(preferred_block("100").base(), 5000);
    }

    #[test]
    fn test_blocks_stay_in_range() {
        for uid in ["100", "999", "123456789", "1", "alice", "bob-smith", "_x_"] {
            let block = preferred_block(uid);
            assert!((5000..6000).contains(&block.base()), "{uid}: {}", block.base());
            assert!(block.last() < 6000);
            assert_eq!(block.ports().len(), 10);
        }
    }

    #[test]
    fn test_string_hash_is_stable() {
        assert_eq!(preferred_slot("alice"), preferred_slot("alice"));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let allocator = PortAllocator::new();
        let first = allocator.allocate("123456").unwrap();
        let second = allocator.allocate("123456").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.base(), 5560);
        assert_eq!(allocator.reserved_count(), 1);
    }

    #[test]
    fn test_collision_uses_first_free_slot() {
        let allocator = PortAllocator::new();
        // Both hash to slot 56.
        let a = allocator.allocate("123456").unwrap();
        let b = allocator.allocate("999956").unwrap();
        assert_eq!(a.base(), 5560);
        assert_eq!(b.base(), 5000);
        // And the fallback is sticky for its owner.
        assert_eq!(allocator.allocate("999956").unwrap(), b);
    }

    #[test]
    fn test_hundred_and_first_user_fails() {
        let allocator = PortAllocator::new();
        let mut bases = std::collections::HashSet::new();
        for i in 0..100 {
            let block = allocator.allocate(&format!("{}", 1_000_000 + i * 7)).unwrap();
            assert!(bases.insert(block.base()), "duplicate block handed out");
        }
        assert_eq!(allocator.reserved_count(), 100);
        assert!(allocator.allocate("one-too-many").is_none());
    }

    #[test]
    fn test_release_frees_block() {
        let allocator = PortAllocator::new();
        let block = allocator.allocate("123456").unwrap();
        assert!(allocator.is_reserved(5560));
        allocator.release(block);
        assert!(!allocator.is_reserved(5560));
        allocator.release(block);
        assert_eq!(allocator.reserved_count(), 0);
    }
}
