//! Action identifier generation.
//!
//! Generators are injected wherever an `ActionID` may need to be assigned,
//! so there is no process-wide random state to share or lock.

use rand::RngCore;

/// Source of unique action identifiers.
pub trait ActionIdGenerator: Send + Sync {
    /// Returns a fresh identifier. Must not return an empty string.
    fn generate(&self) -> String;
}

/// Random UUIDv4 identifiers. The default generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidActionIds;

impl ActionIdGenerator for UuidActionIds {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Short random hexadecimal identifiers of a fixed length.
#[derive(Debug, Clone, Copy)]
pub struct HexActionIds {
    length: usize,
}

impl HexActionIds {
    /// Creates a generator producing `length` hex characters (at least one).
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }
}

impl Default for HexActionIds {
    fn default() -> Self {
        Self::new(16)
    }
}

impl ActionIdGenerator for HexActionIds {
    fn generate(&self) -> String {
        let mut bytes = vec![0u8; self.length.div_ceil(2)];
        rand::rng().fill_bytes(&mut bytes);
        let mut id = hex::encode(bytes);
        id.truncate(self.length);
        id
    }
}
