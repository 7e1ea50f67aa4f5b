//! Storage tiers
//!
//! Tier 1 keeps a bounded number of entries in memory in recency order.
//! Tier 2 receives whatever Tier 1 evicts and survives restarts.

pub mod memory;
pub mod persistent;

pub use memory::{MemoryTier, SpilloverFn};
pub use persistent::PersistentTier;
