//! # Item Keys
//!
//! Identifiers and the ItemStack key that balances are tracked under.
//! Every id here is a classifier id (see [`crate::classifier`]); the
//! human-readable codes never reach the ledger tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Player identifier (opaque, issued by the identity service).
pub type UserId = u64;

/// Storage area identifier ("main", "factory", ...).
pub type SectionId = u32;

/// Item type identifier.
pub type ItemId = u32;

/// Collection variant identifier ("base", "winter", ...).
pub type CollectionId = u32;

/// Quality variant identifier.
pub type QualityId = u32;

/// Operation type identifier ("reservation", "adjust", ...).
pub type OperationTypeId = u32;

/// Ledger operation identifier (monotonic).
pub type OperationId = u64;

/// Recipe reference stored on ledger rows for audit.
pub type RecipeRef = u32;

/// Wall-clock instant, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Collection + quality pair distinguishing piles of the same item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemVariant {
    /// Collection variant.
    pub collection: CollectionId,
    /// Quality variant.
    pub quality: QualityId,
}

impl ItemVariant {
    /// Creates a variant.
    #[inline]
    #[must_use]
    pub const fn new(collection: CollectionId, quality: QualityId) -> Self {
        Self {
            collection,
            quality,
        }
    }
}

/// The unit of balance tracking: one pile of one item for one user in one area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    /// Owner.
    pub user: UserId,
    /// Storage area.
    pub section: SectionId,
    /// Item type.
    pub item: ItemId,
    /// Collection/quality variant.
    pub variant: ItemVariant,
}

impl ItemStack {
    /// Creates a stack key.
    #[inline]
    #[must_use]
    pub const fn new(user: UserId, section: SectionId, item: ItemId, variant: ItemVariant) -> Self {
        Self {
            user,
            section,
            item,
            variant,
        }
    }

    /// The same pile moved to another storage area.
    #[inline]
    #[must_use]
    pub const fn in_section(self, section: SectionId) -> Self {
        Self { section, ..self }
    }
}

/// A signed quantity change for one stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDelta {
    /// Target stack.
    pub stack: ItemStack,
    /// Signed change (negative = removal).
    pub delta: i64,
}

impl StackDelta {
    /// Creates a delta.
    #[inline]
    #[must_use]
    pub const fn new(stack: ItemStack, delta: i64) -> Self {
        Self { stack, delta }
    }
}

/// An item + variant + unsigned quantity, independent of owner and area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemAmount {
    /// Item type.
    pub item: ItemId,
    /// Variant.
    pub variant: ItemVariant,
    /// Quantity (always positive in a valid request).
    pub quantity: u64,
}

impl ItemAmount {
    /// Creates an amount.
    #[inline]
    #[must_use]
    pub const fn new(item: ItemId, variant: ItemVariant, quantity: u64) -> Self {
        Self {
            item,
            variant,
            quantity,
        }
    }
}

/// One shortfall reported by an affordability check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissingItem {
    /// Item type.
    pub item: ItemId,
    /// Variant.
    pub variant: ItemVariant,
    /// Quantity the request needed.
    pub required: u64,
    /// Quantity the stack holds.
    pub available: u64,
}

/// Merges amounts of the same item+variant, keeping first-seen order.
#[must_use]
pub fn merge_amounts(amounts: &[ItemAmount]) -> Vec<ItemAmount> {
    let mut merged: Vec<ItemAmount> = Vec::with_capacity(amounts.len());
    for amount in amounts {
        match merged
            .iter_mut()
            .find(|m| m.item == amount.item && m.variant == amount.variant)
        {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(amount.quantity),
            None => merged.push(*amount),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_section_keeps_pile() {
        let stack = ItemStack::new(7, 1, 100, ItemVariant::new(1, 1));
        let moved = stack.in_section(2);
        assert_eq!(moved.section, 2);
        assert_eq!(moved.item, 100);
        assert_eq!(moved.user, 7);
    }

    #[test]
    fn test_merge_amounts() {
        let base = ItemVariant::new(1, 1);
        let winter = ItemVariant::new(2, 1);
        let merged = merge_amounts(&[
            ItemAmount::new(10, base, 3),
            ItemAmount::new(11, base, 1),
            ItemAmount::new(10, base, 2),
            ItemAmount::new(10, winter, 4),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].quantity, 5);
        assert_eq!(merged[2].variant, winter);
    }
}
