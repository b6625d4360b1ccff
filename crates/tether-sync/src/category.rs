//! World-state categories and category bitmasks.
//!
//! Each category is an independent partition of world state with its own
//! checksum and resync path. Discriminants are wire values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One partition of world state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncCategory {
    /// Items lying loose in the world.
    LooseItems = 1,
    /// Static structures (buildings).
    Structures = 2,
    /// Mobile entities (agents, creatures).
    MobileEntities = 4,
    /// Conduit/flow networks.
    FlowNetworks = 8,
    /// Gas field, checked by sampling.
    Gases = 16,
    /// Liquid field, checked by sampling.
    Liquids = 32,
}

impl SyncCategory {
    /// Every category in bit order.
    pub const ALL: [SyncCategory; 6] = [
        Self::LooseItems,
        Self::Structures,
        Self::MobileEntities,
        Self::FlowNetworks,
        Self::Gases,
        Self::Liquids,
    ];

    /// The category's bit.
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// Continuous fields are checksummed by sampling rather than exhaustive scan.
    pub fn is_continuous(self) -> bool {
        matches!(self, Self::Gases | Self::Liquids)
    }

    /// Stable lower-case name, used in logs and file names.
    pub fn name(self) -> &'static str {
        match self {
            Self::LooseItems => "loose_items",
            Self::Structures => "structures",
            Self::MobileEntities => "mobile_entities",
            Self::FlowNetworks => "flow_networks",
            Self::Gases => "gases",
            Self::Liquids => "liquids",
        }
    }
}

impl fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of categories, carried on the wire as its bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryMask(u8);

impl CategoryMask {
    /// No categories.
    pub const NONE: CategoryMask = CategoryMask(0);
    /// Every category (63).
    pub const ALL: CategoryMask = CategoryMask(63);

    /// Build from raw bits, discarding bits that name no category.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bitmask.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if `category` is in the set.
    pub fn contains(self, category: SyncCategory) -> bool {
        self.0 & category.bit() != 0
    }

    /// Add `category` to the set.
    pub fn insert(&mut self, category: SyncCategory) {
        self.0 |= category.bit();
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Categories in `self` but not in `other`.
    pub fn without(self, other: CategoryMask) -> Self {
        Self(self.0 & !other.0)
    }

    /// Members in bit order.
    pub fn iter(self) -> impl Iterator<Item = SyncCategory> {
        SyncCategory::ALL
            .into_iter()
            .filter(move |c| self.contains(*c))
    }
}

impl From<SyncCategory> for CategoryMask {
    fn from(category: SyncCategory) -> Self {
        Self(category.bit())
    }
}

impl FromIterator<SyncCategory> for CategoryMask {
    fn from_iter<I: IntoIterator<Item = SyncCategory>>(iter: I) -> Self {
        let mut mask = Self::NONE;
        for category in iter {
            mask.insert(category);
        }
        mask
    }
}

impl fmt::Display for CategoryMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(SyncCategory::name).collect();
        f.write_str(&names.join("|"))
    }
}
