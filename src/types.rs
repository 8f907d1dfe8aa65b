// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use bitflags::bitflags;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Entries in a leaf page table. Together with [`PAGE_SIZE`] this fixes the
/// segment (large page) granule at 1 MiB.
pub const PTES_PER_TABLE: usize = 256;
pub const SEGMENT_SHIFT: u32 = 20;
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;

/// Entries in a region or segment table (11 index bits per level).
pub const CRST_ENTRIES: usize = 2048;
pub const CRST_INDEX_BITS: u32 = 11;

pub const REGION3_SHIFT: u32 = 31;
pub const REGION2_SHIFT: u32 = 42;
pub const REGION1_SHIFT: u32 = 53;

/// Footprint of a nested region/segment table in guest memory. This is the
/// range that gets write-protected when such a table is shadowed.
pub const CRST_TABLE_SIZE: u64 = (CRST_ENTRIES * 8) as u64;

/// Access rights requested for a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prot {
    None,
    Read,
    Write,
}

bitflags! {
    /// Notification requests attached to a protection change. `MPROT`
    /// requests an invalidation callback when the entry is modified,
    /// `SHADOW` requests the shadow-table cascade.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NotifyBits: u8 {
        const MPROT = 1 << 0;
        const SHADOW = 1 << 1;
    }
}

/// Scope of a leaf translation flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushScope {
    Local,
    Global,
}

/// Type of a region/segment table, which doubles as the depth selector of an
/// address space: a segment-table root covers 2 GiB, each region level
/// multiplies that by the table fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableKind {
    Segment,
    Region3,
    Region2,
    Region1,
}

impl TableKind {
    /// Walk level of entries in this table: 1 for segment entries up to 4
    /// for region-1 entries. Level 0 is a leaf page-table entry.
    pub fn level(self) -> u8 {
        match self {
            TableKind::Segment => 1,
            TableKind::Region3 => 2,
            TableKind::Region2 => 3,
            TableKind::Region1 => 4,
        }
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            1 => TableKind::Segment,
            2 => TableKind::Region3,
            3 => TableKind::Region2,
            4 => TableKind::Region1,
            _ => panic!("no table kind for walk level {}", level),
        }
    }

    pub fn shift(self) -> u32 {
        match self {
            TableKind::Segment => SEGMENT_SHIFT,
            TableKind::Region3 => REGION3_SHIFT,
            TableKind::Region2 => REGION2_SHIFT,
            TableKind::Region1 => REGION1_SHIFT,
        }
    }

    /// Guest address range covered by a single entry of this table.
    pub fn entry_span(self) -> u64 {
        1u64 << self.shift()
    }

    /// Exclusive upper bound of the address range a table of this kind can
    /// map when used as the root.
    pub fn max_addr(self) -> u64 {
        match self {
            TableKind::Region1 => u64::MAX,
            kind => kind.entry_span() << CRST_INDEX_BITS,
        }
    }

    /// Index of the entry covering `addr_bits` within this table.
    pub fn index(self, addr_bits: u64) -> usize {
        ((addr_bits >> self.shift()) & (CRST_ENTRIES as u64 - 1)) as usize
    }

    /// Kind of the table a non-leaf entry at this level points to. Segment
    /// entries point to leaf page tables instead.
    pub fn child(self) -> Option<TableKind> {
        match self {
            TableKind::Segment => None,
            TableKind::Region3 => Some(TableKind::Segment),
            TableKind::Region2 => Some(TableKind::Region3),
            TableKind::Region1 => Some(TableKind::Region2),
        }
    }

    /// Pick the smallest table kind able to map addresses up to `limit`,
    /// returning it together with the normalized inclusive end of the
    /// resulting address space.
    pub fn for_limit(limit: u64) -> (TableKind, u64) {
        if limit < TableKind::Segment.max_addr() {
            (TableKind::Segment, TableKind::Segment.max_addr() - 1)
        } else if limit < TableKind::Region3.max_addr() {
            (TableKind::Region3, TableKind::Region3.max_addr() - 1)
        } else if limit < TableKind::Region2.max_addr() {
            (TableKind::Region2, TableKind::Region2.max_addr() - 1)
        } else {
            (TableKind::Region1, u64::MAX)
        }
    }
}
