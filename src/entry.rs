// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::HostAddr;
use crate::arena::TableHandle;
use crate::types::Prot;
use bitflags::bitflags;

bitflags! {
    /// State bits of a segment-level leaf mapping.
    ///
    /// `INVALID` entries keep their `host` field so the reverse index can
    /// still be cleaned up, but the translation must not be used. `DIRTY`
    /// marks a mapping that was created or write-upgraded since the last
    /// dirty-log sync. `NOTIFY` requests an invalidation callback when the
    /// entry is exchanged.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SegFlags: u8 {
        const INVALID = 1 << 0;
        const PROTECT = 1 << 1;
        const LARGE = 1 << 2;
        const DIRTY = 1 << 3;
        const NOTIFY = 1 << 4;
    }
}

/// Life-cycle of a link to a lower-level table. A `Pending` link has its
/// table installed but not yet exposed to translation; shadow construction
/// keeps a link pending until the source table is write-protected in the
/// parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Established,
}

/// A non-leaf entry pointing to a table one level down, owned by the same
/// address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLink {
    pub table: TableHandle,
    pub state: LinkState,
    /// Protect bit carried over from the source table descriptor.
    pub protect: bool,
    /// The subtree represents a contiguous range, not a real nested table.
    pub fake: bool,
}

impl TableLink {
    /// Expose the link to translation. Only legal transition out of
    /// `Pending`; establishing twice is a no-op.
    pub fn establish(&mut self) {
        self.state = LinkState::Established;
    }

    pub fn is_established(&self) -> bool {
        self.state == LinkState::Established
    }
}

/// Segment-level leaf: one guest segment mapped to one host segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLeaf {
    pub host: HostAddr,
    pub flags: SegFlags,
}

/// Entry of a region or segment table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrstEntry {
    #[default]
    Empty,
    Table(TableLink),
    Segment(SegmentLeaf),
}

impl CrstEntry {
    pub fn is_empty(&self) -> bool {
        matches!(self, CrstEntry::Empty)
    }
}

/// Entry of a leaf page table (shadow address spaces only).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageEntry {
    #[default]
    Empty,
    Mapped { frame: u64, prot: Prot },
}

/// Copy of a table entry as returned by [`crate::gmap::Gmap::probe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrySnapshot {
    Crst(CrstEntry),
    Page(PageEntry),
}
